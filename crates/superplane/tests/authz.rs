//! Scoped access control as seen through the service and interceptor.

use anyhow::Result;

use superplane::authz::interceptor::RequestDomain;
use superplane::authz::{CANVAS_ADMIN, CANVAS_VIEWER, ORG_ADMIN, ORG_VIEWER};
use superplane::{DomainKind, Error};
use superplane_testing::{Harness, OWNER};

fn canvas_domain(canvas_id: uuid::Uuid) -> RequestDomain {
    RequestDomain {
        canvas_id: Some(canvas_id.to_string()),
        ..Default::default()
    }
}

fn org_domain(org_id: uuid::Uuid) -> RequestDomain {
    RequestDomain {
        organization_id: Some(org_id.to_string()),
        ..Default::default()
    }
}

#[tokio::test]
async fn strangers_are_denied_everything() -> Result<()> {
    let harness = Harness::new().await?;
    let canvas = harness.canvas().await?;
    let enforcer = harness.core.service.enforcer();
    let canvas_id = canvas.id.to_string();
    let org_id = canvas.organization_id.to_string();

    for (resource, action) in [("stage", "read"), ("secret", "read"), ("member", "remove")] {
        assert!(!enforcer.check_canvas("stranger", &canvas_id, resource, action));
        assert!(enforcer.check_canvas(OWNER, &canvas_id, resource, action));
    }
    assert!(!enforcer.check_org("stranger", &org_id, "canvas", "read"));

    let err = harness
        .core
        .interceptor
        .authorize("ListStages", Some("stranger"), &canvas_domain(canvas.id))
        .await
        .unwrap_err();
    // Denials never reveal that the resource exists.
    assert!(matches!(err, Error::NotFound(_)));

    let anonymous = harness
        .core
        .interceptor
        .authorize("ListStages", None, &canvas_domain(canvas.id))
        .await;
    assert!(anonymous.is_err());
    Ok(())
}

#[tokio::test]
async fn canvas_roles_nest() -> Result<()> {
    let harness = Harness::new().await?;
    let canvas = harness.canvas().await?;
    let service = &harness.core.service;
    let interceptor = &harness.core.interceptor;
    let domain = canvas_domain(canvas.id);

    service.add_canvas_member(canvas.id, "viewer").await?;
    service
        .assign_role(DomainKind::Canvas, canvas.id, "admin", CANVAS_ADMIN)
        .await?;

    interceptor.authorize("ListStages", Some("viewer"), &domain).await?;
    assert!(interceptor
        .authorize("CreateStage", Some("viewer"), &domain)
        .await
        .is_err());

    interceptor.authorize("ListStages", Some("admin"), &domain).await?;
    interceptor.authorize("CreateStage", Some("admin"), &domain).await?;
    interceptor.authorize("ApproveStageEvent", Some("admin"), &domain).await?;
    assert!(interceptor
        .authorize("RemoveCanvasMember", Some("admin"), &domain)
        .await
        .is_err());

    interceptor
        .authorize("RemoveCanvasMember", Some(OWNER), &domain)
        .await?;

    let members = service.list_members(DomainKind::Canvas, canvas.id).await?;
    assert_eq!(members.get("viewer"), Some(&vec![CANVAS_VIEWER.to_string()]));
    assert_eq!(members.get("admin"), Some(&vec![CANVAS_ADMIN.to_string()]));
    Ok(())
}

#[tokio::test]
async fn org_admin_manages_canvases_but_not_the_org() -> Result<()> {
    let harness = Harness::new().await?;
    let canvas = harness.canvas().await?;
    let org_id = canvas.organization_id;
    let service = &harness.core.service;
    let interceptor = &harness.core.interceptor;
    let domain = org_domain(org_id);

    service
        .assign_role(DomainKind::Org, org_id, "admin", ORG_ADMIN)
        .await?;

    interceptor.authorize("CreateCanvas", Some("admin"), &domain).await?;
    interceptor.authorize("DescribeOrganization", Some("admin"), &domain).await?;
    for method in ["UpdateOrganization", "DeleteOrganization"] {
        assert!(interceptor.authorize(method, Some("admin"), &domain).await.is_err());
        interceptor.authorize(method, Some(OWNER), &domain).await?;
    }

    // Org-wide canvas read covers canvases the user was never added to.
    let listed = service.list_canvases(org_id, "admin").await?;
    assert_eq!(listed.len(), 1);
    assert!(service.list_canvases(org_id, "stranger").await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn canvas_members_only_list_their_canvases() -> Result<()> {
    let harness = Harness::new().await?;
    let first = harness.canvas().await?;
    let service = &harness.core.service;
    let second = service
        .create_canvas(first.organization_id, "staging", OWNER)
        .await?;

    service.add_canvas_member(second.id, "dev").await?;
    let listed = service.list_canvases(first.organization_id, "dev").await?;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, second.id);

    service.remove_canvas_member(second.id, "dev").await?;
    assert!(service
        .list_canvases(first.organization_id, "dev")
        .await?
        .is_empty());
    let err = service
        .remove_canvas_member(second.id, "dev")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
    Ok(())
}

#[tokio::test]
async fn group_members_inherit_the_group_role() -> Result<()> {
    let harness = Harness::new().await?;
    let canvas = harness.canvas().await?;
    let org_id = canvas.organization_id;
    let service = &harness.core.service;
    let enforcer = service.enforcer();
    let org = org_id.to_string();

    service.create_group(org_id, "readers", ORG_VIEWER).await?;
    service.add_user_to_group(org_id, "readers", "carol").await?;

    assert_eq!(service.list_groups(org_id).await?, vec!["readers".to_string()]);
    assert_eq!(
        service.group_users(org_id, "readers").await?,
        vec!["carol".to_string()]
    );
    assert!(enforcer.check_org("carol", &org, "canvas", "read"));
    assert!(!enforcer.check_org("carol", &org, "canvas", "create"));

    service
        .remove_user_from_group(org_id, "readers", "carol")
        .await?;
    assert!(!enforcer.check_org("carol", &org, "canvas", "read"));
    Ok(())
}

#[tokio::test]
async fn roles_from_the_wrong_domain_are_rejected() -> Result<()> {
    let harness = Harness::new().await?;
    let canvas = harness.canvas().await?;

    let err = harness
        .core
        .service
        .assign_role(DomainKind::Canvas, canvas.id, "dev", ORG_ADMIN)
        .await
        .unwrap_err();
    assert!(!matches!(err, Error::Fatal(_)));
    assert!(!harness
        .core
        .service
        .enforcer()
        .check_canvas("dev", &canvas.id.to_string(), "stage", "read"));
    Ok(())
}
