use std::collections::BTreeMap;

use tracing::info;
use uuid::Uuid;

use super::Service;
use crate::authz::{DomainKind, RoleDefinition, CANVAS_VIEWER};
use crate::error::{Error, Result};

impl Service {
    /// Make sure the domain exists before touching its rules.
    async fn domain(&self, kind: DomainKind, domain_id: Uuid) -> Result<()> {
        match kind {
            DomainKind::Org => self.describe_organization(domain_id).await.map(|_| ()),
            DomainKind::Canvas => self.canvas(domain_id).await.map(|_| ()),
        }
    }

    pub async fn assign_role(&self, kind: DomainKind, domain_id: Uuid, user_id: &str, role: &str) -> Result<()> {
        if user_id.trim().is_empty() {
            return Err(Error::Validation("user id is required".into()));
        }
        self.domain(kind, domain_id).await?;
        self.enforcer
            .assign_role(user_id, role, &domain_id.to_string(), kind)
            .await?;
        info!(domain = kind.as_str(), %domain_id, user_id, role, "role assigned");
        Ok(())
    }

    pub async fn remove_role(&self, kind: DomainKind, domain_id: Uuid, user_id: &str, role: &str) -> Result<()> {
        self.domain(kind, domain_id).await?;
        self.enforcer
            .remove_role(user_id, role, &domain_id.to_string(), kind)
            .await?;
        info!(domain = kind.as_str(), %domain_id, user_id, role, "role removed");
        Ok(())
    }

    pub async fn list_roles(&self, kind: DomainKind, domain_id: Uuid) -> Result<Vec<RoleDefinition>> {
        self.domain(kind, domain_id).await?;
        Ok(self.enforcer.role_definitions(&domain_id.to_string(), kind))
    }

    pub async fn describe_role(&self, kind: DomainKind, domain_id: Uuid, role: &str) -> Result<RoleDefinition> {
        self.domain(kind, domain_id).await?;
        self.enforcer.role_definition(role, &domain_id.to_string(), kind)
    }

    /// Users holding a role directly or through a group, keyed by user.
    pub async fn list_members(&self, kind: DomainKind, domain_id: Uuid) -> Result<BTreeMap<String, Vec<String>>> {
        self.domain(kind, domain_id).await?;
        let domain = domain_id.to_string();
        let mut members: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for role in kind.roles() {
            for user in self.enforcer.users_for_role(role, &domain, kind)? {
                members.entry(user).or_default().push(role.to_string());
            }
        }
        Ok(members)
    }

    /// Add a user to a canvas as a viewer.
    pub async fn add_canvas_member(&self, canvas_id: Uuid, user_id: &str) -> Result<()> {
        self.assign_role(DomainKind::Canvas, canvas_id, user_id, CANVAS_VIEWER)
            .await
    }

    /// Remove every canvas role the user holds directly.
    pub async fn remove_canvas_member(&self, canvas_id: Uuid, user_id: &str) -> Result<()> {
        self.canvas(canvas_id).await?;
        let domain = canvas_id.to_string();
        let mut removed = false;
        for role in DomainKind::Canvas.roles() {
            if self
                .enforcer
                .users_for_role(role, &domain, DomainKind::Canvas)?
                .iter()
                .any(|u| u == user_id)
            {
                self.enforcer
                    .remove_role(user_id, role, &domain, DomainKind::Canvas)
                    .await?;
                removed = true;
            }
        }
        if !removed {
            return Err(Error::not_found("member"));
        }
        info!(%canvas_id, user_id, "canvas member removed");
        Ok(())
    }

    pub async fn create_group(&self, org_id: Uuid, group: &str, role: &str) -> Result<()> {
        self.describe_organization(org_id).await?;
        self.enforcer.create_group(&org_id.to_string(), group, role).await
    }

    pub async fn list_groups(&self, org_id: Uuid) -> Result<Vec<String>> {
        self.describe_organization(org_id).await?;
        Ok(self.enforcer.groups(&org_id.to_string()))
    }

    pub async fn group_users(&self, org_id: Uuid, group: &str) -> Result<Vec<String>> {
        self.describe_organization(org_id).await?;
        self.enforcer.group_users(&org_id.to_string(), group)
    }

    pub async fn add_user_to_group(&self, org_id: Uuid, group: &str, user_id: &str) -> Result<()> {
        self.describe_organization(org_id).await?;
        self.enforcer
            .add_user_to_group(&org_id.to_string(), user_id, group)
            .await
    }

    pub async fn remove_user_from_group(&self, org_id: Uuid, group: &str, user_id: &str) -> Result<()> {
        self.describe_organization(org_id).await?;
        self.enforcer
            .remove_user_from_group(&org_id.to_string(), user_id, group)
            .await
    }
}
