//! Request-shape authorization.
//!
//! RPC-style calls are looked up by method name in [`METHOD_RULES`]; HTTP
//! calls are matched by path. Either way the result is a
//! `(user, domain, resource, action)` request for the [`Enforcer`]. Denials
//! and unauthenticated calls surface as `NotFound`.

use std::sync::{Arc, LazyLock};

use regex::Regex;
use tracing::debug;
use uuid::Uuid;

use super::{DomainKind, Enforcer};
use crate::error::{Error, Result};
use crate::store::Store;

/// Permission required by one RPC method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodRule {
    pub method: &'static str,
    pub resource: &'static str,
    pub action: &'static str,
    pub domain: DomainKind,
}

const fn rule(method: &'static str, resource: &'static str, action: &'static str, domain: DomainKind) -> MethodRule {
    MethodRule {
        method,
        resource,
        action,
        domain,
    }
}

pub const METHOD_RULES: &[MethodRule] = &[
    rule("CreateCanvas", "canvas", "create", DomainKind::Org),
    rule("DescribeCanvas", "canvas", "read", DomainKind::Org),
    rule("ListCanvases", "canvas", "read", DomainKind::Org),
    rule("CreateEventSource", "eventsource", "create", DomainKind::Canvas),
    rule("DescribeEventSource", "eventsource", "read", DomainKind::Canvas),
    rule("ListEventSources", "eventsource", "read", DomainKind::Canvas),
    rule("CreateStage", "stage", "create", DomainKind::Canvas),
    rule("DescribeStage", "stage", "read", DomainKind::Canvas),
    rule("UpdateStage", "stage", "update", DomainKind::Canvas),
    rule("ListStages", "stage", "read", DomainKind::Canvas),
    rule("ListStageEvents", "stageevent", "read", DomainKind::Canvas),
    rule("ApproveStageEvent", "stageevent", "approve", DomainKind::Canvas),
    rule("CancelStageEvent", "stage", "update", DomainKind::Canvas),
    rule("ListExecutions", "stage", "read", DomainKind::Canvas),
    rule("CancelExecution", "stage", "update", DomainKind::Canvas),
    rule("ListTags", "stage", "read", DomainKind::Canvas),
    rule("UpdateTagState", "stage", "update", DomainKind::Canvas),
    rule("CreateSecret", "secret", "create", DomainKind::Canvas),
    rule("DescribeSecret", "secret", "read", DomainKind::Canvas),
    rule("ListSecrets", "secret", "read", DomainKind::Canvas),
    rule("UpdateSecret", "secret", "update", DomainKind::Canvas),
    rule("DeleteSecret", "secret", "delete", DomainKind::Canvas),
    rule("ListCanvasMembers", "member", "read", DomainKind::Canvas),
    rule("AddCanvasMember", "member", "invite", DomainKind::Canvas),
    rule("RemoveCanvasMember", "member", "remove", DomainKind::Canvas),
    rule("DescribeOrganization", "org", "read", DomainKind::Org),
    rule("UpdateOrganization", "org", "update", DomainKind::Org),
    rule("DeleteOrganization", "org", "delete", DomainKind::Org),
    rule("ListRoles", "role", "read", DomainKind::Org),
    rule("DescribeRole", "role", "read", DomainKind::Org),
    rule("AssignRole", "role", "assign", DomainKind::Org),
    rule("RemoveRole", "role", "remove", DomainKind::Org),
    rule("ListUsers", "user", "read", DomainKind::Org),
    rule("CreateGroup", "group", "create", DomainKind::Org),
    rule("ListGroups", "group", "read", DomainKind::Org),
    rule("DescribeGroup", "group", "read", DomainKind::Org),
    rule("AddUserToGroup", "group", "update", DomainKind::Org),
    rule("RemoveUserFromGroup", "group", "update", DomainKind::Org),
];

pub fn method_rule(method: &str) -> Option<&'static MethodRule> {
    METHOD_RULES.iter().find(|r| r.method == method)
}

/// Conventional fields a request may carry to name its domain.
pub trait DomainFields {
    fn organization_id(&self) -> Option<&str> {
        None
    }

    fn canvas_id(&self) -> Option<&str> {
        None
    }

    /// Either a canvas id or a canvas name within [`organization_id`](Self::organization_id).
    fn canvas_id_or_name(&self) -> Option<&str> {
        None
    }
}

/// Domain fields supplied directly, for callers without a typed request.
#[derive(Debug, Clone, Default)]
pub struct RequestDomain {
    pub organization_id: Option<String>,
    pub canvas_id: Option<String>,
    pub canvas_id_or_name: Option<String>,
}

impl DomainFields for RequestDomain {
    fn organization_id(&self) -> Option<&str> {
        self.organization_id.as_deref()
    }

    fn canvas_id(&self) -> Option<&str> {
        self.canvas_id.as_deref()
    }

    fn canvas_id_or_name(&self) -> Option<&str> {
        self.canvas_id_or_name.as_deref()
    }
}

/// Where an HTTP rule finds its domain id.
#[derive(Debug, Clone, Copy)]
enum DomainSource {
    /// Named capture in the path.
    Path(&'static str),
    /// The `x-organization-id` header.
    OrgHeader,
}

#[derive(Debug, Clone, Copy)]
enum Actions {
    /// Derived from the HTTP method.
    Infer,
    Fixed(&'static str),
}

struct HttpRule {
    pattern: Regex,
    kind: DomainKind,
    source: DomainSource,
    resource: &'static str,
    actions: Actions,
}

/// Any path segment; ids are parsed and normalized after matching.
const ID: &str = "[^/]+";

fn http_rule(
    pattern: &str,
    kind: DomainKind,
    source: DomainSource,
    resource: &'static str,
    actions: Actions,
) -> HttpRule {
    let pattern = format!("^/api/v1{}/?$", pattern.replace("{id}", ID));
    HttpRule {
        pattern: Regex::new(&pattern).expect("invalid authorization route pattern"),
        kind,
        source,
        resource,
        actions,
    }
}

/// First match wins; more specific paths come first.
static HTTP_RULES: LazyLock<Vec<HttpRule>> = LazyLock::new(|| {
    use Actions::*;
    use DomainKind::*;
    use DomainSource::*;

    let canvas = "/canvases/(?P<canvas>{id})";
    let stage = "/canvases/(?P<canvas>{id})/stages/[^/]+";
    let org = "/organizations/(?P<org>{id})";

    vec![
        http_rule(&format!("{stage}/events/[^/]+/approve"), Canvas, Path("canvas"), "stageevent", Fixed("approve")),
        http_rule(&format!("{stage}/events/[^/]+/cancel"), Canvas, Path("canvas"), "stage", Fixed("update")),
        http_rule(&format!("{stage}/events(/[^/]+)?"), Canvas, Path("canvas"), "stageevent", Fixed("read")),
        http_rule(&format!("{stage}/executions/[^/]+/cancel"), Canvas, Path("canvas"), "stage", Fixed("update")),
        http_rule(&format!("{stage}/executions(/[^/]+)?"), Canvas, Path("canvas"), "stage", Fixed("read")),
        http_rule(&format!("{canvas}/stages(/[^/]+)?"), Canvas, Path("canvas"), "stage", Infer),
        http_rule(&format!("{canvas}/event-sources(/[^/]+)?"), Canvas, Path("canvas"), "eventsource", Infer),
        http_rule(&format!("{canvas}/secrets(/[^/]+)?"), Canvas, Path("canvas"), "secret", Infer),
        http_rule(&format!("{canvas}/tags"), Canvas, Path("canvas"), "stage", Infer),
        http_rule(&format!("{canvas}/roles"), Canvas, Path("canvas"), "member", Fixed("read")),
        http_rule(&format!("{canvas}/members"), Canvas, Path("canvas"), "member", Infer),
        http_rule(&format!("{canvas}/members/[^/]+"), Canvas, Path("canvas"), "member", Infer),
        http_rule(canvas, Org, OrgHeader, "canvas", Infer),
        http_rule("/canvases", Org, OrgHeader, "canvas", Infer),
        http_rule(&format!("{org}/roles/assign"), Org, Path("org"), "role", Fixed("assign")),
        http_rule(&format!("{org}/roles/remove"), Org, Path("org"), "role", Fixed("remove")),
        http_rule(&format!("{org}/roles(/[^/]+)?"), Org, Path("org"), "role", Fixed("read")),
        http_rule(&format!("{org}/groups/[^/]+/users(/[^/]+)?"), Org, Path("org"), "group", Infer),
        http_rule(&format!("{org}/groups(/[^/]+)?"), Org, Path("org"), "group", Infer),
        http_rule(&format!("{org}/users"), Org, Path("org"), "user", Fixed("read")),
        http_rule(org, Org, Path("org"), "org", Infer),
    ]
});

/// Paths any signed-in user may call.
static SESSION_ONLY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("^/api/v1/organizations/?$").expect("invalid session route pattern"));

/// Ids in paths and headers come in several textual forms; grants are keyed
/// on the hyphenated one.
fn normalize_id(raw: &str) -> Option<String> {
    Uuid::parse_str(raw).ok().map(|id| id.to_string())
}

/// Action implied by an HTTP method.
pub fn action_for_method(method: &str) -> Option<&'static str> {
    match method {
        "GET" | "HEAD" => Some("read"),
        "POST" => Some("create"),
        "PUT" | "PATCH" => Some("update"),
        "DELETE" => Some("delete"),
        _ => None,
    }
}

/// A resolved authorization request for an HTTP call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpPermission {
    pub kind: DomainKind,
    pub domain_id: Option<String>,
    pub resource: &'static str,
    pub action: &'static str,
}

/// Map an HTTP call to the permission it needs. `None` for paths outside the
/// authorization table. A domain id that is not a UUID leaves `domain_id`
/// empty.
pub fn http_permission(method: &str, path: &str, org_header: Option<&str>) -> Option<HttpPermission> {
    let rule = HTTP_RULES.iter().find(|r| r.pattern.is_match(path))?;
    let captures = rule.pattern.captures(path)?;

    let mut action = match rule.actions {
        Actions::Fixed(action) => action,
        Actions::Infer => action_for_method(method)?,
    };
    // Member routes speak of invitations and removals.
    if rule.resource == "member" {
        action = match action {
            "create" => "invite",
            "delete" => "remove",
            other => other,
        };
    }
    // Membership changes are updates of the group.
    if rule.resource == "group" && path.contains("/users") && action != "read" {
        action = "update";
    }

    let domain_id = match rule.source {
        DomainSource::Path(name) => captures.name(name).and_then(|m| normalize_id(m.as_str())),
        DomainSource::OrgHeader => org_header.and_then(normalize_id),
    };

    Some(HttpPermission {
        kind: rule.kind,
        domain_id,
        resource: rule.resource,
        action,
    })
}

/// Authorizes requests against the [`Enforcer`].
#[derive(Clone)]
pub struct Interceptor {
    enforcer: Arc<Enforcer>,
    store: Arc<dyn Store>,
}

impl Interceptor {
    pub fn new(enforcer: Arc<Enforcer>, store: Arc<dyn Store>) -> Self {
        Self { enforcer, store }
    }

    /// Authorize an RPC-style call. Methods outside [`METHOD_RULES`] pass.
    pub async fn authorize(&self, method: &str, user_id: Option<&str>, request: &dyn DomainFields) -> Result<()> {
        let Some(rule) = method_rule(method) else {
            return Ok(());
        };
        let user_id = user_id.ok_or_else(denied)?;
        let domain_id = self.domain_id(rule.domain, request).await?;
        self.decide(user_id, rule.domain, &domain_id, rule.resource, rule.action)
    }

    /// Authorize an authenticated HTTP call by path. Paths outside the table
    /// are denied unless they only need a session.
    pub fn authorize_http(&self, method: &str, path: &str, user_id: Option<&str>, org_header: Option<&str>) -> Result<()> {
        let user_id = user_id.ok_or_else(denied)?;
        if SESSION_ONLY.is_match(path) {
            return Ok(());
        }
        let Some(permission) = http_permission(method, path, org_header) else {
            debug!(user_id, method, path, "no authorization rule for path");
            return Err(denied());
        };
        let domain_id = permission.domain_id.ok_or_else(denied)?;
        self.decide(user_id, permission.kind, &domain_id, permission.resource, permission.action)
    }

    fn decide(&self, user_id: &str, kind: DomainKind, domain_id: &str, resource: &str, action: &str) -> Result<()> {
        self.enforcer
            .require(user_id, kind, domain_id, resource, action)
            .map_err(|e| {
                debug!(user_id, domain = %kind.domain(domain_id), resource, action, "request denied");
                e.into_public()
            })
    }

    async fn domain_id(&self, kind: DomainKind, request: &dyn DomainFields) -> Result<String> {
        match kind {
            DomainKind::Org => request
                .organization_id()
                .ok_or_else(|| Error::Validation("organization_id is required".into()))
                .and_then(|id| normalize_id(id).ok_or_else(denied)),
            DomainKind::Canvas => {
                if let Some(id) = request.canvas_id() {
                    return normalize_id(id).ok_or_else(denied);
                }
                let id_or_name = request
                    .canvas_id_or_name()
                    .ok_or_else(|| Error::Validation("canvas_id is required".into()))?;
                if let Some(id) = normalize_id(id_or_name) {
                    return Ok(id);
                }
                let org_id = request.organization_id().ok_or_else(denied)?;
                let org_id = Uuid::parse_str(org_id).map_err(|_| denied())?;
                self.store
                    .find_canvas_by_name(org_id, id_or_name)
                    .await?
                    .map(|canvas| canvas.id.to_string())
                    .ok_or_else(denied)
            }
        }
    }
}

fn denied() -> Error {
    Error::NotFound("not found".into())
}

#[cfg(test)]
mod tests {
    use super::*;

    const C: &str = "7f1c0d3e-0000-4000-8000-000000000001";
    const O: &str = "7f1c0d3e-0000-4000-8000-000000000002";

    fn permission(method: &str, path: &str) -> HttpPermission {
        http_permission(method, path, Some(O)).unwrap()
    }

    #[test]
    fn infers_action_from_method() {
        let p = permission("POST", &format!("/api/v1/canvases/{C}/stages"));
        assert_eq!((p.kind, p.resource, p.action), (DomainKind::Canvas, "stage", "create"));
        assert_eq!(p.domain_id.as_deref(), Some(C));

        let p = permission("PATCH", &format!("/api/v1/canvases/{C}/stages/s1"));
        assert_eq!(p.action, "update");

        let p = permission("GET", &format!("/api/v1/canvases/{C}/event-sources"));
        assert_eq!((p.resource, p.action), ("eventsource", "read"));
    }

    #[test]
    fn approve_suffix_maps_to_approve() {
        let p = permission("POST", &format!("/api/v1/canvases/{C}/stages/s1/events/e1/approve"));
        assert_eq!((p.resource, p.action), ("stageevent", "approve"));
    }

    #[test]
    fn canvas_collection_uses_organization_header() {
        let p = permission("POST", "/api/v1/canvases");
        assert_eq!((p.kind, p.resource, p.action), (DomainKind::Org, "canvas", "create"));
        assert_eq!(p.domain_id.as_deref(), Some(O));

        let missing = http_permission("GET", "/api/v1/canvases", None).unwrap();
        assert_eq!(missing.domain_id, None);
    }

    #[test]
    fn member_routes_use_member_actions() {
        let p = permission("POST", &format!("/api/v1/canvases/{C}/members"));
        assert_eq!(p.action, "invite");
        let p = permission("DELETE", &format!("/api/v1/canvases/{C}/members/u1"));
        assert_eq!(p.action, "remove");
    }

    #[test]
    fn organization_routes() {
        let p = permission("POST", &format!("/api/v1/organizations/{O}/roles/assign"));
        assert_eq!((p.kind, p.resource, p.action), (DomainKind::Org, "role", "assign"));
        let p = permission("DELETE", &format!("/api/v1/organizations/{O}"));
        assert_eq!((p.resource, p.action), ("org", "delete"));
        let p = permission("POST", &format!("/api/v1/organizations/{O}/groups/ops/users"));
        assert_eq!((p.resource, p.action), ("group", "update"));
    }

    #[test]
    fn ids_are_normalized_before_checking() {
        let id = Uuid::parse_str(C).unwrap();
        for form in [id.simple().to_string(), id.braced().to_string(), id.urn().to_string(), C.to_uppercase()] {
            let p = permission("POST", &format!("/api/v1/canvases/{form}/stages"));
            assert_eq!(p.domain_id.as_deref(), Some(C), "{form}");
        }

        let p = permission("GET", "/api/v1/canvases/delivery/stages");
        assert_eq!(p.domain_id, None);

        let simple_header = Uuid::parse_str(O).unwrap().simple().to_string();
        let p = http_permission("POST", "/api/v1/canvases", Some(&simple_header)).unwrap();
        assert_eq!(p.domain_id.as_deref(), Some(O));
    }

    #[test]
    fn unknown_paths_are_not_in_the_table() {
        assert!(http_permission("POST", "/api/v1/sources/x/webhook", None).is_none());
        assert!(http_permission("POST", "/api/v1/organizations", None).is_none());
    }

    #[test]
    fn method_table_lookup() {
        let rule = method_rule("ApproveStageEvent").unwrap();
        assert_eq!((rule.resource, rule.action, rule.domain), ("stageevent", "approve", DomainKind::Canvas));
        assert!(method_rule("Health").is_none());
    }
}
