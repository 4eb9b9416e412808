use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const ORG_OWNER: &str = "org_owner";
pub const ORG_ADMIN: &str = "org_admin";
pub const ORG_VIEWER: &str = "org_viewer";
pub const CANVAS_OWNER: &str = "canvas_owner";
pub const CANVAS_ADMIN: &str = "canvas_admin";
pub const CANVAS_VIEWER: &str = "canvas_viewer";

pub(crate) const USER_PREFIX: &str = "user:";
pub(crate) const ROLE_PREFIX: &str = "role:";
pub(crate) const GROUP_PREFIX: &str = "group:";

/// Scope kind of an authorization decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DomainKind {
    Org,
    Canvas,
}

impl DomainKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DomainKind::Org => "org",
            DomainKind::Canvas => "canvas",
        }
    }

    /// Concrete domain string, e.g. `org:<id>`.
    pub fn domain(&self, id: &str) -> String {
        format!("{}:{id}", self.as_str())
    }

    pub fn roles(&self) -> &'static [&'static str] {
        match self {
            DomainKind::Org => &[ORG_OWNER, ORG_ADMIN, ORG_VIEWER],
            DomainKind::Canvas => &[CANVAS_OWNER, CANVAS_ADMIN, CANVAS_VIEWER],
        }
    }

    pub fn is_valid_role(&self, role: &str) -> bool {
        self.roles().contains(&role)
    }

    pub fn require_role(&self, role: &str) -> Result<()> {
        if self.is_valid_role(role) {
            Ok(())
        } else {
            Err(Error::Validation(format!(
                "role {role} is not valid for {} domain",
                self.as_str()
            )))
        }
    }
}

pub(crate) fn role_description(role: &str) -> &'static str {
    match role {
        ORG_OWNER => "Full control over organization settings, members and billing",
        ORG_ADMIN => "Manage canvases, users, groups and roles within the organization",
        ORG_VIEWER => "Read-only access to organization resources",
        CANVAS_OWNER => "Full control over the canvas and its members",
        CANVAS_ADMIN => "Manage event sources, stages, secrets and approvals within the canvas",
        CANVAS_VIEWER => "Read-only access to canvas resources",
        _ => "",
    }
}

pub(crate) fn user_subject(user_id: &str) -> String {
    format!("{USER_PREFIX}{user_id}")
}

pub(crate) fn role_subject(role: &str) -> String {
    format!("{ROLE_PREFIX}{role}")
}

pub(crate) fn group_subject(group: &str) -> String {
    format!("{GROUP_PREFIX}{group}")
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Permission {
    pub resource: String,
    pub action: String,
    pub domain_type: DomainKind,
}

/// Description of a role within a domain, with permissions expanded through
/// inheritance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleDefinition {
    pub name: String,
    pub domain_type: DomainKind,
    pub description: String,
    pub permissions: Vec<Permission>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inherits_from: Option<String>,
    /// Built-in roles cannot be edited.
    pub readonly: bool,
}
