use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// One row of the single relation that stores every RBAC relationship.
///
/// Grants read `p, subject, domain, resource, action`. Edges read
/// `g, member, parent, domain`: the member holds everything the parent holds
/// within that domain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "ptype")]
pub enum PolicyRule {
    #[serde(rename = "p")]
    Grant {
        subject: String,
        domain: String,
        resource: String,
        action: String,
    },
    #[serde(rename = "g")]
    Edge {
        member: String,
        parent: String,
        domain: String,
    },
}

impl PolicyRule {
    pub fn grant(subject: &str, domain: &str, resource: &str, action: &str) -> Self {
        PolicyRule::Grant {
            subject: subject.to_string(),
            domain: domain.to_string(),
            resource: resource.to_string(),
            action: action.to_string(),
        }
    }

    pub fn edge(member: &str, parent: &str, domain: &str) -> Self {
        PolicyRule::Edge {
            member: member.to_string(),
            parent: parent.to_string(),
            domain: domain.to_string(),
        }
    }

    pub fn ptype(&self) -> &'static str {
        match self {
            PolicyRule::Grant { .. } => "p",
            PolicyRule::Edge { .. } => "g",
        }
    }

    pub fn domain(&self) -> &str {
        match self {
            PolicyRule::Grant { domain, .. } | PolicyRule::Edge { domain, .. } => domain,
        }
    }

    /// Positional values after the rule type, as stored.
    pub fn values(&self) -> Vec<&str> {
        match self {
            PolicyRule::Grant {
                subject,
                domain,
                resource,
                action,
            } => vec![subject.as_str(), domain.as_str(), resource.as_str(), action.as_str()],
            PolicyRule::Edge {
                member,
                parent,
                domain,
            } => vec![member.as_str(), parent.as_str(), domain.as_str()],
        }
    }

    /// Rebuild a rule from its stored positional form.
    pub fn from_values(ptype: &str, values: &[&str]) -> Result<Self> {
        match (ptype, values) {
            ("p", [subject, domain, resource, action, ..]) => {
                Ok(PolicyRule::grant(subject, domain, resource, action))
            }
            ("g", [member, parent, domain, ..]) => Ok(PolicyRule::edge(member, parent, domain)),
            _ => Err(Error::Config(format!(
                "malformed policy rule: {ptype}, {}",
                values.join(", ")
            ))),
        }
    }

    /// Parse one `p, ...` or `g, ...` line.
    pub fn parse_line(line: &str) -> Result<Self> {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        match fields.split_first() {
            Some((ptype, rest)) if rest.iter().all(|f| !f.is_empty()) => {
                Self::from_values(ptype, rest)
            }
            _ => Err(Error::Config(format!("malformed policy rule: {line}"))),
        }
    }
}

impl std::fmt::Display for PolicyRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}, {}", self.ptype(), self.values().join(", "))
    }
}

/// Durable backing for the enforcer's rule set.
#[async_trait]
pub trait PolicyStore: Send + Sync + 'static {
    async fn load(&self) -> Result<Vec<PolicyRule>>;

    /// Insert rules; rules that already exist are ignored.
    async fn add(&self, rules: &[PolicyRule]) -> Result<()>;

    async fn remove(&self, rules: &[PolicyRule]) -> Result<()>;
}
