use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Tenant root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Organization {
    pub id: Uuid,
    /// Unique slug.
    pub name: String,
    pub display_name: String,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Organization {
    pub fn new(name: impl Into<String>, display_name: impl Into<String>, created_by: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            display_name: display_name.into(),
            created_by: created_by.into(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }
}

/// Graph container within an organization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Canvas {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub name: String,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Canvas {
    pub fn new(organization_id: Uuid, name: impl Into<String>, created_by: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            organization_id,
            name: name.into(),
            created_by: created_by.into(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Named webhook ingress on a canvas.
///
/// `key` is the verification key encrypted with the source name as
/// associated data. It is never serialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSource {
    pub id: Uuid,
    pub canvas_id: Uuid,
    pub name: String,
    #[serde(skip)]
    pub key: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Canvas-scoped key/value secret. `data` holds the encrypted JSON map,
/// bound to the secret name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Secret {
    pub id: Uuid,
    pub canvas_id: Uuid,
    pub name: String,
    pub provider: String,
    #[serde(skip)]
    pub data: Vec<u8>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub const LOCAL_SECRET_PROVIDER: &str = "local";
