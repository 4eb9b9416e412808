use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Kind of entity that produced an event or feeds a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceType {
    EventSource,
    Stage,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::EventSource => "event-source",
            SourceType::Stage => "stage",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "event-source" => Ok(SourceType::EventSource),
            "stage" => Ok(SourceType::Stage),
            other => Err(Error::Validation(format!("invalid source type {other:?}"))),
        }
    }
}

/// Distribution state of a raw event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventState {
    /// Not yet fanned out.
    Pending,
    /// No connection accepted it.
    Discarded,
    /// Fan-out complete.
    Processed,
}

impl EventState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventState::Pending => "pending",
            EventState::Discarded => "discarded",
            EventState::Processed => "processed",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "pending" => Ok(EventState::Pending),
            "discarded" => Ok(EventState::Discarded),
            "processed" => Ok(EventState::Processed),
            other => Err(Error::Validation(format!("invalid event state {other:?}"))),
        }
    }
}

/// Immutable record of something that arrived at a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub source_id: Uuid,
    pub source_name: String,
    pub source_type: SourceType,
    pub state: EventState,
    pub received_at: DateTime<Utc>,
    pub raw: serde_json::Value,
    pub headers: BTreeMap<String, String>,
}

impl Event {
    pub fn new(
        source_id: Uuid,
        source_name: impl Into<String>,
        source_type: SourceType,
        raw: serde_json::Value,
        headers: BTreeMap<String, String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_id,
            source_name: source_name.into(),
            source_type,
            state: EventState::Pending,
            received_at: Utc::now(),
            raw,
            headers,
        }
    }

    /// Headers with keys folded to lowercase, as seen by header filters.
    pub fn lowercase_headers(&self) -> BTreeMap<String, String> {
        self.headers
            .iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v.clone()))
            .collect()
    }
}
