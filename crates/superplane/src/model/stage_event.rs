use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::event::{Event, SourceType};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageEventState {
    Pending,
    Waiting,
    Processed,
}

impl StageEventState {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageEventState::Pending => "pending",
            StageEventState::Waiting => "waiting",
            StageEventState::Processed => "processed",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "pending" => Ok(StageEventState::Pending),
            "waiting" => Ok(StageEventState::Waiting),
            "processed" => Ok(StageEventState::Processed),
            other => Err(Error::Validation(format!("invalid stage event state {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StateReason {
    Approval,
    TimeWindow,
    Execution,
    Connection,
    Cancelled,
    Unhealthy,
}

impl StateReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StateReason::Approval => "approval",
            StateReason::TimeWindow => "time-window",
            StateReason::Execution => "execution",
            StateReason::Connection => "connection",
            StateReason::Cancelled => "cancelled",
            StateReason::Unhealthy => "unhealthy",
        }
    }

    /// Parse a stored reason; the empty string means no reason.
    pub fn parse(value: &str) -> Result<Option<Self>> {
        match value {
            "" => Ok(None),
            "approval" => Ok(Some(StateReason::Approval)),
            "time-window" => Ok(Some(StateReason::TimeWindow)),
            "execution" => Ok(Some(StateReason::Execution)),
            "connection" => Ok(Some(StateReason::Connection)),
            "cancelled" => Ok(Some(StateReason::Cancelled)),
            "unhealthy" => Ok(Some(StateReason::Unhealthy)),
            other => Err(Error::Validation(format!("invalid state reason {other:?}"))),
        }
    }

    /// Reasons that hold back younger events of the same stage.
    pub fn blocks_queue(&self) -> bool {
        matches!(
            self,
            StateReason::Approval | StateReason::TimeWindow | StateReason::Unhealthy
        )
    }
}

/// Per-stage instantiation of an upstream event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageEvent {
    pub id: Uuid,
    pub stage_id: Uuid,
    pub event_id: Uuid,
    pub source_id: Uuid,
    pub source_name: String,
    pub source_type: SourceType,
    pub state: StageEventState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_reason: Option<StateReason>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub inputs: BTreeMap<String, String>,
}

impl StageEvent {
    pub fn new(stage_id: Uuid, event: &Event, inputs: BTreeMap<String, String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            stage_id,
            event_id: event.id,
            source_id: event.source_id,
            source_name: event.source_name.clone(),
            source_type: event.source_type,
            state: StageEventState::Pending,
            state_reason: None,
            created_at: Utc::now(),
            inputs,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state == StageEventState::Processed
    }

    pub fn is_in(&self, state: StageEventState, reason: Option<StateReason>) -> bool {
        self.state == state && self.state_reason == reason
    }
}

/// Append-only approval record; unique on (stage event, approver).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Approval {
    pub stage_event_id: Uuid,
    pub approved_by: String,
    pub approved_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TagState {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
}

impl TagState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TagState::Unknown => "unknown",
            TagState::Healthy => "healthy",
            TagState::Unhealthy => "unhealthy",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "unknown" => Ok(TagState::Unknown),
            "healthy" => Ok(TagState::Healthy),
            "unhealthy" => Ok(TagState::Unhealthy),
            other => Err(Error::Validation(format!("invalid tag state {other:?}"))),
        }
    }
}

/// Named string derived from a stage event. Keyed on (stage event, name).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub stage_event_id: Uuid,
    pub name: String,
    pub value: String,
    pub state: TagState,
}

impl Tag {
    pub fn new(stage_event_id: Uuid, name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            stage_event_id,
            name: name.into(),
            value: value.into(),
            state: TagState::Unknown,
        }
    }
}

/// Filter for tag listings and tag-state updates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagFilter {
    pub canvas_id: Option<Uuid>,
    pub stage_id: Option<Uuid>,
    pub name: Option<String>,
    pub value: Option<String>,
    pub states: Vec<TagState>,
}

impl TagFilter {
    pub fn matches(&self, tag: &Tag) -> bool {
        self.name.as_deref().map_or(true, |n| n == tag.name)
            && self.value.as_deref().map_or(true, |v| v == tag.value)
            && (self.states.is_empty() || self.states.contains(&tag.state))
    }
}
