use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use super::event::{Event, SourceType};
use super::stage::Stage;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionState {
    Pending,
    Started,
    Finished,
}

impl ExecutionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionState::Pending => "pending",
            ExecutionState::Started => "started",
            ExecutionState::Finished => "finished",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "pending" => Ok(ExecutionState::Pending),
            "started" => Ok(ExecutionState::Started),
            "finished" => Ok(ExecutionState::Finished),
            other => Err(Error::Validation(format!("invalid execution state {other:?}"))),
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, ExecutionState::Pending | ExecutionState::Started)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionResult {
    Passed,
    Failed,
}

impl ExecutionResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionResult::Passed => "passed",
            ExecutionResult::Failed => "failed",
        }
    }

    /// Parse a stored result; the empty string means not finished.
    pub fn parse(value: &str) -> Result<Option<Self>> {
        match value {
            "" => Ok(None),
            "passed" => Ok(Some(ExecutionResult::Passed)),
            "failed" => Ok(Some(ExecutionResult::Failed)),
            other => Err(Error::Validation(format!("invalid execution result {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    pub stage_id: Uuid,
    pub stage_event_id: Uuid,
    pub state: ExecutionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ExecutionResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_id: Option<String>,
    #[serde(default)]
    pub outputs: serde_json::Map<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub dispatch_attempts: u32,
}

impl Execution {
    pub fn new(stage_id: Uuid, stage_event_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            stage_id,
            stage_event_id,
            state: ExecutionState::Pending,
            result: None,
            reference_id: None,
            outputs: serde_json::Map::new(),
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
            dispatch_attempts: 0,
        }
    }
}

pub const COMPLETION_EVENT_TYPE: &str = "StageExecutionCompletion";

/// Build the synthetic event a finished execution feeds back into routing.
///
/// The event's source is the stage itself, so downstream connections whose
/// source is this stage pick it up.
pub fn completion_event(stage: &Stage, execution: &Execution) -> Event {
    let raw = json!({
        "type": COMPLETION_EVENT_TYPE,
        "stage": { "id": stage.id },
        "execution": {
            "id": execution.id,
            "result": execution.result.map(|r| r.as_str()).unwrap_or_default(),
            "created_at": execution.created_at,
            "started_at": execution.started_at,
            "finished_at": execution.finished_at,
        },
        "outputs": execution.outputs,
    });

    Event::new(
        stage.id,
        stage.name.clone(),
        SourceType::Stage,
        raw,
        Default::default(),
    )
}
