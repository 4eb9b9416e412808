//! Persistence boundary.
//!
//! [`Store`] is the only place state lives. Components never share mutable
//! graphs in memory; they cooperate through these calls. Methods that the
//! pipeline relies on for atomicity say so, and implementations must run them
//! in a single transaction:
//!
//! - [`Store::apply_fan_out`]: stage events and tags for an event, sibling
//!   cancellations, and the event's flip out of `pending`.
//! - [`Store::update_tag_state`]: the tag update and the requeue of
//!   `waiting(unhealthy)` stage events it unblocks.
//! - [`Store::finish_execution`]: finalization, tag health, the completion
//!   event, and that event's fan-out.
//! - [`Store::admit`]: the new execution and the stage event's move to
//!   `processed(execution)`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::{
    Approval, Canvas, Connection, Event, EventSource, Execution, ExecutionResult, Organization,
    Secret, SourceType, Stage, StageEvent, StageEventState, StateReason, Tag, TagFilter, TagState,
};

/// Dispatch attempts before an execution is failed.
pub const MAX_DISPATCH_ATTEMPTS: u32 = 3;

/// Delay before redispatching after `attempts` failed attempts.
pub fn dispatch_backoff(attempts: u32) -> Duration {
    Duration::seconds(2i64.pow(attempts.min(10)))
}

/// A stage event to create during fan-out, with its derived tags.
#[derive(Debug, Clone, PartialEq)]
pub struct NewStageEvent {
    pub stage_event: StageEvent,
    pub tags: Vec<Tag>,
}

/// Result of routing one event.
///
/// Applying it creates every listed stage event, moves `cancelled` stage
/// events (waiting siblings of a completed join) to `processed(cancelled)`,
/// and marks the event `processed`, or `discarded` when nothing was created.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FanOut {
    pub event_id: Uuid,
    pub stage_events: Vec<NewStageEvent>,
    /// Join siblings to cancel. Each must still be `waiting` when the
    /// fan-out is applied; otherwise the whole fan-out is rejected with
    /// [`stale_join`].
    pub cancelled: Vec<Uuid>,
}

/// A join was planned against sibling stage events that have since moved.
/// Retryable: plan again and reapply.
pub fn stale_join() -> Error {
    Error::Transient("join siblings changed since planning".into())
}

impl FanOut {
    pub fn new(event_id: Uuid) -> Self {
        Self {
            event_id,
            ..Default::default()
        }
    }

    pub fn is_discarded(&self) -> bool {
        self.stage_events.is_empty()
    }

    /// Stages that received a new stage event.
    pub fn stage_ids(&self) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = self
            .stage_events
            .iter()
            .map(|s| s.stage_event.stage_id)
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }
}

/// Final state of an execution, written with its completion event.
#[derive(Debug, Clone, PartialEq)]
pub struct Finish {
    pub execution_id: Uuid,
    pub result: ExecutionResult,
    pub outputs: Map<String, Value>,
    pub finished_at: DateTime<Utc>,
    pub completion_event: Event,
    pub fan_out: FanOut,
}

#[async_trait]
pub trait Store: Send + Sync + 'static {
    // Organizations

    /// `Conflict` when the name is taken.
    async fn create_organization(&self, org: &Organization) -> Result<()>;
    /// Soft-deleted organizations are not returned.
    async fn find_organization(&self, id: Uuid) -> Result<Option<Organization>>;
    async fn find_organization_by_name(&self, name: &str) -> Result<Option<Organization>>;
    async fn list_organizations(&self, ids: &[Uuid]) -> Result<Vec<Organization>>;
    async fn update_organization(&self, org: &Organization) -> Result<()>;
    async fn soft_delete_organization(&self, id: Uuid) -> Result<()>;

    // Canvases

    /// `Conflict` when the name is taken within the organization.
    async fn create_canvas(&self, canvas: &Canvas) -> Result<()>;
    async fn find_canvas(&self, id: Uuid) -> Result<Option<Canvas>>;
    async fn find_canvas_by_name(&self, organization_id: Uuid, name: &str) -> Result<Option<Canvas>>;
    async fn list_canvases(&self, organization_id: Uuid) -> Result<Vec<Canvas>>;

    // Event sources

    async fn create_event_source(&self, source: &EventSource) -> Result<()>;
    async fn find_event_source(&self, id: Uuid) -> Result<Option<EventSource>>;
    async fn find_event_source_by_name(&self, canvas_id: Uuid, name: &str) -> Result<Option<EventSource>>;
    async fn list_event_sources(&self, canvas_id: Uuid) -> Result<Vec<EventSource>>;

    // Secrets

    async fn create_secret(&self, secret: &Secret) -> Result<()>;
    async fn find_secret_by_name(&self, canvas_id: Uuid, name: &str) -> Result<Option<Secret>>;
    async fn list_secrets(&self, canvas_id: Uuid) -> Result<Vec<Secret>>;
    async fn update_secret(&self, secret: &Secret) -> Result<()>;
    async fn delete_secret(&self, canvas_id: Uuid, name: &str) -> Result<()>;

    // Stages and connections

    /// `Conflict` when the name is taken within the canvas.
    async fn create_stage(&self, stage: &Stage, connections: &[Connection]) -> Result<()>;

    /// Replace the stage and its connections. Pending and waiting stage
    /// events from sources no longer connected move to
    /// `processed(connection)` in the same transaction; they are returned.
    async fn update_stage(&self, stage: &Stage, connections: &[Connection]) -> Result<Vec<StageEvent>>;
    async fn find_stage(&self, id: Uuid) -> Result<Option<Stage>>;
    async fn find_stage_by_name(&self, canvas_id: Uuid, name: &str) -> Result<Option<Stage>>;
    async fn list_stages(&self, canvas_id: Uuid) -> Result<Vec<Stage>>;
    async fn list_connections_for_stage(&self, stage_id: Uuid) -> Result<Vec<Connection>>;
    async fn list_connections_for_source(&self, source_id: Uuid, source_type: SourceType) -> Result<Vec<Connection>>;

    // Events

    async fn create_event(&self, event: &Event) -> Result<()>;
    async fn find_event(&self, id: Uuid) -> Result<Option<Event>>;
    /// Oldest first.
    async fn list_pending_events(&self, limit: usize) -> Result<Vec<Event>>;
    /// Most recently received event from the source, in any state.
    async fn last_event_by_source(&self, source_id: Uuid) -> Result<Option<Event>>;

    /// Apply a routing plan. `Conflict` if the event is no longer pending.
    async fn apply_fan_out(&self, fan_out: &FanOut) -> Result<()>;

    // Stage events

    async fn find_stage_event(&self, id: Uuid) -> Result<Option<StageEvent>>;
    /// Ordered by `(created_at, id)`. An empty `states` matches all.
    async fn list_stage_events(&self, stage_id: Uuid, states: &[StageEventState]) -> Result<Vec<StageEvent>>;
    /// Strict FIFO: smallest `(created_at, id)` among pending events.
    async fn oldest_pending_stage_event(&self, stage_id: Uuid) -> Result<Option<StageEvent>>;
    async fn stages_with_pending_events(&self) -> Result<Vec<Uuid>>;
    async fn stage_events_waiting_for_time_window(&self) -> Result<Vec<StageEvent>>;

    /// Compare-and-set on state. Returns `None` when the stage event is not
    /// currently in one of `from`.
    async fn transition_stage_event(
        &self,
        id: Uuid,
        from: &[StageEventState],
        to: StageEventState,
        reason: Option<StateReason>,
    ) -> Result<Option<StageEvent>>;

    // Approvals

    /// `Conflict` when the approver already approved this stage event.
    async fn approve_stage_event(&self, approval: &Approval) -> Result<()>;
    async fn list_approvals(&self, stage_event_id: Uuid) -> Result<Vec<Approval>>;

    // Tags

    async fn list_tags(&self, stage_event_id: Uuid) -> Result<Vec<Tag>>;
    async fn list_stage_tags(&self, filter: &TagFilter) -> Result<Vec<Tag>>;

    /// Set the state of every tag matching the filter. When tags become
    /// healthy, `waiting(unhealthy)` stage events left with no unhealthy tag
    /// return to `pending` in the same transaction; they are returned.
    async fn update_tag_state(&self, filter: &TagFilter, state: TagState) -> Result<Vec<StageEvent>>;

    // Executions

    /// Create a pending execution and move its stage event to
    /// `processed(execution)`. `Conflict` if the stage event is no longer
    /// pending; `Fatal` if the stage already has an active execution.
    async fn admit(&self, execution: &Execution) -> Result<()>;
    async fn active_execution(&self, stage_id: Uuid) -> Result<Option<Execution>>;
    async fn find_execution(&self, id: Uuid) -> Result<Option<Execution>>;
    async fn find_execution_by_reference(&self, reference_id: &str) -> Result<Option<Execution>>;
    /// Newest first.
    async fn list_executions(&self, stage_id: Uuid) -> Result<Vec<Execution>>;

    /// Lease pending executions that are due for dispatch and not leased by
    /// another worker.
    async fn claim_pending_executions(&self, worker_id: &str, limit: usize, lease: Duration) -> Result<Vec<Execution>>;
    /// Lease one execution for dispatch. `None` if it is not pending, not
    /// due, or leased by another worker.
    async fn claim_execution(&self, id: Uuid, worker_id: &str, lease: Duration) -> Result<Option<Execution>>;

    /// `pending` to `started`. `Conflict` from any other state.
    async fn start_execution(&self, id: Uuid, reference_id: &str) -> Result<Execution>;

    /// Count a failed dispatch attempt, release the lease and schedule the
    /// next attempt after [`dispatch_backoff`].
    async fn retry_dispatch(&self, id: Uuid) -> Result<Execution>;

    /// Merge outputs into an unfinished execution. `Conflict` once finished.
    async fn update_execution_outputs(&self, id: Uuid, outputs: &Map<String, Value>) -> Result<Execution>;

    /// Finalize, set tag health, persist the completion event and apply its
    /// fan-out, atomically. `Conflict` if already finished.
    async fn finish_execution(&self, finish: &Finish) -> Result<Execution>;

    /// Inputs used by the most recent finished execution of the stage whose
    /// result is one of `results`.
    async fn last_execution_inputs(
        &self,
        stage_id: Uuid,
        results: &[ExecutionResult],
    ) -> Result<Option<BTreeMap<String, String>>>;

    // Per-stage serialization

    /// Succeeds when no unexpired lease held by another worker exists.
    /// Re-acquiring an owned lease extends it.
    async fn try_acquire_stage_lease(&self, stage_id: Uuid, worker_id: &str, ttl: Duration) -> Result<bool>;
    async fn release_stage_lease(&self, stage_id: Uuid, worker_id: &str) -> Result<()>;
}

/// Turn an optional lookup into a `NotFound` error.
pub trait Required<T> {
    fn required(self, what: impl std::fmt::Display) -> Result<T>;
}

impl<T> Required<T> for Result<Option<T>> {
    fn required(self, what: impl std::fmt::Display) -> Result<T> {
        self?.ok_or_else(|| Error::not_found(what))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles() {
        assert_eq!(dispatch_backoff(0), Duration::seconds(1));
        assert_eq!(dispatch_backoff(1), Duration::seconds(2));
        assert_eq!(dispatch_backoff(3), Duration::seconds(8));
    }

    #[test]
    fn required_maps_none_to_not_found() {
        let missing: Result<Option<u8>> = Ok(None);
        let err = missing.required("stage").unwrap_err();
        assert_eq!(err.message(), "stage not found");
        assert_eq!(Ok::<_, Error>(Some(1u8)).required("stage").unwrap(), 1);
    }
}
