//! In-memory [`Store`] with the same transactional semantics as the
//! Postgres store: every method runs under one lock and validates before it
//! mutates, so a failed call leaves nothing half-applied.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use uuid::Uuid;

use superplane::clock::{Clock, SystemClock};
use superplane::error::{Error, Result};
use superplane::model::{
    Approval, Canvas, Connection, Event, EventSource, EventState, Execution, ExecutionResult,
    ExecutionState, Organization, Secret, SourceType, Stage, StageEvent, StageEventState,
    StateReason, Tag, TagFilter, TagState,
};
use superplane::service::duplicate_name;
use superplane::store::{dispatch_backoff, stale_join, FanOut, Finish, Store};

#[derive(Debug, Clone)]
struct Lease {
    worker_id: String,
    until: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct State {
    organizations: HashMap<Uuid, Organization>,
    canvases: HashMap<Uuid, Canvas>,
    sources: HashMap<Uuid, EventSource>,
    secrets: HashMap<Uuid, Secret>,
    stages: HashMap<Uuid, Stage>,
    connections: Vec<Connection>,
    /// Arrival order.
    events: Vec<Event>,
    stage_events: HashMap<Uuid, StageEvent>,
    approvals: Vec<Approval>,
    tags: Vec<Tag>,
    executions: HashMap<Uuid, Execution>,
    dispatch_claims: HashMap<Uuid, Lease>,
    dispatch_after: HashMap<Uuid, DateTime<Utc>>,
    stage_leases: HashMap<Uuid, Lease>,
    reject_fan_outs: bool,
}

impl State {
    fn event_mut(&mut self, id: Uuid) -> Option<&mut Event> {
        self.events.iter_mut().find(|e| e.id == id)
    }

    fn stage_events_of(&self, stage_id: Uuid) -> Vec<StageEvent> {
        let mut events: Vec<StageEvent> = self
            .stage_events
            .values()
            .filter(|e| e.stage_id == stage_id)
            .cloned()
            .collect();
        events.sort_by_key(|e| (e.created_at, e.id));
        events
    }

    fn active_execution(&self, stage_id: Uuid) -> Option<&Execution> {
        self.executions
            .values()
            .find(|e| e.stage_id == stage_id && e.state.is_active())
    }

    /// Whether a tag passes the filter's canvas and stage restrictions.
    fn tag_in_scope(&self, filter: &TagFilter, tag: &Tag) -> bool {
        if filter.stage_id.is_none() && filter.canvas_id.is_none() {
            return true;
        }
        let Some(stage_event) = self.stage_events.get(&tag.stage_event_id) else {
            return false;
        };
        if filter.stage_id.is_some_and(|id| id != stage_event.stage_id) {
            return false;
        }
        match filter.canvas_id {
            Some(canvas_id) => self
                .stages
                .get(&stage_event.stage_id)
                .is_some_and(|s| s.canvas_id == canvas_id),
            None => true,
        }
    }

    fn claimable(&self, execution: &Execution, worker_id: &str, now: DateTime<Utc>) -> bool {
        if execution.state != ExecutionState::Pending {
            return false;
        }
        if self.dispatch_after.get(&execution.id).is_some_and(|at| *at > now) {
            return false;
        }
        match self.dispatch_claims.get(&execution.id) {
            Some(lease) => lease.worker_id == worker_id || lease.until <= now,
            None => true,
        }
    }

    fn check_join(&self, fan_out: &FanOut) -> Result<()> {
        let still_waiting = fan_out.cancelled.iter().all(|id| {
            self.stage_events
                .get(id)
                .is_some_and(|e| e.state == StageEventState::Waiting)
        });
        if still_waiting {
            Ok(())
        } else {
            Err(stale_join())
        }
    }

    fn apply_fan_out(&mut self, fan_out: &FanOut) -> Result<()> {
        match self.events.iter().find(|e| e.id == fan_out.event_id) {
            Some(event) if event.state == EventState::Pending => {}
            Some(_) => return Err(Error::Conflict("event already routed".into())),
            None => return Err(Error::not_found("event")),
        }
        self.check_join(fan_out)?;

        for new in &fan_out.stage_events {
            self.stage_events
                .insert(new.stage_event.id, new.stage_event.clone());
            self.tags.extend(new.tags.iter().cloned());
        }
        for id in &fan_out.cancelled {
            if let Some(stage_event) = self.stage_events.get_mut(id) {
                if stage_event.state == StageEventState::Waiting {
                    stage_event.state = StageEventState::Processed;
                    stage_event.state_reason = Some(StateReason::Cancelled);
                }
            }
        }

        let state = if fan_out.is_discarded() {
            EventState::Discarded
        } else {
            EventState::Processed
        };
        if let Some(event) = self.event_mut(fan_out.event_id) {
            event.state = state;
        }
        Ok(())
    }
}

pub struct MemoryStore {
    state: Mutex<State>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Leases and dispatch backoff follow `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            clock,
        }
    }

    /// Every stored event, in arrival order.
    pub fn events(&self) -> Vec<Event> {
        self.state.lock().events.clone()
    }

    /// Every execution of every stage.
    pub fn executions(&self) -> Vec<Execution> {
        self.state.lock().executions.values().cloned().collect()
    }

    /// Make every scheduled redispatch due now.
    pub fn clear_dispatch_backoff(&self) {
        self.state.lock().dispatch_after.clear();
    }

    /// While set, routing an event fails with a validation error and leaves
    /// the event pending.
    pub fn reject_fan_outs(&self, reject: bool) {
        self.state.lock().reject_fan_outs = reject;
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_organization(&self, org: &Organization) -> Result<()> {
        let mut state = self.state.lock();
        if state
            .organizations
            .values()
            .any(|o| o.deleted_at.is_none() && o.name == org.name)
        {
            return Err(duplicate_name("organization"));
        }
        state.organizations.insert(org.id, org.clone());
        Ok(())
    }

    async fn find_organization(&self, id: Uuid) -> Result<Option<Organization>> {
        Ok(self
            .state
            .lock()
            .organizations
            .get(&id)
            .filter(|o| o.deleted_at.is_none())
            .cloned())
    }

    async fn find_organization_by_name(&self, name: &str) -> Result<Option<Organization>> {
        Ok(self
            .state
            .lock()
            .organizations
            .values()
            .find(|o| o.deleted_at.is_none() && o.name == name)
            .cloned())
    }

    async fn list_organizations(&self, ids: &[Uuid]) -> Result<Vec<Organization>> {
        let state = self.state.lock();
        let mut orgs: Vec<Organization> = ids
            .iter()
            .filter_map(|id| state.organizations.get(id))
            .filter(|o| o.deleted_at.is_none())
            .cloned()
            .collect();
        orgs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(orgs)
    }

    async fn update_organization(&self, org: &Organization) -> Result<()> {
        let mut state = self.state.lock();
        match state.organizations.get_mut(&org.id) {
            Some(existing) if existing.deleted_at.is_none() => {
                *existing = org.clone();
                Ok(())
            }
            _ => Err(Error::not_found("organization")),
        }
    }

    async fn soft_delete_organization(&self, id: Uuid) -> Result<()> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        match state.organizations.get_mut(&id) {
            Some(org) if org.deleted_at.is_none() => {
                org.deleted_at = Some(now);
                Ok(())
            }
            _ => Err(Error::not_found("organization")),
        }
    }

    async fn create_canvas(&self, canvas: &Canvas) -> Result<()> {
        let mut state = self.state.lock();
        if state
            .canvases
            .values()
            .any(|c| c.organization_id == canvas.organization_id && c.name == canvas.name)
        {
            return Err(duplicate_name("canvas"));
        }
        state.canvases.insert(canvas.id, canvas.clone());
        Ok(())
    }

    async fn find_canvas(&self, id: Uuid) -> Result<Option<Canvas>> {
        Ok(self.state.lock().canvases.get(&id).cloned())
    }

    async fn find_canvas_by_name(&self, organization_id: Uuid, name: &str) -> Result<Option<Canvas>> {
        Ok(self
            .state
            .lock()
            .canvases
            .values()
            .find(|c| c.organization_id == organization_id && c.name == name)
            .cloned())
    }

    async fn list_canvases(&self, organization_id: Uuid) -> Result<Vec<Canvas>> {
        let mut canvases: Vec<Canvas> = self
            .state
            .lock()
            .canvases
            .values()
            .filter(|c| c.organization_id == organization_id)
            .cloned()
            .collect();
        canvases.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(canvases)
    }

    async fn create_event_source(&self, source: &EventSource) -> Result<()> {
        let mut state = self.state.lock();
        if state
            .sources
            .values()
            .any(|s| s.canvas_id == source.canvas_id && s.name == source.name)
        {
            return Err(duplicate_name("event source"));
        }
        state.sources.insert(source.id, source.clone());
        Ok(())
    }

    async fn find_event_source(&self, id: Uuid) -> Result<Option<EventSource>> {
        Ok(self.state.lock().sources.get(&id).cloned())
    }

    async fn find_event_source_by_name(&self, canvas_id: Uuid, name: &str) -> Result<Option<EventSource>> {
        Ok(self
            .state
            .lock()
            .sources
            .values()
            .find(|s| s.canvas_id == canvas_id && s.name == name)
            .cloned())
    }

    async fn list_event_sources(&self, canvas_id: Uuid) -> Result<Vec<EventSource>> {
        let mut sources: Vec<EventSource> = self
            .state
            .lock()
            .sources
            .values()
            .filter(|s| s.canvas_id == canvas_id)
            .cloned()
            .collect();
        sources.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(sources)
    }

    async fn create_secret(&self, secret: &Secret) -> Result<()> {
        let mut state = self.state.lock();
        if state
            .secrets
            .values()
            .any(|s| s.canvas_id == secret.canvas_id && s.name == secret.name)
        {
            return Err(duplicate_name("secret"));
        }
        state.secrets.insert(secret.id, secret.clone());
        Ok(())
    }

    async fn find_secret_by_name(&self, canvas_id: Uuid, name: &str) -> Result<Option<Secret>> {
        Ok(self
            .state
            .lock()
            .secrets
            .values()
            .find(|s| s.canvas_id == canvas_id && s.name == name)
            .cloned())
    }

    async fn list_secrets(&self, canvas_id: Uuid) -> Result<Vec<Secret>> {
        let mut secrets: Vec<Secret> = self
            .state
            .lock()
            .secrets
            .values()
            .filter(|s| s.canvas_id == canvas_id)
            .cloned()
            .collect();
        secrets.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(secrets)
    }

    async fn update_secret(&self, secret: &Secret) -> Result<()> {
        let mut state = self.state.lock();
        match state.secrets.get_mut(&secret.id) {
            Some(existing) => {
                *existing = secret.clone();
                Ok(())
            }
            None => Err(Error::not_found(format!("secret {}", secret.name))),
        }
    }

    async fn delete_secret(&self, canvas_id: Uuid, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        let before = state.secrets.len();
        state
            .secrets
            .retain(|_, s| !(s.canvas_id == canvas_id && s.name == name));
        if state.secrets.len() == before {
            return Err(Error::not_found(format!("secret {name}")));
        }
        Ok(())
    }

    async fn create_stage(&self, stage: &Stage, connections: &[Connection]) -> Result<()> {
        let mut state = self.state.lock();
        if state
            .stages
            .values()
            .any(|s| s.canvas_id == stage.canvas_id && s.name == stage.name)
        {
            return Err(duplicate_name("stage"));
        }
        state.stages.insert(stage.id, stage.clone());
        state.connections.extend(connections.iter().cloned());
        Ok(())
    }

    async fn update_stage(&self, stage: &Stage, connections: &[Connection]) -> Result<Vec<StageEvent>> {
        let mut state = self.state.lock();
        if !state.stages.contains_key(&stage.id) {
            return Err(Error::not_found("stage"));
        }
        if state
            .stages
            .values()
            .any(|s| s.id != stage.id && s.canvas_id == stage.canvas_id && s.name == stage.name)
        {
            return Err(duplicate_name("stage"));
        }

        state.stages.insert(stage.id, stage.clone());
        state.connections.retain(|c| c.stage_id != stage.id);
        state.connections.extend(connections.iter().cloned());

        let connected: HashSet<Uuid> = connections.iter().map(|c| c.source_id).collect();
        let mut invalidated = Vec::new();
        for stage_event in state.stage_events.values_mut() {
            if stage_event.stage_id == stage.id
                && !stage_event.is_terminal()
                && !connected.contains(&stage_event.source_id)
            {
                stage_event.state = StageEventState::Processed;
                stage_event.state_reason = Some(StateReason::Connection);
                invalidated.push(stage_event.clone());
            }
        }
        Ok(invalidated)
    }

    async fn find_stage(&self, id: Uuid) -> Result<Option<Stage>> {
        Ok(self.state.lock().stages.get(&id).cloned())
    }

    async fn find_stage_by_name(&self, canvas_id: Uuid, name: &str) -> Result<Option<Stage>> {
        Ok(self
            .state
            .lock()
            .stages
            .values()
            .find(|s| s.canvas_id == canvas_id && s.name == name)
            .cloned())
    }

    async fn list_stages(&self, canvas_id: Uuid) -> Result<Vec<Stage>> {
        let mut stages: Vec<Stage> = self
            .state
            .lock()
            .stages
            .values()
            .filter(|s| s.canvas_id == canvas_id)
            .cloned()
            .collect();
        stages.sort_by_key(|s| (s.created_at, s.id));
        Ok(stages)
    }

    async fn list_connections_for_stage(&self, stage_id: Uuid) -> Result<Vec<Connection>> {
        Ok(self
            .state
            .lock()
            .connections
            .iter()
            .filter(|c| c.stage_id == stage_id)
            .cloned()
            .collect())
    }

    async fn list_connections_for_source(&self, source_id: Uuid, source_type: SourceType) -> Result<Vec<Connection>> {
        Ok(self
            .state
            .lock()
            .connections
            .iter()
            .filter(|c| c.source_id == source_id && c.source_type == source_type)
            .cloned()
            .collect())
    }

    async fn create_event(&self, event: &Event) -> Result<()> {
        let mut state = self.state.lock();
        if state.events.iter().any(|e| e.id == event.id) {
            return Err(Error::Conflict("event already exists".into()));
        }
        state.events.push(event.clone());
        Ok(())
    }

    async fn find_event(&self, id: Uuid) -> Result<Option<Event>> {
        Ok(self.state.lock().events.iter().find(|e| e.id == id).cloned())
    }

    async fn list_pending_events(&self, limit: usize) -> Result<Vec<Event>> {
        Ok(self
            .state
            .lock()
            .events
            .iter()
            .filter(|e| e.state == EventState::Pending)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn last_event_by_source(&self, source_id: Uuid) -> Result<Option<Event>> {
        Ok(self
            .state
            .lock()
            .events
            .iter()
            .rev()
            .find(|e| e.source_id == source_id)
            .cloned())
    }

    async fn apply_fan_out(&self, fan_out: &FanOut) -> Result<()> {
        let mut state = self.state.lock();
        if state.reject_fan_outs {
            return Err(Error::Validation("fan-out rejected".into()));
        }
        state.apply_fan_out(fan_out)
    }

    async fn find_stage_event(&self, id: Uuid) -> Result<Option<StageEvent>> {
        Ok(self.state.lock().stage_events.get(&id).cloned())
    }

    async fn list_stage_events(&self, stage_id: Uuid, states: &[StageEventState]) -> Result<Vec<StageEvent>> {
        Ok(self
            .state
            .lock()
            .stage_events_of(stage_id)
            .into_iter()
            .filter(|e| states.is_empty() || states.contains(&e.state))
            .collect())
    }

    async fn oldest_pending_stage_event(&self, stage_id: Uuid) -> Result<Option<StageEvent>> {
        Ok(self
            .state
            .lock()
            .stage_events_of(stage_id)
            .into_iter()
            .find(|e| e.state == StageEventState::Pending))
    }

    async fn stages_with_pending_events(&self) -> Result<Vec<Uuid>> {
        let mut stages: Vec<Uuid> = self
            .state
            .lock()
            .stage_events
            .values()
            .filter(|e| e.state == StageEventState::Pending)
            .map(|e| e.stage_id)
            .collect();
        stages.sort();
        stages.dedup();
        Ok(stages)
    }

    async fn stage_events_waiting_for_time_window(&self) -> Result<Vec<StageEvent>> {
        let mut events: Vec<StageEvent> = self
            .state
            .lock()
            .stage_events
            .values()
            .filter(|e| e.is_in(StageEventState::Waiting, Some(StateReason::TimeWindow)))
            .cloned()
            .collect();
        events.sort_by_key(|e| (e.created_at, e.id));
        Ok(events)
    }

    async fn transition_stage_event(
        &self,
        id: Uuid,
        from: &[StageEventState],
        to: StageEventState,
        reason: Option<StateReason>,
    ) -> Result<Option<StageEvent>> {
        let mut state = self.state.lock();
        let Some(stage_event) = state.stage_events.get_mut(&id) else {
            return Ok(None);
        };
        if !from.contains(&stage_event.state) {
            return Ok(None);
        }
        stage_event.state = to;
        stage_event.state_reason = reason;
        Ok(Some(stage_event.clone()))
    }

    async fn approve_stage_event(&self, approval: &Approval) -> Result<()> {
        let mut state = self.state.lock();
        if !state.stage_events.contains_key(&approval.stage_event_id) {
            return Err(Error::not_found("stage event"));
        }
        if state.approvals.iter().any(|a| {
            a.stage_event_id == approval.stage_event_id && a.approved_by == approval.approved_by
        }) {
            return Err(Error::Conflict(format!(
                "stage event already approved by {}",
                approval.approved_by
            )));
        }
        state.approvals.push(approval.clone());
        Ok(())
    }

    async fn list_approvals(&self, stage_event_id: Uuid) -> Result<Vec<Approval>> {
        Ok(self
            .state
            .lock()
            .approvals
            .iter()
            .filter(|a| a.stage_event_id == stage_event_id)
            .cloned()
            .collect())
    }

    async fn list_tags(&self, stage_event_id: Uuid) -> Result<Vec<Tag>> {
        Ok(self
            .state
            .lock()
            .tags
            .iter()
            .filter(|t| t.stage_event_id == stage_event_id)
            .cloned()
            .collect())
    }

    async fn list_stage_tags(&self, filter: &TagFilter) -> Result<Vec<Tag>> {
        let state = self.state.lock();
        Ok(state
            .tags
            .iter()
            .filter(|t| filter.matches(t) && state.tag_in_scope(filter, t))
            .cloned()
            .collect())
    }

    async fn update_tag_state(&self, filter: &TagFilter, new_state: TagState) -> Result<Vec<StageEvent>> {
        let mut state = self.state.lock();

        let matched: Vec<usize> = state
            .tags
            .iter()
            .enumerate()
            .filter(|(_, t)| filter.matches(t) && state.tag_in_scope(filter, t))
            .map(|(i, _)| i)
            .collect();
        let mut touched = HashSet::new();
        for i in matched {
            state.tags[i].state = new_state;
            touched.insert(state.tags[i].stage_event_id);
        }

        if new_state == TagState::Unhealthy {
            return Ok(Vec::new());
        }

        let still_unhealthy: HashSet<Uuid> = state
            .tags
            .iter()
            .filter(|t| t.state == TagState::Unhealthy)
            .map(|t| t.stage_event_id)
            .collect();

        let mut requeued = Vec::new();
        for id in touched {
            if still_unhealthy.contains(&id) {
                continue;
            }
            if let Some(stage_event) = state.stage_events.get_mut(&id) {
                if stage_event.is_in(StageEventState::Waiting, Some(StateReason::Unhealthy)) {
                    stage_event.state = StageEventState::Pending;
                    stage_event.state_reason = None;
                    requeued.push(stage_event.clone());
                }
            }
        }
        requeued.sort_by_key(|e| (e.created_at, e.id));
        Ok(requeued)
    }

    async fn admit(&self, execution: &Execution) -> Result<()> {
        let mut state = self.state.lock();
        match state.stage_events.get(&execution.stage_event_id) {
            Some(e) if e.state == StageEventState::Pending => {}
            Some(_) => return Err(Error::Conflict("stage event is no longer pending".into())),
            None => return Err(Error::not_found("stage event")),
        }
        if state.active_execution(execution.stage_id).is_some() {
            return Err(Error::Fatal(format!(
                "stage {} already has an active execution",
                execution.stage_id
            )));
        }

        state.executions.insert(execution.id, execution.clone());
        if let Some(stage_event) = state.stage_events.get_mut(&execution.stage_event_id) {
            stage_event.state = StageEventState::Processed;
            stage_event.state_reason = Some(StateReason::Execution);
        }
        Ok(())
    }

    async fn active_execution(&self, stage_id: Uuid) -> Result<Option<Execution>> {
        Ok(self.state.lock().active_execution(stage_id).cloned())
    }

    async fn find_execution(&self, id: Uuid) -> Result<Option<Execution>> {
        Ok(self.state.lock().executions.get(&id).cloned())
    }

    async fn find_execution_by_reference(&self, reference_id: &str) -> Result<Option<Execution>> {
        Ok(self
            .state
            .lock()
            .executions
            .values()
            .find(|e| e.reference_id.as_deref() == Some(reference_id))
            .cloned())
    }

    async fn list_executions(&self, stage_id: Uuid) -> Result<Vec<Execution>> {
        let mut executions: Vec<Execution> = self
            .state
            .lock()
            .executions
            .values()
            .filter(|e| e.stage_id == stage_id)
            .cloned()
            .collect();
        executions.sort_by_key(|e| std::cmp::Reverse((e.created_at, e.id)));
        Ok(executions)
    }

    async fn claim_pending_executions(&self, worker_id: &str, limit: usize, lease: Duration) -> Result<Vec<Execution>> {
        let now = self.clock.now();
        let mut state = self.state.lock();

        let mut due: Vec<Execution> = state
            .executions
            .values()
            .filter(|e| state.claimable(e, worker_id, now))
            .cloned()
            .collect();
        due.sort_by_key(|e| (e.created_at, e.id));
        due.truncate(limit);

        for execution in &due {
            state.dispatch_claims.insert(
                execution.id,
                Lease {
                    worker_id: worker_id.to_string(),
                    until: now + lease,
                },
            );
        }
        Ok(due)
    }

    async fn claim_execution(&self, id: Uuid, worker_id: &str, lease: Duration) -> Result<Option<Execution>> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let Some(execution) = state.executions.get(&id).cloned() else {
            return Ok(None);
        };
        if !state.claimable(&execution, worker_id, now) {
            return Ok(None);
        }
        state.dispatch_claims.insert(
            id,
            Lease {
                worker_id: worker_id.to_string(),
                until: now + lease,
            },
        );
        Ok(Some(execution))
    }

    async fn start_execution(&self, id: Uuid, reference_id: &str) -> Result<Execution> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let execution = state
            .executions
            .get_mut(&id)
            .ok_or_else(|| Error::not_found("execution"))?;
        if execution.state != ExecutionState::Pending {
            return Err(Error::Conflict(format!(
                "execution is {}, not pending",
                execution.state.as_str()
            )));
        }
        execution.state = ExecutionState::Started;
        execution.reference_id = Some(reference_id.to_string());
        execution.started_at = Some(now);
        execution.updated_at = now;
        let started = execution.clone();
        state.dispatch_claims.remove(&id);
        Ok(started)
    }

    async fn retry_dispatch(&self, id: Uuid) -> Result<Execution> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let execution = state
            .executions
            .get_mut(&id)
            .ok_or_else(|| Error::not_found("execution"))?;
        if execution.state != ExecutionState::Pending {
            return Err(Error::Conflict("execution is not pending".into()));
        }
        execution.dispatch_attempts += 1;
        execution.updated_at = now;
        let retried = execution.clone();
        state
            .dispatch_after
            .insert(id, now + dispatch_backoff(retried.dispatch_attempts));
        state.dispatch_claims.remove(&id);
        Ok(retried)
    }

    async fn update_execution_outputs(&self, id: Uuid, outputs: &Map<String, Value>) -> Result<Execution> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let execution = state
            .executions
            .get_mut(&id)
            .ok_or_else(|| Error::not_found("execution"))?;
        if execution.state == ExecutionState::Finished {
            return Err(Error::Conflict("execution already finished".into()));
        }
        execution
            .outputs
            .extend(outputs.iter().map(|(k, v)| (k.clone(), v.clone())));
        execution.updated_at = now;
        Ok(execution.clone())
    }

    async fn finish_execution(&self, finish: &Finish) -> Result<Execution> {
        let mut state = self.state.lock();
        let execution = state
            .executions
            .get(&finish.execution_id)
            .cloned()
            .ok_or_else(|| Error::not_found("execution"))?;
        if execution.state == ExecutionState::Finished {
            return Err(Error::Conflict("execution already finished".into()));
        }
        if state.events.iter().any(|e| e.id == finish.completion_event.id) {
            return Err(Error::Conflict("completion event already exists".into()));
        }
        state.check_join(&finish.fan_out)?;

        let mut finished = execution;
        finished.state = ExecutionState::Finished;
        finished.result = Some(finish.result);
        finished.outputs = finish.outputs.clone();
        finished.finished_at = Some(finish.finished_at);
        finished.updated_at = finish.finished_at;
        state.executions.insert(finished.id, finished.clone());
        state.dispatch_claims.remove(&finished.id);
        state.dispatch_after.remove(&finished.id);

        let health = if finish.result == ExecutionResult::Passed {
            TagState::Healthy
        } else {
            TagState::Unhealthy
        };
        for tag in state
            .tags
            .iter_mut()
            .filter(|t| t.stage_event_id == finished.stage_event_id)
        {
            tag.state = health;
        }

        state.events.push(finish.completion_event.clone());
        state.apply_fan_out(&finish.fan_out)?;
        Ok(finished)
    }

    async fn last_execution_inputs(
        &self,
        stage_id: Uuid,
        results: &[ExecutionResult],
    ) -> Result<Option<BTreeMap<String, String>>> {
        let state = self.state.lock();
        let last = state
            .executions
            .values()
            .filter(|e| {
                e.stage_id == stage_id
                    && e.state == ExecutionState::Finished
                    && e.result.is_some_and(|r| results.contains(&r))
            })
            .max_by_key(|e| (e.finished_at, e.created_at));
        Ok(last.and_then(|e| {
            state
                .stage_events
                .get(&e.stage_event_id)
                .map(|se| se.inputs.clone())
        }))
    }

    async fn try_acquire_stage_lease(&self, stage_id: Uuid, worker_id: &str, ttl: Duration) -> Result<bool> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        if let Some(lease) = state.stage_leases.get(&stage_id) {
            if lease.worker_id != worker_id && lease.until > now {
                return Ok(false);
            }
        }
        state.stage_leases.insert(
            stage_id,
            Lease {
                worker_id: worker_id.to_string(),
                until: now + ttl,
            },
        );
        Ok(true)
    }

    async fn release_stage_lease(&self, stage_id: Uuid, worker_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        if state
            .stage_leases
            .get(&stage_id)
            .is_some_and(|l| l.worker_id == worker_id)
        {
            state.stage_leases.remove(&stage_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use superplane::model::RunTemplate;
    use superplane::store::NewStageEvent;

    fn stage(canvas_id: Uuid, name: &str) -> Stage {
        Stage::new(
            canvas_id,
            name,
            "u",
            RunTemplate {
                kind: "recording".into(),
                spec: Map::new(),
            },
        )
    }

    fn event(source_id: Uuid) -> Event {
        Event::new(
            source_id,
            "github",
            SourceType::EventSource,
            serde_json::json!({}),
            Default::default(),
        )
    }

    async fn pending_stage_event(store: &MemoryStore, stage: &Stage) -> StageEvent {
        let event = event(Uuid::new_v4());
        store.create_event(&event).await.unwrap();
        let stage_event = StageEvent::new(stage.id, &event, Default::default());
        let mut fan_out = FanOut::new(event.id);
        fan_out.stage_events.push(NewStageEvent {
            stage_event: stage_event.clone(),
            tags: vec![Tag::new(stage_event.id, "VERSION", "v1")],
        });
        store.apply_fan_out(&fan_out).await.unwrap();
        stage_event
    }

    #[tokio::test]
    async fn fan_out_flips_event_state_once() {
        let store = MemoryStore::new();
        let routed = event(Uuid::new_v4());
        let dropped = event(Uuid::new_v4());
        store.create_event(&routed).await.unwrap();
        store.create_event(&dropped).await.unwrap();

        let s = stage(Uuid::new_v4(), "build");
        let mut fan_out = FanOut::new(routed.id);
        fan_out.stage_events.push(NewStageEvent {
            stage_event: StageEvent::new(s.id, &routed, Default::default()),
            tags: vec![],
        });
        store.apply_fan_out(&fan_out).await.unwrap();
        store.apply_fan_out(&FanOut::new(dropped.id)).await.unwrap();

        let events = store.events();
        assert_eq!(events[0].state, EventState::Processed);
        assert_eq!(events[1].state, EventState::Discarded);

        let err = store.apply_fan_out(&fan_out).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn admit_guards_one_active_execution() {
        let store = MemoryStore::new();
        let s = stage(Uuid::new_v4(), "build");
        let first = pending_stage_event(&store, &s).await;
        let second = pending_stage_event(&store, &s).await;

        store.admit(&Execution::new(s.id, first.id)).await.unwrap();
        let again = store.admit(&Execution::new(s.id, first.id)).await.unwrap_err();
        assert!(matches!(again, Error::Conflict(_)));

        let err = store.admit(&Execution::new(s.id, second.id)).await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn healthy_tags_requeue_unhealthy_waiters() {
        let store = MemoryStore::new();
        let s = stage(Uuid::new_v4(), "deploy");
        let stage_event = pending_stage_event(&store, &s).await;
        store
            .transition_stage_event(
                stage_event.id,
                &[StageEventState::Pending],
                StageEventState::Waiting,
                Some(StateReason::Unhealthy),
            )
            .await
            .unwrap();

        let filter = TagFilter {
            name: Some("VERSION".into()),
            value: Some("v1".into()),
            ..Default::default()
        };
        assert!(store
            .update_tag_state(&filter, TagState::Unhealthy)
            .await
            .unwrap()
            .is_empty());

        let requeued = store.update_tag_state(&filter, TagState::Healthy).await.unwrap();
        assert_eq!(requeued.len(), 1);
        assert_eq!(requeued[0].state, StageEventState::Pending);
    }

    #[tokio::test]
    async fn stage_lease_excludes_other_workers_until_released() {
        let store = MemoryStore::new();
        let stage_id = Uuid::new_v4();
        let ttl = Duration::seconds(30);

        assert!(store.try_acquire_stage_lease(stage_id, "a", ttl).await.unwrap());
        assert!(!store.try_acquire_stage_lease(stage_id, "b", ttl).await.unwrap());
        assert!(store.try_acquire_stage_lease(stage_id, "a", ttl).await.unwrap());

        store.release_stage_lease(stage_id, "a").await.unwrap();
        assert!(store.try_acquire_stage_lease(stage_id, "b", ttl).await.unwrap());
    }
}
