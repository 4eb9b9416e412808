//! The stage state machine.
//!
//! [`decide`] is pure: given a snapshot of one pending stage event and its
//! surroundings it returns what should happen. [`StageMachine`] gathers the
//! snapshot, applies the decision through the store, and hands admitted
//! executions to the tracker.
//!
//! Gate order for the oldest pending stage event of a stage:
//!
//! 1. an active execution exists: stay pending
//! 2. an older stage event is held at a gate: stay pending
//! 3. too few approvals: `waiting(approval)`
//! 4. outside any time window: `waiting(time-window)`
//! 5. an unhealthy tag: `waiting(unhealthy)`
//! 6. otherwise admit: a pending execution is created and the stage event
//!    becomes `processed(execution)`
//!
//! Gate evaluation for a stage runs under the stage lease, so at most one
//! worker admits for a stage at a time.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::hub::{Hub, HubEvent};
use crate::model::{
    Approval, Execution, Stage, StageEvent, StageEventState, StateReason, Tag, TagFilter, TagState,
};
use crate::store::{Required, Store};
use crate::tracker::ExecutionTracker;
use crate::workers::StageNotifier;

#[derive(Debug, Clone)]
pub struct MachineConfig {
    /// How long a stage lease is held before another worker may take over.
    pub lease_ttl: Duration,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Leave the stage event pending and stop processing the stage.
    Hold,
    /// Park the stage event.
    Wait(StateReason),
    Admit,
}

/// Everything a decision depends on.
#[derive(Debug, Clone)]
pub struct Snapshot<'a> {
    pub stage: &'a Stage,
    pub stage_event: &'a StageEvent,
    pub has_active_execution: bool,
    /// An older stage event of the stage waits on a gate.
    pub older_event_held: bool,
    pub approvals: usize,
    pub tags: &'a [Tag],
    pub now: DateTime<Utc>,
}

pub fn decide(snapshot: &Snapshot<'_>) -> Decision {
    if snapshot.has_active_execution || snapshot.older_event_held {
        return Decision::Hold;
    }

    if let Some(required) = snapshot.stage.approvals_required() {
        if snapshot.approvals < required as usize {
            return Decision::Wait(StateReason::Approval);
        }
    }

    if snapshot
        .stage
        .time_windows()
        .any(|window| !window.contains(snapshot.now))
    {
        return Decision::Wait(StateReason::TimeWindow);
    }

    if snapshot.tags.iter().any(|t| t.state == TagState::Unhealthy) {
        return Decision::Wait(StateReason::Unhealthy);
    }

    Decision::Admit
}

/// What one pass over a stage did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageOutcome {
    /// Stage events moved to `waiting`.
    pub parked: Vec<(Uuid, StateReason)>,
    pub admitted: Option<Execution>,
    /// Another worker holds the stage lease.
    pub skipped: bool,
}

#[derive(Clone)]
pub struct StageMachine {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    hub: Arc<Hub>,
    notifier: StageNotifier,
    tracker: ExecutionTracker,
    config: MachineConfig,
}

impl StageMachine {
    pub fn new(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        hub: Arc<Hub>,
        notifier: StageNotifier,
        tracker: ExecutionTracker,
        config: MachineConfig,
    ) -> Self {
        Self {
            store,
            clock,
            hub,
            notifier,
            tracker,
            config,
        }
    }

    /// Run the gate ladder for a stage, then dispatch what was admitted.
    pub async fn process_stage(&self, stage_id: Uuid, worker_id: &str) -> Result<StageOutcome> {
        let ttl = chrono::Duration::from_std(self.config.lease_ttl)
            .map_err(|e| Error::Config(format!("invalid lease ttl: {e}")))?;
        if !self.store.try_acquire_stage_lease(stage_id, worker_id, ttl).await? {
            debug!(%stage_id, worker_id, "stage leased elsewhere");
            return Ok(StageOutcome {
                skipped: true,
                ..Default::default()
            });
        }

        let result = self.run_gates(stage_id).await;
        if let Err(e) = self.store.release_stage_lease(stage_id, worker_id).await {
            warn!(%stage_id, error = %e, "failed to release stage lease");
        }
        let (stage, outcome) = result?;

        if let Some(execution) = &outcome.admitted {
            self.hub
                .publish_execution(stage.canvas_id, HubEvent::ExecutionCreated, execution);
            if let Err(e) = self.tracker.dispatch(execution.id, worker_id).await {
                warn!(execution_id = %execution.id, error = %e, "dispatch failed; sweeper will retry");
            }
        }

        Ok(outcome)
    }

    async fn run_gates(&self, stage_id: Uuid) -> Result<(Stage, StageOutcome)> {
        let stage = self.store.find_stage(stage_id).await.required(format!("stage {stage_id}"))?;
        let mut outcome = StageOutcome::default();

        while let Some(stage_event) = self.store.oldest_pending_stage_event(stage_id).await? {
            let has_active_execution = self.store.active_execution(stage_id).await?.is_some();
            let older_event_held = self
                .store
                .list_stage_events(stage_id, &[StageEventState::Waiting])
                .await?
                .iter()
                .any(|w| {
                    w.state_reason.is_some_and(|r| r.blocks_queue())
                        && (w.created_at, w.id) < (stage_event.created_at, stage_event.id)
                });
            let approvals = match stage.approvals_required() {
                Some(_) => self.store.list_approvals(stage_event.id).await?.len(),
                None => 0,
            };
            let tags = self.store.list_tags(stage_event.id).await?;

            let snapshot = Snapshot {
                stage: &stage,
                stage_event: &stage_event,
                has_active_execution,
                older_event_held,
                approvals,
                tags: &tags,
                now: self.clock.now(),
            };

            match decide(&snapshot) {
                Decision::Hold => break,
                Decision::Wait(reason) => {
                    let moved = self
                        .store
                        .transition_stage_event(
                            stage_event.id,
                            &[StageEventState::Pending],
                            StageEventState::Waiting,
                            Some(reason),
                        )
                        .await?;
                    if moved.is_some() {
                        info!(
                            %stage_id,
                            stage_event_id = %stage_event.id,
                            reason = reason.as_str(),
                            "stage event waiting"
                        );
                        outcome.parked.push((stage_event.id, reason));
                    }
                }
                Decision::Admit => {
                    let execution = Execution::new(stage_id, stage_event.id);
                    match self.store.admit(&execution).await {
                        Ok(()) => {
                            info!(
                                %stage_id,
                                stage_event_id = %stage_event.id,
                                execution_id = %execution.id,
                                "stage event admitted"
                            );
                            outcome.admitted = Some(execution);
                            break;
                        }
                        // Cancelled or moved concurrently; look at the next one.
                        Err(Error::Conflict(_)) => continue,
                        Err(e) => return Err(e),
                    }
                }
            }
        }

        Ok((stage, outcome))
    }

    pub async fn stages_with_pending_events(&self) -> Result<Vec<Uuid>> {
        self.store.stages_with_pending_events().await
    }

    /// Requeue `waiting(time-window)` stage events whose windows are open.
    pub async fn rescan_time_windows(&self) -> Result<usize> {
        let waiting = self.store.stage_events_waiting_for_time_window().await?;
        let now = self.clock.now();
        let mut stages: HashMap<Uuid, Option<Stage>> = HashMap::new();
        let mut requeued = 0;

        for stage_event in waiting {
            if !stages.contains_key(&stage_event.stage_id) {
                let stage = self.store.find_stage(stage_event.stage_id).await?;
                stages.insert(stage_event.stage_id, stage);
            }
            let Some(Some(stage)) = stages.get(&stage_event.stage_id) else {
                continue;
            };
            if !stage.time_windows().all(|w| w.contains(now)) {
                continue;
            }

            let moved = self
                .store
                .transition_stage_event(
                    stage_event.id,
                    &[StageEventState::Waiting],
                    StageEventState::Pending,
                    None,
                )
                .await?;
            if moved.is_some() {
                debug!(stage_event_id = %stage_event.id, "time window open");
                requeued += 1;
                self.notifier.notify(stage_event.stage_id);
            }
        }

        Ok(requeued)
    }

    /// Record an approval. Reaching the required count releases a
    /// `waiting(approval)` stage event back to `pending`.
    pub async fn approve(&self, stage_event_id: Uuid, user_id: &str) -> Result<StageEvent> {
        let mut stage_event = self
            .store
            .find_stage_event(stage_event_id)
            .await
            .required("stage event")?;
        if stage_event.is_terminal() {
            return Err(Error::Conflict("stage event already processed".into()));
        }

        self.store
            .approve_stage_event(&Approval {
                stage_event_id,
                approved_by: user_id.to_string(),
                approved_at: self.clock.now(),
            })
            .await?;

        let stage = self.store.find_stage(stage_event.stage_id).await.required("stage")?;
        let approvals = self.store.list_approvals(stage_event_id).await?.len();
        let required = stage.approvals_required().unwrap_or(0) as usize;
        info!(%stage_event_id, user_id, approvals, required, "stage event approved");

        if stage_event.is_in(StageEventState::Waiting, Some(StateReason::Approval)) && approvals >= required {
            if let Some(updated) = self
                .store
                .transition_stage_event(
                    stage_event_id,
                    &[StageEventState::Waiting],
                    StageEventState::Pending,
                    None,
                )
                .await?
            {
                stage_event = updated;
            }
        }

        self.hub
            .publish(stage.canvas_id, HubEvent::StageEventApproved, &stage_event);
        self.notifier.notify(stage.id);
        Ok(stage_event)
    }

    /// Operator cancellation of a pending or waiting stage event.
    pub async fn cancel(&self, stage_event_id: Uuid) -> Result<StageEvent> {
        let cancelled = self
            .store
            .transition_stage_event(
                stage_event_id,
                &[StageEventState::Pending, StageEventState::Waiting],
                StageEventState::Processed,
                Some(StateReason::Cancelled),
            )
            .await?;

        match cancelled {
            Some(stage_event) => {
                info!(%stage_event_id, "stage event cancelled");
                self.notifier.notify(stage_event.stage_id);
                Ok(stage_event)
            }
            None => match self.store.find_stage_event(stage_event_id).await? {
                Some(_) => Err(Error::Conflict("stage event already processed".into())),
                None => Err(Error::not_found("stage event")),
            },
        }
    }

    /// Set tag health. Unblocked stage events are requeued atomically with
    /// the update, and their stages woken.
    pub async fn update_tag_state(&self, filter: &TagFilter, state: TagState) -> Result<Vec<StageEvent>> {
        if filter.name.is_none() || filter.value.is_none() {
            return Err(Error::Validation("tag name and value are required".into()));
        }

        let requeued = self.store.update_tag_state(filter, state).await?;
        info!(
            name = filter.name.as_deref().unwrap_or_default(),
            value = filter.value.as_deref().unwrap_or_default(),
            state = state.as_str(),
            requeued = requeued.len(),
            "tag state updated"
        );
        for stage_event in &requeued {
            self.notifier.notify(stage_event.stage_id);
        }
        Ok(requeued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    use crate::model::{Condition, Event, RunTemplate, SourceType, TimeWindow};

    fn stage(conditions: Vec<Condition>) -> Stage {
        let mut stage = Stage::new(
            Uuid::new_v4(),
            "deploy",
            "u",
            RunTemplate {
                kind: "http".into(),
                spec: Default::default(),
            },
        );
        stage.conditions = conditions;
        stage
    }

    fn stage_event(stage: &Stage) -> StageEvent {
        let event = Event::new(
            Uuid::new_v4(),
            "github",
            SourceType::EventSource,
            serde_json::json!({}),
            Default::default(),
        );
        StageEvent::new(stage.id, &event, Default::default())
    }

    // 2024-01-08 is a Monday.
    fn monday(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 8, hour, 0, 0).unwrap()
    }

    fn snapshot<'a>(stage: &'a Stage, event: &'a StageEvent, tags: &'a [Tag]) -> Snapshot<'a> {
        Snapshot {
            stage,
            stage_event: event,
            has_active_execution: false,
            older_event_held: false,
            approvals: 0,
            tags,
            now: monday(10),
        }
    }

    #[test]
    fn active_execution_holds_before_any_gate() {
        let stage = stage(vec![Condition::Approval { count: 1 }]);
        let event = stage_event(&stage);
        let mut snap = snapshot(&stage, &event, &[]);
        snap.has_active_execution = true;
        assert_eq!(decide(&snap), Decision::Hold);
    }

    #[test]
    fn older_held_event_holds_younger() {
        let stage = stage(vec![]);
        let event = stage_event(&stage);
        let mut snap = snapshot(&stage, &event, &[]);
        snap.older_event_held = true;
        assert_eq!(decide(&snap), Decision::Hold);
    }

    #[test]
    fn approval_gate_counts_distinct_approvals() {
        let stage = stage(vec![Condition::Approval { count: 2 }]);
        let event = stage_event(&stage);
        let mut snap = snapshot(&stage, &event, &[]);

        snap.approvals = 1;
        assert_eq!(decide(&snap), Decision::Wait(StateReason::Approval));
        snap.approvals = 2;
        assert_eq!(decide(&snap), Decision::Admit);
    }

    #[test]
    fn approval_is_checked_before_time_window() {
        let stage = stage(vec![
            Condition::TimeWindow(TimeWindow::new("08:00", "09:00", &["Monday"])),
            Condition::Approval { count: 1 },
        ]);
        let event = stage_event(&stage);
        let snap = snapshot(&stage, &event, &[]);
        assert_eq!(decide(&snap), Decision::Wait(StateReason::Approval));
    }

    #[test]
    fn every_time_window_must_be_open() {
        let stage = stage(vec![Condition::TimeWindow(TimeWindow::new(
            "08:00",
            "17:00",
            &["Monday", "Tuesday", "Wednesday", "Thursday", "Friday"],
        ))]);
        let event = stage_event(&stage);
        let mut snap = snapshot(&stage, &event, &[]);

        assert_eq!(decide(&snap), Decision::Admit);
        snap.now = monday(18);
        assert_eq!(decide(&snap), Decision::Wait(StateReason::TimeWindow));
    }

    #[test]
    fn unhealthy_tag_parks_the_event() {
        let stage = stage(vec![]);
        let event = stage_event(&stage);
        let mut tag = Tag::new(event.id, "VERSION", "v1");
        tag.state = TagState::Unhealthy;
        let tags = [tag];
        assert_eq!(
            decide(&snapshot(&stage, &event, &tags)),
            Decision::Wait(StateReason::Unhealthy)
        );
    }
}
