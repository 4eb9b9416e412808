//! Connection filtering and fan-out of raw events into stage events.
//!
//! Routing is split into [`Router::plan`], which reads and evaluates but
//! writes nothing, and [`Store::apply_fan_out`], which writes the whole plan
//! in one transaction. Completion events reuse `plan` so the execution
//! tracker can fold the fan-out into its own finalizing transaction.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::expr::{Evaluator, Variables};
use crate::hub::{Hub, HubEvent};
use crate::inputs::InputBuilder;
use crate::model::{
    Connection, Event, FilterOperator, Stage, StageEvent, StageEventState, StateReason, Tag,
};
use crate::store::{FanOut, NewStageEvent, Store};
use crate::workers::StageNotifier;

/// A fan-out plan plus what is needed to announce it once applied.
#[derive(Debug, Clone, Default)]
pub struct RoutePlan {
    pub fan_out: FanOut,
    /// stage id -> canvas id for every stage receiving a stage event.
    canvases: HashMap<Uuid, Uuid>,
}

#[derive(Clone)]
pub struct Router {
    store: Arc<dyn Store>,
    evaluator: Evaluator,
    inputs: InputBuilder,
    hub: Arc<Hub>,
    notifier: StageNotifier,
}

impl Router {
    pub fn new(store: Arc<dyn Store>, evaluator: Evaluator, hub: Arc<Hub>, notifier: StageNotifier) -> Self {
        let inputs = InputBuilder::new(Arc::clone(&store), evaluator.clone());
        Self {
            store,
            evaluator,
            inputs,
            hub,
            notifier,
        }
    }

    /// Persist an incoming event, then route it.
    ///
    /// A routing failure leaves the event `pending` for the pending-events
    /// worker; the event itself is durable once this returns.
    pub async fn receive(&self, event: Event) -> Result<Event> {
        self.store.create_event(&event).await?;
        if let Err(e) = self.route(&event).await {
            warn!(event_id = %event.id, error = %e, "routing deferred");
        }
        Ok(event)
    }

    /// Route a persisted, pending event.
    pub async fn route(&self, event: &Event) -> Result<FanOut> {
        let plan = self.plan(event).await?;
        self.store.apply_fan_out(&plan.fan_out).await?;
        self.announce(&plan);

        if plan.fan_out.is_discarded() {
            debug!(event_id = %event.id, source = %event.source_name, "event discarded");
        } else {
            info!(
                event_id = %event.id,
                source = %event.source_name,
                stage_events = plan.fan_out.stage_events.len(),
                "event routed"
            );
        }
        Ok(plan.fan_out)
    }

    /// Route up to `limit` pending events, oldest first. Returns how many
    /// left the pending state; events that fail to route stay pending and
    /// are not counted.
    pub async fn route_pending(&self, limit: usize) -> Result<usize> {
        let events = self.store.list_pending_events(limit).await?;
        let mut routed = 0;
        for event in events {
            match self.route(&event).await {
                // A conflict means another worker got there first.
                Ok(_) | Err(Error::Conflict(_)) => routed += 1,
                Err(e) if e.is_transient() => return Err(e),
                Err(e) => error!(event_id = %event.id, error = %e, "failed to route event"),
            }
        }
        Ok(routed)
    }

    /// Decide which stages receive the event, without writing.
    pub async fn plan(&self, event: &Event) -> Result<RoutePlan> {
        let connections = self
            .store
            .list_connections_for_source(event.source_id, event.source_type)
            .await?;

        let mut plan = RoutePlan {
            fan_out: FanOut::new(event.id),
            canvases: HashMap::new(),
        };

        for connection in connections {
            if !self.accepts(&connection, event).await {
                continue;
            }

            let Some(stage) = self.store.find_stage(connection.stage_id).await? else {
                warn!(stage_id = %connection.stage_id, "connection targets a missing stage");
                continue;
            };
            let stage_connections = self.store.list_connections_for_stage(stage.id).await?;

            match self.stage_event(&stage, &stage_connections, event).await {
                Ok((new, cancelled)) => {
                    plan.canvases.insert(stage.id, stage.canvas_id);
                    plan.fan_out.stage_events.push(new);
                    plan.fan_out.cancelled.extend(cancelled);
                }
                Err(e) if e.is_transient() => return Err(e),
                Err(e) => error!(
                    event_id = %event.id,
                    stage_id = %stage.id,
                    error = %e,
                    "skipping stage event"
                ),
            }
        }

        Ok(plan)
    }

    /// Wake the stage workers and notify subscribers about applied stage events.
    pub fn announce(&self, plan: &RoutePlan) {
        for new in &plan.fan_out.stage_events {
            let stage_event = &new.stage_event;
            self.notifier.notify(stage_event.stage_id);
            if let Some(canvas_id) = plan.canvases.get(&stage_event.stage_id) {
                self.hub.publish(*canvas_id, HubEvent::NewStageEvent, stage_event);
            }
        }
    }

    /// Whether the event passes the connection's filters.
    ///
    /// Both filter kinds see the promoted body and the `headers` object; the
    /// kind only documents intent. An evaluation error rejects the event for
    /// this connection.
    pub async fn accepts(&self, connection: &Connection, event: &Event) -> bool {
        if connection.filters.is_empty() {
            return true;
        }

        let vars = Variables::for_event(event);
        for filter in &connection.filters {
            match self.evaluator.eval_bool(filter.expression(), &vars).await {
                Ok(true) if connection.filter_operator == FilterOperator::Or => return true,
                Ok(false) if connection.filter_operator == FilterOperator::And => return false,
                Ok(_) => {}
                Err(e) => {
                    warn!(
                        connection_id = %connection.id,
                        event_id = %event.id,
                        filter = filter.kind(),
                        error = %e,
                        "filter evaluation failed"
                    );
                    return false;
                }
            }
        }

        connection.filter_operator == FilterOperator::And
    }

    async fn stage_event(
        &self,
        stage: &Stage,
        connections: &[Connection],
        event: &Event,
    ) -> Result<(NewStageEvent, Vec<Uuid>)> {
        let inputs = self.inputs.build(stage, connections, event).await?;
        let mut stage_event = StageEvent::new(stage.id, event, inputs);
        let tags = self.tags(stage, &stage_event, event).await?;
        let cancelled = self.join(stage, &mut stage_event).await?;

        Ok((NewStageEvent { stage_event, tags }, cancelled))
    }

    async fn tags(&self, stage: &Stage, stage_event: &StageEvent, event: &Event) -> Result<Vec<Tag>> {
        let Some(usage) = &stage.tag_usage else {
            return Ok(Vec::new());
        };
        if !usage.from.iter().any(|name| *name == event.source_name) {
            return Ok(Vec::new());
        }

        let vars = Variables::for_event(event);
        let mut tags = Vec::with_capacity(usage.tags.len());
        for definition in &usage.tags {
            let value = self.evaluator.eval_string(&definition.value_from, &vars).await?;
            tags.push(Tag::new(stage_event.id, definition.name.clone(), value));
        }
        Ok(tags)
    }

    /// Multi-connection join over `tag_usage.from`.
    ///
    /// Until every other listed connection has a `waiting(connection)` event
    /// the new event waits too. The event that completes the set is pending
    /// and the waiting siblings are returned for cancellation.
    async fn join(&self, stage: &Stage, stage_event: &mut StageEvent) -> Result<Vec<Uuid>> {
        let Some(usage) = &stage.tag_usage else {
            return Ok(Vec::new());
        };
        if usage.from.len() < 2 || !usage.from.contains(&stage_event.source_name) {
            return Ok(Vec::new());
        }

        let waiting: Vec<StageEvent> = self
            .store
            .list_stage_events(stage.id, &[StageEventState::Waiting])
            .await?
            .into_iter()
            .filter(|e| e.state_reason == Some(StateReason::Connection))
            .collect();

        let present: BTreeSet<&str> = waiting.iter().map(|e| e.source_name.as_str()).collect();
        let complete = usage
            .from
            .iter()
            .filter(|name| **name != stage_event.source_name)
            .all(|name| present.contains(name.as_str()));

        if complete {
            Ok(waiting.iter().map(|e| e.id).collect())
        } else {
            stage_event.state = StageEventState::Waiting;
            stage_event.state_reason = Some(StateReason::Connection);
            Ok(Vec::new())
        }
    }
}
