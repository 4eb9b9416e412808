//! End-to-end pipeline behavior over the in-memory harness: routing, gates,
//! executions and their completion events.

use std::time::Duration as StdDuration;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Map, Value};

use superplane::model::{
    Condition, EventState, ExecutionResult, ExecutionState, Filter, FilterOperator, InputDefinition,
    InputMapping, OutputDefinition, SourceType, StageEvent, StageEventState, StateReason, TagDefinition,
    TagFilter, TagState, TagUsage, TimeWindow, ValueDefinition,
};
use superplane::{Error, Store};
use superplane_testing::{connection, stage_spec, Harness, ManualClock};

// ============================================================================
// Helpers
// ============================================================================

fn state_of(events: &[StageEvent]) -> Vec<(StageEventState, Option<StateReason>)> {
    events.iter().map(|e| (e.state, e.state_reason)).collect()
}

fn outputs(pairs: &[(&str, &str)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
        .collect()
}

/// Stage events are ordered by arrival time; keep arrivals apart.
async fn tick() {
    tokio::time::sleep(StdDuration::from_millis(3)).await;
}

// ============================================================================
// Routing
// ============================================================================

#[tokio::test]
async fn event_without_accepting_connection_is_discarded() -> Result<()> {
    let harness = Harness::new().await?;
    let canvas = harness.canvas().await?;
    let unused = harness.source(&canvas, "unused").await?;
    let github = harness.source(&canvas, "github").await?;

    let mut spec = stage_spec("build");
    let mut conn = connection("github", SourceType::EventSource);
    conn.filters = vec![Filter::data(r#"ref == "refs/heads/main""#)];
    spec.connections = vec![conn];
    let stage = harness.stage(&canvas, spec).await?;

    let nobody = harness.send(&unused, json!({"ref": "refs/heads/main"})).await?;
    let rejected = harness.send(&github, json!({"ref": "refs/heads/dev"})).await?;
    let accepted = harness.send(&github, json!({"ref": "refs/heads/main"})).await?;
    harness.settle().await?;

    let state = |id| {
        harness
            .store
            .events()
            .into_iter()
            .find(|e| e.id == id)
            .map(|e| e.state)
    };
    assert_eq!(state(nobody.id), Some(EventState::Discarded));
    assert_eq!(state(rejected.id), Some(EventState::Discarded));
    assert_eq!(state(accepted.id), Some(EventState::Processed));

    let events = harness.stage_events(&stage).await?;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_id, accepted.id);
    Ok(())
}

#[tokio::test]
async fn or_accepts_on_any_filter_and_requires_all() -> Result<()> {
    let harness = Harness::new().await?;
    let canvas = harness.canvas().await?;
    let source = harness.source(&canvas, "github").await?;

    let filters = vec![Filter::data("a == 1"), Filter::data("b == 3")];

    let mut any = stage_spec("any");
    let mut conn = connection("github", SourceType::EventSource);
    conn.filters = filters.clone();
    conn.filter_operator = FilterOperator::Or;
    any.connections = vec![conn];
    let any = harness.stage(&canvas, any).await?;

    let mut all = stage_spec("all");
    let mut conn = connection("github", SourceType::EventSource);
    conn.filters = filters;
    conn.filter_operator = FilterOperator::And;
    all.connections = vec![conn];
    let all = harness.stage(&canvas, all).await?;

    harness.send(&source, json!({"a": 1, "b": 2})).await?;
    harness.settle().await?;

    assert_eq!(harness.stage_events(&any).await?.len(), 1);
    assert!(harness.stage_events(&all).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn header_filters_ignore_header_case() -> Result<()> {
    let harness = Harness::new().await?;
    let canvas = harness.canvas().await?;
    let source = harness.source(&canvas, "github").await?;

    let mut spec = stage_spec("build");
    let mut conn = connection("github", SourceType::EventSource);
    conn.filters = vec![Filter::header(r#"headers["X-GitHub-Event"] == "push""#)];
    spec.connections = vec![conn];
    let stage = harness.stage(&canvas, spec).await?;

    let headers = [("x-github-event".to_string(), "push".to_string())].into();
    harness.send_with_headers(&source, json!({}), headers).await?;
    harness.settle().await?;

    assert_eq!(harness.stage_events(&stage).await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn events_that_fail_to_route_stay_pending_and_do_not_count() -> Result<()> {
    let harness = Harness::new().await?;
    let canvas = harness.canvas().await?;
    let github = harness.source(&canvas, "github").await?;
    let mut spec = stage_spec("build");
    spec.connections = vec![connection("github", SourceType::EventSource)];
    let stage = harness.stage(&canvas, spec).await?;

    harness.store.reject_fan_outs(true);
    let event = harness.send(&github, json!({"ref": "main"})).await?;
    assert_eq!(harness.core.router.route_pending(10).await?, 0);
    harness.settle().await?;

    let state = |id| {
        harness
            .store
            .events()
            .into_iter()
            .find(|e| e.id == id)
            .map(|e| e.state)
    };
    assert_eq!(state(event.id), Some(EventState::Pending));
    assert!(harness.stage_events(&stage).await?.is_empty());

    harness.store.reject_fan_outs(false);
    assert_eq!(harness.core.router.route_pending(10).await?, 1);
    assert_eq!(state(event.id), Some(EventState::Processed));
    assert_eq!(harness.stage_events(&stage).await?.len(), 1);
    Ok(())
}

// ============================================================================
// Gates
// ============================================================================

#[tokio::test]
async fn approvals_release_the_event_once_enough_users_approve() -> Result<()> {
    let harness = Harness::new().await?;
    let canvas = harness.canvas().await?;
    let source = harness.source(&canvas, "github").await?;

    let mut spec = stage_spec("deploy");
    spec.connections = vec![connection("github", SourceType::EventSource)];
    spec.conditions = vec![Condition::Approval { count: 2 }];
    let stage = harness.stage(&canvas, spec).await?;

    harness.send(&source, json!({"ref": "main"})).await?;
    harness.settle().await?;

    let events = harness.stage_events(&stage).await?;
    assert_eq!(
        state_of(&events),
        vec![(StageEventState::Waiting, Some(StateReason::Approval))]
    );
    let id = events[0].id;

    let after_a = harness.core.machine.approve(id, "alice").await?;
    assert!(after_a.is_in(StageEventState::Waiting, Some(StateReason::Approval)));

    let again = harness.core.machine.approve(id, "alice").await.unwrap_err();
    assert!(matches!(again, Error::Conflict(_)));

    let after_b = harness.core.machine.approve(id, "bob").await?;
    assert_eq!(after_b.state, StageEventState::Pending);
    harness.settle().await?;

    let events = harness.stage_events(&stage).await?;
    assert_eq!(
        state_of(&events),
        vec![(StageEventState::Processed, Some(StateReason::Execution))]
    );
    let executions = harness.executions(&stage).await?;
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].stage_event_id, id);

    let late = harness.core.machine.approve(id, "carol").await.unwrap_err();
    assert!(matches!(late, Error::Conflict(_)));
    Ok(())
}

#[tokio::test]
async fn time_window_holds_until_rescan_finds_it_open() -> Result<()> {
    // 2024-01-06 is a Saturday, 2024-01-08 a Monday.
    let harness = Harness::with_clock(ManualClock::at("2024-01-06T10:00:00Z")).await?;
    let canvas = harness.canvas().await?;
    let source = harness.source(&canvas, "github").await?;

    let mut spec = stage_spec("deploy");
    spec.connections = vec![connection("github", SourceType::EventSource)];
    spec.conditions = vec![Condition::TimeWindow(TimeWindow::new(
        "08:00",
        "17:00",
        &["Monday", "Tuesday", "Wednesday", "Thursday", "Friday"],
    ))];
    let stage = harness.stage(&canvas, spec).await?;

    harness.send(&source, json!({})).await?;
    harness.settle().await?;
    assert_eq!(
        state_of(&harness.stage_events(&stage).await?),
        vec![(StageEventState::Waiting, Some(StateReason::TimeWindow))]
    );

    // Still closed: nothing moves.
    assert_eq!(harness.core.machine.rescan_time_windows().await?, 0);

    harness
        .clock
        .set(DateTime::parse_from_rfc3339("2024-01-08T09:00:00Z")?.with_timezone(&Utc));
    assert_eq!(harness.core.machine.rescan_time_windows().await?, 1);
    harness.settle().await?;

    assert_eq!(
        state_of(&harness.stage_events(&stage).await?),
        vec![(StageEventState::Processed, Some(StateReason::Execution))]
    );
    assert_eq!(harness.executions(&stage).await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn unhealthy_tag_parks_the_event_until_marked_healthy() -> Result<()> {
    let harness = Harness::new().await?;
    let canvas = harness.canvas().await?;
    let source = harness.source(&canvas, "github").await?;

    let mut spec = stage_spec("deploy");
    spec.connections = vec![connection("github", SourceType::EventSource)];
    spec.tag_usage = Some(TagUsage {
        from: vec!["github".into()],
        tags: vec![TagDefinition {
            name: "VERSION".into(),
            value_from: "version".into(),
        }],
    });
    let stage = harness.stage(&canvas, spec).await?;

    harness.send(&source, json!({"version": "v0"})).await?;
    harness.settle().await?;
    tick().await;
    harness.send(&source, json!({"version": "v1"})).await?;
    harness.settle().await?;

    // The second event queues behind the running execution.
    let events = harness.stage_events(&stage).await?;
    assert_eq!(events[1].state, StageEventState::Pending);
    let held = events[1].id;

    let v1 = TagFilter {
        stage_id: Some(stage.id),
        name: Some("VERSION".into()),
        value: Some("v1".into()),
        ..Default::default()
    };
    harness
        .core
        .machine
        .update_tag_state(&v1, TagState::Unhealthy)
        .await?;

    let running = harness.executions(&stage).await?.remove(0);
    harness
        .core
        .tracker
        .finish(running.id, ExecutionResult::Passed, Map::new())
        .await?;
    harness.settle().await?;

    let parked = harness.core.store.find_stage_event(held).await?;
    assert!(parked.is_some_and(|e| e.is_in(StageEventState::Waiting, Some(StateReason::Unhealthy))));

    let requeued = harness
        .core
        .machine
        .update_tag_state(&v1, TagState::Healthy)
        .await?;
    assert_eq!(requeued.len(), 1);
    assert_eq!(requeued[0].id, held);
    harness.settle().await?;

    let admitted = harness.core.store.find_stage_event(held).await?;
    assert!(admitted.is_some_and(|e| e.is_in(StageEventState::Processed, Some(StateReason::Execution))));
    Ok(())
}

#[tokio::test]
async fn tag_state_update_needs_name_and_value() -> Result<()> {
    let harness = Harness::new().await?;
    let filter = TagFilter {
        name: Some("VERSION".into()),
        ..Default::default()
    };
    let err = harness
        .core
        .machine
        .update_tag_state(&filter, TagState::Healthy)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    Ok(())
}

// ============================================================================
// Queue discipline
// ============================================================================

#[tokio::test]
async fn one_execution_at_a_time_in_arrival_order() -> Result<()> {
    let harness = Harness::new().await?;
    let canvas = harness.canvas().await?;
    let source = harness.source(&canvas, "github").await?;

    let mut spec = stage_spec("build");
    spec.connections = vec![connection("github", SourceType::EventSource)];
    let stage = harness.stage(&canvas, spec).await?;

    for n in 0..3 {
        harness.send(&source, json!({"n": n})).await?;
        tick().await;
    }
    harness.settle().await?;

    let events = harness.stage_events(&stage).await?;
    assert_eq!(
        state_of(&events),
        vec![
            (StageEventState::Processed, Some(StateReason::Execution)),
            (StageEventState::Pending, None),
            (StageEventState::Pending, None),
        ]
    );

    let mut admitted = Vec::new();
    for _ in 0..3 {
        let active: Vec<_> = harness
            .executions(&stage)
            .await?
            .into_iter()
            .filter(|e| e.state.is_active())
            .collect();
        assert_eq!(active.len(), 1);
        admitted.push(active[0].stage_event_id);

        harness
            .core
            .tracker
            .finish(active[0].id, ExecutionResult::Passed, Map::new())
            .await?;
        harness.settle().await?;
    }

    let order: Vec<_> = events.iter().map(|e| e.id).collect();
    assert_eq!(admitted, order);
    assert!(harness
        .executions(&stage)
        .await?
        .iter()
        .all(|e| e.state == ExecutionState::Finished));
    Ok(())
}

#[tokio::test]
async fn event_waiting_for_approval_holds_younger_events() -> Result<()> {
    let harness = Harness::new().await?;
    let canvas = harness.canvas().await?;
    let source = harness.source(&canvas, "github").await?;

    let mut spec = stage_spec("deploy");
    spec.connections = vec![connection("github", SourceType::EventSource)];
    spec.conditions = vec![Condition::Approval { count: 1 }];
    let stage = harness.stage(&canvas, spec).await?;

    harness.send(&source, json!({"n": 1})).await?;
    harness.settle().await?;
    tick().await;
    harness.send(&source, json!({"n": 2})).await?;
    harness.settle().await?;

    let events = harness.stage_events(&stage).await?;
    assert_eq!(
        state_of(&events),
        vec![
            (StageEventState::Waiting, Some(StateReason::Approval)),
            (StageEventState::Pending, None),
        ]
    );

    // Approving the younger one does not let it jump the queue.
    harness.core.machine.approve(events[1].id, "alice").await?;
    harness.settle().await?;
    assert!(harness.executions(&stage).await?.is_empty());

    harness.core.machine.approve(events[0].id, "alice").await?;
    harness.settle().await?;
    let executions = harness.executions(&stage).await?;
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].stage_event_id, events[0].id);
    Ok(())
}

#[tokio::test]
async fn cancelled_event_is_terminal() -> Result<()> {
    let harness = Harness::new().await?;
    let canvas = harness.canvas().await?;
    let source = harness.source(&canvas, "github").await?;

    let mut spec = stage_spec("deploy");
    spec.connections = vec![connection("github", SourceType::EventSource)];
    spec.conditions = vec![Condition::Approval { count: 1 }];
    let stage = harness.stage(&canvas, spec).await?;

    harness.send(&source, json!({})).await?;
    harness.settle().await?;
    let id = harness.stage_events(&stage).await?[0].id;

    let cancelled = harness.core.machine.cancel(id).await?;
    assert!(cancelled.is_in(StageEventState::Processed, Some(StateReason::Cancelled)));

    assert!(matches!(
        harness.core.machine.cancel(id).await.unwrap_err(),
        Error::Conflict(_)
    ));
    assert!(matches!(
        harness.core.machine.approve(id, "alice").await.unwrap_err(),
        Error::Conflict(_)
    ));
    harness.settle().await?;
    assert!(harness.executions(&stage).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn dropping_a_connection_invalidates_its_queued_events() -> Result<()> {
    let harness = Harness::new().await?;
    let canvas = harness.canvas().await?;
    let github = harness.source(&canvas, "github").await?;
    harness.source(&canvas, "gitlab").await?;

    let mut spec = stage_spec("deploy");
    spec.connections = vec![
        connection("github", SourceType::EventSource),
        connection("gitlab", SourceType::EventSource),
    ];
    spec.conditions = vec![Condition::Approval { count: 1 }];
    let stage = harness.stage(&canvas, spec.clone()).await?;

    harness.send(&github, json!({})).await?;
    harness.settle().await?;

    spec.connections = vec![connection("gitlab", SourceType::EventSource)];
    harness
        .core
        .service
        .update_stage(canvas.id, "deploy", spec)
        .await?;

    assert_eq!(
        state_of(&harness.stage_events(&stage).await?),
        vec![(StageEventState::Processed, Some(StateReason::Connection))]
    );
    Ok(())
}

#[tokio::test]
async fn join_waits_for_every_listed_connection() -> Result<()> {
    let harness = Harness::new().await?;
    let canvas = harness.canvas().await?;
    let github = harness.source(&canvas, "github").await?;
    let gitlab = harness.source(&canvas, "gitlab").await?;

    let mut spec = stage_spec("release");
    spec.connections = vec![
        connection("github", SourceType::EventSource),
        connection("gitlab", SourceType::EventSource),
    ];
    spec.tag_usage = Some(TagUsage {
        from: vec!["github".into(), "gitlab".into()],
        tags: vec![TagDefinition {
            name: "VERSION".into(),
            value_from: "version".into(),
        }],
    });
    let stage = harness.stage(&canvas, spec).await?;

    harness.send(&github, json!({"version": "v3"})).await?;
    harness.settle().await?;
    assert_eq!(
        state_of(&harness.stage_events(&stage).await?),
        vec![(StageEventState::Waiting, Some(StateReason::Connection))]
    );
    assert!(harness.executions(&stage).await?.is_empty());

    tick().await;
    harness.send(&gitlab, json!({"version": "v3"})).await?;
    harness.settle().await?;

    let events = harness.stage_events(&stage).await?;
    assert_eq!(
        state_of(&events),
        vec![
            (StageEventState::Processed, Some(StateReason::Cancelled)),
            (StageEventState::Processed, Some(StateReason::Execution)),
        ]
    );
    assert_eq!(events[1].source_name, "gitlab");
    assert_eq!(harness.executions(&stage).await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn join_planned_on_moved_siblings_is_rejected_and_replanned() -> Result<()> {
    let harness = Harness::new().await?;
    let canvas = harness.canvas().await?;
    let github = harness.source(&canvas, "github").await?;
    let gitlab = harness.source(&canvas, "gitlab").await?;

    let mut spec = stage_spec("release");
    spec.connections = vec![
        connection("github", SourceType::EventSource),
        connection("gitlab", SourceType::EventSource),
    ];
    spec.tag_usage = Some(TagUsage {
        from: vec!["github".into(), "gitlab".into()],
        tags: vec![TagDefinition {
            name: "VERSION".into(),
            value_from: "version".into(),
        }],
    });
    let stage = harness.stage(&canvas, spec).await?;

    harness.send(&github, json!({"version": "v4"})).await?;
    harness.settle().await?;
    let sibling = harness.stage_events(&stage).await?[0].clone();

    // Hold the second event back so it can be planned by hand.
    tick().await;
    harness.store.reject_fan_outs(true);
    let event = harness.send(&gitlab, json!({"version": "v4"})).await?;
    harness.store.reject_fan_outs(false);

    let plan = harness.core.router.plan(&event).await?;
    assert_eq!(plan.fan_out.cancelled, vec![sibling.id]);

    harness
        .core
        .service
        .cancel_stage_event(canvas.id, "release", sibling.id)
        .await?;
    let err = harness.core.store.apply_fan_out(&plan.fan_out).await.unwrap_err();
    assert!(err.is_transient());
    assert!(harness
        .store
        .events()
        .iter()
        .any(|e| e.id == event.id && e.state == EventState::Pending));

    // A fresh plan sees no waiting sibling, so the new event waits instead.
    harness.core.router.route(&event).await?;
    assert_eq!(
        state_of(&harness.stage_events(&stage).await?),
        vec![
            (StageEventState::Processed, Some(StateReason::Cancelled)),
            (StageEventState::Waiting, Some(StateReason::Connection)),
        ]
    );
    assert!(harness.executions(&stage).await?.is_empty());
    Ok(())
}

// ============================================================================
// Executions
// ============================================================================

#[tokio::test]
async fn completion_outputs_feed_downstream_inputs() -> Result<()> {
    let harness = Harness::new().await?;
    let canvas = harness.canvas().await?;
    let source = harness.source(&canvas, "github").await?;

    let mut build = stage_spec("build");
    build.connections = vec![connection("github", SourceType::EventSource)];
    build.outputs = vec![OutputDefinition {
        name: "version".into(),
        description: String::new(),
        required: true,
    }];
    let build = harness.stage(&canvas, build).await?;

    let mut deploy = stage_spec("deploy");
    deploy.connections = vec![connection("build", SourceType::Stage)];
    deploy.inputs = vec![InputDefinition {
        name: "V".into(),
        description: String::new(),
    }];
    deploy.input_mappings = vec![InputMapping {
        when: None,
        values: vec![ValueDefinition::from_event(
            "V",
            "build",
            r#"self.Conn("build").version"#,
        )],
    }];
    let deploy = harness.stage(&canvas, deploy).await?;

    harness.send(&source, json!({"ref": "main"})).await?;
    harness.settle().await?;

    let running = harness.executions(&build).await?.remove(0);
    harness
        .core
        .tracker
        .finish(running.id, ExecutionResult::Passed, outputs(&[("version", "v2")]))
        .await?;
    harness.settle().await?;

    let downstream = harness.stage_events(&deploy).await?;
    assert_eq!(downstream.len(), 1);
    assert_eq!(downstream[0].source_type, SourceType::Stage);
    assert_eq!(downstream[0].inputs.get("V").map(String::as_str), Some("v2"));
    assert_eq!(harness.executions(&deploy).await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn missing_required_output_fails_the_execution() -> Result<()> {
    let harness = Harness::new().await?;
    let canvas = harness.canvas().await?;
    let source = harness.source(&canvas, "github").await?;

    let mut spec = stage_spec("build");
    spec.connections = vec![connection("github", SourceType::EventSource)];
    spec.outputs = vec![OutputDefinition {
        name: "version".into(),
        description: String::new(),
        required: true,
    }];
    let stage = harness.stage(&canvas, spec).await?;

    harness.send(&source, json!({})).await?;
    harness.settle().await?;

    let running = harness.executions(&stage).await?.remove(0);
    let recorded = harness
        .core
        .tracker
        .record_outputs(running.id, outputs(&[("artifact", "x"), ("ignored", "y")]))
        .await?;
    assert!(recorded.outputs.is_empty());

    let finished = harness
        .core
        .tracker
        .finish(running.id, ExecutionResult::Passed, Map::new())
        .await?;
    assert_eq!(finished.result, Some(ExecutionResult::Failed));

    let again = harness
        .core
        .tracker
        .finish(running.id, ExecutionResult::Passed, Map::new())
        .await
        .unwrap_err();
    assert!(matches!(again, Error::Conflict(_)));
    Ok(())
}

#[tokio::test]
async fn executor_reported_completion_finishes_immediately() -> Result<()> {
    let harness = Harness::new().await?;
    let canvas = harness.canvas().await?;
    let source = harness.source(&canvas, "github").await?;

    let mut spec = stage_spec("build");
    spec.connections = vec![connection("github", SourceType::EventSource)];
    let stage = harness.stage(&canvas, spec).await?;

    harness
        .executor
        .complete_with(ExecutionResult::Passed, outputs(&[("sha", "abc")]));
    for n in 0..2 {
        harness.send(&source, json!({"n": n})).await?;
        tick().await;
    }
    harness.settle().await?;

    let executions = harness.executions(&stage).await?;
    assert_eq!(executions.len(), 2);
    assert!(executions
        .iter()
        .all(|e| e.result == Some(ExecutionResult::Passed) && e.outputs.contains_key("sha")));
    assert_eq!(harness.executor.requests().len(), 2);
    Ok(())
}

#[tokio::test]
async fn transient_dispatch_failures_are_retried_then_fail() -> Result<()> {
    let harness = Harness::new().await?;
    let canvas = harness.canvas().await?;
    let source = harness.source(&canvas, "github").await?;

    let mut spec = stage_spec("build");
    spec.connections = vec![connection("github", SourceType::EventSource)];
    let stage = harness.stage(&canvas, spec).await?;

    for _ in 0..3 {
        harness
            .executor
            .fail_next(Error::Transient("runner unavailable".into()));
    }
    harness.send(&source, json!({})).await?;
    harness.settle().await?;

    let execution = harness.executions(&stage).await?.remove(0);
    assert_eq!(execution.state, ExecutionState::Pending);
    assert_eq!(execution.dispatch_attempts, 1);

    // Not due yet.
    harness.settle().await?;
    assert_eq!(harness.executor.requests().len(), 1);

    harness.clock.advance(Duration::seconds(10));
    harness.settle().await?;
    assert_eq!(harness.executor.requests().len(), 2);

    harness.store.clear_dispatch_backoff();
    harness.settle().await?;
    assert_eq!(harness.executor.requests().len(), 3);

    let execution = harness.executions(&stage).await?.remove(0);
    assert_eq!(execution.state, ExecutionState::Finished);
    assert_eq!(execution.result, Some(ExecutionResult::Failed));
    assert!(execution.outputs.contains_key("error"));
    Ok(())
}

#[tokio::test]
async fn fatal_dispatch_failure_is_not_retried() -> Result<()> {
    let harness = Harness::new().await?;
    let canvas = harness.canvas().await?;
    let source = harness.source(&canvas, "github").await?;

    let mut spec = stage_spec("build");
    spec.connections = vec![connection("github", SourceType::EventSource)];
    let stage = harness.stage(&canvas, spec).await?;

    harness
        .executor
        .fail_next(Error::Validation("bad run template".into()));
    harness.send(&source, json!({})).await?;
    harness.settle().await?;

    let execution = harness.executions(&stage).await?.remove(0);
    assert_eq!(execution.result, Some(ExecutionResult::Failed));
    assert_eq!(
        execution.outputs.get("error").and_then(Value::as_str),
        Some("bad run template")
    );
    assert_eq!(harness.executor.requests().len(), 1);
    Ok(())
}

#[tokio::test]
async fn cancelling_a_running_execution_tells_the_executor() -> Result<()> {
    let harness = Harness::new().await?;
    let canvas = harness.canvas().await?;
    let source = harness.source(&canvas, "github").await?;

    let mut spec = stage_spec("build");
    spec.connections = vec![connection("github", SourceType::EventSource)];
    let stage = harness.stage(&canvas, spec).await?;

    harness.send(&source, json!({})).await?;
    harness.settle().await?;

    let running = harness.executions(&stage).await?.remove(0);
    assert_eq!(running.state, ExecutionState::Started);
    let reference = running.reference_id.clone().unwrap_or_default();

    let cancelled = harness.core.tracker.cancel(running.id).await?;
    assert_eq!(cancelled.result, Some(ExecutionResult::Failed));
    assert_eq!(harness.executor.cancelled(), vec![reference]);
    assert!(matches!(
        harness.core.tracker.cancel(running.id).await.unwrap_err(),
        Error::Conflict(_)
    ));
    Ok(())
}
