//! Background loops that drive the pipeline.
//!
//! Each loop runs until its [`CancellationToken`] fires. Notifications are
//! a latency optimization only: every loop also polls the store, so a lost
//! notification delays work but never loses it.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, Instrument};
use uuid::Uuid;

use crate::error::Result;
use crate::machine::StageMachine;
use crate::router::Router;
use crate::tracker::ExecutionTracker;

/// Wakes the stage worker for a stage.
#[derive(Debug, Clone)]
pub struct StageNotifier {
    sender: mpsc::Sender<Uuid>,
}

impl StageNotifier {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Uuid>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }

    /// A notifier whose notifications go nowhere. For components driven by
    /// polling alone.
    pub fn detached() -> Self {
        let (notifier, _) = Self::channel(1);
        notifier
    }

    pub fn notify(&self, stage_id: Uuid) {
        if let Err(e) = self.sender.try_send(stage_id) {
            debug!(%stage_id, error = %e, "stage notification dropped");
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Identity used for stage leases and execution claims.
    pub worker_id: String,
    /// First delay after an empty poll of pending events or due executions.
    pub idle_poll_min: Duration,
    /// Ceiling the idle delay doubles up to.
    pub idle_poll_max: Duration,
    pub pending_events_batch: usize,
    /// Full scan of stages with pending stage events.
    pub stage_scan_interval: Duration,
    pub time_window_interval: Duration,
    pub dispatch_batch: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::new_v4()),
            idle_poll_min: Duration::from_millis(100),
            idle_poll_max: Duration::from_secs(5),
            pending_events_batch: 100,
            stage_scan_interval: Duration::from_secs(5),
            time_window_interval: Duration::from_secs(30),
            dispatch_batch: 20,
        }
    }
}

/// Exponential backoff with jitter, for idle polls and store errors.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_secs(5))
    }
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Next delay: the current step plus up to 10% jitter. Doubles the step.
    pub fn next_delay(&mut self) -> Duration {
        let step = self.current;
        self.current = (self.current * 2).min(self.max);
        let jitter_ms = (step.as_millis() as u64 / 10).max(1);
        step + Duration::from_millis(fastrand::u64(0..=jitter_ms))
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// The pipeline's background loops.
pub struct Workers {
    router: Router,
    machine: StageMachine,
    tracker: ExecutionTracker,
    config: WorkerConfig,
}

impl Workers {
    pub fn new(router: Router, machine: StageMachine, tracker: ExecutionTracker, config: WorkerConfig) -> Self {
        Self {
            router,
            machine,
            tracker,
            config,
        }
    }

    /// Spawn every loop. `notifications` is the receiving end of the
    /// [`StageNotifier`] the router, machine and tracker were built with.
    pub fn spawn(
        self,
        notifications: mpsc::Receiver<Uuid>,
        shutdown: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        let worker_id = self.config.worker_id.clone();
        info!(worker_id, "starting workers");

        vec![
            tokio::spawn(
                pending_events_loop(self.router, self.config.clone(), shutdown.clone())
                    .instrument(info_span!("pending_events", worker_id = %worker_id)),
            ),
            tokio::spawn(
                stage_loop(self.machine.clone(), notifications, self.config.clone(), shutdown.clone())
                    .instrument(info_span!("stages", worker_id = %worker_id)),
            ),
            tokio::spawn(
                time_window_loop(self.machine, self.config.clone(), shutdown.clone())
                    .instrument(info_span!("time_windows", worker_id = %worker_id)),
            ),
            tokio::spawn(
                dispatch_loop(self.tracker, self.config, shutdown)
                    .instrument(info_span!("dispatch", worker_id = %worker_id)),
            ),
        ]
    }
}

/// Sleep for `delay` unless shutdown fires first. Returns false on shutdown.
async fn pause(shutdown: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

/// Delay before the next tick of a polling loop.
///
/// Busy ticks go again at once. Empty ticks and failures each back off on
/// their own schedule, reset by the next busy tick.
#[derive(Debug, Clone)]
struct Pacer {
    idle: Backoff,
    errors: Backoff,
}

impl Pacer {
    fn new(idle: Backoff) -> Self {
        Self {
            idle,
            errors: Backoff::default(),
        }
    }

    fn after(&mut self, outcome: &Result<usize>) -> Duration {
        match outcome {
            Ok(0) => {
                self.errors.reset();
                self.idle.next_delay()
            }
            // More work may be queued.
            Ok(_) => {
                self.idle.reset();
                self.errors.reset();
                Duration::ZERO
            }
            Err(_) => self.errors.next_delay(),
        }
    }
}

/// Run `tick` until shutdown, paced by a [`Pacer`] over `idle`.
async fn poll<F, Fut>(shutdown: CancellationToken, idle: Backoff, mut tick: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<usize>>,
{
    let mut pacer = Pacer::new(idle);
    loop {
        let outcome = tick().await;
        let delay = pacer.after(&outcome);
        if let Err(e) = &outcome {
            error!(error = %e, ?delay, "worker tick failed");
        }
        if !pause(&shutdown, delay).await {
            break;
        }
    }
    info!("worker stopped");
}

fn idle_backoff(config: &WorkerConfig) -> Backoff {
    Backoff::new(config.idle_poll_min, config.idle_poll_max.max(config.idle_poll_min))
}

async fn pending_events_loop(router: Router, config: WorkerConfig, shutdown: CancellationToken) {
    let batch = config.pending_events_batch;
    poll(shutdown, idle_backoff(&config), || {
        let router = router.clone();
        // A short batch means the queue is drained, or what is left keeps
        // failing.
        async move { router.route_pending(batch).await.map(|n| if n < batch { 0 } else { n }) }
    })
    .await;
}

async fn time_window_loop(machine: StageMachine, config: WorkerConfig, shutdown: CancellationToken) {
    let every = Backoff::new(config.time_window_interval, config.time_window_interval);
    poll(shutdown, every, || {
        let machine = machine.clone();
        async move {
            // Requeued events are picked up through their notifications.
            machine.rescan_time_windows().await.map(|_| 0)
        }
    })
    .await;
}

async fn dispatch_loop(tracker: ExecutionTracker, config: WorkerConfig, shutdown: CancellationToken) {
    let batch = config.dispatch_batch;
    let worker_id = config.worker_id.clone();
    poll(shutdown, idle_backoff(&config), || {
        let tracker = tracker.clone();
        let worker_id = worker_id.clone();
        async move {
            tracker
                .dispatch_pending(&worker_id, batch)
                .await
                .map(|n| if n < batch { 0 } else { n })
        }
    })
    .await;
}

/// Process stages as notifications arrive, plus a periodic full scan.
///
/// Each stage pass runs as its own task, so a slow dispatch holds up only
/// its own stage. A stage notified mid-pass is processed again once the pass
/// ends.
async fn stage_loop(
    machine: StageMachine,
    mut notifications: mpsc::Receiver<Uuid>,
    config: WorkerConfig,
    shutdown: CancellationToken,
) {
    let mut scan = tokio::time::interval(config.stage_scan_interval);
    scan.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let mut passes: JoinSet<Uuid> = JoinSet::new();
    let mut in_flight: HashMap<Uuid, AbortHandle> = HashMap::new();
    let mut rerun: HashSet<Uuid> = HashSet::new();

    loop {
        let stages: Vec<Uuid> = tokio::select! {
            _ = shutdown.cancelled() => break,
            Some(done) = passes.join_next() => match done {
                Ok(stage_id) => {
                    in_flight.remove(&stage_id);
                    if !rerun.remove(&stage_id) {
                        continue;
                    }
                    vec![stage_id]
                }
                Err(e) => {
                    error!(error = %e, "stage pass aborted");
                    in_flight.retain(|_, pass| !pass.is_finished());
                    continue;
                }
            },
            Some(stage_id) = notifications.recv() => {
                // Coalesce a burst of notifications.
                let mut batch = HashSet::from([stage_id]);
                while let Ok(next) = notifications.try_recv() {
                    batch.insert(next);
                }
                batch.into_iter().collect()
            }
            _ = scan.tick() => match machine.stages_with_pending_events().await {
                Ok(stages) => stages,
                Err(e) => {
                    error!(error = %e, "failed to scan stages");
                    continue;
                }
            },
        };

        for stage_id in stages {
            if in_flight.contains_key(&stage_id) {
                rerun.insert(stage_id);
                continue;
            }
            let machine = machine.clone();
            let worker_id = config.worker_id.clone();
            let pass = passes.spawn(
                async move {
                    if let Err(e) = machine.process_stage(stage_id, &worker_id).await {
                        error!(%stage_id, error = %e, "failed to process stage");
                    }
                    stage_id
                }
                .in_current_span(),
            );
            in_flight.insert(stage_id, pass);
        }
    }

    // Let passes already underway finish their dispatch.
    while passes.join_next().await.is_some() {}
    info!("worker stopped");
}

/// Drain everything the loops would eventually do, synchronously.
///
/// Routes pending events, processes every stage with pending stage events,
/// and dispatches due executions until a pass makes no progress.
pub async fn settle(
    router: &Router,
    machine: &StageMachine,
    tracker: &ExecutionTracker,
    worker_id: &str,
) -> Result<()> {
    const MAX_PASSES: usize = 100;
    for _ in 0..MAX_PASSES {
        let mut progress = router.route_pending(usize::MAX).await?;
        for stage_id in machine.stages_with_pending_events().await? {
            let outcome = machine.process_stage(stage_id, worker_id).await?;
            progress += outcome.parked.len() + usize::from(outcome.admitted.is_some());
        }
        progress += tracker.dispatch_pending(worker_id, usize::MAX).await?;
        if progress == 0 {
            return Ok(());
        }
    }
    Ok(())
}
