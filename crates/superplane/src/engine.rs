//! Wiring of the pipeline components.
//!
//! [`CoreBuilder`] threads one store, one policy enforcer and one hub through
//! every component, so nothing lives in a global and each test can build an
//! isolated core.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::authz::interceptor::Interceptor;
use crate::authz::{Enforcer, EnforcerConfig, PolicyStore};
use crate::clock::{Clock, SystemClock};
use crate::crypto::{Encryptor, JwtSigner};
use crate::error::{Error, Result};
use crate::executor::{Executor, ExecutorConfig, ExecutorRegistry};
use crate::expr::Evaluator;
use crate::hub::{Hub, HubConfig};
use crate::machine::{MachineConfig, StageMachine};
use crate::resolver::SpecResolver;
use crate::router::Router;
use crate::service::Service;
use crate::store::Store;
use crate::tracker::{ExecutionTracker, TrackerConfig};
use crate::workers::{self, StageNotifier, WorkerConfig, Workers};

const NOTIFICATION_CAPACITY: usize = 1024;

pub struct CoreBuilder {
    store: Arc<dyn Store>,
    policy_store: Arc<dyn PolicyStore>,
    encryptor: Arc<dyn Encryptor>,
    signer: JwtSigner,
    clock: Arc<dyn Clock>,
    evaluator: Evaluator,
    executors: Vec<(String, Arc<dyn Executor>)>,
    executor_config: ExecutorConfig,
    enforcer_config: EnforcerConfig,
    hub_config: HubConfig,
    machine_config: MachineConfig,
    tracker_config: TrackerConfig,
    worker_config: WorkerConfig,
}

impl CoreBuilder {
    pub fn new(
        store: Arc<dyn Store>,
        policy_store: Arc<dyn PolicyStore>,
        encryptor: Arc<dyn Encryptor>,
        jwt_secret: &[u8],
    ) -> Self {
        Self {
            store,
            policy_store,
            encryptor,
            signer: JwtSigner::new(jwt_secret),
            clock: Arc::new(SystemClock),
            evaluator: Evaluator::new(),
            executors: Vec::new(),
            executor_config: ExecutorConfig::default(),
            enforcer_config: EnforcerConfig::default(),
            hub_config: HubConfig::default(),
            machine_config: MachineConfig::default(),
            tracker_config: TrackerConfig::default(),
            worker_config: WorkerConfig::default(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_evaluator(mut self, evaluator: Evaluator) -> Self {
        self.evaluator = evaluator;
        self
    }

    /// Register an executor for a run template type, replacing any built-in
    /// one of the same type.
    pub fn with_executor(mut self, kind: impl Into<String>, executor: Arc<dyn Executor>) -> Self {
        self.executors.push((kind.into(), executor));
        self
    }

    pub fn with_executor_config(mut self, config: ExecutorConfig) -> Self {
        self.tracker_config.dispatch_timeout = config.timeout;
        self.executor_config = config;
        self
    }

    pub fn with_enforcer_config(mut self, config: EnforcerConfig) -> Self {
        self.enforcer_config = config;
        self
    }

    pub fn with_hub_config(mut self, config: HubConfig) -> Self {
        self.hub_config = config;
        self
    }

    pub fn with_machine_config(mut self, config: MachineConfig) -> Self {
        self.machine_config = config;
        self
    }

    pub fn with_tracker_config(mut self, config: TrackerConfig) -> Self {
        self.tracker_config = config;
        self
    }

    pub fn with_worker_config(mut self, config: WorkerConfig) -> Self {
        self.worker_config = config;
        self
    }

    /// Load persisted policy rules and assemble every component.
    pub async fn build(self) -> Result<Core> {
        let enforcer = Arc::new(Enforcer::new(self.policy_store, self.enforcer_config).await?);
        let hub = Arc::new(Hub::new(self.hub_config));
        let (notifier, notifications) = StageNotifier::channel(NOTIFICATION_CAPACITY);

        let mut registry = ExecutorRegistry::with_defaults(&self.executor_config);
        for (kind, executor) in self.executors {
            registry.register(kind, executor);
        }
        let executors = Arc::new(registry);

        let router = Router::new(
            Arc::clone(&self.store),
            self.evaluator.clone(),
            Arc::clone(&hub),
            notifier.clone(),
        );
        let tracker = ExecutionTracker::new(
            Arc::clone(&self.store),
            Arc::clone(&self.encryptor),
            self.signer.clone(),
            Arc::clone(&executors),
            SpecResolver::new(self.evaluator.clone()),
            router.clone(),
            Arc::clone(&hub),
            notifier.clone(),
            Arc::clone(&self.clock),
            self.tracker_config,
        );
        let machine = StageMachine::new(
            Arc::clone(&self.store),
            Arc::clone(&self.clock),
            Arc::clone(&hub),
            notifier,
            tracker.clone(),
            self.machine_config,
        );
        let interceptor = Arc::new(Interceptor::new(Arc::clone(&enforcer), Arc::clone(&self.store)));
        let service = Service::new(
            Arc::clone(&self.store),
            Arc::clone(&enforcer),
            self.encryptor,
            executors,
            self.evaluator,
            Arc::clone(&hub),
            router.clone(),
            machine.clone(),
            tracker.clone(),
        );

        Ok(Core {
            store: self.store,
            enforcer,
            hub,
            router,
            machine,
            tracker,
            interceptor,
            service,
            signer: self.signer,
            worker_config: self.worker_config,
            notifications: Mutex::new(Some(notifications)),
        })
    }
}

/// A fully wired pipeline.
pub struct Core {
    pub store: Arc<dyn Store>,
    pub enforcer: Arc<Enforcer>,
    pub hub: Arc<Hub>,
    pub router: Router,
    pub machine: StageMachine,
    pub tracker: ExecutionTracker,
    pub interceptor: Arc<Interceptor>,
    pub service: Service,
    pub signer: JwtSigner,
    worker_config: WorkerConfig,
    notifications: Mutex<Option<mpsc::Receiver<Uuid>>>,
}

impl Core {
    pub fn worker_id(&self) -> &str {
        &self.worker_config.worker_id
    }

    /// Spawn the background loops. Only one set of loops may run per core.
    pub fn start(&self, shutdown: CancellationToken) -> Result<Vec<JoinHandle<()>>> {
        let notifications = self
            .notifications
            .lock()
            .take()
            .ok_or_else(|| Error::Config("workers already started".into()))?;

        let workers = Workers::new(
            self.router.clone(),
            self.machine.clone(),
            self.tracker.clone(),
            self.worker_config.clone(),
        );
        Ok(workers.spawn(notifications, shutdown))
    }

    /// Run the pipeline to quiescence in the calling task.
    pub async fn settle(&self) -> Result<()> {
        workers::settle(&self.router, &self.machine, &self.tracker, self.worker_id()).await
    }
}
