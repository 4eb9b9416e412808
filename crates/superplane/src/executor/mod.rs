//! Downstream execution adapters.
//!
//! An [`Executor`] starts work somewhere else (a CI system, an HTTP endpoint)
//! from a resolved run template. The run template's `type` selects the
//! adapter from the [`ExecutorRegistry`].

mod http;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::ExecutionResult;

pub use http::{HttpExecutor, HttpSpec, ResponsePolicy, HTTP_EXECUTOR, MAX_RESPONSE_BYTES};

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Deadline for a single dispatch or cancel call.
    pub timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
        }
    }
}

/// Everything an adapter needs to start one execution.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchRequest {
    pub stage_id: Uuid,
    pub execution_id: Uuid,
    /// Lets the downstream run report outputs and completion back.
    pub execution_token: String,
    /// The run template spec with every placeholder resolved.
    pub spec: Map<String, Value>,
}

/// Result reported synchronously by adapters that finish immediately.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub result: ExecutionResult,
    pub outputs: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchOutcome {
    /// Identity of the run in the downstream system.
    pub reference_id: String,
    pub completion: Option<Completion>,
}

/// Capability set of a downstream runner.
///
/// Network failures and timeouts must be reported as
/// [`Error::Transient`] so dispatch is retried.
#[async_trait]
pub trait Executor: Send + Sync + 'static {
    /// Reject a run template spec at stage create/update time.
    fn validate(&self, _spec: &Map<String, Value>) -> Result<()> {
        Ok(())
    }

    async fn dispatch(&self, request: &DispatchRequest) -> Result<DispatchOutcome>;

    async fn cancel(&self, reference_id: &str) -> Result<()>;
}

/// Adapters keyed by run template type.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn Executor>>,
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<&String> = self.executors.keys().collect();
        kinds.sort();
        f.debug_struct("ExecutorRegistry").field("kinds", &kinds).finish()
    }
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in HTTP adapter.
    pub fn with_defaults(config: &ExecutorConfig) -> Self {
        let mut registry = Self::new();
        registry.register(HTTP_EXECUTOR, Arc::new(HttpExecutor::new(config.timeout)));
        registry
    }

    pub fn register(&mut self, kind: impl Into<String>, executor: Arc<dyn Executor>) {
        self.executors.insert(kind.into(), executor);
    }

    pub fn get(&self, kind: &str) -> Result<Arc<dyn Executor>> {
        self.executors
            .get(kind)
            .cloned()
            .ok_or_else(|| Error::Config(format!("unknown executor type {kind:?}")))
    }

    pub fn validate(&self, kind: &str, spec: &Map<String, Value>) -> Result<()> {
        self.get(kind)?.validate(spec)
    }
}
