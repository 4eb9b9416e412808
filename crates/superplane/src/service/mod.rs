//! Operator actions: the API surface behind the HTTP edge.
//!
//! Every method here assumes the caller has already been authorized (see
//! [`crate::authz::interceptor`]). Methods that take a canvas id check that
//! the addressed entity belongs to that canvas, so a permission granted on
//! one canvas never reaches into another.

mod canvases;
mod events;
mod members;
mod organizations;
mod secrets;
mod sources;
mod stages;

use std::sync::Arc;

use uuid::Uuid;

use crate::authz::Enforcer;
use crate::crypto::Encryptor;
use crate::error::{Error, Result};
use crate::executor::ExecutorRegistry;
use crate::expr::Evaluator;
use crate::hub::Hub;
use crate::machine::StageMachine;
use crate::model::Canvas;
use crate::router::Router;
use crate::store::{Required, Store};
use crate::tracker::ExecutionTracker;

pub use sources::NewEventSource;
pub use stages::{ConnectionSpec, StageSpec};

#[derive(Clone)]
pub struct Service {
    store: Arc<dyn Store>,
    enforcer: Arc<Enforcer>,
    encryptor: Arc<dyn Encryptor>,
    executors: Arc<ExecutorRegistry>,
    evaluator: Evaluator,
    hub: Arc<Hub>,
    router: Router,
    machine: StageMachine,
    tracker: ExecutionTracker,
}

impl Service {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        enforcer: Arc<Enforcer>,
        encryptor: Arc<dyn Encryptor>,
        executors: Arc<ExecutorRegistry>,
        evaluator: Evaluator,
        hub: Arc<Hub>,
        router: Router,
        machine: StageMachine,
        tracker: ExecutionTracker,
    ) -> Self {
        Self {
            store,
            enforcer,
            encryptor,
            executors,
            evaluator,
            hub,
            router,
            machine,
            tracker,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn enforcer(&self) -> &Arc<Enforcer> {
        &self.enforcer
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    pub fn tracker(&self) -> &ExecutionTracker {
        &self.tracker
    }

    async fn canvas(&self, canvas_id: Uuid) -> Result<Canvas> {
        self.store.find_canvas(canvas_id).await.required("canvas")
    }
}

/// Names are slugs: non-empty, without surrounding whitespace or slashes.
fn validate_name(what: &str, name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::Validation(format!("{what} name is required")));
    }
    if name.trim() != name || name.contains('/') {
        return Err(Error::Validation(format!("invalid {what} name {name:?}")));
    }
    Ok(())
}

/// Message for a taken name. The HTTP edge reports these as invalid
/// arguments rather than conflicts.
pub fn duplicate_name(what: &str) -> Error {
    Error::Conflict(format!("{what} name already used"))
}

pub fn is_duplicate_name(err: &Error) -> bool {
    matches!(err, Error::Conflict(m) if m.ends_with("name already used"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_trimmed_slugs() {
        assert!(validate_name("stage", "deploy").is_ok());
        assert!(validate_name("stage", "").is_err());
        assert!(validate_name("stage", " deploy").is_err());
        assert!(validate_name("stage", "a/b").is_err());
    }

    #[test]
    fn duplicate_names_are_recognizable() {
        assert!(is_duplicate_name(&duplicate_name("canvas")));
        assert!(!is_duplicate_name(&Error::Conflict("approval already recorded".into())));
    }
}
