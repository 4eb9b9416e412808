use std::collections::VecDeque;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::Notify;

use superplane::error::{Error, Result};
use superplane::executor::{Completion, DispatchOutcome, DispatchRequest, Executor};
use superplane::model::ExecutionResult;

/// Run template type the harness registers [`RecordingExecutor`] under.
pub const RECORDING_EXECUTOR: &str = "recording";

#[derive(Debug, Clone)]
enum Reply {
    Started,
    /// Started once [`RecordingExecutor::release`] is called.
    Held,
    Finished(ExecutionResult, Map<String, Value>),
    Failed(Error),
}

/// Executor that records every request instead of running anything.
///
/// By default each dispatch starts a run that only finishes when the test
/// calls [`ExecutionTracker::finish`](superplane::ExecutionTracker::finish).
/// Queued replies override that, one per dispatch.
#[derive(Debug, Default)]
pub struct RecordingExecutor {
    requests: Mutex<Vec<DispatchRequest>>,
    cancelled: Mutex<Vec<String>>,
    replies: Mutex<VecDeque<Reply>>,
    fallback: Mutex<Option<Reply>>,
    released: Notify,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Complete every dispatch without a queued reply immediately.
    pub fn complete_with(&self, result: ExecutionResult, outputs: Map<String, Value>) {
        *self.fallback.lock() = Some(Reply::Finished(result, outputs));
    }

    /// Return to starting runs that complete asynchronously.
    pub fn start_only(&self) {
        *self.fallback.lock() = None;
    }

    pub fn fail_next(&self, error: Error) {
        self.replies.lock().push_back(Reply::Failed(error));
    }

    pub fn complete_next(&self, result: ExecutionResult, outputs: Map<String, Value>) {
        self.replies
            .lock()
            .push_back(Reply::Finished(result, outputs));
    }

    pub fn start_next(&self) {
        self.replies.lock().push_back(Reply::Started);
    }

    /// Block the next dispatch until [`release`](Self::release).
    pub fn hold_next(&self) {
        self.replies.lock().push_back(Reply::Held);
    }

    pub fn release(&self) {
        self.released.notify_one();
    }

    /// Every dispatch received, successful or not, in order.
    pub fn requests(&self) -> Vec<DispatchRequest> {
        self.requests.lock().clone()
    }

    pub fn last_request(&self) -> Option<DispatchRequest> {
        self.requests.lock().last().cloned()
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.cancelled.lock().clone()
    }
}

pub fn reference_for(request: &DispatchRequest) -> String {
    format!("run-{}", request.execution_id)
}

#[async_trait]
impl Executor for RecordingExecutor {
    async fn dispatch(&self, request: &DispatchRequest) -> Result<DispatchOutcome> {
        self.requests.lock().push(request.clone());

        let reply = self
            .replies
            .lock()
            .pop_front()
            .or_else(|| self.fallback.lock().clone())
            .unwrap_or(Reply::Started);

        let completion = match reply {
            Reply::Started => None,
            Reply::Held => {
                self.released.notified().await;
                None
            }
            Reply::Finished(result, outputs) => Some(Completion { result, outputs }),
            Reply::Failed(error) => return Err(error),
        };
        Ok(DispatchOutcome {
            reference_id: reference_for(request),
            completion,
        })
    }

    async fn cancel(&self, reference_id: &str) -> Result<()> {
        self.cancelled.lock().push(reference_id.to_string());
        Ok(())
    }
}
