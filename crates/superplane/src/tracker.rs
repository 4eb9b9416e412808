//! Execution lifecycle: dispatch, output capture and finalization.
//!
//! An admitted execution is claimed under a short lease, its run template
//! resolved, and handed to the executor for the template's `type`. Transient
//! dispatch failures are retried with backoff up to
//! [`MAX_DISPATCH_ATTEMPTS`]; anything else fails the execution.
//!
//! Finishing writes the final state, tag health, and the completion event
//! together with that event's fan-out in one store call, so downstream
//! stages see the completion exactly once.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::crypto::{default_token_ttl, Encryptor, JwtSigner};
use crate::error::{Error, Result};
use crate::executor::{DispatchOutcome, DispatchRequest, ExecutorRegistry};
use crate::hub::{Hub, HubEvent};
use crate::model::{
    completion_event, Execution, ExecutionResult, ExecutionState, Stage, StageEvent, ValueFrom,
};
use crate::resolver::SpecResolver;
use crate::router::Router;
use crate::store::{stale_join, Finish, Required, Store, MAX_DISPATCH_ATTEMPTS};
use crate::workers::StageNotifier;

/// Plans tried for one completion before giving up.
const MAX_FINISH_ATTEMPTS: usize = 3;

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Dispatch lease on a claimed execution.
    pub claim_lease: Duration,
    /// Deadline for one executor call.
    pub dispatch_timeout: Duration,
    /// Lifetime of the execution token handed to the downstream run.
    pub token_ttl: chrono::Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            claim_lease: Duration::from_secs(60),
            dispatch_timeout: Duration::from_secs(30),
            token_ttl: default_token_ttl(),
        }
    }
}

#[derive(Clone)]
pub struct ExecutionTracker {
    store: Arc<dyn Store>,
    encryptor: Arc<dyn Encryptor>,
    signer: JwtSigner,
    executors: Arc<ExecutorRegistry>,
    resolver: SpecResolver,
    router: Router,
    hub: Arc<Hub>,
    notifier: StageNotifier,
    clock: Arc<dyn Clock>,
    config: TrackerConfig,
}

impl ExecutionTracker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        encryptor: Arc<dyn Encryptor>,
        signer: JwtSigner,
        executors: Arc<ExecutorRegistry>,
        resolver: SpecResolver,
        router: Router,
        hub: Arc<Hub>,
        notifier: StageNotifier,
        clock: Arc<dyn Clock>,
        config: TrackerConfig,
    ) -> Self {
        Self {
            store,
            encryptor,
            signer,
            executors,
            resolver,
            router,
            hub,
            notifier,
            clock,
            config,
        }
    }

    pub fn signer(&self) -> &JwtSigner {
        &self.signer
    }

    /// Claim and dispatch one execution. `None` when it is not pending, not
    /// due yet, or claimed by another worker.
    pub async fn dispatch(&self, execution_id: Uuid, worker_id: &str) -> Result<Option<Execution>> {
        let Some(execution) = self
            .store
            .claim_execution(execution_id, worker_id, self.lease()?)
            .await?
        else {
            debug!(%execution_id, worker_id, "execution not claimable");
            return Ok(None);
        };
        self.dispatch_claimed(execution).await.map(Some)
    }

    /// Claim and dispatch due pending executions. Returns how many were
    /// claimed.
    pub async fn dispatch_pending(&self, worker_id: &str, limit: usize) -> Result<usize> {
        let claimed = self
            .store
            .claim_pending_executions(worker_id, limit, self.lease()?)
            .await?;
        let count = claimed.len();
        for execution in claimed {
            let execution_id = execution.id;
            if let Err(e) = self.dispatch_claimed(execution).await {
                error!(%execution_id, error = %e, "failed to dispatch execution");
            }
        }
        Ok(count)
    }

    async fn dispatch_claimed(&self, execution: Execution) -> Result<Execution> {
        let stage = self
            .store
            .find_stage(execution.stage_id)
            .await
            .required("stage")?;
        let stage_event = self
            .store
            .find_stage_event(execution.stage_event_id)
            .await
            .required("stage event")?;

        match self.start(&stage, &stage_event, &execution).await {
            Ok(outcome) => {
                let started = self
                    .store
                    .start_execution(execution.id, &outcome.reference_id)
                    .await?;
                info!(
                    execution_id = %execution.id,
                    stage_id = %stage.id,
                    reference_id = %outcome.reference_id,
                    "execution started"
                );
                self.hub
                    .publish_execution(stage.canvas_id, HubEvent::ExecutionStarted, &started);

                match outcome.completion {
                    Some(completion) => {
                        self.finish(execution.id, completion.result, completion.outputs)
                            .await
                    }
                    None => Ok(started),
                }
            }
            Err(e) if e.is_transient() && execution.dispatch_attempts + 1 < MAX_DISPATCH_ATTEMPTS => {
                warn!(
                    execution_id = %execution.id,
                    attempt = execution.dispatch_attempts + 1,
                    error = %e,
                    "dispatch failed; retrying"
                );
                self.store.retry_dispatch(execution.id).await
            }
            Err(e) => {
                error!(execution_id = %execution.id, error = %e, "dispatch failed");
                self.finish(execution.id, ExecutionResult::Failed, error_output(e.message()))
                    .await
            }
        }
    }

    async fn start(
        &self,
        stage: &Stage,
        stage_event: &StageEvent,
        execution: &Execution,
    ) -> Result<DispatchOutcome> {
        let secrets = self.secrets(stage).await?;
        let spec = self
            .resolver
            .resolve(&stage.run_template.spec, &stage_event.inputs, &secrets)
            .await?;
        let request = DispatchRequest {
            stage_id: stage.id,
            execution_id: execution.id,
            execution_token: self
                .signer
                .generate(&execution.id.to_string(), self.config.token_ttl)?,
            spec,
        };

        let executor = self.executors.get(&stage.run_template.kind)?;
        match tokio::time::timeout(self.config.dispatch_timeout, executor.dispatch(&request)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::Transient(format!(
                "dispatch timed out after {:?}",
                self.config.dispatch_timeout
            ))),
        }
    }

    /// Values exposed to the run template as `secrets.<name>`.
    async fn secrets(&self, stage: &Stage) -> Result<BTreeMap<String, String>> {
        let mut decrypted: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
        let mut values = BTreeMap::new();

        for definition in &stage.secrets {
            let value = match (&definition.value, &definition.value_from) {
                (Some(value), _) => value.clone(),
                (None, Some(ValueFrom::Secret(reference))) => {
                    if !decrypted.contains_key(&reference.name) {
                        let data = self.open_secret(stage.canvas_id, &reference.name).await?;
                        decrypted.insert(reference.name.clone(), data);
                    }
                    decrypted
                        .get(&reference.name)
                        .and_then(|data| data.get(&reference.key))
                        .cloned()
                        .ok_or_else(|| {
                            Error::Validation(format!(
                                "key {} not found in secret {}",
                                reference.key, reference.name
                            ))
                        })?
                }
                _ => {
                    return Err(Error::Config(format!(
                        "secret {} has no value",
                        definition.name
                    )))
                }
            };
            values.insert(definition.name.clone(), value);
        }

        Ok(values)
    }

    async fn open_secret(&self, canvas_id: Uuid, name: &str) -> Result<BTreeMap<String, String>> {
        let secret = self
            .store
            .find_secret_by_name(canvas_id, name)
            .await
            .required(format!("secret {name}"))?;
        let plaintext = self.encryptor.decrypt(&secret.data, secret.name.as_bytes())?;
        Ok(serde_json::from_slice(&plaintext)?)
    }

    /// Finalize an execution.
    ///
    /// A passed result missing a required output is recorded as failed.
    /// Tags of the execution's stage event become healthy on pass and
    /// unhealthy on failure.
    pub async fn finish(
        &self,
        execution_id: Uuid,
        result: ExecutionResult,
        outputs: Map<String, Value>,
    ) -> Result<Execution> {
        let execution = self
            .store
            .find_execution(execution_id)
            .await
            .required("execution")?;
        if execution.state == ExecutionState::Finished {
            return Err(Error::Conflict("execution already finished".into()));
        }
        let stage = self
            .store
            .find_stage(execution.stage_id)
            .await
            .required("stage")?;

        let mut merged = execution.outputs.clone();
        merged.extend(outputs);

        let missing = stage.missing_required_outputs(&merged);
        let result = if result == ExecutionResult::Passed && !missing.is_empty() {
            warn!(%execution_id, ?missing, "required outputs missing; failing execution");
            ExecutionResult::Failed
        } else {
            result
        };

        let finished_at = self.clock.now();
        let mut finished = execution;
        finished.state = ExecutionState::Finished;
        finished.result = Some(result);
        finished.outputs = merged.clone();
        finished.finished_at = Some(finished_at);

        // The join is re-planned if its siblings move before the write lands.
        let completion = completion_event(&stage, &finished);
        let mut attempt = 1;
        let (finished, plan) = loop {
            let plan = self.router.plan(&completion).await?;
            let write = Finish {
                execution_id,
                result,
                outputs: merged.clone(),
                finished_at,
                completion_event: completion.clone(),
                fan_out: plan.fan_out.clone(),
            };
            match self.store.finish_execution(&write).await {
                Ok(finished) => break (finished, plan),
                Err(e) if e == stale_join() && attempt < MAX_FINISH_ATTEMPTS => {
                    debug!(%execution_id, attempt, "completion fan-out went stale; planning again");
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        };

        info!(
            %execution_id,
            stage_id = %stage.id,
            result = result.as_str(),
            downstream = plan.fan_out.stage_events.len(),
            "execution finished"
        );

        self.router.announce(&plan);
        self.hub
            .publish_execution(stage.canvas_id, HubEvent::ExecutionFinished, &finished);
        self.notifier.notify(stage.id);
        Ok(finished)
    }

    /// Finish the execution a downstream system knows by `reference_id`.
    pub async fn finish_by_reference(
        &self,
        reference_id: &str,
        result: ExecutionResult,
        outputs: Map<String, Value>,
    ) -> Result<Execution> {
        let execution = self
            .store
            .find_execution_by_reference(reference_id)
            .await
            .required("execution")?;
        self.finish(execution.id, result, outputs).await
    }

    /// Merge outputs pushed by a running execution. Names the stage does not
    /// define are dropped.
    pub async fn record_outputs(&self, execution_id: Uuid, outputs: Map<String, Value>) -> Result<Execution> {
        let execution = self
            .store
            .find_execution(execution_id)
            .await
            .required("execution")?;
        if execution.state == ExecutionState::Finished {
            return Err(Error::Conflict("execution already finished".into()));
        }
        let stage = self
            .store
            .find_stage(execution.stage_id)
            .await
            .required("stage")?;

        let (defined, dropped) = split_outputs(&stage, outputs);
        if !dropped.is_empty() {
            warn!(%execution_id, ?dropped, "ignoring undefined outputs");
        }
        self.store.update_execution_outputs(execution_id, &defined).await
    }

    /// Cancel an unfinished execution and finish it as failed.
    pub async fn cancel(&self, execution_id: Uuid) -> Result<Execution> {
        let execution = self
            .store
            .find_execution(execution_id)
            .await
            .required("execution")?;
        if execution.state == ExecutionState::Finished {
            return Err(Error::Conflict("execution already finished".into()));
        }

        if let Some(reference_id) = &execution.reference_id {
            let stage = self
                .store
                .find_stage(execution.stage_id)
                .await
                .required("stage")?;
            let executor = self.executors.get(&stage.run_template.kind)?;
            match tokio::time::timeout(self.config.dispatch_timeout, executor.cancel(reference_id)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(%execution_id, error = %e, "executor cancel failed"),
                Err(_) => warn!(%execution_id, "executor cancel timed out"),
            }
        }

        info!(%execution_id, "execution cancelled");
        self.finish(execution_id, ExecutionResult::Failed, error_output("cancelled"))
            .await
    }

    fn lease(&self) -> Result<chrono::Duration> {
        chrono::Duration::from_std(self.config.claim_lease)
            .map_err(|e| Error::Config(format!("invalid claim lease: {e}")))
    }
}

fn error_output(message: &str) -> Map<String, Value> {
    let mut outputs = Map::new();
    outputs.insert("error".into(), Value::String(message.to_string()));
    outputs
}

/// Partition outputs into those the stage defines and the names it does not.
fn split_outputs(stage: &Stage, outputs: Map<String, Value>) -> (Map<String, Value>, Vec<String>) {
    let mut defined = Map::new();
    let mut dropped = Vec::new();
    for (name, value) in outputs {
        if stage.has_output(&name) {
            defined.insert(name, value);
        } else {
            dropped.push(name);
        }
    }
    (defined, dropped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::model::{OutputDefinition, RunTemplate};

    #[test]
    fn undefined_outputs_are_dropped() {
        let mut stage = Stage::new(
            Uuid::new_v4(),
            "build",
            "u",
            RunTemplate {
                kind: "http".into(),
                spec: Map::new(),
            },
        );
        stage.outputs = vec![OutputDefinition {
            name: "VERSION".into(),
            description: String::new(),
            required: true,
        }];

        let outputs = json!({"VERSION": "v1", "EXTRA": 1}).as_object().cloned().unwrap();
        let (defined, dropped) = split_outputs(&stage, outputs);

        assert_eq!(Value::Object(defined), json!({"VERSION": "v1"}));
        assert_eq!(dropped, vec!["EXTRA".to_string()]);
    }

    #[test]
    fn error_output_carries_the_message() {
        assert_eq!(Value::Object(error_output("boom")), json!({"error": "boom"}));
    }
}
