use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use serde_json::{Map, Value};
use uuid::Uuid;

use superplane::model::{
    Canvas, Event, EventSource, Execution, RunTemplate, SourceType, Stage, StageEvent,
};
use superplane::service::ConnectionSpec;
use superplane::{AesGcmEncryptor, Core, CoreBuilder, StageSpec, Store};

use crate::clock::ManualClock;
use crate::executor::{RecordingExecutor, RECORDING_EXECUTOR};
use crate::policy::MemoryPolicyStore;
use crate::store::MemoryStore;

/// User that owns every organization and canvas the harness creates.
pub const OWNER: &str = "owner@example.com";

const ENCRYPTION_KEY: [u8; 32] = [7; 32];
const JWT_SECRET: &[u8] = b"harness-jwt-secret";

/// A fully wired core over in-memory state, driven by hand.
///
/// Nothing runs in the background: call [`Harness::settle`] to push the
/// pipeline to quiescence after each stimulus.
pub struct Harness {
    pub core: Arc<Core>,
    pub store: Arc<MemoryStore>,
    pub policies: Arc<MemoryPolicyStore>,
    pub clock: Arc<ManualClock>,
    pub executor: Arc<RecordingExecutor>,
}

impl Harness {
    pub async fn new() -> Result<Self> {
        Self::with_clock(ManualClock::default()).await
    }

    pub async fn with_clock(clock: ManualClock) -> Result<Self> {
        Self::with_builder(clock, |builder| builder).await
    }

    /// Adjust the builder before the core is assembled.
    pub async fn with_builder(
        clock: ManualClock,
        configure: impl FnOnce(CoreBuilder) -> CoreBuilder,
    ) -> Result<Self> {
        let clock = Arc::new(clock);
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let policies = Arc::new(MemoryPolicyStore::new());
        let executor = Arc::new(RecordingExecutor::new());

        let builder = CoreBuilder::new(
            store.clone(),
            policies.clone(),
            Arc::new(AesGcmEncryptor::new(&ENCRYPTION_KEY)?),
            JWT_SECRET,
        )
        .with_clock(clock.clone())
        .with_executor(RECORDING_EXECUTOR, executor.clone());
        let core = configure(builder).build().await?;

        Ok(Self {
            core: Arc::new(core),
            store,
            policies,
            clock,
            executor,
        })
    }

    /// A fresh organization with one canvas, both owned by [`OWNER`].
    pub async fn canvas(&self) -> Result<Canvas> {
        let suffix = Uuid::new_v4().simple().to_string();
        let org_name = format!("org-{}", &suffix[..8]);
        let org = self
            .core
            .service
            .create_organization(&org_name, "Harness", OWNER)
            .await?;
        Ok(self
            .core
            .service
            .create_canvas(org.id, "delivery", OWNER)
            .await?)
    }

    pub async fn source(&self, canvas: &Canvas, name: &str) -> Result<EventSource> {
        Ok(self
            .core
            .service
            .create_event_source(canvas.id, name)
            .await?
            .source)
    }

    pub async fn stage(&self, canvas: &Canvas, spec: StageSpec) -> Result<Stage> {
        Ok(self.core.service.create_stage(canvas.id, spec, OWNER).await?)
    }

    /// Deliver a webhook body as if its signature had been verified.
    pub async fn send(&self, source: &EventSource, body: Value) -> Result<Event> {
        self.send_with_headers(source, body, BTreeMap::new()).await
    }

    pub async fn send_with_headers(
        &self,
        source: &EventSource,
        body: Value,
        headers: BTreeMap<String, String>,
    ) -> Result<Event> {
        let bytes = serde_json::to_vec(&body)?;
        Ok(self
            .core
            .service
            .receive_event(source, &bytes, headers)
            .await?)
    }

    pub async fn settle(&self) -> Result<()> {
        Ok(self.core.settle().await?)
    }

    /// Every stage event of the stage, oldest first.
    pub async fn stage_events(&self, stage: &Stage) -> Result<Vec<StageEvent>> {
        Ok(self.core.store.list_stage_events(stage.id, &[]).await?)
    }

    /// Executions of the stage, newest first.
    pub async fn executions(&self, stage: &Stage) -> Result<Vec<Execution>> {
        Ok(self.core.store.list_executions(stage.id).await?)
    }
}

/// A stage running on the recording executor with no connections.
pub fn stage_spec(name: &str) -> StageSpec {
    StageSpec {
        name: name.to_string(),
        conditions: Vec::new(),
        connections: Vec::new(),
        inputs: Vec::new(),
        outputs: Vec::new(),
        input_mappings: Vec::new(),
        tag_usage: None,
        secrets: Vec::new(),
        run_template: RunTemplate {
            kind: RECORDING_EXECUTOR.to_string(),
            spec: Map::new(),
        },
    }
}

/// An unfiltered connection.
pub fn connection(name: &str, kind: SourceType) -> ConnectionSpec {
    ConnectionSpec {
        name: name.to_string(),
        kind,
        filters: Vec::new(),
        filter_operator: Default::default(),
    }
}
