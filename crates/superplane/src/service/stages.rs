use std::collections::HashSet;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use super::{duplicate_name, validate_name, Service};
use crate::error::{Error, Result};
use crate::hub::HubEvent;
use crate::inputs::validate_inputs;
use crate::model::{
    Condition, Connection, Filter, FilterOperator, InputDefinition, InputMapping, OutputDefinition,
    RunTemplate, SourceType, Stage, TagUsage, ValueDefinition, ValueFrom,
};
use crate::store::Required;

/// Declarative description of a stage, as submitted on create and update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSpec {
    pub name: String,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub connections: Vec<ConnectionSpec>,
    #[serde(default)]
    pub inputs: Vec<InputDefinition>,
    #[serde(default)]
    pub outputs: Vec<OutputDefinition>,
    #[serde(default)]
    pub input_mappings: Vec<InputMapping>,
    #[serde(default)]
    pub tag_usage: Option<TagUsage>,
    #[serde(default)]
    pub secrets: Vec<ValueDefinition>,
    pub run_template: RunTemplate,
}

/// A connection addressed by the source's name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: SourceType,
    #[serde(default)]
    pub filters: Vec<Filter>,
    #[serde(default)]
    pub filter_operator: FilterOperator,
}

impl Service {
    pub async fn create_stage(&self, canvas_id: Uuid, spec: StageSpec, user_id: &str) -> Result<Stage> {
        validate_name("stage", &spec.name)?;
        self.canvas(canvas_id).await?;
        if self.store.find_stage_by_name(canvas_id, &spec.name).await?.is_some() {
            return Err(duplicate_name("stage"));
        }

        let mut stage = Stage::new(canvas_id, spec.name.clone(), user_id, spec.run_template.clone());
        apply_spec(&mut stage, &spec);

        let connections = self.connections(&stage, &spec.connections).await?;
        self.validate_stage(&stage, &connections).await?;
        self.store.create_stage(&stage, &connections).await?;

        info!(%canvas_id, stage_id = %stage.id, name = %stage.name, "stage created");
        self.hub.publish(canvas_id, HubEvent::StageAdded, &stage);
        Ok(stage)
    }

    /// Replace a stage's declaration. Pending and waiting stage events from
    /// sources that are no longer connected become `processed(connection)`.
    pub async fn update_stage(&self, canvas_id: Uuid, id_or_name: &str, spec: StageSpec) -> Result<Stage> {
        validate_name("stage", &spec.name)?;
        let mut stage = self.describe_stage(canvas_id, id_or_name).await?;
        if spec.name != stage.name
            && self.store.find_stage_by_name(canvas_id, &spec.name).await?.is_some()
        {
            return Err(duplicate_name("stage"));
        }

        stage.name = spec.name.clone();
        stage.run_template = spec.run_template.clone();
        stage.updated_at = Utc::now();
        apply_spec(&mut stage, &spec);

        let connections = self.connections(&stage, &spec.connections).await?;
        self.validate_stage(&stage, &connections).await?;
        let invalidated = self.store.update_stage(&stage, &connections).await?;

        info!(
            %canvas_id,
            stage_id = %stage.id,
            invalidated = invalidated.len(),
            "stage updated"
        );
        self.hub.publish(canvas_id, HubEvent::StageUpdated, &stage);
        Ok(stage)
    }

    pub async fn describe_stage(&self, canvas_id: Uuid, id_or_name: &str) -> Result<Stage> {
        let stage = match Uuid::parse_str(id_or_name) {
            Ok(id) => self.store.find_stage(id).await,
            Err(_) => self.store.find_stage_by_name(canvas_id, id_or_name).await,
        }
        .required("stage")?;

        if stage.canvas_id != canvas_id {
            return Err(Error::not_found("stage"));
        }
        Ok(stage)
    }

    pub async fn list_stages(&self, canvas_id: Uuid) -> Result<Vec<Stage>> {
        self.store.list_stages(canvas_id).await
    }

    pub async fn list_connections(&self, canvas_id: Uuid, stage_id: &str) -> Result<Vec<Connection>> {
        let stage = self.describe_stage(canvas_id, stage_id).await?;
        self.store.list_connections_for_stage(stage.id).await
    }

    /// Resolve connection specs to adjacency rows. Sources must live in the
    /// stage's canvas; a stage may listen to itself.
    async fn connections(&self, stage: &Stage, specs: &[ConnectionSpec]) -> Result<Vec<Connection>> {
        let mut connections = Vec::with_capacity(specs.len());
        let mut seen = HashSet::new();

        for spec in specs {
            if spec.name.trim().is_empty() {
                return Err(Error::Config("connection name is required".into()));
            }
            if !seen.insert(spec.name.as_str()) {
                return Err(Error::Config(format!("duplicate connection {}", spec.name)));
            }

            let source_id = match spec.kind {
                SourceType::EventSource => self
                    .store
                    .find_event_source_by_name(stage.canvas_id, &spec.name)
                    .await?
                    .map(|s| s.id),
                SourceType::Stage if spec.name == stage.name => Some(stage.id),
                SourceType::Stage => self
                    .store
                    .find_stage_by_name(stage.canvas_id, &spec.name)
                    .await?
                    .map(|s| s.id),
            };
            let source_id = source_id.ok_or_else(|| {
                Error::Config(format!("{} {} not found", spec.kind.as_str(), spec.name))
            })?;

            connections.push(Connection {
                id: Uuid::new_v4(),
                stage_id: stage.id,
                source_id,
                source_name: spec.name.clone(),
                source_type: spec.kind,
                filters: spec.filters.clone(),
                filter_operator: spec.filter_operator,
            });
        }

        Ok(connections)
    }

    async fn validate_stage(&self, stage: &Stage, connections: &[Connection]) -> Result<()> {
        for condition in &stage.conditions {
            condition.validate()?;
        }

        self.executors
            .validate(&stage.run_template.kind, &stage.run_template.spec)?;

        for connection in connections {
            for filter in &connection.filters {
                if filter.expression().trim().is_empty() {
                    return Err(Error::Config(format!(
                        "empty {} filter on connection {}",
                        filter.kind(),
                        connection.source_name
                    )));
                }
                self.evaluator.check(filter.expression())?;
            }
        }

        validate_inputs(stage, connections, &self.evaluator)?;

        let mut outputs = HashSet::new();
        for output in &stage.outputs {
            if output.name.trim().is_empty() {
                return Err(Error::Config("output name is required".into()));
            }
            if !outputs.insert(output.name.as_str()) {
                return Err(Error::Config(format!("duplicate output {}", output.name)));
            }
        }

        if let Some(usage) = &stage.tag_usage {
            self.validate_tag_usage(usage, connections)?;
        }

        self.validate_secret_refs(stage).await
    }

    fn validate_tag_usage(&self, usage: &TagUsage, connections: &[Connection]) -> Result<()> {
        if usage.from.is_empty() {
            return Err(Error::Config("tag usage needs at least one connection".into()));
        }
        for name in &usage.from {
            if !connections.iter().any(|c| c.source_name == *name) {
                return Err(Error::Config(format!("tag usage references unknown connection {name}")));
            }
        }

        if usage.tags.is_empty() {
            return Err(Error::Config("tag usage needs at least one tag".into()));
        }
        let mut names = HashSet::new();
        for tag in &usage.tags {
            if tag.name.trim().is_empty() {
                return Err(Error::Config("tag name is required".into()));
            }
            if !names.insert(tag.name.as_str()) {
                return Err(Error::Config(format!("duplicate tag {}", tag.name)));
            }
            self.evaluator.check(&tag.value_from)?;
        }
        Ok(())
    }

    async fn validate_secret_refs(&self, stage: &Stage) -> Result<()> {
        let mut names = HashSet::new();
        for definition in &stage.secrets {
            if definition.name.trim().is_empty() {
                return Err(Error::Config("secret reference name is required".into()));
            }
            if !names.insert(definition.name.as_str()) {
                return Err(Error::Config(format!("duplicate secret reference {}", definition.name)));
            }

            match (&definition.value, &definition.value_from) {
                (Some(_), None) => {}
                (None, Some(ValueFrom::Secret(reference))) => {
                    if self
                        .store
                        .find_secret_by_name(stage.canvas_id, &reference.name)
                        .await?
                        .is_none()
                    {
                        return Err(Error::Config(format!("secret {} not found", reference.name)));
                    }
                }
                _ => {
                    return Err(Error::Config(format!(
                        "secret reference {} must name a secret and key",
                        definition.name
                    )))
                }
            }
        }
        Ok(())
    }
}

fn apply_spec(stage: &mut Stage, spec: &StageSpec) {
    stage.conditions = spec.conditions.clone();
    stage.inputs = spec.inputs.clone();
    stage.outputs = spec.outputs.clone();
    stage.input_mappings = spec.input_mappings.clone();
    stage.tag_usage = spec.tag_usage.clone();
    stage.secrets = spec.secrets.clone();
}
