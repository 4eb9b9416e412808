//! Stage input resolution.
//!
//! A stage declares its inputs and one or more mappings saying where each
//! input's value comes from. The mapping is chosen by the connection an event
//! arrived through, falling back to the unconditional mapping.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Arc, LazyLock};

use regex::Regex;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::expr::{connection_view, Evaluator, Variables};
use crate::model::{Connection, Event, InputMapping, Stage, ValueDefinition, ValueFrom};
use crate::store::Store;

static CONN_CALL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"Conn\(\s*["']([^"']+)["']\s*\)"#).expect("invalid connection call pattern")
});

/// Connection names referenced through `self.Conn(...)` in an expression.
pub fn referenced_connections(expression: &str) -> BTreeSet<String> {
    CONN_CALL
        .captures_iter(expression)
        .map(|c| c[1].to_string())
        .collect()
}

/// Resolves a stage's inputs for an event.
#[derive(Clone)]
pub struct InputBuilder {
    store: Arc<dyn Store>,
    evaluator: Evaluator,
}

impl InputBuilder {
    pub fn new(store: Arc<dyn Store>, evaluator: Evaluator) -> Self {
        Self { store, evaluator }
    }

    /// Input values for `event` arriving at `stage`.
    ///
    /// `connections` are the stage's connections, used to find the sources
    /// behind `Conn(...)` and `event_data` references.
    pub async fn build(&self, stage: &Stage, connections: &[Connection], event: &Event) -> Result<BTreeMap<String, String>> {
        let mut inputs = BTreeMap::new();
        if stage.inputs.is_empty() {
            return Ok(inputs);
        }

        let mapping = select_mapping(&stage.input_mappings, &event.source_name).ok_or_else(|| {
            Error::Validation(format!(
                "stage {} has no input mapping for connection {}",
                stage.name, event.source_name
            ))
        })?;

        for input in &stage.inputs {
            let definition = mapping
                .values
                .iter()
                .find(|v| v.name == input.name)
                .ok_or_else(|| Error::Validation(format!("input {} has no value", input.name)))?;
            let value = self.resolve(stage, connections, event, definition).await?;
            inputs.insert(input.name.clone(), value);
        }

        Ok(inputs)
    }

    async fn resolve(
        &self,
        stage: &Stage,
        connections: &[Connection],
        event: &Event,
        definition: &ValueDefinition,
    ) -> Result<String> {
        if let Some(value) = &definition.value {
            return Ok(value.clone());
        }

        match &definition.value_from {
            Some(ValueFrom::EventData(data)) => {
                let base = self.event_for(connections, event, &data.connection).await?;
                let mut views = BTreeMap::new();
                for name in referenced_connections(&data.expression) {
                    if let Ok(conn_event) = self.event_for(connections, event, &name).await {
                        views.insert(name, connection_view(&conn_event));
                    }
                }

                let vars = Variables::new()
                    .promote(&base.raw)
                    .with_headers(&base.headers)
                    .with_connections(views);
                Ok(self.evaluator.eval_string(&data.expression, &vars).await?)
            }
            Some(ValueFrom::LastExecution(last)) => {
                let previous = self
                    .store
                    .last_execution_inputs(stage.id, &last.results)
                    .await?
                    .ok_or_else(|| {
                        Error::Validation(format!(
                            "no previous execution found for input {}",
                            definition.name
                        ))
                    })?;
                previous.get(&definition.name).cloned().ok_or_else(|| {
                    Error::Validation(format!(
                        "previous execution has no value for input {}",
                        definition.name
                    ))
                })
            }
            Some(ValueFrom::Secret(_)) => Err(Error::Validation(format!(
                "input {} cannot come from a secret",
                definition.name
            ))),
            None => Err(Error::Validation(format!("input {} has no value", definition.name))),
        }
    }

    /// The triggering event when it came through `connection`, otherwise the
    /// last event that connection's source produced.
    async fn event_for(&self, connections: &[Connection], event: &Event, connection: &str) -> Result<Event> {
        if event.source_name == connection {
            return Ok(event.clone());
        }
        let source_id = source_of(connections, connection)
            .ok_or_else(|| Error::not_found(format!("connection {connection}")))?;
        self.store
            .last_event_by_source(source_id)
            .await?
            .ok_or_else(|| Error::Validation(format!("no event received from connection {connection}")))
    }
}

fn source_of(connections: &[Connection], name: &str) -> Option<Uuid> {
    connections
        .iter()
        .find(|c| c.source_name == name)
        .map(|c| c.source_id)
}

/// Mapping triggered by `source_name`, else the unconditional one.
pub fn select_mapping<'a>(mappings: &'a [InputMapping], source_name: &str) -> Option<&'a InputMapping> {
    mappings
        .iter()
        .find(|m| m.triggered_by() == Some(source_name))
        .or_else(|| mappings.iter().find(|m| m.when.is_none()))
}

/// Reject input declarations and mappings that could not resolve.
pub fn validate_inputs(stage: &Stage, connections: &[Connection], evaluator: &Evaluator) -> Result<()> {
    let connection_names: HashSet<&str> = connections.iter().map(|c| c.source_name.as_str()).collect();

    let mut defined = BTreeSet::new();
    for input in &stage.inputs {
        if input.name.trim().is_empty() {
            return Err(Error::Config("input name is required".into()));
        }
        if !defined.insert(input.name.as_str()) {
            return Err(Error::Config(format!("duplicate input {}", input.name)));
        }
    }

    if !stage.inputs.is_empty() && stage.input_mappings.is_empty() {
        return Err(Error::Config("inputs are defined but no input mappings exist".into()));
    }

    let unconditional = stage.input_mappings.iter().filter(|m| m.when.is_none()).count();
    if unconditional > 0 && stage.input_mappings.len() > 1 {
        return Err(Error::Config(
            "a mapping without a trigger must be the only input mapping".into(),
        ));
    }

    let mut triggers = HashSet::new();
    for mapping in &stage.input_mappings {
        if let Some(connection) = mapping.triggered_by() {
            if !connection_names.contains(connection) {
                return Err(Error::Config(format!(
                    "input mapping references unknown connection {connection}"
                )));
            }
            if !triggers.insert(connection) {
                return Err(Error::Config(format!(
                    "more than one input mapping for connection {connection}"
                )));
            }
        }

        let mut mapped = BTreeSet::new();
        for value in &mapping.values {
            if !defined.contains(value.name.as_str()) {
                return Err(Error::Config(format!("input {} is not defined", value.name)));
            }
            if !mapped.insert(value.name.as_str()) {
                return Err(Error::Config(format!(
                    "input {} is mapped more than once",
                    value.name
                )));
            }
            validate_value(value, &connection_names, evaluator)?;
        }

        if let Some(missing) = defined.difference(&mapped).next() {
            return Err(Error::Config(format!("input {missing} has no value in mapping")));
        }
    }

    Ok(())
}

fn validate_value(value: &ValueDefinition, connections: &HashSet<&str>, evaluator: &Evaluator) -> Result<()> {
    match (&value.value, &value.value_from) {
        (Some(_), None) => Ok(()),
        (None, Some(ValueFrom::EventData(data))) => {
            if !connections.contains(data.connection.as_str()) {
                return Err(Error::Config(format!(
                    "input {} references unknown connection {}",
                    value.name, data.connection
                )));
            }
            for name in referenced_connections(&data.expression) {
                if !connections.contains(name.as_str()) {
                    return Err(Error::Config(format!(
                        "input {} references unknown connection {name}",
                        value.name
                    )));
                }
            }
            evaluator.check(&data.expression)?;
            Ok(())
        }
        (None, Some(ValueFrom::LastExecution(last))) if last.results.is_empty() => Err(
            Error::Config(format!("input {} needs at least one result", value.name)),
        ),
        (None, Some(ValueFrom::LastExecution(_))) => Ok(()),
        (None, Some(ValueFrom::Secret(_))) => Err(Error::Config(format!(
            "input {} cannot come from a secret",
            value.name
        ))),
        (Some(_), Some(_)) => Err(Error::Config(format!(
            "input {} has both value and valueFrom",
            value.name
        ))),
        (None, None) => Err(Error::Config(format!("input {} has no value", value.name))),
    }
}
