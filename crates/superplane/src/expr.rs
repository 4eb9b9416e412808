//! Sandboxed expression evaluation.
//!
//! Expressions use the Jinja expression grammar (`a == 1 and b != "x"`,
//! `headers["Content-Type"]`, `self.Conn("build").version`). Two surfaces
//! are exposed: [`Evaluator::eval_bool`] for filters and
//! [`Evaluator::eval_string`] for tags, inputs and run-template placeholders.
//!
//! # Invariants
//!
//! - Compile errors are [`ExprError::Compile`] and become configuration errors.
//! - Undefined variables and keys are runtime errors, never silently empty.
//! - Header lookups are case-insensitive: the `headers` object folds every
//!   key it is asked for to lowercase before lookup.
//! - Each evaluation is bounded by a fuel budget and a wall-clock deadline.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use minijinja::value::{Enumerator, Object, Value, ValueKind};
use minijinja::{Environment, State, UndefinedBehavior};
use thiserror::Error;

use crate::error::Error;
use crate::model::{Event, SourceType};

/// Default wall-clock deadline per evaluation.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

const DEFAULT_FUEL: u64 = 100_000;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExprError {
    #[error("invalid expression {expression:?}: {message}")]
    Compile { expression: String, message: String },

    #[error("error evaluating {expression:?}: {message}")]
    Runtime { expression: String, message: String },

    #[error("expression {expression:?} does not return a {expected}")]
    Type {
        expression: String,
        expected: &'static str,
    },

    #[error("expression {expression:?} timed out after {timeout:?}")]
    Timeout { expression: String, timeout: Duration },
}

impl From<ExprError> for Error {
    fn from(err: ExprError) -> Self {
        match err {
            ExprError::Compile { .. } => Error::Config(err.to_string()),
            _ => Error::Validation(err.to_string()),
        }
    }
}

/// Compiles and runs expressions in a locked-down environment.
#[derive(Clone)]
pub struct Evaluator {
    env: Arc<Environment<'static>>,
    timeout: Duration,
}

impl Default for Evaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Evaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Evaluator").field("timeout", &self.timeout).finish()
    }
}

impl Evaluator {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.set_fuel(Some(DEFAULT_FUEL));
        Self {
            env: Arc::new(env),
            timeout,
        }
    }

    /// Compile without evaluating. Used when validating stage and connection specs.
    pub fn check(&self, expression: &str) -> Result<(), ExprError> {
        compile_check(&self.env, expression)
    }

    pub async fn eval_bool(&self, expression: &str, vars: &Variables) -> Result<bool, ExprError> {
        let value = self.eval(expression, vars).await?;
        if value.kind() != ValueKind::Bool {
            return Err(ExprError::Type {
                expression: expression.to_string(),
                expected: "boolean",
            });
        }
        Ok(value.is_true())
    }

    pub async fn eval_string(&self, expression: &str, vars: &Variables) -> Result<String, ExprError> {
        let value = self.eval(expression, vars).await?;
        match value.as_str() {
            Some(s) if value.kind() == ValueKind::String => Ok(s.to_string()),
            _ => Err(ExprError::Type {
                expression: expression.to_string(),
                expected: "string",
            }),
        }
    }

    async fn eval(&self, expression: &str, vars: &Variables) -> Result<Value, ExprError> {
        let env = Arc::clone(&self.env);
        let source = expression.to_string();
        let ctx = vars.to_value();

        let task = tokio::task::spawn_blocking(move || eval_blocking(&env, &source, ctx));
        match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(ExprError::Runtime {
                expression: expression.to_string(),
                message: join.to_string(),
            }),
            Err(_) => Err(ExprError::Timeout {
                expression: expression.to_string(),
                timeout: self.timeout,
            }),
        }
    }
}

fn compile_check(env: &Environment<'static>, expression: &str) -> Result<(), ExprError> {
    if expression.trim().is_empty() {
        return Err(ExprError::Compile {
            expression: expression.to_string(),
            message: "empty expression".into(),
        });
    }
    env.compile_expression(expression)
        .map(|_| ())
        .map_err(|e| ExprError::Compile {
            expression: expression.to_string(),
            message: e.to_string(),
        })
}

fn eval_blocking(env: &Environment<'static>, expression: &str, ctx: Value) -> Result<Value, ExprError> {
    if expression.trim().is_empty() {
        return Err(ExprError::Compile {
            expression: expression.to_string(),
            message: "empty expression".into(),
        });
    }
    let compiled = env.compile_expression(expression).map_err(|e| ExprError::Compile {
        expression: expression.to_string(),
        message: e.to_string(),
    })?;
    compiled.eval(ctx).map_err(|e| ExprError::Runtime {
        expression: expression.to_string(),
        message: e.to_string(),
    })
}

/// Variables visible to an expression.
#[derive(Debug, Clone, Default)]
pub struct Variables {
    values: BTreeMap<String, Value>,
}

impl Variables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Body keys promoted to top level, plus `headers`.
    pub fn for_event(event: &Event) -> Self {
        Self::new().promote(&event.raw).with_headers(&event.headers)
    }

    /// Promote every top-level key of a JSON object body.
    pub fn promote(mut self, body: &serde_json::Value) -> Self {
        if let Some(object) = body.as_object() {
            for (key, value) in object {
                self.values.insert(key.clone(), Value::from_serialize(value));
            }
        }
        self
    }

    pub fn with_headers(mut self, headers: &BTreeMap<String, String>) -> Self {
        let folded = headers
            .iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v.clone()))
            .collect();
        self.values
            .insert("headers".into(), Value::from_object(Headers(folded)));
        self
    }

    pub fn with_strings(mut self, name: &str, values: &BTreeMap<String, String>) -> Self {
        self.values.insert(name.to_string(), Value::from_serialize(values));
        self
    }

    pub fn with_json(mut self, name: &str, value: &serde_json::Value) -> Self {
        self.values.insert(name.to_string(), Value::from_serialize(value));
        self
    }

    /// Expose `self.Conn(name)` over the given per-connection event views.
    pub fn with_connections(mut self, connections: BTreeMap<String, serde_json::Value>) -> Self {
        self.values
            .insert("self".into(), Value::from_object(Connections(connections)));
        self
    }

    fn to_value(&self) -> Value {
        Value::from_serialize(&self.values)
    }
}

/// What `self.Conn(name)` returns for an event arriving through a connection.
///
/// Stage completion events additionally expose their outputs at the top
/// level; keys already present in the body win.
pub fn connection_view(event: &Event) -> serde_json::Value {
    let mut view = event.raw.clone();
    if event.source_type != SourceType::Stage {
        return view;
    }

    let outputs = event.raw.get("outputs").and_then(|o| o.as_object()).cloned();
    if let (Some(body), Some(outputs)) = (view.as_object_mut(), outputs) {
        for (key, value) in outputs {
            body.entry(key).or_insert(value);
        }
    }
    view
}

#[derive(Debug)]
struct Headers(BTreeMap<String, String>);

impl Object for Headers {
    fn get_value(self: &Arc<Self>, key: &Value) -> Option<Value> {
        let key = key.as_str()?.to_ascii_lowercase();
        self.0.get(&key).map(|v| Value::from(v.as_str()))
    }

    fn enumerate(self: &Arc<Self>) -> Enumerator {
        Enumerator::Values(self.0.keys().map(|k| Value::from(k.as_str())).collect())
    }
}

#[derive(Debug)]
struct Connections(BTreeMap<String, serde_json::Value>);

impl Object for Connections {
    fn call_method(
        self: &Arc<Self>,
        _state: &State<'_, '_>,
        method: &str,
        args: &[Value],
    ) -> Result<Value, minijinja::Error> {
        if method != "Conn" {
            return Err(minijinja::Error::new(
                minijinja::ErrorKind::InvalidOperation,
                format!("unknown method {method}"),
            ));
        }

        let name = match args {
            [name] => name.as_str().ok_or_else(|| {
                minijinja::Error::new(
                    minijinja::ErrorKind::InvalidOperation,
                    "Conn() expects a connection name",
                )
            })?,
            _ => {
                return Err(minijinja::Error::new(
                    minijinja::ErrorKind::InvalidOperation,
                    "Conn() expects exactly one argument",
                ))
            }
        };

        self.0
            .get(name)
            .map(Value::from_serialize)
            .ok_or_else(|| {
                minijinja::Error::new(
                    minijinja::ErrorKind::InvalidOperation,
                    format!("connection {name} not found"),
                )
            })
    }
}
