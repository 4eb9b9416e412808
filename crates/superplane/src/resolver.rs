//! Run template placeholder substitution.
//!
//! Every string in the spec is scanned for `${{ <expression> }}`. Each unique
//! expression is evaluated once with `inputs` and `secrets` in scope and the
//! token is replaced by its string result. Strings without tokens pass
//! through untouched, as do non-string values.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::expr::{Evaluator, Variables};

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{\{(.*?)\}\}").expect("invalid placeholder pattern"));

static SIMPLE_REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(inputs|secrets)\.([A-Za-z_][A-Za-z0-9_]*)$").expect("invalid reference pattern")
});

#[derive(Debug, Clone, Default)]
pub struct SpecResolver {
    evaluator: Evaluator,
}

impl SpecResolver {
    pub fn new(evaluator: Evaluator) -> Self {
        Self { evaluator }
    }

    pub async fn resolve(
        &self,
        spec: &Map<String, Value>,
        inputs: &BTreeMap<String, String>,
        secrets: &BTreeMap<String, String>,
    ) -> Result<Map<String, Value>> {
        let mut expressions = BTreeSet::new();
        for value in spec.values() {
            collect(value, &mut expressions);
        }

        let vars = Variables::new()
            .with_strings("inputs", inputs)
            .with_strings("secrets", secrets);

        let mut resolved = HashMap::new();
        for expression in expressions {
            let value = self.evaluate(&expression, inputs, secrets, &vars).await?;
            resolved.insert(expression, value);
        }

        Ok(spec
            .iter()
            .map(|(k, v)| (k.clone(), substitute(v, &resolved)))
            .collect())
    }

    async fn evaluate(
        &self,
        expression: &str,
        inputs: &BTreeMap<String, String>,
        secrets: &BTreeMap<String, String>,
        vars: &Variables,
    ) -> Result<String> {
        if expression.is_empty() {
            return Err(Error::Validation("empty expression in ${{ }}".into()));
        }

        if let Some(reference) = SIMPLE_REFERENCE.captures(expression) {
            let (namespace, name) = (&reference[1], &reference[2]);
            let known = match namespace {
                "inputs" => inputs.contains_key(name),
                _ => secrets.contains_key(name),
            };
            if !known {
                let kind = if namespace == "inputs" { "input" } else { "secret" };
                return Err(Error::Validation(format!("{kind} {name} not found")));
            }
        }

        Ok(self.evaluator.eval_string(expression, vars).await?)
    }
}

fn collect(value: &Value, out: &mut BTreeSet<String>) {
    match value {
        Value::String(s) => {
            for caps in PLACEHOLDER.captures_iter(s) {
                out.insert(caps[1].trim().to_string());
            }
        }
        Value::Array(items) => items.iter().for_each(|v| collect(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect(v, out)),
        _ => {}
    }
}

fn substitute(value: &Value, resolved: &HashMap<String, String>) -> Value {
    match value {
        Value::String(s) if PLACEHOLDER.is_match(s) => {
            let replaced = PLACEHOLDER.replace_all(s, |caps: &Captures| {
                resolved
                    .get(caps[1].trim())
                    .cloned()
                    .unwrap_or_default()
            });
            Value::String(replaced.into_owned())
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| substitute(v, resolved)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute(v, resolved)))
                .collect(),
        ),
        other => other.clone(),
    }
}
