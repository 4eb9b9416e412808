use chrono::{DateTime, Datelike, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::execution::ExecutionResult;
use crate::error::{Error, Result};

/// A stage: where events accumulate before gated admission into an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    pub id: Uuid,
    pub canvas_id: Uuid,
    pub name: String,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    pub run_template: RunTemplate,
    #[serde(default)]
    pub inputs: Vec<InputDefinition>,
    #[serde(default)]
    pub outputs: Vec<OutputDefinition>,
    #[serde(default)]
    pub input_mappings: Vec<InputMapping>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag_usage: Option<TagUsage>,
    /// Secret references exposed to the run template as `secrets.<name>`.
    #[serde(default)]
    pub secrets: Vec<ValueDefinition>,
}

impl Stage {
    /// A stage with no conditions, inputs, outputs or tags.
    pub fn new(
        canvas_id: Uuid,
        name: impl Into<String>,
        created_by: impl Into<String>,
        run_template: RunTemplate,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            canvas_id,
            name: name.into(),
            created_by: created_by.into(),
            created_at: now,
            updated_at: now,
            conditions: Vec::new(),
            run_template,
            inputs: Vec::new(),
            outputs: Vec::new(),
            input_mappings: Vec::new(),
            tag_usage: None,
            secrets: Vec::new(),
        }
    }

    /// Highest approval count demanded by the stage's conditions, if any.
    pub fn approvals_required(&self) -> Option<u32> {
        self.conditions
            .iter()
            .filter_map(|c| match c {
                Condition::Approval { count } => Some(*count),
                _ => None,
            })
            .max()
    }

    pub fn time_windows(&self) -> impl Iterator<Item = &TimeWindow> {
        self.conditions.iter().filter_map(|c| match c {
            Condition::TimeWindow(window) => Some(window),
            _ => None,
        })
    }

    pub fn has_output(&self, name: &str) -> bool {
        self.outputs.iter().any(|o| o.name == name)
    }

    /// Names of required outputs absent from `outputs`.
    pub fn missing_required_outputs(
        &self,
        outputs: &serde_json::Map<String, serde_json::Value>,
    ) -> Vec<String> {
        self.outputs
            .iter()
            .filter(|o| o.required && !outputs.contains_key(&o.name))
            .map(|o| o.name.clone())
            .collect()
    }
}

/// Admission condition of a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Condition {
    Approval { count: u32 },
    TimeWindow(TimeWindow),
}

impl Condition {
    pub fn validate(&self) -> Result<()> {
        match self {
            Condition::Approval { count } if *count == 0 => {
                Err(Error::Config("approval count must be greater than zero".into()))
            }
            Condition::Approval { .. } => Ok(()),
            Condition::TimeWindow(window) => window.validate(),
        }
    }
}

/// Daily UTC window restricted to a set of weekdays.
///
/// A window whose start is after its end wraps past midnight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: String,
    pub end: String,
    pub week_days: Vec<String>,
}

impl TimeWindow {
    pub fn new(start: &str, end: &str, week_days: &[&str]) -> Self {
        Self {
            start: start.to_string(),
            end: end.to_string(),
            week_days: week_days.iter().map(|d| d.to_string()).collect(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        parse_clock(&self.start).map_err(|_| Error::Config(format!("invalid start: {}", self.start)))?;
        parse_clock(&self.end).map_err(|_| Error::Config(format!("invalid end: {}", self.end)))?;

        if self.week_days.is_empty() {
            return Err(Error::Config("missing week day list".into()));
        }

        for day in &self.week_days {
            parse_weekday(day).ok_or_else(|| Error::Config(format!("invalid day {day}")))?;
        }

        Ok(())
    }

    /// Check `now` against the window. The error explains which bound failed.
    pub fn evaluate(&self, now: DateTime<Utc>) -> std::result::Result<(), String> {
        let start = parse_clock(&self.start).map_err(|e| e.to_string())?;
        let end = parse_clock(&self.end).map_err(|e| e.to_string())?;

        let today = now.weekday();
        if !self.week_days.iter().any(|d| parse_weekday(d) == Some(today)) {
            return Err(format!(
                "current day - {} - is outside week days allowed - {}",
                weekday_name(today),
                self.week_days.join(", ")
            ));
        }

        let time = now.time();
        let inside = if start < end {
            start <= time && time < end
        } else {
            time >= start || time < end
        };

        if inside {
            Ok(())
        } else {
            Err(format!(
                "{} is not in time window {}-{}",
                time.format("%H:%M"),
                self.start,
                self.end
            ))
        }
    }

    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        self.evaluate(now).is_ok()
    }
}

fn parse_clock(value: &str) -> std::result::Result<NaiveTime, chrono::ParseError> {
    NaiveTime::parse_from_str(value, "%H:%M")
}

pub(crate) fn parse_weekday(name: &str) -> Option<Weekday> {
    match name {
        "Monday" => Some(Weekday::Mon),
        "Tuesday" => Some(Weekday::Tue),
        "Wednesday" => Some(Weekday::Wed),
        "Thursday" => Some(Weekday::Thu),
        "Friday" => Some(Weekday::Fri),
        "Saturday" => Some(Weekday::Sat),
        "Sunday" => Some(Weekday::Sun),
        _ => None,
    }
}

fn weekday_name(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "Monday",
        Weekday::Tue => "Tuesday",
        Weekday::Wed => "Wednesday",
        Weekday::Thu => "Thursday",
        Weekday::Fri => "Friday",
        Weekday::Sat => "Saturday",
        Weekday::Sun => "Sunday",
    }
}

/// Executor-agnostic blueprint of the downstream invocation.
///
/// `kind` selects the executor; `spec` may carry `${{ ... }}` placeholders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunTemplate {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub spec: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub required: bool,
}

/// Maps a triggering connection (or any connection) to input values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputMapping {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<MappingCondition>,
    pub values: Vec<ValueDefinition>,
}

impl InputMapping {
    /// Connection this mapping is restricted to; `None` means unconditional.
    pub fn triggered_by(&self) -> Option<&str> {
        self.when.as_ref().map(|w| w.triggered_by.connection.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingCondition {
    pub triggered_by: TriggeredBy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggeredBy {
    pub connection: String,
}

/// A named value: literal or derived.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_from: Option<ValueFrom>,
}

impl ValueDefinition {
    pub fn literal(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Some(value.into()),
            value_from: None,
        }
    }

    pub fn from_event(name: impl Into<String>, connection: impl Into<String>, expression: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: None,
            value_from: Some(ValueFrom::EventData(EventDataRef {
                connection: connection.into(),
                expression: expression.into(),
            })),
        }
    }

    pub fn from_last_execution(name: impl Into<String>, results: Vec<ExecutionResult>) -> Self {
        Self {
            name: name.into(),
            value: None,
            value_from: Some(ValueFrom::LastExecution(LastExecutionRef { results })),
        }
    }

    pub fn from_secret(name: impl Into<String>, secret: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: None,
            value_from: Some(ValueFrom::Secret(SecretRef {
                name: secret.into(),
                key: key.into(),
            })),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueFrom {
    EventData(EventDataRef),
    LastExecution(LastExecutionRef),
    Secret(SecretRef),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventDataRef {
    pub connection: String,
    pub expression: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastExecutionRef {
    pub results: Vec<ExecutionResult>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretRef {
    pub name: String,
    pub key: String,
}

/// Which connections supply which tags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagUsage {
    pub from: Vec<String>,
    pub tags: Vec<TagDefinition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagDefinition {
    pub name: String,
    /// String expression evaluated against the event body.
    pub value_from: String,
}
