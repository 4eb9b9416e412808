use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::event::SourceType;
use crate::error::{Error, Result};

/// Edge from an event source or stage into a stage.
///
/// Stored as an adjacency row keyed by (source, target stage); cycles
/// between stages are allowed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub id: Uuid,
    pub stage_id: Uuid,
    pub source_id: Uuid,
    pub source_name: String,
    pub source_type: SourceType,
    #[serde(default)]
    pub filters: Vec<Filter>,
    #[serde(default)]
    pub filter_operator: FilterOperator,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Filter {
    /// Boolean expression over the event body.
    Data { expression: String },
    /// Boolean expression over the lowercased headers.
    Header { expression: String },
}

impl Filter {
    pub fn data(expression: impl Into<String>) -> Self {
        Filter::Data {
            expression: expression.into(),
        }
    }

    pub fn header(expression: impl Into<String>) -> Self {
        Filter::Header {
            expression: expression.into(),
        }
    }

    pub fn expression(&self) -> &str {
        match self {
            Filter::Data { expression } | Filter::Header { expression } => expression,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Filter::Data { .. } => "data",
            Filter::Header { .. } => "header",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterOperator {
    #[default]
    And,
    Or,
}

impl FilterOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOperator::And => "and",
            FilterOperator::Or => "or",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "and" => Ok(FilterOperator::And),
            "or" => Ok(FilterOperator::Or),
            other => Err(Error::Config(format!("invalid filter operator {other:?}"))),
        }
    }
}
