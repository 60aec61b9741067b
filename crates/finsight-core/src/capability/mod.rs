//! Invocable capabilities (tools) and their registry.

mod rate_limit;
mod registry;
mod retry;

pub use rate_limit::RateLimiter;
pub use registry::{CapabilityRegistry, DispatchFailure, PluginReport, RegistryError};
pub use retry::RetryPolicy;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::memory::EntryKind;
use crate::sandbox::Namespace;

const PREVIEW_ROWS: usize = 5;
const PREVIEW_CHARS: usize = 1_500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
}

impl ParamType {
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            ParamType::String => value.is_string(),
            ParamType::Integer => value.is_i64() || value.is_u64(),
            ParamType::Number => value.is_number(),
            ParamType::Boolean => value.is_boolean(),
            ParamType::Array => value.is_array(),
            ParamType::Object => value.is_object(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Integer => "integer",
            ParamType::Number => "number",
            ParamType::Boolean => "boolean",
            ParamType::Array => "array",
            ParamType::Object => "object",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    pub kind: ParamType,
    pub required: bool,
    #[serde(default)]
    pub description: String,
}

impl ParamSpec {
    pub fn required(name: impl Into<String>, kind: ParamType) -> Self {
        Self {
            name: name.into(),
            kind,
            required: true,
            description: String::new(),
        }
    }

    pub fn optional(name: impl Into<String>, kind: ParamType) -> Self {
        Self {
            required: false,
            ..Self::required(name, kind)
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// One result produced by a capability, with provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub name: String,
    pub description: String,
    pub payload: Value,
    pub source: String,
    pub kind: EntryKind,
}

impl ToolOutput {
    /// A single-element array payload is stored as its only element.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        payload: Value,
        source: impl Into<String>,
    ) -> Self {
        let payload = match payload {
            Value::Array(mut items) if items.len() == 1 => items.remove(0),
            other => other,
        };
        Self {
            name: name.into(),
            description: description.into(),
            payload,
            source: source.into(),
            kind: EntryKind::Dataset,
        }
    }

    pub fn with_kind(mut self, kind: EntryKind) -> Self {
        self.kind = kind;
        self
    }

    /// Partial rendering of the payload suitable for an observation.
    pub fn preview(&self) -> String {
        let body = match &self.payload {
            Value::Array(rows) if rows.len() > PREVIEW_ROWS => {
                let head: Vec<String> = rows
                    .iter()
                    .take(PREVIEW_ROWS)
                    .map(Value::to_string)
                    .collect();
                format!("{}\n... ({} rows total)", head.join("\n"), rows.len())
            }
            Value::Array(rows) => rows
                .iter()
                .map(Value::to_string)
                .collect::<Vec<_>>()
                .join("\n"),
            Value::String(text) => text.clone(),
            other => other.to_string(),
        };
        format!(
            "[{}] {} (source: {})\n{}",
            self.name,
            self.description,
            self.source,
            truncate(&body, PREVIEW_CHARS)
        )
    }
}

pub(crate) fn truncate(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(limit).collect();
    cut.push_str("...");
    cut
}

/// Per-invocation context handed to capabilities.
#[derive(Debug, Clone, Copy)]
pub struct InvocationContext<'a> {
    pub run_id: &'a str,
    pub task_id: &'a str,
    /// Code namespace of the calling run, if it has one.
    pub namespace: Option<&'a Namespace>,
}

impl<'a> InvocationContext<'a> {
    pub fn new(run_id: &'a str, task_id: &'a str) -> Self {
        Self {
            run_id,
            task_id,
            namespace: None,
        }
    }

    pub fn with_namespace(mut self, namespace: &'a Namespace) -> Self {
        self.namespace = Some(namespace);
        self
    }
}

/// Failure reported by a capability implementation.
#[derive(Debug, Error)]
pub enum CapabilityError {
    /// Network, timeout or throttling; retried at the dispatch boundary.
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("{0}")]
    Failed(String),
}

impl From<anyhow::Error> for CapabilityError {
    fn from(err: anyhow::Error) -> Self {
        CapabilityError::Failed(format!("{err:#}"))
    }
}

#[async_trait]
pub trait Capability: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn parameters(&self) -> Vec<ParamSpec>;

    fn category(&self) -> &str {
        "general"
    }

    /// External service this capability calls, for rate limiting.
    fn service(&self) -> Option<&str> {
        None
    }

    async fn invoke(
        &self,
        args: &Map<String, Value>,
        ctx: &InvocationContext<'_>,
    ) -> Result<Vec<ToolOutput>, CapabilityError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn single_element_arrays_are_unwrapped() {
        let output = ToolOutput::new(
            "balance_sheet",
            "Balance sheet for 600519",
            json!([{"total_assets": 10}]),
            "exchange filings",
        );
        assert_eq!(output.payload, json!({"total_assets": 10}));
        assert_eq!(output.kind, EntryKind::Dataset);
    }

    #[test]
    fn preview_truncates_long_tables() {
        let rows: Vec<Value> = (0..12).map(|i| json!({"year": 2010 + i})).collect();
        let output = ToolOutput::new("history", "Revenue history", Value::Array(rows), "feed");
        let preview = output.preview();
        assert!(preview.contains("(12 rows total)"));
        assert!(preview.contains("2014"));
        assert!(!preview.contains("2015"));
    }

    #[test]
    fn param_types_check_json_values() {
        assert!(ParamType::Integer.accepts(&json!(3)));
        assert!(!ParamType::Integer.accepts(&json!(3.5)));
        assert!(ParamType::Number.accepts(&json!(3.5)));
        assert!(!ParamType::String.accepts(&json!(1)));
        assert!(ParamType::Object.accepts(&json!({})));
    }
}
