//! Tool registry: named, schema-typed capabilities the agent can invoke.
//!
//! Every tool declares a [`ToolSpec`] (name, description, parameter types) and
//! a [`ToolHandler`]. [`ToolRegistry::dispatch`] resolves the name, coerces the
//! model-supplied JSON against the declared parameters, and runs the handler.
//! Handler failures come back as observation text carrying [`ERROR_MARKER`];
//! only unknown tools, bad input and exhausted transport retries surface as
//! [`DispatchError`].

mod schema;
mod sql;

use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

pub use schema::{SchemaRetriever, SCHEMA_TOOL_NAME};
pub use sql::{check_select_only, GuardRejection, SqlExecutor, SQL_TOOL_NAME};

/// Prefix of every observation produced from a failed handler.
pub const ERROR_MARKER: &str = "Error:";

/// Validated tool arguments.
pub type ToolInput = Map<String, Value>;

/// Expected JSON type of a tool parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
}

impl ParamType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Integer => "integer",
            ParamType::Number => "number",
            ParamType::Boolean => "boolean",
        }
    }

    /// Coerce `value` to this type, or explain why it does not fit.
    fn coerce(&self, value: &Value) -> Result<Value, String> {
        match (self, value) {
            (ParamType::String, Value::String(_)) => Ok(value.clone()),
            (ParamType::String, Value::Number(n)) => Ok(Value::String(n.to_string())),
            (ParamType::String, Value::Bool(b)) => Ok(Value::String(b.to_string())),

            (ParamType::Integer, Value::Number(n)) if n.is_i64() || n.is_u64() => {
                Ok(value.clone())
            }
            (ParamType::Integer, Value::String(s)) => s
                .trim()
                .parse::<i64>()
                .map(Value::from)
                .map_err(|_| format!("expected integer, got string {:?}", s)),

            (ParamType::Number, Value::Number(_)) => Ok(value.clone()),
            (ParamType::Number, Value::String(s)) => s
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| format!("expected number, got string {:?}", s)),

            (ParamType::Boolean, Value::Bool(_)) => Ok(value.clone()),
            (ParamType::Boolean, Value::String(s)) => match s.trim() {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                _ => Err(format!("expected boolean, got string {:?}", s)),
            },

            (expected, other) => Err(format!(
                "expected {}, got {}",
                expected.as_str(),
                json_type_name(other)
            )),
        }
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Declaration of a tool as shown to the model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// Parameter name to expected type; every parameter is required.
    pub input_schema: BTreeMap<String, ParamType>,
}

impl ToolSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema: BTreeMap::new(),
        }
    }

    pub fn param(mut self, name: impl Into<String>, kind: ParamType) -> Self {
        self.input_schema.insert(name.into(), kind);
        self
    }

    /// Example input object, e.g. `{"sql_query": "<string>"}`.
    pub fn input_example(&self) -> String {
        let fields = self
            .input_schema
            .iter()
            .map(|(name, kind)| format!("\"{}\": <{}>", name, kind.as_str()))
            .collect::<Vec<_>>()
            .join(", ");
        format!("{{{}}}", fields)
    }

    /// Check and coerce `input` against the declared parameters.
    pub fn validate(&self, input: &Map<String, Value>) -> Result<ToolInput, String> {
        if let Some(extra) = input.keys().find(|k| !self.input_schema.contains_key(*k)) {
            return Err(format!("unexpected parameter '{}'", extra));
        }

        let mut coerced = Map::new();
        for (name, kind) in &self.input_schema {
            let value = input
                .get(name)
                .ok_or_else(|| format!("missing required parameter '{}'", name))?;
            let value = kind
                .coerce(value)
                .map_err(|e| format!("parameter '{}': {}", name, e))?;
            coerced.insert(name.clone(), value);
        }
        Ok(coerced)
    }
}

/// Failure reported by a tool handler.
#[derive(Debug, Error)]
pub enum ToolError {
    /// Recoverable: shown to the model as an error observation.
    #[error("{0}")]
    Failed(String),

    /// A network dependency exhausted its retry budget.
    #[error("transport failure: {0}")]
    Transport(String),
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("unknown tool '{name}'; available tools: {}", available.join(", "))]
    UnknownTool { name: String, available: Vec<String> },

    #[error("invalid input for tool '{tool}': {reason}")]
    InvalidInput { tool: String, reason: String },

    #[error("tool '{0}' is already registered")]
    DuplicateTool(String),

    #[error("tool '{tool}' could not reach its backend: {message}")]
    Transport { tool: String, message: String },
}

/// Executable side of a tool.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, input: &ToolInput) -> Result<String, ToolError>;

    /// Whether the backing services initialized.
    fn is_ready(&self) -> bool {
        true
    }
}

struct Registered {
    spec: ToolSpec,
    handler: Arc<dyn ToolHandler>,
}

/// Registry of available tools, in registration order.
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<Registered>,
    by_name: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with schema retrieval and SQL execution.
    pub fn with_default_tools(retriever: SchemaRetriever, executor: SqlExecutor) -> Self {
        let tools = vec![
            Registered {
                spec: SchemaRetriever::spec(),
                handler: Arc::new(retriever),
            },
            Registered {
                spec: SqlExecutor::spec(),
                handler: Arc::new(executor),
            },
        ];
        let by_name = tools
            .iter()
            .enumerate()
            .map(|(i, t)| (t.spec.name.clone(), i))
            .collect();
        Self { tools, by_name }
    }

    pub fn register(
        &mut self,
        spec: ToolSpec,
        handler: Arc<dyn ToolHandler>,
    ) -> Result<(), DispatchError> {
        if self.by_name.contains_key(&spec.name) {
            return Err(DispatchError::DuplicateTool(spec.name));
        }
        self.by_name.insert(spec.name.clone(), self.tools.len());
        self.tools.push(Registered { spec, handler });
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn spec(&self, name: &str) -> Option<&ToolSpec> {
        self.by_name.get(name).map(|&i| &self.tools[i].spec)
    }

    pub fn specs(&self) -> impl Iterator<Item = &ToolSpec> {
        self.tools.iter().map(|t| &t.spec)
    }

    /// Readiness of the handler registered as `name`.
    pub fn is_ready(&self, name: &str) -> Option<bool> {
        self.by_name
            .get(name)
            .map(|&i| self.tools[i].handler.is_ready())
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.spec.name.clone()).collect()
    }

    /// Resolve `name`, validate `input`, and run the handler.
    pub async fn dispatch(
        &self,
        name: &str,
        input: &Map<String, Value>,
    ) -> Result<String, DispatchError> {
        let tool = self
            .by_name
            .get(name)
            .map(|&i| &self.tools[i])
            .ok_or_else(|| DispatchError::UnknownTool {
                name: name.to_string(),
                available: self.names(),
            })?;

        let input = tool
            .spec
            .validate(input)
            .map_err(|reason| DispatchError::InvalidInput {
                tool: name.to_string(),
                reason,
            })?;

        tracing::info!("Dispatching tool: {}", name);
        let outcome = AssertUnwindSafe(tool.handler.call(&input))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(text)) => Ok(text),
            Ok(Err(ToolError::Failed(message))) => {
                tracing::warn!("Tool {} failed: {}", name, message);
                Ok(format!("{} {}", ERROR_MARKER, message))
            }
            Ok(Err(ToolError::Transport(message))) => Err(DispatchError::Transport {
                tool: name.to_string(),
                message,
            }),
            Err(panic) => {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::error!("Tool {} panicked: {}", name, detail);
                Ok(format!(
                    "{} tool '{}' crashed unexpectedly: {}",
                    ERROR_MARKER, name, detail
                ))
            }
        }
    }
}
