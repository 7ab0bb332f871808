//! Tool framework for agent capabilities.
//!
//! This module defines the [`Tool`] trait that all agent tools implement,
//! and the [`ToolRegistry`] the agent advertises to the model.
//!
//! # Example
//!
//! ```rust,ignore
//! use braid_agent::{Tool, ToolRuntime, ToolResult, ToolRegistry};
//!
//! struct Echo;
//!
//! #[async_trait]
//! impl Tool for Echo {
//!     fn name(&self) -> &str { "echo" }
//!     fn description(&self) -> &str { "Repeats its input" }
//!     fn parameters(&self) -> Value { json!({"type": "object"}) }
//!
//!     async fn execute(&self, params: Value, runtime: &ToolRuntime) -> Result<ToolResult> {
//!         Ok(ToolResult::json(params))
//!     }
//! }
//!
//! let mut registry = ToolRegistry::new();
//! registry.register(Echo);
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use braid_llm::{Content, ContentBlock, ToolDefinition, ToolMessage, ToolStatus};

use crate::error::{AgentError, Result};
use crate::runtime::RunContext;
use crate::state::AgentState;

// ─────────────────────────────────────────────────────────────────────────────
// Parameter Validation
// ─────────────────────────────────────────────────────────────────────────────

/// Error type for tool parameter extraction failures.
///
/// Messages are written for the model, so they say what to fix.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ParameterValidationError {
    /// A required parameter is missing.
    #[error("missing required parameter '{name}': {hint}")]
    MissingRequired {
        name: &'static str,
        hint: &'static str,
    },

    /// A parameter has an invalid type.
    #[error("invalid type for '{name}': expected {expected}, got {actual}")]
    InvalidType {
        name: &'static str,
        expected: &'static str,
        actual: String,
    },

    /// A parameter value doesn't match the expected set.
    #[error("'{name}' has invalid value '{value}': {message}")]
    InvalidValue {
        name: &'static str,
        value: String,
        message: String,
    },
}

impl ParameterValidationError {
    pub fn missing(name: &'static str, hint: &'static str) -> Self {
        Self::MissingRequired { name, hint }
    }

    pub fn invalid_type(
        name: &'static str,
        expected: &'static str,
        actual: impl Into<String>,
    ) -> Self {
        Self::InvalidType {
            name,
            expected,
            actual: actual.into(),
        }
    }

    pub fn invalid_value(
        name: &'static str,
        value: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::InvalidValue {
            name,
            value: value.into(),
            message: message.into(),
        }
    }
}

impl From<ParameterValidationError> for AgentError {
    fn from(err: ParameterValidationError) -> Self {
        AgentError::Tool(err.to_string())
    }
}

/// Result type for parameter extraction.
pub type ParamResult<T> = std::result::Result<T, ParameterValidationError>;

/// Typed access to tool arguments.
pub trait ParamExt {
    fn required_str(&self, name: &'static str, hint: &'static str) -> ParamResult<&str>;
    fn optional_str(&self, name: &str) -> Option<&str>;
    fn required_f64(&self, name: &'static str, hint: &'static str) -> ParamResult<f64>;
    fn required_i64(&self, name: &'static str, hint: &'static str) -> ParamResult<i64>;
    fn optional_i64(&self, name: &str, default: i64) -> i64;
    fn optional_bool(&self, name: &str, default: bool) -> bool;
    fn optional_array(&self, name: &str) -> Option<&Vec<serde_json::Value>>;
}

fn type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

impl ParamExt for serde_json::Value {
    fn required_str(&self, name: &'static str, hint: &'static str) -> ParamResult<&str> {
        match self.get(name) {
            None => Err(ParameterValidationError::missing(name, hint)),
            Some(value) => value
                .as_str()
                .ok_or_else(|| ParameterValidationError::invalid_type(name, "string", type_name(value))),
        }
    }

    fn optional_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|v| v.as_str())
    }

    fn required_f64(&self, name: &'static str, hint: &'static str) -> ParamResult<f64> {
        match self.get(name) {
            None => Err(ParameterValidationError::missing(name, hint)),
            Some(value) => value
                .as_f64()
                .ok_or_else(|| ParameterValidationError::invalid_type(name, "number", type_name(value))),
        }
    }

    fn required_i64(&self, name: &'static str, hint: &'static str) -> ParamResult<i64> {
        match self.get(name) {
            None => Err(ParameterValidationError::missing(name, hint)),
            Some(value) => value.as_i64().ok_or_else(|| {
                ParameterValidationError::invalid_type(name, "integer", type_name(value))
            }),
        }
    }

    fn optional_i64(&self, name: &str, default: i64) -> i64 {
        self.get(name).and_then(|v| v.as_i64()).unwrap_or(default)
    }

    fn optional_bool(&self, name: &str, default: bool) -> bool {
        self.get(name).and_then(|v| v.as_bool()).unwrap_or(default)
    }

    fn optional_array(&self, name: &str) -> Option<&Vec<serde_json::Value>> {
        self.get(name).and_then(|v| v.as_array())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tool Trait
// ─────────────────────────────────────────────────────────────────────────────

/// Trait for agent tools.
///
/// Each tool defines its parameters as a JSON Schema; arguments are
/// validated against it before [`Tool::execute`] runs.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Get the unique name of this tool.
    fn name(&self) -> &str;

    /// Get a human-readable description of what this tool does.
    fn description(&self) -> &str;

    /// Get the JSON Schema for this tool's parameters.
    fn parameters(&self) -> serde_json::Value;

    /// End the run as soon as this tool's result is recorded.
    fn return_direct(&self) -> bool {
        false
    }

    /// Execute the tool with already-validated parameters.
    ///
    /// Returning `Err` turns into an error tool message for the model,
    /// except for cancellation and interrupts, which propagate.
    async fn execute(&self, params: serde_json::Value, runtime: &ToolRuntime)
    -> Result<ToolResult>;
}

/// Tool definitions in registration order.
pub fn definitions_for(tools: &[Arc<dyn Tool>]) -> Vec<ToolDefinition> {
    tools
        .iter()
        .map(|tool| ToolDefinition::new(tool.name(), tool.description(), tool.parameters()))
        .collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Tool Runtime
// ─────────────────────────────────────────────────────────────────────────────

/// Context provided to tools during execution.
#[derive(Debug, Clone)]
pub struct ToolRuntime {
    /// Id of the call being answered.
    pub tool_call_id: String,
    /// Snapshot of the agent state when the tool node started.
    pub state: Arc<AgentState>,
    pub run: RunContext,
}

impl ToolRuntime {
    pub fn new(tool_call_id: impl Into<String>, state: Arc<AgentState>, run: RunContext) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            state,
            run,
        }
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.run.cancellation
    }

    /// Check if execution has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.run.is_cancelled()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tool Result
// ─────────────────────────────────────────────────────────────────────────────

/// Result of a tool execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolResult {
    /// Successful text output.
    Text { content: String },
    /// Successful JSON output.
    Json { content: serde_json::Value },
    /// Successful multimodal output.
    Blocks { content: Vec<ContentBlock> },
    /// Tool execution failed.
    Error {
        message: String,
        /// Whether the model can reasonably try again.
        recoverable: bool,
    },
}

impl ToolResult {
    pub fn text(content: impl Into<String>) -> Self {
        Self::Text {
            content: content.into(),
        }
    }

    pub fn json(content: serde_json::Value) -> Self {
        Self::Json { content }
    }

    pub fn blocks(content: Vec<ContentBlock>) -> Self {
        Self::Blocks { content }
    }

    /// Create a recoverable error result.
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            recoverable: true,
        }
    }

    /// Create a non-recoverable error result.
    pub fn fatal_error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            recoverable: false,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }

    /// Message content for the model.
    pub fn into_content(self) -> Content {
        match self {
            Self::Text { content } => Content::Text(content),
            Self::Json { content } => Content::Text(
                serde_json::to_string_pretty(&content).unwrap_or_else(|_| content.to_string()),
            ),
            Self::Blocks { content } => Content::Blocks(content),
            Self::Error { message, .. } => Content::Text(format!("Error: {message}")),
        }
    }

    /// The tool message answering `tool_call_id`.
    pub fn into_message(self, tool_call_id: &str, tool_name: &str) -> ToolMessage {
        let status = if self.is_error() {
            ToolStatus::Error
        } else {
            ToolStatus::Success
        };
        let mut message = ToolMessage::new(tool_call_id, self.into_content()).with_name(tool_name);
        message.status = status;
        message
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tool Registry
// ─────────────────────────────────────────────────────────────────────────────

/// Ordered collection of tools available to the agent.
///
/// Definitions are advertised in registration order.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool, replacing any tool with the same name in place.
    pub fn register<T: Tool + 'static>(&mut self, tool: T) {
        self.register_arc(Arc::new(tool));
    }

    /// Register a tool from an Arc.
    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        match self.tools.iter().position(|t| t.name() == tool.name()) {
            Some(index) => self.tools[index] = tool,
            None => self.tools.push(tool),
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.name() == name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.iter().any(|t| t.name() == name)
    }

    /// Tool names in registration order.
    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn tools(&self) -> &[Arc<dyn Tool>] {
        &self.tools
    }

    /// Convert all tools to model tool definitions.
    pub fn to_definitions(&self) -> Vec<ToolDefinition> {
        definitions_for(&self.tools)
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Mock Tool (for testing)
// ─────────────────────────────────────────────────────────────────────────────

/// A mock tool for testing.
///
/// Returns a configurable response and records the arguments of each call.
#[cfg(test)]
#[derive(Debug)]
pub struct MockTool {
    name: String,
    description: String,
    parameters: serde_json::Value,
    response: std::sync::Mutex<Option<ToolResult>>,
    calls: std::sync::Mutex<Vec<serde_json::Value>>,
}

#[cfg(test)]
impl MockTool {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: "A mock tool for testing".to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {}
            }),
            response: std::sync::Mutex::new(None),
            calls: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn with_parameters(mut self, parameters: serde_json::Value) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_response(self, response: ToolResult) -> Self {
        *self.response.lock().unwrap() = Some(response);
        self
    }

    pub fn calls(&self) -> Vec<serde_json::Value> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[cfg(test)]
#[async_trait]
impl Tool for MockTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters(&self) -> serde_json::Value {
        self.parameters.clone()
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        _runtime: &ToolRuntime,
    ) -> Result<ToolResult> {
        self.calls.lock().unwrap().push(params);
        Ok(self
            .response
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| ToolResult::text("mock result")))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn runtime() -> ToolRuntime {
        ToolRuntime::new("call_1", Arc::new(AgentState::default()), RunContext::new("t"))
    }

    #[test]
    fn test_param_ext() {
        let params = json!({"path": "/tmp", "count": 3, "ratio": 0.5, "flag": true});
        assert_eq!(params.required_str("path", "a path").unwrap(), "/tmp");
        assert_eq!(params.required_i64("count", "a count").unwrap(), 3);
        assert_eq!(params.required_f64("ratio", "a ratio").unwrap(), 0.5);
        assert!(params.optional_bool("flag", false));
        assert_eq!(params.optional_i64("missing", 7), 7);

        let err = params.required_str("count", "a string").unwrap_err();
        assert!(matches!(
            err,
            ParameterValidationError::InvalidType { actual, .. } if actual == "number"
        ));
        let err = params.required_str("absent", "provide it").unwrap_err();
        assert_eq!(
            err.to_string(),
            "missing required parameter 'absent': provide it"
        );
    }

    #[test]
    fn test_tool_result_content() {
        assert_eq!(ToolResult::text("hi").into_content().text(), "hi");
        assert_eq!(
            ToolResult::error("nope").into_content().text(),
            "Error: nope"
        );
        let json = ToolResult::json(json!({"a": 1})).into_content().text();
        assert!(json.contains("\"a\": 1"));
    }

    #[test]
    fn test_tool_result_into_message() {
        let ok = ToolResult::text("4").into_message("c1", "calculator");
        assert_eq!(ok.tool_call_id, "c1");
        assert_eq!(ok.base.name.as_deref(), Some("calculator"));
        assert!(!ok.is_error());

        let err = ToolResult::error("bad").into_message("c2", "calculator");
        assert!(err.is_error());
    }

    #[test]
    fn test_registry_keeps_registration_order() {
        let mut registry = ToolRegistry::new();
        registry.register(MockTool::new("b"));
        registry.register(MockTool::new("a"));
        registry.register(MockTool::new("b").with_response(ToolResult::text("replaced")));

        assert_eq!(registry.names(), vec!["b", "a"]);
        let defs = registry.to_definitions();
        assert_eq!(defs[0].name, "b");
        assert_eq!(defs[1].name, "a");
    }

    #[tokio::test]
    async fn test_mock_tool_records_calls() {
        let tool = MockTool::new("echo").with_response(ToolResult::json(json!({"ok": true})));
        let result = tool.execute(json!({"x": 1}), &runtime()).await.unwrap();

        assert_eq!(result, ToolResult::json(json!({"ok": true})));
        assert_eq!(tool.call_count(), 1);
        assert_eq!(tool.calls()[0], json!({"x": 1}));
    }
}
