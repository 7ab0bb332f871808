//! Human approval for selected tool calls.
//!
//! A guarded tool call suspends the run with an interrupt whose id is the
//! tool call id. The caller resumes with a [`Decision`] for that id.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use braid_llm::ToolMessage;

use super::{Middleware, ToolCallRequest, ToolCallResponse, ToolNext};
use crate::error::{AgentError, Result};

/// The kinds of answer a reviewer may give.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    Approve,
    Edit,
    Reject,
}

/// A reviewer's answer to one interrupted tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Decision {
    /// Run the call as requested.
    Approve,
    /// Run the call with these arguments merged over the requested ones.
    Edit { args: Value },
    /// Do not run the call; the model sees `message` as an error result.
    Reject {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

impl Decision {
    pub fn kind(&self) -> DecisionKind {
        match self {
            Decision::Approve => DecisionKind::Approve,
            Decision::Edit { .. } => DecisionKind::Edit,
            Decision::Reject { .. } => DecisionKind::Reject,
        }
    }

    /// Resume value for this decision.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// How one tool is guarded.
#[derive(Debug, Clone, PartialEq)]
pub struct InterruptOnConfig {
    pub allowed_decisions: Vec<DecisionKind>,
    pub description: Option<String>,
}

impl InterruptOnConfig {
    /// Allow every decision.
    pub fn all() -> Self {
        Self {
            allowed_decisions: vec![DecisionKind::Approve, DecisionKind::Edit, DecisionKind::Reject],
            description: None,
        }
    }

    pub fn only(decisions: impl IntoIterator<Item = DecisionKind>) -> Self {
        Self {
            allowed_decisions: decisions.into_iter().collect(),
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Suspends guarded tool calls until a reviewer decides.
#[derive(Debug, Clone, Default)]
pub struct HumanInTheLoopMiddleware {
    interrupt_on: HashMap<String, InterruptOnConfig>,
}

impl HumanInTheLoopMiddleware {
    pub fn new() -> Self {
        Self::default()
    }

    /// Guard `tool` with the given decisions.
    pub fn interrupt_on(mut self, tool: impl Into<String>, config: InterruptOnConfig) -> Self {
        self.interrupt_on.insert(tool.into(), config);
        self
    }

    fn payload(&self, request: &ToolCallRequest, config: &InterruptOnConfig) -> Value {
        json!({
            "action": "tool_call",
            "tool": request.tool_call.name,
            "tool_call_id": request.tool_call.id,
            "args": request.tool_call.args,
            "allowed_decisions": config.allowed_decisions,
            "description": config
                .description
                .clone()
                .unwrap_or_else(|| format!("Tool '{}' requires approval", request.tool_call.name)),
        })
    }
}

/// Shallow-merge `edits` over `args` when both are objects.
fn merge_args(args: &Value, edits: Value) -> Value {
    match (args, edits) {
        (Value::Object(current), Value::Object(edits)) => {
            let mut merged = current.clone();
            merged.extend(edits);
            Value::Object(merged)
        }
        (_, edits) => edits,
    }
}

#[async_trait]
impl Middleware for HumanInTheLoopMiddleware {
    fn name(&self) -> &str {
        "human_in_the_loop"
    }

    async fn wrap_tool_call(
        &self,
        request: ToolCallRequest,
        next: ToolNext,
    ) -> Result<ToolCallResponse> {
        let Some(config) = self.interrupt_on.get(request.tool_name()) else {
            return next.run(request).await;
        };

        let call_id = request.tool_call.id.clone();
        let resume = request
            .runtime
            .interrupt(call_id.clone(), self.payload(&request, config))?;
        let decision: Decision = serde_json::from_value(resume).map_err(|e| {
            AgentError::state(format!(
                "invalid resume decision for tool call '{call_id}': {e}"
            ))
        })?;

        if !config.allowed_decisions.contains(&decision.kind()) {
            return Err(AgentError::state(format!(
                "decision {:?} is not allowed for tool '{}'",
                decision.kind(),
                request.tool_call.name
            )));
        }

        tracing::info!(
            tool = %request.tool_call.name,
            %call_id,
            decision = ?decision.kind(),
            "Applying review decision"
        );
        match decision {
            Decision::Approve => next.run(request).await,
            Decision::Edit { args } => {
                let args = merge_args(&request.tool_call.args, args);
                next.run(request.with_args(args)).await
            }
            Decision::Reject { message } => {
                let name = request.tool_call.name.clone();
                let message = message
                    .unwrap_or_else(|| format!("User rejected the '{name}' tool call"));
                Ok(ToolCallResponse::new(
                    ToolMessage::error(call_id, message).with_name(name),
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::{MiddlewarePipeline, ToolHandler};
    use crate::runtime::RunContext;
    use crate::state::AgentState;
    use braid_llm::ToolCall;
    use futures::FutureExt;
    use std::sync::Arc;

    fn core() -> ToolHandler {
        Arc::new(|request: ToolCallRequest| {
            async move {
                Ok::<_, AgentError>(ToolCallResponse::new(ToolMessage::new(
                    &request.tool_call.id,
                    request.tool_call.args.to_string(),
                )))
            }
            .boxed()
        })
    }

    fn handler() -> ToolHandler {
        let hitl = HumanInTheLoopMiddleware::new().interrupt_on(
            "delete_file",
            InterruptOnConfig::only([DecisionKind::Approve, DecisionKind::Reject]),
        );
        MiddlewarePipeline::new(vec![Arc::new(hitl)])
            .unwrap()
            .compose_tool_call(core())
    }

    fn request(name: &str, runtime: RunContext) -> ToolCallRequest {
        ToolCallRequest {
            tool_call: ToolCall::new("c1", name, json!({"path": "/tmp/a"})),
            tool: None,
            state: Arc::new(AgentState::default()),
            runtime,
        }
    }

    fn resumed(decision: Value) -> RunContext {
        RunContext::new("t").with_resume(HashMap::from([("c1".to_string(), decision)]))
    }

    #[test]
    fn test_decision_wire_format() {
        let edit: Decision = serde_json::from_value(json!({"type": "edit", "args": {"a": 1}})).unwrap();
        assert_eq!(edit, Decision::Edit { args: json!({"a": 1}) });
        assert_eq!(Decision::Approve.to_value(), json!({"type": "approve"}));
    }

    #[tokio::test]
    async fn test_guarded_tool_interrupts() {
        let err = handler()(request("delete_file", RunContext::new("t")))
            .await
            .unwrap_err();
        let AgentError::Interrupted(interrupts) = err else {
            panic!("expected interrupt");
        };
        assert_eq!(interrupts[0].id, "c1");
        assert_eq!(interrupts[0].value["tool"], "delete_file");
        assert_eq!(
            interrupts[0].value["allowed_decisions"],
            json!(["approve", "reject"])
        );
    }

    #[tokio::test]
    async fn test_unguarded_tool_runs() {
        let response = handler()(request("read_file", RunContext::new("t")))
            .await
            .unwrap();
        assert!(!response.message.is_error());
    }

    #[tokio::test]
    async fn test_reject_synthesizes_error() {
        let response = handler()(request(
            "delete_file",
            resumed(json!({"type": "reject", "message": "not today"})),
        ))
        .await
        .unwrap();
        assert!(response.message.is_error());
        assert_eq!(response.message.base.content.text(), "not today");
    }

    #[tokio::test]
    async fn test_disallowed_decision_fails() {
        let err = handler()(request(
            "delete_file",
            resumed(json!({"type": "edit", "args": {}})),
        ))
        .await
        .unwrap_err();
        assert!(err.to_string().contains("not allowed"));
    }

    #[test]
    fn test_edit_merges_args() {
        let merged = merge_args(&json!({"path": "/a", "force": false}), json!({"force": true}));
        assert_eq!(merged, json!({"path": "/a", "force": true}));
    }
}
