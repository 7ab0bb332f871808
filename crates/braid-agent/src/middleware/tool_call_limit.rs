//! Tool call limits, for all tools or a single named tool.

use async_trait::async_trait;
use serde_json::json;

use braid_config::{ExitBehavior, ToolCallLimitConfig};
use braid_llm::{AiMessage, ToolMessage};

use super::{Middleware, ToolCallRequest, ToolCallResponse, ToolNext, counter_reducer, read_counter};
use crate::error::{AgentError, Result};
use crate::runtime::RunContext;
use crate::state::{AgentState, JumpTo, StatePatch, StateSchema};

/// Blocks tool calls once a call budget is spent.
///
/// Counters live in a state field named after the middleware, so several
/// instances limiting different tools can coexist.
#[derive(Debug, Clone)]
pub struct ToolCallLimitMiddleware {
    name: String,
    tool_name: Option<String>,
    thread_limit: Option<u32>,
    run_limit: Option<u32>,
    exit_behavior: ExitBehavior,
}

impl ToolCallLimitMiddleware {
    pub fn new(
        tool_name: Option<String>,
        thread_limit: Option<u32>,
        run_limit: Option<u32>,
    ) -> Result<Self> {
        if thread_limit.is_none() && run_limit.is_none() {
            return Err(AgentError::Config(
                "tool call limit needs a thread_limit or a run_limit".to_string(),
            ));
        }
        Ok(Self::build(tool_name, thread_limit, run_limit, ExitBehavior::Continue))
    }

    pub fn with_exit_behavior(mut self, exit_behavior: ExitBehavior) -> Self {
        self.exit_behavior = exit_behavior;
        self
    }

    pub(crate) fn from_config(config: &ToolCallLimitConfig) -> Self {
        Self::build(
            config.tool_name.clone(),
            config.thread_limit,
            config.run_limit,
            config.exit_behavior,
        )
    }

    fn build(
        tool_name: Option<String>,
        thread_limit: Option<u32>,
        run_limit: Option<u32>,
        exit_behavior: ExitBehavior,
    ) -> Self {
        let name = match &tool_name {
            Some(tool) => format!("tool_call_limit[{tool}]"),
            None => "tool_call_limit".to_string(),
        };
        Self {
            name,
            tool_name,
            thread_limit,
            run_limit,
            exit_behavior,
        }
    }

    fn applies_to(&self, tool: &str) -> bool {
        self.tool_name.as_deref().is_none_or(|name| name == tool)
    }

    /// Matching calls that come before `call_id` in the same AI message.
    ///
    /// Siblings may run concurrently against one state snapshot, so they
    /// are counted here rather than through the stored counters.
    fn earlier_siblings(&self, state: &AgentState, call_id: &str) -> u32 {
        let Some(ai) = state.latest_ai() else {
            return 0;
        };
        ai.tool_calls
            .iter()
            .take_while(|call| call.id != call_id)
            .filter(|call| self.applies_to(&call.name))
            .count() as u32
    }

    fn check(&self, thread: u32, run: u32) -> Option<(String, bool)> {
        let mut reached = Vec::new();
        let mut first_over = false;
        if let Some(limit) = self.thread_limit.filter(|limit| thread >= *limit) {
            reached.push(format!("thread limit ({thread}/{limit})"));
            first_over |= thread == limit;
        }
        if let Some(limit) = self.run_limit.filter(|limit| run >= *limit) {
            reached.push(format!("run limit ({run}/{limit})"));
            first_over |= run == limit;
        }
        if reached.is_empty() {
            return None;
        }
        let scope = match &self.tool_name {
            Some(tool) => format!("'{tool}' tool call limits"),
            None => "Tool call limits".to_string(),
        };
        Some((format!("{scope} exceeded: {}", reached.join(", ")), first_over))
    }
}

#[async_trait]
impl Middleware for ToolCallLimitMiddleware {
    fn name(&self) -> &str {
        &self.name
    }

    fn state_schema(&self) -> StateSchema {
        StateSchema::new().field_with_default(
            self.name.clone(),
            counter_reducer(),
            json!({"thread": 0, "run": 0}),
        )
    }

    async fn before_agent(
        &self,
        state: &AgentState,
        _runtime: &RunContext,
    ) -> Result<Option<StatePatch>> {
        let run = read_counter(state, &self.name, "run");
        if run == 0 {
            return Ok(None);
        }
        Ok(Some(
            StatePatch::new().with_field(self.name.clone(), json!({"run": -(run as i64)})),
        ))
    }

    async fn wrap_tool_call(
        &self,
        request: ToolCallRequest,
        next: ToolNext,
    ) -> Result<ToolCallResponse> {
        if !self.applies_to(request.tool_name()) {
            return next.run(request).await;
        }

        let earlier = self.earlier_siblings(&request.state, &request.tool_call.id);
        let thread = read_counter(&request.state, &self.name, "thread") + earlier;
        let run = read_counter(&request.state, &self.name, "run") + earlier;

        if let Some((reason, first_over)) = self.check(thread, run) {
            tracing::info!(
                tool = %request.tool_call.name,
                call_id = %request.tool_call.id,
                %reason,
                "Tool call blocked"
            );
            let message = ToolMessage::error(&request.tool_call.id, reason.clone())
                .with_name(&request.tool_call.name);
            let mut response = ToolCallResponse::new(message);
            if self.exit_behavior == ExitBehavior::End {
                let mut patch = StatePatch::new().with_jump_to(JumpTo::End);
                if first_over {
                    patch = patch.with_message(AiMessage::new(reason));
                }
                response = response.with_patch(patch);
            }
            return Ok(response);
        }

        let mut response = next.run(request).await?;
        response
            .patch
            .fields
            .insert(self.name.clone(), json!({"thread": 1, "run": 1}));
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::{MiddlewarePipeline, ToolHandler};
    use braid_llm::{Message, ToolCall};
    use futures::FutureExt;
    use std::sync::Arc;

    fn core() -> ToolHandler {
        Arc::new(|request: ToolCallRequest| {
            async move {
                Ok::<_, AgentError>(ToolCallResponse::new(ToolMessage::new(
                    &request.tool_call.id,
                    "ran",
                )))
            }
            .boxed()
        })
    }

    fn state_with_calls(calls: &[(&str, &str)], counters: Option<(u32, u32)>, field: &str) -> AgentState {
        let tool_calls = calls
            .iter()
            .map(|(id, name)| ToolCall::new(*id, *name, json!({})))
            .collect();
        let mut state = AgentState::new(vec![Message::Ai(AiMessage::with_tool_calls(
            "",
            tool_calls,
        ))]);
        if let Some((thread, run)) = counters {
            state
                .extra
                .insert(field.to_string(), json!({"thread": thread, "run": run}));
        }
        state
    }

    fn request(state: &Arc<AgentState>, id: &str, name: &str) -> ToolCallRequest {
        ToolCallRequest {
            tool_call: ToolCall::new(id, name, json!({})),
            tool: None,
            state: Arc::clone(state),
            runtime: RunContext::new("t"),
        }
    }

    #[test]
    fn test_name_includes_tool() {
        let mw = ToolCallLimitMiddleware::new(Some("search".into()), None, Some(1)).unwrap();
        assert_eq!(mw.name(), "tool_call_limit[search]");
        assert!(ToolCallLimitMiddleware::new(None, None, None).is_err());
    }

    #[tokio::test]
    async fn test_siblings_share_run_budget() {
        let mw = ToolCallLimitMiddleware::new(None, None, Some(1)).unwrap();
        let handler = MiddlewarePipeline::new(vec![Arc::new(mw)])
            .unwrap()
            .compose_tool_call(core());
        let state = Arc::new(state_with_calls(
            &[("c1", "search"), ("c2", "search")],
            None,
            "tool_call_limit",
        ));

        let first = handler(request(&state, "c1", "search")).await.unwrap();
        let second = handler(request(&state, "c2", "search")).await.unwrap();

        assert!(!first.message.is_error());
        assert_eq!(
            first.patch.fields.get("tool_call_limit"),
            Some(&json!({"thread": 1, "run": 1}))
        );
        assert!(second.message.is_error());
        assert_eq!(
            second.message.base.content.text(),
            "Tool call limits exceeded: run limit (1/1)"
        );
        assert!(second.patch.jump_to.is_none());
    }

    #[tokio::test]
    async fn test_other_tools_pass_through() {
        let mw = ToolCallLimitMiddleware::new(Some("search".into()), Some(0), None).unwrap();
        let handler = MiddlewarePipeline::new(vec![Arc::new(mw)])
            .unwrap()
            .compose_tool_call(core());
        let state = Arc::new(state_with_calls(&[("c1", "read")], None, "x"));

        let response = handler(request(&state, "c1", "read")).await.unwrap();
        assert!(!response.message.is_error());
        assert!(response.patch.fields.is_empty());
    }

    #[tokio::test]
    async fn test_end_behavior_jumps_to_end() {
        let mw = ToolCallLimitMiddleware::new(None, Some(2), None)
            .unwrap()
            .with_exit_behavior(ExitBehavior::End);
        let handler = MiddlewarePipeline::new(vec![Arc::new(mw)])
            .unwrap()
            .compose_tool_call(core());
        let state = Arc::new(state_with_calls(
            &[("c1", "search")],
            Some((2, 0)),
            "tool_call_limit",
        ));

        let response = handler(request(&state, "c1", "search")).await.unwrap();
        assert!(response.message.is_error());
        assert_eq!(response.patch.jump_to, Some(JumpTo::End));
        assert_eq!(response.patch.messages.len(), 1);
    }
}
