//! Model call limits per thread and per run.

use async_trait::async_trait;
use serde_json::json;

use braid_config::ModelCallLimitConfig;
use braid_llm::AiMessage;

use super::{Middleware, ModelNext, ModelRequest, ModelResponse, counter_reducer, read_counter};
use crate::error::{AgentError, Result};
use crate::runtime::RunContext;
use crate::state::{AgentState, JumpTo, StatePatch, StateSchema};

/// State field holding `{"thread": n, "run": n}`.
pub const MODEL_CALL_LIMIT_FIELD: &str = "model_call_limit";

/// Stops calling the model once a call budget is spent.
///
/// Hitting a limit is not an error: the call is answered with a terminal AI
/// message that has no tool calls, so the run routes to the end.
#[derive(Debug, Clone)]
pub struct ModelCallLimitMiddleware {
    thread_limit: Option<u32>,
    run_limit: Option<u32>,
}

impl ModelCallLimitMiddleware {
    pub fn new(thread_limit: Option<u32>, run_limit: Option<u32>) -> Result<Self> {
        if thread_limit.is_none() && run_limit.is_none() {
            return Err(AgentError::Config(
                "model call limit needs a thread_limit or a run_limit".to_string(),
            ));
        }
        Ok(Self {
            thread_limit,
            run_limit,
        })
    }

    pub(crate) fn from_config(config: &ModelCallLimitConfig) -> Self {
        Self {
            thread_limit: config.thread_limit,
            run_limit: config.run_limit,
        }
    }

    /// The limit already reached for `state`, if any.
    fn exceeded(&self, state: &AgentState) -> Option<String> {
        let thread = read_counter(state, MODEL_CALL_LIMIT_FIELD, "thread");
        let run = read_counter(state, MODEL_CALL_LIMIT_FIELD, "run");

        let mut reached = Vec::new();
        if let Some(limit) = self.thread_limit.filter(|limit| thread >= *limit) {
            reached.push(format!("thread limit ({thread}/{limit})"));
        }
        if let Some(limit) = self.run_limit.filter(|limit| run >= *limit) {
            reached.push(format!("run limit ({run}/{limit})"));
        }
        if reached.is_empty() {
            None
        } else {
            Some(format!("Model call limits exceeded: {}", reached.join(", ")))
        }
    }
}

#[async_trait]
impl Middleware for ModelCallLimitMiddleware {
    fn name(&self) -> &str {
        "model_call_limit"
    }

    fn state_schema(&self) -> StateSchema {
        StateSchema::new().field_with_default(
            MODEL_CALL_LIMIT_FIELD,
            counter_reducer(),
            json!({"thread": 0, "run": 0}),
        )
    }

    async fn before_agent(
        &self,
        state: &AgentState,
        _runtime: &RunContext,
    ) -> Result<Option<StatePatch>> {
        let run = read_counter(state, MODEL_CALL_LIMIT_FIELD, "run");
        if run == 0 {
            return Ok(None);
        }
        Ok(Some(StatePatch::new().with_field(
            MODEL_CALL_LIMIT_FIELD,
            json!({"run": -(run as i64)}),
        )))
    }

    async fn wrap_model_call(
        &self,
        request: ModelRequest,
        next: ModelNext,
    ) -> Result<ModelResponse> {
        if let Some(reason) = self.exceeded(&request.state) {
            tracing::info!(thread_id = %request.runtime.thread_id, %reason, "Model call skipped");
            return Ok(ModelResponse::new(AiMessage::new(reason))
                .with_patch(StatePatch::new().with_jump_to(JumpTo::End)));
        }

        let mut response = next.run(request).await?;
        response.patch.fields.insert(
            MODEL_CALL_LIMIT_FIELD.to_string(),
            json!({"thread": 1, "run": 1}),
        );
        Ok(response)
    }
}
