//! Per-turn tool filtering chosen by a selector model.

use std::collections::HashSet;

use async_trait::async_trait;
use serde_json::{Value, json};

use braid_llm::{Message, ModelInput, ResponseFormat, SharedModel, ToolDefinition};

use super::{Middleware, ModelNext, ModelRequest, ModelResponse};
use crate::error::Result;
use crate::validation::ValidationError;

const SELECTOR_PROMPT: &str = "\
Your goal is to select the most relevant tools for answering the user's query. \
Respond with a JSON object of the form {\"tools\": [\"tool_name\", ...]}.";

/// Lets a (usually cheaper) model narrow the tool list before each call.
///
/// Only the outgoing request changes; the agent's registered tools stay
/// the same for the next turn.
pub struct LlmToolSelectorMiddleware {
    model: SharedModel,
    max_tools: Option<usize>,
    always_include: Vec<String>,
    system_prompt: Option<String>,
}

impl LlmToolSelectorMiddleware {
    pub fn new(model: SharedModel) -> Self {
        Self {
            model,
            max_tools: None,
            always_include: Vec::new(),
            system_prompt: None,
        }
    }

    /// Cap on selected tools; `always_include` tools do not count.
    pub fn with_max_tools(mut self, max_tools: usize) -> Self {
        self.max_tools = Some(max_tools);
        self
    }

    pub fn always_include(mut self, tools: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.always_include = tools.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    fn selection_input(&self, candidates: &[&ToolDefinition], query: &str) -> ModelInput {
        let mut system = self
            .system_prompt
            .clone()
            .unwrap_or_else(|| SELECTOR_PROMPT.to_string());
        if let Some(max) = self.max_tools {
            system.push_str(&format!(" Select at most {max} tools."));
        }

        let listing = candidates
            .iter()
            .map(|tool| format!("- {}: {}", tool.name, tool.description))
            .collect::<Vec<_>>()
            .join("\n");
        let names: Vec<&str> = candidates.iter().map(|tool| tool.name.as_str()).collect();
        let schema = json!({
            "type": "object",
            "properties": {
                "tools": {
                    "type": "array",
                    "items": {"type": "string", "enum": names}
                }
            },
            "required": ["tools"]
        });

        let mut input = ModelInput::new(vec![Message::human(format!(
            "Available tools:\n{listing}\n\nUser query: {query}"
        ))])
        .with_system_prompt(system);
        input.response_format = Some(
            ResponseFormat::new("tool_selection", schema)
                .with_description("Tools relevant to the user's query"),
        );
        input
    }
}

/// Read `{"tools": [...]}` from a tool call or from JSON text.
fn parse_selection(message: &braid_llm::AiMessage) -> std::result::Result<Vec<String>, ValidationError> {
    let value = match message.tool_calls.first() {
        Some(call) => call.args.clone(),
        None => serde_json::from_str::<Value>(message.base.content.text().trim()).map_err(|e| {
            ValidationError::new(format!("tool selection is not valid JSON: {e}"))
        })?,
    };
    let tools = value
        .get("tools")
        .and_then(Value::as_array)
        .ok_or_else(|| ValidationError::new("tool selection is missing a 'tools' array"))?;
    Ok(tools
        .iter()
        .filter_map(Value::as_str)
        .map(str::to_string)
        .collect())
}

#[async_trait]
impl Middleware for LlmToolSelectorMiddleware {
    fn name(&self) -> &str {
        "llm_tool_selector"
    }

    async fn wrap_model_call(
        &self,
        request: ModelRequest,
        next: ModelNext,
    ) -> Result<ModelResponse> {
        let candidates: Vec<&ToolDefinition> = request
            .tools
            .iter()
            .filter(|tool| !self.always_include.contains(&tool.name))
            .collect();
        let query = request
            .messages
            .iter()
            .rev()
            .find(|m| m.is_human())
            .map(Message::text);
        let Some(query) = query.filter(|_| !candidates.is_empty()) else {
            return next.run(request).await;
        };

        let output = self
            .model
            .invoke(
                self.selection_input(&candidates, &query),
                request.runtime.cancellation.clone(),
            )
            .await?;
        let known: HashSet<&str> = candidates.iter().map(|t| t.name.as_str()).collect();
        let picked: HashSet<String> = parse_selection(&output.message)?
            .into_iter()
            .filter(|name| known.contains(name.as_str()))
            .take(self.max_tools.unwrap_or(usize::MAX))
            .collect();

        let selected: Vec<ToolDefinition> = request
            .tools
            .iter()
            .filter(|tool| {
                self.always_include.contains(&tool.name) || picked.contains(&tool.name)
            })
            .cloned()
            .collect();

        tracing::debug!(
            offered = request.tools.len(),
            selected = ?selected.iter().map(|t| t.name.as_str()).collect::<Vec<_>>(),
            "Selected tools for model call"
        );
        next.run(request.with_tools(selected)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AgentError;
    use crate::middleware::{MiddlewarePipeline, ModelHandler};
    use crate::runtime::RunContext;
    use crate::state::AgentState;
    use braid_llm::{AiMessage, CallOptions, MockModel};
    use futures::FutureExt;
    use std::sync::Arc;

    fn tools() -> Vec<ToolDefinition> {
        ["search", "calculator", "weather", "clock"]
            .into_iter()
            .map(|name| ToolDefinition::new(name, format!("{name} tool"), json!({"type": "object"})))
            .collect()
    }

    /// Answers with the names of the tools it was offered.
    fn listing_core() -> ModelHandler {
        Arc::new(|request: ModelRequest| {
            async move {
                let names: Vec<String> = request.tools.iter().map(|t| t.name.clone()).collect();
                Ok::<_, AgentError>(ModelResponse::new(AiMessage::new(names.join(","))))
            }
            .boxed()
        })
    }

    fn request() -> ModelRequest {
        ModelRequest {
            model: Arc::new(MockModel::with_text("unused")),
            messages: vec![Message::human("what's the weather and time in Oslo?")],
            system_prompt: None,
            tools: tools(),
            tool_choice: None,
            response_format: None,
            call_options: CallOptions::default(),
            state: Arc::new(AgentState::default()),
            runtime: RunContext::new("t"),
        }
    }

    #[tokio::test]
    async fn test_selection_filters_request_tools() {
        let selector = Arc::new(MockModel::with_text(r#"{"tools": ["weather", "clock", "search"]}"#));
        let mw = LlmToolSelectorMiddleware::new(selector.clone())
            .with_max_tools(2)
            .always_include(["calculator"]);
        let handler = MiddlewarePipeline::new(vec![Arc::new(mw)])
            .unwrap()
            .compose_model_call(listing_core());

        let response = handler(request()).await.unwrap();
        // The first two picks fit the budget; the request keeps its order.
        assert_eq!(response.message.base.content.text(), "calculator,weather,clock");

        let sent = &selector.requests()[0];
        assert!(sent.response_format.is_some());
        assert!(!sent.messages[0].text().contains("calculator"));
    }

    #[tokio::test]
    async fn test_invalid_selection_is_an_error() {
        let selector = Arc::new(MockModel::with_text("weather please"));
        let handler = MiddlewarePipeline::new(vec![Arc::new(LlmToolSelectorMiddleware::new(selector))])
            .unwrap()
            .compose_model_call(listing_core());

        let err = handler(request()).await.unwrap_err();
        assert!(matches!(err, AgentError::Validation(_)));
    }

    #[tokio::test]
    async fn test_no_tools_skips_selector() {
        let selector = Arc::new(MockModel::with_text("unused"));
        let handler = MiddlewarePipeline::new(vec![Arc::new(LlmToolSelectorMiddleware::new(
            selector.clone(),
        ))])
        .unwrap()
        .compose_model_call(listing_core());

        handler(request().with_tools(Vec::new())).await.unwrap();
        assert_eq!(selector.request_count(), 0);
    }
}
