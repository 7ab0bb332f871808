//! Chat model abstraction.
//!
//! A [`ChatModel`] takes canonical messages plus per-call options and returns
//! an [`AiMessage`]. Provider clients implement it; the agent loop only ever
//! sees this trait. A scripted [`MockModel`] is available for tests.

use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::message::{AiMessage, AiMessageChunk, Message};

// ─────────────────────────────────────────────────────────────────────────────
// Call Options
// ─────────────────────────────────────────────────────────────────────────────

/// Per-call model options.
///
/// Every field is optional so that layers can contribute partial overrides
/// which are then combined with [`CallOptions::merge`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CallOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
    /// Extra HTTP headers sent with the call.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    /// Provider-specific parameters passed through untouched.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = Some(top_p);
        self
    }

    pub fn with_stop(mut self, stop: Vec<String>) -> Self {
        self.stop = Some(stop);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    /// Overlay `overlay` on top of `self`.
    ///
    /// Fields set in the overlay win. Headers merge key by key with the
    /// overlay winning on conflicts; `extra` is merged one level deep.
    pub fn merge(&self, overlay: &CallOptions) -> CallOptions {
        let mut headers = self.headers.clone();
        headers.extend(
            overlay
                .headers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        let mut extra = self.extra.clone();
        extra.extend(overlay.extra.iter().map(|(k, v)| (k.clone(), v.clone())));

        CallOptions {
            temperature: overlay.temperature.or(self.temperature),
            max_tokens: overlay.max_tokens.or(self.max_tokens),
            top_p: overlay.top_p.or(self.top_p),
            stop: overlay.stop.clone().or_else(|| self.stop.clone()),
            headers,
            extra,
        }
    }

    pub fn is_empty(&self) -> bool {
        self == &CallOptions::default()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tools and Output Formats
// ─────────────────────────────────────────────────────────────────────────────

/// A tool as advertised to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool arguments.
    pub parameters: Value,
}

impl ToolDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

/// How the model may choose among tools.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolChoice {
    /// Model decides.
    Auto,
    /// Model must call some tool.
    Any,
    /// Model must not call tools.
    None,
    /// Model must call the named tool.
    Tool { name: String },
}

/// A schema the final answer must satisfy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFormat {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub schema: Value,
}

impl ResponseFormat {
    pub fn new(name: impl Into<String>, schema: Value) -> Self {
        Self {
            name: name.into(),
            description: None,
            schema,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Model Input / Output
// ─────────────────────────────────────────────────────────────────────────────

/// Everything a model needs for one call.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ModelInput {
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,
    /// Set when the provider should enforce the schema natively.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_format: Option<ResponseFormat>,
    #[serde(default)]
    pub call_options: CallOptions,
}

impl ModelInput {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            ..Default::default()
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_call_options(mut self, options: CallOptions) -> Self {
        self.call_options = options;
        self
    }
}

/// Result of one model call.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelOutput {
    pub message: AiMessage,
    /// Provider payload, when the client keeps it.
    pub raw: Option<Value>,
}

impl ModelOutput {
    pub fn new(message: AiMessage) -> Self {
        Self { message, raw: None }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ChatModel Trait
// ─────────────────────────────────────────────────────────────────────────────

/// A stream of AI message chunks.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<AiMessageChunk>> + Send + 'static>>;

/// A chat model provider.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Run one call to completion.
    async fn invoke(&self, input: ModelInput, cancel: CancellationToken) -> Result<ModelOutput>;

    /// Stream one call as chunks.
    ///
    /// The default emits the full [`ChatModel::invoke`] result as a single
    /// chunk.
    async fn stream(&self, input: ModelInput, cancel: CancellationToken) -> Result<ChunkStream> {
        let output = self.invoke(input, cancel).await?;
        let chunk = AiMessageChunk::from(&output.message);
        Ok(Box::pin(futures::stream::once(async move { Ok(chunk) })))
    }
}

/// A model that can be shared across threads.
pub type SharedModel = Arc<dyn ChatModel>;

// ─────────────────────────────────────────────────────────────────────────────
// Mock Model
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(any(test, feature = "testing"))]
pub use mock::{MockModel, MockResponse};

#[cfg(any(test, feature = "testing"))]
mod mock {
    use std::collections::VecDeque;
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tokio_util::sync::CancellationToken;

    use super::{ChatModel, ChunkStream, ModelInput, ModelOutput};
    use crate::error::{LlmError, Result};
    use crate::message::{AiMessage, AiMessageChunk};

    /// One scripted reply.
    #[derive(Debug)]
    pub enum MockResponse {
        Message(AiMessage),
        Error(LlmError),
        /// Streamed as-is; folded with `concat` for `invoke`.
        Chunks(Vec<AiMessageChunk>),
    }

    impl From<AiMessage> for MockResponse {
        fn from(message: AiMessage) -> Self {
            MockResponse::Message(message)
        }
    }

    type Responder = Arc<dyn Fn(&ModelInput) -> Result<AiMessage> + Send + Sync>;

    enum Script {
        Queue(Mutex<VecDeque<MockResponse>>),
        Fn(Responder),
    }

    /// A model returning pre-configured responses in order.
    ///
    /// Every input is logged so tests can assert on what the agent sent.
    pub struct MockModel {
        name: String,
        script: Script,
        delay: Option<Duration>,
        request_log: Mutex<Vec<ModelInput>>,
    }

    impl MockModel {
        /// Respond with `responses` in order, then fail.
        pub fn new(responses: Vec<MockResponse>) -> Self {
            Self {
                name: "mock".to_string(),
                script: Script::Queue(Mutex::new(responses.into())),
                delay: None,
                request_log: Mutex::new(Vec::new()),
            }
        }

        /// Respond with AI messages in order.
        pub fn with_messages(messages: Vec<AiMessage>) -> Self {
            Self::new(messages.into_iter().map(MockResponse::Message).collect())
        }

        /// A single text reply.
        pub fn with_text(text: impl Into<String>) -> Self {
            Self::with_messages(vec![AiMessage::new(text.into())])
        }

        /// Compute every reply from the input.
        pub fn from_fn<F>(respond: F) -> Self
        where
            F: Fn(&ModelInput) -> Result<AiMessage> + Send + Sync + 'static,
        {
            Self {
                name: "mock".to_string(),
                script: Script::Fn(Arc::new(respond)),
                delay: None,
                request_log: Mutex::new(Vec::new()),
            }
        }

        /// Wait this long before each reply. Cancellation cuts the wait short.
        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        pub fn with_name(mut self, name: impl Into<String>) -> Self {
            self.name = name.into();
            self
        }

        /// All inputs received so far.
        pub fn requests(&self) -> Vec<ModelInput> {
            self.request_log.lock().clone()
        }

        pub fn request_count(&self) -> usize {
            self.request_log.lock().len()
        }

        async fn next_response(
            &self,
            input: ModelInput,
            cancel: &CancellationToken,
        ) -> Result<MockResponse> {
            if cancel.is_cancelled() {
                return Err(LlmError::Cancelled);
            }
            if let Some(delay) = self.delay {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(LlmError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            let response = match &self.script {
                Script::Queue(queue) => queue.lock().pop_front().ok_or_else(|| {
                    LlmError::Backend("MockModel: no more responses available".to_string())
                })?,
                Script::Fn(respond) => MockResponse::Message(respond(&input)?),
            };
            self.request_log.lock().push(input);
            Ok(response)
        }
    }

    impl std::fmt::Debug for MockModel {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("MockModel")
                .field("name", &self.name)
                .field("request_count", &self.request_count())
                .finish()
        }
    }

    #[async_trait]
    impl ChatModel for MockModel {
        fn name(&self) -> &str {
            &self.name
        }

        async fn invoke(&self, input: ModelInput, cancel: CancellationToken) -> Result<ModelOutput> {
            match self.next_response(input, &cancel).await? {
                MockResponse::Message(message) => Ok(ModelOutput::new(message)),
                MockResponse::Error(e) => Err(e),
                MockResponse::Chunks(chunks) => {
                    let folded = crate::message::concat_all(&chunks)?.unwrap_or_default();
                    Ok(ModelOutput::new(folded.into_message()))
                }
            }
        }

        async fn stream(&self, input: ModelInput, cancel: CancellationToken) -> Result<ChunkStream> {
            let chunks = match self.next_response(input, &cancel).await? {
                MockResponse::Message(message) => vec![AiMessageChunk::from(&message)],
                MockResponse::Error(e) => return Err(e),
                MockResponse::Chunks(chunks) => chunks,
            };
            Ok(Box::pin(futures::stream::iter(chunks.into_iter().map(Ok))))
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;
    use crate::message::{ToolCall, ToolCallChunk};
    use futures::StreamExt;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn test_call_options_merge_overlay_wins() {
        let base = CallOptions::new()
            .with_temperature(0.7)
            .with_max_tokens(100)
            .with_header("X-A", "1");
        let overlay = CallOptions::new()
            .with_temperature(0.2)
            .with_header("X-A", "2")
            .with_header("X-B", "3");

        let merged = base.merge(&overlay);
        assert_eq!(merged.temperature, Some(0.2));
        assert_eq!(merged.max_tokens, Some(100));
        assert_eq!(merged.headers.get("X-A").map(String::as_str), Some("2"));
        assert_eq!(merged.headers.get("X-B").map(String::as_str), Some("3"));
    }

    #[test]
    fn test_call_options_extra_shallow_merge() {
        let base = CallOptions::new()
            .with_extra("metadata", json!({"a": 1}))
            .with_extra("seed", json!(1));
        let overlay = CallOptions::new().with_extra("metadata", json!({"b": 2}));

        let merged = base.merge(&overlay);
        assert_eq!(merged.extra["metadata"], json!({"b": 2}));
        assert_eq!(merged.extra["seed"], json!(1));
    }

    #[test]
    fn test_call_options_empty() {
        assert!(CallOptions::new().is_empty());
        assert!(!CallOptions::new().with_top_p(0.9).is_empty());
    }

    #[test]
    fn test_tool_choice_serde() {
        let choice = ToolChoice::Tool {
            name: "search".to_string(),
        };
        let json = serde_json::to_value(&choice).unwrap();
        assert_eq!(json, json!({"type": "tool", "name": "search"}));
        assert_eq!(
            serde_json::from_value::<ToolChoice>(json!({"type": "any"})).unwrap(),
            ToolChoice::Any
        );
    }

    #[tokio::test]
    async fn test_mock_model_single_response() {
        let model = MockModel::with_text("Hello!");
        let output = model
            .invoke(
                ModelInput::new(vec![Message::human("Hi")]),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(output.message.base.content.text(), "Hello!");
        assert_eq!(model.request_count(), 1);
        assert_eq!(model.requests()[0].messages[0].text(), "Hi");
    }

    #[tokio::test]
    async fn test_mock_model_exhausted() {
        let model = MockModel::new(vec![]);
        let result = model
            .invoke(ModelInput::default(), CancellationToken::new())
            .await;
        assert!(matches!(result, Err(LlmError::Backend(_))));
    }

    #[tokio::test]
    async fn test_mock_model_scripted_error() {
        let model = MockModel::new(vec![
            MockResponse::Error(LlmError::Network("reset".to_string())),
            MockResponse::Message(AiMessage::new("ok")),
        ]);
        let first = model
            .invoke(ModelInput::default(), CancellationToken::new())
            .await;
        assert!(matches!(first, Err(LlmError::Network(_))));
        let second = model
            .invoke(ModelInput::default(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(second.message.base.content.text(), "ok");
    }

    #[tokio::test]
    async fn test_mock_model_chunks_fold_on_invoke() {
        let model = MockModel::new(vec![MockResponse::Chunks(vec![
            AiMessageChunk::text("Hel"),
            AiMessageChunk::text("lo"),
            AiMessageChunk::tool_call_fragment(ToolCallChunk {
                id: Some("c1".to_string()),
                name: Some("add".to_string()),
                args: Some("{\"a\":".to_string()),
                index: Some(0),
            }),
            AiMessageChunk::tool_call_fragment(ToolCallChunk {
                args: Some("1}".to_string()),
                index: Some(0),
                ..Default::default()
            }),
        ])]);

        let output = model
            .invoke(ModelInput::default(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(output.message.base.content.text(), "Hello");
        assert_eq!(
            output.message.tool_calls,
            vec![ToolCall::new("c1", "add", json!({"a": 1}))]
        );
    }

    #[tokio::test]
    async fn test_default_stream_is_single_chunk() {
        let model = MockModel::with_messages(vec![AiMessage::with_tool_calls(
            "calling",
            vec![ToolCall::new("c1", "add", json!({"a": 1}))],
        )]);
        let stream = model
            .stream(ModelInput::default(), CancellationToken::new())
            .await
            .unwrap();
        let chunks: Vec<_> = stream.collect().await;
        assert_eq!(chunks.len(), 1);

        let message = chunks.into_iter().next().unwrap().unwrap().into_message();
        assert_eq!(message.tool_calls[0].args, json!({"a": 1}));
    }

    #[tokio::test]
    async fn test_mock_model_from_fn() {
        let model = MockModel::from_fn(|input| {
            Ok(AiMessage::new(format!("{} messages", input.messages.len())))
        });
        let output = model
            .invoke(
                ModelInput::new(vec![Message::human("a"), Message::human("b")]),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(output.message.base.content.text(), "2 messages");
    }

    #[tokio::test]
    async fn test_mock_model_cancelled_during_delay() {
        let model = MockModel::with_text("late").with_delay(Duration::from_secs(30));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let result = model.invoke(ModelInput::default(), cancel).await;
        assert!(matches!(result, Err(LlmError::Cancelled)));
        assert_eq!(model.request_count(), 0);
    }
}
