//! Middleware protocol and composition.
//!
//! A middleware is a named bundle of lifecycle hooks:
//!
//! ```text
//!   before_agent ──▶ [ before_model ─▶ wrap_model_call ─▶ after_model ─▶ tools ]* ──▶ after_agent
//!                                         │                                  │
//!                                         ▼                                  ▼
//!                             m1(m2(..mN(model)))               m1(m2(..mN(tool)))
//! ```
//!
//! State hooks return [`StatePatch`] values that the run loop applies; they
//! never mutate state themselves. Wrap hooks receive the request and a
//! [`ModelNext`]/[`ToolNext`] continuation and may rewrite the request,
//! short-circuit, or post-process the response. The first middleware
//! declared is the outermost layer.

pub mod call_limit;
pub mod human_in_the_loop;
pub mod pii;
pub mod retry;
pub mod summarization;
pub mod tool_call_limit;
pub mod tool_selection;

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::{Map, Value};

use braid_config::BraidConfig;
use braid_llm::{
    AiMessage, CallOptions, Message, ModelInput, ResponseFormat, SharedModel, ToolCall,
    ToolChoice, ToolDefinition, ToolMessage,
};

use crate::error::{AgentError, Result};
use crate::runtime::RunContext;
use crate::state::{AgentState, Reducer, StatePatch, StateSchema};
use crate::tool::Tool;

pub use call_limit::ModelCallLimitMiddleware;
pub use human_in_the_loop::{Decision, DecisionKind, HumanInTheLoopMiddleware, InterruptOnConfig};
pub use pii::{PiiDetector, PiiMatch, PiiMiddleware, PiiStrategy};
pub use retry::{ModelRetryMiddleware, RetryPolicy, RetryPredicate, ToolRetryMiddleware};
pub use summarization::SummarizationMiddleware;
pub use tool_call_limit::ToolCallLimitMiddleware;
pub use tool_selection::LlmToolSelectorMiddleware;

// ─────────────────────────────────────────────────────────────────────────────
// Requests and Responses
// ─────────────────────────────────────────────────────────────────────────────

/// Everything needed for one model call.
#[derive(Clone)]
pub struct ModelRequest {
    pub model: SharedModel,
    pub messages: Vec<Message>,
    pub system_prompt: Option<String>,
    /// Tools advertised for this call only.
    pub tools: Vec<ToolDefinition>,
    pub tool_choice: Option<ToolChoice>,
    pub response_format: Option<ResponseFormat>,
    pub call_options: CallOptions,
    /// Read-only view of the state the call was built from.
    pub state: Arc<AgentState>,
    pub runtime: RunContext,
}

impl ModelRequest {
    pub fn with_messages(mut self, messages: Vec<Message>) -> Self {
        self.messages = messages;
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_tool_choice(mut self, choice: ToolChoice) -> Self {
        self.tool_choice = Some(choice);
        self
    }

    pub fn with_model(mut self, model: SharedModel) -> Self {
        self.model = model;
        self
    }

    /// Shallow-merge `options` over the accumulated call options.
    ///
    /// Keys set by `options` win, including individual header names, so
    /// the innermost layer to set a key decides its value.
    pub fn merge_call_options(mut self, options: &CallOptions) -> Self {
        self.call_options = self.call_options.merge(options);
        self
    }

    /// The provider-neutral input handed to the model.
    pub fn to_model_input(&self) -> ModelInput {
        ModelInput {
            messages: self.messages.clone(),
            system_prompt: self.system_prompt.clone(),
            tools: self.tools.clone(),
            tool_choice: self.tool_choice.clone(),
            response_format: self.response_format.clone(),
            call_options: self.call_options.clone(),
        }
    }
}

impl std::fmt::Debug for ModelRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRequest")
            .field("model", &self.model.name())
            .field("messages", &self.messages.len())
            .field(
                "tools",
                &self.tools.iter().map(|t| t.name.as_str()).collect::<Vec<_>>(),
            )
            .field("tool_choice", &self.tool_choice)
            .field("call_options", &self.call_options)
            .finish()
    }
}

/// The outcome of one model call.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelResponse {
    pub message: AiMessage,
    pub raw: Option<Value>,
    /// Extra state changes applied together with the message.
    pub patch: StatePatch,
}

impl ModelResponse {
    pub fn new(message: AiMessage) -> Self {
        Self {
            message,
            raw: None,
            patch: StatePatch::default(),
        }
    }

    pub fn with_patch(mut self, patch: StatePatch) -> Self {
        self.patch = patch;
        self
    }
}

/// Everything needed for one tool call.
#[derive(Clone)]
pub struct ToolCallRequest {
    pub tool_call: ToolCall,
    /// `None` when no registered tool has the requested name.
    pub tool: Option<Arc<dyn Tool>>,
    pub state: Arc<AgentState>,
    pub runtime: RunContext,
}

impl ToolCallRequest {
    pub fn with_args(mut self, args: Value) -> Self {
        self.tool_call.args = args;
        self
    }

    pub fn tool_name(&self) -> &str {
        &self.tool_call.name
    }
}

impl std::fmt::Debug for ToolCallRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolCallRequest")
            .field("tool_call", &self.tool_call)
            .field("registered", &self.tool.is_some())
            .finish()
    }
}

/// The outcome of one tool call.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallResponse {
    pub message: ToolMessage,
    pub patch: StatePatch,
}

impl ToolCallResponse {
    pub fn new(message: ToolMessage) -> Self {
        Self {
            message,
            patch: StatePatch::default(),
        }
    }

    pub fn with_patch(mut self, patch: StatePatch) -> Self {
        self.patch = patch;
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

/// A composed model call chain.
pub type ModelHandler =
    Arc<dyn Fn(ModelRequest) -> BoxFuture<'static, Result<ModelResponse>> + Send + Sync>;

/// A composed tool call chain.
pub type ToolHandler =
    Arc<dyn Fn(ToolCallRequest) -> BoxFuture<'static, Result<ToolCallResponse>> + Send + Sync>;

/// The rest of the model chain below a middleware.
#[derive(Clone)]
pub struct ModelNext {
    handler: ModelHandler,
}

impl ModelNext {
    pub fn new(handler: ModelHandler) -> Self {
        Self { handler }
    }

    /// Call the inner layers. May be called more than once.
    pub async fn run(&self, request: ModelRequest) -> Result<ModelResponse> {
        (self.handler)(request).await
    }
}

/// The rest of the tool chain below a middleware.
#[derive(Clone)]
pub struct ToolNext {
    handler: ToolHandler,
}

impl ToolNext {
    pub fn new(handler: ToolHandler) -> Self {
        Self { handler }
    }

    /// Call the inner layers. May be called more than once.
    pub async fn run(&self, request: ToolCallRequest) -> Result<ToolCallResponse> {
        (self.handler)(request).await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Middleware Trait
// ─────────────────────────────────────────────────────────────────────────────

/// A named unit of cross-cutting behavior.
///
/// Every hook has a no-op default. Instances hold configuration only;
/// anything that changes during a run lives in [`AgentState`] under a field
/// declared in [`Middleware::state_schema`].
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Unique name within an agent.
    fn name(&self) -> &str;

    /// State fields this middleware owns.
    fn state_schema(&self) -> StateSchema {
        StateSchema::default()
    }

    /// Tools added to the agent at build time.
    fn tools(&self) -> Vec<Arc<dyn Tool>> {
        Vec::new()
    }

    /// Runs once at the start of a fresh run.
    async fn before_agent(
        &self,
        _state: &AgentState,
        _runtime: &RunContext,
    ) -> Result<Option<StatePatch>> {
        Ok(None)
    }

    /// Runs before each model call, in declaration order.
    async fn before_model(
        &self,
        _state: &AgentState,
        _runtime: &RunContext,
    ) -> Result<Option<StatePatch>> {
        Ok(None)
    }

    /// Runs after each model call, in reverse declaration order.
    async fn after_model(
        &self,
        _state: &AgentState,
        _runtime: &RunContext,
    ) -> Result<Option<StatePatch>> {
        Ok(None)
    }

    /// Runs once when the run ends, in reverse declaration order.
    async fn after_agent(
        &self,
        _state: &AgentState,
        _runtime: &RunContext,
    ) -> Result<Option<StatePatch>> {
        Ok(None)
    }

    async fn wrap_model_call(
        &self,
        request: ModelRequest,
        next: ModelNext,
    ) -> Result<ModelResponse> {
        next.run(request).await
    }

    async fn wrap_tool_call(
        &self,
        request: ToolCallRequest,
        next: ToolNext,
    ) -> Result<ToolCallResponse> {
        next.run(request).await
    }
}

/// A middleware that can be shared across threads.
pub type SharedMiddleware = Arc<dyn Middleware>;

// ─────────────────────────────────────────────────────────────────────────────
// Pipeline
// ─────────────────────────────────────────────────────────────────────────────

/// An ordered middleware stack.
#[derive(Clone, Default)]
pub struct MiddlewarePipeline {
    layers: Vec<SharedMiddleware>,
}

impl MiddlewarePipeline {
    /// Build a pipeline, rejecting duplicate names.
    pub fn new(layers: Vec<SharedMiddleware>) -> Result<Self> {
        let mut seen = HashSet::new();
        for layer in &layers {
            if !seen.insert(layer.name().to_string()) {
                return Err(AgentError::Config(format!(
                    "middleware '{}' is registered more than once",
                    layer.name()
                )));
            }
        }
        Ok(Self { layers })
    }

    pub fn layers(&self) -> &[SharedMiddleware] {
        &self.layers
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Layer names, outermost first.
    pub fn describe(&self) -> Vec<String> {
        self.layers.iter().map(|m| m.name().to_string()).collect()
    }

    /// All middleware-owned state fields.
    pub fn state_schema(&self) -> Result<StateSchema> {
        StateSchema::merged(self.layers.iter().map(|m| (m.name(), m.state_schema())))
    }

    /// Tools contributed by middleware, in declaration order.
    pub fn tools(&self) -> Vec<Arc<dyn Tool>> {
        self.layers.iter().flat_map(|m| m.tools()).collect()
    }

    /// Nest every `wrap_model_call` around `core`.
    pub fn compose_model_call(&self, core: ModelHandler) -> ModelHandler {
        self.layers.iter().rev().fold(core, |inner, layer| {
            let layer = Arc::clone(layer);
            let next = ModelNext::new(inner);
            let handler: ModelHandler = Arc::new(move |request: ModelRequest| {
                let layer = Arc::clone(&layer);
                let next = next.clone();
                async move { layer.wrap_model_call(request, next).await }.boxed()
            });
            handler
        })
    }

    /// Nest every `wrap_tool_call` around `core`.
    pub fn compose_tool_call(&self, core: ToolHandler) -> ToolHandler {
        self.layers.iter().rev().fold(core, |inner, layer| {
            let layer = Arc::clone(layer);
            let next = ToolNext::new(inner);
            let handler: ToolHandler = Arc::new(move |request: ToolCallRequest| {
                let layer = Arc::clone(&layer);
                let next = next.clone();
                async move { layer.wrap_tool_call(request, next).await }.boxed()
            });
            handler
        })
    }
}

impl std::fmt::Debug for MiddlewarePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MiddlewarePipeline")
            .field("layers", &self.describe())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Closure Middleware
// ─────────────────────────────────────────────────────────────────────────────

/// A state hook written as a closure.
pub type StateHookFn =
    Arc<dyn Fn(&AgentState, &RunContext) -> Result<Option<StatePatch>> + Send + Sync>;

type WrapModelFn =
    Arc<dyn Fn(ModelRequest, ModelNext) -> BoxFuture<'static, Result<ModelResponse>> + Send + Sync>;

type WrapToolFn = Arc<
    dyn Fn(ToolCallRequest, ToolNext) -> BoxFuture<'static, Result<ToolCallResponse>> + Send + Sync,
>;

/// Start building a middleware from closures.
///
/// ```rust,ignore
/// let lower_temp = create_middleware("lower_temp")
///     .wrap_model_call(|request, next| async move {
///         next.run(request.merge_call_options(&CallOptions::new().with_temperature(0.2)))
///             .await
///     })
///     .build();
/// ```
pub fn create_middleware(name: impl Into<String>) -> FnMiddlewareBuilder {
    FnMiddlewareBuilder {
        inner: FnMiddleware {
            name: name.into(),
            state_schema: StateSchema::default(),
            tools: Vec::new(),
            before_agent: None,
            before_model: None,
            after_model: None,
            after_agent: None,
            wrap_model: None,
            wrap_tool: None,
        },
    }
}

/// Builder returned by [`create_middleware`].
pub struct FnMiddlewareBuilder {
    inner: FnMiddleware,
}

impl FnMiddlewareBuilder {
    pub fn state_schema(mut self, schema: StateSchema) -> Self {
        self.inner.state_schema = schema;
        self
    }

    pub fn tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.inner.tools.push(tool);
        self
    }

    pub fn before_agent<F>(mut self, hook: F) -> Self
    where
        F: Fn(&AgentState, &RunContext) -> Result<Option<StatePatch>> + Send + Sync + 'static,
    {
        self.inner.before_agent = Some(Arc::new(hook));
        self
    }

    pub fn before_model<F>(mut self, hook: F) -> Self
    where
        F: Fn(&AgentState, &RunContext) -> Result<Option<StatePatch>> + Send + Sync + 'static,
    {
        self.inner.before_model = Some(Arc::new(hook));
        self
    }

    pub fn after_model<F>(mut self, hook: F) -> Self
    where
        F: Fn(&AgentState, &RunContext) -> Result<Option<StatePatch>> + Send + Sync + 'static,
    {
        self.inner.after_model = Some(Arc::new(hook));
        self
    }

    pub fn after_agent<F>(mut self, hook: F) -> Self
    where
        F: Fn(&AgentState, &RunContext) -> Result<Option<StatePatch>> + Send + Sync + 'static,
    {
        self.inner.after_agent = Some(Arc::new(hook));
        self
    }

    pub fn wrap_model_call<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(ModelRequest, ModelNext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ModelResponse>> + Send + 'static,
    {
        let wrap: WrapModelFn =
            Arc::new(move |request: ModelRequest, next: ModelNext| hook(request, next).boxed());
        self.inner.wrap_model = Some(wrap);
        self
    }

    pub fn wrap_tool_call<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(ToolCallRequest, ToolNext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ToolCallResponse>> + Send + 'static,
    {
        let wrap: WrapToolFn =
            Arc::new(move |request: ToolCallRequest, next: ToolNext| hook(request, next).boxed());
        self.inner.wrap_tool = Some(wrap);
        self
    }

    pub fn build(self) -> FnMiddleware {
        self.inner
    }
}

/// A middleware assembled from closures; see [`create_middleware`].
pub struct FnMiddleware {
    name: String,
    state_schema: StateSchema,
    tools: Vec<Arc<dyn Tool>>,
    before_agent: Option<StateHookFn>,
    before_model: Option<StateHookFn>,
    after_model: Option<StateHookFn>,
    after_agent: Option<StateHookFn>,
    wrap_model: Option<WrapModelFn>,
    wrap_tool: Option<WrapToolFn>,
}

fn run_hook(
    hook: &Option<StateHookFn>,
    state: &AgentState,
    runtime: &RunContext,
) -> Result<Option<StatePatch>> {
    match hook {
        Some(hook) => hook(state, runtime),
        None => Ok(None),
    }
}

#[async_trait]
impl Middleware for FnMiddleware {
    fn name(&self) -> &str {
        &self.name
    }

    fn state_schema(&self) -> StateSchema {
        self.state_schema.clone()
    }

    fn tools(&self) -> Vec<Arc<dyn Tool>> {
        self.tools.clone()
    }

    async fn before_agent(
        &self,
        state: &AgentState,
        runtime: &RunContext,
    ) -> Result<Option<StatePatch>> {
        run_hook(&self.before_agent, state, runtime)
    }

    async fn before_model(
        &self,
        state: &AgentState,
        runtime: &RunContext,
    ) -> Result<Option<StatePatch>> {
        run_hook(&self.before_model, state, runtime)
    }

    async fn after_model(
        &self,
        state: &AgentState,
        runtime: &RunContext,
    ) -> Result<Option<StatePatch>> {
        run_hook(&self.after_model, state, runtime)
    }

    async fn after_agent(
        &self,
        state: &AgentState,
        runtime: &RunContext,
    ) -> Result<Option<StatePatch>> {
        run_hook(&self.after_agent, state, runtime)
    }

    async fn wrap_model_call(
        &self,
        request: ModelRequest,
        next: ModelNext,
    ) -> Result<ModelResponse> {
        match &self.wrap_model {
            Some(hook) => hook(request, next).await,
            None => next.run(request).await,
        }
    }

    async fn wrap_tool_call(
        &self,
        request: ToolCallRequest,
        next: ToolNext,
    ) -> Result<ToolCallResponse> {
        match &self.wrap_tool {
            Some(hook) => hook(request, next).await,
            None => next.run(request).await,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Shared Helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Reducer for counter objects: numeric members of the update are added
/// to the current members with the same key.
pub(crate) fn counter_reducer() -> Reducer {
    Reducer::custom(|current, update| {
        let mut counters = match current {
            Some(Value::Object(map)) => map.clone(),
            _ => Map::new(),
        };
        if let Value::Object(deltas) = update {
            for (key, delta) in deltas {
                let base = counters.get(key).and_then(Value::as_i64).unwrap_or(0);
                let delta = delta.as_i64().unwrap_or(0);
                counters.insert(key.clone(), Value::from(base.saturating_add(delta).max(0)));
            }
        }
        Ok(Value::Object(counters))
    })
}

/// Read one member of a counter object.
pub(crate) fn read_counter(state: &AgentState, field: &str, key: &str) -> u32 {
    state
        .get(field)
        .and_then(|v| v.get(key))
        .and_then(Value::as_u64)
        .map(|n| u32::try_from(n).unwrap_or(u32::MAX))
        .unwrap_or(0)
}

/// Built-in middleware described by a configuration file.
///
/// Limits come first so they wrap retries; summarization is only added when
/// a summarizer model is supplied.
pub fn builtin_middleware_from_config(
    config: &BraidConfig,
    summarizer: Option<SharedModel>,
) -> Vec<SharedMiddleware> {
    let mut layers: Vec<SharedMiddleware> = Vec::new();

    if let Some(limits) = &config.limits {
        if let Some(model_calls) = &limits.model_calls {
            layers.push(Arc::new(ModelCallLimitMiddleware::from_config(model_calls)));
        }
        if let Some(tool_calls) = &limits.tool_calls {
            layers.push(Arc::new(ToolCallLimitMiddleware::from_config(tool_calls)));
        }
    }

    if let Some(retry) = &config.retry {
        if let Some(model) = &retry.model {
            layers.push(Arc::new(ModelRetryMiddleware::new(RetryPolicy::from(model))));
        }
        if let Some(tools) = &retry.tools {
            layers.push(Arc::new(ToolRetryMiddleware::new(RetryPolicy::from(tools))));
        }
    }

    if let (Some(summarization), Some(model)) = (&config.summarization, summarizer) {
        layers.push(Arc::new(SummarizationMiddleware::from_config(
            model,
            summarization,
        )));
    }

    layers
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use braid_llm::MockModel;
    use std::sync::Mutex;

    fn request() -> ModelRequest {
        ModelRequest {
            model: Arc::new(MockModel::with_text("hi")),
            messages: vec![Message::human("hello")],
            system_prompt: None,
            tools: Vec::new(),
            tool_choice: None,
            response_format: None,
            call_options: CallOptions::default(),
            state: Arc::new(AgentState::default()),
            runtime: RunContext::new("t"),
        }
    }

    fn echo_core() -> ModelHandler {
        Arc::new(|request: ModelRequest| {
            async move {
                let options = serde_json::to_string(&request.call_options)?;
                Ok::<_, AgentError>(ModelResponse::new(AiMessage::new(options)))
            }
            .boxed()
        })
    }

    fn recorder(name: &'static str, log: Arc<Mutex<Vec<String>>>) -> SharedMiddleware {
        Arc::new(
            create_middleware(name)
                .wrap_model_call(move |request, next| {
                    let log = Arc::clone(&log);
                    async move {
                        log.lock().unwrap().push(format!("{name}:in"));
                        let response = next.run(request).await;
                        log.lock().unwrap().push(format!("{name}:out"));
                        response
                    }
                })
                .build(),
        )
    }

    #[tokio::test]
    async fn test_first_declared_is_outermost() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = MiddlewarePipeline::new(vec![
            recorder("a", Arc::clone(&log)),
            recorder("b", Arc::clone(&log)),
        ])
        .unwrap();

        let handler = pipeline.compose_model_call(echo_core());
        handler(request()).await.unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec!["a:in", "b:in", "b:out", "a:out"]
        );
        assert_eq!(pipeline.describe(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_short_circuit_skips_inner_layers() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let cache: SharedMiddleware = Arc::new(
            create_middleware("cache")
                .wrap_model_call(|_request, _next| async move {
                    Ok::<_, AgentError>(ModelResponse::new(AiMessage::new("cached")))
                })
                .build(),
        );
        let pipeline =
            MiddlewarePipeline::new(vec![cache, recorder("inner", Arc::clone(&log))]).unwrap();

        let response = pipeline.compose_model_call(echo_core())(request())
            .await
            .unwrap();
        assert_eq!(response.message.base.content.text(), "cached");
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_innermost_header_wins() {
        let a: SharedMiddleware = Arc::new(
            create_middleware("a")
                .wrap_model_call(|request, next| async move {
                    next.run(request.merge_call_options(&CallOptions::new().with_header("X-A", "1")))
                        .await
                })
                .build(),
        );
        let b: SharedMiddleware = Arc::new(
            create_middleware("b")
                .wrap_model_call(|request, next| async move {
                    let options = CallOptions::new()
                        .with_header("X-A", "2")
                        .with_header("X-B", "3");
                    next.run(request.merge_call_options(&options)).await
                })
                .build(),
        );
        let pipeline = MiddlewarePipeline::new(vec![a, b]).unwrap();
        let response = pipeline.compose_model_call(echo_core())(request())
            .await
            .unwrap();

        let seen: CallOptions =
            serde_json::from_str(&response.message.base.content.text()).unwrap();
        assert_eq!(seen.headers.get("X-A").map(String::as_str), Some("2"));
        assert_eq!(seen.headers.get("X-B").map(String::as_str), Some("3"));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let err = MiddlewarePipeline::new(vec![
            Arc::new(create_middleware("same").build()),
            Arc::new(create_middleware("same").build()),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("'same' is registered more than once"));
    }

    #[test]
    fn test_state_schema_conflict_names_owners() {
        let a = create_middleware("a")
            .state_schema(StateSchema::new().field("count", Reducer::Sum))
            .build();
        let b = create_middleware("b")
            .state_schema(StateSchema::new().field("count", Reducer::Sum))
            .build();
        let pipeline = MiddlewarePipeline::new(vec![Arc::new(a), Arc::new(b)]).unwrap();
        let err = pipeline.state_schema().unwrap_err();
        assert!(err.to_string().contains("'a' and 'b'"));
    }

    #[tokio::test]
    async fn test_fn_middleware_state_hooks() {
        let mw = create_middleware("notes")
            .before_model(|state, _rt| {
                Ok(Some(
                    StatePatch::new().with_field("seen", Value::from(state.messages.len())),
                ))
            })
            .build();
        let state = AgentState::new(vec![Message::human("a"), Message::ai("b")]);
        let patch = mw
            .before_model(&state, &RunContext::new("t"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(patch.fields.get("seen"), Some(&Value::from(2)));
        assert!(mw.after_model(&state, &RunContext::new("t")).await.unwrap().is_none());
    }

    #[test]
    fn test_counter_reducer_adds_members() {
        let reducer = counter_reducer();
        let current = serde_json::json!({"thread": 2, "run": 1});
        let next = reducer
            .apply("c", Some(&current), &serde_json::json!({"run": 1, "thread": 1}))
            .unwrap();
        assert_eq!(next, serde_json::json!({"thread": 3, "run": 2}));

        let reset = reducer
            .apply("c", Some(&next), &serde_json::json!({"run": -2}))
            .unwrap();
        assert_eq!(reset, serde_json::json!({"thread": 3, "run": 0}));
    }

    #[test]
    fn test_counters_saturate() {
        let reducer = counter_reducer();
        let current = serde_json::json!({"thread": i64::MAX});
        let next = reducer
            .apply("c", Some(&current), &serde_json::json!({"thread": 1}))
            .unwrap();
        assert_eq!(next, serde_json::json!({"thread": i64::MAX}));

        let mut state = AgentState::default();
        state.extra.insert("c".to_string(), next);
        assert_eq!(read_counter(&state, "c", "thread"), u32::MAX);
    }
}
