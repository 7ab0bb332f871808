//! The agent run loop.
//!
//! An [`Agent`] drives a small graph: `model` calls the model through the
//! composed middleware chain, `tools` executes the requested tool calls, and
//! `structured_output` asks for the configured response format. Routing
//! after a model call looks only at the latest AI message. State is owned
//! by the loop; hooks and wrap layers contribute [`StatePatch`]es which are
//! applied in a fixed order.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use futures::future::join_all;
use futures::{FutureExt, StreamExt};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use braid_config::BraidConfig;
use braid_llm::{
    AiMessageChunk, CallOptions, LlmError, Mergeable, Message, ResponseFormat, SharedModel,
    ToolCall, ToolChoice, ToolDefinition, ToolMessage,
};

use crate::checkpoint::{Checkpoint, CheckpointGuard, PendingWrite, SharedCheckpointStore};
use crate::error::{AgentError, Result, RunFailure};
use crate::middleware::{
    MiddlewarePipeline, ModelHandler, ModelRequest, ModelResponse, SharedMiddleware,
    ToolCallRequest, ToolCallResponse, ToolHandler, builtin_middleware_from_config,
};
use crate::runtime::{Interrupt, RunContext};
use crate::scheduler::{InlineScheduler, Node, SharedScheduler};
use crate::state::{AgentState, JumpTo, MessageUpdate, StatePatch, StateSchema, add_messages};
use crate::stream::{AgentStream, Observer, StreamMode, create_run_stream};
use crate::tool::{Tool, ToolRegistry, ToolRuntime};
use crate::validation::{JsonSchemaValidator, SharedValidator, ValidationError};

/// Attempts at a valid structured response before the run fails.
const MAX_STRUCTURED_OUTPUT_ATTEMPTS: u32 = 3;

// ─────────────────────────────────────────────────────────────────────────────
// Run inputs and outputs
// ─────────────────────────────────────────────────────────────────────────────

/// How the final response is shaped into `structured_response`.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputStrategy {
    /// Offer the schema as a tool and force the model to call it.
    Tool(ResponseFormat),
    /// Ask the provider to enforce the schema natively.
    Provider(ResponseFormat),
}

impl OutputStrategy {
    pub fn format(&self) -> &ResponseFormat {
        match self {
            OutputStrategy::Tool(format) | OutputStrategy::Provider(format) => format,
        }
    }
}

/// Resume values for a suspended thread.
#[derive(Debug, Clone, PartialEq)]
pub enum Resume {
    /// One value for every pending interrupt.
    Single(Value),
    /// Values keyed by interrupt id.
    ById(HashMap<String, Value>),
}

impl Resume {
    fn into_values(self, pending: &[Interrupt]) -> HashMap<String, Value> {
        match self {
            Resume::Single(value) => pending
                .iter()
                .map(|interrupt| (interrupt.id.clone(), value.clone()))
                .collect(),
            Resume::ById(values) => values,
        }
    }
}

/// What a run starts from.
#[derive(Debug, Clone)]
pub enum AgentInput {
    /// Append to the thread's checkpointed state, or start fresh.
    Messages(Vec<Message>),
    /// Replace the thread's state.
    State(AgentState),
    /// Continue a thread suspended by interrupts.
    Resume(Resume),
}

impl AgentInput {
    /// A single human message.
    pub fn text(text: impl Into<String>) -> Self {
        AgentInput::Messages(vec![Message::human(text.into())])
    }

    pub fn resume(value: Value) -> Self {
        AgentInput::Resume(Resume::Single(value))
    }

    pub fn resume_by_id(values: HashMap<String, Value>) -> Self {
        AgentInput::Resume(Resume::ById(values))
    }
}

impl From<Vec<Message>> for AgentInput {
    fn from(messages: Vec<Message>) -> Self {
        AgentInput::Messages(messages)
    }
}

impl From<AgentState> for AgentInput {
    fn from(state: AgentState) -> Self {
        AgentInput::State(state)
    }
}

/// Per-run settings.
#[derive(Debug, Clone, Default)]
pub struct RunConfig {
    /// Thread to load and checkpoint; a fresh id is generated when unset.
    pub thread_id: Option<String>,
    pub recursion_limit: Option<u32>,
    pub cancellation: Option<CancellationToken>,
    /// Read-only values exposed to hooks and tools.
    pub context: Map<String, Value>,
}

impl RunConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_thread_id(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }

    pub fn with_recursion_limit(mut self, limit: u32) -> Self {
        self.recursion_limit = Some(limit);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RunStatus {
    Completed,
    /// Suspended; resume the thread with values for these interrupts.
    Interrupted(Vec<Interrupt>),
}

/// The result of a run that did not fail.
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub thread_id: String,
    pub state: AgentState,
    pub status: RunStatus,
}

impl RunOutput {
    pub fn is_interrupted(&self) -> bool {
        matches!(self.status, RunStatus::Interrupted(_))
    }

    pub fn interrupts(&self) -> &[Interrupt] {
        match &self.status {
            RunStatus::Interrupted(interrupts) => interrupts,
            RunStatus::Completed => &[],
        }
    }

    /// Text of the last message in the transcript.
    pub fn text(&self) -> String {
        self.state
            .messages
            .last()
            .map(Message::text)
            .unwrap_or_default()
    }
}

pub type RunResult = std::result::Result<RunOutput, RunFailure>;

// ─────────────────────────────────────────────────────────────────────────────
// Agent
// ─────────────────────────────────────────────────────────────────────────────

struct AgentInner {
    name: String,
    model: SharedModel,
    tools: ToolRegistry,
    pipeline: MiddlewarePipeline,
    schema: StateSchema,
    model_handler: ModelHandler,
    tool_handler: ToolHandler,
    system_prompt: Option<String>,
    output: Option<OutputStrategy>,
    checkpointer: Option<SharedCheckpointStore>,
    verify_writes: bool,
    validator: SharedValidator,
    scheduler: SharedScheduler,
    call_options: CallOptions,
    parallel_tool_calls: bool,
    recursion_limit: u32,
}

/// A configured agent. Cheap to clone; runs share nothing but the
/// checkpoint store.
#[derive(Clone)]
pub struct Agent {
    inner: Arc<AgentInner>,
}

impl Agent {
    pub fn builder() -> AgentBuilder {
        AgentBuilder::new()
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Agent tools plus tools contributed by middleware.
    pub fn tools(&self) -> &ToolRegistry {
        &self.inner.tools
    }

    pub fn middleware(&self) -> &MiddlewarePipeline {
        &self.inner.pipeline
    }

    pub fn state_schema(&self) -> &StateSchema {
        &self.inner.schema
    }

    /// Latest checkpoint of a thread, if a checkpointer is configured.
    pub async fn checkpoint(&self, thread_id: &str) -> Result<Option<Checkpoint>> {
        match &self.inner.checkpointer {
            Some(store) => store.get(thread_id).await,
            None => Ok(None),
        }
    }

    /// Run to completion or suspension.
    pub async fn invoke(&self, input: impl Into<AgentInput>, config: RunConfig) -> RunResult {
        self.execute(input.into(), config, None).await
    }

    /// Run on a background task, yielding events for `mode`.
    pub fn stream(
        &self,
        input: impl Into<AgentInput>,
        config: RunConfig,
        mode: StreamMode,
    ) -> AgentStream {
        create_run_stream(self.clone(), input.into(), config, mode)
    }

    pub(crate) async fn execute(
        &self,
        input: AgentInput,
        config: RunConfig,
        observer: Option<Observer>,
    ) -> RunResult {
        let inner = &self.inner;
        let thread_id = config
            .thread_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut ctx = RunContext::new(&thread_id)
            .with_cancellation(config.cancellation.clone().unwrap_or_default())
            .with_context(config.context.clone());
        if let Some(sink) = observer.as_ref().and_then(Observer::chunk_sink) {
            ctx = ctx.with_chunk_sink(sink);
        }
        let span = tracing::info_span!(
            "agent_run",
            run_id = %ctx.run_id,
            %thread_id,
            agent = %inner.name
        );

        let mut run = Run {
            agent: inner.clone(),
            state: AgentState::default(),
            ctx,
            guard: inner
                .checkpointer
                .clone()
                .map(|store| CheckpointGuard::new(store, &thread_id, inner.verify_writes)),
            observer,
            pending_writes: BTreeMap::new(),
            structured_attempts: 0,
            limit: config.recursion_limit.unwrap_or(inner.recursion_limit),
        };

        match run.start(input).instrument(span).await {
            Ok(status) => Ok(RunOutput {
                thread_id,
                state: run.state,
                status,
            }),
            Err(error) => {
                tracing::warn!(%thread_id, error = %error, "Run failed");
                Err(RunFailure::new(error, run.state))
            }
        }
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("name", &self.inner.name)
            .field("model", &self.inner.model.name())
            .field("tools", &self.inner.tools.names())
            .field("middleware", &self.inner.pipeline.describe())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Core handlers
// ─────────────────────────────────────────────────────────────────────────────

/// Innermost model handler.
fn core_model_handler() -> ModelHandler {
    Arc::new(|request: ModelRequest| call_model(request).boxed())
}

/// Invoke the model, or stream it when the run has a chunk sink and fold
/// the chunks into one message.
async fn call_model(request: ModelRequest) -> Result<ModelResponse> {
    request.runtime.check_cancelled()?;
    let input = request.to_model_input();
    let cancel = request.runtime.cancellation.clone();

    let Some(sink) = request.runtime.chunk_sink().cloned() else {
        let output = request.model.invoke(input, cancel).await?;
        let mut response = ModelResponse::new(output.message);
        response.raw = output.raw;
        return Ok(response);
    };

    let mut chunks = request.model.stream(input, cancel).await?;
    let mut merged: Option<AiMessageChunk> = None;
    while let Some(chunk) = chunks.next().await {
        let chunk = chunk?;
        request.runtime.check_cancelled()?;
        sink(chunk.clone());
        merged = Some(match merged {
            Some(acc) => acc.concat(&chunk).map_err(LlmError::from)?,
            None => chunk,
        });
    }
    Ok(ModelResponse::new(merged.unwrap_or_default().into_message()))
}

/// Innermost tool handler.
fn core_tool_handler(validator: SharedValidator, available: Arc<Vec<String>>) -> ToolHandler {
    Arc::new(move |request: ToolCallRequest| {
        execute_tool(request, validator.clone(), available.clone()).boxed()
    })
}

/// Validate the arguments and execute the tool.
async fn execute_tool(
    request: ToolCallRequest,
    validator: SharedValidator,
    available: Arc<Vec<String>>,
) -> Result<ToolCallResponse> {
    let call = &request.tool_call;
    let Some(tool) = request.tool.clone() else {
        let message = ToolMessage::error(
            &call.id,
            format!(
                "Tool '{}' is not a valid tool. Available tools: {}",
                call.name,
                available.join(", ")
            ),
        )
        .with_name(&call.name);
        return Ok(ToolCallResponse::new(message));
    };

    request.runtime.check_cancelled()?;
    let args = validator.validate(&tool.parameters(), &call.args)?;
    let runtime = ToolRuntime::new(&call.id, request.state.clone(), request.runtime.clone());
    let result = tool.execute(args, &runtime).await?;
    Ok(ToolCallResponse::new(result.into_message(&call.id, &call.name)))
}

/// Tool message fed back to the model for a recoverable tool failure.
fn error_result(call: &ToolCall, error: &AgentError) -> ToolMessage {
    let text = match error {
        AgentError::Validation(e) => format!(
            "Invalid arguments for tool '{}': {e}. Fix the arguments and try again.",
            call.name
        ),
        other => format!("Error executing tool '{}': {other}", call.name),
    };
    ToolMessage::error(&call.id, text).with_name(&call.name)
}

fn jump_target(jump: JumpTo) -> Node {
    match jump {
        JumpTo::Model => Node::Model,
        JumpTo::Tools => Node::Tools,
        JumpTo::End => Node::End,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Run
// ─────────────────────────────────────────────────────────────────────────────

/// Mutable state of one run. The only writer of `state`.
struct Run {
    agent: Arc<AgentInner>,
    state: AgentState,
    ctx: RunContext,
    guard: Option<CheckpointGuard>,
    observer: Option<Observer>,
    /// Tool results produced by the current tools step, keyed by call id.
    pending_writes: BTreeMap<String, PendingWrite>,
    structured_attempts: u32,
    limit: u32,
}

impl Run {
    async fn start(&mut self, input: AgentInput) -> Result<RunStatus> {
        let checkpoint = match self.guard.as_mut() {
            Some(guard) => guard.load().await?,
            None => None,
        };

        let (start, fresh) = match input {
            AgentInput::Messages(messages) => {
                if let Some(checkpoint) = &checkpoint
                    && checkpoint.is_interrupted()
                {
                    return Err(AgentError::state(format!(
                        "thread '{}' has {} pending interrupt(s); resume it instead",
                        self.ctx.thread_id,
                        checkpoint.pending_interrupts.len()
                    )));
                }
                let mut state = checkpoint.map(|c| c.state).unwrap_or_default();
                state.structured_response = None;
                let updates: Vec<MessageUpdate> =
                    messages.into_iter().map(MessageUpdate::Upsert).collect();
                add_messages(&mut state.messages, &updates);
                self.state = state;
                (Node::Model, true)
            }
            AgentInput::State(state) => {
                self.state = state;
                (Node::Model, true)
            }
            AgentInput::Resume(resume) => {
                let Some(checkpoint) = checkpoint.filter(Checkpoint::is_interrupted) else {
                    return Err(AgentError::state(format!(
                        "thread '{}' has no pending interrupts to resume",
                        self.ctx.thread_id
                    )));
                };
                let values = resume.into_values(&checkpoint.pending_interrupts);
                self.ctx = self.ctx.clone().with_resume(values);
                self.state = checkpoint.state;
                self.pending_writes = checkpoint.pending_writes;
                (checkpoint.next, false)
            }
        };

        self.drive(start, fresh).await
    }

    async fn drive(&mut self, start: Node, fresh: bool) -> Result<RunStatus> {
        let agent = self.agent.clone();
        self.state.init_defaults(&agent.schema);

        if fresh {
            for layer in agent.pipeline.layers() {
                if let Some(patch) = layer.before_agent(&self.state, &self.ctx).await? {
                    self.apply(&format!("{}.before_agent", layer.name()), patch)?;
                }
            }
        }

        tracing::info!(
            thread_id = %self.ctx.thread_id,
            start = %start,
            resumed = !fresh,
            messages = self.state.messages.len(),
            "Run started"
        );

        let mut node = start;
        let mut steps = 0u32;
        while node != Node::End {
            self.ctx.check_cancelled()?;
            if steps >= self.limit {
                return Err(AgentError::RecursionLimit(self.limit));
            }
            steps += 1;

            match agent.scheduler.run_node(node, self.step(node).boxed()).await {
                Ok(next) => {
                    self.save(next, Vec::new()).await?;
                    if let Some(observer) = &self.observer {
                        observer.values(&self.state);
                    }
                    node = next;
                }
                Err(AgentError::Interrupted(interrupts)) => {
                    if self.guard.is_none() {
                        tracing::warn!(
                            thread_id = %self.ctx.thread_id,
                            "Run interrupted without a checkpointer; it cannot be resumed"
                        );
                    }
                    self.save(node, interrupts.clone()).await?;
                    tracing::info!(
                        thread_id = %self.ctx.thread_id,
                        %node,
                        interrupts = interrupts.len(),
                        "Run interrupted"
                    );
                    return Ok(RunStatus::Interrupted(interrupts));
                }
                Err(e) => return Err(e),
            }
        }

        for layer in agent.pipeline.layers().iter().rev() {
            if let Some(patch) = layer.after_agent(&self.state, &self.ctx).await? {
                self.apply(&format!("{}.after_agent", layer.name()), patch)?;
            }
        }
        self.save(Node::End, Vec::new()).await?;

        tracing::info!(
            thread_id = %self.ctx.thread_id,
            steps,
            messages = self.state.messages.len(),
            "Run completed"
        );
        Ok(RunStatus::Completed)
    }

    async fn step(&mut self, node: Node) -> Result<Node> {
        match node {
            Node::Model | Node::StructuredOutput => self.model_step(node).await,
            Node::Tools => self.tools_step().await,
            Node::End => Ok(Node::End),
        }
    }

    /// Apply a patch and report it to the observer.
    fn apply(&mut self, source: &str, patch: StatePatch) -> Result<()> {
        self.state.apply(&patch, &self.agent.schema)?;
        if let Some(observer) = &self.observer {
            observer.update(source, &patch);
        }
        Ok(())
    }

    async fn save(&mut self, next: Node, interrupts: Vec<Interrupt>) -> Result<()> {
        let Some(guard) = self.guard.as_mut() else {
            return Ok(());
        };
        let mut checkpoint = Checkpoint::new(self.state.clone(), next);
        checkpoint.pending_interrupts = interrupts;
        checkpoint.pending_writes = std::mem::take(&mut self.pending_writes);
        guard.save(checkpoint).await
    }

    // ── model ───────────────────────────────────────────────────────────────

    async fn model_step(&mut self, node: Node) -> Result<Node> {
        let agent = self.agent.clone();

        for layer in agent.pipeline.layers() {
            let Some(patch) = layer.before_model(&self.state, &self.ctx).await? else {
                continue;
            };
            let jump = patch.jump_to;
            self.apply(&format!("{}.before_model", layer.name()), patch)?;
            match jump {
                Some(JumpTo::Model) => break,
                Some(jump) => {
                    tracing::debug!(middleware = layer.name(), ?jump, "before_model jumped");
                    return Ok(jump_target(jump));
                }
                None => {}
            }
        }

        let request = self.build_request(node);
        let ModelResponse {
            message, mut patch, ..
        } = (agent.model_handler)(request).await?;
        patch.messages.insert(0, MessageUpdate::Upsert(Message::Ai(message)));
        let mut jump = patch.jump_to;
        self.apply(node.as_str(), patch)?;

        for layer in agent.pipeline.layers().iter().rev() {
            let Some(patch) = layer.after_model(&self.state, &self.ctx).await? else {
                continue;
            };
            let hook_jump = patch.jump_to;
            self.apply(&format!("{}.after_model", layer.name()), patch)?;
            if hook_jump.is_some() {
                jump = hook_jump;
                break;
            }
        }

        if let Some(jump) = jump {
            return Ok(jump_target(jump));
        }
        if node == Node::StructuredOutput {
            return self.finish_structured();
        }
        Ok(self.route())
    }

    fn build_request(&self, node: Node) -> ModelRequest {
        let agent = &self.agent;
        let mut request = ModelRequest {
            model: agent.model.clone(),
            messages: self.state.messages.clone(),
            system_prompt: agent.system_prompt.clone(),
            tools: agent.tools.to_definitions(),
            tool_choice: None,
            response_format: None,
            call_options: agent.call_options.clone(),
            state: Arc::new(self.state.clone()),
            runtime: self.ctx.clone(),
        };

        if node == Node::StructuredOutput {
            match &agent.output {
                Some(OutputStrategy::Tool(format)) => {
                    let description = format
                        .description
                        .clone()
                        .unwrap_or_else(|| "Return the final response in this format".to_string());
                    request.tools = vec![ToolDefinition::new(
                        &format.name,
                        description,
                        format.schema.clone(),
                    )];
                    request.tool_choice = Some(ToolChoice::Tool {
                        name: format.name.clone(),
                    });
                }
                Some(OutputStrategy::Provider(format)) => {
                    request.tools = Vec::new();
                    request.response_format = Some(format.clone());
                }
                None => {}
            }
        }
        request
    }

    /// Next node after a model call, from the latest AI message alone.
    fn route(&self) -> Node {
        match self.state.last_ai() {
            Some(ai) if ai.has_tool_calls() => Node::Tools,
            _ if self.agent.output.is_some() && self.state.structured_response.is_none() => {
                Node::StructuredOutput
            }
            _ => Node::End,
        }
    }

    // ── structured output ───────────────────────────────────────────────────

    fn finish_structured(&mut self) -> Result<Node> {
        let Some(strategy) = self.agent.output.clone() else {
            return Ok(Node::End);
        };
        let Some(ai) = self.state.last_ai().cloned() else {
            return Ok(Node::End);
        };
        self.structured_attempts += 1;

        match strategy {
            OutputStrategy::Tool(format) => {
                let Some(call) = ai.tool_calls.iter().find(|c| c.name == format.name) else {
                    let error = ValidationError::new(format!(
                        "model did not call the '{}' tool",
                        format.name
                    ));
                    let feedback = format!("Respond by calling the '{}' tool.", format.name);
                    let patch = if ai.tool_calls.is_empty() {
                        StatePatch::new().with_message(Message::human(feedback))
                    } else {
                        StatePatch::new().with_messages(ai.tool_calls.iter().map(|c| {
                            Message::from(ToolMessage::error(&c.id, &feedback).with_name(&c.name))
                        }))
                    };
                    return self.retry_structured(patch, error);
                };

                match self.agent.validator.validate(&format.schema, &call.args) {
                    Ok(value) => {
                        let message = ToolMessage::new(
                            &call.id,
                            format!("Returning structured response: {value}"),
                        )
                        .with_name(&format.name);
                        let patch = StatePatch::new()
                            .with_message(message)
                            .with_structured_response(value);
                        self.apply(Node::StructuredOutput.as_str(), patch)?;
                        Ok(Node::End)
                    }
                    Err(error) => {
                        let message = ToolMessage::error(
                            &call.id,
                            format!(
                                "Structured output failed validation: {error}. Call '{}' again with corrected arguments.",
                                format.name
                            ),
                        )
                        .with_name(&format.name);
                        self.retry_structured(StatePatch::new().with_message(message), error)
                    }
                }
            }
            OutputStrategy::Provider(format) => {
                let text = ai.base.content.text();
                let parsed = serde_json::from_str::<Value>(text.trim())
                    .map_err(|e| ValidationError::new(format!("response is not valid JSON: {e}")))
                    .and_then(|value| self.agent.validator.validate(&format.schema, &value));
                match parsed {
                    Ok(value) => {
                        let patch = StatePatch::new().with_structured_response(value);
                        self.apply(Node::StructuredOutput.as_str(), patch)?;
                        Ok(Node::End)
                    }
                    Err(error) => {
                        let feedback = Message::human(format!(
                            "Your response did not match the required format: {error}. Respond again with JSON only."
                        ));
                        self.retry_structured(StatePatch::new().with_message(feedback), error)
                    }
                }
            }
        }
    }

    fn retry_structured(&mut self, feedback: StatePatch, error: ValidationError) -> Result<Node> {
        if self.structured_attempts >= MAX_STRUCTURED_OUTPUT_ATTEMPTS {
            return Err(AgentError::Validation(error));
        }
        tracing::debug!(
            attempt = self.structured_attempts,
            error = %error,
            "Structured output rejected; retrying"
        );
        self.apply(Node::StructuredOutput.as_str(), feedback)?;
        Ok(Node::StructuredOutput)
    }

    // ── tools ───────────────────────────────────────────────────────────────

    fn tool_request(&self, call: &ToolCall, state: &Arc<AgentState>) -> ToolCallRequest {
        ToolCallRequest {
            tool_call: call.clone(),
            tool: self.agent.tools.get(&call.name),
            state: state.clone(),
            runtime: self.ctx.clone(),
        }
    }

    async fn tools_step(&mut self) -> Result<Node> {
        let agent = self.agent.clone();
        let Some(ai) = self.state.latest_ai().cloned() else {
            return Ok(Node::Model);
        };

        let answered: HashSet<&str> = self
            .state
            .messages
            .iter()
            .filter_map(Message::as_tool)
            .map(|tool| tool.tool_call_id.as_str())
            .collect();
        let calls: Vec<ToolCall> = ai
            .tool_calls
            .iter()
            .filter(|call| {
                !answered.contains(call.id.as_str()) && !self.pending_writes.contains_key(&call.id)
            })
            .cloned()
            .collect();

        if !calls.is_empty() {
            tracing::debug!(
                calls = calls.len(),
                parallel = agent.parallel_tool_calls,
                "Executing tool calls"
            );
        }

        let snapshot = Arc::new(self.state.clone());
        let results: Vec<Result<ToolCallResponse>> = if agent.parallel_tool_calls {
            let pending: Vec<_> = calls
                .iter()
                .map(|call| (agent.tool_handler)(self.tool_request(call, &snapshot)))
                .collect();
            join_all(pending).await
        } else {
            let mut results = Vec::with_capacity(calls.len());
            for call in &calls {
                let result = (agent.tool_handler)(self.tool_request(call, &snapshot)).await;
                let interrupted = matches!(result, Err(AgentError::Interrupted(_)));
                results.push(result);
                if interrupted {
                    break;
                }
            }
            results
        };

        let mut interrupts = Vec::new();
        for (call, result) in calls.iter().zip(results) {
            let write = match result {
                Ok(response) => PendingWrite {
                    message: response.message,
                    patch: response.patch,
                },
                Err(AgentError::Interrupted(found)) => {
                    interrupts.extend(found);
                    continue;
                }
                Err(error) if error.is_tool_recoverable() => {
                    tracing::debug!(
                        tool = %call.name,
                        call_id = %call.id,
                        error = %error,
                        "Tool call failed; returning error to model"
                    );
                    PendingWrite {
                        message: error_result(call, &error),
                        patch: StatePatch::default(),
                    }
                }
                Err(error) => return Err(error),
            };
            self.pending_writes.insert(call.id.clone(), write);
        }

        if !interrupts.is_empty() {
            return Err(AgentError::Interrupted(interrupts));
        }

        let mut writes = std::mem::take(&mut self.pending_writes);
        let mut next = Node::Model;
        for call in &ai.tool_calls {
            let Some(PendingWrite { message, mut patch }) = writes.remove(&call.id) else {
                continue;
            };
            let direct = !message.is_error()
                && agent.tools.get(&call.name).is_some_and(|tool| tool.return_direct());
            patch.messages.insert(0, MessageUpdate::Upsert(message.into()));
            let jump = patch.jump_to;
            self.apply(Node::Tools.as_str(), patch)?;
            if direct || jump == Some(JumpTo::End) {
                next = Node::End;
            }
        }
        Ok(next)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Builder
// ─────────────────────────────────────────────────────────────────────────────

/// Builder for [`Agent`].
pub struct AgentBuilder {
    name: String,
    model: Option<SharedModel>,
    tools: ToolRegistry,
    middleware: Vec<SharedMiddleware>,
    system_prompt: Option<String>,
    output: Option<OutputStrategy>,
    checkpointer: Option<SharedCheckpointStore>,
    verify_writes: bool,
    validator: SharedValidator,
    scheduler: SharedScheduler,
    call_options: CallOptions,
    parallel_tool_calls: bool,
    recursion_limit: u32,
    config: Option<BraidConfig>,
}

impl AgentBuilder {
    pub fn new() -> Self {
        Self {
            name: "agent".to_string(),
            model: None,
            tools: ToolRegistry::new(),
            middleware: Vec::new(),
            system_prompt: None,
            output: None,
            checkpointer: None,
            verify_writes: true,
            validator: Arc::new(JsonSchemaValidator),
            scheduler: Arc::new(InlineScheduler),
            call_options: CallOptions::default(),
            parallel_tool_calls: true,
            recursion_limit: braid_config::DEFAULT_RECURSION_LIMIT,
            config: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_model(mut self, model: SharedModel) -> Self {
        self.model = Some(model);
        self
    }

    pub fn with_tool<T: Tool + 'static>(mut self, tool: T) -> Self {
        self.tools.register(tool);
        self
    }

    pub fn with_tools(mut self, tools: impl IntoIterator<Item = Arc<dyn Tool>>) -> Self {
        for tool in tools {
            self.tools.register_arc(tool);
        }
        self
    }

    pub fn with_middleware(mut self, middleware: SharedMiddleware) -> Self {
        self.middleware.push(middleware);
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_output_strategy(mut self, strategy: OutputStrategy) -> Self {
        self.output = Some(strategy);
        self
    }

    /// Structured output using [`OutputStrategy::Tool`].
    pub fn with_response_format(self, format: ResponseFormat) -> Self {
        self.with_output_strategy(OutputStrategy::Tool(format))
    }

    pub fn with_checkpointer(mut self, store: SharedCheckpointStore) -> Self {
        self.checkpointer = Some(store);
        self
    }

    pub fn with_validator(mut self, validator: SharedValidator) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_scheduler(mut self, scheduler: SharedScheduler) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// Base options for every model call; wrap layers merge over these.
    pub fn with_call_options(mut self, options: CallOptions) -> Self {
        self.call_options = options;
        self
    }

    pub fn parallel_tool_calls(mut self, parallel: bool) -> Self {
        self.parallel_tool_calls = parallel;
        self
    }

    pub fn with_recursion_limit(mut self, limit: u32) -> Self {
        self.recursion_limit = limit;
        self
    }

    /// Apply agent defaults from `config` now and add its built-in
    /// middleware (ahead of explicitly added middleware) at build time.
    pub fn with_config(mut self, config: BraidConfig) -> Self {
        if let Some(agent) = &config.agent {
            if let Some(name) = &agent.name {
                self.name = name.clone();
            }
            if let Some(prompt) = &agent.system_prompt {
                self.system_prompt = Some(prompt.clone());
            }
            if let Some(parallel) = agent.parallel_tool_calls {
                self.parallel_tool_calls = parallel;
            }
        }
        self.recursion_limit = config.recursion_limit();
        if let Some(checkpoint) = &config.checkpoint {
            self.verify_writes = checkpoint.verify_writes;
        }
        self.config = Some(config);
        self
    }

    pub fn build(self) -> Result<Agent> {
        let model = self
            .model
            .ok_or_else(|| AgentError::Config("model is required".to_string()))?;

        let mut layers = Vec::new();
        if let Some(config) = &self.config {
            config.validate()?;
            layers.extend(builtin_middleware_from_config(config, Some(model.clone())));
        }
        layers.extend(self.middleware);
        let pipeline = MiddlewarePipeline::new(layers)?;
        let schema = pipeline.state_schema()?;

        let mut tools = self.tools;
        for tool in pipeline.tools() {
            if tools.contains(tool.name()) {
                return Err(AgentError::Config(format!(
                    "tool '{}' is provided by both the agent and middleware",
                    tool.name()
                )));
            }
            tools.register_arc(tool);
        }
        if let Some(OutputStrategy::Tool(format)) = &self.output
            && tools.contains(&format.name)
        {
            return Err(AgentError::Config(format!(
                "response format '{}' collides with a tool of the same name",
                format.name
            )));
        }

        let available: Arc<Vec<String>> =
            Arc::new(tools.names().into_iter().map(str::to_string).collect());
        let model_handler = pipeline.compose_model_call(core_model_handler());
        let tool_handler =
            pipeline.compose_tool_call(core_tool_handler(self.validator.clone(), available));

        tracing::debug!(
            agent = %self.name,
            model = model.name(),
            tools = tools.len(),
            middleware = ?pipeline.describe(),
            "Built agent"
        );

        Ok(Agent {
            inner: Arc::new(AgentInner {
                name: self.name,
                model,
                tools,
                pipeline,
                schema,
                model_handler,
                tool_handler,
                system_prompt: self.system_prompt,
                output: self.output,
                checkpointer: self.checkpointer,
                verify_writes: self.verify_writes,
                validator: self.validator,
                scheduler: self.scheduler,
                call_options: self.call_options,
                parallel_tool_calls: self.parallel_tool_calls,
                recursion_limit: self.recursion_limit,
            }),
        })
    }
}

impl Default for AgentBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::MockTool;
    use braid_llm::{AiMessage, MockModel};
    use serde_json::json;

    fn calling(tool: &str, id: &str, args: Value) -> AiMessage {
        AiMessage::with_tool_calls("", vec![ToolCall::new(id, tool, args)])
    }

    #[test]
    fn test_build_requires_model() {
        let err = Agent::builder().build().unwrap_err();
        assert!(err.to_string().contains("model is required"));
    }

    #[test]
    fn test_response_format_name_collision() {
        let err = Agent::builder()
            .with_model(Arc::new(MockModel::with_text("hi")))
            .with_tool(MockTool::new("answer"))
            .with_response_format(ResponseFormat::new("answer", json!({"type": "object"})))
            .build()
            .unwrap_err();
        assert!(matches!(err, AgentError::Config(_)));
    }

    #[test]
    fn test_resume_single_fans_out() {
        let pending = vec![
            Interrupt::new("a", Value::Null),
            Interrupt::new("b", Value::Null),
        ];
        let values = Resume::Single(json!({"type": "approve"})).into_values(&pending);
        assert_eq!(values.len(), 2);
        assert_eq!(values["b"], json!({"type": "approve"}));
    }

    #[tokio::test]
    async fn test_plain_answer_ends() {
        let model = Arc::new(MockModel::with_text("Hello!"));
        let agent = Agent::builder().with_model(model.clone()).build().unwrap();

        let output = agent.invoke(AgentInput::text("hi"), RunConfig::new()).await.unwrap();
        assert_eq!(output.status, RunStatus::Completed);
        assert_eq!(output.text(), "Hello!");
        assert_eq!(output.state.messages.len(), 2);
        assert_eq!(model.request_count(), 1);
    }

    #[tokio::test]
    async fn test_unknown_tool_lists_available() {
        let model = Arc::new(MockModel::with_messages(vec![
            calling("nope", "c1", json!({})),
            AiMessage::new("sorry"),
        ]));
        let agent = Agent::builder()
            .with_model(model)
            .with_tool(MockTool::new("search"))
            .build()
            .unwrap();

        let output = agent.invoke(AgentInput::text("go"), RunConfig::new()).await.unwrap();
        let result = output.state.messages[2].as_tool().unwrap();
        assert!(result.is_error());
        assert!(result.base.content.text().contains("Available tools: search"));
    }

    #[tokio::test]
    async fn test_recursion_limit() {
        let model = Arc::new(MockModel::with_messages(vec![
            calling("search", "c1", json!({})),
            calling("search", "c2", json!({})),
        ]));
        let agent = Agent::builder()
            .with_model(model)
            .with_tool(MockTool::new("search"))
            .build()
            .unwrap();

        let failure = agent
            .invoke(AgentInput::text("loop"), RunConfig::new().with_recursion_limit(3))
            .await
            .unwrap_err();
        assert!(matches!(failure.error, AgentError::RecursionLimit(3)));
        // model, tools, model: the partial state keeps the second call.
        assert_eq!(failure.state.messages.len(), 4);
    }

    #[tokio::test]
    async fn test_resume_without_checkpoint_fails() {
        let agent = Agent::builder()
            .with_model(Arc::new(MockModel::with_text("hi")))
            .build()
            .unwrap();
        let failure = agent
            .invoke(AgentInput::resume(json!({"type": "approve"})), RunConfig::new())
            .await
            .unwrap_err();
        assert!(failure.error.to_string().contains("no pending interrupts"));
    }
}
