//! Agent runtime for Braid.
//!
//! This crate provides the agent run loop, the middleware protocol and its
//! built-in middleware, tools with schema validation, and the checkpoint
//! and scheduler collaborators.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Agent                                                      │
//! │  - Runs model ─▶ route ─▶ tools | structured_output | end   │
//! │  - Sole writer of AgentState; applies middleware patches    │
//! │  - Checkpoints after every node                             │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!              ┌───────────────┼────────────────┐
//!              ▼               ▼                ▼
//!       ┌────────────┐  ┌─────────────┐  ┌──────────────┐
//!       │ ChatModel  │  │ Middleware  │  │ ToolRegistry │
//!       │(braid-llm) │  │ Pipeline    │  │ + validator  │
//!       └────────────┘  └─────────────┘  └──────────────┘
//! ```
//!
//! # Core Components
//!
//! - [`Agent`] / [`AgentBuilder`]: build once, run many threads
//! - [`Middleware`]: lifecycle hooks; see [`middleware`] for built-ins
//! - [`AgentState`] / [`StatePatch`]: run state and partial updates
//! - [`CheckpointStore`]: per-thread persistence enabling interrupt/resume

pub mod agent;
pub mod checkpoint;
pub mod error;
pub mod middleware;
pub mod runtime;
pub mod scheduler;
pub mod state;
pub mod stream;
pub mod tool;
pub mod validation;

// Re-export core types
pub use error::{AgentError, Result, RunFailure};
pub use runtime::{Interrupt, RunContext};
pub use state::{
    AgentState, JumpTo, MessageUpdate, Reducer, StatePatch, StateSchema, add_messages,
};

// Re-export agent
pub use agent::{
    Agent, AgentBuilder, AgentInput, OutputStrategy, Resume, RunConfig, RunOutput, RunResult,
    RunStatus,
};
pub use stream::{AgentStream, StreamEvent, StreamMode};

// Re-export collaborators
pub use checkpoint::{
    Checkpoint, CheckpointStore, MemoryCheckpointStore, PendingWrite, SharedCheckpointStore,
};
pub use scheduler::{InlineScheduler, Node, Scheduler, SharedScheduler};

// Re-export tool types
pub use tool::{
    ParamExt, ParamResult, ParameterValidationError, Tool, ToolRegistry, ToolResult, ToolRuntime,
};
pub use validation::{JsonSchemaValidator, SchemaValidator, SharedValidator, ValidationError};

// Re-export middleware
pub use middleware::{
    FnMiddleware, FnMiddlewareBuilder, Middleware, MiddlewarePipeline, ModelHandler, ModelNext,
    ModelRequest, ModelResponse, SharedMiddleware, ToolCallRequest, ToolCallResponse, ToolHandler,
    ToolNext, builtin_middleware_from_config, create_middleware,
};
