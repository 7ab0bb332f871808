//! Canonical content model and chat model abstraction for Braid.
//!
//! This crate defines the provider-neutral vocabulary the agent speaks:
//! content blocks, messages with mergeable streaming chunks, per-provider
//! translators, the versioned persistence envelope, and the [`ChatModel`]
//! trait every provider client implements.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │  ChatModel trait                             │
//! │  - invoke(ModelInput) -> ModelOutput         │
//! │  - stream(ModelInput) -> Stream<Chunk>       │
//! └──────────────────────────────────────────────┘
//!                      │  canonical Message / ContentBlock
//!         ┌────────────┴────────────┐
//!         ▼                         ▼
//! ┌──────────────────┐     ┌───────────────────┐
//! │ AnthropicTransl. │     │ ConverseTranslator│
//! └──────────────────┘     └───────────────────┘
//! ```
//!
//! Translators round-trip losslessly: fields the canonical form does not
//! model ride along in each block's `extras`, and blocks nobody recognizes
//! are kept verbatim as `non_standard`.

pub mod content;
pub mod envelope;
pub mod error;
pub mod message;
pub mod model;
pub mod translate;

pub use content::{
    Citation, Content, ContentBlock, Extras, MediaBlock, MediaSource, ReasoningBlock, TextBlock,
    ToolCallBlock, ToolResultBlock,
};
pub use envelope::{DecoderRegistry, Encodable, Envelope, EnvelopeError, Persisted, UpgradeFn};
pub use error::{
    BlockValidationError, LlmError, MergeError, RateLimitInfo, Result, TranslationError,
};
pub use message::{
    AiMessage, AiMessageChunk, HumanMessage, InvalidToolCall, Kwargs, Mergeable, Message,
    MessageBase, MessageChunk, SystemMessage, ToolCall, ToolCallChunk, ToolMessage,
    ToolMessageChunk, ToolStatus, UsageMetadata, concat_all, deep_merge,
};
pub use model::{
    CallOptions, ChatModel, ChunkStream, ModelInput, ModelOutput, ResponseFormat, SharedModel,
    ToolChoice, ToolDefinition,
};
pub use translate::{
    AnthropicTranslator, ConverseTranslator, TranslateResult, Translator, TranslatorRegistry,
};

#[cfg(any(test, feature = "testing"))]
pub use model::{MockModel, MockResponse};
