//! Message types and streaming chunks.
//!
//! Messages are tagged variants sharing one capability set (content,
//! metadata, optional id). Chunk counterparts implement [`Mergeable`] so a
//! streaming consumer can fold them with an associative `concat`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::content::{Content, ContentBlock};
use crate::error::{MergeError, TranslationError};
use crate::translate::Translator;

/// Free-form provider keyword arguments and response metadata.
pub type Kwargs = Map<String, Value>;

// ─────────────────────────────────────────────────────────────────────────────
// Shared Fields
// ─────────────────────────────────────────────────────────────────────────────

/// Fields every message kind carries.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MessageBase {
    #[serde(default)]
    pub content: Content,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub additional_kwargs: Kwargs,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub response_metadata: Kwargs,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl MessageBase {
    /// Base fields holding only content.
    pub fn new(content: impl Into<Content>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    fn concat(&self, other: &MessageBase) -> MessageBase {
        MessageBase {
            content: self.content.concat(&other.content),
            additional_kwargs: deep_merge(&self.additional_kwargs, &other.additional_kwargs),
            response_metadata: deep_merge(&self.response_metadata, &other.response_metadata),
            id: self.id.clone().or_else(|| other.id.clone()),
            name: self.name.clone().or_else(|| other.name.clone()),
        }
    }
}

/// Deep-merge two JSON objects; on conflicting non-object values the right
/// side wins.
pub fn deep_merge(left: &Kwargs, right: &Kwargs) -> Kwargs {
    let mut merged = left.clone();
    for (key, value) in right {
        let combined = match (merged.get(key), value) {
            (Some(Value::Object(l)), Value::Object(r)) => Value::Object(deep_merge(l, r)),
            _ => value.clone(),
        };
        merged.insert(key.clone(), combined);
    }
    merged
}

// ─────────────────────────────────────────────────────────────────────────────
// Tool Calls
// ─────────────────────────────────────────────────────────────────────────────

/// A parsed tool call requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, args: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            args,
        }
    }
}

/// A tool call whose arguments could not be parsed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvalidToolCall {
    pub id: Option<String>,
    pub name: Option<String>,
    pub args: Option<String>,
    pub error: String,
}

/// A streamed fragment of a tool call.
///
/// Fragments sharing an `index` belong to the same call; their `args`
/// strings concatenate in arrival order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ToolCallChunk {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
}

/// Token usage reported for a model call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UsageMetadata {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

impl UsageMetadata {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
        }
    }
}

impl std::ops::Add for UsageMetadata {
    type Output = UsageMetadata;

    fn add(self, rhs: UsageMetadata) -> UsageMetadata {
        UsageMetadata {
            input_tokens: self.input_tokens + rhs.input_tokens,
            output_tokens: self.output_tokens + rhs.output_tokens,
            total_tokens: self.total_tokens + rhs.total_tokens,
        }
    }
}

fn add_usage(left: Option<UsageMetadata>, right: Option<UsageMetadata>) -> Option<UsageMetadata> {
    match (left, right) {
        (Some(l), Some(r)) => Some(l + r),
        (l, r) => l.or(r),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Messages
// ─────────────────────────────────────────────────────────────────────────────

/// System instructions.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SystemMessage {
    #[serde(flatten)]
    pub base: MessageBase,
}

/// Input from the user.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HumanMessage {
    #[serde(flatten)]
    pub base: MessageBase,
}

/// Output of the model.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AiMessage {
    #[serde(flatten)]
    pub base: MessageBase,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub invalid_tool_calls: Vec<InvalidToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage_metadata: Option<UsageMetadata>,
}

impl AiMessage {
    /// An AI message with text content.
    pub fn new(content: impl Into<Content>) -> Self {
        Self {
            base: MessageBase::new(content),
            ..Default::default()
        }
    }

    /// An AI message requesting tool calls.
    pub fn with_tool_calls(content: impl Into<Content>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            base: MessageBase::new(content),
            tool_calls,
            ..Default::default()
        }
    }

    /// Build an AI message from canonical blocks, lifting `tool_call`
    /// blocks into `tool_calls`.
    pub fn from_blocks(blocks: Vec<ContentBlock>) -> Self {
        let tool_calls = blocks
            .iter()
            .filter_map(|block| match block {
                ContentBlock::ToolCall(call) => Some(ToolCall::new(
                    call.id.clone(),
                    call.name.clone(),
                    call.args.clone(),
                )),
                _ => None,
            })
            .collect();
        Self {
            base: MessageBase::new(Content::Blocks(blocks)),
            tool_calls,
            ..Default::default()
        }
    }

    pub fn with_usage(mut self, usage: UsageMetadata) -> Self {
        self.usage_metadata = Some(usage);
        self
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// Completion status of a tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    #[default]
    Success,
    Error,
}

/// The result of a tool call, bound to the originating call by id.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ToolMessage {
    #[serde(flatten)]
    pub base: MessageBase,
    pub tool_call_id: String,
    #[serde(default)]
    pub status: ToolStatus,
}

impl ToolMessage {
    /// A successful tool result.
    pub fn new(tool_call_id: impl Into<String>, content: impl Into<Content>) -> Self {
        Self {
            base: MessageBase::new(content),
            tool_call_id: tool_call_id.into(),
            status: ToolStatus::Success,
        }
    }

    /// A failed tool result.
    pub fn error(tool_call_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            base: MessageBase::new(message.into()),
            tool_call_id: tool_call_id.into(),
            status: ToolStatus::Error,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.base.name = Some(name.into());
        self
    }

    pub fn is_error(&self) -> bool {
        self.status == ToolStatus::Error
    }
}

/// A conversation message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Message {
    System(SystemMessage),
    Human(HumanMessage),
    Ai(AiMessage),
    Tool(ToolMessage),
}

impl Message {
    pub fn system(content: impl Into<Content>) -> Self {
        Message::System(SystemMessage {
            base: MessageBase::new(content),
        })
    }

    pub fn human(content: impl Into<Content>) -> Self {
        Message::Human(HumanMessage {
            base: MessageBase::new(content),
        })
    }

    pub fn ai(content: impl Into<Content>) -> Self {
        Message::Ai(AiMessage::new(content))
    }

    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<Content>) -> Self {
        Message::Tool(ToolMessage::new(tool_call_id, content))
    }

    /// Build a message from a provider role and native content field.
    pub fn from_native(
        role: &str,
        content: &Value,
        translator: &dyn Translator,
    ) -> Result<Self, TranslationError> {
        translator.message_to_canonical(role, content)
    }

    /// The serialized kind tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::System(_) => "system",
            Message::Human(_) => "human",
            Message::Ai(_) => "ai",
            Message::Tool(_) => "tool",
        }
    }

    pub fn base(&self) -> &MessageBase {
        match self {
            Message::System(m) => &m.base,
            Message::Human(m) => &m.base,
            Message::Ai(m) => &m.base,
            Message::Tool(m) => &m.base,
        }
    }

    fn base_mut(&mut self) -> &mut MessageBase {
        match self {
            Message::System(m) => &mut m.base,
            Message::Human(m) => &mut m.base,
            Message::Ai(m) => &mut m.base,
            Message::Tool(m) => &mut m.base,
        }
    }

    pub fn id(&self) -> Option<&str> {
        self.base().id.as_deref()
    }

    /// A copy of this message carrying the given id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.base_mut().id = Some(id.into());
        self
    }

    /// A copy of this message with its content replaced.
    pub fn with_content(mut self, content: impl Into<Content>) -> Self {
        self.base_mut().content = content.into();
        self
    }

    pub fn content(&self) -> &Content {
        &self.base().content
    }

    /// Plain text of the content.
    pub fn text(&self) -> String {
        self.content().text()
    }

    pub fn as_ai(&self) -> Option<&AiMessage> {
        match self {
            Message::Ai(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_tool(&self) -> Option<&ToolMessage> {
        match self {
            Message::Tool(m) => Some(m),
            _ => None,
        }
    }

    pub fn is_human(&self) -> bool {
        matches!(self, Message::Human(_))
    }
}

impl From<AiMessage> for Message {
    fn from(message: AiMessage) -> Self {
        Message::Ai(message)
    }
}

impl From<ToolMessage> for Message {
    fn from(message: ToolMessage) -> Self {
        Message::Tool(message)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Chunks
// ─────────────────────────────────────────────────────────────────────────────

/// Values that can be folded with an associative, order-preserving merge.
pub trait Mergeable: Sized {
    /// Merge `other` after `self`. Pure: neither input is modified.
    fn concat(&self, other: &Self) -> Result<Self, MergeError>;
}

/// A streamed fragment of an AI message.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AiMessageChunk {
    #[serde(flatten)]
    pub base: MessageBase,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_call_chunks: Vec<ToolCallChunk>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage_metadata: Option<UsageMetadata>,
}

impl AiMessageChunk {
    /// A chunk holding a text delta.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            base: MessageBase::new(text.into()),
            ..Default::default()
        }
    }

    /// A chunk holding one tool-call fragment.
    pub fn tool_call_fragment(chunk: ToolCallChunk) -> Self {
        Self {
            tool_call_chunks: vec![chunk],
            ..Default::default()
        }
    }

    /// Finalize into an [`AiMessage`], parsing accumulated tool-call
    /// arguments. Fragments whose arguments are not valid JSON become
    /// invalid tool calls.
    pub fn into_message(self) -> AiMessage {
        let mut tool_calls = Vec::new();
        let mut invalid_tool_calls = Vec::new();

        for chunk in self.tool_call_chunks {
            let raw_args = chunk.args.clone().unwrap_or_default();
            let parsed = if raw_args.trim().is_empty() {
                Ok(Value::Object(Map::new()))
            } else {
                serde_json::from_str::<Value>(&raw_args)
            };

            match (chunk.name.clone(), parsed) {
                (Some(name), Ok(args)) => tool_calls.push(ToolCall {
                    id: chunk
                        .id
                        .clone()
                        .unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4().simple())),
                    name,
                    args,
                }),
                (name, parsed) => invalid_tool_calls.push(InvalidToolCall {
                    id: chunk.id,
                    name,
                    args: chunk.args,
                    error: match parsed {
                        Err(e) => format!("invalid tool call arguments: {e}"),
                        Ok(_) => "tool call is missing a name".to_string(),
                    },
                }),
            }
        }

        AiMessage {
            base: self.base,
            tool_calls,
            invalid_tool_calls,
            usage_metadata: self.usage_metadata,
        }
    }
}

impl Mergeable for AiMessageChunk {
    fn concat(&self, other: &Self) -> Result<Self, MergeError> {
        Ok(AiMessageChunk {
            base: self.base.concat(&other.base),
            tool_call_chunks: merge_tool_call_chunks(&self.tool_call_chunks, &other.tool_call_chunks),
            usage_metadata: add_usage(self.usage_metadata, other.usage_metadata),
        })
    }
}

fn merge_tool_call_chunks(left: &[ToolCallChunk], right: &[ToolCallChunk]) -> Vec<ToolCallChunk> {
    let mut merged = left.to_vec();
    for chunk in right {
        let existing = chunk
            .index
            .and_then(|index| merged.iter_mut().find(|c| c.index == Some(index)));
        match existing {
            Some(existing) => {
                existing.args = match (existing.args.take(), &chunk.args) {
                    (Some(l), Some(r)) => Some(format!("{l}{r}")),
                    (l, r) => l.or_else(|| r.clone()),
                };
                if existing.id.is_none() {
                    existing.id = chunk.id.clone();
                }
                if existing.name.is_none() {
                    existing.name = chunk.name.clone();
                }
            }
            None => merged.push(chunk.clone()),
        }
    }
    merged
}

impl From<&AiMessage> for AiMessageChunk {
    /// A single chunk equivalent to a complete message.
    fn from(message: &AiMessage) -> Self {
        let tool_call_chunks = message
            .tool_calls
            .iter()
            .enumerate()
            .map(|(index, call)| ToolCallChunk {
                id: Some(call.id.clone()),
                name: Some(call.name.clone()),
                args: Some(call.args.to_string()),
                index: Some(index),
            })
            .collect();
        AiMessageChunk {
            base: message.base.clone(),
            tool_call_chunks,
            usage_metadata: message.usage_metadata,
        }
    }
}

/// A streamed fragment of a tool message.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ToolMessageChunk {
    #[serde(flatten)]
    pub base: MessageBase,
    pub tool_call_id: String,
    #[serde(default)]
    pub status: ToolStatus,
}

impl Mergeable for ToolMessageChunk {
    fn concat(&self, other: &Self) -> Result<Self, MergeError> {
        if self.tool_call_id != other.tool_call_id {
            return Err(MergeError::ToolCallIdMismatch {
                left: self.tool_call_id.clone(),
                right: other.tool_call_id.clone(),
            });
        }
        let status = if self.status == ToolStatus::Error || other.status == ToolStatus::Error {
            ToolStatus::Error
        } else {
            ToolStatus::Success
        };
        Ok(ToolMessageChunk {
            base: self.base.concat(&other.base),
            tool_call_id: self.tool_call_id.clone(),
            status,
        })
    }
}

/// Chunk counterpart of [`Message`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageChunk {
    System(MessageBase),
    Human(MessageBase),
    Ai(AiMessageChunk),
    Tool(ToolMessageChunk),
}

impl MessageChunk {
    pub fn kind(&self) -> &'static str {
        match self {
            MessageChunk::System(_) => "system",
            MessageChunk::Human(_) => "human",
            MessageChunk::Ai(_) => "ai",
            MessageChunk::Tool(_) => "tool",
        }
    }

    /// Finalize the chunk into a complete message.
    pub fn into_message(self) -> Message {
        match self {
            MessageChunk::System(base) => Message::System(SystemMessage { base }),
            MessageChunk::Human(base) => Message::Human(HumanMessage { base }),
            MessageChunk::Ai(chunk) => Message::Ai(chunk.into_message()),
            MessageChunk::Tool(chunk) => Message::Tool(ToolMessage {
                base: chunk.base,
                tool_call_id: chunk.tool_call_id,
                status: chunk.status,
            }),
        }
    }
}

impl Mergeable for MessageChunk {
    fn concat(&self, other: &Self) -> Result<Self, MergeError> {
        match (self, other) {
            (MessageChunk::System(l), MessageChunk::System(r)) => {
                Ok(MessageChunk::System(l.concat(r)))
            }
            (MessageChunk::Human(l), MessageChunk::Human(r)) => Ok(MessageChunk::Human(l.concat(r))),
            (MessageChunk::Ai(l), MessageChunk::Ai(r)) => Ok(MessageChunk::Ai(l.concat(r)?)),
            (MessageChunk::Tool(l), MessageChunk::Tool(r)) => Ok(MessageChunk::Tool(l.concat(r)?)),
            (l, r) => Err(MergeError::KindMismatch {
                left: l.kind(),
                right: r.kind(),
            }),
        }
    }
}

/// Fold a sequence of chunks left to right.
pub fn concat_all<T: Mergeable + Clone>(chunks: &[T]) -> Result<Option<T>, MergeError> {
    let mut iter = chunks.iter();
    let Some(first) = iter.next() else {
        return Ok(None);
    };
    let mut acc = first.clone();
    for chunk in iter {
        acc = acc.concat(chunk)?;
    }
    Ok(Some(acc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fragment(index: usize, args: &str) -> AiMessageChunk {
        AiMessageChunk::tool_call_fragment(ToolCallChunk {
            args: Some(args.to_string()),
            index: Some(index),
            ..Default::default()
        })
    }

    #[test]
    fn test_message_serialization_tag() {
        let msg = Message::human("hi").with_id("m1");
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value, json!({"kind": "human", "content": "hi", "id": "m1"}));

        let parsed: Message = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_tool_message_roundtrip() {
        let msg = Message::Tool(ToolMessage::error("call_1", "boom").with_name("calc"));
        let json = serde_json::to_string(&msg).unwrap();
        let parsed: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, msg);
        assert!(parsed.as_tool().unwrap().is_error());
    }

    #[test]
    fn test_concat_text_is_literal() {
        let a = AiMessageChunk::text("Hel");
        let b = AiMessageChunk::text("lo");
        let merged = a.concat(&b).unwrap();
        assert_eq!(merged.base.content, Content::from("Hello"));
    }

    #[test]
    fn test_concat_is_pure() {
        let a = AiMessageChunk::text("a");
        let b = AiMessageChunk::text("b");
        let _ = a.concat(&b).unwrap();
        assert_eq!(a, AiMessageChunk::text("a"));
        assert_eq!(b, AiMessageChunk::text("b"));
    }

    #[test]
    fn test_concat_tool_call_fragments_by_index() {
        let mut head = AiMessageChunk::tool_call_fragment(ToolCallChunk {
            id: Some("call_1".to_string()),
            name: Some("calculator".to_string()),
            args: Some("{\"a\":".to_string()),
            index: Some(0),
        });
        head.base.content = Content::from("");
        let tail = fragment(0, "2}");

        let message = head.concat(&tail).unwrap().into_message();
        assert_eq!(message.tool_calls.len(), 1);
        assert_eq!(message.tool_calls[0].id, "call_1");
        assert_eq!(message.tool_calls[0].args, json!({"a": 2}));
    }

    #[test]
    fn test_concat_associative() {
        let mut a = fragment(0, "{\"x\":");
        a.base.content = Content::from("A");
        a.base
            .response_metadata
            .insert("model".to_string(), json!({"name": "m"}));
        let mut b = fragment(1, "{\"y\":");
        b.base.content = Content::from("B");
        b.usage_metadata = Some(UsageMetadata::new(1, 2));
        let mut c = fragment(0, "1}");
        c.base.content = Content::from("C");
        c.base
            .response_metadata
            .insert("model".to_string(), json!({"version": 2}));
        c.usage_metadata = Some(UsageMetadata::new(3, 4));

        let left = a.concat(&b).unwrap().concat(&c).unwrap();
        let right = a.concat(&b.concat(&c).unwrap()).unwrap();
        assert_eq!(left, right);
        assert_eq!(left.base.content, Content::from("ABC"));
        assert_eq!(left.tool_call_chunks[0].args.as_deref(), Some("{\"x\":1}"));
        assert_eq!(
            left.base.response_metadata["model"],
            json!({"name": "m", "version": 2})
        );
        assert_eq!(left.usage_metadata, Some(UsageMetadata::new(4, 6)));
    }

    #[test]
    fn test_invalid_tool_call_arguments() {
        let chunk = AiMessageChunk::tool_call_fragment(ToolCallChunk {
            id: Some("call_9".to_string()),
            name: Some("search".to_string()),
            args: Some("{\"q\": ".to_string()),
            index: Some(0),
        });
        let message = chunk.into_message();
        assert!(message.tool_calls.is_empty());
        assert_eq!(message.invalid_tool_calls.len(), 1);
        assert_eq!(message.invalid_tool_calls[0].id.as_deref(), Some("call_9"));
    }

    #[test]
    fn test_message_chunk_kind_mismatch() {
        let ai = MessageChunk::Ai(AiMessageChunk::text("x"));
        let human = MessageChunk::Human(MessageBase::new("y"));
        assert_eq!(
            ai.concat(&human),
            Err(MergeError::KindMismatch {
                left: "ai",
                right: "human"
            })
        );
    }

    #[test]
    fn test_concat_all() {
        let chunks = vec![
            AiMessageChunk::text("4"),
            AiMessageChunk::text("2"),
        ];
        let merged = concat_all(&chunks).unwrap().unwrap();
        assert_eq!(merged.into_message().base.content.text(), "42");
        assert!(concat_all::<AiMessageChunk>(&[]).unwrap().is_none());
    }

    #[test]
    fn test_deep_merge_overrides_scalars() {
        let left = json!({"a": {"b": 1, "c": 2}, "d": 1});
        let right = json!({"a": {"b": 3}, "d": "x"});
        let merged = deep_merge(
            left.as_object().unwrap(),
            right.as_object().unwrap(),
        );
        assert_eq!(Value::Object(merged), json!({"a": {"b": 3, "c": 2}, "d": "x"}));
    }

    #[test]
    fn test_ai_message_from_blocks_lifts_tool_calls() {
        let message = AiMessage::from_blocks(vec![
            ContentBlock::text("let me check"),
            ContentBlock::tool_call("toolu_1", "calculator", json!({"a": 1})),
        ]);
        assert_eq!(message.tool_calls.len(), 1);
        assert_eq!(message.tool_calls[0].name, "calculator");
    }

    #[test]
    fn test_from_native_lifts_tool_calls() {
        let content = json!([
            {"type": "text", "text": "Let me add those."},
            {"type": "tool_use", "id": "toolu_1", "name": "calculator", "input": {"a": 2, "b": 2}}
        ]);
        let message =
            Message::from_native("assistant", &content, &crate::translate::AnthropicTranslator)
                .unwrap();

        let ai = message.as_ai().unwrap();
        assert_eq!(ai.tool_calls[0].id, "toolu_1");
        assert_eq!(ai.tool_calls[0].args, json!({"a": 2, "b": 2}));
        assert!(message.text().starts_with("Let me add those."));

        let human = Message::from_native("user", &json!("hi"), &crate::translate::AnthropicTranslator)
            .unwrap();
        assert!(human.is_human());
    }
}
