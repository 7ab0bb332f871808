//! Provider translators.
//!
//! A translator is a pure, bidirectional mapping between a provider's
//! native content blocks and the canonical [`ContentBlock`] model. Each
//! provider is written as a [`RuleTable`]: a discriminant extractor, a list
//! of `native tag -> canonical tag` rules with field mappers, and an encoder
//! for the reverse direction.
//!
//! ```text
//! native block ──discriminant──▶ tag ──first matching rule──▶ canonical blocks
//!                                  └── no rule / unsupported ──▶ non_standard
//! ```

pub mod anthropic;
pub mod converse;

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::content::{Citation, Content, ContentBlock, Extras};
use crate::error::TranslationError;
use crate::message::{AiMessage, Message, MessageBase, ToolMessage};

pub use anthropic::AnthropicTranslator;
pub use converse::ConverseTranslator;

/// Result type for translation.
pub type TranslateResult<T> = std::result::Result<T, TranslationError>;

// ─────────────────────────────────────────────────────────────────────────────
// Translator Contract
// ─────────────────────────────────────────────────────────────────────────────

/// Bidirectional mapping between native provider blocks and canonical
/// content blocks.
///
/// Implementations never fail on unknown input: anything they cannot model
/// comes back as [`ContentBlock::NonStandard`]. They fail only when a
/// recognized block is missing a field the provider's schema requires.
pub trait Translator: Send + Sync {
    /// Provider name used for registry lookup.
    fn provider(&self) -> &'static str;

    /// Translate one native block into canonical blocks.
    fn to_canonical(&self, native: &Value) -> TranslateResult<Vec<ContentBlock>>;

    /// Translate canonical blocks back into native blocks.
    fn from_canonical(&self, blocks: &[ContentBlock]) -> TranslateResult<Vec<Value>>;

    /// Translate a native content field, which may be a bare string or an
    /// array of blocks.
    fn content_to_canonical(&self, content: &Value) -> TranslateResult<Content> {
        match content {
            Value::String(text) => Ok(Content::Text(text.clone())),
            Value::Array(items) => {
                let mut blocks = Vec::with_capacity(items.len());
                for item in items {
                    blocks.extend(self.to_canonical(item)?);
                }
                Ok(Content::Blocks(blocks))
            }
            other => Ok(Content::Blocks(vec![ContentBlock::non_standard(
                other.clone(),
            )])),
        }
    }

    /// Build a canonical message from a native role and content field.
    ///
    /// Assistant content has its tool-call blocks lifted into
    /// `tool_calls`.
    fn message_to_canonical(&self, role: &str, content: &Value) -> TranslateResult<Message> {
        let content = self.content_to_canonical(content)?;
        Ok(match role {
            "system" => Message::system(content),
            "assistant" | "ai" => match content {
                Content::Blocks(blocks) => Message::Ai(AiMessage::from_blocks(blocks)),
                text => Message::Ai(AiMessage::new(text)),
            },
            _ => Message::human(content),
        })
    }

    /// Translate a canonical message's content into native blocks.
    ///
    /// AI tool calls that are not already present as blocks are appended.
    fn message_from_canonical(&self, message: &Message) -> TranslateResult<Vec<Value>> {
        let mut blocks = message.content().blocks();
        match message {
            Message::Ai(ai) => {
                for call in &ai.tool_calls {
                    let present = blocks.iter().any(|b| {
                        matches!(b, ContentBlock::ToolCall(existing) if existing.id == call.id)
                    });
                    if !present {
                        blocks.push(ContentBlock::tool_call(
                            call.id.clone(),
                            call.name.clone(),
                            call.args.clone(),
                        ));
                    }
                }
            }
            Message::Tool(ToolMessage {
                base: MessageBase { content, .. },
                tool_call_id,
                status,
            }) => {
                blocks = vec![ContentBlock::ToolResult(crate::content::ToolResultBlock {
                    tool_call_id: tool_call_id.clone(),
                    content: content.clone(),
                    is_error: (*status == crate::message::ToolStatus::Error).then_some(true),
                    extras: Extras::new(),
                })];
            }
            _ => {}
        }
        self.from_canonical(&blocks)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Rule Tables
// ─────────────────────────────────────────────────────────────────────────────

/// Field mapper for one native tag.
///
/// Returns `Ok(None)` when the block matched the tag but uses a variant of
/// it this table does not model; the caller then preserves it verbatim.
pub type ToCanonicalFn = fn(&Value) -> TranslateResult<Option<Vec<ContentBlock>>>;

/// Encoder for one canonical block.
pub type FromCanonicalFn = fn(&ContentBlock) -> TranslateResult<Value>;

/// Extracts the discriminant tag and the body passed to the rule.
pub type DiscriminantFn = fn(&Value) -> Option<(&str, &Value)>;

/// One `native tag -> canonical tag` rule.
#[derive(Debug, Clone, Copy)]
pub struct Rule {
    pub native_tag: &'static str,
    pub canonical_tag: &'static str,
    pub to_canonical: ToCanonicalFn,
}

/// A provider's declarative translation table.
#[derive(Debug)]
pub struct RuleTable {
    pub provider: &'static str,
    pub discriminant: DiscriminantFn,
    pub rules: &'static [Rule],
    pub encode: FromCanonicalFn,
}

impl RuleTable {
    /// First rule whose native tag matches.
    pub fn rule_for(&self, tag: &str) -> Option<&Rule> {
        self.rules.iter().find(|rule| rule.native_tag == tag)
    }

    /// Native tags this table understands, in dispatch order.
    pub fn native_tags(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.rules.iter().map(|rule| rule.native_tag)
    }

    pub fn decode(&self, native: &Value) -> TranslateResult<Vec<ContentBlock>> {
        let Some((tag, body)) = (self.discriminant)(native) else {
            return Ok(vec![ContentBlock::non_standard(native.clone())]);
        };
        let Some(rule) = self.rule_for(tag) else {
            tracing::debug!(
                provider = self.provider,
                tag,
                "No translation rule, preserving block verbatim"
            );
            return Ok(vec![ContentBlock::non_standard(native.clone())]);
        };
        match (rule.to_canonical)(body)? {
            Some(blocks) => Ok(blocks),
            None => Ok(vec![ContentBlock::non_standard(native.clone())]),
        }
    }

    pub fn encode_all(&self, blocks: &[ContentBlock]) -> TranslateResult<Vec<Value>> {
        blocks
            .iter()
            .map(|block| match block {
                ContentBlock::NonStandard { value } => Ok(value.clone()),
                standard => (self.encode)(standard),
            })
            .collect()
    }
}

/// Discriminant for `{"type": "<tag>", ...}` blocks; the body is the whole
/// object.
pub fn type_field_discriminant(value: &Value) -> Option<(&str, &Value)> {
    let tag = value.as_object()?.get("type")?.as_str()?;
    Some((tag, value))
}

/// Discriminant for `{"<tag>": body}` blocks with exactly one key.
pub fn single_key_discriminant(value: &Value) -> Option<(&str, &Value)> {
    let object = value.as_object()?;
    if object.len() != 1 {
        return None;
    }
    object.iter().next().map(|(key, body)| (key.as_str(), body))
}

// ─────────────────────────────────────────────────────────────────────────────
// Field Extraction
// ─────────────────────────────────────────────────────────────────────────────

/// Consumes fields out of a native object. Whatever is left at the end
/// becomes the canonical block's `extras`, which is what keeps round trips
/// lossless.
#[derive(Debug)]
pub(crate) struct Fields {
    provider: &'static str,
    tag: &'static str,
    rest: Map<String, Value>,
}

impl Fields {
    /// Fields of `body`; a non-object body has no fields.
    pub(crate) fn new(provider: &'static str, tag: &'static str, body: &Value) -> Self {
        Self {
            provider,
            tag,
            rest: body.as_object().cloned().unwrap_or_default(),
        }
    }

    pub(crate) fn missing(&self, field: &'static str) -> TranslationError {
        TranslationError::MissingField {
            provider: self.provider,
            tag: self.tag.to_string(),
            field,
        }
    }

    pub(crate) fn invalid(&self, field: &'static str, reason: impl Into<String>) -> TranslationError {
        TranslationError::InvalidField {
            provider: self.provider,
            tag: self.tag.to_string(),
            field,
            reason: reason.into(),
        }
    }

    pub(crate) fn drop_key(&mut self, key: &str) {
        self.rest.remove(key);
    }

    pub(crate) fn insert_extra(&mut self, key: &str, value: Value) {
        self.rest.insert(key.to_string(), value);
    }

    pub(crate) fn peek(&self, key: &str) -> Option<&Value> {
        self.rest.get(key)
    }

    /// Take a mandatory field of any type.
    pub(crate) fn required(&mut self, key: &'static str) -> TranslateResult<Value> {
        match self.rest.remove(key) {
            None | Some(Value::Null) => Err(self.missing(key)),
            Some(value) => Ok(value),
        }
    }

    /// Take a mandatory string field.
    pub(crate) fn required_str(&mut self, key: &'static str) -> TranslateResult<String> {
        match self.required(key)? {
            Value::String(text) => Ok(text),
            other => Err(self.invalid(key, format!("expected a string, got {other}"))),
        }
    }

    /// Take a mandatory object field.
    pub(crate) fn required_object(&mut self, key: &'static str) -> TranslateResult<Map<String, Value>> {
        match self.required(key)? {
            Value::Object(object) => Ok(object),
            other => Err(self.invalid(key, format!("expected an object, got {other}"))),
        }
    }

    /// Take a field only when `accept` approves its value.
    pub(crate) fn take_if(&mut self, key: &str, accept: impl Fn(&Value) -> bool) -> Option<Value> {
        if self.rest.get(key).is_some_and(accept) {
            self.rest.remove(key)
        } else {
            None
        }
    }

    pub(crate) fn optional_str(&mut self, key: &str) -> Option<String> {
        self.take_if(key, Value::is_string)
            .and_then(|v| v.as_str().map(str::to_string))
    }

    pub(crate) fn optional_u64(&mut self, key: &str) -> Option<u64> {
        self.take_if(key, Value::is_u64).and_then(|v| v.as_u64())
    }

    pub(crate) fn optional_bool(&mut self, key: &str) -> Option<bool> {
        self.take_if(key, Value::is_boolean).and_then(|v| v.as_bool())
    }

    /// Take an array field only when it is non-empty.
    pub(crate) fn non_empty_array(&mut self, key: &str) -> Option<Vec<Value>> {
        match self.take_if(key, |v| v.as_array().is_some_and(|a| !a.is_empty())) {
            Some(Value::Array(items)) => Some(items),
            _ => None,
        }
    }

    pub(crate) fn into_extras(self) -> Extras {
        self.rest
    }
}

/// Start a native object from canonical extras.
pub(crate) fn object_from_extras(extras: &Extras) -> Map<String, Value> {
    extras.clone()
}

/// Insert a value unless it is `None`.
pub(crate) fn insert_opt(object: &mut Map<String, Value>, key: &str, value: Option<Value>) {
    if let Some(value) = value {
        object.insert(key.to_string(), value);
    }
}

/// Extras key for a citation the provider sent as a bare value.
const OPAQUE_CITATION_KEY: &str = "$opaque";
const OPAQUE_SOURCE_PREFIX: &str = "opaque:";

/// Canonical stand-in for a non-object citation. Its source carries a
/// prefix that decoded object citations never have, so the pair cannot be
/// confused with a provider object that happens to use the same key.
pub(crate) fn opaque_citation(index: usize, native: &Value) -> Citation {
    let mut extras = Map::new();
    extras.insert(OPAQUE_CITATION_KEY.to_string(), native.clone());
    Citation {
        source: format!("{OPAQUE_SOURCE_PREFIX}{index}"),
        extras,
        ..Default::default()
    }
}

/// The bare value behind a citation built by [`opaque_citation`].
pub(crate) fn opaque_citation_value(citation: &Citation) -> Option<&Value> {
    if !citation.source.starts_with(OPAQUE_SOURCE_PREFIX) || citation.extras.len() != 1 {
        return None;
    }
    citation.extras.get(OPAQUE_CITATION_KEY)
}

// ─────────────────────────────────────────────────────────────────────────────
// Registry
// ─────────────────────────────────────────────────────────────────────────────

/// Explicit provider-name to translator lookup.
///
/// Built by the caller and handed to whatever needs to translate; there is
/// no process-wide registry.
#[derive(Clone, Default)]
pub struct TranslatorRegistry {
    translators: HashMap<String, Arc<dyn Translator>>,
}

impl TranslatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the bundled translators.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(AnthropicTranslator));
        registry.register(Arc::new(ConverseTranslator));
        registry
    }

    /// Register a translator under its provider name, replacing any
    /// previous entry.
    pub fn register(&mut self, translator: Arc<dyn Translator>) {
        self.translators
            .insert(translator.provider().to_string(), translator);
    }

    pub fn get(&self, provider: &str) -> Option<Arc<dyn Translator>> {
        self.translators.get(provider).cloned()
    }

    pub fn providers(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.translators.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for TranslatorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranslatorRegistry")
            .field("providers", &self.providers())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_discriminants() {
        let typed = json!({"type": "text", "text": "hi"});
        assert_eq!(type_field_discriminant(&typed).map(|(t, _)| t), Some("text"));
        assert!(type_field_discriminant(&json!("bare string")).is_none());

        let keyed = json!({"text": "hi"});
        assert_eq!(single_key_discriminant(&keyed).map(|(t, _)| t), Some("text"));
        assert!(single_key_discriminant(&json!({"a": 1, "b": 2})).is_none());
    }

    #[test]
    fn test_registry_defaults() {
        let registry = TranslatorRegistry::with_defaults();
        assert_eq!(registry.providers(), vec!["anthropic", "bedrock_converse"]);
        assert!(registry.get("anthropic").is_some());
        assert!(registry.get("unknown").is_none());
    }

    #[test]
    fn test_content_to_canonical_string() {
        let content = AnthropicTranslator
            .content_to_canonical(&json!("plain"))
            .unwrap();
        assert_eq!(content, Content::from("plain"));
    }

    #[test]
    fn test_message_to_canonical_lifts_tool_calls() {
        let content = json!([
            {"type": "text", "text": "checking"},
            {"type": "tool_use", "id": "toolu_1", "name": "calculator", "input": {"a": 2}}
        ]);
        let message = AnthropicTranslator
            .message_to_canonical("assistant", &content)
            .unwrap();
        let ai = message.as_ai().unwrap();
        assert_eq!(ai.tool_calls.len(), 1);
        assert_eq!(ai.tool_calls[0].id, "toolu_1");
    }

    #[test]
    fn test_tool_message_from_canonical() {
        let message = Message::Tool(ToolMessage::error("toolu_1", "bad args"));
        let native = AnthropicTranslator.message_from_canonical(&message).unwrap();
        assert_eq!(
            native,
            vec![json!({
                "type": "tool_result",
                "tool_use_id": "toolu_1",
                "content": "bad args",
                "is_error": true
            })]
        );
    }
}
