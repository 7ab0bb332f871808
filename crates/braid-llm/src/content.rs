//! Canonical, provider-agnostic content blocks.
//!
//! Every provider translator maps its native representation onto these
//! types. Anything the canonical model cannot express travels as
//! [`ContentBlock::NonStandard`] so round trips never lose data.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::BlockValidationError;

/// Provider-specific fields with no canonical slot.
pub type Extras = Map<String, Value>;

// ─────────────────────────────────────────────────────────────────────────────
// Content Blocks
// ─────────────────────────────────────────────────────────────────────────────

/// A single typed unit of message content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Plain text, optionally annotated with citations.
    Text(TextBlock),
    /// Opaque chain-of-thought.
    Reasoning(ReasoningBlock),
    /// An image.
    Image(MediaBlock),
    /// A document or other file.
    File(MediaBlock),
    /// A video.
    Video(MediaBlock),
    /// A tool invocation requested by the model.
    ToolCall(ToolCallBlock),
    /// The result of a tool invocation.
    ToolResult(ToolResultBlock),
    /// A provider-native block preserved verbatim.
    NonStandard {
        /// The original native block.
        value: Value,
    },
}

/// Text content.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TextBlock {
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub annotations: Vec<Citation>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extras: Extras,
}

/// A citation attached to a text block.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Citation {
    /// Stable identifier of the cited source within the block.
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cited_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_index: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_index: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extras: Extras,
}

/// Model reasoning.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ReasoningBlock {
    pub reasoning: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extras: Extras,
}

/// Where the bytes of a media block live.
///
/// Inline bytes and a remote reference are mutually exclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaSource {
    /// Inline binary payload.
    Data(Vec<u8>),
    /// Reference to a remotely stored file (file id, bucket URI, ...).
    FileId(String),
}

/// Image, file or video content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawMediaBlock", into = "RawMediaBlock")]
pub struct MediaBlock {
    pub mime_type: Option<String>,
    pub source: MediaSource,
    pub extras: Extras,
}

impl MediaBlock {
    /// Media with inline bytes.
    pub fn data(mime_type: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            mime_type: Some(mime_type.into()),
            source: MediaSource::Data(bytes.into()),
            extras: Extras::new(),
        }
    }

    /// Media referenced by id.
    pub fn file_id(mime_type: Option<String>, id: impl Into<String>) -> Self {
        Self {
            mime_type,
            source: MediaSource::FileId(id.into()),
            extras: Extras::new(),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct RawMediaBlock {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    mime_type: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "base64_bytes::option"
    )]
    data: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    file_id: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    extras: Extras,
}

impl TryFrom<RawMediaBlock> for MediaBlock {
    type Error = String;

    fn try_from(raw: RawMediaBlock) -> std::result::Result<Self, Self::Error> {
        let source = match (raw.data, raw.file_id) {
            (Some(bytes), None) => MediaSource::Data(bytes),
            (None, Some(id)) => MediaSource::FileId(id),
            (Some(_), Some(_)) => {
                return Err("media block carries both data and file_id".to_string());
            }
            (None, None) => return Err("media block needs data or file_id".to_string()),
        };
        Ok(Self {
            mime_type: raw.mime_type,
            source,
            extras: raw.extras,
        })
    }
}

impl From<MediaBlock> for RawMediaBlock {
    fn from(block: MediaBlock) -> Self {
        let (data, file_id) = match block.source {
            MediaSource::Data(bytes) => (Some(bytes), None),
            MediaSource::FileId(id) => (None, Some(id)),
        };
        Self {
            mime_type: block.mime_type,
            data,
            file_id,
            extras: block.extras,
        }
    }
}

/// A tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallBlock {
    pub id: String,
    pub name: String,
    pub args: Value,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extras: Extras,
}

/// A tool result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResultBlock {
    pub tool_call_id: String,
    pub content: Content,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extras: Extras,
}

impl ContentBlock {
    /// A plain text block.
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(TextBlock {
            text: text.into(),
            ..Default::default()
        })
    }

    /// A reasoning block.
    pub fn reasoning(reasoning: impl Into<String>, signature: Option<String>) -> Self {
        Self::Reasoning(ReasoningBlock {
            reasoning: reasoning.into(),
            signature,
            extras: Extras::new(),
        })
    }

    /// A tool call block.
    pub fn tool_call(id: impl Into<String>, name: impl Into<String>, args: Value) -> Self {
        Self::ToolCall(ToolCallBlock {
            id: id.into(),
            name: name.into(),
            args,
            extras: Extras::new(),
        })
    }

    /// A verbatim provider block.
    pub fn non_standard(value: Value) -> Self {
        Self::NonStandard { value }
    }

    /// The serialized tag of this block.
    pub fn block_type(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::Reasoning(_) => "reasoning",
            Self::Image(_) => "image",
            Self::File(_) => "file",
            Self::Video(_) => "video",
            Self::ToolCall(_) => "tool_call",
            Self::ToolResult(_) => "tool_result",
            Self::NonStandard { .. } => "non_standard",
        }
    }

    /// Text of a text block.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(block) => Some(&block.text),
            _ => None,
        }
    }

    /// Check the shape invariants of this block.
    pub fn validate(&self) -> std::result::Result<(), BlockValidationError> {
        match self {
            Self::Text(block) => {
                for (index, citation) in block.annotations.iter().enumerate() {
                    if let (Some(start), Some(end)) = (citation.start_index, citation.end_index)
                        && start > end
                    {
                        return Err(BlockValidationError::InvalidCitationSpan {
                            index,
                            start,
                            end,
                        });
                    }
                }
                Ok(())
            }
            Self::Image(media) | Self::File(media) | Self::Video(media) => {
                if matches!(media.source, MediaSource::Data(_))
                    && media.mime_type.as_deref().is_none_or(str::is_empty)
                {
                    return Err(BlockValidationError::MissingMimeType {
                        block_type: self.block_type(),
                    });
                }
                Ok(())
            }
            Self::ToolCall(call) if call.id.is_empty() => Err(BlockValidationError::EmptyId {
                block_type: "tool_call",
            }),
            Self::ToolResult(result) if result.tool_call_id.is_empty() => {
                Err(BlockValidationError::EmptyId {
                    block_type: "tool_result",
                })
            }
            _ => Ok(()),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Message Content
// ─────────────────────────────────────────────────────────────────────────────

/// Message content: a bare string or an ordered list of blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl Default for Content {
    fn default() -> Self {
        Content::Text(String::new())
    }
}

impl Content {
    /// Concatenated text of the content, ignoring non-text blocks.
    pub fn text(&self) -> String {
        match self {
            Content::Text(text) => text.clone(),
            Content::Blocks(blocks) => blocks
                .iter()
                .filter_map(ContentBlock::as_text)
                .collect::<Vec<_>>()
                .join(""),
        }
    }

    /// The content as a list of blocks.
    pub fn blocks(&self) -> Vec<ContentBlock> {
        match self {
            Content::Text(text) if text.is_empty() => Vec::new(),
            Content::Text(text) => vec![ContentBlock::text(text.clone())],
            Content::Blocks(blocks) => blocks.clone(),
        }
    }

    /// Returns true when there is no content at all.
    pub fn is_empty(&self) -> bool {
        match self {
            Content::Text(text) => text.is_empty(),
            Content::Blocks(blocks) => blocks.is_empty(),
        }
    }

    /// Merge two content values in order.
    ///
    /// Strings concatenate. Once either side is a block list the result is a
    /// block list, and a trailing text block absorbs a leading text block
    /// that carries no annotations, so grouping never changes the result.
    pub fn concat(&self, other: &Content) -> Content {
        match (self, other) {
            (Content::Text(left), Content::Text(right)) => {
                Content::Text(format!("{left}{right}"))
            }
            _ => {
                let mut merged = self.blocks();
                for block in other.blocks() {
                    push_coalesced(&mut merged, block);
                }
                Content::Blocks(merged)
            }
        }
    }
}

fn push_coalesced(blocks: &mut Vec<ContentBlock>, block: ContentBlock) {
    if let ContentBlock::Text(next) = &block
        && next.annotations.is_empty()
        && next.extras.is_empty()
        && let Some(ContentBlock::Text(last)) = blocks.last_mut()
        && last.extras.is_empty()
    {
        last.text.push_str(&next.text);
        return;
    }
    blocks.push(block);
}

impl From<&str> for Content {
    fn from(text: &str) -> Self {
        Content::Text(text.to_string())
    }
}

impl From<String> for Content {
    fn from(text: String) -> Self {
        Content::Text(text)
    }
}

impl From<Vec<ContentBlock>> for Content {
    fn from(blocks: Vec<ContentBlock>) -> Self {
        Content::Blocks(blocks)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Base64 helpers
// ─────────────────────────────────────────────────────────────────────────────

pub(crate) mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;

    pub fn encode(bytes: &[u8]) -> String {
        STANDARD.encode(bytes)
    }

    pub fn decode(text: &str) -> Result<Vec<u8>, base64::DecodeError> {
        STANDARD.decode(text)
    }

    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            value: &Option<Vec<u8>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(bytes) => serializer.serialize_some(&super::encode(bytes)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Vec<u8>>, D::Error> {
            let text: Option<String> = Option::deserialize(deserializer)?;
            text.map(|t| super::decode(&t).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_text_block_serialization() {
        let block = ContentBlock::text("hello");
        let value = serde_json::to_value(&block).unwrap();
        assert_eq!(value, json!({"type": "text", "text": "hello"}));
    }

    #[test]
    fn test_media_data_serializes_as_base64() {
        let block = ContentBlock::Image(MediaBlock::data("image/png", vec![1, 2, 3]));
        let value = serde_json::to_value(&block).unwrap();
        assert_eq!(
            value,
            json!({"type": "image", "mime_type": "image/png", "data": "AQID"})
        );

        let parsed: ContentBlock = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, block);
    }

    #[test]
    fn test_media_rejects_data_and_file_id() {
        let value = json!({"type": "file", "data": "AQID", "file_id": "f_1"});
        assert!(serde_json::from_value::<ContentBlock>(value).is_err());

        let value = json!({"type": "file", "mime_type": "application/pdf"});
        assert!(serde_json::from_value::<ContentBlock>(value).is_err());
    }

    #[test]
    fn test_validate_missing_mime_type() {
        let block = ContentBlock::Video(MediaBlock {
            mime_type: None,
            source: MediaSource::Data(vec![0]),
            extras: Extras::new(),
        });
        assert_eq!(
            block.validate(),
            Err(BlockValidationError::MissingMimeType {
                block_type: "video"
            })
        );

        let remote = ContentBlock::Video(MediaBlock::file_id(None, "s3://bucket/clip.mp4"));
        assert!(remote.validate().is_ok());
    }

    #[test]
    fn test_validate_citation_span() {
        let block = ContentBlock::Text(TextBlock {
            text: "x".to_string(),
            annotations: vec![Citation {
                source: "0".to_string(),
                start_index: Some(5),
                end_index: Some(2),
                ..Default::default()
            }],
            extras: Extras::new(),
        });
        assert!(matches!(
            block.validate(),
            Err(BlockValidationError::InvalidCitationSpan { index: 0, .. })
        ));
    }

    #[test]
    fn test_content_concat_strings() {
        let a = Content::from("Hel");
        let b = Content::from("lo");
        assert_eq!(a.concat(&b), Content::from("Hello"));
    }

    #[test]
    fn test_content_concat_mixed_is_associative() {
        let a = Content::from("a");
        let b = Content::from("b");
        let c = Content::Blocks(vec![
            ContentBlock::text("c"),
            ContentBlock::reasoning("think", None),
        ]);

        let left = a.concat(&b).concat(&c);
        let right = a.concat(&b.concat(&c));
        assert_eq!(left, right);
        assert_eq!(left.text(), "abc");
    }

    #[test]
    fn test_content_concat_keeps_annotated_text_separate() {
        let cited = ContentBlock::Text(TextBlock {
            text: "cited".to_string(),
            annotations: vec![Citation {
                source: "0".to_string(),
                ..Default::default()
            }],
            extras: Extras::new(),
        });
        let merged = Content::from("plain ").concat(&Content::Blocks(vec![cited]));
        match merged {
            Content::Blocks(blocks) => assert_eq!(blocks.len(), 2),
            other => panic!("expected blocks, got {other:?}"),
        }
    }

    #[test]
    fn test_tool_result_nested_content_roundtrip() {
        let block = ContentBlock::ToolResult(ToolResultBlock {
            tool_call_id: "call_1".to_string(),
            content: Content::Blocks(vec![ContentBlock::text("4")]),
            is_error: Some(false),
            extras: Extras::new(),
        });
        let json = serde_json::to_string(&block).unwrap();
        let parsed: ContentBlock = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, block);
    }
}
