//! Anthropic Messages API content blocks.
//!
//! Supported native shapes:
//! - `text` (optionally with `citations`)
//! - `thinking`
//! - `image` / `document` with `base64` or `file` sources
//! - `tool_use`
//! - `tool_result` with string or block content
//!
//! Everything else (`redacted_thinking`, server tool blocks, url sources)
//! round-trips as `non_standard`.

use serde_json::{Value, json};

use super::{
    Fields, Rule, RuleTable, TranslateResult, Translator, insert_opt, object_from_extras,
    opaque_citation, opaque_citation_value, type_field_discriminant,
};
use crate::content::{
    Citation, Content, ContentBlock, MediaBlock, MediaSource, ReasoningBlock, TextBlock,
    ToolCallBlock, ToolResultBlock, base64_bytes,
};
use crate::error::TranslationError;

const PROVIDER: &str = "anthropic";

/// Citation location kinds and the keys holding their span.
const LOCATIONS: &[(&str, &str, &str)] = &[
    ("char_location", "start_char_index", "end_char_index"),
    ("page_location", "start_page_number", "end_page_number"),
    ("content_block_location", "start_block_index", "end_block_index"),
];

static TABLE: RuleTable = RuleTable {
    provider: PROVIDER,
    discriminant: type_field_discriminant,
    rules: &[
        Rule {
            native_tag: "text",
            canonical_tag: "text",
            to_canonical: text_to_canonical,
        },
        Rule {
            native_tag: "thinking",
            canonical_tag: "reasoning",
            to_canonical: thinking_to_canonical,
        },
        Rule {
            native_tag: "image",
            canonical_tag: "image",
            to_canonical: image_to_canonical,
        },
        Rule {
            native_tag: "document",
            canonical_tag: "file",
            to_canonical: document_to_canonical,
        },
        Rule {
            native_tag: "tool_use",
            canonical_tag: "tool_call",
            to_canonical: tool_use_to_canonical,
        },
        Rule {
            native_tag: "tool_result",
            canonical_tag: "tool_result",
            to_canonical: tool_result_to_canonical,
        },
    ],
    encode,
};

/// Translator for Anthropic Messages API content.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnthropicTranslator;

impl AnthropicTranslator {
    /// The underlying rule table.
    pub fn table() -> &'static RuleTable {
        &TABLE
    }
}

impl Translator for AnthropicTranslator {
    fn provider(&self) -> &'static str {
        PROVIDER
    }

    fn to_canonical(&self, native: &Value) -> TranslateResult<Vec<ContentBlock>> {
        TABLE.decode(native)
    }

    fn from_canonical(&self, blocks: &[ContentBlock]) -> TranslateResult<Vec<Value>> {
        TABLE.encode_all(blocks)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Native -> Canonical
// ─────────────────────────────────────────────────────────────────────────────

fn fields(tag: &'static str, body: &Value) -> Fields {
    let mut fields = Fields::new(PROVIDER, tag, body);
    fields.drop_key("type");
    fields
}

fn text_to_canonical(body: &Value) -> TranslateResult<Option<Vec<ContentBlock>>> {
    let mut f = fields("text", body);
    let text = f.required_str("text")?;
    let annotations = f
        .non_empty_array("citations")
        .map(|citations| {
            citations
                .iter()
                .enumerate()
                .map(|(index, citation)| citation_to_canonical(index, citation))
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    Ok(Some(vec![ContentBlock::Text(TextBlock {
        text,
        annotations,
        extras: f.into_extras(),
    })]))
}

fn citation_to_canonical(index: usize, native: &Value) -> Citation {
    if !native.is_object() {
        return opaque_citation(index, native);
    }
    let mut f = Fields::new(PROVIDER, "citation", native);

    let kind = f.peek("type").and_then(Value::as_str).map(str::to_string);
    let location = kind
        .as_deref()
        .and_then(|kind| LOCATIONS.iter().find(|(name, _, _)| *name == kind));

    let (start_index, end_index, title) = match location {
        Some((_, start_key, end_key)) => (
            f.optional_u64(start_key),
            f.optional_u64(end_key),
            f.optional_str("document_title"),
        ),
        None => (None, None, f.optional_str("title")),
    };

    Citation {
        source: index.to_string(),
        cited_text: f.optional_str("cited_text"),
        start_index,
        end_index,
        title,
        extras: f.into_extras(),
    }
}

fn thinking_to_canonical(body: &Value) -> TranslateResult<Option<Vec<ContentBlock>>> {
    let mut f = fields("thinking", body);
    let reasoning = f.required_str("thinking")?;
    let signature = f.optional_str("signature");
    Ok(Some(vec![ContentBlock::Reasoning(ReasoningBlock {
        reasoning,
        signature,
        extras: f.into_extras(),
    })]))
}

fn media_to_canonical(tag: &'static str, body: &Value) -> TranslateResult<Option<MediaBlock>> {
    let mut f = fields(tag, body);
    let source = f.required_object("source")?;
    let source_str = |key: &'static str| -> TranslateResult<String> {
        match source.get(key) {
            Some(Value::String(value)) => Ok(value.clone()),
            Some(other) => Err(f.invalid(key, format!("expected a string, got {other}"))),
            None => Err(f.missing(key)),
        }
    };

    let (mime_type, media_source, known_keys) =
        match source.get("type").and_then(Value::as_str) {
            Some("base64") => {
                let mime = source_str("media_type")?;
                let bytes = base64_bytes::decode(&source_str("data")?)
                    .map_err(|e| f.invalid("data", e.to_string()))?;
                (Some(mime), MediaSource::Data(bytes), 3)
            }
            Some("file") => (None, MediaSource::FileId(source_str("file_id")?), 2),
            _ => return Ok(None),
        };
    if source.len() != known_keys {
        return Ok(None);
    }

    Ok(Some(MediaBlock {
        mime_type,
        source: media_source,
        extras: f.into_extras(),
    }))
}

fn image_to_canonical(body: &Value) -> TranslateResult<Option<Vec<ContentBlock>>> {
    Ok(media_to_canonical("image", body)?.map(|media| vec![ContentBlock::Image(media)]))
}

fn document_to_canonical(body: &Value) -> TranslateResult<Option<Vec<ContentBlock>>> {
    Ok(media_to_canonical("document", body)?.map(|media| vec![ContentBlock::File(media)]))
}

fn tool_use_to_canonical(body: &Value) -> TranslateResult<Option<Vec<ContentBlock>>> {
    let mut f = fields("tool_use", body);
    let id = f.required_str("id")?;
    let name = f.required_str("name")?;
    let args = f.required("input")?;
    Ok(Some(vec![ContentBlock::ToolCall(ToolCallBlock {
        id,
        name,
        args,
        extras: f.into_extras(),
    })]))
}

fn tool_result_to_canonical(body: &Value) -> TranslateResult<Option<Vec<ContentBlock>>> {
    let mut f = fields("tool_result", body);
    let tool_call_id = f.required_str("tool_use_id")?;
    let content = match f.take_if("content", |v| {
        v.is_string() || v.as_array().is_some_and(|a| !a.is_empty())
    }) {
        Some(Value::String(text)) => Content::Text(text),
        Some(Value::Array(items)) => {
            let mut blocks = Vec::with_capacity(items.len());
            for item in &items {
                blocks.extend(TABLE.decode(item)?);
            }
            Content::Blocks(blocks)
        }
        _ => Content::Blocks(Vec::new()),
    };
    let is_error = f.optional_bool("is_error");

    Ok(Some(vec![ContentBlock::ToolResult(ToolResultBlock {
        tool_call_id,
        content,
        is_error,
        extras: f.into_extras(),
    })]))
}

// ─────────────────────────────────────────────────────────────────────────────
// Canonical -> Native
// ─────────────────────────────────────────────────────────────────────────────

fn unsupported(block: &ContentBlock, reason: &str) -> TranslationError {
    TranslationError::Unsupported {
        provider: PROVIDER,
        block_type: block.block_type(),
        reason: reason.to_string(),
    }
}

fn encode(block: &ContentBlock) -> TranslateResult<Value> {
    match block {
        ContentBlock::Text(text) => {
            let mut object = object_from_extras(&text.extras);
            object.insert("type".into(), json!("text"));
            object.insert("text".into(), json!(text.text));
            if !text.annotations.is_empty() {
                let citations = text.annotations.iter().map(citation_from_canonical).collect();
                object.insert("citations".into(), Value::Array(citations));
            }
            Ok(Value::Object(object))
        }
        ContentBlock::Reasoning(reasoning) => {
            let mut object = object_from_extras(&reasoning.extras);
            object.insert("type".into(), json!("thinking"));
            object.insert("thinking".into(), json!(reasoning.reasoning));
            insert_opt(&mut object, "signature", reasoning.signature.clone().map(Value::from));
            Ok(Value::Object(object))
        }
        ContentBlock::Image(media) => media_from_canonical("image", block, media),
        ContentBlock::File(media) => media_from_canonical("document", block, media),
        ContentBlock::Video(_) => Err(unsupported(block, "video input is not accepted")),
        ContentBlock::ToolCall(call) => {
            let mut object = object_from_extras(&call.extras);
            object.insert("type".into(), json!("tool_use"));
            object.insert("id".into(), json!(call.id));
            object.insert("name".into(), json!(call.name));
            object.insert("input".into(), call.args.clone());
            Ok(Value::Object(object))
        }
        ContentBlock::ToolResult(result) => {
            let mut object = object_from_extras(&result.extras);
            object.insert("type".into(), json!("tool_result"));
            object.insert("tool_use_id".into(), json!(result.tool_call_id));
            match &result.content {
                Content::Text(text) => {
                    object.insert("content".into(), json!(text));
                }
                Content::Blocks(blocks) if !blocks.is_empty() => {
                    object.insert("content".into(), Value::Array(TABLE.encode_all(blocks)?));
                }
                Content::Blocks(_) => {}
            }
            insert_opt(&mut object, "is_error", result.is_error.map(Value::from));
            Ok(Value::Object(object))
        }
        ContentBlock::NonStandard { value } => Ok(value.clone()),
    }
}

fn citation_from_canonical(citation: &Citation) -> Value {
    if let Some(native) = opaque_citation_value(citation) {
        return native.clone();
    }
    let mut object = object_from_extras(&citation.extras);
    insert_opt(&mut object, "cited_text", citation.cited_text.clone().map(Value::from));

    let kind = object.get("type").and_then(Value::as_str).map(str::to_string);
    let location = kind
        .as_deref()
        .and_then(|kind| LOCATIONS.iter().find(|(name, _, _)| *name == kind));
    match location {
        Some((_, start_key, end_key)) => {
            insert_opt(&mut object, start_key, citation.start_index.map(Value::from));
            insert_opt(&mut object, end_key, citation.end_index.map(Value::from));
            insert_opt(&mut object, "document_title", citation.title.clone().map(Value::from));
        }
        None => {
            insert_opt(&mut object, "title", citation.title.clone().map(Value::from));
        }
    }
    Value::Object(object)
}

fn media_from_canonical(
    tag: &str,
    block: &ContentBlock,
    media: &MediaBlock,
) -> TranslateResult<Value> {
    let source = match &media.source {
        MediaSource::Data(bytes) => {
            let mime = media
                .mime_type
                .as_deref()
                .ok_or_else(|| unsupported(block, "inline data needs a mime type"))?;
            json!({"type": "base64", "media_type": mime, "data": base64_bytes::encode(bytes)})
        }
        MediaSource::FileId(id) => json!({"type": "file", "file_id": id}),
    };
    let mut object = object_from_extras(&media.extras);
    object.insert("type".into(), json!(tag));
    object.insert("source".into(), source);
    Ok(Value::Object(object))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(native: Value) -> Vec<ContentBlock> {
        let canonical = AnthropicTranslator.to_canonical(&native).unwrap();
        let back = AnthropicTranslator.from_canonical(&canonical).unwrap();
        assert_eq!(back, vec![native]);
        canonical
    }

    #[test]
    fn test_text_with_cache_control_roundtrip() {
        let blocks = roundtrip(json!({
            "type": "text",
            "text": "hello",
            "cache_control": {"type": "ephemeral"}
        }));
        match &blocks[0] {
            ContentBlock::Text(text) => {
                assert_eq!(text.text, "hello");
                assert!(text.extras.contains_key("cache_control"));
            }
            other => panic!("expected text, got {other:?}"),
        }
    }

    #[test]
    fn test_citations_become_annotations() {
        let blocks = roundtrip(json!({
            "type": "text",
            "text": "The sky is blue.",
            "citations": [
                {
                    "type": "char_location",
                    "cited_text": "sky is blue",
                    "document_index": 0,
                    "document_title": "Sky facts",
                    "start_char_index": 4,
                    "end_char_index": 15
                },
                {
                    "type": "page_location",
                    "cited_text": "blue",
                    "document_index": 1,
                    "document_title": null,
                    "start_page_number": 2,
                    "end_page_number": 3
                }
            ]
        }));
        let ContentBlock::Text(text) = &blocks[0] else {
            panic!("expected text block");
        };
        assert_eq!(text.annotations.len(), 2);
        assert_eq!(text.annotations[0].source, "0");
        assert_eq!(text.annotations[1].source, "1");
        assert_eq!(text.annotations[0].start_index, Some(4));
        assert_eq!(text.annotations[0].title.as_deref(), Some("Sky facts"));
        assert_eq!(text.annotations[1].title, None);
    }

    #[test]
    fn test_bare_and_lookalike_citations_roundtrip() {
        let blocks = roundtrip(json!({
            "type": "text",
            "text": "x",
            "citations": [{"native": 5}, "bare", {"$opaque": 1}]
        }));
        let ContentBlock::Text(text) = &blocks[0] else {
            panic!("expected text block");
        };
        assert_eq!(text.annotations.len(), 3);
        assert_eq!(text.annotations[0].source, "0");
        assert_eq!(text.annotations[0].extras.get("native"), Some(&json!(5)));
        assert_ne!(text.annotations[1].source, "1");
    }

    #[test]
    fn test_thinking_roundtrip() {
        let blocks = roundtrip(json!({"type": "thinking", "thinking": "2+2=4", "signature": "sig"}));
        assert_eq!(blocks[0].block_type(), "reasoning");
    }

    #[test]
    fn test_redacted_thinking_is_non_standard() {
        let native = json!({"type": "redacted_thinking", "data": "opaque"});
        let blocks = roundtrip(native.clone());
        assert_eq!(blocks, vec![ContentBlock::non_standard(native)]);
    }

    #[test]
    fn test_image_base64_roundtrip() {
        let blocks = roundtrip(json!({
            "type": "image",
            "source": {"type": "base64", "media_type": "image/png", "data": "AQID"}
        }));
        match &blocks[0] {
            ContentBlock::Image(media) => {
                assert_eq!(media.source, MediaSource::Data(vec![1, 2, 3]));
                assert_eq!(media.mime_type.as_deref(), Some("image/png"));
            }
            other => panic!("expected image, got {other:?}"),
        }
    }

    #[test]
    fn test_document_file_source_roundtrip() {
        let blocks = roundtrip(json!({
            "type": "document",
            "title": "Report",
            "source": {"type": "file", "file_id": "file_123"}
        }));
        match &blocks[0] {
            ContentBlock::File(media) => {
                assert_eq!(media.source, MediaSource::FileId("file_123".to_string()));
            }
            other => panic!("expected file, got {other:?}"),
        }
    }

    #[test]
    fn test_url_image_falls_back_to_non_standard() {
        let native = json!({
            "type": "image",
            "source": {"type": "url", "url": "https://example.com/cat.png"}
        });
        let blocks = roundtrip(native.clone());
        assert_eq!(blocks, vec![ContentBlock::non_standard(native)]);
    }

    #[test]
    fn test_tool_use_and_result_roundtrip() {
        roundtrip(json!({
            "type": "tool_use",
            "id": "toolu_1",
            "name": "calculator",
            "input": {"op": "add", "a": 2, "b": 2}
        }));
        let blocks = roundtrip(json!({
            "type": "tool_result",
            "tool_use_id": "toolu_1",
            "content": [{"type": "text", "text": "4"}],
            "is_error": false
        }));
        match &blocks[0] {
            ContentBlock::ToolResult(result) => {
                assert_eq!(result.content.text(), "4");
                assert_eq!(result.is_error, Some(false));
            }
            other => panic!("expected tool result, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_mandatory_field_errors() {
        let err = AnthropicTranslator
            .to_canonical(&json!({"type": "tool_use", "name": "calculator", "input": {}}))
            .unwrap_err();
        assert!(matches!(
            err,
            TranslationError::MissingField { field: "id", .. }
        ));
    }

    #[test]
    fn test_unrecognized_shapes_never_error() {
        for native in [json!("bare"), json!(42), json!({"no_type": true})] {
            let blocks = AnthropicTranslator.to_canonical(&native).unwrap();
            assert_eq!(blocks, vec![ContentBlock::non_standard(native)]);
        }
    }

    #[test]
    fn test_video_is_unsupported() {
        let block = ContentBlock::Video(MediaBlock::file_id(None, "vid"));
        assert!(matches!(
            AnthropicTranslator.from_canonical(&[block]),
            Err(TranslationError::Unsupported { .. })
        ));
    }
}
