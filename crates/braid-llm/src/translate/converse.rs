//! Amazon Bedrock Converse content blocks.
//!
//! Converse blocks are single-key objects (`{"text": "..."}`,
//! `{"toolUse": {...}}`), so the discriminant is the key itself. Binary
//! fields arrive base64 encoded in JSON.

use serde_json::{Map, Value, json};

use super::{
    Fields, Rule, RuleTable, TranslateResult, Translator, insert_opt, object_from_extras,
    opaque_citation, opaque_citation_value, single_key_discriminant,
};
use crate::content::{
    Citation, Content, ContentBlock, Extras, MediaBlock, MediaSource, ReasoningBlock, TextBlock,
    ToolCallBlock, ToolResultBlock, base64_bytes,
};
use crate::error::TranslationError;

const PROVIDER: &str = "bedrock_converse";

static TABLE: RuleTable = RuleTable {
    provider: PROVIDER,
    discriminant: single_key_discriminant,
    rules: &[
        Rule {
            native_tag: "text",
            canonical_tag: "text",
            to_canonical: text_to_canonical,
        },
        Rule {
            native_tag: "citationsContent",
            canonical_tag: "text",
            to_canonical: citations_to_canonical,
        },
        Rule {
            native_tag: "reasoningContent",
            canonical_tag: "reasoning",
            to_canonical: reasoning_to_canonical,
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
            native_tag: "video",
            canonical_tag: "video",
            to_canonical: video_to_canonical,
        },
        Rule {
            native_tag: "toolUse",
            canonical_tag: "tool_call",
            to_canonical: tool_use_to_canonical,
        },
        Rule {
            native_tag: "toolResult",
            canonical_tag: "tool_result",
            to_canonical: tool_result_to_canonical,
        },
    ],
    encode,
};

/// Translator for Bedrock Converse content.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConverseTranslator;

impl ConverseTranslator {
    /// The underlying rule table.
    pub fn table() -> &'static RuleTable {
        &TABLE
    }
}

impl Translator for ConverseTranslator {
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
// Formats
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MediaKind {
    Image,
    Document,
    Video,
}

impl MediaKind {
    fn formats(self) -> &'static [(&'static str, &'static str)] {
        match self {
            MediaKind::Image => &[
                ("png", "image/png"),
                ("jpeg", "image/jpeg"),
                ("gif", "image/gif"),
                ("webp", "image/webp"),
            ],
            MediaKind::Document => &[
                ("pdf", "application/pdf"),
                ("csv", "text/csv"),
                ("doc", "application/msword"),
                (
                    "docx",
                    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
                ),
                ("xls", "application/vnd.ms-excel"),
                (
                    "xlsx",
                    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
                ),
                ("html", "text/html"),
                ("txt", "text/plain"),
                ("md", "text/markdown"),
            ],
            MediaKind::Video => &[
                ("mkv", "video/x-matroska"),
                ("mov", "video/quicktime"),
                ("mp4", "video/mp4"),
                ("webm", "video/webm"),
                ("flv", "video/x-flv"),
                ("mpeg", "video/mpeg"),
                ("mpg", "video/mpg"),
                ("wmv", "video/x-ms-wmv"),
                ("three_gp", "video/3gpp"),
            ],
        }
    }

    fn top_level(self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Document => "application",
            MediaKind::Video => "video",
        }
    }

    fn tag(self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Document => "document",
            MediaKind::Video => "video",
        }
    }

    fn mime_for(self, format: &str) -> String {
        self.formats()
            .iter()
            .find(|(f, _)| *f == format)
            .map(|(_, mime)| mime.to_string())
            .unwrap_or_else(|| format!("{}/{format}", self.top_level()))
    }

    fn format_for(self, mime: &str) -> Option<String> {
        if let Some((format, _)) = self.formats().iter().find(|(_, m)| *m == mime) {
            return Some(format.to_string());
        }
        mime.strip_prefix(self.top_level())
            .and_then(|rest| rest.strip_prefix('/'))
            .filter(|subtype| !subtype.is_empty())
            .map(str::to_string)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Native -> Canonical
// ─────────────────────────────────────────────────────────────────────────────

fn text_to_canonical(body: &Value) -> TranslateResult<Option<Vec<ContentBlock>>> {
    Ok(body.as_str().map(|text| vec![ContentBlock::text(text)]))
}

/// Marks a text block that arrived wrapped in `citationsContent` without any
/// citations, so it is wrapped again on the way out.
const CITATIONS_CONTENT_FLAG: &str = "citations_content";

fn citations_to_canonical(body: &Value) -> TranslateResult<Option<Vec<ContentBlock>>> {
    if !body.is_object() {
        return Ok(None);
    }
    let mut f = Fields::new(PROVIDER, "citationsContent", body);

    // One generated-text part is the common case; anything else is kept
    // verbatim in extras so it can be restored.
    let text = match f.peek("content") {
        Some(Value::Array(parts)) => {
            let single = match parts.as_slice() {
                [part] => part
                    .as_object()
                    .filter(|p| p.len() == 1)
                    .and_then(|p| p.get("text"))
                    .and_then(Value::as_str)
                    .map(str::to_string),
                _ => None,
            };
            match single {
                Some(text) => {
                    f.drop_key("content");
                    text
                }
                None => parts
                    .iter()
                    .filter_map(|p| p.get("text").and_then(Value::as_str))
                    .collect::<Vec<_>>()
                    .join(""),
            }
        }
        Some(_) => return Err(f.invalid("content", "expected an array")),
        None => return Err(f.missing("content")),
    };

    let annotations: Vec<Citation> = f
        .non_empty_array("citations")
        .map(|citations| {
            citations
                .iter()
                .enumerate()
                .map(|(index, citation)| citation_to_canonical(index, citation))
                .collect()
        })
        .unwrap_or_default();
    if annotations.is_empty() {
        f.insert_extra(CITATIONS_CONTENT_FLAG, Value::Bool(true));
    }

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
    let title = f.optional_str("title");
    let cited_text = match f.peek("sourceContent") {
        Some(Value::Array(parts)) if parts.len() == 1 => {
            let text = parts[0]
                .as_object()
                .filter(|p| p.len() == 1)
                .and_then(|p| p.get("text"))
                .and_then(Value::as_str)
                .map(str::to_string);
            if text.is_some() {
                f.drop_key("sourceContent");
            }
            text
        }
        _ => None,
    };

    // Location is `{kind: {documentIndex, start, end}}`; lift the span and
    // leave the rest behind.
    let (mut start_index, mut end_index) = (None, None);
    let mut location = f.take_if("location", |v| {
        v.as_object()
            .is_some_and(|o| o.len() == 1 && o.values().all(Value::is_object))
    });
    if let Some(Value::Object(outer)) = location.as_mut()
        && let Some(Value::Object(span)) = outer.values_mut().next()
    {
        if span.get("start").is_some_and(Value::is_u64) {
            start_index = span.remove("start").and_then(|v| v.as_u64());
        }
        if span.get("end").is_some_and(Value::is_u64) {
            end_index = span.remove("end").and_then(|v| v.as_u64());
        }
    }

    let mut extras = f.into_extras();
    insert_opt(&mut extras, "location", location);
    Citation {
        source: index.to_string(),
        cited_text,
        start_index,
        end_index,
        title,
        extras,
    }
}

fn reasoning_to_canonical(body: &Value) -> TranslateResult<Option<Vec<ContentBlock>>> {
    let Some(object) = body.as_object() else {
        return Ok(None);
    };
    // Redacted reasoning has no readable payload; leave it to the fallback.
    let Some(reasoning_text) = object.get("reasoningText") else {
        return Ok(None);
    };
    if object.len() != 1 {
        return Ok(None);
    }
    let mut f = Fields::new(PROVIDER, "reasoningContent", reasoning_text);
    let reasoning = f.required_str("text")?;
    let signature = f.optional_str("signature");
    Ok(Some(vec![ContentBlock::Reasoning(ReasoningBlock {
        reasoning,
        signature,
        extras: f.into_extras(),
    })]))
}

fn media_to_canonical(kind: MediaKind, body: &Value) -> TranslateResult<Option<MediaBlock>> {
    if !body.is_object() {
        return Ok(None);
    }
    let mut f = Fields::new(PROVIDER, kind.tag(), body);
    let format = f.required_str("format")?;
    let source = f.required_object("source")?;
    if source.len() != 1 {
        return Ok(None);
    }

    let media_source = if let Some(bytes) = source.get("bytes") {
        let encoded = bytes
            .as_str()
            .ok_or_else(|| f.invalid("source.bytes", "expected a base64 string"))?;
        MediaSource::Data(
            base64_bytes::decode(encoded).map_err(|e| f.invalid("source.bytes", e.to_string()))?,
        )
    } else if let Some(location) = source.get("s3Location") {
        let Some(location) = location.as_object() else {
            return Err(f.invalid("source.s3Location", "expected an object"));
        };
        let uri = location
            .get("uri")
            .and_then(Value::as_str)
            .ok_or_else(|| f.missing("source.s3Location.uri"))?;
        let owner = location.get("bucketOwner");
        let known = 1 + usize::from(owner.is_some());
        if location.len() != known || owner.is_some_and(|o| !o.is_string()) {
            return Ok(None);
        }
        if let Some(owner) = owner {
            f.insert_extra("bucket_owner", owner.clone());
        }
        MediaSource::FileId(uri.to_string())
    } else {
        // Inline text or structured document sources.
        return Ok(None);
    };

    Ok(Some(MediaBlock {
        mime_type: Some(kind.mime_for(&format)),
        source: media_source,
        extras: f.into_extras(),
    }))
}

fn image_to_canonical(body: &Value) -> TranslateResult<Option<Vec<ContentBlock>>> {
    Ok(media_to_canonical(MediaKind::Image, body)?.map(|m| vec![ContentBlock::Image(m)]))
}

fn document_to_canonical(body: &Value) -> TranslateResult<Option<Vec<ContentBlock>>> {
    Ok(media_to_canonical(MediaKind::Document, body)?.map(|m| vec![ContentBlock::File(m)]))
}

fn video_to_canonical(body: &Value) -> TranslateResult<Option<Vec<ContentBlock>>> {
    Ok(media_to_canonical(MediaKind::Video, body)?.map(|m| vec![ContentBlock::Video(m)]))
}

fn tool_use_to_canonical(body: &Value) -> TranslateResult<Option<Vec<ContentBlock>>> {
    if !body.is_object() {
        return Ok(None);
    }
    let mut f = Fields::new(PROVIDER, "toolUse", body);
    let id = f.required_str("toolUseId")?;
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
    if !body.is_object() {
        return Ok(None);
    }
    let mut f = Fields::new(PROVIDER, "toolResult", body);
    let tool_call_id = f.required_str("toolUseId")?;
    let items = match f.required("content")? {
        Value::Array(items) => items,
        other => return Err(f.invalid("content", format!("expected an array, got {other}"))),
    };
    let mut blocks = Vec::with_capacity(items.len());
    for item in &items {
        blocks.extend(TABLE.decode(item)?);
    }
    let is_error = match f.peek("status").and_then(Value::as_str) {
        Some("error") => {
            f.drop_key("status");
            Some(true)
        }
        Some("success") => {
            f.drop_key("status");
            Some(false)
        }
        _ => None,
    };

    Ok(Some(vec![ContentBlock::ToolResult(ToolResultBlock {
        tool_call_id,
        content: Content::Blocks(blocks),
        is_error,
        extras: f.into_extras(),
    })]))
}

// ─────────────────────────────────────────────────────────────────────────────
// Canonical -> Native
// ─────────────────────────────────────────────────────────────────────────────

fn unsupported(block: &ContentBlock, reason: impl Into<String>) -> TranslationError {
    TranslationError::Unsupported {
        provider: PROVIDER,
        block_type: block.block_type(),
        reason: reason.into(),
    }
}

fn single(tag: &str, body: Value) -> Value {
    let mut object = Map::new();
    object.insert(tag.to_string(), body);
    Value::Object(object)
}

fn encode(block: &ContentBlock) -> TranslateResult<Value> {
    match block {
        ContentBlock::Text(text) if text.annotations.is_empty() && text.extras.is_empty() => {
            Ok(single("text", json!(text.text)))
        }
        ContentBlock::Text(text) => Ok(single("citationsContent", citations_from_canonical(text))),
        ContentBlock::Reasoning(reasoning) => {
            let mut inner = object_from_extras(&reasoning.extras);
            inner.insert("text".into(), json!(reasoning.reasoning));
            insert_opt(&mut inner, "signature", reasoning.signature.clone().map(Value::from));
            Ok(single(
                "reasoningContent",
                json!({"reasoningText": Value::Object(inner)}),
            ))
        }
        ContentBlock::Image(media) => media_from_canonical(MediaKind::Image, block, media),
        ContentBlock::File(media) => media_from_canonical(MediaKind::Document, block, media),
        ContentBlock::Video(media) => media_from_canonical(MediaKind::Video, block, media),
        ContentBlock::ToolCall(call) => {
            let mut inner = object_from_extras(&call.extras);
            inner.insert("toolUseId".into(), json!(call.id));
            inner.insert("name".into(), json!(call.name));
            inner.insert("input".into(), call.args.clone());
            Ok(single("toolUse", Value::Object(inner)))
        }
        ContentBlock::ToolResult(result) => {
            let mut inner = object_from_extras(&result.extras);
            inner.insert("toolUseId".into(), json!(result.tool_call_id));
            let content = match &result.content {
                Content::Text(text) => vec![single("text", json!(text))],
                Content::Blocks(blocks) => TABLE.encode_all(blocks)?,
            };
            inner.insert("content".into(), Value::Array(content));
            insert_opt(
                &mut inner,
                "status",
                result
                    .is_error
                    .map(|is_error| json!(if is_error { "error" } else { "success" })),
            );
            Ok(single("toolResult", Value::Object(inner)))
        }
        ContentBlock::NonStandard { value } => Ok(value.clone()),
    }
}

fn citations_from_canonical(text: &TextBlock) -> Value {
    let mut inner = object_from_extras(&text.extras);
    inner.remove(CITATIONS_CONTENT_FLAG);
    if !inner.contains_key("content") {
        inner.insert("content".into(), json!([{"text": text.text}]));
    }
    if !text.annotations.is_empty() {
        let citations = text
            .annotations
            .iter()
            .map(citation_from_canonical)
            .collect();
        inner.insert("citations".into(), Value::Array(citations));
    }
    Value::Object(inner)
}

fn citation_from_canonical(citation: &Citation) -> Value {
    if let Some(native) = opaque_citation_value(citation) {
        return native.clone();
    }
    let mut object: Extras = object_from_extras(&citation.extras);
    insert_opt(&mut object, "title", citation.title.clone().map(Value::from));
    if let Some(text) = &citation.cited_text {
        object.insert("sourceContent".into(), json!([{"text": text}]));
    }
    if let Some(Value::Object(outer)) = object.get_mut("location")
        && let Some(Value::Object(span)) = outer.values_mut().next()
    {
        insert_opt(span, "start", citation.start_index.map(Value::from));
        insert_opt(span, "end", citation.end_index.map(Value::from));
    }
    Value::Object(object)
}

fn media_from_canonical(
    kind: MediaKind,
    block: &ContentBlock,
    media: &MediaBlock,
) -> TranslateResult<Value> {
    let mime = media
        .mime_type
        .as_deref()
        .ok_or_else(|| unsupported(block, "a mime type is required to pick a format"))?;
    let format = kind
        .format_for(mime)
        .ok_or_else(|| unsupported(block, format!("no {} format for '{mime}'", kind.tag())))?;

    let mut inner = object_from_extras(&media.extras);
    let owner = inner.remove("bucket_owner");
    let source = match &media.source {
        MediaSource::Data(bytes) => json!({"bytes": base64_bytes::encode(bytes)}),
        MediaSource::FileId(uri) => {
            let mut location = Map::new();
            location.insert("uri".into(), json!(uri));
            insert_opt(&mut location, "bucketOwner", owner);
            json!({"s3Location": Value::Object(location)})
        }
    };
    inner.insert("format".into(), json!(format));
    inner.insert("source".into(), source);
    Ok(single(kind.tag(), Value::Object(inner)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(native: Value) -> Vec<ContentBlock> {
        let canonical = ConverseTranslator.to_canonical(&native).unwrap();
        let back = ConverseTranslator.from_canonical(&canonical).unwrap();
        assert_eq!(back, vec![native]);
        canonical
    }

    #[test]
    fn test_text_roundtrip() {
        let blocks = roundtrip(json!({"text": "hello"}));
        assert_eq!(blocks, vec![ContentBlock::text("hello")]);
    }

    #[test]
    fn test_image_bytes_map_to_data() {
        let blocks = roundtrip(json!({"image": {"format": "png", "source": {"bytes": "AQID"}}}));
        match &blocks[0] {
            ContentBlock::Image(media) => {
                assert_eq!(media.mime_type.as_deref(), Some("image/png"));
                assert_eq!(media.source, MediaSource::Data(vec![1, 2, 3]));
            }
            other => panic!("expected image, got {other:?}"),
        }
    }

    #[test]
    fn test_s3_location_maps_to_file_id() {
        let blocks = roundtrip(json!({
            "document": {
                "format": "pdf",
                "name": "report",
                "source": {"s3Location": {"uri": "s3://bucket/report.pdf", "bucketOwner": "123"}}
            }
        }));
        match &blocks[0] {
            ContentBlock::File(media) => {
                assert_eq!(
                    media.source,
                    MediaSource::FileId("s3://bucket/report.pdf".to_string())
                );
                assert_eq!(media.extras["bucket_owner"], json!("123"));
            }
            other => panic!("expected file, got {other:?}"),
        }
    }

    #[test]
    fn test_video_roundtrip() {
        roundtrip(json!({
            "video": {"format": "mp4", "source": {"s3Location": {"uri": "s3://b/clip.mp4"}}}
        }));
    }

    #[test]
    fn test_unknown_format_roundtrip() {
        let blocks = roundtrip(json!({"image": {"format": "tiff", "source": {"bytes": "AQID"}}}));
        match &blocks[0] {
            ContentBlock::Image(media) => assert_eq!(media.mime_type.as_deref(), Some("image/tiff")),
            other => panic!("expected image, got {other:?}"),
        }
    }

    #[test]
    fn test_citations_content_expands_to_one_text_block() {
        let blocks = roundtrip(json!({
            "citationsContent": {
                "content": [{"text": "Paris is the capital."}],
                "citations": [
                    {
                        "title": "Atlas",
                        "sourceContent": [{"text": "capital of France is Paris"}],
                        "location": {"documentChar": {"documentIndex": 0, "start": 10, "end": 36}}
                    },
                    {
                        "title": "Guide",
                        "sourceContent": [{"text": "Paris"}],
                        "location": {"documentPage": {"documentIndex": 1, "start": 3, "end": 3}}
                    }
                ]
            }
        }));
        assert_eq!(blocks.len(), 1);
        let ContentBlock::Text(text) = &blocks[0] else {
            panic!("expected text block");
        };
        assert_eq!(text.text, "Paris is the capital.");
        assert_eq!(text.annotations.len(), 2);
        assert_eq!(text.annotations[0].source, "0");
        assert_eq!(text.annotations[1].source, "1");
        assert_eq!(
            text.annotations[0].cited_text.as_deref(),
            Some("capital of France is Paris")
        );
        assert_eq!(text.annotations[0].start_index, Some(10));
        assert_eq!(text.annotations[1].title.as_deref(), Some("Guide"));
    }

    #[test]
    fn test_multi_part_citations_content_roundtrip() {
        let blocks = roundtrip(json!({
            "citationsContent": {
                "content": [{"text": "a"}, {"text": "b"}],
                "citations": [{"title": "T", "location": {"documentChunk": {"documentIndex": 0, "start": 1, "end": 2}}}]
            }
        }));
        assert_eq!(blocks[0].as_text(), Some("ab"));
    }

    #[test]
    fn test_citations_content_without_citations_keeps_wrapper() {
        let native = json!({"citationsContent": {"content": [{"text": "plain"}]}});
        let blocks = roundtrip(native);
        let ContentBlock::Text(text) = &blocks[0] else {
            panic!("expected text block");
        };
        assert_eq!(text.text, "plain");
        assert!(text.annotations.is_empty());
        assert_eq!(text.extras[CITATIONS_CONTENT_FLAG], json!(true));
    }

    #[test]
    fn test_bare_and_lookalike_citations_roundtrip() {
        let blocks = roundtrip(json!({
            "citationsContent": {
                "content": [{"text": "x"}],
                "citations": [{"native": 5}, "bare", {"$opaque": 1}]
            }
        }));
        let ContentBlock::Text(text) = &blocks[0] else {
            panic!("expected text block");
        };
        assert_eq!(text.annotations.len(), 3);
        assert_eq!(text.annotations[0].extras.get("native"), Some(&json!(5)));
        assert_eq!(text.annotations[2].extras.get("$opaque"), Some(&json!(1)));
    }

    #[test]
    fn test_reasoning_roundtrip() {
        let blocks = roundtrip(json!({
            "reasoningContent": {"reasoningText": {"text": "thinking...", "signature": "abc"}}
        }));
        assert_eq!(blocks[0].block_type(), "reasoning");
    }

    #[test]
    fn test_redacted_reasoning_is_non_standard() {
        let native = json!({"reasoningContent": {"redactedContent": "AQID"}});
        let blocks = roundtrip(native.clone());
        assert_eq!(blocks, vec![ContentBlock::non_standard(native)]);
    }

    #[test]
    fn test_tool_use_and_result_roundtrip() {
        roundtrip(json!({
            "toolUse": {"toolUseId": "t1", "name": "calculator", "input": {"a": 2, "b": 2}}
        }));
        let blocks = roundtrip(json!({
            "toolResult": {
                "toolUseId": "t1",
                "content": [{"text": "4"}, {"json": {"value": 4}}],
                "status": "success"
            }
        }));
        let ContentBlock::ToolResult(result) = &blocks[0] else {
            panic!("expected tool result");
        };
        assert_eq!(result.is_error, Some(false));
        let Content::Blocks(inner) = &result.content else {
            panic!("expected blocks");
        };
        assert_eq!(inner[0], ContentBlock::text("4"));
        assert_eq!(inner[1].block_type(), "non_standard");
    }

    #[test]
    fn test_cache_point_is_non_standard() {
        let native = json!({"cachePoint": {"type": "default"}});
        assert_eq!(roundtrip(native.clone()), vec![ContentBlock::non_standard(native)]);
    }

    #[test]
    fn test_missing_tool_use_id_errors() {
        let err = ConverseTranslator
            .to_canonical(&json!({"toolUse": {"name": "x", "input": {}}}))
            .unwrap_err();
        assert!(matches!(
            err,
            TranslationError::MissingField {
                field: "toolUseId",
                ..
            }
        ));
    }
}
