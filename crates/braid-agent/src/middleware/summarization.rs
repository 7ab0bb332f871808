//! History summarization before model calls.
//!
//! Once the conversation crosses a token or message threshold, the older
//! part of the history is replaced by a model-written summary while the most
//! recent messages are kept verbatim.

use async_trait::async_trait;

use braid_config::SummarizationConfig;
use braid_llm::{Message, ModelInput, SharedModel};

use super::Middleware;
use crate::error::Result;
use crate::runtime::RunContext;
use crate::state::{AgentState, StatePatch};

// ─────────────────────────────────────────────────────────────────────────────
// Constants
// ─────────────────────────────────────────────────────────────────────────────

/// Rough characters-per-token ratio for English text.
const CHARS_PER_TOKEN: usize = 4;

/// Fixed per-message overhead in estimated tokens.
const MESSAGE_OVERHEAD_TOKENS: usize = 10;

/// Tool results longer than this are truncated in the transcript.
const MAX_TOOL_RESULT_CHARS: usize = 500;

const SUMMARY_PROMPT: &str = "\
Summarize the earlier portion of this conversation concisely. Focus on:
- Key topics discussed and decisions made
- Important context needed for the ongoing conversation
- Any pending items or questions raised

Provide a clear, factual summary in 1-2 paragraphs. The summary will replace \
the earlier messages while the most recent exchanges are preserved verbatim.";

/// Prefix of the message that carries the summary.
pub const SUMMARY_PREFIX: &str = "Here is a summary of the conversation to date:";

/// Estimate the token count of one message.
pub fn estimate_message_tokens(message: &Message) -> usize {
    let mut chars = message.text().len();
    if let Some(ai) = message.as_ai() {
        for call in &ai.tool_calls {
            chars += call.name.len() + call.args.to_string().len();
        }
    }
    MESSAGE_OVERHEAD_TOKENS + chars / CHARS_PER_TOKEN
}

// ─────────────────────────────────────────────────────────────────────────────
// Middleware
// ─────────────────────────────────────────────────────────────────────────────

/// Summarizes older history once it grows past a threshold.
pub struct SummarizationMiddleware {
    model: SharedModel,
    trigger_tokens: Option<usize>,
    trigger_messages: Option<usize>,
    keep_messages: usize,
    summary_prompt: Option<String>,
}

impl SummarizationMiddleware {
    /// Summarize with `model` using the default thresholds.
    pub fn new(model: SharedModel) -> Self {
        Self::from_config(model, &SummarizationConfig::default())
    }

    pub fn from_config(model: SharedModel, config: &SummarizationConfig) -> Self {
        Self {
            model,
            trigger_tokens: config.trigger_tokens,
            trigger_messages: config.trigger_messages,
            keep_messages: config.keep_messages,
            summary_prompt: None,
        }
    }

    pub fn with_trigger_tokens(mut self, tokens: usize) -> Self {
        self.trigger_tokens = Some(tokens);
        self
    }

    pub fn with_trigger_messages(mut self, messages: usize) -> Self {
        self.trigger_messages = Some(messages);
        self
    }

    pub fn with_keep_messages(mut self, keep: usize) -> Self {
        self.keep_messages = keep;
        self
    }

    pub fn with_summary_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.summary_prompt = Some(prompt.into());
        self
    }

    /// Whether `messages` crosses either threshold.
    pub fn should_summarize(&self, messages: &[Message]) -> bool {
        let by_count = self
            .trigger_messages
            .is_some_and(|limit| messages.len() >= limit);
        let by_tokens = self.trigger_tokens.is_some_and(|limit| {
            messages.iter().map(estimate_message_tokens).sum::<usize>() >= limit
        });
        by_count || by_tokens
    }

    /// Index of the first preserved message.
    ///
    /// Moves earlier while the boundary would separate tool results from the
    /// AI message that requested them.
    fn cutoff(&self, messages: &[Message]) -> usize {
        let mut cutoff = messages.len().saturating_sub(self.keep_messages);
        while cutoff > 0 && matches!(messages.get(cutoff), Some(Message::Tool(_))) {
            cutoff -= 1;
        }
        cutoff
    }

    async fn summarize(&self, messages: &[Message], runtime: &RunContext) -> Result<String> {
        let transcript = messages
            .iter()
            .map(transcript_line)
            .collect::<Vec<_>>()
            .join("\n\n");

        let input = ModelInput::new(vec![Message::human(transcript)]).with_system_prompt(
            self.summary_prompt.as_deref().unwrap_or(SUMMARY_PROMPT),
        );
        let output = self
            .model
            .invoke(input, runtime.cancellation.clone())
            .await?;
        Ok(output.message.base.content.text())
    }
}

fn transcript_line(message: &Message) -> String {
    match message {
        Message::System(_) => format!("System: {}", message.text()),
        Message::Human(_) => format!("User: {}", message.text()),
        Message::Ai(ai) => {
            let mut parts = Vec::new();
            let text = message.text();
            if !text.is_empty() {
                parts.push(format!("Assistant: {text}"));
            }
            for call in &ai.tool_calls {
                parts.push(format!("Tool call: {} ({})", call.name, call.id));
            }
            parts.join("\n")
        }
        Message::Tool(tool) => {
            let status = if tool.is_error() { "error" } else { "success" };
            let content = message.text();
            let content = if content.len() > MAX_TOOL_RESULT_CHARS {
                let end = (0..=MAX_TOOL_RESULT_CHARS)
                    .rev()
                    .find(|i| content.is_char_boundary(*i))
                    .unwrap_or(0);
                format!("{}... [truncated]", &content[..end])
            } else {
                content
            };
            format!("Tool result ({status}): {content}")
        }
    }
}

#[async_trait]
impl Middleware for SummarizationMiddleware {
    fn name(&self) -> &str {
        "summarization"
    }

    async fn before_model(
        &self,
        state: &AgentState,
        runtime: &RunContext,
    ) -> Result<Option<StatePatch>> {
        if !self.should_summarize(&state.messages) {
            return Ok(None);
        }
        let cutoff = self.cutoff(&state.messages);
        if cutoff == 0 {
            return Ok(None);
        }

        let (older, recent) = state.messages.split_at(cutoff);
        let summary = self.summarize(older, runtime).await?;
        tracing::info!(
            thread_id = %runtime.thread_id,
            summarized = older.len(),
            preserved = recent.len(),
            "Summarized conversation history"
        );

        let patch = StatePatch::new()
            .remove_all_messages()
            .with_message(Message::human(format!("{SUMMARY_PREFIX}\n\n{summary}")))
            .with_messages(recent.iter().cloned());
        Ok(Some(patch))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
