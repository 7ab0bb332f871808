//! Detection and handling of personally identifiable information.

use std::net::Ipv4Addr;

use async_trait::async_trait;
use regex::Regex;

use braid_llm::{Content, ContentBlock, Message};

use super::Middleware;
use crate::error::{AgentError, Result};
use crate::runtime::RunContext;
use crate::state::{AgentState, StatePatch};

// ─────────────────────────────────────────────────────────────────────────────
// Detectors
// ─────────────────────────────────────────────────────────────────────────────

/// A kind of PII to look for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PiiDetector {
    Email,
    /// Card numbers passing the Luhn check.
    CreditCard,
    /// Dotted-quad IPv4 addresses.
    Ip,
    MacAddress,
    Url,
    Custom { name: String, pattern: String },
}

impl PiiDetector {
    pub fn custom(name: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::Custom {
            name: name.into(),
            pattern: pattern.into(),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            PiiDetector::Email => "email",
            PiiDetector::CreditCard => "credit_card",
            PiiDetector::Ip => "ip",
            PiiDetector::MacAddress => "mac_address",
            PiiDetector::Url => "url",
            PiiDetector::Custom { name, .. } => name,
        }
    }

    fn pattern(&self) -> &str {
        match self {
            PiiDetector::Email => r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}",
            PiiDetector::CreditCard => r"\b(?:\d[ -]?){12,18}\d\b",
            PiiDetector::Ip => r"\b(?:\d{1,3}\.){3}\d{1,3}\b",
            PiiDetector::MacAddress => r"\b[0-9A-Fa-f]{2}(?:[:-][0-9A-Fa-f]{2}){5}\b",
            PiiDetector::Url => r#"(?:https?://|www\.)[^\s<>"']+"#,
            PiiDetector::Custom { pattern, .. } => pattern,
        }
    }

    /// Extra check for candidates the pattern alone over-matches.
    fn confirm(&self, candidate: &str) -> bool {
        match self {
            PiiDetector::CreditCard => luhn_valid(candidate),
            PiiDetector::Ip => candidate.parse::<Ipv4Addr>().is_ok(),
            _ => true,
        }
    }
}

fn luhn_valid(candidate: &str) -> bool {
    let digits: Vec<u32> = candidate.chars().filter_map(|c| c.to_digit(10)).collect();
    if !(13..=19).contains(&digits.len()) {
        return false;
    }
    let sum: u32 = digits
        .iter()
        .rev()
        .enumerate()
        .map(|(i, &d)| {
            if i % 2 == 1 {
                let doubled = d * 2;
                if doubled > 9 { doubled - 9 } else { doubled }
            } else {
                d
            }
        })
        .sum();
    sum % 10 == 0
}

/// One detected occurrence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PiiMatch {
    pub kind: String,
    pub value: String,
    pub start: usize,
    pub end: usize,
}

/// What to do with detected PII.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PiiStrategy {
    /// Fail the turn with a middleware veto.
    Block,
    /// Replace with `[REDACTED_<KIND>]`.
    #[default]
    Redact,
    /// Keep the last four characters and star out the rest.
    Mask,
}

// ─────────────────────────────────────────────────────────────────────────────
// Middleware
// ─────────────────────────────────────────────────────────────────────────────

/// Applies one detector to model input, model output, or tool results.
#[derive(Debug, Clone)]
pub struct PiiMiddleware {
    name: String,
    detector: PiiDetector,
    regex: Regex,
    strategy: PiiStrategy,
    apply_to_input: bool,
    apply_to_output: bool,
    apply_to_tool_results: bool,
}

impl PiiMiddleware {
    /// Checks user input by default.
    pub fn new(detector: PiiDetector, strategy: PiiStrategy) -> Result<Self> {
        let regex = Regex::new(detector.pattern()).map_err(|e| {
            AgentError::Config(format!(
                "invalid pattern for PII detector '{}': {e}",
                detector.name()
            ))
        })?;
        Ok(Self {
            name: format!("pii[{}]", detector.name()),
            detector,
            regex,
            strategy,
            apply_to_input: true,
            apply_to_output: false,
            apply_to_tool_results: false,
        })
    }

    pub fn apply_to_input(mut self, enabled: bool) -> Self {
        self.apply_to_input = enabled;
        self
    }

    pub fn apply_to_output(mut self, enabled: bool) -> Self {
        self.apply_to_output = enabled;
        self
    }

    pub fn apply_to_tool_results(mut self, enabled: bool) -> Self {
        self.apply_to_tool_results = enabled;
        self
    }

    /// Every occurrence in `text`, in order.
    pub fn detect(&self, text: &str) -> Vec<PiiMatch> {
        self.regex
            .find_iter(text)
            .filter(|m| self.detector.confirm(m.as_str()))
            .map(|m| PiiMatch {
                kind: self.detector.name().to_string(),
                value: m.as_str().to_string(),
                start: m.start(),
                end: m.end(),
            })
            .collect()
    }

    /// Apply the strategy to `text`. Returns `None` when nothing was found.
    fn scrub(&self, text: &str, location: &str) -> Result<Option<String>> {
        let matches = self.detect(text);
        if matches.is_empty() {
            return Ok(None);
        }
        if self.strategy == PiiStrategy::Block {
            return Err(AgentError::veto(
                &self.name,
                format!(
                    "{} {} detected in {location}",
                    matches.len(),
                    self.detector.name()
                ),
            ));
        }

        let mut out = String::with_capacity(text.len());
        let mut cursor = 0;
        for found in &matches {
            out.push_str(&text[cursor..found.start]);
            out.push_str(&self.replacement(&found.value));
            cursor = found.end;
        }
        out.push_str(&text[cursor..]);
        Ok(Some(out))
    }

    fn replacement(&self, value: &str) -> String {
        match self.strategy {
            PiiStrategy::Mask => mask(&self.detector, value),
            _ => format!("[REDACTED_{}]", self.detector.name().to_uppercase()),
        }
    }

    /// The message with its text scrubbed, or `None` when it is clean.
    fn scrub_message(&self, message: &Message, location: &str) -> Result<Option<Message>> {
        let content = match message.content() {
            Content::Text(text) => match self.scrub(text, location)? {
                Some(clean) => Content::Text(clean),
                None => return Ok(None),
            },
            Content::Blocks(blocks) => {
                let mut changed = false;
                let mut cleaned = Vec::with_capacity(blocks.len());
                for block in blocks {
                    match block {
                        ContentBlock::Text(text) => match self.scrub(&text.text, location)? {
                            Some(clean) => {
                                changed = true;
                                let mut text = text.clone();
                                text.text = clean;
                                cleaned.push(ContentBlock::Text(text));
                            }
                            None => cleaned.push(block.clone()),
                        },
                        other => cleaned.push(other.clone()),
                    }
                }
                if !changed {
                    return Ok(None);
                }
                Content::Blocks(cleaned)
            }
        };
        Ok(Some(message.clone().with_content(content)))
    }
}

fn mask(detector: &PiiDetector, value: &str) -> String {
    if *detector == PiiDetector::Email {
        if let Some((local, domain)) = value.split_once('@') {
            let first: String = local.chars().take(1).collect();
            return format!("{first}***@{domain}");
        }
    }
    let significant = value.chars().filter(|c| c.is_alphanumeric()).count();
    let keep_from = significant.saturating_sub(4);
    let mut seen = 0;
    value
        .chars()
        .map(|c| {
            if c.is_alphanumeric() {
                seen += 1;
                if seen <= keep_from { '*' } else { c }
            } else {
                c
            }
        })
        .collect()
}

#[async_trait]
impl Middleware for PiiMiddleware {
    fn name(&self) -> &str {
        &self.name
    }

    async fn before_model(
        &self,
        state: &AgentState,
        _runtime: &RunContext,
    ) -> Result<Option<StatePatch>> {
        let mut patch = StatePatch::new();

        if self.apply_to_input {
            let last_human = state.messages.iter().rev().find(|m| m.is_human());
            if let Some(message) = last_human {
                if let Some(clean) = self.scrub_message(message, "input")? {
                    patch = patch.with_message(clean);
                }
            }
        }

        if self.apply_to_tool_results {
            let recent_tools = state
                .messages
                .iter()
                .rev()
                .take_while(|m| m.as_ai().is_none())
                .filter(|m| m.as_tool().is_some());
            for message in recent_tools.collect::<Vec<_>>().into_iter().rev() {
                if let Some(clean) = self.scrub_message(message, "tool result")? {
                    patch = patch.with_message(clean);
                }
            }
        }

        Ok((!patch.is_empty()).then_some(patch))
    }

    async fn after_model(
        &self,
        state: &AgentState,
        _runtime: &RunContext,
    ) -> Result<Option<StatePatch>> {
        if !self.apply_to_output {
            return Ok(None);
        }
        let Some(last) = state.messages.last().filter(|m| m.as_ai().is_some()) else {
            return Ok(None);
        };
        Ok(self
            .scrub_message(last, "output")?
            .map(|clean| StatePatch::new().with_message(clean)))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
