//! Configuration types mapping to the TOML schema.
//!
//! Top-level config:
//! ```toml
//! [agent]                  # agent defaults
//! [limits.model_calls]     # model call limits
//! [limits.tool_calls]      # tool call limits
//! [retry.model]            # model retry policy
//! [retry.tools]            # tool retry policy
//! [summarization]          # history summarization
//! [checkpoint]             # checkpoint verification
//! ```

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Steps a run may take before it is aborted.
pub const DEFAULT_RECURSION_LIMIT: u32 = 25;

// ─────────────────────────────────────────────────────────────────────────────
// Top-level Config
// ─────────────────────────────────────────────────────────────────────────────

/// Root configuration structure.
///
/// All sections are optional so that partial configs (e.g. project-local
/// overrides) can be loaded and merged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BraidConfig {
    /// Agent defaults.
    pub agent: Option<AgentConfig>,

    /// Call limits.
    pub limits: Option<LimitsConfig>,

    /// Retry policies.
    pub retry: Option<RetrySection>,

    /// History summarization.
    pub summarization: Option<SummarizationConfig>,

    /// Checkpoint behavior.
    pub checkpoint: Option<CheckpointConfig>,
}

impl BraidConfig {
    /// Create an empty config.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from a TOML string.
    pub fn from_toml(toml_str: &str) -> crate::Result<Self> {
        Ok(toml::from_str(toml_str)?)
    }

    /// Serialize to a TOML string.
    pub fn to_toml(&self) -> crate::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Merge another config on top of this one (other takes priority).
    pub fn merge(&mut self, other: BraidConfig) {
        match (&mut self.agent, other.agent) {
            (Some(agent), Some(overlay)) => agent.merge(overlay),
            (slot, overlay @ Some(_)) => *slot = overlay,
            _ => {}
        }

        match (&mut self.limits, other.limits) {
            (Some(limits), Some(overlay)) => limits.merge(overlay),
            (slot, overlay @ Some(_)) => *slot = overlay,
            _ => {}
        }

        match (&mut self.retry, other.retry) {
            (Some(retry), Some(overlay)) => retry.merge(overlay),
            (slot, overlay @ Some(_)) => *slot = overlay,
            _ => {}
        }

        if other.summarization.is_some() {
            self.summarization = other.summarization;
        }

        if other.checkpoint.is_some() {
            self.checkpoint = other.checkpoint;
        }
    }

    /// Check ranges and cross-field consistency.
    pub fn validate(&self) -> crate::Result<()> {
        if let Some(agent) = &self.agent
            && agent.recursion_limit == Some(0)
        {
            return Err(ConfigError::invalid(
                "agent.recursion_limit",
                "must be at least 1",
            ));
        }

        if let Some(limits) = &self.limits {
            if let Some(model) = &limits.model_calls {
                check_limit_pair("limits.model_calls", model.thread_limit, model.run_limit)?;
            }
            if let Some(tools) = &limits.tool_calls {
                check_limit_pair("limits.tool_calls", tools.thread_limit, tools.run_limit)?;
            }
        }

        if let Some(retry) = &self.retry {
            if let Some(model) = &retry.model {
                model.validate("retry.model")?;
            }
            if let Some(tools) = &retry.tools {
                tools.validate("retry.tools")?;
            }
        }

        if let Some(summarization) = &self.summarization {
            summarization.validate()?;
        }

        Ok(())
    }

    /// Effective recursion limit.
    pub fn recursion_limit(&self) -> u32 {
        self.agent
            .as_ref()
            .and_then(|a| a.recursion_limit)
            .unwrap_or(DEFAULT_RECURSION_LIMIT)
    }
}

fn check_limit_pair(section: &str, thread: Option<u32>, run: Option<u32>) -> crate::Result<()> {
    match (thread, run) {
        (None, None) => Err(ConfigError::invalid(
            section,
            "at least one of thread_limit or run_limit must be set",
        )),
        (Some(thread), Some(run)) if run > thread => Err(ConfigError::invalid(
            format!("{section}.run_limit"),
            format!("run_limit ({run}) exceeds thread_limit ({thread})"),
        )),
        _ => Ok(()),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Agent Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Agent defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Agent name used in logs.
    pub name: Option<String>,
    /// System prompt.
    pub system_prompt: Option<String>,
    /// Max steps per run.
    pub recursion_limit: Option<u32>,
    /// Run sibling tool calls concurrently.
    pub parallel_tool_calls: Option<bool>,
}

impl AgentConfig {
    fn merge(&mut self, other: AgentConfig) {
        if other.name.is_some() {
            self.name = other.name;
        }
        if other.system_prompt.is_some() {
            self.system_prompt = other.system_prompt;
        }
        if other.recursion_limit.is_some() {
            self.recursion_limit = other.recursion_limit;
        }
        if other.parallel_tool_calls.is_some() {
            self.parallel_tool_calls = other.parallel_tool_calls;
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Limits Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Call limit sections.
///
/// ```toml
/// [limits.model_calls]
/// thread_limit = 50
/// run_limit = 10
///
/// [limits.tool_calls]
/// run_limit = 20
/// exit_behavior = "end"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub model_calls: Option<ModelCallLimitConfig>,
    pub tool_calls: Option<ToolCallLimitConfig>,
}

impl LimitsConfig {
    fn merge(&mut self, other: LimitsConfig) {
        if other.model_calls.is_some() {
            self.model_calls = other.model_calls;
        }
        if other.tool_calls.is_some() {
            self.tool_calls = other.tool_calls;
        }
    }
}

/// Model call limits. Unset limits are unbounded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelCallLimitConfig {
    /// Calls allowed across every run on a thread.
    pub thread_limit: Option<u32>,
    /// Calls allowed within one run.
    pub run_limit: Option<u32>,
}

/// Tool call limits.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolCallLimitConfig {
    /// Only count calls to this tool. Counts every tool when unset.
    pub tool_name: Option<String>,
    pub thread_limit: Option<u32>,
    pub run_limit: Option<u32>,
    pub exit_behavior: ExitBehavior,
}

/// What happens once a tool call limit is reached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExitBehavior {
    /// Answer further calls with an error message and keep going.
    #[default]
    Continue,
    /// Stop the run with a final message.
    End,
}

// ─────────────────────────────────────────────────────────────────────────────
// Retry Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Retry policies for model and tool calls.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub model: Option<RetryConfig>,
    pub tools: Option<RetryConfig>,
}

impl RetrySection {
    fn merge(&mut self, other: RetrySection) {
        if other.model.is_some() {
            self.model = other.model;
        }
        if other.tools.is_some() {
            self.tools = other.tools;
        }
    }
}

/// Exponential backoff policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    /// Multiplier applied to the delay after each retry.
    pub backoff_factor: f64,
    pub max_delay_ms: u64,
    pub on_failure: OnFailure,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay_ms: 1000,
            backoff_factor: 2.0,
            max_delay_ms: 60_000,
            on_failure: OnFailure::Continue,
        }
    }
}

impl RetryConfig {
    fn validate(&self, section: &str) -> crate::Result<()> {
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err(ConfigError::invalid(
                format!("{section}.backoff_factor"),
                "must be a finite number >= 1.0",
            ));
        }
        if self.initial_delay_ms > self.max_delay_ms {
            return Err(ConfigError::invalid(
                format!("{section}.initial_delay_ms"),
                format!(
                    "initial delay ({}ms) exceeds max delay ({}ms)",
                    self.initial_delay_ms, self.max_delay_ms
                ),
            ));
        }
        Ok(())
    }
}

/// What happens once retries are exhausted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnFailure {
    /// Turn the failure into a message and let the run continue.
    #[default]
    Continue,
    /// Propagate the last error.
    Error,
}

// ─────────────────────────────────────────────────────────────────────────────
// Summarization Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// History summarization thresholds.
///
/// ```toml
/// [summarization]
/// trigger_tokens = 8000
/// keep_messages = 20
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SummarizationConfig {
    /// Summarize when the estimated history size reaches this many tokens.
    pub trigger_tokens: Option<usize>,
    /// Summarize when the history reaches this many messages.
    pub trigger_messages: Option<usize>,
    /// Recent messages kept verbatim after summarizing.
    pub keep_messages: usize,
}

impl Default for SummarizationConfig {
    fn default() -> Self {
        Self {
            trigger_tokens: Some(8000),
            trigger_messages: None,
            keep_messages: 20,
        }
    }
}

impl SummarizationConfig {
    fn validate(&self) -> crate::Result<()> {
        if self.trigger_tokens.is_none() && self.trigger_messages.is_none() {
            return Err(ConfigError::invalid(
                "summarization",
                "at least one of trigger_tokens or trigger_messages must be set",
            ));
        }
        if let Some(trigger) = self.trigger_messages
            && trigger <= self.keep_messages
        {
            return Err(ConfigError::invalid(
                "summarization.trigger_messages",
                format!(
                    "trigger ({trigger}) must exceed keep_messages ({})",
                    self.keep_messages
                ),
            ));
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Checkpoint Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Checkpoint behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Read each checkpoint back after writing and compare.
    pub verify_writes: bool,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            verify_writes: true,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
