//! Retries with exponential backoff for model and tool calls.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use braid_config::{OnFailure, RetryConfig};
use braid_llm::{AiMessage, ToolMessage};
use tokio_util::sync::CancellationToken;

use super::{Middleware, ModelNext, ModelRequest, ModelResponse, ToolCallRequest, ToolCallResponse, ToolNext};
use crate::error::{AgentError, Result};

/// Decides whether an error is worth another attempt.
pub type RetryPredicate = Arc<dyn Fn(&AgentError) -> bool + Send + Sync>;

// ─────────────────────────────────────────────────────────────────────────────
// Policy
// ─────────────────────────────────────────────────────────────────────────────

/// Backoff schedule and give-up behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempts after the first one.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub backoff_factor: f64,
    pub max_delay: Duration,
    pub on_failure: OnFailure,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            backoff_factor: config.backoff_factor,
            max_delay: Duration::from_millis(config.max_delay_ms),
            on_failure: config.on_failure,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_on_failure(mut self, on_failure: OnFailure) -> Self {
        self.on_failure = on_failure;
        self
    }

    /// Delay before retry number `retry` (zero-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = self.backoff_factor.powi(retry as i32);
        let millis = self.initial_delay.as_millis() as f64 * factor;
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// Delay for `error`, honoring a provider's retry-after hint.
    fn delay_after(&self, retry: u32, error: &AgentError) -> Duration {
        let hinted = match error {
            AgentError::Llm(llm) => llm.retry_after(),
            _ => None,
        };
        match hinted {
            Some(hint) => hint.min(self.max_delay),
            None => self.delay_for(retry),
        }
    }
}

async fn backoff(delay: Duration, cancel: &CancellationToken) -> Result<()> {
    tokio::select! {
        _ = tokio::time::sleep(delay) => Ok(()),
        _ = cancel.cancelled() => Err(AgentError::Cancelled),
    }
}

/// Run `attempt` until it succeeds, is not retryable, or the budget runs out.
///
/// Returns the final error together with the number of attempts made.
async fn with_retries<T, F, Fut>(
    policy: &RetryPolicy,
    retry_on: &RetryPredicate,
    cancel: &CancellationToken,
    label: &str,
    mut attempt: F,
) -> std::result::Result<T, (AgentError, u32)>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempts = 0;
    loop {
        attempts += 1;
        let error = match attempt().await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };
        if error.is_cancelled() || error.is_interrupt() || !retry_on(&error) {
            return Err((error, 0));
        }
        if attempts > policy.max_retries {
            return Err((error, attempts));
        }

        let delay = policy.delay_after(attempts - 1, &error);
        tracing::warn!(
            %label,
            attempt = attempts,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Retrying after failure"
        );
        if let Err(cancelled) = backoff(delay, cancel).await {
            return Err((cancelled, 0));
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Model Retry
// ─────────────────────────────────────────────────────────────────────────────

/// Retries failed model calls.
///
/// By default only errors the model reports as retryable (network failures
/// and rate limits) are retried.
pub struct ModelRetryMiddleware {
    policy: RetryPolicy,
    retry_on: RetryPredicate,
}

impl ModelRetryMiddleware {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            retry_on: Arc::new(|error: &AgentError| matches!(error, AgentError::Llm(e) if e.is_retryable())),
        }
    }

    pub fn with_retry_on<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&AgentError) -> bool + Send + Sync + 'static,
    {
        self.retry_on = Arc::new(predicate);
        self
    }
}

#[async_trait]
impl Middleware for ModelRetryMiddleware {
    fn name(&self) -> &str {
        "model_retry"
    }

    async fn wrap_model_call(
        &self,
        request: ModelRequest,
        next: ModelNext,
    ) -> Result<ModelResponse> {
        let cancel = request.runtime.cancellation.clone();
        let label = request.model.name().to_string();
        let outcome = with_retries(&self.policy, &self.retry_on, &cancel, &label, || {
            next.run(request.clone())
        })
        .await;

        match outcome {
            Ok(response) => Ok(response),
            Err((error, 0)) => Err(error),
            Err((error, attempts)) => match self.policy.on_failure {
                OnFailure::Error => Err(AgentError::RetryExhausted {
                    attempts,
                    source: Box::new(error),
                }),
                OnFailure::Continue => Ok(ModelResponse::new(AiMessage::new(format!(
                    "Model call failed after {attempts} attempt(s): {error}"
                )))),
            },
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tool Retry
// ─────────────────────────────────────────────────────────────────────────────

/// Retries failed tool calls.
///
/// By default tool execution errors are retried; argument validation
/// failures are not, since the same arguments would fail again.
pub struct ToolRetryMiddleware {
    policy: RetryPolicy,
    retry_on: RetryPredicate,
    tools: Option<Vec<String>>,
}

impl ToolRetryMiddleware {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            retry_on: Arc::new(|error: &AgentError| matches!(error, AgentError::Tool(_))),
            tools: None,
        }
    }

    /// Only retry the named tools.
    pub fn for_tools(mut self, tools: Vec<String>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn with_retry_on<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&AgentError) -> bool + Send + Sync + 'static,
    {
        self.retry_on = Arc::new(predicate);
        self
    }
}

#[async_trait]
impl Middleware for ToolRetryMiddleware {
    fn name(&self) -> &str {
        "tool_retry"
    }

    async fn wrap_tool_call(
        &self,
        request: ToolCallRequest,
        next: ToolNext,
    ) -> Result<ToolCallResponse> {
        let covered = self
            .tools
            .as_ref()
            .is_none_or(|tools| tools.iter().any(|t| t == request.tool_name()));
        if !covered {
            return next.run(request).await;
        }

        let cancel = request.runtime.cancellation.clone();
        let call_id = request.tool_call.id.clone();
        let tool_name = request.tool_call.name.clone();
        let outcome = with_retries(&self.policy, &self.retry_on, &cancel, &tool_name, || {
            next.run(request.clone())
        })
        .await;

        match outcome {
            Ok(response) => Ok(response),
            Err((error, 0)) => Err(error),
            Err((error, attempts)) => match self.policy.on_failure {
                OnFailure::Error => Err(AgentError::RetryExhausted {
                    attempts,
                    source: Box::new(error),
                }),
                OnFailure::Continue => Ok(ToolCallResponse::new(
                    ToolMessage::error(
                        call_id,
                        format!("Tool '{tool_name}' failed after {attempts} attempt(s): {error}"),
                    )
                    .with_name(tool_name.clone()),
                )),
            },
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
