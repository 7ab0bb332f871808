//! Per-run context shared by hooks, wrap layers and tools.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use braid_llm::AiMessageChunk;

use crate::error::{AgentError, Result};

/// A request for outside input raised during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interrupt {
    /// Stable id; the resume value for this interrupt is keyed by it.
    pub id: String,
    pub value: Value,
}

impl Interrupt {
    pub fn new(id: impl Into<String>, value: Value) -> Self {
        Self {
            id: id.into(),
            value,
        }
    }
}

/// Receives model chunks as they stream in.
pub(crate) type ChunkSink = Arc<dyn Fn(AiMessageChunk) + Send + Sync>;

/// Identity, cancellation and caller context for one run.
#[derive(Clone)]
pub struct RunContext {
    pub thread_id: String,
    pub run_id: Uuid,
    /// One token for the whole run.
    pub cancellation: CancellationToken,
    /// Read-only values supplied by the caller.
    pub context: Arc<Map<String, Value>>,
    resume: Arc<HashMap<String, Value>>,
    chunk_sink: Option<ChunkSink>,
}

impl RunContext {
    pub fn new(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            run_id: Uuid::new_v4(),
            cancellation: CancellationToken::new(),
            context: Arc::new(Map::new()),
            resume: Arc::new(HashMap::new()),
            chunk_sink: None,
        }
    }

    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = cancellation;
        self
    }

    pub fn with_context(mut self, context: Map<String, Value>) -> Self {
        self.context = Arc::new(context);
        self
    }

    pub fn with_resume(mut self, resume: HashMap<String, Value>) -> Self {
        self.resume = Arc::new(resume);
        self
    }

    pub(crate) fn with_chunk_sink(mut self, sink: ChunkSink) -> Self {
        self.chunk_sink = Some(sink);
        self
    }

    /// Where streamed model chunks go, when the caller asked for them.
    pub(crate) fn chunk_sink(&self) -> Option<&ChunkSink> {
        self.chunk_sink.as_ref()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Fail with [`AgentError::Cancelled`] once the run is cancelled.
    pub fn check_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(AgentError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn resume_value(&self, id: &str) -> Option<&Value> {
        self.resume.get(id)
    }

    /// Ask the caller for input.
    ///
    /// Returns the resume value when the caller already supplied one for
    /// `id`; otherwise suspends the run by raising
    /// [`AgentError::Interrupted`].
    pub fn interrupt(&self, id: impl Into<String>, payload: Value) -> Result<Value> {
        let id = id.into();
        match self.resume.get(&id) {
            Some(value) => Ok(value.clone()),
            None => Err(AgentError::Interrupted(vec![Interrupt::new(id, payload)])),
        }
    }
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("thread_id", &self.thread_id)
            .field("run_id", &self.run_id)
            .field("cancelled", &self.is_cancelled())
            .field("resume", &self.resume.keys().collect::<Vec<_>>())
            .field("streaming", &self.chunk_sink.is_some())
            .finish()
    }
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new(Uuid::new_v4().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_interrupt_without_resume_raises() {
        let ctx = RunContext::new("t1");
        match ctx.interrupt("call_1", json!({"tool": "delete"})) {
            Err(AgentError::Interrupted(interrupts)) => {
                assert_eq!(interrupts, vec![Interrupt::new("call_1", json!({"tool": "delete"}))]);
            }
            other => panic!("expected interrupt, got {other:?}"),
        }
    }

    #[test]
    fn test_interrupt_with_resume_returns_value() {
        let ctx = RunContext::new("t1").with_resume(HashMap::from([(
            "call_1".to_string(),
            json!({"type": "approve"}),
        )]));
        assert_eq!(
            ctx.interrupt("call_1", json!(null)).unwrap(),
            json!({"type": "approve"})
        );
        assert!(ctx.interrupt("call_2", json!(null)).is_err());
    }

    #[test]
    fn test_check_cancelled() {
        let ctx = RunContext::new("t1");
        assert!(ctx.check_cancelled().is_ok());
        ctx.cancellation.cancel();
        assert!(matches!(ctx.check_cancelled(), Err(AgentError::Cancelled)));
    }
}
