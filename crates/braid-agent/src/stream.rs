//! Streaming runs.
//!
//! [`Agent::stream`](crate::agent::Agent::stream) drives the run on a
//! spawned task and forwards what the loop observes as [`StreamEvent`]s.
//! The last item is always either [`StreamEvent::Done`] or the run's
//! failure.

use std::pin::Pin;
use std::sync::Arc;

use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use braid_llm::AiMessageChunk;

use crate::agent::{Agent, AgentInput, RunConfig, RunOutput};
use crate::error::{AgentError, RunFailure};
use crate::runtime::ChunkSink;
use crate::state::{AgentState, StatePatch};

// ─────────────────────────────────────────────────────────────────────────────
// Events
// ─────────────────────────────────────────────────────────────────────────────

/// What a stream yields while the run progresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamMode {
    /// The full state after each node.
    Values,
    /// Each patch as it is applied, labelled with its source.
    Updates,
    /// AI message chunks as the model produces them.
    Messages,
}

/// One item of a run stream.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Values(AgentState),
    /// `node` is the graph node (`model`, `tools`, `structured_output`) or
    /// `{middleware}.{hook}` for state hooks.
    Update {
        node: String,
        patch: StatePatch,
    },
    MessageChunk(AiMessageChunk),
    Done(RunOutput),
}

/// A stream of run events.
pub type AgentStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, RunFailure>> + Send>>;

// ─────────────────────────────────────────────────────────────────────────────
// Observer
// ─────────────────────────────────────────────────────────────────────────────

/// Forwards loop activity for the selected mode.
#[derive(Clone)]
pub(crate) struct Observer {
    mode: StreamMode,
    tx: mpsc::UnboundedSender<StreamEvent>,
}

impl Observer {
    pub(crate) fn channel(mode: StreamMode) -> (Self, mpsc::UnboundedReceiver<StreamEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { mode, tx }, rx)
    }

    pub(crate) fn values(&self, state: &AgentState) {
        if self.mode == StreamMode::Values {
            let _ = self.tx.send(StreamEvent::Values(state.clone()));
        }
    }

    pub(crate) fn update(&self, node: &str, patch: &StatePatch) {
        if self.mode == StreamMode::Updates {
            let _ = self.tx.send(StreamEvent::Update {
                node: node.to_string(),
                patch: patch.clone(),
            });
        }
    }

    /// Sink for model chunks, present only in [`StreamMode::Messages`].
    pub(crate) fn chunk_sink(&self) -> Option<ChunkSink> {
        if self.mode != StreamMode::Messages {
            return None;
        }
        let tx = self.tx.clone();
        Some(Arc::new(move |chunk: AiMessageChunk| {
            let _ = tx.send(StreamEvent::MessageChunk(chunk));
        }))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Stream construction
// ─────────────────────────────────────────────────────────────────────────────

pub(crate) fn create_run_stream(
    agent: Agent,
    input: AgentInput,
    config: RunConfig,
    mode: StreamMode,
) -> AgentStream {
    let (observer, mut rx) = Observer::channel(mode);
    let handle = tokio::spawn(async move { agent.execute(input, config, Some(observer)).await });

    Box::pin(async_stream::stream! {
        // The channel closes once the run drops its observer.
        while let Some(event) = rx.recv().await {
            yield Ok(event);
        }
        match handle.await {
            Ok(Ok(output)) => yield Ok(StreamEvent::Done(output)),
            Ok(Err(failure)) => yield Err(failure),
            Err(e) => {
                tracing::error!(error = %e, "Run task failed");
                yield Err(RunFailure::new(
                    AgentError::internal(format!("run task failed: {e}")),
                    AgentState::default(),
                ));
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use braid_llm::Message;

    #[test]
    fn test_observer_filters_by_mode() {
        let (observer, mut rx) = Observer::channel(StreamMode::Updates);
        observer.values(&AgentState::default());
        observer.update("model", &StatePatch::new().with_message(Message::ai("hi")));
        assert!(observer.chunk_sink().is_none());
        drop(observer);

        let event = rx.try_recv().unwrap();
        assert!(matches!(event, StreamEvent::Update { ref node, .. } if node == "model"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_chunk_sink_forwards_chunks() {
        let (observer, mut rx) = Observer::channel(StreamMode::Messages);
        let sink = observer.chunk_sink().unwrap();
        sink(AiMessageChunk::text("Hel"));
        sink(AiMessageChunk::text("lo"));

        let mut text = String::new();
        while let Ok(StreamEvent::MessageChunk(chunk)) = rx.try_recv() {
            text.push_str(&chunk.base.content.text());
        }
        assert_eq!(text, "Hello");
    }
}
