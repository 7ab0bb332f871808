//! Node identities and the seam that executes them.
//!
//! The run loop decides which node runs next; a [`Scheduler`] decides how a
//! node's work is driven. [`InlineScheduler`] simply awaits it inside a
//! tracing span.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::Instrument;

use crate::error::Result;

/// A step of the agent graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Node {
    /// Call the model.
    Model,
    /// Execute the tool calls of the latest AI message.
    Tools,
    /// Ask the model for the configured structured response.
    StructuredOutput,
    /// Terminal.
    End,
}

impl Node {
    pub fn as_str(&self) -> &'static str {
        match self {
            Node::Model => "model",
            Node::Tools => "tools",
            Node::StructuredOutput => "structured_output",
            Node::End => "end",
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Drives one node's work to completion and returns the node to run next.
#[async_trait]
pub trait Scheduler: Send + Sync {
    async fn run_node<'a>(&self, node: Node, task: BoxFuture<'a, Result<Node>>) -> Result<Node>;
}

pub type SharedScheduler = Arc<dyn Scheduler>;

/// Runs every node on the caller's task.
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineScheduler;

#[async_trait]
impl Scheduler for InlineScheduler {
    async fn run_node<'a>(&self, node: Node, task: BoxFuture<'a, Result<Node>>) -> Result<Node> {
        let span = match node {
            Node::Model => tracing::info_span!("model_call"),
            Node::Tools => tracing::info_span!("tool_call"),
            Node::StructuredOutput => tracing::info_span!("structured_output"),
            Node::End => tracing::info_span!("end"),
        };
        task.instrument(span).await
    }
}
