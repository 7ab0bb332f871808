//! Per-thread checkpoints.
//!
//! After every node the run loop persists a [`Checkpoint`] for its thread:
//! the state reached, the node to run next, and (when suspended) the
//! pending interrupts plus tool results already produced. Checkpoints are
//! stored as versioned [`Envelope`]s so older payloads can be upgraded on
//! read.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use braid_llm::{DecoderRegistry, Encodable, Envelope, ToolMessage};

use crate::error::{AgentError, Result};
use crate::runtime::Interrupt;
use crate::scheduler::Node;
use crate::state::{AgentState, StatePatch};

// ─────────────────────────────────────────────────────────────────────────────
// Checkpoint
// ─────────────────────────────────────────────────────────────────────────────

/// A tool result produced before the run suspended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingWrite {
    pub message: ToolMessage,
    #[serde(default)]
    pub patch: StatePatch,
}

/// Snapshot of a thread between nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub state: AgentState,
    /// Node to run when the thread continues.
    pub next: Node,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending_interrupts: Vec<Interrupt>,
    /// Completed tool results keyed by tool call id.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub pending_writes: BTreeMap<String, PendingWrite>,
    /// Monotonic per-thread write counter.
    pub step: u64,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(state: AgentState, next: Node) -> Self {
        Self {
            state,
            next,
            pending_interrupts: Vec::new(),
            pending_writes: BTreeMap::new(),
            step: 0,
            created_at: Utc::now(),
        }
    }

    pub fn is_interrupted(&self) -> bool {
        !self.pending_interrupts.is_empty()
    }
}

impl Encodable for Checkpoint {
    const KIND: &'static str = "checkpoint";
    const VERSION: u32 = 1;
}

// ─────────────────────────────────────────────────────────────────────────────
// Store
// ─────────────────────────────────────────────────────────────────────────────

/// Persistence for the latest checkpoint of each thread.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn put(&self, thread_id: &str, checkpoint: &Checkpoint) -> Result<()>;

    async fn get(&self, thread_id: &str) -> Result<Option<Checkpoint>>;
}

pub type SharedCheckpointStore = Arc<dyn CheckpointStore>;

/// In-process store keeping one envelope per thread.
pub struct MemoryCheckpointStore {
    entries: RwLock<HashMap<String, Envelope>>,
    decoders: DecoderRegistry,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        let mut decoders = DecoderRegistry::new();
        decoders.register::<Checkpoint>();
        Self::with_decoders(decoders)
    }

    /// Use a registry carrying upgrades for older checkpoint payloads.
    pub fn with_decoders(decoders: DecoderRegistry) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            decoders,
        }
    }

    /// Store a raw envelope, e.g. one persisted by an older release.
    pub async fn put_envelope(&self, thread_id: impl Into<String>, envelope: Envelope) {
        self.entries.write().await.insert(thread_id.into(), envelope);
    }

    pub async fn threads(&self) -> Vec<String> {
        self.entries.read().await.keys().cloned().collect()
    }
}

impl Default for MemoryCheckpointStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn put(&self, thread_id: &str, checkpoint: &Checkpoint) -> Result<()> {
        let envelope = Envelope::encode(checkpoint)?;
        self.entries
            .write()
            .await
            .insert(thread_id.to_string(), envelope);
        Ok(())
    }

    async fn get(&self, thread_id: &str) -> Result<Option<Checkpoint>> {
        let entries = self.entries.read().await;
        match entries.get(thread_id) {
            Some(envelope) => Ok(Some(self.decoders.decode(envelope)?)),
            None => Ok(None),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Consistency guard
// ─────────────────────────────────────────────────────────────────────────────

fn describe_step(step: Option<u64>) -> String {
    step.map_or_else(|| "none".to_string(), |s| s.to_string())
}

/// Tracks the last checkpoint step a run observed for its thread and
/// refuses to write over a checkpoint it has not seen.
pub(crate) struct CheckpointGuard {
    store: SharedCheckpointStore,
    thread_id: String,
    observed_step: Option<u64>,
    verify_writes: bool,
}

impl CheckpointGuard {
    pub(crate) fn new(store: SharedCheckpointStore, thread_id: &str, verify_writes: bool) -> Self {
        Self {
            store,
            thread_id: thread_id.to_string(),
            observed_step: None,
            verify_writes,
        }
    }

    pub(crate) async fn load(&mut self) -> Result<Option<Checkpoint>> {
        let checkpoint = self.store.get(&self.thread_id).await?;
        self.observed_step = checkpoint.as_ref().map(|c| c.step);
        Ok(checkpoint)
    }

    /// Write `checkpoint` as the next step for this thread.
    pub(crate) async fn save(&mut self, mut checkpoint: Checkpoint) -> Result<()> {
        let stored = self.store.get(&self.thread_id).await?.map(|c| c.step);
        if stored != self.observed_step {
            return Err(AgentError::inconsistent(
                &self.thread_id,
                format!(
                    "stored step {} differs from last observed step {}",
                    describe_step(stored),
                    describe_step(self.observed_step)
                ),
            ));
        }

        checkpoint.step = self.observed_step.map_or(1, |step| step + 1);
        self.store.put(&self.thread_id, &checkpoint).await?;

        if self.verify_writes {
            let read_back = self.store.get(&self.thread_id).await?;
            if read_back.as_ref() != Some(&checkpoint) {
                return Err(AgentError::inconsistent(
                    &self.thread_id,
                    format!("checkpoint read back after writing step {} does not match", checkpoint.step),
                ));
            }
        }

        tracing::debug!(
            thread_id = %self.thread_id,
            step = checkpoint.step,
            next = %checkpoint.next,
            interrupts = checkpoint.pending_interrupts.len(),
            "Saved checkpoint"
        );
        self.observed_step = Some(checkpoint.step);
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
