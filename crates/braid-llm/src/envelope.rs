//! Versioned persistence envelope.
//!
//! Persisted values are wrapped as `{kind, version, payload}`. Decoding goes
//! through a [`DecoderRegistry`] the caller builds and passes in; it knows
//! which kinds are accepted, their current version, and how to upgrade
//! payloads written by older versions.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::content::ContentBlock;
use crate::message::Message;

/// Errors raised while encoding or decoding envelopes.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// The registry does not accept this kind.
    #[error("unknown envelope kind '{0}'")]
    UnknownKind(String),

    /// The envelope holds a different kind than requested.
    #[error("expected envelope kind '{expected}', found '{found}'")]
    KindMismatch { expected: String, found: String },

    /// Written by a newer version than this registry supports.
    #[error("'{kind}' version {version} is newer than supported version {supported}")]
    UnsupportedVersion {
        kind: String,
        version: u32,
        supported: u32,
    },

    /// No upgrade is registered from an older version.
    #[error("no upgrade registered for '{kind}' from version {from}")]
    MissingUpgrade { kind: String, from: u32 },

    /// An upgrade function rejected the payload.
    #[error("upgrade of '{kind}' from version {from} failed: {reason}")]
    UpgradeFailed {
        kind: String,
        from: u32,
        reason: String,
    },

    /// The payload does not match the type.
    #[error("invalid payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// A value that can be persisted inside an [`Envelope`].
pub trait Encodable: Serialize + DeserializeOwned {
    /// Discriminant written to `kind`.
    const KIND: &'static str;
    /// Current payload version.
    const VERSION: u32;
}

impl Encodable for Message {
    const KIND: &'static str = "message";
    const VERSION: u32 = 1;
}

impl Encodable for Vec<Message> {
    const KIND: &'static str = "messages";
    const VERSION: u32 = 1;
}

impl Encodable for ContentBlock {
    const KIND: &'static str = "content_block";
    const VERSION: u32 = 1;
}

/// Serialized form of a persisted value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub kind: String,
    pub version: u32,
    pub payload: Value,
}

impl Envelope {
    /// Wrap a value at its current version.
    pub fn encode<T: Encodable>(value: &T) -> Result<Self, EnvelopeError> {
        Ok(Self {
            kind: T::KIND.to_string(),
            version: T::VERSION,
            payload: serde_json::to_value(value)?,
        })
    }
}

/// Upgrades a payload from one version to the next.
pub type UpgradeFn = Arc<dyn Fn(Value) -> Result<Value, String> + Send + Sync>;

#[derive(Clone)]
struct KindEntry {
    current: u32,
    upgrades: BTreeMap<u32, UpgradeFn>,
}

/// Built-in kinds, decoded without naming a target type.
#[derive(Debug, Clone, PartialEq)]
pub enum Persisted {
    Message(Message),
    Messages(Vec<Message>),
    ContentBlock(ContentBlock),
}

/// The set of envelope kinds a decoder accepts.
#[derive(Clone, Default)]
pub struct DecoderRegistry {
    kinds: HashMap<String, KindEntry>,
}

impl DecoderRegistry {
    /// An empty registry; it accepts nothing until kinds are registered.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry accepting the message and content block kinds.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry
            .register::<Message>()
            .register::<Vec<Message>>()
            .register::<ContentBlock>();
        registry
    }

    /// Accept `T` at its current version.
    pub fn register<T: Encodable>(&mut self) -> &mut Self {
        self.kinds
            .entry(T::KIND.to_string())
            .or_insert_with(|| KindEntry {
                current: T::VERSION,
                upgrades: BTreeMap::new(),
            })
            .current = T::VERSION;
        self
    }

    /// Register an upgrade of `kind` payloads from `from` to `from + 1`.
    pub fn register_upgrade<F>(&mut self, kind: &str, from: u32, upgrade: F) -> &mut Self
    where
        F: Fn(Value) -> Result<Value, String> + Send + Sync + 'static,
    {
        if let Some(entry) = self.kinds.get_mut(kind) {
            entry.upgrades.insert(from, Arc::new(upgrade));
        }
        self
    }

    pub fn accepts(&self, kind: &str) -> bool {
        self.kinds.contains_key(kind)
    }

    /// Decode an envelope into `T`, applying registered upgrades in order.
    pub fn decode<T: Encodable>(&self, envelope: &Envelope) -> Result<T, EnvelopeError> {
        if envelope.kind != T::KIND {
            return Err(EnvelopeError::KindMismatch {
                expected: T::KIND.to_string(),
                found: envelope.kind.clone(),
            });
        }
        let payload = self.upgraded_payload(envelope)?;
        Ok(serde_json::from_value(payload)?)
    }

    /// Decode one of the built-in kinds.
    pub fn decode_persisted(&self, envelope: &Envelope) -> Result<Persisted, EnvelopeError> {
        match envelope.kind.as_str() {
            <Message as Encodable>::KIND => self.decode(envelope).map(Persisted::Message),
            <Vec<Message> as Encodable>::KIND => self.decode(envelope).map(Persisted::Messages),
            <ContentBlock as Encodable>::KIND => {
                self.decode(envelope).map(Persisted::ContentBlock)
            }
            other => Err(EnvelopeError::UnknownKind(other.to_string())),
        }
    }

    fn upgraded_payload(&self, envelope: &Envelope) -> Result<Value, EnvelopeError> {
        let entry = self
            .kinds
            .get(&envelope.kind)
            .ok_or_else(|| EnvelopeError::UnknownKind(envelope.kind.clone()))?;
        if envelope.version > entry.current {
            return Err(EnvelopeError::UnsupportedVersion {
                kind: envelope.kind.clone(),
                version: envelope.version,
                supported: entry.current,
            });
        }

        let mut payload = envelope.payload.clone();
        for from in envelope.version..entry.current {
            let upgrade = entry
                .upgrades
                .get(&from)
                .ok_or_else(|| EnvelopeError::MissingUpgrade {
                    kind: envelope.kind.clone(),
                    from,
                })?;
            payload = upgrade(payload).map_err(|reason| EnvelopeError::UpgradeFailed {
                kind: envelope.kind.clone(),
                from,
                reason,
            })?;
        }
        Ok(payload)
    }
}

impl std::fmt::Debug for DecoderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<(&String, u32)> =
            self.kinds.iter().map(|(k, e)| (k, e.current)).collect();
        kinds.sort();
        f.debug_struct("DecoderRegistry").field("kinds", &kinds).finish()
    }
}
