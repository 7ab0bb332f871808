//! Agent state, partial updates and field reducers.
//!
//! The run loop is the only writer of [`AgentState`]. Hooks and wrap layers
//! return [`StatePatch`] values which are applied serially: messages go
//! through the identity-reconciling [`add_messages`] reducer, other fields
//! through the reducer declared in the merged [`StateSchema`].

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use braid_llm::{AiMessage, Encodable, Message, deep_merge};

use crate::error::{AgentError, Result};

// ─────────────────────────────────────────────────────────────────────────────
// Agent State
// ─────────────────────────────────────────────────────────────────────────────

/// A key that is present deserializes to `Some`, even when it holds `null`.
/// An absent key falls back to the field default.
mod present_value {
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<Option<Value>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Value::deserialize(deserializer).map(Some)
    }
}

/// The record threaded through a run.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AgentState {
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(
        default,
        deserialize_with = "present_value::deserialize",
        skip_serializing_if = "Option::is_none"
    )]
    pub structured_response: Option<Value>,
    /// Fields owned by middleware, keyed by name.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl AgentState {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            ..Default::default()
        }
    }

    /// Read a middleware-owned field.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.extra.get(key)
    }

    /// The most recent message, if it is an AI message.
    pub fn last_ai(&self) -> Option<&AiMessage> {
        self.messages.last().and_then(Message::as_ai)
    }

    /// The most recent AI message anywhere in history.
    pub fn latest_ai(&self) -> Option<&AiMessage> {
        self.messages.iter().rev().find_map(Message::as_ai)
    }

    /// Apply a patch using the reducers declared in `schema`.
    pub fn apply(&mut self, patch: &StatePatch, schema: &StateSchema) -> Result<()> {
        add_messages(&mut self.messages, &patch.messages);

        if let Some(value) = &patch.structured_response {
            self.structured_response = Some(value.clone());
        }

        for (key, update) in &patch.fields {
            if key == "messages" || key == "structured_response" {
                return Err(AgentError::state(format!(
                    "'{key}' is reserved and cannot be patched as a field"
                )));
            }
            let reduced = schema.reducer_for(key).apply(key, self.extra.get(key), update)?;
            self.extra.insert(key.clone(), reduced);
        }
        Ok(())
    }

    /// Fill in schema defaults for fields that are not yet present.
    pub fn init_defaults(&mut self, schema: &StateSchema) {
        for field in &schema.fields {
            if let Some(default) = &field.default {
                self.extra
                    .entry(field.name.clone())
                    .or_insert_with(|| default.clone());
            }
        }
    }
}

impl Encodable for AgentState {
    const KIND: &'static str = "agent_state";
    const VERSION: u32 = 1;
}

// ─────────────────────────────────────────────────────────────────────────────
// Patches
// ─────────────────────────────────────────────────────────────────────────────

/// One change to the message list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "value", rename_all = "snake_case")]
pub enum MessageUpdate {
    /// Append, or replace the message with the same id.
    Upsert(Message),
    /// Delete the message with this id.
    Remove(String),
    /// Delete every message.
    RemoveAll,
}

/// Where the run loop goes next, overriding normal routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JumpTo {
    Model,
    Tools,
    End,
}

/// A partial state update.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StatePatch {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<MessageUpdate>,
    #[serde(
        default,
        deserialize_with = "present_value::deserialize",
        skip_serializing_if = "Option::is_none"
    )]
    pub structured_response: Option<Value>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub fields: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jump_to: Option<JumpTo>,
}

impl StatePatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self == &StatePatch::default()
    }

    pub fn with_message(mut self, message: impl Into<Message>) -> Self {
        self.messages.push(MessageUpdate::Upsert(message.into()));
        self
    }

    pub fn with_messages(mut self, messages: impl IntoIterator<Item = Message>) -> Self {
        self.messages
            .extend(messages.into_iter().map(MessageUpdate::Upsert));
        self
    }

    pub fn remove_message(mut self, id: impl Into<String>) -> Self {
        self.messages.push(MessageUpdate::Remove(id.into()));
        self
    }

    pub fn remove_all_messages(mut self) -> Self {
        self.messages.push(MessageUpdate::RemoveAll);
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    pub fn with_structured_response(mut self, value: Value) -> Self {
        self.structured_response = Some(value);
        self
    }

    pub fn with_jump_to(mut self, jump: JumpTo) -> Self {
        self.jump_to = Some(jump);
        self
    }
}

/// Append-with-identity-reconciliation reducer for the message list.
///
/// Messages without an id are assigned a fresh uuid. An upsert whose id is
/// already present replaces that message in place.
pub fn add_messages(messages: &mut Vec<Message>, updates: &[MessageUpdate]) {
    for update in updates {
        match update {
            MessageUpdate::Upsert(message) => {
                let message = match message.id() {
                    Some(_) => message.clone(),
                    None => message.clone().with_id(uuid::Uuid::new_v4().to_string()),
                };
                match messages.iter().position(|m| m.id() == message.id()) {
                    Some(index) => messages[index] = message,
                    None => messages.push(message),
                }
            }
            MessageUpdate::Remove(id) => {
                let before = messages.len();
                messages.retain(|m| m.id() != Some(id.as_str()));
                if messages.len() == before {
                    tracing::debug!(message_id = %id, "Remove for unknown message id ignored");
                }
            }
            MessageUpdate::RemoveAll => messages.clear(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Reducers and Schema
// ─────────────────────────────────────────────────────────────────────────────

/// Combines a field's current value with an update.
pub type ReduceFn = Arc<dyn Fn(Option<&Value>, &Value) -> Result<Value> + Send + Sync>;

/// How updates to a state field are combined.
#[derive(Clone, Default)]
pub enum Reducer {
    /// The update replaces the current value.
    #[default]
    LastWriteWins,
    /// Arrays are concatenated; a scalar update is pushed.
    Append,
    /// Numbers are added.
    Sum,
    /// Objects are merged recursively, the update winning on conflicts.
    DeepMerge,
    Custom(ReduceFn),
}

impl Reducer {
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(Option<&Value>, &Value) -> Result<Value> + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(f))
    }

    /// Reduce `update` into `current` for the field `key`.
    pub fn apply(&self, key: &str, current: Option<&Value>, update: &Value) -> Result<Value> {
        match self {
            Reducer::LastWriteWins => Ok(update.clone()),
            Reducer::Append => {
                let mut items = match current {
                    None | Some(Value::Null) => Vec::new(),
                    Some(Value::Array(items)) => items.clone(),
                    Some(other) => {
                        return Err(AgentError::state(format!(
                            "cannot append to non-array field '{key}': {other}"
                        )));
                    }
                };
                match update {
                    Value::Array(more) => items.extend(more.iter().cloned()),
                    single => items.push(single.clone()),
                }
                Ok(Value::Array(items))
            }
            Reducer::Sum => {
                let current = current.cloned().unwrap_or(Value::from(0));
                match (current.as_i64(), update.as_i64()) {
                    (Some(a), Some(b)) => a.checked_add(b).map(Value::from).ok_or_else(|| {
                        AgentError::state(format!("sum overflows field '{key}'"))
                    }),
                    _ => match (current.as_f64(), update.as_f64()) {
                        (Some(a), Some(b)) => Ok(Value::from(a + b)),
                        _ => Err(AgentError::state(format!(
                            "cannot sum non-numeric field '{key}'"
                        ))),
                    },
                }
            }
            Reducer::DeepMerge => match (current, update) {
                (Some(Value::Object(current)), Value::Object(update)) => {
                    Ok(Value::Object(deep_merge(current, update)))
                }
                _ => Ok(update.clone()),
            },
            Reducer::Custom(f) => f(current, update),
        }
    }
}

impl std::fmt::Debug for Reducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Reducer::LastWriteWins => write!(f, "LastWriteWins"),
            Reducer::Append => write!(f, "Append"),
            Reducer::Sum => write!(f, "Sum"),
            Reducer::DeepMerge => write!(f, "DeepMerge"),
            Reducer::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// Declaration of one state field.
#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub name: String,
    pub reducer: Reducer,
    pub default: Option<Value>,
}

/// Extra state fields a middleware contributes.
#[derive(Debug, Clone, Default)]
pub struct StateSchema {
    pub fields: Vec<FieldSpec>,
}

impl StateSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a field.
    pub fn field(mut self, name: impl Into<String>, reducer: Reducer) -> Self {
        self.fields.push(FieldSpec {
            name: name.into(),
            reducer,
            default: None,
        });
        self
    }

    /// Declare a field with an initial value.
    pub fn field_with_default(
        mut self,
        name: impl Into<String>,
        reducer: Reducer,
        default: Value,
    ) -> Self {
        self.fields.push(FieldSpec {
            name: name.into(),
            reducer,
            default: Some(default),
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// The reducer for `name`; undeclared fields are last-write-wins.
    pub fn reducer_for(&self, name: &str) -> Reducer {
        self.fields
            .iter()
            .rev()
            .find(|f| f.name == name)
            .map(|f| f.reducer.clone())
            .unwrap_or_default()
    }

    /// Merge schemas from several owners, rejecting a field declared twice.
    pub fn merged<'a>(
        schemas: impl IntoIterator<Item = (&'a str, StateSchema)>,
    ) -> Result<StateSchema> {
        let mut owners: HashMap<String, String> = HashMap::new();
        let mut merged = StateSchema::new();
        for (owner, schema) in schemas {
            for field in schema.fields {
                if let Some(previous) = owners.insert(field.name.clone(), owner.to_string()) {
                    return Err(AgentError::Config(format!(
                        "state field '{}' is declared by both '{previous}' and '{owner}'",
                        field.name
                    )));
                }
                merged.fields.push(field);
            }
        }
        Ok(merged)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_add_messages_assigns_ids() {
        let mut messages = Vec::new();
        add_messages(
            &mut messages,
            &[MessageUpdate::Upsert(Message::human("hi"))],
        );
        assert_eq!(messages.len(), 1);
        assert!(messages[0].id().is_some());
    }

    #[test]
    fn test_add_messages_replaces_by_id() {
        let mut messages = vec![
            Message::human("first").with_id("a"),
            Message::ai("draft").with_id("b"),
        ];
        add_messages(
            &mut messages,
            &[MessageUpdate::Upsert(Message::ai("final").with_id("b"))],
        );
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].text(), "final");
    }

    #[test]
    fn test_add_messages_remove_and_remove_all() {
        let mut messages = vec![
            Message::human("a").with_id("1"),
            Message::human("b").with_id("2"),
        ];
        add_messages(&mut messages, &[MessageUpdate::Remove("1".to_string())]);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id(), Some("2"));

        add_messages(
            &mut messages,
            &[
                MessageUpdate::RemoveAll,
                MessageUpdate::Upsert(Message::system("summary").with_id("s")),
            ],
        );
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id(), Some("s"));
    }

    #[test]
    fn test_apply_uses_declared_reducers() {
        let schema = StateSchema::new()
            .field("count", Reducer::Sum)
            .field("log", Reducer::Append)
            .field("meta", Reducer::DeepMerge);
        let mut state = AgentState::default();

        for _ in 0..2 {
            let patch = StatePatch::new()
                .with_field("count", json!(2))
                .with_field("log", json!("step"))
                .with_field("meta", json!({"a": {"x": 1}}))
                .with_field("plain", json!("first"));
            state.apply(&patch, &schema).unwrap();
        }
        state
            .apply(
                &StatePatch::new()
                    .with_field("meta", json!({"a": {"y": 2}}))
                    .with_field("plain", json!("second")),
                &schema,
            )
            .unwrap();

        assert_eq!(state.get("count"), Some(&json!(4)));
        assert_eq!(state.get("log"), Some(&json!(["step", "step"])));
        assert_eq!(state.get("meta"), Some(&json!({"a": {"x": 1, "y": 2}})));
        assert_eq!(state.get("plain"), Some(&json!("second")));
    }

    #[test]
    fn test_apply_rejects_reserved_fields() {
        let mut state = AgentState::default();
        let patch = StatePatch::new().with_field("messages", json!([]));
        assert!(state.apply(&patch, &StateSchema::new()).is_err());
    }

    #[test]
    fn test_custom_reducer() {
        let reducer = Reducer::custom(|current, update| {
            let current = current.and_then(Value::as_i64).unwrap_or(0);
            Ok(json!(current.max(update.as_i64().unwrap_or(0))))
        });
        assert_eq!(
            reducer.apply("peak", Some(&json!(5)), &json!(3)).unwrap(),
            json!(5)
        );
    }

    #[test]
    fn test_sum_rejects_non_numbers() {
        assert!(Reducer::Sum.apply("n", Some(&json!("x")), &json!(1)).is_err());
    }

    #[test]
    fn test_schema_merge_rejects_duplicates() {
        let a = StateSchema::new().field("shared", Reducer::Sum);
        let b = StateSchema::new().field("shared", Reducer::Append);
        let err = StateSchema::merged([("a", a), ("b", b)]).unwrap_err();
        assert!(err.to_string().contains("'a' and 'b'"));
    }

    #[test]
    fn test_init_defaults() {
        let schema = StateSchema::new().field_with_default("todo", Reducer::Append, json!([]));
        let mut state = AgentState::default();
        state.init_defaults(&schema);
        assert_eq!(state.get("todo"), Some(&json!([])));
    }

    #[test]
    fn test_state_serde_flattens_extra() {
        let mut state = AgentState::new(vec![Message::human("hi").with_id("1")]);
        state.extra.insert("counter".to_string(), json!(3));

        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["counter"], json!(3));
        let back: AgentState = serde_json::from_value(json).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn test_null_structured_response_survives_serde() {
        let mut state = AgentState::new(vec![Message::human("hi").with_id("1")]);
        state.structured_response = Some(Value::Null);

        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["structured_response"], Value::Null);
        let back: AgentState = serde_json::from_value(json).unwrap();
        assert_eq!(back.structured_response, Some(Value::Null));
        assert_eq!(back, state);

        let unset: AgentState = serde_json::from_value(json!({"messages": []})).unwrap();
        assert_eq!(unset.structured_response, None);
        assert!(!unset.extra.contains_key("structured_response"));

        let patch = StatePatch::new().with_structured_response(Value::Null);
        let back: StatePatch = serde_json::from_value(serde_json::to_value(&patch).unwrap()).unwrap();
        assert_eq!(back, patch);
    }

    #[test]
    fn test_sum_overflow_is_an_error() {
        let err = Reducer::Sum
            .apply("n", Some(&json!(i64::MAX)), &json!(1))
            .unwrap_err();
        assert!(err.to_string().contains("'n'"));
    }
}
