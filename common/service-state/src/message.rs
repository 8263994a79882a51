//! Messages exchanged over the signaling channel.
//!
//! On the wire a state update is a single-key object (`{"db": true}`) and a fault
//! is `{"error": "..."}`. The handshake message never crosses a process boundary
//! and is modelled separately as [`InitMessage`](crate::channel::InitMessage).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    /// Failure of the coordinator's update handler, sent back to the worker.
    Fault { error: String },
    /// State update; well-formed updates carry exactly one service.
    Update(Map<String, Value>),
}

impl Message {
    /// Single-key update for `service`.
    pub fn update(service: impl Into<String>, ready: bool) -> Self {
        let mut state = Map::with_capacity(1);
        state.insert(service.into(), Value::Bool(ready));
        Message::Update(state)
    }

    pub fn fault(error: impl ToString) -> Self {
        Message::Fault {
            error: error.to_string(),
        }
    }
}

/// JSON kind of a value, as reported by [`StateError::InvalidType`](crate::StateError::InvalidType).
pub(crate) fn kind_of(value: Option<&Value>) -> &'static str {
    match value {
        None => "undefined",
        Some(Value::Null) => "null",
        Some(Value::Bool(_)) => "boolean",
        Some(Value::Number(_)) => "number",
        Some(Value::String(_)) => "string",
        Some(Value::Array(_)) => "array",
        Some(Value::Object(_)) => "object",
    }
}
