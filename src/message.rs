//! The message exchanged over every control connection.
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Destination name that addresses the supervisor itself.
pub const MASTER: &str = "master";

/// Topic of the first message a worker sends after connecting.
pub const HANDSHAKE_TOPIC: &str = "handshake";

/// Topic of replies generated for undeliverable messages.
pub const ERROR_TOPIC: &str = "error";

/// A routed message. `to == "master"` selects a topic handler; any other
/// destination is forwarded verbatim to the node with that name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub topic: String,
    pub to: String,
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub mid: String,
    #[serde(default)]
    pub data: Value,
}

impl Message {
    pub fn new(
        topic: impl Into<String>,
        to: impl Into<String>,
        from: impl Into<String>,
    ) -> Self {
        Self {
            topic: topic.into(),
            to: to.into(),
            from: from.into(),
            mid: String::new(),
            data: Value::Null,
        }
    }

    pub fn with_mid(mut self, mid: impl Into<String>) -> Self {
        self.mid = mid.into();
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    /// Handshake announcing `name` to the supervisor.
    pub fn handshake(name: impl Into<String>) -> Self {
        Message::new(HANDSHAKE_TOPIC, MASTER, name)
    }

    /// Reply sent back to the sender of `original` when its destination is unreachable.
    pub fn unknown_node(original: &Message) -> Self {
        Message::new(ERROR_TOPIC, original.from.clone(), MASTER).with_data(json!({
            "mid": original.mid,
            "value": format!("unknown node {}", original.to),
        }))
    }

    pub fn is_for_master(&self) -> bool {
        self.to == MASTER
    }
}
