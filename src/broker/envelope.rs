use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Correlation key matching every registered subscriber.
pub const WILDCARD: &str = "*";

/// How a subscriber receives messages for the keys it registers on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriberKind {
    /// Fan-out: every listening client gets every message.
    Listen,
    /// Exclusive: one consumer per message, picked round-robin.
    Consume,
}

impl fmt::Display for SubscriberKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Listen => f.write_str("listen"),
            Self::Consume => f.write_str("consume"),
        }
    }
}

/// Delivery metadata travelling with a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Headers {
    pub message_id: String,
    /// Epoch ms at which the current delivery attempt started.
    pub created: u64,
    pub nb_requeues: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Headers {
    pub fn new(message_id: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            created: 0,
            nb_requeues: 0,
            error: None,
        }
    }
}

/// Unit of the queue.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub id: String,
    pub payload: Value,
    pub headers: Headers,
    pub enqueued_at: u64,
}

impl Envelope {
    pub fn new(id: impl Into<String>, payload: Value, headers: Headers, enqueued_at: u64) -> Self {
        Self {
            id: id.into(),
            payload,
            headers,
            enqueued_at,
        }
    }

    pub fn message_id(&self) -> &str {
        &self.headers.message_id
    }
}

/// A message handed to the transport, addressed to `client#node` targets.
///
/// The transport must eventually `ack` or `nack` `headers.message_id` on the
/// channel that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delivery {
    pub channel: String,
    pub addresses: Vec<String>,
    pub payload: Value,
    pub headers: Headers,
    /// Message ids awaiting an ack on the channel, this one included.
    pub unacked: Vec<String>,
}

/// Format the routing address of one client connection.
pub fn address(client: &str, node: &str) -> String {
    format!("{client}#{node}")
}
