//! Message identity and envelope types shared across the protocol layer.
//!
//! [`MessageId`] is the JSON-RPC request/response identifier (string, number,
//! or absent); [`types::RequestId`](crate::types::RequestId) is a type alias
//! for it used by the wire types. [`Message`] is a minimal internal envelope
//! used where code needs to reason about "a JSON-RPC request or notification"
//! without committing to the full [`crate::jsonrpc`] types.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A JSON-RPC message identifier.
///
/// Per JSON-RPC 2.0, an id is a string, a number, or (for notifications and
/// the special parse-error response) absent entirely.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageId {
    /// A string identifier.
    String(String),
    /// A numeric identifier.
    Number(i64),
}

impl MessageId {
    /// Returns the identifier rendered as a string, regardless of variant.
    #[must_use]
    pub fn as_display(&self) -> String {
        match self {
            Self::String(s) => s.clone(),
            Self::Number(n) => n.to_string(),
        }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => write!(f, "{s}"),
            Self::Number(n) => write!(f, "{n}"),
        }
    }
}

impl From<String> for MessageId {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<&str> for MessageId {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<i64> for MessageId {
    fn from(value: i64) -> Self {
        Self::Number(value)
    }
}

impl From<u64> for MessageId {
    fn from(value: u64) -> Self {
        Self::Number(value as i64)
    }
}

/// Direction-agnostic metadata attached to a message as it moves through the
/// engine (received-at timestamp, transport origin, correlation id).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageMetadata {
    /// Arbitrary key/value metadata (header-like).
    pub fields: HashMap<String, String>,
}

impl MessageMetadata {
    /// Creates empty metadata.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a key/value pair, returning `self` for chaining.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }
}

/// A minimal, method-agnostic view of a JSON-RPC message: either a request
/// (has an id, wants a response) or a notification (no id, fire-and-forget).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// The identifier, if this message expects a response.
    pub id: Option<MessageId>,
    /// The JSON-RPC method name.
    pub method: String,
    /// The method parameters, if any.
    pub params: Option<Value>,
    /// Metadata describing how/where this message arrived.
    #[serde(skip)]
    pub metadata: MessageMetadata,
}

impl Message {
    /// Returns true if this message expects a response.
    #[must_use]
    pub fn is_request(&self) -> bool {
        self.id.is_some()
    }

    /// Returns true if this message is a fire-and-forget notification.
    #[must_use]
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}
