//! Error types for the protocol engine, Streamable HTTP transport and task store.
//!
//! `McpError`/`ErrorKind` (re-exported from [`turbomcp_protocol`]) remain the
//! single currency for anything that crosses the JSON-RPC wire. [`ServerError`]
//! covers failures that are local to connection/session lifecycle management
//! and never themselves get serialized - they are converted to `McpError`
//! before being sent to a peer.

use std::time::Duration;

pub use turbomcp_protocol::{ErrorKind, McpError, McpResult};

/// Result alias used throughout the engine, transport and task store.
pub type ServerResult<T> = Result<T, McpError>;

/// Errors raised by connection state, transport and timeout machinery.
///
/// These are distinct from [`McpError`] because they describe failures in
/// the engine's own bookkeeping (state machine violations, transport I/O)
/// rather than failures of a particular JSON-RPC request. A [`From<ServerError>
/// for McpError`] conversion is provided so any `ServerError` can still be
/// reported back to a peer as a normal JSON-RPC error response.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// `connect()` was called on an engine that is already connected.
    #[error("engine is already connected")]
    AlreadyConnected,

    /// An operation that requires a connection was attempted before `connect()`.
    #[error("engine is not connected")]
    NotConnected,

    /// `set_request_handler`/`set_notification_handler` was called after `connect()`.
    #[error("handlers cannot be registered after connect()")]
    RegistrationAfterConnect,

    /// A server-originated request or notification requires a capability the
    /// peer did not advertise during initialization.
    #[error("capability not supported by peer: {0}")]
    CapabilityNotSupported(String),

    /// The transport failed to establish a connection.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// An established connection was lost unexpectedly.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// Connecting to the peer did not complete within the allotted time.
    #[error("connection timed out")]
    ConnectionTimeout,

    /// The transport failed to send an outbound message.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// The transport (or peer) closed the connection.
    #[error("connection closed")]
    ConnectionClosed,

    /// A request did not receive a response within its deadline.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// A request was cancelled via `notifications/cancelled` or local shutdown.
    #[error("request cancelled")]
    Cancelled,

    /// A task-store operation failed (TTL expiry race, bad transition, etc).
    #[error("task error: {0}")]
    Task(String),

    /// Wraps a protocol-level error so it can flow through `ServerResult`.
    #[error(transparent)]
    Protocol(#[from] Box<McpError>),
}

impl ServerError {
    /// JSON-RPC error code this error should surface as, per the MCP error taxonomy.
    #[must_use]
    pub fn jsonrpc_code(&self) -> i32 {
        match self {
            Self::AlreadyConnected | Self::NotConnected | Self::RegistrationAfterConnect => {
                -32600
            }
            Self::CapabilityNotSupported(_) => -32006,
            Self::ConnectionFailed(_)
            | Self::ConnectionLost(_)
            | Self::ConnectionTimeout
            | Self::SendFailed(_)
            | Self::ConnectionClosed => -32000,
            Self::Timeout(_) => -32001,
            Self::Cancelled => -32002,
            Self::Task(_) => -32003,
            Self::Protocol(err) => err.jsonrpc_error_code(),
        }
    }
}

impl From<ServerError> for McpError {
    fn from(err: ServerError) -> Self {
        if let ServerError::Protocol(inner) = err {
            return *inner;
        }
        let code = err.jsonrpc_code();
        McpError::from_rpc_code(code, err.to_string())
    }
}

/// Extension methods on [`McpError`] for failure modes specific to this crate
/// that don't have a dedicated [`ErrorKind`] upstream.
pub trait ServerErrorExt {
    /// A failure in task/session lifecycle bookkeeping (e.g. a poisoned lock).
    fn lifecycle(message: impl Into<String>) -> McpError;
}

impl ServerErrorExt for McpError {
    fn lifecycle(message: impl Into<String>) -> McpError {
        McpError::internal(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jsonrpc_codes_match_taxonomy() {
        assert_eq!(ServerError::AlreadyConnected.jsonrpc_code(), -32600);
        assert_eq!(ServerError::ConnectionClosed.jsonrpc_code(), -32000);
        assert_eq!(ServerError::Cancelled.jsonrpc_code(), -32002);
    }

    #[test]
    fn converts_into_mcp_error() {
        let err: McpError = ServerError::NotConnected.into();
        assert_eq!(err.jsonrpc_error_code(), -32600);
    }

    #[test]
    fn lifecycle_extension_is_internal() {
        let err = McpError::lifecycle("lock poisoned");
        assert_eq!(err.kind, ErrorKind::Internal);
    }
}
