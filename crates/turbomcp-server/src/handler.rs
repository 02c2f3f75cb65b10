//! Handler-facing interface consumed by method registries.
//!
//! A [`RequestHandler`] or [`NotificationHandler`] is registered against a
//! JSON-RPC method with [`ProtocolEngine::set_request_handler`](crate::engine::ProtocolEngine::set_request_handler)
//! / [`set_notification_handler`](crate::engine::ProtocolEngine::set_notification_handler).
//! The engine looks the method up, invokes the handler with `(params, extra)`,
//! and turns the outcome into a JSON-RPC response:
//!
//! - `Ok(value)` becomes the response result.
//! - `Err(HandlerError::Protocol(e))` becomes the response error, verbatim -
//!   the code is never rewritten by the engine ("locked").
//! - Any other error becomes `-32603 Internal error`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::McpError;

/// Context passed to a handler alongside the request/notification params.
///
/// Mirrors the inbound message's routing metadata: which request this is,
/// which session it arrived on, what the caller is authenticated as, a
/// cancellation signal tied to `notifications/cancelled`, a `notify` callback
/// for sending progress/log notifications tagged with this request's id, and
/// (when the inbound request was task-augmented) the task it was admitted
/// into.
#[derive(Clone)]
pub struct HandlerExtra {
    /// The id of the inbound JSON-RPC request (absent for notifications).
    pub request_id: Option<String>,
    /// Session this message arrived on, if the transport is session-aware.
    pub session_id: Option<String>,
    /// Opaque auth context bound to the session, if any.
    pub auth_info: Option<String>,
    /// Cancelled when a `notifications/cancelled` arrives for this request,
    /// or when the connection closes.
    pub signal: CancellationToken,
    /// Task this request was admitted into, if it carried `params.task`.
    pub task_id: Option<String>,
    notifier: Arc<dyn Fn(&str, Value) + Send + Sync>,
    raw_emit: Option<Arc<dyn Fn(Value) + Send + Sync>>,
}

impl HandlerExtra {
    /// Construct a new `HandlerExtra`.
    #[must_use]
    pub fn new(
        request_id: Option<String>,
        session_id: Option<String>,
        auth_info: Option<String>,
        signal: CancellationToken,
        notifier: Arc<dyn Fn(&str, Value) + Send + Sync>,
    ) -> Self {
        Self {
            request_id,
            session_id,
            auth_info,
            signal,
            task_id: None,
            notifier,
            raw_emit: None,
        }
    }

    /// Attach the task this request was admitted into.
    #[must_use]
    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    /// Attach a sink that writes a pre-built JSON-RPC message verbatim to
    /// whatever stream is currently serving this request (e.g. the SSE
    /// response opened for a `tasks/result` long-poll). Unlike [`notify`](Self::notify),
    /// this bypasses envelope construction entirely.
    #[must_use]
    pub fn with_raw_emit(mut self, emit: Arc<dyn Fn(Value) + Send + Sync>) -> Self {
        self.raw_emit = Some(emit);
        self
    }

    /// Send a notification tagged to this request (e.g. `notifications/progress`).
    pub fn notify(&self, method: &str, params: Value) {
        (self.notifier)(method, params);
    }

    /// Write a pre-built JSON-RPC message directly to this request's response
    /// stream, if one was attached. No-op otherwise.
    pub fn emit_raw(&self, message: Value) {
        if let Some(emit) = &self.raw_emit {
            emit(message);
        }
    }

    /// True once the caller has cancelled this request.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.signal.is_cancelled()
    }
}

/// An error a handler can return; `Protocol` carries a wire-locked JSON-RPC
/// code that the engine will not rewrite, anything else is folded into
/// `-32603 Internal error` by the engine.
#[derive(Debug, Clone, thiserror::Error)]
pub enum HandlerError {
    /// A wire error with a specific code/message/data, passed through unchanged.
    #[error("{message}")]
    Protocol {
        /// JSON-RPC error code.
        code: i32,
        /// Human-readable message.
        message: String,
        /// Optional structured error data.
        data: Option<Value>,
    },
    /// Any other failure; the engine folds this into `-32603`.
    #[error(transparent)]
    Other(#[from] Box<McpError>),
}

impl HandlerError {
    /// Build a [`HandlerError::Protocol`] with a locked code.
    #[must_use]
    pub fn protocol(code: i32, message: impl Into<String>) -> Self {
        Self::Protocol {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Build a [`HandlerError::Protocol`] carrying structured data.
    #[must_use]
    pub fn protocol_with_data(code: i32, message: impl Into<String>, data: Value) -> Self {
        Self::Protocol {
            code,
            message: message.into(),
            data: Some(data),
        }
    }
}

impl From<McpError> for HandlerError {
    fn from(err: McpError) -> Self {
        Self::Other(Box::new(err))
    }
}

/// Result type returned by request handlers.
pub type HandlerResult = Result<Value, HandlerError>;

/// A future-returning request handler, boxed so it can be stored in a registry.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Handles a JSON-RPC request for a single method and returns its result.
pub trait RequestHandler: Send + Sync {
    /// Handle `params` for this method, returning the JSON-RPC result value
    /// or a [`HandlerError`].
    fn handle<'a>(&'a self, params: Option<Value>, extra: HandlerExtra) -> BoxFuture<'a, HandlerResult>;
}

/// Handles a JSON-RPC notification for a single method. Notifications have
/// no response; failures are logged, never surfaced to the peer.
pub trait NotificationHandler: Send + Sync {
    /// Handle `params` for this notification method.
    fn handle<'a>(&'a self, params: Option<Value>, extra: HandlerExtra) -> BoxFuture<'a, ()>;
}

/// Adapts a plain async closure into a [`RequestHandler`].
pub struct FnRequestHandler<F>(pub F);

impl<F, Fut> RequestHandler for FnRequestHandler<F>
where
    F: Fn(Option<Value>, HandlerExtra) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn handle<'a>(&'a self, params: Option<Value>, extra: HandlerExtra) -> BoxFuture<'a, HandlerResult> {
        Box::pin((self.0)(params, extra))
    }
}

/// Adapts a plain async closure into a [`NotificationHandler`].
pub struct FnNotificationHandler<F>(pub F);

impl<F, Fut> NotificationHandler for FnNotificationHandler<F>
where
    F: Fn(Option<Value>, HandlerExtra) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn handle<'a>(&'a self, params: Option<Value>, extra: HandlerExtra) -> BoxFuture<'a, ()> {
        Box::pin((self.0)(params, extra))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_extra() -> HandlerExtra {
        HandlerExtra::new(
            Some("1".to_string()),
            None,
            None,
            CancellationToken::new(),
            Arc::new(|_, _| {}),
        )
    }

    #[tokio::test]
    async fn fn_request_handler_returns_result() {
        let handler = FnRequestHandler(|params: Option<Value>, _extra: HandlerExtra| async move {
            Ok(params.unwrap_or(Value::Null))
        });
        let result = handler
            .handle(Some(serde_json::json!({"ok": true})), noop_extra())
            .await
            .unwrap();
        assert_eq!(result, serde_json::json!({"ok": true}));
    }

    #[test]
    fn protocol_error_carries_locked_code() {
        let err = HandlerError::protocol(-32001, "tool not found");
        match err {
            HandlerError::Protocol { code, .. } => assert_eq!(code, -32001),
            HandlerError::Other(_) => panic!("expected protocol variant"),
        }
    }

    #[test]
    fn notify_invokes_callback_with_method_and_params() {
        use std::sync::atomic::{AtomicBool, Ordering};
        let called = Arc::new(AtomicBool::new(false));
        let called2 = called.clone();
        let extra = HandlerExtra::new(
            None,
            None,
            None,
            CancellationToken::new(),
            Arc::new(move |method, _params| {
                assert_eq!(method, "notifications/progress");
                called2.store(true, Ordering::SeqCst);
            }),
        );
        extra.notify("notifications/progress", serde_json::json!({}));
        assert!(called.load(Ordering::SeqCst));
    }
}
