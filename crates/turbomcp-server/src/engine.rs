//! The protocol engine: a transport-agnostic, bidirectional JSON-RPC 2.0
//! dispatcher.
//!
//! One [`ProtocolEngine`] owns one transport. It correlates outbound requests
//! with their responses, times them out (extending the deadline on progress
//! notifications), dispatches inbound requests/notifications to registered
//! handlers, and propagates cancellation in both directions. Transports
//! (stdio, Streamable HTTP) hand the engine a `Arc<dyn Transport>` via
//! [`ProtocolEngine::connect`] and otherwise never see JSON-RPC framing.
//!
//! Non-fatal failures (a malformed inbound message, a write that never
//! reached the peer, a response with no matching outstanding request) are
//! reported to an optional [`ErrorHook`] rather than torn down as connection
//! failures; [`InternalErrorTransform`] lets an application rewrite the
//! message/data of a handler's internal-error envelope before it crosses the
//! wire, without ever touching the error code.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::{Notify, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{instrument, warn};

use turbomcp_protocol::jsonrpc::{
    JsonRpcError, JsonRpcErrorCode, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, utils,
};
use turbomcp_protocol::types::RequestId;
use turbomcp_transport_traits::{Transport, TransportMessage};

use crate::config::{ClientCapabilities, ServerConfig};
use crate::error::{McpError, ServerError, ServerResult};
use crate::handler::{HandlerError, HandlerExtra, NotificationHandler, RequestHandler};
use crate::task_storage::{
    RELATED_TASK_META_KEY, TaskQueue, TaskStorage, TasksCancelHandler, TasksGetHandler,
    TasksListHandler, TasksResultHandler,
};

/// Methods that require the client to have announced the matching capability
/// during `initialize` before the engine will send them.
const CAPABILITY_GATED_METHODS: &[(&str, &str)] = &[
    ("sampling/createMessage", "sampling"),
    ("elicitation/create", "elicitation"),
    ("roots/list", "roots"),
];

/// Methods that accept a `params.task = {ttl}` augmentation and get promoted
/// to a persisted task instead of running inline. Any other method carrying
/// `params.task` is rejected with `InvalidRequest`.
const TASK_CAPABLE_METHODS: &[&str] = &["tools/call", "sampling/createMessage", "elicitation/create"];

/// Connection lifecycle state. Valid transitions: `Disconnected` →
/// `Connecting` → `Connected` → `Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// No transport installed yet.
    Disconnected,
    /// `connect()` is in progress.
    Connecting,
    /// Transport is installed and the dispatch loop is running.
    Connected,
}

/// A non-fatal failure reported to the engine's error hook: a parse error on
/// an inbound message, a transport write failure, or a dropped response with
/// no matching outstanding request. None of these abort the connection.
#[derive(Debug, Clone)]
pub enum EngineError {
    /// Inbound bytes failed to parse as a JSON-RPC message.
    Parse(String),
    /// A message could not be written to the transport.
    SendFailed(String),
    /// An inbound response carried an id with no matching outstanding request.
    UnmatchedResponse(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Parse(msg) => write!(f, "parse error: {msg}"),
            Self::SendFailed(msg) => write!(f, "send failed: {msg}"),
            Self::UnmatchedResponse(id) => write!(f, "unmatched response id: {id}"),
        }
    }
}

/// Observes [`EngineError`]s as they occur. Installed via
/// [`ProtocolEngine::set_error_hook`]; never sees fatal errors (those are
/// returned directly to the caller of `request`/`notify`).
pub type ErrorHook = Arc<dyn Fn(EngineError) + Send + Sync>;

/// Rewrites the `message`/`data` of an internal-error (`-32603`) envelope
/// built from a handler's non-protocol error. The code itself is never
/// rewritten - only this pair. Installed via
/// [`ProtocolEngine::set_internal_error_transform`].
pub type InternalErrorTransform = Arc<dyn Fn(&str, Option<Value>) -> (String, Option<Value>) + Send + Sync>;

/// Options for an outbound [`ProtocolEngine::request`] call.
#[derive(Default)]
pub struct RequestOptions {
    /// Overrides `ServerConfig::timeouts.request_timeout` for this call.
    pub timeout: Option<Duration>,
    /// Cancelled by the caller to abort the request early.
    pub signal: Option<CancellationToken>,
    /// Tags the outbound message with `_meta.mcp:relatedTask.taskId`, routing
    /// it to the task queue instead of the transport.
    pub related_task: Option<String>,
}

struct Outstanding {
    resolver: oneshot::Sender<Result<Value, ServerError>>,
    progress: Arc<Notify>,
}

/// A transport-agnostic, bidirectional JSON-RPC 2.0 engine.
pub struct ProtocolEngine {
    state: RwLock<EngineState>,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    request_handlers: RwLock<HashMap<String, Arc<dyn RequestHandler>>>,
    notification_handlers: RwLock<HashMap<String, Arc<dyn NotificationHandler>>>,
    outstanding: Mutex<HashMap<RequestId, Outstanding>>,
    inbound_cancel: Mutex<HashMap<RequestId, CancellationToken>>,
    next_id: AtomicI64,
    config: ServerConfig,
    client_capabilities: RwLock<Option<ClientCapabilities>>,
    task_queue: Option<Arc<TaskQueue>>,
    /// Task store backing `params.task`-augmented request promotion and the
    /// built-in `tasks/*` handlers. Set via [`Self::with_task_storage`].
    task_storage: Option<TaskStorage>,
    dispatch_task: Mutex<Option<JoinHandle<()>>>,
    /// Session this engine is bound to, if the transport is session-aware.
    /// Streamable HTTP runs one engine per session; stdio leaves this unset.
    session_id: Option<String>,
    /// Observes non-fatal parse/send/routing failures. See [`EngineError`].
    error_hook: RwLock<Option<ErrorHook>>,
    /// Rewrites the message/data of internal-error envelopes built from
    /// handler errors, never the code.
    internal_error_transform: RwLock<Option<InternalErrorTransform>>,
}

impl ProtocolEngine {
    /// Create a new, disconnected engine.
    #[must_use]
    pub fn new(config: ServerConfig) -> Self {
        Self {
            state: RwLock::new(EngineState::Disconnected),
            transport: RwLock::new(None),
            request_handlers: RwLock::new(HashMap::new()),
            notification_handlers: RwLock::new(HashMap::new()),
            outstanding: Mutex::new(HashMap::new()),
            inbound_cancel: Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(1),
            config,
            client_capabilities: RwLock::new(None),
            task_queue: None,
            task_storage: None,
            dispatch_task: Mutex::new(None),
            session_id: None,
            error_hook: RwLock::new(None),
            internal_error_transform: RwLock::new(None),
        }
    }

    /// Install a hook observing non-fatal [`EngineError`]s (parse failures,
    /// transport write failures, unmatched responses). Per §4.3, `connect`
    /// installs the message dispatch loop; this installs its error sink.
    /// Replaces any previously installed hook.
    pub fn set_error_hook(&self, hook: ErrorHook) {
        *self.error_hook.write() = Some(hook);
    }

    /// Install a transform applied to the `message`/`data` of an
    /// internal-error (`-32603`) envelope built from a handler's non-protocol
    /// error before it crosses the wire. The error code is never rewritten.
    pub fn set_internal_error_transform(&self, transform: InternalErrorTransform) {
        *self.internal_error_transform.write() = Some(transform);
    }

    fn report_error(&self, err: EngineError) {
        if let Some(hook) = self.error_hook.read().as_ref() {
            hook(err);
        } else {
            warn!(%err, "engine error (no error hook installed)");
        }
    }

    /// Attach a task queue so server-originated messages tagged with a
    /// related task are redirected to it instead of the transport.
    #[must_use]
    pub fn with_task_queue(mut self, queue: Arc<TaskQueue>) -> Self {
        self.task_queue = Some(queue);
        self
    }

    /// Attach the task store backing `params.task`-augmented request
    /// promotion and the built-in `tasks/*` handlers (call
    /// [`Self::install_task_handlers`] after `Arc`-wrapping the engine to
    /// register them).
    #[must_use]
    pub fn with_task_storage(mut self, storage: TaskStorage) -> Self {
        self.task_storage = Some(storage);
        self
    }

    /// Register the built-in `tasks/get`, `tasks/result`, `tasks/list`,
    /// `tasks/cancel` handlers against the task store installed via
    /// [`Self::with_task_storage`]. Wires `tasks/cancel` to fail any requests
    /// this engine queued for the cancelled task (see `SPEC_FULL.md` §4.4
    /// invariant (iv)) instead of leaving them to hang until their own
    /// deadline.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::RegistrationAfterConnect`] if called after
    /// `connect()`. No-op (`Ok(())`) if no task store was installed.
    pub fn install_task_handlers(self: &Arc<Self>) -> Result<(), ServerError> {
        let Some(storage) = self.task_storage.clone() else {
            return Ok(());
        };
        let queue_for_result = self.task_queue.as_ref().map(|q| (**q).clone());
        let queue_for_cancel = self.task_queue.as_ref().map(|q| (**q).clone());

        self.set_request_handler("tasks/get", Arc::new(TasksGetHandler::new(storage.clone())))?;
        self.set_request_handler(
            "tasks/result",
            Arc::new(TasksResultHandler::new(storage.clone(), queue_for_result)),
        )?;
        self.set_request_handler(
            "tasks/list",
            Arc::new(TasksListHandler::new(storage.clone())),
        )?;

        let engine = self.clone();
        let reject: Arc<dyn Fn(Value) + Send + Sync> = Arc::new(move |message: Value| {
            let Some(id_value) = message.get("id") else {
                return;
            };
            for candidate in request_id_candidates(id_value) {
                let resolved = engine.outstanding.lock().remove(&candidate);
                if let Some(entry) = resolved {
                    let _ = entry.resolver.send(Err(ServerError::Cancelled));
                    break;
                }
            }
        });
        let cancel_handler =
            TasksCancelHandler::new(storage, queue_for_cancel).with_reject_hook(reject);
        self.set_request_handler("tasks/cancel", Arc::new(cancel_handler))?;
        Ok(())
    }

    /// Bind this engine to a session id, reported to handlers via
    /// [`HandlerExtra::session_id`]. Set by session-aware transports
    /// (Streamable HTTP); left unset for stdio.
    #[must_use]
    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> EngineState {
        *self.state.read()
    }

    /// Register a request handler. Errors with [`ServerError::RegistrationAfterConnect`]
    /// once the engine is connected.
    pub fn set_request_handler(
        &self,
        method: impl Into<String>,
        handler: Arc<dyn RequestHandler>,
    ) -> Result<(), ServerError> {
        if self.state() == EngineState::Connected {
            return Err(ServerError::RegistrationAfterConnect);
        }
        self.request_handlers.write().insert(method.into(), handler);
        Ok(())
    }

    /// Register a notification handler. Errors with [`ServerError::RegistrationAfterConnect`]
    /// once the engine is connected.
    pub fn set_notification_handler(
        &self,
        method: impl Into<String>,
        handler: Arc<dyn NotificationHandler>,
    ) -> Result<(), ServerError> {
        if self.state() == EngineState::Connected {
            return Err(ServerError::RegistrationAfterConnect);
        }
        self.notification_handlers
            .write()
            .insert(method.into(), handler);
        Ok(())
    }

    /// Install `transport`, start it, and begin the inbound dispatch loop.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::AlreadyConnected`] if `connect` has already
    /// succeeded, or [`ServerError::ConnectionFailed`] if the transport
    /// itself fails to connect.
    #[instrument(skip(self, transport))]
    pub async fn connect(self: &Arc<Self>, transport: Arc<dyn Transport>) -> Result<(), ServerError> {
        {
            let mut state = self.state.write();
            if *state != EngineState::Disconnected {
                return Err(ServerError::AlreadyConnected);
            }
            *state = EngineState::Connecting;
        }

        transport
            .connect()
            .await
            .map_err(|e| ServerError::ConnectionFailed(e.to_string()))?;

        *self.transport.write() = Some(transport.clone());
        *self.state.write() = EngineState::Connected;

        let engine = self.clone();
        let handle = tokio::spawn(async move {
            engine.dispatch_loop(transport).await;
        });
        *self.dispatch_task.lock() = Some(handle);

        Ok(())
    }

    /// Reject every outstanding request with [`ServerError::ConnectionClosed`],
    /// disconnect the transport and stop the dispatch loop.
    pub async fn close(&self) {
        *self.state.write() = EngineState::Disconnected;

        for (_, outstanding) in self.outstanding.lock().drain() {
            let _ = outstanding.resolver.send(Err(ServerError::ConnectionClosed));
        }
        for (_, token) in self.inbound_cancel.lock().drain() {
            token.cancel();
        }

        if let Some(transport) = self.transport.write().take() {
            let _ = transport.disconnect().await;
        }
        if let Some(handle) = self.dispatch_task.lock().take() {
            handle.abort();
        }
    }

    /// Send `method(params)` and wait for a correlated response, honoring
    /// `opts.timeout`/`opts.signal` and progress-based deadline extension.
    ///
    /// # Errors
    ///
    /// Fails with the peer's error (pass-through), [`ServerError::Timeout`],
    /// [`ServerError::Cancelled`], [`ServerError::NotConnected`], or
    /// [`ServerError::CapabilityNotSupported`] if `method` requires a
    /// capability the peer never announced.
    #[instrument(skip(self, params))]
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        opts: RequestOptions,
    ) -> ServerResult<Value> {
        self.assert_capability(method)?;

        let transport = self
            .transport
            .read()
            .clone()
            .ok_or(ServerError::NotConnected)?;

        let id = RequestId::Number(self.next_id.fetch_add(1, Ordering::SeqCst));
        let params = tag_related_task(params, opts.related_task.as_deref());
        let request = JsonRpcRequest::new(method.to_string(), params, id.clone());

        let (tx, rx) = oneshot::channel();
        let progress = Arc::new(Notify::new());
        self.outstanding.lock().insert(
            id.clone(),
            Outstanding {
                resolver: tx,
                progress: progress.clone(),
            },
        );

        if let Err(err) = self.send_envelope(&transport, &request.method, &id, &request).await {
            self.outstanding.lock().remove(&id);
            return Err(err.into());
        }

        let timeout = opts.timeout.unwrap_or(self.config.timeouts.request_timeout);
        let result = self
            .await_response(&id, rx, progress, timeout, opts.signal)
            .await;

        if result.is_err() {
            self.outstanding.lock().remove(&id);
            let _ = self
                .notify_raw(&transport, "notifications/cancelled", Some(serde_json::json!({"requestId": id.as_display()})))
                .await;
        }

        result.map_err(ServerError::into)
    }

    async fn await_response(
        &self,
        id: &RequestId,
        mut rx: oneshot::Receiver<Result<Value, ServerError>>,
        progress: Arc<Notify>,
        mut timeout: Duration,
        signal: Option<CancellationToken>,
    ) -> Result<Value, ServerError> {
        let max_total = self.config.timeouts.max_total_timeout;
        let mut elapsed = Duration::ZERO;
        loop {
            let sleep = tokio::time::sleep(timeout);
            tokio::select! {
                biased;
                result = &mut rx => {
                    return result.unwrap_or(Err(ServerError::ConnectionClosed));
                }
                _ = progress.notified() => {
                    elapsed += timeout;
                    if let Some(max) = max_total {
                        if elapsed >= max {
                            return Err(ServerError::Timeout(max));
                        }
                        timeout = std::cmp::min(timeout, max - elapsed);
                    }
                    continue;
                }
                () = async { if let Some(s) = &signal { s.cancelled().await } else { std::future::pending().await } } => {
                    return Err(ServerError::Cancelled);
                }
                () = sleep => {
                    let _ = id;
                    return Err(ServerError::Timeout(timeout));
                }
            }
        }
    }

    /// Fire-and-forget notification; no correlation, no response expected.
    ///
    /// # Errors
    ///
    /// Fails with [`ServerError::NotConnected`] or [`ServerError::CapabilityNotSupported`].
    pub async fn notify(&self, method: &str, params: Option<Value>) -> ServerResult<()> {
        self.assert_capability(method)?;
        let transport = self
            .transport
            .read()
            .clone()
            .ok_or(ServerError::NotConnected)?;
        self.notify_raw(&transport, method, params)
            .await
            .map_err(ServerError::into)
    }

    async fn notify_raw(
        &self,
        transport: &Arc<dyn Transport>,
        method: &str,
        params: Option<Value>,
    ) -> Result<(), ServerError> {
        let notification = JsonRpcNotification::new(method.to_string(), params);
        let message = JsonRpcMessage::Notification(notification);
        self.write_message(transport, &message).await
    }

    fn assert_capability(&self, method: &str) -> Result<(), ServerError> {
        let Some((_, capability)) = CAPABILITY_GATED_METHODS
            .iter()
            .find(|(m, _)| *m == method)
        else {
            return Ok(());
        };
        let caps = self.client_capabilities.read();
        let supported = caps.as_ref().is_some_and(|c| match *capability {
            "sampling" => c.sampling,
            "roots" => c.roots,
            "elicitation" => c.elicitation,
            other => c.experimental.contains(other),
        });
        if supported {
            Ok(())
        } else {
            Err(ServerError::CapabilityNotSupported((*capability).to_string()))
        }
    }

    async fn send_envelope(
        &self,
        transport: &Arc<dyn Transport>,
        _method: &str,
        id: &RequestId,
        request: &JsonRpcRequest,
    ) -> Result<(), ServerError> {
        if let (Some(queue), Some(task_id)) = (&self.task_queue, related_task_id(&request.params)) {
            let value = serde_json::to_value(JsonRpcMessage::Request(request.clone()))
                .map_err(|e| ServerError::SendFailed(e.to_string()))?;
            queue
                .enqueue(&task_id, value)
                .map_err(|e| ServerError::Task(e.to_string()))?;
            return Ok(());
        }
        let _ = id;
        self.write_message(transport, &JsonRpcMessage::Request(request.clone()))
            .await
    }

    async fn write_message(
        &self,
        transport: &Arc<dyn Transport>,
        message: &JsonRpcMessage,
    ) -> Result<(), ServerError> {
        self.write_message_correlated(transport, message, None).await
    }

    /// Like [`write_message`](Self::write_message), but when `correlation_id`
    /// is set, asks the transport to deliver it to that specific request's
    /// stream (see [`Transport::send_correlated`]) rather than wherever
    /// `send` would route an uncorrelated message.
    async fn write_message_correlated(
        &self,
        transport: &Arc<dyn Transport>,
        message: &JsonRpcMessage,
        correlation_id: Option<&str>,
    ) -> Result<(), ServerError> {
        let json = utils::serialize_message(message).map_err(|e| ServerError::SendFailed(e.to_string()))?;
        let transport_message = TransportMessage::new(
            turbomcp_protocol::MessageId::String(uuid::Uuid::new_v4().to_string()),
            Bytes::from(json.into_bytes()),
        );
        let result = match correlation_id {
            Some(id) => transport.send_correlated(id, transport_message).await,
            None => transport.send(transport_message).await,
        };
        result.map_err(|e| ServerError::SendFailed(e.to_string()))
    }

    async fn dispatch_loop(self: Arc<Self>, transport: Arc<dyn Transport>) {
        loop {
            if self.state() != EngineState::Connected {
                break;
            }
            match transport.receive().await {
                Ok(Some(message)) => {
                    let engine = self.clone();
                    let transport = transport.clone();
                    tokio::spawn(async move {
                        engine.handle_incoming(transport, message).await;
                    });
                }
                Ok(None) => {
                    tokio::task::yield_now().await;
                }
                Err(err) => {
                    warn!(error = %err, "transport receive failed, closing engine");
                    self.close().await;
                    break;
                }
            }
        }
    }

    async fn handle_incoming(self: Arc<Self>, transport: Arc<dyn Transport>, message: TransportMessage) {
        let text = match std::str::from_utf8(&message.payload) {
            Ok(t) => t,
            Err(_) => return,
        };
        let parsed = match utils::parse_message(text) {
            Ok(m) => m,
            Err(err) => {
                self.report_error(EngineError::Parse(err.to_string()));
                return;
            }
        };
        self.route_message(transport, parsed).await;
    }

    fn route_message<'a>(
        self: &'a Arc<Self>,
        transport: Arc<dyn Transport>,
        message: JsonRpcMessage,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            match message {
                JsonRpcMessage::Request(req) => self.handle_request(transport, req).await,
                JsonRpcMessage::Notification(note) => self.handle_notification(transport, note).await,
                JsonRpcMessage::Response(resp) => self.handle_response(resp),
                JsonRpcMessage::RequestBatch(batch) => {
                    for req in batch.items {
                        self.handle_request(transport.clone(), req).await;
                    }
                }
                JsonRpcMessage::ResponseBatch(batch) => {
                    for resp in batch.items {
                        self.handle_response(resp);
                    }
                }
                JsonRpcMessage::MessageBatch(batch) => {
                    for item in batch.items {
                        self.route_message(transport.clone(), item).await;
                    }
                }
            }
        })
    }

    async fn handle_request(self: &Arc<Self>, transport: Arc<dyn Transport>, req: JsonRpcRequest) {
        let method = req.method.clone();
        let id = req.id.clone();

        if method == "initialize" {
            self.handle_initialize(transport, req).await;
            return;
        }

        if let Some(task_ttl) = task_request_ttl(&req.params) {
            if !TASK_CAPABLE_METHODS.contains(&method.as_str()) {
                let error = JsonRpcError {
                    code: JsonRpcErrorCode::InvalidRequest.code(),
                    message: format!("{method} does not support task-augmented requests"),
                    data: None,
                };
                let response = JsonRpcResponse::error_response(error, id);
                if let Err(err) = self.write_message(&transport, &JsonRpcMessage::Response(response)).await {
                    self.report_error(EngineError::SendFailed(err.to_string()));
                }
                return;
            }
            self.promote_to_task(transport, req, task_ttl).await;
            return;
        }

        let handler = self.request_handlers.read().get(&method).cloned();
        let Some(handler) = handler else {
            let error = JsonRpcError {
                code: JsonRpcErrorCode::MethodNotFound.code(),
                message: format!("Method not found: {method}"),
                data: None,
            };
            let response = JsonRpcResponse::error_response(error, id);
            if let Err(err) = self.write_message(&transport, &JsonRpcMessage::Response(response)).await {
                self.report_error(EngineError::SendFailed(err.to_string()));
            }
            return;
        };

        let signal = CancellationToken::new();
        self.inbound_cancel.lock().insert(id.clone(), signal.clone());

        let engine = self.clone();
        let transport_for_notify = transport.clone();
        let id_for_notify = id.clone();
        let notifier = Arc::new(move |notify_method: &str, params: Value| {
            let engine = engine.clone();
            let transport = transport_for_notify.clone();
            let notify_method = notify_method.to_string();
            let id = id_for_notify.clone();
            tokio::spawn(async move {
                let mut params = params;
                if let Value::Object(ref mut map) = params {
                    map.insert("relatedRequestId".to_string(), serde_json::json!(id.as_display()));
                }
                let notification = JsonRpcNotification::new(notify_method, Some(params));
                let message = JsonRpcMessage::Notification(notification);
                let _ = engine
                    .write_message_correlated(&transport, &message, Some(&id.as_display()))
                    .await;
            });
        });

        let transport_for_raw = transport.clone();
        let id_for_raw = id.as_display();
        let raw_emit = Arc::new(move |message: Value| {
            let transport = transport_for_raw.clone();
            let id_for_raw = id_for_raw.clone();
            tokio::spawn(async move {
                let Ok(json) = serde_json::to_string(&message) else { return };
                let transport_message = TransportMessage::new(
                    turbomcp_protocol::MessageId::String(uuid::Uuid::new_v4().to_string()),
                    Bytes::from(json.into_bytes()),
                );
                let _ = transport.send_correlated(&id_for_raw, transport_message).await;
            });
        });

        let extra = HandlerExtra::new(
            Some(id.as_display()),
            self.session_id.clone(),
            None,
            signal.clone(),
            notifier,
        )
        .with_raw_emit(raw_emit);
        let result = handler.handle(req.params, extra).await;
        self.inbound_cancel.lock().remove(&id);

        let response = match result {
            Ok(value) => JsonRpcResponse::success(value, id.clone()),
            Err(HandlerError::Protocol { code, message, data }) => {
                JsonRpcResponse::error_response(JsonRpcError { code, message, data }, id.clone())
            }
            Err(HandlerError::Other(err)) => {
                let (message, data) = match self.internal_error_transform.read().as_ref() {
                    Some(transform) => transform(&err.message, None),
                    None => (err.message.clone(), None),
                };
                let error = JsonRpcError {
                    code: JsonRpcErrorCode::InternalError.code(),
                    message,
                    data,
                };
                JsonRpcResponse::error_response(error, id.clone())
            }
        };
        if let Err(send_err) = self
            .write_message_correlated(&transport, &JsonRpcMessage::Response(response), Some(&id.as_display()))
            .await
        {
            self.report_error(EngineError::SendFailed(send_err.to_string()));
        }
    }

    async fn handle_initialize(self: &Arc<Self>, transport: Arc<dyn Transport>, req: JsonRpcRequest) {
        let params = req.params.clone().unwrap_or(Value::Null);
        let peer_version = params.get("protocolVersion").and_then(Value::as_str);
        let negotiated = self.config.protocol.negotiate(peer_version);

        *self.client_capabilities.write() = Some(ClientCapabilities::from_params(&params));

        let response = match negotiated {
            Some(version) => JsonRpcResponse::success(
                serde_json::json!({
                    "protocolVersion": version,
                    "capabilities": {},
                    "serverInfo": { "name": "turbomcp-server", "version": env!("CARGO_PKG_VERSION") },
                }),
                req.id.clone(),
            ),
            None => JsonRpcResponse::error_response(
                JsonRpcError {
                    code: JsonRpcErrorCode::InvalidRequest.code(),
                    message: "unsupported protocol version".to_string(),
                    data: None,
                },
                req.id.clone(),
            ),
        };
        let correlation = req.id.as_display();
        let _ = self
            .write_message_correlated(&transport, &JsonRpcMessage::Response(response), Some(&correlation))
            .await;
    }

    /// Admit a `params.task`-augmented request: create the persisted task,
    /// answer the caller immediately with `{taskId}`, then run the method's
    /// registered handler in the background, routing its eventual
    /// completion/failure into the task store.
    async fn promote_to_task(self: &Arc<Self>, transport: Arc<dyn Transport>, req: JsonRpcRequest, ttl: Option<u64>) {
        let correlation = req.id.as_display();
        let Some(storage) = self.task_storage.clone() else {
            let error = JsonRpcError {
                code: JsonRpcErrorCode::InternalError.code(),
                message: "task subsystem not configured".to_string(),
                data: None,
            };
            let response = JsonRpcResponse::error_response(error, req.id.clone());
            let _ = self
                .write_message_correlated(&transport, &JsonRpcMessage::Response(response), Some(&correlation))
                .await;
            return;
        };

        let task_id = match storage.create_task(turbomcp_protocol::types::TaskMetadata { ttl }, None) {
            Ok(id) => id,
            Err(err) => {
                let error = JsonRpcError {
                    code: JsonRpcErrorCode::InternalError.code(),
                    message: err.to_string(),
                    data: None,
                };
                let response = JsonRpcResponse::error_response(error, req.id.clone());
                let _ = self
                    .write_message_correlated(&transport, &JsonRpcMessage::Response(response), Some(&correlation))
                    .await;
                return;
            }
        };

        let ack = JsonRpcResponse::success(serde_json::json!({ "taskId": task_id }), req.id.clone());
        if let Err(err) = self
            .write_message_correlated(&transport, &JsonRpcMessage::Response(ack), Some(&correlation))
            .await
        {
            self.report_error(EngineError::SendFailed(err.to_string()));
        }

        let engine = self.clone();
        tokio::spawn(async move {
            engine.run_task_handler(req, task_id).await;
        });
    }

    /// Runs a promoted task's handler to completion and stores the outcome.
    /// Notifications the handler raises via `extra.notify` are tagged with
    /// the related task and enqueued rather than written to the transport,
    /// since the original caller has already moved on to polling
    /// `tasks/result`.
    async fn run_task_handler(self: Arc<Self>, req: JsonRpcRequest, task_id: String) {
        let Some(storage) = self.task_storage.clone() else {
            return;
        };
        let handler = self.request_handlers.read().get(&req.method).cloned();
        let Some(handler) = handler else {
            let _ = storage.fail_task(&task_id, format!("Method not found: {}", req.method), None);
            return;
        };

        let engine = self.clone();
        let task_id_for_notify = task_id.clone();
        let notifier = Arc::new(move |notify_method: &str, params: Value| {
            let engine = engine.clone();
            let notify_method = notify_method.to_string();
            let task_id = task_id_for_notify.clone();
            tokio::spawn(async move {
                let tagged = tag_related_task(Some(params), Some(&task_id));
                let notification = JsonRpcNotification::new(notify_method, tagged);
                let Ok(value) = serde_json::to_value(JsonRpcMessage::Notification(notification)) else {
                    return;
                };
                if let Some(queue) = engine.task_queue.as_ref() {
                    let _ = queue.enqueue(&task_id, value);
                }
            });
        });

        let extra = HandlerExtra::new(
            Some(req.id.as_display()),
            self.session_id.clone(),
            None,
            CancellationToken::new(),
            notifier,
        )
        .with_task(task_id.clone());

        let result = handler.handle(req.params.clone(), extra).await;
        match result {
            Ok(value) => {
                let _ = storage.complete_task(&task_id, value, None);
            }
            Err(HandlerError::Protocol { message, .. }) => {
                let _ = storage.fail_task(&task_id, message, None);
            }
            Err(HandlerError::Other(err)) => {
                let _ = storage.fail_task(&task_id, err.to_string(), None);
            }
        }
    }

    async fn handle_notification(self: &Arc<Self>, transport: Arc<dyn Transport>, note: JsonRpcNotification) {
        if note.method == "notifications/cancelled" {
            if let Some(value) = note.params.as_ref().and_then(|p| p.get("requestId")) {
                let inbound_cancel = self.inbound_cancel.lock();
                for candidate in request_id_candidates(value) {
                    if let Some(token) = inbound_cancel.get(&candidate) {
                        token.cancel();
                        break;
                    }
                }
            }
            return;
        }
        if note.method == "notifications/progress" {
            if let Some(value) = note.params.as_ref().and_then(|p| p.get("requestId")) {
                let outstanding = self.outstanding.lock();
                for candidate in request_id_candidates(value) {
                    if let Some(entry) = outstanding.get(&candidate) {
                        entry.progress.notify_one();
                        break;
                    }
                }
            }
            return;
        }

        let handler = self.notification_handlers.read().get(&note.method).cloned();
        if let Some(handler) = handler {
            let notifier_transport = transport.clone();
            let engine = self.clone();
            let notifier = Arc::new(move |m: &str, p: Value| {
                let engine = engine.clone();
                let transport = notifier_transport.clone();
                let m = m.to_string();
                tokio::spawn(async move {
                    let _ = engine.notify_raw(&transport, &m, Some(p)).await;
                });
            });
            let extra = HandlerExtra::new(
                None,
                self.session_id.clone(),
                None,
                CancellationToken::new(),
                notifier,
            );
            handler.handle(note.params, extra).await;
        }
    }

    fn handle_response(&self, resp: JsonRpcResponse) {
        let Some(id) = resp.request_id().cloned() else {
            return;
        };
        let Some(outstanding) = self.outstanding.lock().remove(&id) else {
            self.report_error(EngineError::UnmatchedResponse(id.as_display()));
            return;
        };
        let result = if resp.is_success() {
            Ok(resp.result().cloned().unwrap_or(Value::Null))
        } else {
            let err = resp.error().cloned().unwrap_or_else(|| JsonRpcError {
                code: JsonRpcErrorCode::InternalError.code(),
                message: "unknown error".to_string(),
                data: None,
            });
            Err(ServerError::Protocol(Box::new(McpError::from_rpc_code(
                err.code,
                err.message,
            ))))
        };
        let _ = outstanding.resolver.send(result);
    }
}

fn tag_related_task(params: Option<Value>, task_id: Option<&str>) -> Option<Value> {
    let Some(task_id) = task_id else { return params };
    let mut params = params.unwrap_or(Value::Object(serde_json::Map::new()));
    if let Value::Object(ref mut map) = params {
        let meta = map
            .entry("_meta")
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
        if let Value::Object(ref mut meta_map) = meta {
            meta_map.insert(
                RELATED_TASK_META_KEY.to_string(),
                serde_json::json!({ "taskId": task_id }),
            );
        }
    }
    Some(params)
}

/// A request carrying a top-level `params.task = {ttl}` (distinct from the
/// `_meta.mcp:relatedTask` tag [`related_task_id`] reads) asks to be promoted
/// to a persisted task. Returns `Some(ttl)` - `ttl` itself may be absent -
/// when `params.task` is present and not `null`; `None` otherwise.
fn task_request_ttl(params: &Option<Value>) -> Option<Option<u64>> {
    let task = params.as_ref()?.get("task")?;
    if task.is_null() {
        return None;
    }
    Some(task.get("ttl").and_then(Value::as_u64))
}

fn related_task_id(params: &Option<Value>) -> Option<String> {
    params
        .as_ref()?
        .get("_meta")?
        .get(RELATED_TASK_META_KEY)?
        .get("taskId")?
        .as_str()
        .map(str::to_string)
}

/// A `requestId` field in a `notifications/cancelled` or
/// `notifications/progress` notification may be serialized as either a JSON
/// string or a JSON number, and the original outbound/inbound request may be
/// keyed by either [`RequestId`] variant - so both candidates are tried.
fn request_id_candidates(value: &Value) -> Vec<RequestId> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .map(RequestId::Number)
            .into_iter()
            .chain(std::iter::once(RequestId::String(n.to_string())))
            .collect(),
        Value::String(s) => {
            let mut candidates = vec![RequestId::String(s.clone())];
            if let Ok(n) = s.parse::<i64>() {
                candidates.push(RequestId::Number(n));
            }
            candidates
        }
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use turbomcp_transport_traits::{TransportCapabilities, TransportMetrics, TransportState as TState};

    /// Minimal `Transport` stub for tests that exercise dispatch logic
    /// (notification routing, error reporting) without needing real I/O.
    #[derive(Debug, Default)]
    struct NoopTransport {
        capabilities: TransportCapabilities,
    }

    #[async_trait::async_trait]
    impl Transport for NoopTransport {
        fn transport_type(&self) -> turbomcp_transport_traits::TransportType {
            turbomcp_transport_traits::TransportType::Stdio
        }

        fn capabilities(&self) -> &TransportCapabilities {
            &self.capabilities
        }

        async fn state(&self) -> TState {
            TState::Connected
        }

        async fn connect(&self) -> Result<(), turbomcp_transport_traits::TransportError> {
            Ok(())
        }

        async fn disconnect(&self) -> Result<(), turbomcp_transport_traits::TransportError> {
            Ok(())
        }

        async fn send(&self, _message: TransportMessage) -> Result<(), turbomcp_transport_traits::TransportError> {
            Ok(())
        }

        async fn receive(&self) -> Result<Option<TransportMessage>, turbomcp_transport_traits::TransportError> {
            Ok(None)
        }

        async fn metrics(&self) -> TransportMetrics {
            TransportMetrics::default()
        }
    }

    /// Records every message handed to `send`/`send_correlated` so tests can
    /// assert on what the engine wrote without a real transport.
    #[derive(Debug, Default)]
    struct RecordingTransport {
        capabilities: TransportCapabilities,
        sent: Mutex<Vec<Value>>,
    }

    impl RecordingTransport {
        fn sent_messages(&self) -> Vec<Value> {
            self.sent.lock().clone()
        }
    }

    #[async_trait::async_trait]
    impl Transport for RecordingTransport {
        fn transport_type(&self) -> turbomcp_transport_traits::TransportType {
            turbomcp_transport_traits::TransportType::Stdio
        }

        fn capabilities(&self) -> &TransportCapabilities {
            &self.capabilities
        }

        async fn state(&self) -> TState {
            TState::Connected
        }

        async fn connect(&self) -> Result<(), turbomcp_transport_traits::TransportError> {
            Ok(())
        }

        async fn disconnect(&self) -> Result<(), turbomcp_transport_traits::TransportError> {
            Ok(())
        }

        async fn send(&self, message: TransportMessage) -> Result<(), turbomcp_transport_traits::TransportError> {
            let value: Value = serde_json::from_slice(&message.payload).unwrap();
            self.sent.lock().push(value);
            Ok(())
        }

        async fn receive(&self) -> Result<Option<TransportMessage>, turbomcp_transport_traits::TransportError> {
            Ok(None)
        }

        async fn send_correlated<'a>(
            &'a self,
            _request_id: &'a str,
            message: TransportMessage,
        ) -> Result<(), turbomcp_transport_traits::TransportError> {
            self.send(message).await
        }

        async fn metrics(&self) -> TransportMetrics {
            TransportMetrics::default()
        }
    }

    #[test]
    fn tag_related_task_sets_meta() {
        let params = tag_related_task(Some(serde_json::json!({"data": 1})), Some("task-1"));
        assert_eq!(related_task_id(&params), Some("task-1".to_string()));
    }

    #[test]
    fn tag_related_task_noop_without_id() {
        let params = Some(serde_json::json!({"data": 1}));
        let tagged = tag_related_task(params.clone(), None);
        assert_eq!(tagged, params);
    }

    #[test]
    fn task_request_ttl_reads_object_and_rejects_null() {
        let augmented = Some(serde_json::json!({"task": {"ttl": 60}}));
        assert_eq!(task_request_ttl(&augmented), Some(Some(60)));

        let no_ttl = Some(serde_json::json!({"task": {}}));
        assert_eq!(task_request_ttl(&no_ttl), Some(None));

        let plain = Some(serde_json::json!({"other": 1}));
        assert_eq!(task_request_ttl(&plain), None);

        let explicit_null = Some(serde_json::json!({"task": null}));
        assert_eq!(task_request_ttl(&explicit_null), None);
    }

    fn task_engine() -> Arc<ProtocolEngine> {
        let queue = Arc::new(TaskQueue::new(16));
        let storage = TaskStorage::new(Duration::from_secs(60));
        Arc::new(
            ProtocolEngine::new(ServerConfig::default())
                .with_task_queue(queue)
                .with_task_storage(storage),
        )
    }

    #[tokio::test]
    async fn task_augmented_request_to_non_task_capable_method_is_rejected() {
        let engine = task_engine();
        engine.install_task_handlers().unwrap();
        let recording = Arc::new(RecordingTransport::default());
        let transport: Arc<dyn Transport> = recording.clone();

        let req = JsonRpcRequest::new(
            "ping".to_string(),
            Some(serde_json::json!({"task": {"ttl": 60}})),
            RequestId::Number(1),
        );
        engine.clone().handle_request(transport, req).await;

        let sent = recording.sent_messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["error"]["code"], JsonRpcErrorCode::InvalidRequest.code());
    }

    #[tokio::test]
    async fn task_augmented_request_to_capable_method_is_promoted_and_completes() {
        let engine = task_engine();
        engine.install_task_handlers().unwrap();
        engine
            .set_request_handler(
                "tools/call",
                Arc::new(crate::handler::FnRequestHandler(|params, _extra| async move {
                    Ok(params.unwrap_or(Value::Null))
                })),
            )
            .unwrap();
        let recording = Arc::new(RecordingTransport::default());
        let transport: Arc<dyn Transport> = recording.clone();

        let req = JsonRpcRequest::new(
            "tools/call".to_string(),
            Some(serde_json::json!({"name": "echo", "task": {"ttl": 60}})),
            RequestId::Number(20),
        );
        engine.clone().handle_request(transport, req).await;

        let sent = recording.sent_messages();
        assert_eq!(sent.len(), 1);
        let task_id = sent[0]["result"]["taskId"].as_str().unwrap().to_string();
        assert!(!task_id.is_empty());

        // Give the spawned task handler a moment to complete and store its result.
        for _ in 0..50 {
            if engine
                .task_storage
                .as_ref()
                .unwrap()
                .get_task(&task_id, None)
                .map(|t| t.status == turbomcp_protocol::types::TaskStatus::Completed)
                .unwrap_or(false)
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let task = engine
            .task_storage
            .as_ref()
            .unwrap()
            .get_task(&task_id, None)
            .unwrap();
        assert_eq!(task.status, turbomcp_protocol::types::TaskStatus::Completed);
    }

    #[tokio::test]
    async fn install_task_handlers_registers_all_four_methods() {
        let engine = task_engine();
        engine.install_task_handlers().unwrap();
        let handlers = engine.request_handlers.read();
        for method in ["tasks/get", "tasks/result", "tasks/list", "tasks/cancel"] {
            assert!(handlers.contains_key(method), "missing handler for {method}");
        }
    }

    #[tokio::test]
    async fn new_engine_starts_disconnected() {
        let engine = ProtocolEngine::new(ServerConfig::default());
        assert_eq!(engine.state(), EngineState::Disconnected);
    }

    #[tokio::test]
    async fn request_fails_not_connected() {
        let engine = ProtocolEngine::new(ServerConfig::default());
        let result = engine.request("ping", None, RequestOptions::default()).await;
        assert!(result.is_err());
    }

    #[test]
    fn request_id_candidates_covers_numeric_and_string_forms() {
        let from_number = request_id_candidates(&serde_json::json!(11));
        assert!(from_number.contains(&RequestId::Number(11)));
        assert!(from_number.contains(&RequestId::String("11".to_string())));

        let from_string = request_id_candidates(&serde_json::json!("11"));
        assert!(from_string.contains(&RequestId::Number(11)));
        assert!(from_string.contains(&RequestId::String("11".to_string())));

        let from_opaque_string = request_id_candidates(&serde_json::json!("abc"));
        assert_eq!(from_opaque_string, vec![RequestId::String("abc".to_string())]);
    }

    #[tokio::test]
    async fn inbound_cancelled_notification_cancels_numeric_request_id() {
        let engine = Arc::new(ProtocolEngine::new(ServerConfig::default()));
        let token = CancellationToken::new();
        engine
            .inbound_cancel
            .lock()
            .insert(RequestId::Number(11), token.clone());

        let note = JsonRpcNotification::new(
            "notifications/cancelled".to_string(),
            Some(serde_json::json!({"requestId": 11})),
        );
        let transport: Arc<dyn Transport> = Arc::new(NoopTransport::default());
        engine.clone().handle_notification(transport, note).await;

        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn capability_gate_rejects_unsupported_sampling() {
        let engine = ProtocolEngine::new(ServerConfig::default());
        let err = engine.assert_capability("sampling/createMessage").unwrap_err();
        assert!(matches!(err, ServerError::CapabilityNotSupported(_)));
    }

    #[tokio::test]
    async fn capability_gate_allows_unrestricted_methods() {
        let engine = ProtocolEngine::new(ServerConfig::default());
        assert!(engine.assert_capability("tools/call").is_ok());
    }

    #[tokio::test]
    async fn capability_gate_honors_elicitation_flag() {
        let engine = ProtocolEngine::new(ServerConfig::default());
        assert!(engine.assert_capability("elicitation/create").is_err());

        *engine.client_capabilities.write() = Some(ClientCapabilities {
            elicitation: true,
            ..ClientCapabilities::default()
        });
        assert!(engine.assert_capability("elicitation/create").is_ok());
    }

    #[test]
    fn error_hook_receives_parse_failures() {
        let engine = ProtocolEngine::new(ServerConfig::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        engine.set_error_hook(Arc::new(move |err| seen_clone.lock().push(err.to_string())));
        engine.report_error(EngineError::Parse("unexpected end of input".to_string()));
        assert_eq!(seen.lock().len(), 1);
        assert!(seen.lock()[0].contains("unexpected end of input"));
    }

    #[test]
    fn internal_error_transform_rewrites_message_not_code() {
        let engine = ProtocolEngine::new(ServerConfig::default());
        engine.set_internal_error_transform(Arc::new(|_message, _data| {
            ("redacted".to_string(), Some(serde_json::json!({"hint": "contact support"})))
        }));
        let transform = engine.internal_error_transform.read();
        let (message, data) = transform.as_ref().unwrap()("raw db error: password=hunter2", None);
        assert_eq!(message, "redacted");
        assert_eq!(data, Some(serde_json::json!({"hint": "contact support"})));
    }
}
