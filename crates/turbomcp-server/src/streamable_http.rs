//! Streamable HTTP transport: one [`HttpTransport`]/[`ProtocolEngine`] pair per
//! MCP session, fronted by an axum router implementing the MCP 2025-11-25
//! Streamable HTTP transport (`POST`/`GET`/`DELETE` on a single `/mcp` endpoint).
//!
//! [`Transport`] models one continuous connection, which fits stdio's single
//! stream but not HTTP's per-request/session-multiplexed shape. The
//! resolution here is architectural: [`SessionManager`] owns one
//! [`ProtocolEngine`] + [`HttpTransport`] per session, and [`HttpTransport`]
//! implements [`Transport::send_correlated`] as a routing hook - outbound
//! messages tagged with the request id they answer are delivered to that
//! request's live POST stream; everything else is persisted to the session's
//! event log and, if a standalone GET stream is attached, forwarded there too.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{Router, post};
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use tokio::sync::{Mutex as TokioMutex, mpsc};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tower_http::cors::{Any, CorsLayer};
use tracing::warn;

use turbomcp_protocol::jsonrpc::{JsonRpcMessage, utils};
use turbomcp_transport_streamable::headers as mcp_headers;
use turbomcp_transport_streamable::session::{Session, SessionId, SessionStore, StoredEvent};
use turbomcp_transport_streamable::sse::generate_event_id;
use turbomcp_transport_streamable::{StreamableConfig, StreamableError};
use turbomcp_transport_traits::{
    AtomicMetrics, Transport, TransportCapabilities, TransportError, TransportMessage,
    TransportMetrics, TransportResult, TransportState, TransportType,
};

use crate::config::ServerConfig;
use crate::engine::ProtocolEngine;
use crate::error::ServerError;

const SESSION_ID_HEADER: &str = "mcp-session-id";
const LAST_EVENT_ID_HEADER: &str = "last-event-id";

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// In-process [`SessionStore`]: sessions and their replay logs live only as
/// long as the process does. A bound on `max_events_per_session` keeps a long
/// reconnect-heavy session from growing its event log without limit.
pub struct InMemorySessionStore {
    sessions: DashMap<SessionId, Session>,
    events: DashMap<SessionId, Vec<StoredEvent>>,
    max_events_per_session: usize,
}

impl fmt::Debug for InMemorySessionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemorySessionStore")
            .field("sessions", &self.sessions.len())
            .field("max_events_per_session", &self.max_events_per_session)
            .finish()
    }
}

impl InMemorySessionStore {
    /// Build a store bounding each session's replay log to `max_events_per_session`.
    #[must_use]
    pub fn new(max_events_per_session: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            events: DashMap::new(),
            max_events_per_session,
        }
    }
}

impl SessionStore for InMemorySessionStore {
    type Error = std::convert::Infallible;

    async fn create(&self) -> Result<SessionId, Self::Error> {
        let id = SessionId::new();
        self.sessions.insert(id.clone(), Session::new(id.clone()));
        Ok(id)
    }

    async fn get(&self, id: &SessionId) -> Result<Option<Session>, Self::Error> {
        Ok(self.sessions.get(id).map(|entry| entry.clone()))
    }

    async fn update(&self, session: &Session) -> Result<(), Self::Error> {
        self.sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn store_event(&self, id: &SessionId, event: StoredEvent) -> Result<(), Self::Error> {
        {
            let mut events = self.events.entry(id.clone()).or_default();
            events.push(event);
            if events.len() > self.max_events_per_session {
                let overflow = events.len() - self.max_events_per_session;
                events.drain(0..overflow);
            }
        }
        if let Some(mut session) = self.sessions.get_mut(id) {
            session.event_count += 1;
            session.touch();
        }
        Ok(())
    }

    async fn replay_from(
        &self,
        id: &SessionId,
        last_event_id: &str,
    ) -> Result<Vec<StoredEvent>, Self::Error> {
        let Some(events) = self.events.get(id) else {
            return Ok(Vec::new());
        };
        match events.iter().position(|e| e.id == last_event_id) {
            Some(idx) => Ok(events[idx + 1..].to_vec()),
            None => Ok(events.clone()),
        }
    }

    async fn destroy(&self, id: &SessionId) -> Result<(), Self::Error> {
        self.sessions.remove(id);
        self.events.remove(id);
        Ok(())
    }

    async fn cleanup_expired(&self, timeout_ms: u64) -> Result<u64, Self::Error> {
        let now = now_ms();
        let expired: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().is_expired(now, timeout_ms))
            .map(|entry| entry.key().clone())
            .collect();
        for id in &expired {
            self.sessions.remove(id);
            self.events.remove(id);
        }
        Ok(expired.len() as u64)
    }
}

/// Per-session [`Transport`]. Multiplexes one logical connection's worth of
/// inbound POST bodies into `receive()`, and routes outbound messages by
/// request-id correlation (see module docs) instead of writing to one stream.
pub struct HttpTransport {
    session_id: SessionId,
    store: Arc<InMemorySessionStore>,
    state: Arc<StdMutex<TransportState>>,
    capabilities: TransportCapabilities,
    metrics: Arc<AtomicMetrics>,
    inbound_tx: mpsc::UnboundedSender<TransportMessage>,
    inbound_rx: TokioMutex<mpsc::UnboundedReceiver<TransportMessage>>,
    routes: DashMap<String, mpsc::UnboundedSender<Bytes>>,
    standalone: TokioMutex<Option<mpsc::UnboundedSender<(String, Bytes)>>>,
    event_seq: AtomicU64,
}

impl fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTransport")
            .field("session_id", &self.session_id)
            .field("state", &self.state)
            .field("metrics", &self.metrics)
            .field("routes", &self.routes.len())
            .finish()
    }
}

impl HttpTransport {
    /// Build a transport bound to `session_id`, backed by `store` for
    /// persistence/replay of messages it cannot deliver live.
    #[must_use]
    pub fn new(session_id: SessionId, store: Arc<InMemorySessionStore>) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            session_id,
            store,
            state: Arc::new(StdMutex::new(TransportState::Disconnected)),
            capabilities: TransportCapabilities {
                max_message_size: Some(turbomcp_protocol::MAX_MESSAGE_SIZE),
                supports_compression: false,
                supports_streaming: true,
                supports_bidirectional: true,
                supports_multiplexing: true,
                compression_algorithms: Vec::new(),
                custom: std::collections::HashMap::new(),
            },
            metrics: Arc::new(AtomicMetrics::default()),
            inbound_tx,
            inbound_rx: TokioMutex::new(inbound_rx),
            routes: DashMap::new(),
            standalone: TokioMutex::new(None),
            event_seq: AtomicU64::new(0),
        }
    }

    /// Hand an inbound POST body to the dispatch loop, framed as a single
    /// [`TransportMessage`]. The engine parses and routes it from there.
    pub fn feed(&self, payload: Bytes) -> TransportResult<()> {
        let message = TransportMessage::new(
            turbomcp_protocol::MessageId::String(uuid::Uuid::new_v4().to_string()),
            payload,
        );
        self.inbound_tx
            .send(message)
            .map_err(|_| TransportError::ConnectionLost("inbound channel closed".to_string()))
    }

    /// Register the live channel that a correlated response/notification for
    /// `request_id` should be written to, for the lifetime of one POST.
    pub fn register_route(&self, request_id: String, sink: mpsc::UnboundedSender<Bytes>) {
        self.routes.insert(request_id, sink);
    }

    /// Stop forwarding to `request_id`'s route once its POST has responded.
    pub fn remove_route(&self, request_id: &str) {
        self.routes.remove(request_id);
    }

    /// Attach (or detach, with `None`) the standalone GET stream's sink.
    /// A new attachment supersedes and drops any previous one, which ends
    /// that stream's polling loop on its next send attempt.
    pub async fn set_standalone(&self, sink: Option<mpsc::UnboundedSender<(String, Bytes)>>) {
        *self.standalone.lock().await = sink;
    }

    async fn deliver_uncorrelated(&self, payload: Bytes) -> TransportResult<()> {
        let seq = self.event_seq.fetch_add(1, Ordering::Relaxed);
        let event_id = generate_event_id(seq);
        let text = String::from_utf8_lossy(&payload).into_owned();
        let event = StoredEvent::new_with_timestamp(event_id.clone(), text, now_ms())
            .with_event_type("message");
        let _ = self.store.store_event(&self.session_id, event).await;

        let standalone = self.standalone.lock().await;
        if let Some(tx) = standalone.as_ref() {
            let _ = tx.send((event_id, payload));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn transport_type(&self) -> TransportType {
        TransportType::Http
    }

    fn capabilities(&self) -> &TransportCapabilities {
        &self.capabilities
    }

    async fn state(&self) -> TransportState {
        self.state.lock().expect("state mutex poisoned").clone()
    }

    async fn connect(&self) -> TransportResult<()> {
        *self.state.lock().expect("state mutex poisoned") = TransportState::Connected;
        self.metrics.connections.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn disconnect(&self) -> TransportResult<()> {
        *self.state.lock().expect("state mutex poisoned") = TransportState::Disconnected;
        self.routes.clear();
        *self.standalone.lock().await = None;
        Ok(())
    }

    async fn send(&self, message: TransportMessage) -> TransportResult<()> {
        self.metrics.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .bytes_sent
            .fetch_add(message.payload.len() as u64, Ordering::Relaxed);
        self.deliver_uncorrelated(message.payload).await
    }

    async fn receive(&self) -> TransportResult<Option<TransportMessage>> {
        let mut rx = self.inbound_rx.lock().await;
        match rx.recv().await {
            Some(message) => {
                self.metrics.messages_received.fetch_add(1, Ordering::Relaxed);
                self.metrics
                    .bytes_received
                    .fetch_add(message.payload.len() as u64, Ordering::Relaxed);
                Ok(Some(message))
            }
            None => Err(TransportError::ReceiveFailed(
                "inbound channel closed".to_string(),
            )),
        }
    }

    async fn metrics(&self) -> TransportMetrics {
        self.metrics.snapshot()
    }

    fn endpoint(&self) -> Option<String> {
        Some(format!("http+session://{}", self.session_id))
    }

    fn send_correlated<'a>(
        &'a self,
        request_id: &'a str,
        message: TransportMessage,
    ) -> Pin<Box<dyn std::future::Future<Output = TransportResult<()>> + Send + 'a>> {
        Box::pin(async move {
            self.metrics.messages_sent.fetch_add(1, Ordering::Relaxed);
            self.metrics
                .bytes_sent
                .fetch_add(message.payload.len() as u64, Ordering::Relaxed);
            if let Some(route) = self.routes.get(request_id) {
                let _ = route.send(message.payload.clone());
                return Ok(());
            }
            self.deliver_uncorrelated(message.payload).await
        })
    }
}

struct HttpSession {
    engine: Arc<ProtocolEngine>,
    transport: Arc<HttpTransport>,
}

/// Owns every live [`HttpSession`] and knows how to build a fresh one:
/// create its id, wire up a [`HttpTransport`], install handlers via `install`,
/// and connect the engine. `install` is supplied by whoever is assembling the
/// server, and typically registers tool/prompt/resource/task handlers.
pub struct SessionManager {
    store: Arc<InMemorySessionStore>,
    config: StreamableConfig,
    server_config: ServerConfig,
    sessions: DashMap<SessionId, Arc<HttpSession>>,
    install: Arc<dyn Fn(&Arc<ProtocolEngine>) + Send + Sync>,
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("sessions", &self.sessions.len())
            .field("config", &self.config)
            .finish()
    }
}

impl SessionManager {
    /// Build a manager backed by `store`, applying `server_config` to every
    /// session's engine and `install` to register its handlers before connect.
    #[must_use]
    pub fn new(
        store: Arc<InMemorySessionStore>,
        config: StreamableConfig,
        server_config: ServerConfig,
        install: Arc<dyn Fn(&Arc<ProtocolEngine>) + Send + Sync>,
    ) -> Self {
        Self {
            store,
            config,
            server_config,
            sessions: DashMap::new(),
            install,
        }
    }

    async fn create_session(&self) -> Result<SessionId, ServerError> {
        let id = self
            .store
            .create()
            .await
            .unwrap_or_else(|never| match never {});
        let transport = Arc::new(HttpTransport::new(id.clone(), self.store.clone()));
        let engine = Arc::new(
            ProtocolEngine::new(self.server_config.clone()).with_session_id(id.as_str()),
        );
        (self.install)(&engine);
        engine.connect(transport.clone() as Arc<dyn Transport>).await?;
        self.sessions
            .insert(id.clone(), Arc::new(HttpSession { engine, transport }));
        Ok(id)
    }

    fn session(&self, id: &SessionId) -> Option<Arc<HttpSession>> {
        self.sessions.get(id).map(|entry| entry.clone())
    }

    fn has_session(&self, id: &SessionId) -> bool {
        self.sessions.contains_key(id)
    }

    async fn terminate_session(&self, id: &SessionId) -> bool {
        let Some((_, session)) = self.sessions.remove(id) else {
            return false;
        };
        session.engine.close().await;
        let _ = self.store.destroy(id).await;
        true
    }

    /// Periodically evict sessions idle longer than `StreamableConfig::idle_timeout_ms`.
    pub fn start_cleanup(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        let interval = Duration::from_millis(manager.config.idle_timeout_ms.max(1_000));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let expired = manager
                    .store
                    .cleanup_expired(manager.config.idle_timeout_ms)
                    .await
                    .unwrap_or_else(|never| match never {});
                if expired > 0 {
                    warn!(count = expired, "evicted idle Streamable HTTP sessions");
                }
                let tracked: Vec<SessionId> = manager
                    .sessions
                    .iter()
                    .map(|entry| entry.key().clone())
                    .collect();
                for id in tracked {
                    let still_stored = manager.store.get(&id).await.ok().flatten().is_some();
                    if !still_stored {
                        manager.terminate_session(&id).await;
                    }
                }
            }
        })
    }
}

/// JSON-RPC error code for a request that names an unknown or expired
/// session, mirroring `JsonRpcErrorCode::ServerError` (`-32000`).
const SESSION_ERROR_CODE: i32 = -32000;

fn streamable_error_response(error: StreamableError) -> Response {
    if matches!(
        error,
        StreamableError::SessionNotFound(_) | StreamableError::SessionExpired(_)
    ) {
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "error": { "code": SESSION_ERROR_CODE, "message": error.to_string() },
            "id": null,
        });
        return (StatusCode::NOT_FOUND, axum::Json(body)).into_response();
    }

    let status = match &error {
        StreamableError::SessionNotFound(_) | StreamableError::SessionExpired(_) => {
            unreachable!("handled above")
        }
        StreamableError::SessionTerminated(_) => StatusCode::GONE,
        StreamableError::InvalidMethod(_) => StatusCode::METHOD_NOT_ALLOWED,
        StreamableError::InvalidOrigin(_) | StreamableError::MissingOrigin => {
            StatusCode::FORBIDDEN
        }
        StreamableError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        StreamableError::BodyTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        StreamableError::TooManyStreams { .. } => StatusCode::TOO_MANY_REQUESTS,
        StreamableError::StorageError(_) | StreamableError::InternalError(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, error.to_string()).into_response()
}

fn message_is_initialize(message: &JsonRpcMessage) -> bool {
    match message {
        JsonRpcMessage::Request(req) => req.method == "initialize",
        JsonRpcMessage::RequestBatch(batch) => batch.items.iter().any(|r| r.method == "initialize"),
        _ => false,
    }
}

fn collect_request_ids(message: &JsonRpcMessage) -> Vec<String> {
    match message {
        JsonRpcMessage::Request(req) => vec![req.id.as_display()],
        JsonRpcMessage::RequestBatch(batch) => batch.items.iter().map(|r| r.id.as_display()).collect(),
        JsonRpcMessage::MessageBatch(batch) => {
            batch.items.iter().flat_map(collect_request_ids).collect()
        }
        _ => Vec::new(),
    }
}

/// Distinguishes a terminal response's id from a notification: responses
/// never carry `method`, notifications/requests always do.
fn response_id_string(value: &Value) -> Option<String> {
    if value.get("method").is_some() {
        return None;
    }
    match value.get("id") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

/// Drops a POST's routes out of the transport's routing table once the
/// response is fully assembled (or the client disconnects mid-stream).
struct RouteGuard {
    transport: Arc<HttpTransport>,
    ids: Vec<String>,
}

impl Drop for RouteGuard {
    fn drop(&mut self) {
        for id in &self.ids {
            self.transport.remove_route(id);
        }
    }
}

async fn handle_post(
    State(manager): State<Arc<SessionManager>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Ok(text) = std::str::from_utf8(&body) else {
        return streamable_error_response(StreamableError::InvalidRequest(
            "body is not valid UTF-8".to_string(),
        ));
    };

    let parsed = match utils::parse_message(text) {
        Ok(message) => message,
        Err(err) => {
            return streamable_error_response(StreamableError::InvalidRequest(err.to_string()));
        }
    };

    let header_session_id = headers
        .get(SESSION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let session_id = if message_is_initialize(&parsed) {
        if header_session_id.is_some() {
            return streamable_error_response(StreamableError::InvalidRequest(
                "initialize must not be sent with an existing Mcp-Session-Id".to_string(),
            ));
        }
        match manager.create_session().await {
            Ok(id) => id,
            Err(err) => {
                return streamable_error_response(StreamableError::InternalError(err.to_string()));
            }
        }
    } else {
        let Some(raw) = header_session_id else {
            return streamable_error_response(StreamableError::InvalidRequest(
                "missing Mcp-Session-Id header".to_string(),
            ));
        };
        let id = SessionId::from(raw);
        if !manager.has_session(&id) {
            return streamable_error_response(StreamableError::SessionNotFound(id.into_string()));
        }
        id
    };

    let Some(session) = manager.session(&session_id) else {
        return streamable_error_response(StreamableError::SessionNotFound(session_id.into_string()));
    };

    let request_ids = collect_request_ids(&parsed);

    if let Err(err) = session.transport.feed(body) {
        return streamable_error_response(StreamableError::InternalError(err.to_string()));
    }

    if request_ids.is_empty() {
        // Notifications/responses only: no reply is expected.
        let mut response = StatusCode::ACCEPTED.into_response();
        if let Ok(value) = HeaderValue::from_str(session_id.as_str()) {
            response
                .headers_mut()
                .insert(HeaderName::from_static(SESSION_ID_HEADER), value);
        }
        return response;
    }

    let wants_sse = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|accept| accept.contains(mcp_headers::ACCEPT_SSE));

    let (tx, rx) = mpsc::unbounded_channel::<Bytes>();
    for id in &request_ids {
        session.transport.register_route(id.clone(), tx.clone());
    }
    drop(tx);

    if wants_sse {
        sse_collect_response(session.transport.clone(), request_ids, rx, &session_id)
    } else {
        json_collect_response(session.transport.clone(), request_ids, rx, &session_id).await
    }
}

async fn json_collect_response(
    transport: Arc<HttpTransport>,
    request_ids: Vec<String>,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    session_id: &SessionId,
) -> Response {
    let _guard = RouteGuard {
        transport,
        ids: request_ids.clone(),
    };
    let mut pending: HashSet<String> = request_ids.iter().cloned().collect();
    let mut results: HashMap<String, Value> = HashMap::new();

    while !pending.is_empty() {
        let Some(bytes) = rx.recv().await else { break };
        let Ok(value) = serde_json::from_slice::<Value>(&bytes) else {
            continue;
        };
        if let Some(id) = response_id_string(&value) {
            if pending.remove(&id) {
                results.insert(id, value);
            }
        }
    }

    let ordered: Vec<Value> = request_ids
        .iter()
        .filter_map(|id| results.remove(id))
        .collect();
    let body = if ordered.len() == 1 {
        ordered.into_iter().next().unwrap_or(Value::Null)
    } else {
        Value::Array(ordered)
    };
    let payload = serde_json::to_string(&body).unwrap_or_else(|_| "null".to_string());

    let mut response = (StatusCode::OK, payload).into_response();
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(mcp_headers::CONTENT_TYPE_JSON),
    );
    if let Ok(value) = HeaderValue::from_str(session_id.as_str()) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(SESSION_ID_HEADER), value);
    }
    response
}

fn sse_collect_response(
    transport: Arc<HttpTransport>,
    request_ids: Vec<String>,
    rx: mpsc::UnboundedReceiver<Bytes>,
    session_id: &SessionId,
) -> Response {
    let pending: HashSet<String> = request_ids.iter().cloned().collect();
    let guard = RouteGuard {
        transport,
        ids: request_ids,
    };
    let counter = AtomicU64::new(0);
    let state = (rx, pending, counter, guard);

    let stream = stream::unfold(state, move |(mut rx, mut pending, counter, guard)| async move {
        if pending.is_empty() {
            return None;
        }
        let bytes = rx.recv().await?;
        if let Ok(value) = serde_json::from_slice::<Value>(&bytes) {
            if let Some(id) = response_id_string(&value) {
                pending.remove(&id);
            }
        }
        let n = counter.fetch_add(1, Ordering::Relaxed);
        let text = String::from_utf8_lossy(&bytes).into_owned();
        let event = Event::default().id(format!("post-{n}")).data(text);
        Some((Ok::<_, std::convert::Infallible>(event), (rx, pending, counter, guard)))
    });

    let mut response = Sse::new(stream)
        .keep_alive(KeepAlive::new())
        .into_response();
    if let Ok(value) = HeaderValue::from_str(session_id.as_str()) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(SESSION_ID_HEADER), value);
    }
    response
}

async fn handle_get(State(manager): State<Arc<SessionManager>>, headers: HeaderMap) -> Response {
    let Some(raw) = headers
        .get(SESSION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
    else {
        return streamable_error_response(StreamableError::InvalidRequest(
            "missing Mcp-Session-Id header".to_string(),
        ));
    };
    let session_id = SessionId::from(raw);
    let Some(session) = manager.session(&session_id) else {
        return streamable_error_response(StreamableError::SessionNotFound(session_id.into_string()));
    };

    let last_event_id = headers
        .get(LAST_EVENT_ID_HEADER)
        .and_then(|v| v.to_str().ok());
    let replay: Vec<StoredEvent> = if let Some(last_id) = last_event_id {
        manager
            .store
            .replay_from(&session_id, last_id)
            .await
            .unwrap_or_else(|never| match never {})
    } else {
        Vec::new()
    };

    let (tx, rx) = mpsc::unbounded_channel::<(String, Bytes)>();
    session.transport.set_standalone(Some(tx)).await;

    let replay_stream = stream::iter(replay.into_iter().map(|event| {
        Ok::<_, std::convert::Infallible>(Event::default().id(event.id).data(event.data))
    }));
    let live_stream = UnboundedReceiverStream::new(rx).map(|(id, bytes)| {
        Ok::<_, std::convert::Infallible>(
            Event::default().id(id).data(String::from_utf8_lossy(&bytes).into_owned()),
        )
    });

    let stream = replay_stream.chain(live_stream);
    Sse::new(stream)
        .keep_alive(
            KeepAlive::new()
                .interval(Duration::from_millis(manager.config.keepalive_interval_ms)),
        )
        .into_response()
}

async fn handle_delete(State(manager): State<Arc<SessionManager>>, headers: HeaderMap) -> Response {
    let Some(raw) = headers
        .get(SESSION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
    else {
        return streamable_error_response(StreamableError::InvalidRequest(
            "missing Mcp-Session-Id header".to_string(),
        ));
    };
    let session_id = SessionId::from(raw);
    if manager.terminate_session(&session_id).await {
        StatusCode::OK.into_response()
    } else {
        streamable_error_response(StreamableError::SessionNotFound(session_id.into_string()))
    }
}

/// Build the `/mcp` router: `POST` accepts a JSON-RPC body, `GET` opens the
/// standalone SSE stream, `DELETE` terminates the session. CORS preflight
/// (`OPTIONS`) is handled by [`CorsLayer`].
#[must_use]
pub fn router(manager: Arc<SessionManager>) -> Router {
    let max_body_size = manager.config.max_body_size;
    Router::new()
        .route("/mcp", post(handle_post).get(handle_get).delete(handle_delete))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
                .allow_headers(Any),
        )
        .layer(DefaultBodyLimit::max(max_body_size))
        .with_state(manager)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> Arc<InMemorySessionStore> {
        Arc::new(InMemorySessionStore::new(16))
    }

    #[tokio::test]
    async fn session_store_roundtrips_events() {
        let store = store();
        let id = store.create().await.unwrap_or_else(|never| match never {});
        store
            .store_event(&id, StoredEvent::new_with_timestamp("1", "a", 1))
            .await
            .unwrap();
        store
            .store_event(&id, StoredEvent::new_with_timestamp("2", "b", 2))
            .await
            .unwrap();

        let replay = store.replay_from(&id, "1").await.unwrap();
        assert_eq!(replay.len(), 1);
        assert_eq!(replay[0].id, "2");

        let all = store.replay_from(&id, "does-not-exist").await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn session_store_bounds_event_log() {
        let store = InMemorySessionStore::new(2);
        let id = store.create().await.unwrap_or_else(|never| match never {});
        for i in 0..5 {
            store
                .store_event(&id, StoredEvent::new_with_timestamp(i.to_string(), "x", i))
                .await
                .unwrap();
        }
        let all = store.replay_from(&id, "does-not-exist").await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, "3");
        assert_eq!(all[1].id, "4");
    }

    #[tokio::test]
    async fn session_store_destroy_clears_events() {
        let store = store();
        let id = store.create().await.unwrap_or_else(|never| match never {});
        store
            .store_event(&id, StoredEvent::new_with_timestamp("1", "a", 1))
            .await
            .unwrap();
        store.destroy(&id).await.unwrap();
        assert!(store.get(&id).await.unwrap().is_none());
        assert!(store.replay_from(&id, "0").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn transport_send_correlated_routes_to_live_request() {
        let transport = HttpTransport::new(SessionId::from("sess-1"), store());
        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.register_route("42".to_string(), tx);

        let message = TransportMessage::new(
            turbomcp_protocol::MessageId::String("m1".to_string()),
            Bytes::from_static(b"{\"jsonrpc\":\"2.0\",\"id\":42,\"result\":{}}"),
        );
        transport.send_correlated("42", message).await.unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(&received[..], b"{\"jsonrpc\":\"2.0\",\"id\":42,\"result\":{}}");
    }

    #[tokio::test]
    async fn transport_send_correlated_falls_back_to_session_log() {
        let backing_store = store();
        let transport = HttpTransport::new(SessionId::from("sess-2"), backing_store.clone());

        let message = TransportMessage::new(
            turbomcp_protocol::MessageId::String("m1".to_string()),
            Bytes::from_static(b"{\"jsonrpc\":\"2.0\",\"method\":\"notifications/ping\"}"),
        );
        transport
            .send_correlated("no-such-route", message)
            .await
            .unwrap();

        let replayed = backing_store
            .replay_from(&SessionId::from("sess-2"), "does-not-exist")
            .await
            .unwrap();
        assert_eq!(replayed.len(), 1);
    }

    #[tokio::test]
    async fn transport_feed_is_observable_via_receive() {
        let transport = HttpTransport::new(SessionId::from("sess-3"), store());
        transport.feed(Bytes::from_static(b"{}")).unwrap();
        let message = transport.receive().await.unwrap().unwrap();
        assert_eq!(&message.payload[..], b"{}");
    }

    #[test]
    fn response_id_string_ignores_notifications() {
        let notification = serde_json::json!({"jsonrpc": "2.0", "method": "notifications/progress"});
        assert_eq!(response_id_string(&notification), None);

        let response = serde_json::json!({"jsonrpc": "2.0", "id": 7, "result": {}});
        assert_eq!(response_id_string(&response), Some("7".to_string()));
    }

    #[test]
    fn message_is_initialize_detects_request() {
        let parsed = utils::parse_message(
            r#"{"jsonrpc":"2.0","method":"initialize","params":{},"id":1}"#,
        )
        .unwrap();
        assert!(message_is_initialize(&parsed));
    }

    #[tokio::test]
    async fn unknown_session_response_is_a_jsonrpc_envelope() {
        let response = streamable_error_response(StreamableError::SessionNotFound(
            "sess-missing".to_string(),
        ));
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["jsonrpc"], "2.0");
        assert_eq!(json["error"]["code"], SESSION_ERROR_CODE);
        assert!(json["id"].is_null());
    }
}
