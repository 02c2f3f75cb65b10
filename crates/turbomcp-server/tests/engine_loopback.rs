//! End-to-end test of two `ProtocolEngine`s talking over an in-memory
//! duplex transport: request/response correlation, notification delivery
//! and capability-gated sends, all without any real socket or pipe.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex as SyncMutex;
use serde_json::{Value, json};
use tokio::sync::mpsc;

use turbomcp_protocol::MessageId;
use turbomcp_protocol::jsonrpc::utils;
use turbomcp_server::config::ServerConfig;
use turbomcp_server::engine::{ProtocolEngine, RequestOptions};
use turbomcp_server::handler::{FnRequestHandler, HandlerExtra};
use turbomcp_transport_traits::{
    Transport, TransportCapabilities, TransportMessage, TransportMetrics, TransportResult,
    TransportState, TransportType,
};

/// One end of an in-memory duplex pipe; the peer end's `tx` feeds this end's
/// `rx`. Used to exercise the engine's dispatch loop without stdio or HTTP.
#[derive(Debug)]
struct DuplexTransport {
    state: SyncMutex<TransportState>,
    capabilities: TransportCapabilities,
    outbound: mpsc::UnboundedSender<Bytes>,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
    sent: AtomicU64,
}

impl DuplexTransport {
    fn pair() -> (Arc<Self>, Arc<Self>) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let a = Arc::new(Self {
            state: SyncMutex::new(TransportState::Disconnected),
            capabilities: TransportCapabilities::default(),
            outbound: b_tx,
            inbound: tokio::sync::Mutex::new(a_rx),
            sent: AtomicU64::new(0),
        });
        let b = Arc::new(Self {
            state: SyncMutex::new(TransportState::Disconnected),
            capabilities: TransportCapabilities::default(),
            outbound: a_tx,
            inbound: tokio::sync::Mutex::new(b_rx),
            sent: AtomicU64::new(0),
        });
        (a, b)
    }
}

#[async_trait]
impl Transport for DuplexTransport {
    fn transport_type(&self) -> TransportType {
        TransportType::Stdio
    }

    fn capabilities(&self) -> &TransportCapabilities {
        &self.capabilities
    }

    async fn state(&self) -> TransportState {
        self.state.lock().clone()
    }

    async fn connect(&self) -> TransportResult<()> {
        *self.state.lock() = TransportState::Connected;
        Ok(())
    }

    async fn disconnect(&self) -> TransportResult<()> {
        *self.state.lock() = TransportState::Disconnected;
        Ok(())
    }

    async fn send(&self, message: TransportMessage) -> TransportResult<()> {
        self.sent.fetch_add(1, Ordering::Relaxed);
        let _ = self.outbound.send(message.payload);
        Ok(())
    }

    async fn receive(&self) -> TransportResult<Option<TransportMessage>> {
        let mut rx = self.inbound.lock().await;
        match rx.recv().await {
            Some(bytes) => Ok(Some(TransportMessage::new(
                MessageId::Number(0),
                bytes,
            ))),
            None => Ok(None),
        }
    }

    async fn metrics(&self) -> TransportMetrics {
        TransportMetrics::default()
    }
}

async fn connected_pair() -> (Arc<ProtocolEngine>, Arc<ProtocolEngine>) {
    let (transport_a, transport_b) = DuplexTransport::pair();
    let server = Arc::new(ProtocolEngine::new(ServerConfig::default()));
    let client = Arc::new(ProtocolEngine::new(ServerConfig::default()));

    server
        .set_request_handler(
            "echo",
            Arc::new(FnRequestHandler(
                |params: Option<Value>, _extra: HandlerExtra| async move {
                    Ok(params.unwrap_or(Value::Null))
                },
            )),
        )
        .unwrap();

    server.connect(transport_a as Arc<dyn Transport>).await.unwrap();
    client.connect(transport_b as Arc<dyn Transport>).await.unwrap();

    (server, client)
}

#[tokio::test]
async fn request_round_trips_through_duplex_transport() {
    let (_server, client) = connected_pair().await;

    let result = client
        .request("echo", Some(json!({"value": 42})), RequestOptions::default())
        .await
        .expect("echo request should succeed");

    assert_eq!(result, json!({"value": 42}));
}

#[tokio::test]
async fn unknown_method_returns_method_not_found() {
    let (_server, client) = connected_pair().await;

    let err = client
        .request("nonexistent/method", None, RequestOptions::default())
        .await
        .unwrap_err();

    // The peer's error should propagate back as a server error carrying the
    // reserved JSON-RPC "method not found" code.
    assert_eq!(err.jsonrpc_code(), -32601);
}

#[tokio::test]
async fn notification_reaches_registered_handler() {
    let (server, client) = connected_pair().await;

    let received: Arc<DashMap<String, Value>> = Arc::new(DashMap::new());
    let received2 = received.clone();
    server
        .set_notification_handler(
            "notifications/custom",
            Arc::new(turbomcp_server::handler::FnNotificationHandler(
                move |params: Option<Value>, _extra: HandlerExtra| {
                    let received = received2.clone();
                    async move {
                        received.insert("custom".to_string(), params.unwrap_or(Value::Null));
                    }
                },
            )),
        )
        .unwrap();

    client
        .notify("notifications/custom", Some(json!({"n": 1})))
        .await
        .unwrap();

    // Notifications are fire-and-forget; give the server's dispatch loop a
    // moment to process before asserting.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    assert_eq!(
        received.get("custom").map(|v| v.clone()),
        Some(json!({"n": 1}))
    );
}

#[tokio::test]
async fn close_rejects_outstanding_requests() {
    let (server, client) = connected_pair().await;
    server
        .set_request_handler(
            "stall",
            Arc::new(FnRequestHandler(
                |_params: Option<Value>, _extra: HandlerExtra| async move {
                    std::future::pending::<turbomcp_server::handler::HandlerResult>().await
                },
            )),
        )
        .unwrap();

    let waiting_client = client.clone();
    let request_task = tokio::spawn(async move {
        waiting_client
            .request("stall", None, RequestOptions::default())
            .await
    });

    // Give the request time to land in `outstanding` before closing.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    client.close().await;

    let err = request_task
        .await
        .expect("request task should not panic")
        .unwrap_err();
    assert_eq!(err.jsonrpc_code(), -32000);
}

#[test]
fn parse_message_round_trips_request_text() {
    let raw = r#"{"jsonrpc":"2.0","id":1,"method":"ping","params":null}"#;
    let message = utils::parse_message(raw).expect("valid JSON-RPC request parses");
    let text = utils::serialize_message(&message).expect("message serializes back");
    let reparsed = utils::parse_message(&text).expect("re-parses");
    assert_eq!(
        serde_json::to_value(&message).unwrap(),
        serde_json::to_value(&reparsed).unwrap()
    );
}

