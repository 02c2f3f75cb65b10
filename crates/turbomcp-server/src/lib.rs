//! # TurboMCP Server
//!
//! The MCP (Model Context Protocol) protocol engine, Streamable HTTP
//! transport and task store.
//!
//! ## Architecture
//!
//! - [`engine::ProtocolEngine`] - transport-agnostic JSON-RPC 2.0 engine:
//!   capability negotiation, request/response correlation, progress and
//!   cancellation, and task-augmented request admission (SEP-1686).
//! - [`streamable_http`] - the Streamable HTTP transport: one
//!   [`streamable_http::HttpTransport`]/[`engine::ProtocolEngine`] pair per
//!   session, managed by [`streamable_http::SessionManager`] and fronted by
//!   an axum router (`POST`/`GET`/`DELETE` on `/mcp`).
//! - [`task_storage`] - the task store backing long-running requests:
//!   TTL-bounded state, a bounded per-task message queue, and the
//!   `tasks/get`, `tasks/result`, `tasks/list`, `tasks/cancel` handlers.
//! - [`handler`] - the [`handler::RequestHandler`]/[`handler::NotificationHandler`]
//!   interface method registries implement against.
//! - [`config`] - [`config::ServerConfig`]: protocol negotiation, timeouts,
//!   required capabilities and message size limits.
//! - [`error`] - [`error::ServerError`] and the shared [`error::McpError`]
//!   currency for anything that crosses the JSON-RPC wire.
//!
//! Engines are transport-agnostic: [`turbomcp_stdio::StdioTransport`] and
//! [`streamable_http::HttpTransport`] both implement
//! [`turbomcp_transport_traits::Transport`], and an engine drives either one
//! identically via `connect()`.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use turbomcp_server::config::ServerConfig;
//! use turbomcp_server::engine::ProtocolEngine;
//! use turbomcp_stdio::StdioTransport;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = Arc::new(ProtocolEngine::new(ServerConfig::default()));
//!     let transport = Arc::new(StdioTransport::new());
//!     engine.connect(transport).await?;
//!     Ok(())
//! }
//! ```

#![deny(missing_docs)]
#![warn(missing_debug_implementations)]
#![warn(clippy::all)]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::must_use_candidate,
    clippy::return_self_not_must_use,
    clippy::struct_excessive_bools,
    clippy::missing_panics_doc,
    clippy::default_trait_access
)]

/// Server name
pub const SERVER_NAME: &str = "turbomcp-server";
/// Server version
pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod config;
pub mod engine;
pub mod error;
pub mod handler;
pub mod streamable_http;
pub mod task_storage;

pub use config::{
    CapabilityValidation, ClientCapabilities, ProtocolConfig, RequiredCapabilities, ServerConfig,
    ServerConfigBuilder, TimeoutConfig,
};
pub use engine::{EngineError, EngineState, ErrorHook, InternalErrorTransform, ProtocolEngine, RequestOptions};
pub use error::{ErrorKind, McpError, McpResult, ServerError, ServerErrorExt, ServerResult};
pub use handler::{
    FnNotificationHandler, FnRequestHandler, HandlerError, HandlerExtra, HandlerResult,
    NotificationHandler, RequestHandler,
};
pub use streamable_http::{HttpTransport, InMemorySessionStore, SessionManager};
pub use task_storage::{
    TaskQueue, TaskResultState, TaskStorage, TasksCancelHandler, TasksGetHandler,
    TasksListHandler, TasksResultHandler,
};

// Re-export protocol types consumers need when registering handlers.
pub use turbomcp_protocol::jsonrpc::{
    JsonRpcError, JsonRpcRequest, JsonRpcResponse, JsonRpcVersion,
};
pub use turbomcp_protocol::MessageId;

/// Default server configuration.
#[must_use]
pub fn default_config() -> ServerConfig {
    ServerConfig::default()
}

/// Prelude for common server functionality.
pub mod prelude {
    pub use crate::{
        ClientCapabilities, EngineState, FnNotificationHandler, FnRequestHandler, HandlerError,
        HandlerExtra, HandlerResult, HttpTransport, InMemorySessionStore, McpError, McpResult,
        NotificationHandler, ProtocolEngine, RequestHandler, SessionManager, ServerConfig,
        ServerError, ServerErrorExt, ServerResult, TaskQueue, TaskStorage, default_config,
    };
}
