//! Server configuration.
//!
//! This module provides configuration for the protocol engine and transports:
//! - Protocol version negotiation
//! - Request/task timeouts
//! - Capability requirements
//! - Message size limits

use std::time::Duration;

use serde::{Deserialize, Serialize};

// Re-export from core (single source of truth - DRY)
pub use turbomcp_core::SUPPORTED_VERSIONS as SUPPORTED_PROTOCOL_VERSIONS;

/// Default maximum message size (10MB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Default task time-to-live when a request doesn't specify one.
pub const DEFAULT_TASK_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Default poll interval suggested to task requestors.
pub const DEFAULT_TASK_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Default bound on the per-task related-message queue.
pub const DEFAULT_TASK_QUEUE_MAX_SIZE: usize = 256;

/// Default SSE keep-alive comment interval.
pub const DEFAULT_SSE_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Protocol version configuration.
    pub protocol: ProtocolConfig,
    /// Timeout and task-lifetime configuration.
    pub timeouts: TimeoutConfig,
    /// Required client capabilities.
    pub required_capabilities: RequiredCapabilities,
    /// Maximum message size in bytes (default: 10MB).
    pub max_message_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            protocol: ProtocolConfig::default(),
            timeouts: TimeoutConfig::default(),
            required_capabilities: RequiredCapabilities::default(),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

impl ServerConfig {
    /// Create a new server configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a builder for server configuration.
    #[must_use]
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::default()
    }
}

/// Builder for server configuration.
#[derive(Debug, Clone, Default)]
pub struct ServerConfigBuilder {
    protocol: Option<ProtocolConfig>,
    timeouts: Option<TimeoutConfig>,
    required_capabilities: Option<RequiredCapabilities>,
    max_message_size: Option<usize>,
}

impl ServerConfigBuilder {
    /// Set protocol configuration.
    #[must_use]
    pub fn protocol(mut self, config: ProtocolConfig) -> Self {
        self.protocol = Some(config);
        self
    }

    /// Set timeout and task-lifetime configuration.
    #[must_use]
    pub fn timeouts(mut self, config: TimeoutConfig) -> Self {
        self.timeouts = Some(config);
        self
    }

    /// Set required client capabilities.
    #[must_use]
    pub fn required_capabilities(mut self, caps: RequiredCapabilities) -> Self {
        self.required_capabilities = Some(caps);
        self
    }

    /// Set maximum message size in bytes.
    ///
    /// Messages exceeding this size will be rejected. Default: 10MB.
    #[must_use]
    pub fn max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = Some(size);
        self
    }

    /// Build the server configuration with sensible defaults.
    ///
    /// This method always succeeds and uses defaults for any unset fields.
    /// For strict validation, use [`try_build()`](Self::try_build).
    #[must_use]
    pub fn build(self) -> ServerConfig {
        ServerConfig {
            protocol: self.protocol.unwrap_or_default(),
            timeouts: self.timeouts.unwrap_or_default(),
            required_capabilities: self.required_capabilities.unwrap_or_default(),
            max_message_size: self.max_message_size.unwrap_or(DEFAULT_MAX_MESSAGE_SIZE),
        }
    }

    /// Build the server configuration with validation.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `max_message_size` is less than 1024 bytes (minimum viable message size)
    /// - `timeouts.request_timeout` is zero
    pub fn try_build(self) -> Result<ServerConfig, ConfigValidationError> {
        let max_message_size = self.max_message_size.unwrap_or(DEFAULT_MAX_MESSAGE_SIZE);
        if max_message_size < 1024 {
            return Err(ConfigValidationError::InvalidMessageSize {
                size: max_message_size,
                min: 1024,
            });
        }

        let timeouts = self.timeouts.unwrap_or_default();
        if timeouts.request_timeout.is_zero() {
            return Err(ConfigValidationError::InvalidTimeout {
                reason: "request_timeout cannot be zero".to_string(),
            });
        }

        Ok(ServerConfig {
            protocol: self.protocol.unwrap_or_default(),
            timeouts,
            required_capabilities: self.required_capabilities.unwrap_or_default(),
            max_message_size,
        })
    }
}

/// Errors that can occur during configuration validation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigValidationError {
    /// Invalid message size configuration.
    #[error("Invalid max_message_size: {size} bytes is below minimum of {min} bytes")]
    InvalidMessageSize {
        /// The configured size.
        size: usize,
        /// The minimum allowed size.
        min: usize,
    },

    /// Invalid timeout configuration.
    #[error("Invalid timeout configuration: {reason}")]
    InvalidTimeout {
        /// Description of the validation failure.
        reason: String,
    },
}

/// Protocol version configuration.
#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    /// Preferred protocol version.
    pub preferred_version: String,
    /// Supported protocol versions.
    pub supported_versions: Vec<String>,
    /// Allow fallback to server's preferred version if client's is unsupported.
    pub allow_fallback: bool,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            preferred_version: SUPPORTED_PROTOCOL_VERSIONS[0].to_string(),
            supported_versions: SUPPORTED_PROTOCOL_VERSIONS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            allow_fallback: true,
        }
    }
}

impl ProtocolConfig {
    /// Create a strict configuration that only accepts the specified version.
    #[must_use]
    pub fn strict(version: &str) -> Self {
        Self {
            preferred_version: version.to_string(),
            supported_versions: vec![version.to_string()],
            allow_fallback: false,
        }
    }

    /// Check if a protocol version is supported.
    #[must_use]
    pub fn is_supported(&self, version: &str) -> bool {
        self.supported_versions.iter().any(|v| v == version)
    }

    /// Negotiate protocol version with a peer.
    ///
    /// Returns the negotiated version or `None` if no compatible version was found.
    #[must_use]
    pub fn negotiate(&self, peer_version: Option<&str>) -> Option<String> {
        match peer_version {
            Some(version) if self.is_supported(version) => Some(version.to_string()),
            Some(_) if self.allow_fallback => Some(self.preferred_version.clone()),
            Some(_) => None,
            None => Some(self.preferred_version.clone()),
        }
    }
}

/// Timeout and task-lifetime configuration.
///
/// `request_timeout`/`max_total_timeout` govern the [`ProtocolEngine`](crate::engine::ProtocolEngine)'s
/// per-request deadline and its extension ceiling under progress notifications.
/// The `default_task_*` fields seed [`TaskStorage`](crate::task_storage::TaskStorage)
/// and the per-task related-message queue.
#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    /// Time to wait for a response before a request fails with a timeout error.
    pub request_timeout: Duration,
    /// Absolute ceiling a request's deadline may be extended to via progress
    /// notifications. `None` means progress notifications may extend indefinitely.
    pub max_total_timeout: Option<Duration>,
    /// Default task TTL applied when a task-augmented request doesn't request one.
    pub default_task_ttl: Duration,
    /// Default poll interval suggested to task requestors.
    pub default_poll_interval: Duration,
    /// Maximum number of related messages buffered per task before overflow.
    pub task_queue_max_size: usize,
    /// Interval between SSE keep-alive comments on long-lived streams.
    pub sse_keepalive_interval: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_total_timeout: None,
            default_task_ttl: DEFAULT_TASK_TTL,
            default_poll_interval: DEFAULT_TASK_POLL_INTERVAL,
            task_queue_max_size: DEFAULT_TASK_QUEUE_MAX_SIZE,
            sse_keepalive_interval: DEFAULT_SSE_KEEPALIVE_INTERVAL,
        }
    }
}

/// Required client capabilities.
///
/// Specifies which client capabilities the server requires during initialization.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequiredCapabilities {
    /// Require the `roots` capability.
    #[serde(default)]
    pub roots: bool,
    /// Require the `sampling` capability.
    #[serde(default)]
    pub sampling: bool,
    /// Require named experimental capabilities.
    #[serde(default)]
    pub experimental: std::collections::HashSet<String>,
}

impl RequiredCapabilities {
    /// No requirements.
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// Require the `roots` capability.
    #[must_use]
    pub fn with_roots(mut self) -> Self {
        self.roots = true;
        self
    }

    /// Require the `sampling` capability.
    #[must_use]
    pub fn with_sampling(mut self) -> Self {
        self.sampling = true;
        self
    }

    /// Require an experimental capability.
    #[must_use]
    pub fn with_experimental(mut self, name: impl Into<String>) -> Self {
        self.experimental.insert(name.into());
        self
    }

    /// Check whether `client_caps` satisfies everything required here.
    #[must_use]
    pub fn validate(&self, client_caps: &ClientCapabilities) -> CapabilityValidation {
        let mut missing = Vec::new();

        if self.roots && !client_caps.roots {
            missing.push("roots".to_string());
        }
        if self.sampling && !client_caps.sampling {
            missing.push("sampling".to_string());
        }
        for exp in &self.experimental {
            if !client_caps.experimental.contains(exp) {
                missing.push(format!("experimental/{exp}"));
            }
        }

        if missing.is_empty() {
            CapabilityValidation::Valid
        } else {
            CapabilityValidation::Missing(missing)
        }
    }
}

/// Client capabilities received during initialization.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientCapabilities {
    /// Client supports roots.
    #[serde(default)]
    pub roots: bool,
    /// Client supports sampling.
    #[serde(default)]
    pub sampling: bool,
    /// Client supports elicitation.
    #[serde(default)]
    pub elicitation: bool,
    /// Client experimental capabilities.
    #[serde(default)]
    pub experimental: std::collections::HashSet<String>,
}

impl ClientCapabilities {
    /// Parse client capabilities from an `initialize` request's params.
    #[must_use]
    pub fn from_params(params: &serde_json::Value) -> Self {
        let caps = params.get("capabilities").cloned().unwrap_or_default();
        Self {
            roots: caps.get("roots").map(|v| !v.is_null()).unwrap_or(false),
            sampling: caps
                .get("sampling")
                .map(|v| !v.is_null())
                .unwrap_or(false),
            elicitation: caps
                .get("elicitation")
                .map(|v| !v.is_null())
                .unwrap_or(false),
            experimental: caps
                .get("experimental")
                .and_then(|v| v.as_object())
                .map(|obj| obj.keys().cloned().collect())
                .unwrap_or_default(),
        }
    }
}

/// Result of validating client capabilities against [`RequiredCapabilities`].
#[derive(Debug, Clone)]
pub enum CapabilityValidation {
    /// All required capabilities are present.
    Valid,
    /// Some required capabilities are missing.
    Missing(Vec<String>),
}

impl CapabilityValidation {
    /// Check if validation passed.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid)
    }

    /// Get missing capabilities, if any.
    #[must_use]
    pub fn missing(&self) -> Option<&[String]> {
        match self {
            Self::Valid => None,
            Self::Missing(caps) => Some(caps),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_negotiates_preferred_when_absent() {
        let config = ProtocolConfig::default();
        assert_eq!(
            config.negotiate(None),
            Some(config.preferred_version.clone())
        );
    }

    #[test]
    fn protocol_rejects_unsupported_without_fallback() {
        let config = ProtocolConfig::strict("2025-11-25");
        assert_eq!(config.negotiate(Some("1999-01-01")), None);
    }

    #[test]
    fn protocol_falls_back_when_allowed() {
        let config = ProtocolConfig::default();
        assert_eq!(
            config.negotiate(Some("bogus-version")),
            Some(config.preferred_version.clone())
        );
    }

    #[test]
    fn required_capabilities_detects_missing() {
        let required = RequiredCapabilities::none().with_roots().with_sampling();
        let client = ClientCapabilities::default();
        let validation = required.validate(&client);
        assert!(!validation.is_valid());
        assert_eq!(
            validation.missing(),
            Some(&["roots".to_string(), "sampling".to_string()][..])
        );
    }

    #[test]
    fn from_params_parses_elicitation_capability() {
        let params = serde_json::json!({
            "capabilities": { "elicitation": {}, "sampling": {} }
        });
        let caps = ClientCapabilities::from_params(&params);
        assert!(caps.elicitation);
        assert!(caps.sampling);
        assert!(!caps.roots);
    }

    #[test]
    fn try_build_rejects_tiny_message_size() {
        let result = ServerConfig::builder().max_message_size(10).try_build();
        assert!(matches!(
            result,
            Err(ConfigValidationError::InvalidMessageSize { .. })
        ));
    }

    #[test]
    fn try_build_rejects_zero_request_timeout() {
        let result = ServerConfig::builder()
            .timeouts(TimeoutConfig {
                request_timeout: Duration::ZERO,
                ..TimeoutConfig::default()
            })
            .try_build();
        assert!(matches!(
            result,
            Err(ConfigValidationError::InvalidTimeout { .. })
        ));
    }
}
