//! # Error Types
//!
//! Semantic error types for the emotion streaming gateway. Most failures in
//! this crate are contained at the session boundary and only logged; the
//! variants here describe what went wrong when an operation does surface an
//! error (binding the ingress listener, loading config, dialing upstream).

use thiserror::Error;

/// Convenient Result alias for gateway operations.
pub type StreamResult<T> = std::result::Result<T, StreamError>;

/// All errors that can occur inside the streaming gateway.
#[derive(Error, Debug)]
pub enum StreamError {
    // ─── Connection ─────────────────────────────────────────────────
    /// Failed to establish the upstream WebSocket connection.
    #[error("Failed to connect to upstream at {url}: {reason}")]
    ConnectionFailed { url: String, reason: String },

    /// A connection was lost after being established.
    #[error("Connection lost: {reason}")]
    ConnectionLost { reason: String },

    /// The upstream connection is not open.
    #[error("Not connected to upstream")]
    NotConnected,

    // ─── Ingress ────────────────────────────────────────────────────
    /// The ingress listener could not be bound. This is the only fatal error.
    #[error("Failed to bind ingress endpoint {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// An inbound connection was not upgraded (wrong path, bad request line).
    #[error("Upgrade rejected: {reason}")]
    HandshakeRejected { reason: String },

    // ─── Protocol ───────────────────────────────────────────────────
    /// Received an unexpected or malformed message.
    #[error("Protocol error: {reason}")]
    ProtocolError { reason: String },

    // ─── Config ─────────────────────────────────────────────────────
    /// Configuration file error (missing, malformed, or invalid values).
    #[error("Configuration error: {reason}")]
    ConfigError { reason: String },

    // ─── WebSocket ──────────────────────────────────────────────────
    /// Low-level WebSocket transport error.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    // ─── I/O ────────────────────────────────────────────────────────
    /// Socket or filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StreamError {
    /// Returns `true` if this error is transient and the operation can be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StreamError::ConnectionFailed { .. }
                | StreamError::ConnectionLost { .. }
                | StreamError::WebSocket(_)
        )
    }

    /// Returns `true` if this error indicates the connection is dead
    /// and a reconnect is needed.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            StreamError::ConnectionFailed { .. }
                | StreamError::ConnectionLost { .. }
                | StreamError::NotConnected
                | StreamError::WebSocket(_)
        )
    }
}

// ─── From impls for external error types ────────────────────────────────

impl From<tokio_tungstenite::tungstenite::Error> for StreamError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        StreamError::WebSocket(err.to_string())
    }
}

#[cfg(feature = "config-toml")]
impl From<toml::de::Error> for StreamError {
    fn from(err: toml::de::Error) -> Self {
        StreamError::ConfigError {
            reason: err.to_string(),
        }
    }
}
