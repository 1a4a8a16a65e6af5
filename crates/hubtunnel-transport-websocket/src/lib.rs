//! WebSocket transport implementation using tokio-tungstenite
//!
//! Owns exactly one physical tunnel connection to the service. All traffic is
//! binary: outbound frames are written one complete message at a time, and the
//! inbound byte stream goes through a two-stage pipeline:
//!
//! ```text
//! socket ──► reader task ──(bounded chunks)──► parser task ──(events)──► consumer
//! ```
//!
//! The bounded chunk channel is the backpressure point: a slow consumer stalls
//! the parser, which eventually stalls the socket reader, instead of buffering
//! without limit.

pub mod config;
pub mod connection;

pub use config::{ensure_crypto_provider, WebSocketConfig};
pub use connection::{ConnectionEvent, ConnectionStats, DisconnectReason, WebSocketConnection};

use hubtunnel_proto::CodecError;
use thiserror::Error;

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("WebSocket error: {0}")]
    WebSocketError(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Codec error: {0}")]
    CodecError(#[from] CodecError),

    #[error("Connection closed")]
    Closed,

    #[error("Connect timed out")]
    Timeout,

    #[error("Connect cancelled")]
    Cancelled,

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;
