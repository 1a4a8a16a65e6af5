//! WebSocket transport configuration

use std::time::Duration;

use crate::{TransportError, TransportResult};

/// WebSocket-specific configuration
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Upper bound for TCP connect + TLS + upgrade handshake
    pub connect_timeout: Duration,

    /// How long `stop()` waits for the peer to answer the close frame
    pub close_timeout: Duration,

    /// Maximum size of a single WebSocket message
    pub max_message_size: usize,

    /// Number of received chunks buffered between the socket reader and the parser
    pub read_buffer_chunks: usize,

    /// Number of decoded events buffered for the consumer
    pub event_buffer: usize,

    /// Value sent in the `User-Agent` header of the upgrade request
    pub user_agent: String,
}

impl WebSocketConfig {
    /// Create a client configuration with defaults
    pub fn client_default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            close_timeout: Duration::from_secs(5),
            max_message_size: 16 * 1024 * 1024, // 16MB
            read_buffer_chunks: 16,
            event_buffer: 64,
            user_agent: format!("hubtunnel/{}", env!("CARGO_PKG_VERSION")),
        }
    }

    /// Set connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set close handshake timeout
    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    /// Set the reader → parser buffer depth
    pub fn with_read_buffer_chunks(mut self, chunks: usize) -> Self {
        self.read_buffer_chunks = chunks;
        self
    }

    pub fn validate(&self) -> TransportResult<()> {
        if self.read_buffer_chunks == 0 || self.event_buffer == 0 {
            return Err(TransportError::ConfigurationError(
                "Buffer sizes must be greater than zero".to_string(),
            ));
        }
        if self.max_message_size == 0 {
            return Err(TransportError::ConfigurationError(
                "max_message_size must be greater than zero".to_string(),
            ));
        }
        if self.connect_timeout.is_zero() {
            return Err(TransportError::ConfigurationError(
                "connect_timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self::client_default()
    }
}

// Initialize rustls crypto provider
static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

/// Install the ring provider as the process default, once
pub fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("Rustls crypto provider already installed");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_config_default() {
        let config = WebSocketConfig::client_default();
        assert_eq!(config.connect_timeout, Duration::from_secs(30));
        assert_eq!(config.close_timeout, Duration::from_secs(5));
        assert!(config.user_agent.starts_with("hubtunnel/"));
    }

    #[test]
    fn test_config_validation() {
        let config = WebSocketConfig::client_default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_buffer_validation() {
        let config = WebSocketConfig::client_default().with_read_buffer_chunks(0);
        assert!(config.validate().is_err());
    }
}
