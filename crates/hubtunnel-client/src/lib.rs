//! Tunnel client library
//!
//! Keeps a WebSocket tunnel to the service open and serves the HTTP requests
//! that arrive over it from a local upstream server.
//!
//! ```no_run
//! use std::sync::Arc;
//! use hubtunnel_client::{
//!     HistoryRecorder, InMemoryHistoryStore, StaticTokenProvider, StatusReporter,
//!     TracingStatusSink, TunnelConfig, TunnelConnection, TunnelService,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = TunnelConfig::builder()
//!     .endpoint("https://svc.example.com")
//!     .hub("chat")
//!     .access_token("token")
//!     .local_port(8080)
//!     .build()?;
//!
//! let reporter = StatusReporter::new(Arc::new(TracingStatusSink));
//! let history = HistoryRecorder::new(Arc::new(InMemoryHistoryStore::default()), 128);
//! let service = TunnelService::new(config.service_options()?, reporter.clone(), history)?;
//!
//! let tunnel = TunnelConnection::new(
//!     config.connection_options()?,
//!     Arc::new(StaticTokenProvider::new(config.access_token.clone())),
//!     reporter,
//!     Arc::new(service),
//! )?;
//! tunnel.run(CancellationToken::new()).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod credential;
pub mod history;
pub mod http_proxy;
pub mod retry;
pub mod service;
pub mod status;

pub use config::TunnelConfig;
pub use connection::{
    EndpointState, RequestHandler, TunnelConnection, TunnelConnectionOptions, TunnelError,
};
pub use credential::{CredentialError, StaticTokenProvider, TokenProvider};
pub use history::{HistoryError, HistoryRecorder, HistoryStore, HttpItem, InMemoryHistoryStore};
pub use http_proxy::ProxyError;
pub use retry::RetryConfig;
pub use service::{TunnelService, TunnelServiceOptions};
pub use status::{
    ConnectionState, HttpConnectionStatus, StatusReporter, StatusSink, TracingStatusSink,
};
