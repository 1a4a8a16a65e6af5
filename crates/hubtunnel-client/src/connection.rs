//! Tunnel connection manager
//!
//! Keeps one WebSocket to the service alive: connects with retry, pumps
//! inbound messages, dispatches requests to a [`RequestHandler`] and follows
//! the service's reconnect / close instructions.
//!
//! ```text
//! Connecting ──► Connected ──► Disconnected ──(delay)──► Connecting
//!                    │
//!                    └── Reconnect ──► Reconnecting ──► Disconnected ──► Connecting
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use hubtunnel_proto::{
    Headers, HttpRequestMessage, HttpResponseMessage, ReconnectMessage, TunnelMessage, TUNNEL_PATH,
};
use hubtunnel_transport_websocket::{
    ConnectionEvent, DisconnectReason, TransportError, WebSocketConfig, WebSocketConnection,
};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::credential::{CredentialError, TokenProvider};
use crate::retry::{RetryConfig, RetryError, RetryPolicy};
use crate::status::{ConnectionState, StatusReporter};

/// Tunnel errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),

    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connect retries exhausted after {0} attempts")]
    RetriesExhausted(usize),

    #[error("Tunnel cancelled")]
    Cancelled,
}

/// Serves tunnel requests
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle_request(
        &self,
        request: HttpRequestMessage,
        cancel: CancellationToken,
    ) -> Result<HttpResponseMessage, TunnelError>;
}

/// Connection manager options
#[derive(Debug, Clone)]
pub struct TunnelConnectionOptions {
    /// Service endpoint, `http(s)://` or `ws(s)://`
    pub endpoint: Url,
    pub hub: String,
    pub target: Option<String>,
    /// Token audience; defaults to the endpoint origin
    pub token_audience: Option<String>,
    /// Retry policy for the connect step
    pub retry: RetryConfig,
    /// Pause between connection cycles
    pub reconnect_delay: Duration,
    pub websocket: WebSocketConfig,
}

impl TunnelConnectionOptions {
    pub fn new(endpoint: Url, hub: &str) -> Self {
        Self {
            endpoint,
            hub: hub.to_string(),
            target: None,
            token_audience: None,
            retry: RetryConfig::default(),
            reconnect_delay: Duration::from_secs(1),
            websocket: WebSocketConfig::client_default(),
        }
    }
}

/// Endpoint, target and the tunnel URL derived from them
#[derive(Debug, Clone)]
pub struct EndpointState {
    endpoint: Url,
    hub: String,
    target: Option<String>,
    tunnel_endpoint: Option<Url>,
}

impl EndpointState {
    pub fn new(endpoint: Url, hub: &str, target: Option<String>) -> Result<Self, TunnelError> {
        validate_endpoint(&endpoint)?;
        Ok(Self {
            endpoint,
            hub: hub.to_string(),
            target: target.filter(|t| !t.is_empty()),
            tunnel_endpoint: None,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    /// Replace the endpoint. Returns false when unchanged.
    pub fn set_endpoint(&mut self, endpoint: Url) -> Result<bool, TunnelError> {
        validate_endpoint(&endpoint)?;
        if endpoint == self.endpoint {
            return Ok(false);
        }
        self.endpoint = endpoint;
        self.tunnel_endpoint = None;
        Ok(true)
    }

    /// Replace the target. Returns false when unchanged.
    pub fn set_target(&mut self, target: Option<String>) -> bool {
        let target = target.filter(|t| !t.is_empty());
        if target == self.target {
            return false;
        }
        self.target = target;
        self.tunnel_endpoint = None;
        true
    }

    /// WebSocket URL of the tunnel, computed on first use after a change
    pub fn tunnel_endpoint(&mut self) -> Url {
        if let Some(url) = &self.tunnel_endpoint {
            return url.clone();
        }
        let url = derive_tunnel_endpoint(&self.endpoint, &self.hub, self.target.as_deref());
        self.tunnel_endpoint = Some(url.clone());
        url
    }
}

fn validate_endpoint(endpoint: &Url) -> Result<(), TunnelError> {
    if !matches!(endpoint.scheme(), "http" | "https" | "ws" | "wss") {
        return Err(TunnelError::InvalidEndpoint(format!(
            "unsupported scheme in {}",
            endpoint
        )));
    }
    if endpoint.host_str().is_none() {
        return Err(TunnelError::InvalidEndpoint(format!("no host in {}", endpoint)));
    }
    Ok(())
}

fn derive_tunnel_endpoint(endpoint: &Url, hub: &str, target: Option<&str>) -> Url {
    let mut url = endpoint.clone();
    let scheme = if endpoint.scheme() == "http" || endpoint.scheme() == "ws" {
        "ws"
    } else {
        "wss"
    };
    // Switching between special schemes cannot fail
    let _ = url.set_scheme(scheme);

    let path = format!("{}/{}", endpoint.path().trim_end_matches('/'), TUNNEL_PATH);
    url.set_path(&path);
    url.set_fragment(None);
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("hub", hub);
        if let Some(target) = target {
            query.append_pair("target", target);
        }
    }
    url
}

/// Live trace URL for an endpoint, `livetrace?livetrace_access_token=..&access_token=..`
async fn live_trace_url(
    endpoint: &Url,
    audience: &str,
    credential: &dyn TokenProvider,
) -> Result<Url, CredentialError> {
    let mut url = endpoint.clone();
    url.set_query(None);
    url.set_fragment(None);

    url.set_path("livetrace");
    let client_token = credential.get_token(audience, url.as_str()).await?;
    url.set_path("livetrace/tool");
    let tool_token = credential.get_token(audience, url.as_str()).await?;

    url.set_path("livetrace");
    url.query_pairs_mut()
        .append_pair("livetrace_access_token", &client_token)
        .append_pair("access_token", &tool_token);
    Ok(url)
}

type ActiveSocket = Arc<RwLock<Option<Arc<WebSocketConnection>>>>;

/// Maintains the tunnel to the service
pub struct TunnelConnection {
    options: TunnelConnectionOptions,
    state: Mutex<EndpointState>,
    credential: Arc<dyn TokenProvider>,
    reporter: StatusReporter,
    handler: Arc<dyn RequestHandler>,
    active: ActiveSocket,
    allow_reconnect: AtomicBool,
}

impl TunnelConnection {
    pub fn new(
        options: TunnelConnectionOptions,
        credential: Arc<dyn TokenProvider>,
        reporter: StatusReporter,
        handler: Arc<dyn RequestHandler>,
    ) -> Result<Self, TunnelError> {
        let state = EndpointState::new(
            options.endpoint.clone(),
            &options.hub,
            options.target.clone(),
        )?;
        reporter.service_endpoint(state.endpoint().as_str());

        Ok(Self {
            options,
            state: Mutex::new(state),
            credential,
            reporter,
            handler,
            active: Arc::new(RwLock::new(None)),
            allow_reconnect: AtomicBool::new(true),
        })
    }

    pub async fn endpoint(&self) -> Url {
        self.state.lock().await.endpoint().clone()
    }

    pub async fn target(&self) -> Option<String> {
        self.state.lock().await.target().map(str::to_string)
    }

    pub async fn tunnel_endpoint(&self) -> Url {
        self.state.lock().await.tunnel_endpoint()
    }

    /// Whether a socket is currently up
    pub async fn is_connected(&self) -> bool {
        self.active.read().await.is_some()
    }

    /// Run until cancelled, closed by the service, or out of connect retries
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), TunnelError> {
        loop {
            // Only a Close message turns this off
            self.allow_reconnect.store(true, Ordering::SeqCst);

            let tunnel_endpoint = self.tunnel_endpoint().await;
            info!("Connecting to {}", tunnel_endpoint);
            self.set_status(ConnectionState::Connecting);

            match self.connect_cycle(&cancel).await {
                Ok(()) | Err(TunnelError::Cancelled) => {}
                Err(e @ TunnelError::RetriesExhausted(_)) => {
                    error!("Giving up on {}: {}", tunnel_endpoint, e);
                    self.set_status(ConnectionState::Disconnected);
                    return Err(e);
                }
                Err(e) => error!("Error connecting to {}: {}", tunnel_endpoint, e),
            }

            if cancel.is_cancelled() || !self.allow_reconnect.load(Ordering::SeqCst) {
                break;
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.options.reconnect_delay) => {}
            }
        }

        info!("Tunnel stopped");
        Ok(())
    }

    /// Tear down the current socket; `run` reconnects unless closed
    pub async fn stop(&self) {
        let socket = self.active.read().await.clone();
        if let Some(socket) = socket {
            socket.stop().await;
        }
    }

    fn set_status(&self, state: ConnectionState) {
        debug!("Tunnel state -> {}", state);
        self.reporter.status_change(state);
    }

    fn token_audience(&self, endpoint: &Url) -> String {
        match &self.options.token_audience {
            Some(audience) => audience.clone(),
            None => endpoint.origin().ascii_serialization(),
        }
    }

    /// One connection: connect with retry, then pump until the socket ends
    async fn connect_cycle(&self, cancel: &CancellationToken) -> Result<(), TunnelError> {
        let mut retry = RetryPolicy::new(self.options.retry.clone());

        let (socket, events, endpoint) = loop {
            match self.connect_once(cancel).await {
                Ok(connected) => break connected,
                Err(TunnelError::Cancelled) => return Err(TunnelError::Cancelled),
                Err(e) => {
                    warn!("Connect attempt {} failed: {}", retry.attempt() + 1, e);
                    match retry.wait(cancel).await {
                        Ok(()) => {}
                        Err(RetryError::Cancelled) => return Err(TunnelError::Cancelled),
                        Err(RetryError::MaxAttemptsReached) => {
                            return Err(TunnelError::RetriesExhausted(retry.attempt()))
                        }
                    }
                }
            }
        };

        let socket = Arc::new(socket);
        *self.active.write().await = Some(socket.clone());
        self.set_status(ConnectionState::Connected);
        info!(
            "[{}] Connected to {}",
            socket.connection_id(),
            socket.endpoint()
        );
        self.spawn_live_trace_report(endpoint, cancel);

        let (reason, error) = self.pump(&socket, events, cancel).await;

        {
            let mut active = self.active.write().await;
            if active.as_ref().is_some_and(|a| Arc::ptr_eq(a, &socket)) {
                *active = None;
            }
        }
        socket.stop().await;
        self.set_status(ConnectionState::Disconnected);

        let stats = socket.stats();
        info!(
            "[{}] Disconnected from {}: {:?} {} (sent {} bytes, received {} bytes)",
            socket.connection_id(),
            socket.endpoint(),
            reason,
            error.unwrap_or_default(),
            stats.bytes_sent,
            stats.bytes_received
        );
        Ok(())
    }

    async fn connect_once(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(WebSocketConnection, mpsc::Receiver<ConnectionEvent>, Url), TunnelError> {
        let (endpoint, tunnel_endpoint) = {
            let mut state = self.state.lock().await;
            (state.endpoint().clone(), state.tunnel_endpoint())
        };
        let audience = self.token_audience(&endpoint);

        let token = tokio::select! {
            _ = cancel.cancelled() => return Err(TunnelError::Cancelled),
            token = self.credential.get_token(&audience, tunnel_endpoint.as_str()) => token?,
        };

        let websocket = &self.options.websocket;
        match WebSocketConnection::connect(&tunnel_endpoint, &token, websocket, cancel).await {
            Ok((socket, events)) => Ok((socket, events, endpoint)),
            Err(TransportError::Cancelled) => Err(TunnelError::Cancelled),
            Err(e) => Err(e.into()),
        }
    }

    /// Consume events until the socket reports its disconnect
    async fn pump(
        &self,
        socket: &Arc<WebSocketConnection>,
        mut events: mpsc::Receiver<ConnectionEvent>,
        cancel: &CancellationToken,
    ) -> (DisconnectReason, Option<String>) {
        let mut stopping = false;

        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled(), if !stopping => {
                    info!("[{}] Tunnel cancelled, closing", socket.connection_id());
                    stopping = true;
                    spawn_stop(socket);
                    continue;
                }
                event = events.recv() => event,
            };

            match event {
                Some(ConnectionEvent::Message(message)) => {
                    if self.dispatch(message, cancel).await && !stopping {
                        stopping = true;
                        spawn_stop(socket);
                    }
                }
                Some(ConnectionEvent::Disconnected { reason, error }) => return (reason, error),
                None => return (DisconnectReason::Cancelled, None),
            }
        }
    }

    /// Handle one inbound message. Returns true when the socket should close.
    async fn dispatch(&self, message: TunnelMessage, cancel: &CancellationToken) -> bool {
        match message {
            TunnelMessage::HttpRequest(request) => {
                info!(
                    "Getting request {:?}: {} {}",
                    request.tracing_id, request.http_method, request.url
                );
                self.spawn_request(request, cancel.clone());
                false
            }
            TunnelMessage::Reconnect(reconnect) => {
                info!("Reconnect the connection: {}", reconnect.message);
                self.apply_reconnect(reconnect).await;
                true
            }
            TunnelMessage::Rebalance(rebalance) => {
                info!("Rebalance the connection: {}", rebalance.message);
                self.apply_reconnect(rebalance).await;
                true
            }
            TunnelMessage::Close(close) => {
                info!("Close the connection: {}", close.message);
                self.allow_reconnect.store(false, Ordering::SeqCst);
                true
            }
            TunnelMessage::ServiceStatus(status) => {
                info!("Service status: {}", status.message);
                false
            }
            TunnelMessage::Connected(connected) => {
                info!(
                    "Service assigned connection id {} (user: {:?})",
                    connected.connection_id, connected.user_id
                );
                false
            }
            TunnelMessage::HttpResponse(response) => {
                warn!(
                    "Ignoring unexpected response message (ack {})",
                    response.ack_id
                );
                false
            }
        }
    }

    async fn apply_reconnect(&self, reconnect: ReconnectMessage) {
        self.allow_reconnect.store(true, Ordering::SeqCst);
        self.set_status(ConnectionState::Reconnecting);

        let mut state = self.state.lock().await;
        if let Some(target) = reconnect.target_id.filter(|t| !t.is_empty()) {
            if state.set_target(Some(target)) {
                debug!("Tunnel target changed to {:?}", state.target());
            }
        }
        if let Some(endpoint) = reconnect.endpoint.filter(|e| !e.is_empty()) {
            match Url::parse(&endpoint) {
                Ok(url) => match state.set_endpoint(url) {
                    Ok(true) => self.reporter.service_endpoint(state.endpoint().as_str()),
                    Ok(false) => {}
                    Err(e) => warn!("Ignoring reconnect endpoint: {}", e),
                },
                Err(e) => warn!("Ignoring reconnect endpoint '{}': {}", endpoint, e),
            }
        }
    }

    fn spawn_request(&self, request: HttpRequestMessage, cancel: CancellationToken) {
        let handler = self.handler.clone();
        let active = self.active.clone();

        tokio::spawn(async move {
            let tracing_id = request.tracing_id;
            let correlation = HttpRequestMessage {
                tracing_id,
                ack_id: request.ack_id,
                channel_name: request.channel_name.clone(),
                global_routing: request.global_routing,
                ..Default::default()
            };

            let response = match handler.handle_request(request, cancel).await {
                Ok(response) => response,
                Err(e) => {
                    error!("Request handler failed for {:?}: {}", tracing_id, e);
                    error_response(&correlation, e.to_string())
                }
            };

            // Sent over whichever socket is up now; ids from an older socket
            // mean nothing to the service but the reply is still attempted
            let Some(socket) = active.read().await.clone() else {
                warn!(
                    "No active connection, dropping response for request {:?}",
                    tracing_id
                );
                return;
            };

            let result = match socket.send_message(&response.into()).await {
                Err(TransportError::CodecError(e)) => {
                    warn!(
                        "[{}] Response for request {:?} cannot be framed: {}",
                        socket.connection_id(),
                        tracing_id,
                        e
                    );
                    let fallback = error_response(
                        &correlation,
                        format!("Response could not be encoded: {}", e),
                    );
                    socket.send_message(&fallback.into()).await
                }
                result => result,
            };
            if let Err(e) = result {
                warn!(
                    "[{}] Dropping response for request {:?}: {}",
                    socket.connection_id(),
                    tracing_id,
                    e
                );
            }
        });
    }

    fn spawn_live_trace_report(&self, endpoint: Url, cancel: &CancellationToken) {
        let credential = self.credential.clone();
        let reporter = self.reporter.clone();
        let cancel = cancel.clone();
        let audience = self.token_audience(&endpoint);

        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                result = live_trace_url(&endpoint, &audience, credential.as_ref()) => match result {
                    Ok(url) => reporter.live_trace_url(url.as_str()),
                    Err(e) => debug!("Live trace url unavailable: {}", e),
                }
            }
        });
    }
}

/// Plain text 500 carrying the request's correlation fields
fn error_response(correlation: &HttpRequestMessage, text: String) -> HttpResponseMessage {
    let mut headers = Headers::new();
    headers.append("content-type", Bytes::from_static(b"text/plain"));
    correlation.response(500, headers, Bytes::from(text))
}

fn spawn_stop(socket: &Arc<WebSocketConnection>) {
    let socket = socket.clone();
    tokio::spawn(async move {
        socket.stop().await;
    });
}

impl std::fmt::Debug for TunnelConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelConnection")
            .field("hub", &self.options.hub)
            .field("allow_reconnect", &self.allow_reconnect.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::MockTokenProvider;
    use crate::status::TracingStatusSink;

    fn state(endpoint: &str, target: Option<&str>) -> EndpointState {
        EndpointState::new(
            Url::parse(endpoint).unwrap(),
            "chat",
            target.map(str::to_string),
        )
        .unwrap()
    }

    #[test]
    fn test_tunnel_endpoint_https() {
        let mut state = state("https://svc.example.com", None);
        assert_eq!(
            state.tunnel_endpoint().as_str(),
            "wss://svc.example.com/server/tunnel?hub=chat"
        );
    }

    #[test]
    fn test_tunnel_endpoint_http_with_port_and_query() {
        let mut state = state("http://localhost:8080/base/?x=1", None);
        assert_eq!(
            state.tunnel_endpoint().as_str(),
            "ws://localhost:8080/base/server/tunnel?x=1&hub=chat"
        );
    }

    #[test]
    fn test_tunnel_endpoint_encodes_target() {
        let mut state = state("https://svc.example.com", Some("dev ice/1"));
        assert_eq!(
            state.tunnel_endpoint().as_str(),
            "wss://svc.example.com/server/tunnel?hub=chat&target=dev+ice%2F1"
        );
    }

    #[test]
    fn test_unchanged_target_keeps_cached_endpoint() {
        let mut state = state("https://svc.example.com", Some("t1"));
        let before = state.tunnel_endpoint();

        assert!(!state.set_target(Some("t1".to_string())));
        assert!(!state
            .set_endpoint(Url::parse("https://svc.example.com").unwrap())
            .unwrap());
        assert_eq!(state.tunnel_endpoint(), before);

        assert!(state.set_target(Some("t2".to_string())));
        assert!(state.tunnel_endpoint().as_str().ends_with("target=t2"));

        assert!(state
            .set_endpoint(Url::parse("https://other.example.com").unwrap())
            .unwrap());
        assert_eq!(
            state.tunnel_endpoint().as_str(),
            "wss://other.example.com/server/tunnel?hub=chat&target=t2"
        );
    }

    #[test]
    fn test_rejects_unsupported_endpoint() {
        let result = EndpointState::new(Url::parse("ftp://svc.example.com").unwrap(), "chat", None);
        assert!(matches!(result, Err(TunnelError::InvalidEndpoint(_))));

        let mut ok = state("https://svc.example.com", None);
        assert!(ok
            .set_endpoint(Url::parse("mailto:someone@example.com").unwrap())
            .is_err());
    }

    #[tokio::test]
    async fn test_live_trace_url() {
        let mut credential = MockTokenProvider::new();
        credential
            .expect_get_token()
            .withf(|_, claims| claims == "https://svc.example.com/livetrace")
            .times(1)
            .returning(|_, _| Ok("client".to_string()));
        credential
            .expect_get_token()
            .withf(|_, claims| claims == "https://svc.example.com/livetrace/tool")
            .times(1)
            .returning(|_, _| Ok("tool".to_string()));

        let url = live_trace_url(
            &Url::parse("https://svc.example.com/?ignored=1").unwrap(),
            "https://svc.example.com",
            &credential,
        )
        .await
        .unwrap();

        assert_eq!(
            url.as_str(),
            "https://svc.example.com/livetrace?livetrace_access_token=client&access_token=tool"
        );
    }

    struct NoopHandler;

    #[async_trait]
    impl RequestHandler for NoopHandler {
        async fn handle_request(
            &self,
            request: HttpRequestMessage,
            _cancel: CancellationToken,
        ) -> Result<HttpResponseMessage, TunnelError> {
            Ok(request.response(200, Headers::new(), Bytes::new()))
        }
    }

    #[tokio::test]
    async fn test_retries_exhausted_ends_run() {
        // Nothing listens on this port
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut credential = MockTokenProvider::new();
        credential
            .expect_get_token()
            .times(3)
            .returning(|_, _| Ok("token".to_string()));

        let endpoint = Url::parse(&format!("http://127.0.0.1:{}", port)).unwrap();
        let mut options = TunnelConnectionOptions::new(endpoint, "chat");
        options.retry = RetryConfig {
            step: Duration::from_millis(10),
            max_delay: Duration::from_millis(10),
            max_attempts: Some(2),
        };

        let connection = TunnelConnection::new(
            options,
            Arc::new(credential),
            StatusReporter::new(Arc::new(TracingStatusSink)),
            Arc::new(NoopHandler),
        )
        .unwrap();

        let result = connection.run(CancellationToken::new()).await;
        assert!(matches!(result, Err(TunnelError::RetriesExhausted(_))));
    }

    #[tokio::test]
    async fn test_cancel_during_retry_ends_run() {
        let mut credential = MockTokenProvider::new();
        credential
            .expect_get_token()
            .returning(|_, _| Err(CredentialError::RequestFailed("offline".to_string())));

        let mut options =
            TunnelConnectionOptions::new(Url::parse("https://svc.example.com").unwrap(), "chat");
        options.retry.step = Duration::from_secs(60);

        let connection = TunnelConnection::new(
            options,
            Arc::new(credential),
            StatusReporter::new(Arc::new(TracingStatusSink)),
            Arc::new(NoopHandler),
        )
        .unwrap();

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let result = tokio::time::timeout(Duration::from_secs(5), connection.run(cancel))
            .await
            .expect("run did not stop on cancel");
        assert!(result.is_ok());
    }
}
