//! HTTP client for the local upstream server
//!
//! Uses hyper with connection pooling:
//! - HTTP/1.1 keep-alive, idle connections are reused
//! - `https` upstreams are reached over rustls
//! - Full response bodies are collected before returning

use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1;
use hyper::Request;
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_rustls::TlsConnector;
use tracing::debug;

/// Maximum number of pooled connections per target
const MAX_POOL_SIZE: usize = 10;

/// Proxy errors
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Response error: {0}")]
    ResponseError(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),
}

/// A fully read upstream response
#[derive(Debug)]
pub struct ProxyResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// TLS settings for an `https` upstream
#[derive(Clone)]
pub struct UpstreamTls {
    connector: TlsConnector,
    server_name: ServerName<'static>,
}

impl UpstreamTls {
    /// Verify the upstream against the bundled web PKI roots, or accept any
    /// certificate when `insecure` is set (self-signed development servers).
    pub fn new(host: &str, insecure: bool) -> Result<Self, ProxyError> {
        hubtunnel_transport_websocket::ensure_crypto_provider();

        let config = if insecure {
            rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(SkipVerification))
                .with_no_client_auth()
        } else {
            let mut roots = rustls::RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth()
        };

        let server_name = ServerName::try_from(host.to_string()).map_err(|e| {
            ProxyError::InvalidRequest(format!("Invalid TLS server name '{}': {}", host, e))
        })?;

        Ok(Self {
            connector: TlsConnector::from(Arc::new(config)),
            server_name,
        })
    }
}

/// HTTP/1.1 client with connection pooling for one upstream
pub struct HttpProxy {
    /// Target address (host:port)
    target: String,
    tls: Option<UpstreamTls>,
    /// Idle connections
    pool: Arc<Mutex<Vec<http1::SendRequest<Full<Bytes>>>>>,
}

impl HttpProxy {
    /// Create a new HTTP proxy for the given target
    pub fn new(target: String) -> Self {
        Self {
            target,
            tls: None,
            pool: Arc::new(Mutex::new(Vec::with_capacity(MAX_POOL_SIZE))),
        }
    }

    /// Wrap every upstream connection in TLS
    pub fn with_tls(mut self, tls: UpstreamTls) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Get or create a connection to the target
    async fn get_connection(&self) -> Result<http1::SendRequest<Full<Bytes>>, ProxyError> {
        // Try to get a connection from the pool
        {
            let mut pool = self.pool.lock().await;
            while let Some(sender) = pool.pop() {
                // Check if connection is still usable
                if sender.is_ready() {
                    debug!("Reusing pooled connection to {}", self.target);
                    return Ok(sender);
                }
                debug!("Discarding stale connection from pool");
            }
        }

        // Create a new connection
        debug!("Creating new connection to {}", self.target);
        let stream = TcpStream::connect(&self.target).await.map_err(|e| {
            ProxyError::ConnectionFailed(format!("Failed to connect to {}: {}", self.target, e))
        })?;

        match &self.tls {
            Some(tls) => {
                let stream = tls
                    .connector
                    .connect(tls.server_name.clone(), stream)
                    .await
                    .map_err(|e| {
                        ProxyError::ConnectionFailed(format!(
                            "TLS handshake with {} failed: {}",
                            self.target, e
                        ))
                    })?;
                handshake(stream).await
            }
            None => handshake(stream).await,
        }
    }

    /// Return a connection to the pool once it can take another request
    fn return_connection(&self, mut sender: http1::SendRequest<Full<Bytes>>) {
        let pool = self.pool.clone();
        tokio::spawn(async move {
            if sender.ready().await.is_err() {
                debug!("Not returning closed connection to pool");
                return;
            }

            let mut pool = pool.lock().await;
            if pool.len() < MAX_POOL_SIZE {
                pool.push(sender);
                debug!("Returned connection to pool (size: {})", pool.len());
            }
        });
    }

    /// Send a request and read the whole response
    pub async fn forward(
        &self,
        request: Request<Full<Bytes>>,
    ) -> Result<ProxyResponse, ProxyError> {
        let mut sender = self.get_connection().await?;

        sender
            .ready()
            .await
            .map_err(|e| ProxyError::ConnectionFailed(format!("Connection not ready: {}", e)))?;

        let response = sender
            .send_request(request)
            .await
            .map_err(|e| ProxyError::RequestFailed(format!("Failed to send request: {}", e)))?;

        let (parts, body) = response.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|e| ProxyError::ResponseError(format!("Failed to read response body: {}", e)))?
            .to_bytes();

        self.return_connection(sender);

        Ok(ProxyResponse {
            status: parts.status,
            headers: parts.headers,
            body,
        })
    }
}

async fn handshake<T>(stream: T) -> Result<http1::SendRequest<Full<Bytes>>, ProxyError>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sender, conn) = http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|e| ProxyError::ConnectionFailed(format!("HTTP handshake failed: {}", e)))?;

    // Spawn connection driver
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("Connection closed: {}", e);
        }
    });

    Ok(sender)
}

impl std::fmt::Debug for HttpProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpProxy")
            .field("target", &self.target)
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

/// Accepts any server certificate
#[derive(Debug)]
struct SkipVerification;

impl rustls::client::danger::ServerCertVerifier for SkipVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        use rustls::SignatureScheme;
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;
    use axum::Router;
    use hyper::service::service_fn;
    use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer};
    use std::convert::Infallible;
    use tokio::net::TcpListener;
    use tokio_rustls::TlsAcceptor;

    async fn spawn_upstream() -> String {
        let app = Router::new().route("/hello", get(|| async { "world" }));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr.to_string()
    }

    fn get_request(target: &str, path: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .method("GET")
            .uri(path)
            .header("host", target)
            .body(Full::new(Bytes::new()))
            .unwrap()
    }

    async fn wait_for_pool(proxy: &HttpProxy, size: usize) {
        for _ in 0..100 {
            if proxy.pool.lock().await.len() == size {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("pool never reached size {}", size);
    }

    #[tokio::test]
    async fn test_forward_reuses_connection() {
        let target = spawn_upstream().await;
        let proxy = HttpProxy::new(target.clone());

        let first = proxy.forward(get_request(&target, "/hello")).await.unwrap();
        assert_eq!(first.status, StatusCode::OK);
        assert_eq!(first.body, Bytes::from_static(b"world"));
        wait_for_pool(&proxy, 1).await;

        let second = proxy.forward(get_request(&target, "/missing")).await.unwrap();
        assert_eq!(second.status, StatusCode::NOT_FOUND);
        wait_for_pool(&proxy, 1).await;
    }

    /// HTTPS server with a fresh self-signed certificate for `localhost`
    async fn spawn_tls_upstream() -> String {
        hubtunnel_transport_websocket::ensure_crypto_provider();

        let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
        let certs = vec![CertificateDer::from(cert.serialize_der().unwrap())];
        let key = PrivatePkcs8KeyDer::from(cert.serialize_private_key_der());
        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key.into())
            .unwrap();
        let acceptor = TlsAcceptor::from(Arc::new(config));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    let Ok(stream) = acceptor.accept(stream).await else {
                        return;
                    };
                    let service = service_fn(|_req| async {
                        Ok::<_, Infallible>(hyper::Response::new(Full::new(
                            Bytes::from_static(b"secure"),
                        )))
                    });
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });
        addr.to_string()
    }

    #[tokio::test]
    async fn test_forward_over_tls() {
        let target = spawn_tls_upstream().await;
        let tls = UpstreamTls::new("localhost", true).unwrap();
        let proxy = HttpProxy::new(target.clone()).with_tls(tls);

        let response = proxy.forward(get_request("localhost", "/")).await.unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.body, Bytes::from_static(b"secure"));
    }

    #[tokio::test]
    async fn test_tls_rejects_untrusted_certificate() {
        let target = spawn_tls_upstream().await;
        let tls = UpstreamTls::new("localhost", false).unwrap();
        let proxy = HttpProxy::new(target.clone()).with_tls(tls);

        let result = proxy.forward(get_request("localhost", "/")).await;
        assert!(matches!(result, Err(ProxyError::ConnectionFailed(_))));
    }

    #[tokio::test]
    async fn test_connection_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap().to_string();
        drop(listener);

        let proxy = HttpProxy::new(target.clone());
        let result = proxy.forward(get_request(&target, "/")).await;
        assert!(matches!(result, Err(ProxyError::ConnectionFailed(_))));
    }
}
