//! Tunnel service - serves tunnel requests against the local upstream
//!
//! Each inbound [`HttpRequestMessage`] becomes one HTTP/1.1 call to the
//! upstream. The upstream's scheme, host and port replace those of the
//! request URL; path and query are kept. Whatever happens upstream, exactly
//! one [`HttpResponseMessage`] comes back.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use http::header::{HeaderName, HeaderValue, CONTENT_TYPE, HOST, TRANSFER_ENCODING};
use http::{HeaderMap, Method, StatusCode};
use http_body_util::Full;
use hubtunnel_proto::{Headers, HttpRequestMessage, HttpResponseMessage};
use hyper::Request;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use url::Url;

use crate::connection::{RequestHandler, TunnelError};
use crate::history::{HistoryRecorder, HttpItem};
use crate::http_proxy::{HttpProxy, ProxyError, ProxyResponse, UpstreamTls};
use crate::status::{HttpConnectionStatus, StatusReporter};

/// Request dispatcher options
#[derive(Debug, Clone)]
pub struct TunnelServiceOptions {
    /// Base URL of the local upstream, `http` or `https`
    pub upstream: Url,
    /// Bound for connect, send and body read of one upstream call
    pub request_timeout: Duration,
    /// Skip certificate verification for an `https` upstream
    pub insecure_upstream: bool,
}

impl TunnelServiceOptions {
    pub fn new(upstream: Url) -> Self {
        Self {
            upstream,
            request_timeout: Duration::from_secs(100),
            insecure_upstream: false,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// Bridges tunnel requests to the local upstream server
#[derive(Debug)]
pub struct TunnelService {
    options: TunnelServiceOptions,
    /// `host[:port]` sent as the Host header
    authority: String,
    proxy: HttpProxy,
    reporter: StatusReporter,
    history: HistoryRecorder,
}

impl TunnelService {
    pub fn new(
        options: TunnelServiceOptions,
        reporter: StatusReporter,
        history: HistoryRecorder,
    ) -> Result<Self, TunnelError> {
        let upstream = &options.upstream;
        if !matches!(upstream.scheme(), "http" | "https") {
            return Err(TunnelError::Config(format!(
                "Upstream must be an http:// or https:// URL, got {}",
                upstream
            )));
        }
        let host = upstream
            .host_str()
            .ok_or_else(|| TunnelError::Config(format!("Upstream {} has no host", upstream)))?;
        let port = upstream.port_or_known_default().unwrap_or(80);

        let authority = match upstream.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };
        let mut proxy = HttpProxy::new(format!("{}:{}", host, port));
        if upstream.scheme() == "https" {
            let server_name = host.trim_start_matches('[').trim_end_matches(']');
            let tls = UpstreamTls::new(server_name, options.insecure_upstream)
                .map_err(|e| TunnelError::Config(e.to_string()))?;
            proxy = proxy.with_tls(tls);
        }

        info!("Local upstream: {}", upstream);
        reporter.local_server_url(upstream.as_str());

        Ok(Self {
            options,
            authority,
            proxy,
            reporter,
            history,
        })
    }

    pub fn upstream(&self) -> &Url {
        &self.options.upstream
    }

    /// Upstream URL for a tunnel request URL
    pub fn proxied_url(&self, url: &str) -> Result<Url, ProxyError> {
        let original = Url::parse(url)
            .or_else(|_| self.options.upstream.join(url))
            .map_err(|e| ProxyError::InvalidRequest(format!("Invalid url '{}': {}", url, e)))?;

        let mut proxied = self.options.upstream.clone();
        proxied.set_path(original.path());
        proxied.set_query(original.query());
        Ok(proxied)
    }

    /// Serve one tunnel request. Never fails: upstream errors become a 500.
    pub async fn process_request(&self, request: &HttpRequestMessage) -> HttpResponseMessage {
        let request_at = Utc::now();
        info!(
            "Received request {:?}: {} {}",
            request.tracing_id, request.http_method, request.url
        );

        let (response, status) = match self.call_upstream(request).await {
            Ok(upstream) => {
                let status = if upstream.status.is_success() {
                    HttpConnectionStatus::Succeed
                } else {
                    HttpConnectionStatus::ErrorResponse
                };
                let headers = convert_headers(&upstream.headers);
                (
                    request.response(upstream.status.as_u16(), headers, upstream.body),
                    status,
                )
            }
            Err(e) => {
                error!(
                    "Error forwarding request {:?} '{} {}': {}",
                    request.tracing_id, request.http_method, request.url, e
                );
                let status = match e {
                    ProxyError::Timeout(_) => HttpConnectionStatus::RequestTimeout,
                    _ => HttpConnectionStatus::RequestFailed,
                };
                let mut headers = Headers::new();
                headers.append(
                    CONTENT_TYPE.as_str(),
                    Bytes::from_static(b"text/plain; charset=utf-8"),
                );
                (
                    request.response(
                        StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
                        headers,
                        Bytes::from(e.to_string()),
                    ),
                    status,
                )
            }
        };
        self.reporter.tunnel_to_local_server_status(status);

        let respond_at = Utc::now();
        info!(
            "Response for {:?}: {} ({}ms)",
            request.tracing_id,
            response.status_code,
            (respond_at - request_at).num_milliseconds()
        );

        self.history.record(HttpItem {
            tracing_id: request.tracing_id,
            method: request.http_method.clone(),
            url: request.url.clone(),
            request_raw: request.dump_raw(),
            response_raw: response.dump_raw(),
            code: response.status_code,
            request_at,
            respond_at,
        });

        response
    }

    async fn call_upstream(
        &self,
        request: &HttpRequestMessage,
    ) -> Result<ProxyResponse, ProxyError> {
        let upstream_request = self.build_upstream_request(request)?;
        debug!(
            "Proxying {} {} to {}",
            upstream_request.method(),
            upstream_request.uri(),
            self.proxy.target()
        );

        let timeout = self.options.request_timeout;
        tokio::time::timeout(timeout, self.proxy.forward(upstream_request))
            .await
            .map_err(|_| ProxyError::Timeout(timeout))?
    }

    fn build_upstream_request(
        &self,
        request: &HttpRequestMessage,
    ) -> Result<Request<Full<Bytes>>, ProxyError> {
        let method = Method::from_bytes(request.http_method.as_bytes()).map_err(|_| {
            ProxyError::InvalidRequest(format!("Invalid method '{}'", request.http_method))
        })?;

        let url = self.proxied_url(&request.url)?;
        let path_and_query = match url.query() {
            Some(query) => format!("{}?{}", url.path(), query),
            None => url.path().to_string(),
        };

        let mut upstream_request = Request::builder()
            .method(method)
            .uri(path_and_query)
            .body(Full::new(request.content.clone()))
            .map_err(|e| ProxyError::InvalidRequest(format!("Failed to build request: {}", e)))?;

        let headers = upstream_request.headers_mut();
        for (name, values) in request.headers.iter() {
            let Ok(header_name) = HeaderName::from_bytes(name.as_bytes()) else {
                debug!("Skipping invalid header name '{}'", name);
                continue;
            };
            if header_name == HOST {
                continue;
            }
            for value in values {
                match HeaderValue::from_str(value) {
                    Ok(value) => {
                        headers.append(header_name.clone(), value);
                    }
                    Err(_) => debug!("Skipping invalid value for header '{}'", name),
                }
            }
        }
        let host = HeaderValue::from_str(&self.authority)
            .map_err(|e| ProxyError::InvalidRequest(format!("Invalid upstream host: {}", e)))?;
        headers.insert(HOST, host);

        Ok(upstream_request)
    }
}

#[async_trait]
impl RequestHandler for TunnelService {
    async fn handle_request(
        &self,
        request: HttpRequestMessage,
        _cancel: CancellationToken,
    ) -> Result<HttpResponseMessage, TunnelError> {
        // Upstream calls are bounded by request_timeout, not by tunnel shutdown
        Ok(self.process_request(&request).await)
    }
}

/// Multi-value response headers in wire form. The body is sent whole, so
/// chunked transfer framing does not apply downstream.
fn convert_headers(headers: &HeaderMap) -> Headers<Bytes> {
    let mut converted = Headers::with_capacity(headers.keys_len());
    for name in headers.keys() {
        if name == TRANSFER_ENCODING {
            continue;
        }
        let values = headers
            .get_all(name)
            .iter()
            .map(|value| Bytes::copy_from_slice(value.as_bytes()))
            .collect();
        converted.insert(name.as_str(), values);
    }
    converted
}
