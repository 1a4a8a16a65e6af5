//! Tunnel configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

use crate::connection::TunnelConnectionOptions;
use crate::service::TunnelServiceOptions;

/// Default local upstream
pub const DEFAULT_UPSTREAM: &str = "http://localhost:3000";

/// Tunnel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Service endpoint, e.g. `https://svc.example.com`
    pub endpoint: String,
    pub hub: String,
    /// Pre-issued bearer token
    #[serde(default)]
    pub access_token: String,
    /// Base URL of the local upstream server, `http` or `https`
    pub upstream: String,
    /// Accept any certificate from an `https` upstream
    #[serde(default)]
    pub upstream_insecure: bool,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(with = "duration_secs")]
    pub request_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub reconnect_delay: Duration,
}

/// Helper module for serializing Duration as seconds
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            hub: String::new(),
            access_token: String::new(),
            upstream: DEFAULT_UPSTREAM.to_string(),
            upstream_insecure: false,
            target: None,
            request_timeout: Duration::from_secs(100),
            connect_timeout: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(1),
        }
    }
}

impl TunnelConfig {
    pub fn builder() -> TunnelConfigBuilder {
        TunnelConfigBuilder::default()
    }

    /// Load from `HUBTUNNEL_*` environment variables
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, String> {
        let mut builder = Self::builder();

        if let Some(endpoint) = lookup("HUBTUNNEL_ENDPOINT") {
            builder = builder.endpoint(endpoint);
        }
        if let Some(hub) = lookup("HUBTUNNEL_HUB") {
            builder = builder.hub(hub);
        }
        if let Some(token) = lookup("HUBTUNNEL_TOKEN") {
            builder = builder.access_token(token);
        }
        if let Some(upstream) = lookup("HUBTUNNEL_UPSTREAM") {
            builder = builder.upstream(upstream);
        }
        if let Some(insecure) = lookup("HUBTUNNEL_UPSTREAM_INSECURE") {
            let insecure = match insecure.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => true,
                "" | "0" | "false" | "no" => false,
                _ => return Err(format!("HUBTUNNEL_UPSTREAM_INSECURE is not a flag: {}", insecure)),
            };
            builder = builder.upstream_insecure(insecure);
        }
        if let Some(target) = lookup("HUBTUNNEL_TARGET").filter(|t| !t.is_empty()) {
            builder = builder.target(target);
        }
        if let Some(secs) = lookup("HUBTUNNEL_REQUEST_TIMEOUT_SECS") {
            let secs: u64 = secs
                .trim()
                .parse()
                .map_err(|_| format!("HUBTUNNEL_REQUEST_TIMEOUT_SECS is not a number: {}", secs))?;
            builder = builder.request_timeout(Duration::from_secs(secs));
        }

        builder.build()
    }

    pub fn endpoint_url(&self) -> Result<Url, String> {
        Url::parse(&self.endpoint)
            .map_err(|e| format!("invalid endpoint '{}': {}", self.endpoint, e))
    }

    pub fn upstream_url(&self) -> Result<Url, String> {
        Url::parse(&self.upstream)
            .map_err(|e| format!("invalid upstream '{}': {}", self.upstream, e))
    }

    /// Options for the tunnel connection manager
    pub fn connection_options(&self) -> Result<TunnelConnectionOptions, String> {
        let mut options = TunnelConnectionOptions::new(self.endpoint_url()?, &self.hub);
        options.target = self.target.clone();
        options.reconnect_delay = self.reconnect_delay;
        options.websocket = options.websocket.with_connect_timeout(self.connect_timeout);
        Ok(options)
    }

    /// Options for the request dispatcher
    pub fn service_options(&self) -> Result<TunnelServiceOptions, String> {
        Ok(TunnelServiceOptions {
            upstream: self.upstream_url()?,
            request_timeout: self.request_timeout,
            insecure_upstream: self.upstream_insecure,
        })
    }
}

/// Builder for TunnelConfig
#[derive(Default)]
pub struct TunnelConfigBuilder {
    config: TunnelConfig,
}

impl TunnelConfigBuilder {
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.config.endpoint = endpoint.into();
        self
    }

    pub fn hub(mut self, hub: impl Into<String>) -> Self {
        self.config.hub = hub.into();
        self
    }

    pub fn access_token(mut self, token: impl Into<String>) -> Self {
        self.config.access_token = token.into();
        self
    }

    pub fn upstream(mut self, upstream: impl Into<String>) -> Self {
        self.config.upstream = upstream.into();
        self
    }

    pub fn upstream_insecure(mut self, insecure: bool) -> Self {
        self.config.upstream_insecure = insecure;
        self
    }

    /// Shorthand for `http://localhost:<port>`
    pub fn local_port(mut self, port: u16) -> Self {
        self.config.upstream = format!("http://localhost:{}", port);
        self
    }

    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.config.target = Some(target.into());
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.config.reconnect_delay = delay;
        self
    }

    pub fn build(self) -> Result<TunnelConfig, String> {
        if self.config.endpoint.is_empty() {
            return Err("endpoint is required".to_string());
        }
        if self.config.hub.is_empty() {
            return Err("hub is required".to_string());
        }
        let endpoint = self.config.endpoint_url()?;
        if endpoint.cannot_be_a_base() {
            return Err(format!("endpoint '{}' is not a base URL", endpoint));
        }
        let upstream = self.config.upstream_url()?;
        if !matches!(upstream.scheme(), "http" | "https") || upstream.host_str().is_none() {
            return Err(format!(
                "upstream '{}' must be an http:// or https:// URL",
                upstream
            ));
        }
        if self.config.request_timeout.is_zero() {
            return Err("request_timeout must be greater than zero".to_string());
        }
        Ok(self.config)
    }
}
