//! Protocol message types
//!
//! Message bodies travel as JSON with PascalCase field names. Byte content is
//! carried next to the JSON in the frame, never inside it.

use std::borrow::Cow;
use std::fmt::{self, Write as _};
use std::marker::PhantomData;

use bytes::Bytes;
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Wire discriminator for each message variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TunnelMessageType {
    HttpRequest = 1,
    HttpResponse = 2,
    ServiceStatus = 5,
    ConnectionReconnect = 6,
    ConnectionClose = 7,
    ConnectionRebalance = 8,
    ConnectionConnected = 10,
}

impl TunnelMessageType {
    pub fn from_id(id: u64) -> Option<Self> {
        Some(match id {
            1 => Self::HttpRequest,
            2 => Self::HttpResponse,
            5 => Self::ServiceStatus,
            6 => Self::ConnectionReconnect,
            7 => Self::ConnectionClose,
            8 => Self::ConnectionRebalance,
            10 => Self::ConnectionConnected,
            _ => return None,
        })
    }

    pub fn id(self) -> u64 {
        self as u64
    }
}

/// Header values as they appear in the JSON body
pub trait HeaderText: Sized {
    fn as_text(&self) -> Cow<'_, str>;
    fn from_text(text: String) -> Self;
}

impl HeaderText for String {
    fn as_text(&self) -> Cow<'_, str> {
        Cow::Borrowed(self)
    }

    fn from_text(text: String) -> Self {
        text
    }
}

impl HeaderText for Bytes {
    fn as_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(self)
    }

    fn from_text(text: String) -> Self {
        Bytes::from(text)
    }
}

/// Ordered multi-value header map.
///
/// Keeps insertion order so a decoded message compares equal to the one that
/// was encoded. Lookups are ASCII case-insensitive, as HTTP header names are.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Headers<V> {
    entries: Vec<(String, Vec<V>)>,
}

impl<V> Default for Headers<V> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<V> Headers<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    /// Replace all values for `name`
    pub fn insert(&mut self, name: impl Into<String>, values: Vec<V>) {
        let name = name.into();
        match self.position(&name) {
            Some(idx) => self.entries[idx].1 = values,
            None => self.entries.push((name, values)),
        }
    }

    /// Add one value for `name`, keeping the values already present
    pub fn append(&mut self, name: impl Into<String>, value: V) {
        self.extend(name, std::iter::once(value));
    }

    /// Add values for `name` after the ones already present. Creates the
    /// entry even when `values` is empty.
    pub fn extend(&mut self, name: impl Into<String>, values: impl IntoIterator<Item = V>) {
        let name = name.into();
        match self.position(&name) {
            Some(idx) => self.entries[idx].1.extend(values),
            None => self.entries.push((name, values.into_iter().collect())),
        }
    }

    pub fn get(&self, name: &str) -> Option<&[V]> {
        self.position(name).map(|idx| self.entries[idx].1.as_slice())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[V])> {
        self.entries
            .iter()
            .map(|(name, values)| (name.as_str(), values.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|(existing, _)| existing.eq_ignore_ascii_case(name))
    }
}

impl<V: HeaderText> Serialize for Headers<V> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (name, values) in &self.entries {
            let texts: Vec<Cow<'_, str>> = values.iter().map(HeaderText::as_text).collect();
            map.serialize_entry(name, &texts)?;
        }
        map.end()
    }
}

impl<'de, V: HeaderText> Deserialize<'de> for Headers<V> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_map(HeadersVisitor(PhantomData))
    }
}

struct HeadersVisitor<V>(PhantomData<V>);

/// Peers may send `null` for the value list or for single values
type RawHeaderValues = Option<Vec<Option<String>>>;

impl<'de, V: HeaderText> Visitor<'de> for HeadersVisitor<V> {
    type Value = Headers<V>;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a map of header names to value arrays")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
        let mut headers = Headers::with_capacity(access.size_hint().unwrap_or(0).min(64));
        // Names differing only in case merge into one entry
        while let Some((name, values)) = access.next_entry::<String, RawHeaderValues>()? {
            let values = values
                .unwrap_or_default()
                .into_iter()
                .flatten()
                .map(V::from_text);
            headers.extend(name, values);
        }
        Ok(headers)
    }
}

/// Treats an explicit JSON `null` like a missing field
fn nullable<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// An HTTP request the service wants served by the local upstream
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct HttpRequestMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tracing_id: Option<u64>,
    /// Correlation id to echo back, when the service assigns one apart from
    /// the tracing id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ack_id: Option<u64>,
    #[serde(deserialize_with = "nullable")]
    pub http_method: String,
    #[serde(deserialize_with = "nullable")]
    pub url: String,
    #[serde(deserialize_with = "nullable")]
    pub headers: Headers<String>,
    #[serde(skip)]
    pub content: Bytes,
    #[serde(deserialize_with = "nullable")]
    pub channel_name: String,
    #[serde(alias = "LocalRouting", deserialize_with = "nullable")]
    pub global_routing: bool,
}

impl HttpRequestMessage {
    /// Id the response must carry
    pub fn correlation_id(&self) -> u64 {
        self.ack_id.or(self.tracing_id).unwrap_or_default()
    }

    /// Build the response correlated with this request
    pub fn response(
        &self,
        status_code: u16,
        headers: Headers<Bytes>,
        content: Bytes,
    ) -> HttpResponseMessage {
        HttpResponseMessage {
            ack_id: self.correlation_id(),
            global_routing: self.global_routing,
            status_code,
            channel_name: self.channel_name.clone(),
            headers,
            content,
        }
    }

    /// Render the request as an HTTP/1.1 text dump
    pub fn dump_raw(&self) -> String {
        let mut raw = format!("{} {} HTTP/1.1\r\n", self.http_method, self.url);
        for (name, values) in self.headers.iter() {
            let _ = write!(raw, "{}: {}\r\n", name, values.join(", "));
        }
        append_body(&mut raw, &self.content);
        raw
    }
}

/// The reply to an [`HttpRequestMessage`], matched through `ack_id`
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct HttpResponseMessage {
    pub ack_id: u64,
    #[serde(alias = "LocalRouting", deserialize_with = "nullable")]
    pub global_routing: bool,
    pub status_code: u16,
    #[serde(deserialize_with = "nullable")]
    pub channel_name: String,
    #[serde(deserialize_with = "nullable")]
    pub headers: Headers<Bytes>,
    #[serde(skip)]
    pub content: Bytes,
}

impl HttpResponseMessage {
    /// Render the response as an HTTP/1.1 text dump
    pub fn dump_raw(&self) -> String {
        let reason = http::StatusCode::from_u16(self.status_code)
            .ok()
            .and_then(|status| status.canonical_reason())
            .unwrap_or("");
        let mut raw = format!("HTTP/1.1 {} {}\r\n", self.status_code, reason);
        for (name, values) in self.headers.iter() {
            let joined = values
                .iter()
                .map(HeaderText::as_text)
                .collect::<Vec<_>>()
                .join(", ");
            let _ = write!(raw, "{}: {}\r\n", name, joined);
        }
        append_body(&mut raw, &self.content);
        raw
    }
}

fn append_body(raw: &mut String, content: &[u8]) {
    if content.is_empty() {
        return;
    }
    raw.push_str("\r\n");
    raw.push_str(&String::from_utf8_lossy(content));
}

/// Service asks the tunnel to reconnect, optionally somewhere else.
///
/// Also used for rebalance instructions, which carry the same fields.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ReconnectMessage {
    pub target_id: Option<String>,
    pub endpoint: Option<String>,
    #[serde(deserialize_with = "nullable")]
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct CloseMessage {
    #[serde(deserialize_with = "nullable")]
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ServiceStatusMessage {
    #[serde(deserialize_with = "nullable")]
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ConnectedMessage {
    #[serde(deserialize_with = "nullable")]
    pub connection_id: String,
    pub user_id: Option<String>,
    pub reconnection_token: Option<String>,
}

/// Main tunnel protocol message enum
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelMessage {
    HttpRequest(HttpRequestMessage),
    HttpResponse(HttpResponseMessage),
    ServiceStatus(ServiceStatusMessage),
    Reconnect(ReconnectMessage),
    Close(CloseMessage),
    Rebalance(ReconnectMessage),
    Connected(ConnectedMessage),
}

impl TunnelMessage {
    pub fn message_type(&self) -> TunnelMessageType {
        match self {
            Self::HttpRequest(_) => TunnelMessageType::HttpRequest,
            Self::HttpResponse(_) => TunnelMessageType::HttpResponse,
            Self::ServiceStatus(_) => TunnelMessageType::ServiceStatus,
            Self::Reconnect(_) => TunnelMessageType::ConnectionReconnect,
            Self::Close(_) => TunnelMessageType::ConnectionClose,
            Self::Rebalance(_) => TunnelMessageType::ConnectionRebalance,
            Self::Connected(_) => TunnelMessageType::ConnectionConnected,
        }
    }
}

impl From<HttpRequestMessage> for TunnelMessage {
    fn from(msg: HttpRequestMessage) -> Self {
        Self::HttpRequest(msg)
    }
}

impl From<HttpResponseMessage> for TunnelMessage {
    fn from(msg: HttpResponseMessage) -> Self {
        Self::HttpResponse(msg)
    }
}
