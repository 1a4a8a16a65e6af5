//! Codec for encoding/decoding tunnel messages
//!
//! Frame layout:
//!
//! ```text
//! [length: u32 little-endian][payload: MessagePack array]
//! payload = [type_id: int, body: str (JSON), content: bin?]
//! ```
//!
//! `body` holds the message fields as JSON. Only requests and responses carry
//! `content`; other messages are sent as two-element arrays. Peers may send a
//! nil third element, and elements past the third are ignored.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::{self, IgnoredAny, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use serde_bytes::ByteBuf;
use thiserror::Error;
use tracing::trace;

use crate::messages::{
    HttpRequestMessage, HttpResponseMessage, TunnelMessage, TunnelMessageType,
};

/// Codec errors. Every decode error means the byte stream can no longer be
/// trusted.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("MessagePack encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("MessagePack decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("Message body error: {0}")]
    Body(#[from] serde_json::Error),

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("Unknown message type: {0}")]
    UnknownMessageType(u64),

    #[error("Message of type {0} has no body")]
    MissingBody(u64),
}

/// Tunnel message codec
pub struct TunnelCodec;

impl TunnelCodec {
    /// Size of the little-endian length prefix
    pub const LENGTH_PREFIX_SIZE: usize = 4;

    /// Maximum payload size (16MB)
    pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

    /// Encode a tunnel message into a standalone frame
    pub fn encode(msg: &TunnelMessage) -> Result<Bytes, CodecError> {
        let mut buf = BytesMut::with_capacity(Self::size_hint(msg));
        Self::write(msg, &mut buf)?;
        Ok(buf.freeze())
    }

    /// Append one frame for `msg` to `buf`, returning the number of bytes written.
    ///
    /// On error `buf` is left as it was.
    pub fn write(msg: &TunnelMessage, buf: &mut BytesMut) -> Result<usize, CodecError> {
        let start = buf.len();
        buf.put_u32_le(0);

        if let Err(e) = write_payload(msg, buf) {
            buf.truncate(start);
            return Err(e);
        }

        let payload_len = buf.len() - start - Self::LENGTH_PREFIX_SIZE;
        if payload_len > Self::MAX_MESSAGE_SIZE {
            buf.truncate(start);
            return Err(CodecError::MessageTooLarge(payload_len));
        }

        buf[start..start + Self::LENGTH_PREFIX_SIZE]
            .copy_from_slice(&(payload_len as u32).to_le_bytes());
        Ok(Self::LENGTH_PREFIX_SIZE + payload_len)
    }

    /// Try to parse one message from the front of `buf`.
    ///
    /// Returns Ok(Some(message)) and consumes exactly one frame when a complete
    /// frame is buffered, Ok(None) without consuming anything when more bytes
    /// are needed, and Err when the frame is malformed.
    pub fn try_parse(buf: &mut BytesMut) -> Result<Option<TunnelMessage>, CodecError> {
        if buf.len() < Self::LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let mut length_bytes = [0u8; Self::LENGTH_PREFIX_SIZE];
        length_bytes.copy_from_slice(&buf[..Self::LENGTH_PREFIX_SIZE]);
        let length = u32::from_le_bytes(length_bytes) as usize;

        if length > Self::MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(length));
        }

        if buf.len() < Self::LENGTH_PREFIX_SIZE + length {
            return Ok(None);
        }

        buf.advance(Self::LENGTH_PREFIX_SIZE);
        let payload = buf.split_to(length);
        trace!("Parsing tunnel frame of {} bytes", length);

        parse_payload(&payload).map(Some)
    }

    fn size_hint(msg: &TunnelMessage) -> usize {
        let content = match msg {
            TunnelMessage::HttpRequest(req) => req.content.len() + req.url.len(),
            TunnelMessage::HttpResponse(resp) => resp.content.len(),
            _ => 0,
        };
        Self::LENGTH_PREFIX_SIZE + 256 + content
    }
}

/// JSON body; `Type` is repeated inside it the way the service writes it
#[derive(Serialize)]
struct Body<'a, T: Serialize> {
    #[serde(rename = "Type")]
    message_type: u64,
    #[serde(flatten)]
    message: &'a T,
}

fn body_json<T: Serialize>(message_type: u64, message: &T) -> Result<String, CodecError> {
    Ok(serde_json::to_string(&Body {
        message_type,
        message,
    })?)
}

fn write_payload(msg: &TunnelMessage, buf: &mut BytesMut) -> Result<(), CodecError> {
    let type_id = msg.message_type().id();
    let (body, content) = match msg {
        TunnelMessage::HttpRequest(m) => (body_json(type_id, m)?, Some(&m.content)),
        TunnelMessage::HttpResponse(m) => (body_json(type_id, m)?, Some(&m.content)),
        TunnelMessage::ServiceStatus(m) => (body_json(type_id, m)?, None),
        TunnelMessage::Reconnect(m) | TunnelMessage::Rebalance(m) => {
            (body_json(type_id, m)?, None)
        }
        TunnelMessage::Close(m) => (body_json(type_id, m)?, None),
        TunnelMessage::Connected(m) => (body_json(type_id, m)?, None),
    };

    let mut writer = BufMut::writer(&mut *buf);
    match content {
        Some(content) => rmp_serde::encode::write(
            &mut writer,
            &(type_id, body, serde_bytes::Bytes::new(content)),
        )?,
        None => rmp_serde::encode::write(&mut writer, &(type_id, body))?,
    }
    Ok(())
}

/// The MessagePack array before the body is interpreted
struct RawFrame {
    type_id: u64,
    body: Option<String>,
    content: Option<ByteBuf>,
}

impl<'de> Deserialize<'de> for RawFrame {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_seq(RawFrameVisitor)
    }
}

struct RawFrameVisitor;

impl<'de> Visitor<'de> for RawFrameVisitor {
    type Value = RawFrame;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("an array [type, body, content?]")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<RawFrame, A::Error> {
        let type_id = seq
            .next_element::<u64>()?
            .ok_or_else(|| de::Error::invalid_length(0, &self))?;
        let body = seq.next_element::<Option<String>>()?.flatten();
        let content = seq.next_element::<Option<ByteBuf>>()?.flatten();
        while seq.next_element::<IgnoredAny>()?.is_some() {}

        Ok(RawFrame {
            type_id,
            body,
            content,
        })
    }
}

fn from_body<'a, T: Deserialize<'a>>(body: &'a str) -> Result<T, CodecError> {
    Ok(serde_json::from_str(body)?)
}

fn parse_payload(payload: &[u8]) -> Result<TunnelMessage, CodecError> {
    let frame: RawFrame = rmp_serde::from_slice(payload)?;
    let message_type = TunnelMessageType::from_id(frame.type_id)
        .ok_or(CodecError::UnknownMessageType(frame.type_id))?;
    let body = frame.body.ok_or(CodecError::MissingBody(frame.type_id))?;
    let content = frame
        .content
        .map(|content| Bytes::from(content.into_vec()))
        .unwrap_or_default();

    Ok(match message_type {
        TunnelMessageType::HttpRequest => {
            let mut request: HttpRequestMessage = from_body(&body)?;
            request.content = content;
            TunnelMessage::HttpRequest(request)
        }
        TunnelMessageType::HttpResponse => {
            let mut response: HttpResponseMessage = from_body(&body)?;
            response.content = content;
            TunnelMessage::HttpResponse(response)
        }
        TunnelMessageType::ServiceStatus => TunnelMessage::ServiceStatus(from_body(&body)?),
        TunnelMessageType::ConnectionReconnect => TunnelMessage::Reconnect(from_body(&body)?),
        TunnelMessageType::ConnectionClose => TunnelMessage::Close(from_body(&body)?),
        TunnelMessageType::ConnectionRebalance => TunnelMessage::Rebalance(from_body(&body)?),
        TunnelMessageType::ConnectionConnected => TunnelMessage::Connected(from_body(&body)?),
    })
}
