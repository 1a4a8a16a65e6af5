//! Tunnel Protocol Definitions
//!
//! This crate defines the message types exchanged over the tunnel WebSocket and
//! the binary codec that frames them. It performs no I/O: callers feed it bytes
//! as they arrive and get complete messages back.

pub mod codec;
pub mod messages;

pub use codec::{CodecError, TunnelCodec};
pub use messages::*;

/// Path appended to the service endpoint to reach the tunnel WebSocket
pub const TUNNEL_PATH: &str = "server/tunnel";
