//! Control frames exchanged between agent and server.
//!
//! Every frame travels as one length-prefixed CBOR value (see [`crate::codec`])
//! over the deadline-wrapped TLS transport. Byte streams and out-of-band
//! requests share the same framing; the [`Frame`] variant tag tells them apart.

use crate::error::{TunnelError, TunnelResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Protocol version string, sent in the `Hello` frame.
pub const PROTOCOL_VERSION: &str = "adslproxy-1";

/// Interval between liveness probes, on both peers.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Deadline armed before every transport read.
pub const READ_TIMEOUT: Duration = Duration::from_secs(6);

/// Deadline armed before every transport write.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(6);

/// TCP connect timeout for the agent dialing the server.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Request kind of the liveness probe. The server replies `true` to any
/// request whose kind contains this string.
pub const KEEPALIVE: &str = "keepalive";

/// Request kind that instructs the agent to drop the session and re-dial
/// its WAN link.
pub const RECONNECT: &str = "adslproxy-reconnect";

/// A named reverse forward as requested by the agent.
///
/// `bind_addr` is the public address the server should listen on (port 0 asks
/// the server to choose); `target` is what the agent dials locally when a
/// stream arrives. `options` is carried verbatim and never interpreted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardSpec {
    pub name: String,
    pub bind_addr: String,
    pub target: String,
    #[serde(default)]
    pub options: String,
}

impl ForwardSpec {
    pub fn new(name: &str, bind_addr: &str, target: &str) -> Self {
        Self {
            name: name.to_string(),
            bind_addr: bind_addr.to_string(),
            target: target.to_string(),
            options: String::new(),
        }
    }
}

impl std::fmt::Display for ForwardSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {} -> {}", self.name, self.bind_addr, self.target)
    }
}

/// All frames of the tunnel protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// First frame on every session, agent to server. `username` has the
    /// form `name@uuid`.
    Hello {
        version: String,
        username: String,
        token: String,
    },

    /// Handshake accepted; the session is live.
    AuthOk {},

    /// Handshake refused; the transport is closed right after.
    AuthFail { reason: String },

    /// Ask the server to open a public listener for a named forward.
    ForwardRequest {
        id: u64,
        name: String,
        bind_addr: String,
        target: String,
        options: String,
    },

    /// The listener is bound; `bound_addr` is the actual public address.
    ForwardOk { id: u64, bound_addr: String },

    /// The listener could not be bound. Only this forward is affected.
    ForwardFail { id: u64, reason: String },

    /// Out-of-band typed request expecting a boolean [`Frame::Reply`].
    Request {
        id: u64,
        kind: String,
        #[serde(with = "serde_bytes")]
        payload: Vec<u8>,
    },

    /// Boolean answer to a [`Frame::Request`] with the same `id`.
    Reply { id: u64, ok: bool },

    /// Server-initiated logical stream, routed by the agent to the backend
    /// configured for `forward`.
    StreamOpen { id: u32, forward: String },

    /// Ordered payload chunk for stream `id`.
    StreamData {
        id: u32,
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
    },

    /// Half of the pair is gone; the receiver drops its side too.
    StreamClose { id: u32 },
}

/// Split an advertised username of the form `name@uuid`.
///
/// The uuid part must parse as a UUID; everything else is rejected.
pub fn parse_user_id(username: &str) -> TunnelResult<(String, Uuid)> {
    if let Some((name, id)) = username.split_once('@') {
        if let Ok(id) = Uuid::parse_str(id) {
            return Ok((name.to_string(), id));
        }
    }

    Err(TunnelError::Auth(format!(
        "illegal format of username {username}"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_valid_username() {
        let uuid = Uuid::new_v4();
        let (name, id) = parse_user_id(&format!("demo@{uuid}")).unwrap();
        assert_eq!(name, "demo");
        assert_eq!(id, uuid);
    }

    #[test]
    fn reject_missing_separator() {
        assert!(parse_user_id("demo").is_err());
    }

    #[test]
    fn reject_bad_uuid() {
        assert!(parse_user_id("demo@not-a-uuid").is_err());
        assert!(parse_user_id("demo@").is_err());
    }
}
