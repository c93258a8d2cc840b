//! Embedded local proxy backends.
//!
//! When enabled, the agent hosts a plain HTTP proxy and a SOCKS5 proxy on
//! ephemeral localhost ports and registers one forward for each, so the
//! server's public listeners tunnel straight back to them. They are ordinary
//! TCP backends as far as the tunnel core is concerned.

pub mod http;
pub mod socks5;

/// Optional shared credential gating both embedded proxies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyCredential {
    pub username: String,
    pub password: String,
}
