//! adslproxy-agent: the edge half of the tunnel broker.
//!
//! Keeps one authenticated session open to the rendezvous server, registers
//! named forwards, splices server-opened streams to local backends, and
//! re-dials the WAN link when the server asks for it.

pub mod agent;
pub mod proxy;
pub mod redial;
pub mod tls;

pub use agent::{Agent, AgentConfig};
pub use proxy::ProxyCredential;
pub use redial::{platform_redialer, AdslConfig, Redialer};
