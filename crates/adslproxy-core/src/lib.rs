//! adslproxy-core: shared protocol library for the adslproxy tunnel broker.
//!
//! Provides the CBOR control frames and framing codec, the per-operation
//! deadline transport wrapper, the multiplexed agent/server session, and the
//! bidirectional splice primitive.

pub mod codec;
pub mod error;
pub mod message;
pub mod session;
pub mod splice;
pub mod timeout;

// Re-export commonly used items at crate root.
pub use error::{TunnelError, TunnelResult};
pub use message::{
    parse_user_id, ForwardSpec, Frame, CONNECT_TIMEOUT, HEARTBEAT_INTERVAL, KEEPALIVE,
    PROTOCOL_VERSION, READ_TIMEOUT, RECONNECT, WRITE_TIMEOUT,
};
pub use session::{IncomingStream, Role, Session, SessionEvents, TunnelStream};
pub use splice::splice;
pub use timeout::TimedStream;
