//! Socket wrappers
//!
//! Each connection type wraps one TCP socket plus a framer and
//! re-emits decoded messages and lifecycle events over a typed
//! channel. Sends are best-effort: a closed socket makes `send` a
//! no-op, never an error.

pub mod listener;
pub mod peer;
pub mod server;

pub use listener::{InboundConnection, Listener};
pub use peer::{ConnectVia, PeerConnection, PeerEvent};
pub use server::{ServerConnection, ServerEvent};
