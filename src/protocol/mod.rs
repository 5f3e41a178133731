//! Soulseek wire protocol
//!
//! Binary framing and message codecs for the server and peer
//! directions of the protocol.

pub mod frame;
pub mod peer;
pub mod server;
pub mod wire;

pub use frame::{Frame, MessageFramer};
pub use peer::{ConnKind, PeerMessage, SearchReply, SharedFile, TransferDirection};
pub use server::{ServerRequest, ServerResponse};
