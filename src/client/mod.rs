//! Client session orchestrator
//!
//! Owns the server connection, listen socket and active peer
//! connections; correlates search and download tokens; and drives the
//! download byte-stream state machine over dedicated transfer sockets.

pub mod acquire;
#[allow(clippy::module_inception)]
pub mod client;
pub mod download;
pub mod events;

pub use client::Client;
pub use download::{DownloadHandle, DownloadStatus};
pub use events::ClientEvent;
