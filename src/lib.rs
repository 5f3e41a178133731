//! slsk-client
//!
//! A Soulseek peer-to-peer client subsystem: binary wire protocol,
//! network login, distributed file search with ranking heuristics, and
//! chunked, resumable file downloads with a resilience layer
//! (reconnect backoff, cross-process reconnect exclusion, per-peer
//! circuit breaking).

pub mod client;
pub mod config;
pub mod error;
pub mod net;
pub mod protocol;
pub mod search;
pub mod session;

pub use error::{FailureKind, SlskError};

pub use config::{ClientConfig, Credentials, SessionConfig};
pub use client::{Client, ClientEvent, DownloadHandle, DownloadStatus};
pub use net::{ConnectVia, Listener, PeerConnection, ServerConnection};
pub use protocol::{
    ConnKind, Frame, MessageFramer, PeerMessage, SearchReply, ServerRequest, ServerResponse,
    SharedFile, TransferDirection,
};
pub use search::{
    build_queries, is_audio_file, rank, run_strategies, RankedHit, RankerWeights, SearchHit,
    SearchOptions, TrackQuery,
};
pub use session::{
    Backoff, CircuitBreaker, ConnectionHealth, DownloadOutcome, FileReconnectLock,
    InProcessReconnectLock, PeerFailureLedger, ReconnectLock, SessionManager,
};
