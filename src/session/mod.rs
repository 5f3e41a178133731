//! Session resilience layer
//!
//! Wraps one client with reconnect backoff, a cross-process reconnect
//! lock, a per-peer failure ledger with circuit breaking, and download
//! retry across ranked candidates.

pub mod backoff;
pub mod breaker;
pub mod failures;
pub mod lock;
pub mod manager;

pub use backoff::Backoff;
pub use breaker::CircuitBreaker;
pub use failures::PeerFailureLedger;
pub use lock::{FileReconnectLock, InProcessReconnectLock, ReconnectLock};
pub use manager::{ConnectionHealth, DownloadOutcome, SessionManager};
