//! Error types for the Soulseek client
//!
//! This module defines comprehensive error types for all components
//! of the client subsystem, plus the failure classification used by
//! the per-peer failure ledger.

use std::fmt;

/// Comprehensive error type for Soulseek client operations
#[derive(Debug, Clone)]
pub enum SlskError {
    /// Wire protocol errors (bad frames, truncated payloads)
    ProtocolError {
        message: String,
        source: Option<String>,
    },

    /// Central server errors (login rejection, broken session)
    ServerError {
        message: String,
        source: Option<String>,
    },

    /// Peer connection errors
    PeerError {
        message: String,
        peer: Option<String>,
        source: Option<String>,
    },

    /// Transport-level errors (refused, reset, broken pipe)
    ConnectionError {
        message: String,
        address: Option<String>,
        source: Option<String>,
    },

    /// Operation timed out
    TimeoutError {
        message: String,
        operation: Option<String>,
    },

    /// File transfer errors
    TransferError {
        message: String,
        peer: Option<String>,
        source: Option<String>,
    },

    /// The remote peer does not share the requested file
    FileNotFound {
        file: String,
        peer: Option<String>,
    },

    /// Search errors
    SearchError {
        message: String,
    },

    /// Distributed reconnect lock errors
    LockError {
        message: String,
        source: Option<String>,
    },

    /// Another process (or task) is already reconnecting this session
    AlreadyConnecting,

    /// The session circuit breaker is open
    CircuitOpen {
        retry_in_secs: u64,
    },

    /// Configuration errors
    ConfigError {
        message: String,
        field: Option<String>,
    },
}

/// Failure classification for the per-peer failure ledger.
///
/// Only `PeerUnreachable`, `Timeout` and `Transport` count against a
/// peer's trust score; a missing file is a content issue, not a
/// reliability issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    PeerUnreachable,
    Timeout,
    Transport,
    FileNotFound,
    Unknown,
}

impl FailureKind {
    /// Classify a raw I/O error by its kind
    pub fn from_io(err: &std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::ConnectionRefused | ErrorKind::HostUnreachable | ErrorKind::AddrNotAvailable => {
                FailureKind::PeerUnreachable
            }
            ErrorKind::TimedOut => FailureKind::Timeout,
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof
            | ErrorKind::WriteZero => FailureKind::Transport,
            _ => FailureKind::Unknown,
        }
    }

    /// Whether this failure feeds the per-peer failure ledger
    pub fn counts_against_peer(&self) -> bool {
        matches!(
            self,
            FailureKind::PeerUnreachable | FailureKind::Timeout | FailureKind::Transport
        )
    }
}

impl SlskError {
    /// Create a new ProtocolError
    pub fn protocol_error(message: impl Into<String>) -> Self {
        SlskError::ProtocolError {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new ProtocolError with source
    pub fn protocol_error_with_source(message: impl Into<String>, source: impl Into<String>) -> Self {
        SlskError::ProtocolError {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create a new ServerError
    pub fn server_error(message: impl Into<String>) -> Self {
        SlskError::ServerError {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new ServerError with source
    pub fn server_error_with_source(message: impl Into<String>, source: impl Into<String>) -> Self {
        SlskError::ServerError {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create a new PeerError
    pub fn peer_error(message: impl Into<String>) -> Self {
        SlskError::PeerError {
            message: message.into(),
            peer: None,
            source: None,
        }
    }

    /// Create a new PeerError with peer name
    pub fn peer_error_with_peer(message: impl Into<String>, peer: impl Into<String>) -> Self {
        SlskError::PeerError {
            message: message.into(),
            peer: Some(peer.into()),
            source: None,
        }
    }

    /// Create a new PeerError with peer and source
    pub fn peer_error_full(
        message: impl Into<String>,
        peer: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        SlskError::PeerError {
            message: message.into(),
            peer: Some(peer.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new ConnectionError
    pub fn connection_error(message: impl Into<String>) -> Self {
        SlskError::ConnectionError {
            message: message.into(),
            address: None,
            source: None,
        }
    }

    /// Create a new ConnectionError with address and source
    pub fn connection_error_full(
        message: impl Into<String>,
        address: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        SlskError::ConnectionError {
            message: message.into(),
            address: Some(address.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new TimeoutError
    pub fn timeout(message: impl Into<String>) -> Self {
        SlskError::TimeoutError {
            message: message.into(),
            operation: None,
        }
    }

    /// Create a new TimeoutError naming the operation
    pub fn timeout_during(message: impl Into<String>, operation: impl Into<String>) -> Self {
        SlskError::TimeoutError {
            message: message.into(),
            operation: Some(operation.into()),
        }
    }

    /// Create a new TransferError
    pub fn transfer_error(message: impl Into<String>) -> Self {
        SlskError::TransferError {
            message: message.into(),
            peer: None,
            source: None,
        }
    }

    /// Create a new TransferError with peer and source
    pub fn transfer_error_full(
        message: impl Into<String>,
        peer: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        SlskError::TransferError {
            message: message.into(),
            peer: Some(peer.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new FileNotFound error
    pub fn file_not_found(file: impl Into<String>, peer: impl Into<String>) -> Self {
        SlskError::FileNotFound {
            file: file.into(),
            peer: Some(peer.into()),
        }
    }

    /// Create a new SearchError
    pub fn search_error(message: impl Into<String>) -> Self {
        SlskError::SearchError {
            message: message.into(),
        }
    }

    /// Create a new LockError
    pub fn lock_error(message: impl Into<String>) -> Self {
        SlskError::LockError {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new LockError with source
    pub fn lock_error_with_source(message: impl Into<String>, source: impl Into<String>) -> Self {
        SlskError::LockError {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create a new ConfigError
    pub fn config_error(message: impl Into<String>) -> Self {
        SlskError::ConfigError {
            message: message.into(),
            field: None,
        }
    }

    /// Create a new ConfigError with field
    pub fn config_error_with_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        SlskError::ConfigError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Classify the error for the per-peer failure ledger
    pub fn classify(&self) -> FailureKind {
        match self {
            SlskError::ConnectionError { source, .. } => match source.as_deref() {
                Some(s) if s.contains("refused") || s.contains("unreachable") => {
                    FailureKind::PeerUnreachable
                }
                Some(s) if s.contains("timed out") => FailureKind::Timeout,
                _ => FailureKind::Transport,
            },
            SlskError::TimeoutError { .. } => FailureKind::Timeout,
            SlskError::TransferError { .. } => FailureKind::Transport,
            SlskError::PeerError { .. } => FailureKind::PeerUnreachable,
            SlskError::FileNotFound { .. } => FailureKind::FileNotFound,
            _ => FailureKind::Unknown,
        }
    }
}

impl fmt::Display for SlskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlskError::ProtocolError { message, source } => {
                if let Some(src) = source {
                    write!(f, "Protocol error: {} (source: {})", message, src)
                } else {
                    write!(f, "Protocol error: {}", message)
                }
            }
            SlskError::ServerError { message, source } => {
                if let Some(src) = source {
                    write!(f, "Server error: {} (source: {})", message, src)
                } else {
                    write!(f, "Server error: {}", message)
                }
            }
            SlskError::PeerError { message, peer, source } => match (peer, source) {
                (Some(p), Some(s)) => write!(f, "Peer error: {} (peer: {}, source: {})", message, p, s),
                (Some(p), None) => write!(f, "Peer error: {} (peer: {})", message, p),
                (None, Some(s)) => write!(f, "Peer error: {} (source: {})", message, s),
                (None, None) => write!(f, "Peer error: {}", message),
            },
            SlskError::ConnectionError { message, address, source } => match (address, source) {
                (Some(a), Some(s)) => {
                    write!(f, "Connection error: {} (address: {}, source: {})", message, a, s)
                }
                (Some(a), None) => write!(f, "Connection error: {} (address: {})", message, a),
                (None, Some(s)) => write!(f, "Connection error: {} (source: {})", message, s),
                (None, None) => write!(f, "Connection error: {}", message),
            },
            SlskError::TimeoutError { message, operation } => {
                if let Some(op) = operation {
                    write!(f, "Timeout: {} (operation: {})", message, op)
                } else {
                    write!(f, "Timeout: {}", message)
                }
            }
            SlskError::TransferError { message, peer, source } => match (peer, source) {
                (Some(p), Some(s)) => {
                    write!(f, "Transfer error: {} (peer: {}, source: {})", message, p, s)
                }
                (Some(p), None) => write!(f, "Transfer error: {} (peer: {})", message, p),
                (None, Some(s)) => write!(f, "Transfer error: {} (source: {})", message, s),
                (None, None) => write!(f, "Transfer error: {}", message),
            },
            SlskError::FileNotFound { file, peer } => {
                if let Some(p) = peer {
                    write!(f, "File not found: {} (peer: {})", file, p)
                } else {
                    write!(f, "File not found: {}", file)
                }
            }
            SlskError::SearchError { message } => write!(f, "Search error: {}", message),
            SlskError::LockError { message, source } => {
                if let Some(src) = source {
                    write!(f, "Lock error: {} (source: {})", message, src)
                } else {
                    write!(f, "Lock error: {}", message)
                }
            }
            SlskError::AlreadyConnecting => {
                write!(f, "Connection already in progress")
            }
            SlskError::CircuitOpen { retry_in_secs } => {
                write!(f, "Circuit breaker open (retry in {}s)", retry_in_secs)
            }
            SlskError::ConfigError { message, field } => {
                if let Some(field_val) = field {
                    write!(f, "Config error: {} (field: {})", message, field_val)
                } else {
                    write!(f, "Config error: {}", message)
                }
            }
        }
    }
}

impl std::error::Error for SlskError {}

// Implement From traits for common error types

impl From<std::io::Error> for SlskError {
    fn from(err: std::io::Error) -> Self {
        SlskError::ConnectionError {
            message: err.to_string(),
            address: None,
            source: Some(err.kind().to_string()),
        }
    }
}

impl From<tokio::time::error::Elapsed> for SlskError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        SlskError::timeout(err.to_string())
    }
}
