//! Client event surface
//!
//! Categorized error and status events consumed by collaborating
//! subsystems (REST layer, library import). Serialized tags follow
//! the kebab-case contract those consumers expect.

use serde::Serialize;

/// An event emitted on the client's broadcast channel
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ClientEvent {
    /// The server connection failed or was rejected
    ServerError { message: String },
    /// A peer connection failed
    PeerError { username: String, message: String },
    /// A client-internal failure that did not kill the session
    ClientError { message: String },
    /// The listen socket failed
    ListenError { message: String },
    /// A download was assigned a queue position
    DownloadQueued {
        username: String,
        filename: String,
        place: u32,
    },
    /// A download's transfer was granted; total size is now known
    DownloadStarted {
        username: String,
        filename: String,
        total: u64,
    },
    /// Bytes arrived on a download's transfer socket
    DownloadProgress {
        username: String,
        filename: String,
        received: u64,
        total: u64,
    },
    /// A download finished and its file is in place
    DownloadComplete {
        username: String,
        filename: String,
        path: String,
    },
    /// A download ended without completing; partial output was removed
    DownloadFailed {
        username: String,
        filename: String,
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories_serialize_kebab_case() {
        let event = ClientEvent::ServerError {
            message: "connection closed".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "server-error");

        let event = ClientEvent::ListenError {
            message: "bind failed".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "listen-error");

        let event = ClientEvent::PeerError {
            username: "alice".to_string(),
            message: "reset".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "peer-error");
        assert_eq!(json["username"], "alice");

        let event = ClientEvent::ClientError {
            message: "lock failure".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "client-error");
    }

    #[test]
    fn test_download_events_serialize() {
        let event = ClientEvent::DownloadProgress {
            username: "bob".to_string(),
            filename: "music\\song.mp3".to_string(),
            received: 1024,
            total: 4096,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "download-progress");
        assert_eq!(json["received"], 1024);
    }
}
