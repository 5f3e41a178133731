//! Search session accumulator
//!
//! One session per outstanding search token. Peers reply over their
//! own connections; the orchestrator routes each reply into the
//! session matching its token until the response cap or deadline
//! tears the session down.

use serde::Serialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::trace;

use crate::protocol::peer::SearchReply;

/// One file offered by one peer in response to a search
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchHit {
    pub username: String,
    /// Full remote path, backslash-separated
    pub filename: String,
    pub size: u64,
    pub extension: String,
    pub bitrate: Option<u32>,
    pub slots_free: bool,
    pub avg_speed: u32,
    pub queue_length: u32,
}

impl SearchHit {
    /// The bare filename, without the remote directory part
    pub fn base_name(&self) -> &str {
        base_name(&self.filename)
    }
}

/// The bare filename of a backslash- or slash-separated remote path
pub fn base_name(path: &str) -> &str {
    path.rsplit(|c| c == '\\' || c == '/').next().unwrap_or(path)
}

/// Cutoff policy for one search
#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub timeout: Duration,
    pub max_responses: usize,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(8),
            max_responses: 50,
        }
    }
}

/// Accumulator for one outstanding search token
#[derive(Debug)]
pub struct SearchSession {
    pub token: u32,
    pub query: String,
    tx: mpsc::Sender<SearchHit>,
}

impl SearchSession {
    /// Create a session and the channel its hits drain from
    pub fn new(token: u32, query: String, capacity: usize) -> (Self, mpsc::Receiver<SearchHit>) {
        let (tx, rx) = mpsc::channel(capacity.max(8));
        (Self { token, query, tx }, rx)
    }

    /// Feed one peer reply into the session. Hits past the channel
    /// capacity are dropped; the collector has already seen enough.
    pub fn push_reply(&self, reply: &SearchReply) {
        for file in &reply.files {
            let hit = SearchHit {
                username: reply.username.clone(),
                filename: file.name.clone(),
                size: file.size,
                extension: file.extension.clone(),
                bitrate: file.bitrate(),
                slots_free: reply.slots_free,
                avg_speed: reply.avg_speed,
                queue_length: reply.queue_length,
            };
            if self.tx.try_send(hit).is_err() {
                trace!("Search {} dropping overflow hit from {}", self.token, reply.username);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::peer::SharedFile;

    fn reply(username: &str, files: Vec<SharedFile>) -> SearchReply {
        SearchReply {
            username: username.to_string(),
            token: 9,
            files,
            slots_free: true,
            avg_speed: 100_000,
            queue_length: 2,
        }
    }

    #[test]
    fn test_base_name() {
        assert_eq!(base_name("music\\Artist\\01 - Song.flac"), "01 - Song.flac");
        assert_eq!(base_name("music/Artist/01 - Song.flac"), "01 - Song.flac");
        assert_eq!(base_name("song.mp3"), "song.mp3");
    }

    #[tokio::test]
    async fn test_push_reply_converts_files() {
        let (session, mut rx) = SearchSession::new(9, "artist song".to_string(), 8);
        session.push_reply(&reply(
            "alice",
            vec![SharedFile {
                name: "music\\song.mp3".to_string(),
                size: 5_000_000,
                extension: "mp3".to_string(),
                attributes: vec![(0, 320)],
            }],
        ));

        let hit = rx.recv().await.unwrap();
        assert_eq!(hit.username, "alice");
        assert_eq!(hit.bitrate, Some(320));
        assert!(hit.slots_free);
        assert_eq!(hit.base_name(), "song.mp3");
    }

    #[tokio::test]
    async fn test_overflow_hits_dropped() {
        let (session, mut rx) = SearchSession::new(9, "q".to_string(), 8);
        let files: Vec<SharedFile> = (0..20)
            .map(|i| SharedFile {
                name: format!("music\\{}.mp3", i),
                size: 1,
                extension: "mp3".to_string(),
                attributes: vec![],
            })
            .collect();
        session.push_reply(&reply("bob", files));

        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, 8);
    }

    #[test]
    fn test_search_hit_serializes() {
        let hit = SearchHit {
            username: "alice".to_string(),
            filename: "music\\song.flac".to_string(),
            size: 1,
            extension: "flac".to_string(),
            bitrate: None,
            slots_free: false,
            avg_speed: 0,
            queue_length: 0,
        };
        let json = serde_json::to_value(&hit).unwrap();
        assert_eq!(json["username"], "alice");
        assert_eq!(json["slots_free"], false);
    }
}
