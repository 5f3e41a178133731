//! Per-peer failure ledger
//!
//! Rolling failure counts keyed by username. Crossing the threshold
//! inside the window blocks the peer from ranking for a cooldown;
//! every failure also starts a short fixed reconnect cooldown.
//! Expired entries are dropped by a scheduled cleanup, not an ambient
//! timer.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Windowed per-peer failure tracking with blocking
#[derive(Debug)]
pub struct PeerFailureLedger {
    window: Duration,
    threshold: u32,
    block_ttl: Duration,
    reconnect_cooldown: Duration,
    failures: HashMap<String, Vec<Instant>>,
    blocked_until: HashMap<String, Instant>,
    cooldown_until: HashMap<String, Instant>,
}

impl PeerFailureLedger {
    pub fn new(
        window: Duration,
        threshold: u32,
        block_ttl: Duration,
        reconnect_cooldown: Duration,
    ) -> Self {
        Self {
            window,
            threshold,
            block_ttl,
            reconnect_cooldown,
            failures: HashMap::new(),
            blocked_until: HashMap::new(),
            cooldown_until: HashMap::new(),
        }
    }

    /// Record one ledger-eligible failure for a peer
    pub fn record_failure(&mut self, username: &str) {
        let now = Instant::now();
        let entries = self.failures.entry(username.to_string()).or_default();
        entries.push(now);
        entries.retain(|at| now.duration_since(*at) <= self.window);

        self.cooldown_until
            .insert(username.to_string(), now + self.reconnect_cooldown);

        if entries.len() as u32 >= self.threshold {
            warn!(
                "Peer {} blocked after {} failures in window",
                username,
                entries.len()
            );
            self.blocked_until
                .insert(username.to_string(), now + self.block_ttl);
        } else {
            debug!(
                "Peer {} failure {}/{} in window",
                username,
                entries.len(),
                self.threshold
            );
        }
    }

    /// Whether the peer is blocked from ranking
    pub fn is_blocked(&self, username: &str) -> bool {
        self.blocked_until
            .get(username)
            .is_some_and(|until| Instant::now() < *until)
    }

    /// Whether the peer is inside its short reconnect cooldown
    pub fn in_cooldown(&self, username: &str) -> bool {
        self.cooldown_until
            .get(username)
            .is_some_and(|until| Instant::now() < *until)
    }

    /// Failures currently inside the window
    pub fn failure_count(&self, username: &str) -> usize {
        let now = Instant::now();
        self.failures
            .get(username)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|at| now.duration_since(**at) <= self.window)
                    .count()
            })
            .unwrap_or(0)
    }

    /// Drop expired failures, blocks and cooldowns
    pub fn cleanup(&mut self) {
        let now = Instant::now();
        self.failures.retain(|_, entries| {
            entries.retain(|at| now.duration_since(*at) <= self.window);
            !entries.is_empty()
        });
        self.blocked_until.retain(|_, until| now < *until);
        self.cooldown_until.retain(|_, until| now < *until);
    }

    /// Number of peers with live ledger state
    pub fn tracked_peers(&self) -> usize {
        self.failures.len()
    }
}
