//! Configuration module
//!
//! Carries every tunable of the client and of the session resilience
//! layer, with validated defaults matching observed network behavior.

use anyhow::Result;
use std::path::PathBuf;
use std::time::Duration;

/// Default address of the Soulseek central server
pub const DEFAULT_SERVER_ADDR: &str = "server.slsknet.org:2242";

/// Protocol version advertised at login
pub const CLIENT_VERSION: u32 = 160;

/// Minor protocol version advertised at login
pub const MINOR_VERSION: u32 = 1;

/// Configuration for one client session
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Central server address (host:port)
    pub server_addr: String,
    /// Port for unsolicited inbound peer connections
    pub listen_port: u16,
    /// Timeout for dialing the server or a peer
    pub connect_timeout: Duration,
    /// Per-strategy bound on peer acquisition
    pub peer_timeout: Duration,
    /// Bound on reading the first frame of an inbound connection
    pub handshake_timeout: Duration,
    /// Largest acceptable wire frame; larger length prefixes tear the
    /// connection down
    pub max_frame_size: usize,
    /// Directory downloads are written into
    pub download_dir: PathBuf,
    /// Downloads with no activity for this long are swept
    pub transfer_idle_ttl: Duration,
    /// How often the idle-download sweep runs
    pub sweep_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: DEFAULT_SERVER_ADDR.to_string(),
            listen_port: 2234,
            connect_timeout: Duration::from_secs(10),
            peer_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(5),
            max_frame_size: 16 * 1024 * 1024,
            download_dir: PathBuf::from("./downloads"),
            transfer_idle_ttl: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl ClientConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.server_addr.is_empty() {
            return Err(anyhow::anyhow!("server_addr cannot be empty"));
        }

        if self.max_frame_size < 8 {
            return Err(anyhow::anyhow!("max_frame_size must fit a frame header"));
        }

        if self.download_dir.as_os_str().is_empty() {
            return Err(anyhow::anyhow!("download_dir cannot be empty"));
        }

        if self.transfer_idle_ttl < self.sweep_interval {
            return Err(anyhow::anyhow!(
                "transfer_idle_ttl must be at least one sweep_interval"
            ));
        }

        Ok(())
    }
}

/// Network credentials shared by every process of one deployment
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

/// Configuration for the session resilience layer
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Base reconnect delay
    pub backoff_base: Duration,
    /// Cap on the exponential reconnect delay
    pub backoff_cap: Duration,
    /// Jitter fraction applied to the delay (0.0 to < 1.0)
    pub backoff_jitter: f64,
    /// Consecutive connection failures before the circuit opens
    pub breaker_threshold: u32,
    /// Fixed recovery window measured from the circuit-open instant
    pub breaker_recovery_window: Duration,
    /// Rolling window for per-peer failure counting
    pub failure_window: Duration,
    /// Failures within the window before a peer is blocked
    pub failure_threshold: u32,
    /// How long a blocked peer stays out of ranking
    pub peer_block_ttl: Duration,
    /// Short fixed cooldown before reconnecting to a failed peer
    pub peer_reconnect_cooldown: Duration,
    /// Consecutive empty searches before forcing one session reconnect.
    /// Observed clients disagree on this value; it is a tunable, not an
    /// inferred intent.
    pub empty_search_reconnect_threshold: u32,
    /// Path of the cross-process reconnect lock file
    pub lock_path: PathBuf,
    /// Age after which a reconnect lock holder is reported stale
    pub lock_ttl: Duration,
    /// How often expired ledger entries are cleaned up
    pub ledger_cleanup_interval: Duration,
    /// Bound on the ranked candidate list
    pub max_ranked_candidates: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(300),
            backoff_jitter: 0.25,
            breaker_threshold: 5,
            breaker_recovery_window: Duration::from_secs(600),
            failure_window: Duration::from_secs(600),
            failure_threshold: 3,
            peer_block_ttl: Duration::from_secs(1800),
            peer_reconnect_cooldown: Duration::from_secs(30),
            empty_search_reconnect_threshold: 3,
            lock_path: std::env::temp_dir().join("slsk-client.reconnect.lock"),
            lock_ttl: Duration::from_secs(60),
            ledger_cleanup_interval: Duration::from_secs(120),
            max_ranked_candidates: 10,
        }
    }
}

impl SessionConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.backoff_base == Duration::ZERO {
            return Err(anyhow::anyhow!("backoff_base cannot be zero"));
        }

        if self.backoff_cap < self.backoff_base {
            return Err(anyhow::anyhow!("backoff_cap must be at least backoff_base"));
        }

        if !(0.0..1.0).contains(&self.backoff_jitter) {
            return Err(anyhow::anyhow!("backoff_jitter must be in [0.0, 1.0)"));
        }

        if self.breaker_threshold == 0 {
            return Err(anyhow::anyhow!("breaker_threshold must be at least 1"));
        }

        if self.failure_threshold == 0 {
            return Err(anyhow::anyhow!("failure_threshold must be at least 1"));
        }

        if self.empty_search_reconnect_threshold == 0 {
            return Err(anyhow::anyhow!(
                "empty_search_reconnect_threshold must be at least 1"
            ));
        }

        if self.lock_path.as_os_str().is_empty() {
            return Err(anyhow::anyhow!("lock_path cannot be empty"));
        }

        if self.max_ranked_candidates == 0 {
            return Err(anyhow::anyhow!("max_ranked_candidates must be at least 1"));
        }

        Ok(())
    }
}
