//! Session manager
//!
//! Owns exactly one client and is the sole authority for replacing
//! it. Applies, in order: circuit breaker, backoff measured from the
//! last attempt, the cross-process reconnect lock, then connect and
//! login. Search goes through the strategy engine and ranker;
//! downloads retry across ranked candidates while feeding the
//! per-peer failure ledger.

use anyhow::Result;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::{Client, DownloadStatus};
use crate::config::{ClientConfig, Credentials, SessionConfig};
use crate::error::SlskError;
use crate::search::ranker::{rank, RankedHit, RankerWeights};
use crate::search::session::SearchOptions;
use crate::search::strategy::{run_strategies, TrackQuery};
use crate::session::backoff::Backoff;
use crate::session::breaker::CircuitBreaker;
use crate::session::failures::PeerFailureLedger;
use crate::session::lock::{FileReconnectLock, ReconnectLock};

/// Reconnect bookkeeping owned by the session manager
#[derive(Debug, Clone, Default)]
pub struct ConnectionHealth {
    /// When the last connect attempt started
    pub last_attempt: Option<Instant>,
    /// Consecutive failed attempts; drives the backoff exponent
    pub consecutive_failures: u32,
}

/// A finished download handed back to the caller
#[derive(Debug, Clone, Serialize)]
pub struct DownloadOutcome {
    pub username: String,
    pub remote_path: String,
    pub output_path: PathBuf,
}

/// The resilience layer around one client
pub struct SessionManager {
    client_config: ClientConfig,
    config: SessionConfig,
    credentials: Credentials,
    client: RwLock<Option<Arc<Client>>>,
    health: Mutex<ConnectionHealth>,
    breaker: Mutex<CircuitBreaker>,
    ledger: Arc<Mutex<PeerFailureLedger>>,
    lock: Arc<dyn ReconnectLock>,
    backoff: Backoff,
    weights: RankerWeights,
    empty_searches: AtomicU32,
    cleanup_task: Mutex<Option<JoinHandle<()>>>,
}

impl SessionManager {
    /// Create a manager with the default file-backed reconnect lock
    pub fn new(client_config: ClientConfig, config: SessionConfig, credentials: Credentials) -> Self {
        let lock = Arc::new(FileReconnectLock::new(&config.lock_path, config.lock_ttl));
        Self::with_lock(client_config, config, credentials, lock)
    }

    /// Create a manager with a caller-supplied reconnect lock
    pub fn with_lock(
        client_config: ClientConfig,
        config: SessionConfig,
        credentials: Credentials,
        lock: Arc<dyn ReconnectLock>,
    ) -> Self {
        let backoff = Backoff::new(config.backoff_base, config.backoff_cap, config.backoff_jitter);
        let breaker = CircuitBreaker::new(config.breaker_threshold, config.breaker_recovery_window);
        let ledger = PeerFailureLedger::new(
            config.failure_window,
            config.failure_threshold,
            config.peer_block_ttl,
            config.peer_reconnect_cooldown,
        );
        let weights = RankerWeights {
            max_candidates: config.max_ranked_candidates,
            ..Default::default()
        };

        Self {
            client_config,
            config,
            credentials,
            client: RwLock::new(None),
            health: Mutex::new(ConnectionHealth::default()),
            breaker: Mutex::new(breaker),
            ledger: Arc::new(Mutex::new(ledger)),
            lock,
            backoff,
            weights,
            empty_searches: AtomicU32::new(0),
            cleanup_task: Mutex::new(None),
        }
    }

    /// Current reconnect bookkeeping
    pub async fn health(&self) -> ConnectionHealth {
        self.health.lock().await.clone()
    }

    /// Whether a peer is currently excluded from ranking
    pub async fn is_peer_blocked(&self, username: &str) -> bool {
        let ledger = self.ledger.lock().await;
        ledger.is_blocked(username) || ledger.in_cooldown(username)
    }

    /// Return the connected client, reconnecting if necessary.
    /// Breaker, backoff and the cross-process lock gate the attempt;
    /// lock contention surfaces as `AlreadyConnecting`.
    pub async fn ensure_connected(&self) -> Result<Arc<Client>> {
        if let Some(client) = self.client.read().await.as_ref() {
            if client.is_connected().await {
                return Ok(client.clone());
            }
        }

        self.spawn_ledger_cleanup().await;

        {
            let breaker = self.breaker.lock().await;
            if let Err(remaining) = breaker.try_acquire() {
                return Err(SlskError::CircuitOpen {
                    retry_in_secs: remaining.as_secs(),
                }
                .into());
            }
        }

        // Backoff is measured from the last attempt, not from now
        let wait = {
            let health = self.health.lock().await;
            match health.last_attempt {
                Some(last) if health.consecutive_failures > 0 => {
                    let delay = self.backoff.delay(health.consecutive_failures - 1);
                    delay.checked_sub(last.elapsed())
                }
                _ => None,
            }
        };
        if let Some(wait) = wait {
            debug!("Backing off {:?} before reconnect", wait);
            tokio::time::sleep(wait).await;
        }

        self.lock.try_acquire().await?;
        let result = self.connect_once().await;
        self.lock.release().await;

        match result {
            Ok(client) => {
                self.health.lock().await.consecutive_failures = 0;
                self.breaker.lock().await.record_success();
                info!("Session connected as {}", self.credentials.username);
                *self.client.write().await = Some(client.clone());
                Ok(client)
            }
            Err(e) => {
                let mut health = self.health.lock().await;
                health.consecutive_failures = health.consecutive_failures.saturating_add(1);
                warn!(
                    "Session connect failed ({} consecutive): {}",
                    health.consecutive_failures, e
                );
                drop(health);
                self.breaker.lock().await.record_failure();
                Err(e)
            }
        }
    }

    /// Drop the current client and connect a fresh one
    pub async fn force_reconnect(&self) -> Result<Arc<Client>> {
        if let Some(old) = self.client.write().await.take() {
            old.shutdown().await;
        }
        self.ensure_connected().await
    }

    async fn connect_once(&self) -> Result<Arc<Client>> {
        if let Some(old) = self.client.write().await.take() {
            old.shutdown().await;
        }

        self.health.lock().await.last_attempt = Some(Instant::now());

        let client = Arc::new(Client::new(self.client_config.clone()));
        client.connect().await?;
        client
            .login(&self.credentials.username, &self.credentials.password)
            .await?;
        Ok(client)
    }

    /// Search for a track through the strategy engine and rank the
    /// hits. Persistent emptiness signals a stale session: at the
    /// configured threshold one reconnect is forced and the search
    /// retried once, never recursively.
    pub async fn search_track(
        &self,
        query: &TrackQuery,
        options: SearchOptions,
    ) -> Result<Vec<RankedHit>> {
        let client = self.ensure_connected().await?;
        let hits = self.run_search(&client, query, &options).await?;

        if hits.is_empty() {
            let empty = self.empty_searches.fetch_add(1, Ordering::SeqCst) + 1;
            debug!("Empty search {}/{}", empty, self.config.empty_search_reconnect_threshold);
            if empty >= self.config.empty_search_reconnect_threshold {
                warn!(
                    "{} consecutive empty searches, forcing session reconnect",
                    empty
                );
                self.empty_searches.store(0, Ordering::SeqCst);
                let client = self.force_reconnect().await?;
                let retried = self.run_search(&client, query, &options).await?;
                return Ok(self.rank_hits(retried, query).await);
            }
            return Ok(Vec::new());
        }

        self.empty_searches.store(0, Ordering::SeqCst);
        Ok(self.rank_hits(hits, query).await)
    }

    async fn run_search(
        &self,
        client: &Arc<Client>,
        query: &TrackQuery,
        options: &SearchOptions,
    ) -> Result<Vec<crate::search::session::SearchHit>> {
        run_strategies(query, |variant| {
            let client = client.clone();
            let options = options.clone();
            async move { client.search(&variant, options).await }
        })
        .await
    }

    async fn rank_hits(
        &self,
        hits: Vec<crate::search::session::SearchHit>,
        query: &TrackQuery,
    ) -> Vec<RankedHit> {
        let ledger = self.ledger.lock().await;
        rank(
            &hits,
            query,
            |username| ledger.is_blocked(username) || ledger.in_cooldown(username),
            &self.weights,
        )
    }

    /// Download the first candidate that succeeds, walking the ranked
    /// list. Ledger-eligible failures are recorded against the peer;
    /// partial output is always cleaned up by the download layer
    /// before the next candidate is tried.
    pub async fn download_ranked(&self, candidates: &[RankedHit]) -> Result<DownloadOutcome> {
        if candidates.is_empty() {
            return Err(SlskError::search_error("no ranked candidates to download").into());
        }

        let client = self.ensure_connected().await?;
        let mut last_error: Option<String> = None;

        for candidate in candidates {
            let username = &candidate.hit.username;
            if self.is_peer_blocked(username).await {
                debug!("Skipping blocked candidate {}", username);
                continue;
            }

            match self.try_candidate(&client, candidate).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) => {
                    let classified = e
                        .downcast_ref::<SlskError>()
                        .map(|s| s.classify())
                        .unwrap_or(crate::error::FailureKind::Unknown);
                    if classified.counts_against_peer() {
                        self.ledger.lock().await.record_failure(username);
                    }
                    warn!(
                        "Candidate {} failed ({:?}): {}",
                        username, classified, e
                    );
                    last_error = Some(e.to_string());
                }
            }
        }

        Err(SlskError::transfer_error_full(
            "every ranked candidate failed",
            candidates.len().to_string(),
            last_error.unwrap_or_else(|| "no candidate was eligible".to_string()),
        )
        .into())
    }

    async fn try_candidate(
        &self,
        client: &Arc<Client>,
        candidate: &RankedHit,
    ) -> Result<DownloadOutcome> {
        let username = candidate.hit.username.clone();
        let remote_path = candidate.hit.filename.clone();

        let mut handle = client.download(&username, &remote_path).await?;
        match handle.wait().await {
            DownloadStatus::Complete => Ok(DownloadOutcome {
                username,
                remote_path,
                output_path: handle.output_path.clone(),
            }),
            DownloadStatus::Denied { reason } => {
                let lowered = reason.to_lowercase();
                if lowered.contains("not shared") || lowered.contains("not found") {
                    Err(SlskError::file_not_found(remote_path, username).into())
                } else {
                    Err(SlskError::peer_error_full("upload denied", username, reason).into())
                }
            }
            DownloadStatus::Errored { message } => {
                Err(SlskError::transfer_error_full("download failed", username, message).into())
            }
            other => Err(SlskError::transfer_error_full(
                "download ended in a non-terminal state",
                username,
                format!("{:?}", other),
            )
            .into()),
        }
    }

    /// Start the scheduled ledger cleanup once
    async fn spawn_ledger_cleanup(&self) {
        let mut task = self.cleanup_task.lock().await;
        if task.is_some() {
            return;
        }
        let ledger = self.ledger.clone();
        let interval = self.config.ledger_cleanup_interval;
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                ledger.lock().await.cleanup();
            }
        }));
    }

    /// Shut the managed client down
    pub async fn shutdown(&self) {
        if let Some(task) = self.cleanup_task.lock().await.take() {
            task.abort();
        }
        if let Some(client) = self.client.write().await.take() {
            client.shutdown().await;
        }
    }
}
