//! Distributed reconnect lock
//!
//! Serializes reconnects across processes sharing one set of network
//! credentials. Contention surfaces as the dedicated
//! "connection already in progress" error, distinct from genuine
//! connection failure.

use anyhow::Result;
use async_trait::async_trait;
use fs2::FileExt as _;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::SlskError;

/// Mutual exclusion around a reconnect attempt
#[async_trait]
pub trait ReconnectLock: Send + Sync {
    /// Take the lock or fail fast with `AlreadyConnecting`
    async fn try_acquire(&self) -> Result<()>;

    /// Release the lock after the attempt
    async fn release(&self);
}

/// File-backed lock shared by every process using the same path.
///
/// The OS advisory lock releases automatically when the holder dies;
/// the timestamp written into the file lets waiters report how stale a
/// hung holder is.
pub struct FileReconnectLock {
    path: PathBuf,
    ttl: Duration,
    held: Mutex<Option<std::fs::File>>,
}

impl FileReconnectLock {
    pub fn new(path: impl AsRef<Path>, ttl: Duration) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            ttl,
            held: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn holder_age(&self) -> Option<Duration> {
        let raw = std::fs::read_to_string(&self.path).ok()?;
        let stamped = raw.trim().parse::<u64>().ok()?;
        let now = SystemTime::now().duration_since(UNIX_EPOCH).ok()?.as_secs();
        Some(Duration::from_secs(now.saturating_sub(stamped)))
    }
}

#[async_trait]
impl ReconnectLock for FileReconnectLock {
    async fn try_acquire(&self) -> Result<()> {
        let mut held = self.held.lock().await;
        if held.is_some() {
            return Err(SlskError::AlreadyConnecting.into());
        }

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                SlskError::lock_error_with_source("failed to create lock directory", e.to_string())
            })?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(|e| {
                SlskError::lock_error_with_source(
                    format!("failed to open lock file {}", self.path.display()),
                    e.to_string(),
                )
            })?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                let now = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs();
                if let Err(e) = file.set_len(0).and_then(|_| write!(file, "{}", now)) {
                    debug!("Failed to stamp lock file: {}", e);
                }
                debug!("Acquired reconnect lock at {}", self.path.display());
                *held = Some(file);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                if let Some(age) = self.holder_age() {
                    if age > self.ttl {
                        warn!(
                            "Reconnect lock holder looks stale ({}s old, ttl {}s)",
                            age.as_secs(),
                            self.ttl.as_secs()
                        );
                    }
                }
                Err(SlskError::AlreadyConnecting.into())
            }
            Err(e) => Err(SlskError::lock_error_with_source(
                format!("failed to lock {}", self.path.display()),
                e.to_string(),
            )
            .into()),
        }
    }

    async fn release(&self) {
        let mut held = self.held.lock().await;
        if held.take().is_some() {
            debug!("Released reconnect lock at {}", self.path.display());
        }
    }
}

/// In-process lock for single-process deployments and tests
#[derive(Default)]
pub struct InProcessReconnectLock {
    held: Mutex<bool>,
}

impl InProcessReconnectLock {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ReconnectLock for InProcessReconnectLock {
    async fn try_acquire(&self) -> Result<()> {
        let mut held = self.held.lock().await;
        if *held {
            return Err(SlskError::AlreadyConnecting.into());
        }
        *held = true;
        Ok(())
    }

    async fn release(&self) {
        *self.held.lock().await = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_lock_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("slsk_lock_test_{}_{}", name, std::process::id()))
    }

    #[tokio::test]
    async fn test_in_process_lock_contention() {
        let lock = InProcessReconnectLock::new();
        lock.try_acquire().await.unwrap();

        let err = lock.try_acquire().await.unwrap_err();
        let slsk = err.downcast_ref::<SlskError>().unwrap();
        assert!(matches!(slsk, SlskError::AlreadyConnecting));

        lock.release().await;
        lock.try_acquire().await.unwrap();
    }

    #[tokio::test]
    async fn test_file_lock_acquire_release_cycle() {
        let path = test_lock_path("cycle");
        let _ = std::fs::remove_file(&path);

        let lock = FileReconnectLock::new(&path, Duration::from_secs(60));
        lock.try_acquire().await.unwrap();
        lock.release().await;
        lock.try_acquire().await.unwrap();
        lock.release().await;

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_file_lock_contention_within_process() {
        let path = test_lock_path("contention");
        let _ = std::fs::remove_file(&path);

        let lock = FileReconnectLock::new(&path, Duration::from_secs(60));
        lock.try_acquire().await.unwrap();

        let err = lock.try_acquire().await.unwrap_err();
        let slsk = err.downcast_ref::<SlskError>().unwrap();
        assert!(matches!(slsk, SlskError::AlreadyConnecting));

        lock.release().await;
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_file_lock_stamps_timestamp() {
        let path = test_lock_path("stamp");
        let _ = std::fs::remove_file(&path);

        let lock = FileReconnectLock::new(&path, Duration::from_secs(60));
        lock.try_acquire().await.unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.trim().parse::<u64>().is_ok());

        lock.release().await;
        let _ = std::fs::remove_file(&path);
    }
}
