//! Download state machine
//!
//! A download moves `Requested -> Queued -> Connected -> Downloading`
//! and ends `Complete`, `Denied` or `Errored`. Queue-phase transitions
//! are driven by messages on the peer's messaging connection; bytes
//! flow over a separate transfer socket whose first four inbound bytes
//! are the transfer token matching the download by (username, token).

use anyhow::Result;
use bytes::{Buf, Bytes, BytesMut};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::client::client::ClientInner;
use crate::client::events::ClientEvent;
use crate::error::SlskError;
use crate::protocol::peer::PeerMessage;

/// Externally visible state of one download
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "kebab-case")]
pub enum DownloadStatus {
    Requested,
    Queued { place: u32 },
    Connected,
    Downloading { received: u64, total: u64 },
    Complete,
    Denied { reason: String },
    Errored { message: String },
}

impl DownloadStatus {
    /// Whether the download has reached a final state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DownloadStatus::Complete | DownloadStatus::Denied { .. } | DownloadStatus::Errored { .. }
        )
    }
}

/// Caller-facing handle to one download
#[derive(Debug)]
pub struct DownloadHandle {
    pub username: String,
    pub remote_path: String,
    pub output_path: PathBuf,
    status: watch::Receiver<DownloadStatus>,
}

impl DownloadHandle {
    /// Current status
    pub fn status(&self) -> DownloadStatus {
        self.status.borrow().clone()
    }

    /// A live status stream for progress display
    pub fn subscribe(&self) -> watch::Receiver<DownloadStatus> {
        self.status.clone()
    }

    /// Wait for the terminal status
    pub async fn wait(&mut self) -> DownloadStatus {
        loop {
            let current = self.status.borrow().clone();
            if current.is_terminal() {
                return current;
            }
            if self.status.changed().await.is_err() {
                let last = self.status.borrow().clone();
                if last.is_terminal() {
                    return last;
                }
                return DownloadStatus::Errored {
                    message: "download dropped before completion".to_string(),
                };
            }
        }
    }
}

/// One tracked download, owned by the table until terminal
#[derive(Debug)]
pub(crate) struct DownloadSlot {
    pub username: String,
    pub remote_path: String,
    pub token: Option<u32>,
    /// Set when a transfer socket has matched this download
    pub claimed: bool,
    pub received: u64,
    pub total: u64,
    pub output_path: PathBuf,
    pub status_tx: watch::Sender<DownloadStatus>,
    pub last_activity: Instant,
}

impl DownloadSlot {
    fn set_status(&self, status: DownloadStatus) {
        self.status_tx.send_replace(status);
    }
}

/// Result of claiming a transfer socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TransferClaim {
    /// Bytes already on disk; written to the socket as the resume offset
    pub resume_offset: u64,
}

/// Counter update after bytes were applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TransferProgress {
    pub received: u64,
    pub total: u64,
    pub complete: bool,
}

/// The client's download list. At most one download is resolvable per
/// (username, token); claiming is atomic within the table's lock.
#[derive(Debug, Default)]
pub(crate) struct DownloadTable {
    slots: Vec<DownloadSlot>,
}

impl DownloadTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Insert a new download in `Requested` and hand back its handle
    pub fn insert(
        &mut self,
        username: &str,
        remote_path: &str,
        output_path: PathBuf,
        resume_from: u64,
    ) -> Result<DownloadHandle> {
        if self
            .slots
            .iter()
            .any(|s| s.username == username && s.remote_path == remote_path)
        {
            return Err(SlskError::transfer_error_full(
                "Download already active",
                username,
                remote_path,
            )
            .into());
        }

        let (status_tx, status_rx) = watch::channel(DownloadStatus::Requested);
        self.slots.push(DownloadSlot {
            username: username.to_string(),
            remote_path: remote_path.to_string(),
            token: None,
            claimed: false,
            received: resume_from,
            total: 0,
            output_path: output_path.clone(),
            status_tx,
            last_activity: Instant::now(),
        });

        Ok(DownloadHandle {
            username: username.to_string(),
            remote_path: remote_path.to_string(),
            output_path,
            status: status_rx,
        })
    }

    /// `Requested` -> `Queued`, or a position update while queued
    pub fn set_queue_place(&mut self, username: &str, filename: &str, place: u32) -> bool {
        let Some(slot) = self.find_by_name(username, filename) else {
            return false;
        };
        match &*slot.status_tx.borrow() {
            DownloadStatus::Requested | DownloadStatus::Queued { .. } => {}
            _ => return false,
        }
        slot.last_activity = Instant::now();
        slot.set_status(DownloadStatus::Queued { place });
        true
    }

    /// A transfer request supplied the token and total size:
    /// `Requested`/`Queued` -> `Connected`
    pub fn connect(&mut self, username: &str, filename: &str, token: u32, total: u64) -> bool {
        let Some(slot) = self.find_by_name(username, filename) else {
            return false;
        };
        match &*slot.status_tx.borrow() {
            DownloadStatus::Requested | DownloadStatus::Queued { .. } => {}
            _ => return false,
        }
        slot.token = Some(token);
        slot.total = total;
        slot.last_activity = Instant::now();
        slot.set_status(DownloadStatus::Connected);
        true
    }

    /// Claim the download matching (username, token) for a transfer
    /// socket. A second claim on the same key finds nothing.
    pub fn claim(&mut self, username: &str, token: u32) -> Option<TransferClaim> {
        let slot = self
            .slots
            .iter_mut()
            .find(|s| s.username == username && s.token == Some(token) && !s.claimed)?;
        slot.claimed = true;
        slot.last_activity = Instant::now();
        Some(TransferClaim {
            resume_offset: slot.received,
        })
    }

    /// Account bytes for a claimed transfer. Returns `None` if the
    /// download was already removed, making the write a no-op.
    pub fn record_bytes(&mut self, username: &str, token: u32, n: u64) -> Option<TransferProgress> {
        let slot = self
            .slots
            .iter_mut()
            .find(|s| s.username == username && s.token == Some(token))?;
        slot.received = slot.received.saturating_add(n);
        slot.last_activity = Instant::now();
        let progress = TransferProgress {
            received: slot.received,
            total: slot.total,
            complete: slot.total > 0 && slot.received >= slot.total,
        };
        slot.set_status(DownloadStatus::Downloading {
            received: progress.received,
            total: progress.total,
        });
        Some(progress)
    }

    /// Finish a download: set `Complete` and remove it
    pub fn complete(&mut self, username: &str, token: u32) -> Option<DownloadSlot> {
        let index = self
            .slots
            .iter()
            .position(|s| s.username == username && s.token == Some(token))?;
        let slot = self.slots.remove(index);
        slot.set_status(DownloadStatus::Complete);
        Some(slot)
    }

    /// Fail a download by its transfer token
    pub fn fail_by_token(&mut self, username: &str, token: u32, message: &str) -> Option<DownloadSlot> {
        let index = self
            .slots
            .iter()
            .position(|s| s.username == username && s.token == Some(token))?;
        let slot = self.slots.remove(index);
        slot.set_status(DownloadStatus::Errored {
            message: message.to_string(),
        });
        Some(slot)
    }

    /// Fail a download by its remote path
    pub fn fail_by_name(&mut self, username: &str, filename: &str, message: &str) -> Option<DownloadSlot> {
        let index = self
            .slots
            .iter()
            .position(|s| s.username == username && s.remote_path == filename)?;
        let slot = self.slots.remove(index);
        slot.set_status(DownloadStatus::Errored {
            message: message.to_string(),
        });
        Some(slot)
    }

    /// The peer denied the upload: terminal `Denied`
    pub fn deny(&mut self, username: &str, filename: &str, reason: &str) -> Option<DownloadSlot> {
        let index = self
            .slots
            .iter()
            .position(|s| s.username == username && s.remote_path == filename)?;
        let slot = self.slots.remove(index);
        slot.set_status(DownloadStatus::Denied {
            reason: reason.to_string(),
        });
        Some(slot)
    }

    /// Remove downloads with no activity past the TTL. Covers peers
    /// that open a transfer connection and never send a token or data.
    pub fn sweep_idle(&mut self, ttl: Duration) -> Vec<DownloadSlot> {
        let now = Instant::now();
        let mut swept = Vec::new();
        let mut index = 0;
        while index < self.slots.len() {
            if now.duration_since(self.slots[index].last_activity) > ttl {
                let slot = self.slots.remove(index);
                slot.set_status(DownloadStatus::Errored {
                    message: "download inactive past TTL".to_string(),
                });
                swept.push(slot);
            } else {
                index += 1;
            }
        }
        swept
    }

    /// Fail everything, used at client shutdown
    pub fn fail_all(&mut self, message: &str) -> Vec<DownloadSlot> {
        let slots = std::mem::take(&mut self.slots);
        for slot in &slots {
            slot.set_status(DownloadStatus::Errored {
                message: message.to_string(),
            });
        }
        slots
    }

    fn find_by_name(&mut self, username: &str, filename: &str) -> Option<&mut DownloadSlot> {
        self.slots
            .iter_mut()
            .find(|s| s.username == username && s.remote_path == filename)
    }
}

/// Remove a failed download's partial output
pub(crate) async fn cleanup_partial(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove partial file {}: {}", path.display(), e);
        }
    }
}

/// Drive one transfer socket to completion.
///
/// `pierce_token` is set when this side dialed out in response to the
/// server's file-transfer connect signal; the pierce frame announces
/// the connection before any raw bytes flow. `initial` carries bytes
/// that arrived bundled with an inbound init frame.
pub(crate) async fn run_transfer(
    inner: Arc<ClientInner>,
    mut socket: TcpStream,
    username: String,
    pierce_token: Option<u32>,
    initial: Bytes,
) {
    if let Some(token) = pierce_token {
        let frame = PeerMessage::PierceFirewall { token }.encode();
        if let Err(e) = socket.write_all(&frame).await {
            warn!("Failed to announce transfer connection to {}: {}", username, e);
            inner.emit(ClientEvent::PeerError {
                username,
                message: format!("transfer announce failed: {}", e),
            });
            return;
        }
    }

    // The first four raw bytes are the transfer token
    let mut buf = BytesMut::from(&initial[..]);
    let token = loop {
        if buf.len() >= 4 {
            break buf.split_to(4).freeze().get_u32_le();
        }
        let read = timeout(inner.config.transfer_idle_ttl, socket.read_buf(&mut buf)).await;
        match read {
            Ok(Ok(0)) | Err(_) => {
                debug!("Transfer socket from {} closed before sending a token", username);
                return;
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                debug!("Transfer socket from {} failed before token: {}", username, e);
                return;
            }
        }
    };

    let Some(claim) = inner.downloads.write().await.claim(&username, token) else {
        warn!(
            "Unmatched transfer token {} from {}; destroying socket",
            token, username
        );
        return;
    };
    debug!(
        "Transfer socket matched download ({}, {}), resume offset {}",
        username, token, claim.resume_offset
    );

    // The resume offset is written exactly once, immediately on token
    // match, before any co-arriving data bytes are applied
    if let Err(e) = socket.write_all(&claim.resume_offset.to_le_bytes()).await {
        fail_transfer(&inner, &username, token, &format!("offset write failed: {}", e)).await;
        return;
    }

    let file = open_output(&inner, &username, token).await;
    let Some(mut file) = file else {
        return;
    };

    // Apply the rest of the first chunk, then stream until close
    if !buf.is_empty() {
        let data = buf.split().freeze();
        if apply_chunk(&inner, &username, token, &mut file, &data).await {
            return;
        }
    }

    let mut chunk = vec![0u8; 64 * 1024];
    loop {
        let n = match socket.read(&mut chunk).await {
            Ok(0) => {
                fail_transfer(&inner, &username, token, "socket closed before completion").await;
                return;
            }
            Ok(n) => n,
            Err(e) => {
                fail_transfer(&inner, &username, token, &format!("transfer read failed: {}", e)).await;
                return;
            }
        };
        if apply_chunk(&inner, &username, token, &mut file, &chunk[..n]).await {
            return;
        }
    }
}

async fn open_output(inner: &Arc<ClientInner>, username: &str, token: u32) -> Option<tokio::fs::File> {
    let path = {
        let downloads = inner.downloads.read().await;
        downloads
            .slots
            .iter()
            .find(|s| s.username == username && s.token == Some(token))
            .map(|s| s.output_path.clone())
    }?;

    if let Some(parent) = path.parent() {
        if let Err(e) = tokio::fs::create_dir_all(parent).await {
            // A local filesystem problem, not the peer's fault
            inner.emit(ClientEvent::ClientError {
                message: format!("cannot create download directory: {}", e),
            });
            fail_transfer(inner, username, token, &format!("output dir failed: {}", e)).await;
            return None;
        }
    }

    match tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await
    {
        Ok(file) => Some(file),
        Err(e) => {
            inner.emit(ClientEvent::ClientError {
                message: format!("cannot open download output: {}", e),
            });
            fail_transfer(inner, username, token, &format!("output open failed: {}", e)).await;
            None
        }
    }
}

/// Write one chunk and account it. Returns true when the transfer is
/// finished (complete or failed) and the socket should be dropped.
async fn apply_chunk(
    inner: &Arc<ClientInner>,
    username: &str,
    token: u32,
    file: &mut tokio::fs::File,
    data: &[u8],
) -> bool {
    if let Err(e) = file.write_all(data).await {
        fail_transfer(inner, username, token, &format!("output write failed: {}", e)).await;
        return true;
    }

    let progress = inner
        .downloads
        .write()
        .await
        .record_bytes(username, token, data.len() as u64);
    let Some(progress) = progress else {
        // Download removed (swept or shut down); the write was a no-op
        debug!("Transfer ({}, {}) no longer tracked, dropping socket", username, token);
        return true;
    };

    if progress.complete {
        if let Err(e) = file.sync_all().await {
            warn!("Failed to sync completed download from {}: {}", username, e);
        }
        finish_transfer(inner, username, token).await;
        return true;
    }

    let slot_info = {
        let downloads = inner.downloads.read().await;
        downloads
            .slots
            .iter()
            .find(|s| s.username == username && s.token == Some(token))
            .map(|s| s.remote_path.clone())
    };
    if let Some(filename) = slot_info {
        inner.emit(ClientEvent::DownloadProgress {
            username: username.to_string(),
            filename,
            received: progress.received,
            total: progress.total,
        });
    }
    false
}

async fn finish_transfer(inner: &Arc<ClientInner>, username: &str, token: u32) {
    let slot = inner.downloads.write().await.complete(username, token);
    if let Some(slot) = slot {
        info!(
            "Download complete: {} from {} ({} bytes)",
            slot.remote_path, username, slot.received
        );
        inner.emit(ClientEvent::DownloadComplete {
            username: username.to_string(),
            filename: slot.remote_path,
            path: slot.output_path.display().to_string(),
        });
    }
}

async fn fail_transfer(inner: &Arc<ClientInner>, username: &str, token: u32, message: &str) {
    let slot = inner.downloads.write().await.fail_by_token(username, token, message);
    if let Some(slot) = slot {
        warn!(
            "Download failed: {} from {}: {}",
            slot.remote_path, username, message
        );
        cleanup_partial(&slot.output_path).await;
        inner.emit(ClientEvent::DownloadFailed {
            username: username.to_string(),
            filename: slot.remote_path,
            reason: message.to_string(),
        });
    }
}
