//! Server connection module
//!
//! The single persistent TCP connection to the central server.

use anyhow::Result;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, trace, warn};

use crate::error::SlskError;
use crate::protocol::frame::MessageFramer;
use crate::protocol::server::{ServerRequest, ServerResponse};

/// Events emitted by the server connection
#[derive(Debug)]
pub enum ServerEvent {
    /// A decoded server message
    Message(ServerResponse),
    /// The connection ended; `error` is set unless the remote closed cleanly
    Closed { error: Option<String> },
}

/// The persistent connection to the central server
pub struct ServerConnection {
    addr: String,
    writer: Mutex<Option<OwnedWriteHalf>>,
    reader_task: JoinHandle<()>,
}

impl ServerConnection {
    /// Dial the server and start framing its message stream
    pub async fn connect(
        addr: &str,
        connect_timeout: Duration,
        max_frame_size: usize,
    ) -> Result<(Self, mpsc::Receiver<ServerEvent>)> {
        info!("Connecting to server: {}", addr);
        let stream = timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                warn!("Connection timeout to server {}", addr);
                SlskError::timeout_during("server connect timed out", addr.to_string())
            })?
            .map_err(|e| {
                warn!("Failed to connect to server {}: {}", addr, e);
                SlskError::connection_error_full("Failed to connect to server", addr, e.to_string())
            })?;

        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::channel(64);
        let reader_task = tokio::spawn(read_loop(read_half, tx, max_frame_size));

        debug!("Connected to server: {}", addr);
        Ok((
            Self {
                addr: addr.to_string(),
                writer: Mutex::new(Some(write_half)),
                reader_task,
            },
            rx,
        ))
    }

    /// Send a request, best-effort. A closed or unwritable socket makes
    /// this a no-op rather than an error.
    pub async fn send(&self, request: &ServerRequest) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            debug!("Dropping server request {} on closed connection", request.code());
            return Ok(());
        };

        let frame = request.encode();
        trace!("Sending server request: code={}", request.code());
        if let Err(e) = writer.write_all(&frame).await {
            warn!("Server write failed ({}): {}", self.addr, e);
            *guard = None;
        }
        Ok(())
    }

    /// Server address this connection was dialed to
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Tear the connection down, suppressing further events
    pub async fn destroy(&self) {
        debug!("Destroying server connection to {}", self.addr);
        self.reader_task.abort();
        *self.writer.lock().await = None;
    }
}

async fn read_loop(mut read_half: OwnedReadHalf, tx: mpsc::Sender<ServerEvent>, max_frame_size: usize) {
    let mut framer = MessageFramer::new(max_frame_size);
    let mut chunk = vec![0u8; 8192];

    let error = loop {
        let n = match read_half.read(&mut chunk).await {
            Ok(0) => break None,
            Ok(n) => n,
            Err(e) => break Some(e.to_string()),
        };

        let frames = match framer.push(&chunk[..n]) {
            Ok(frames) => frames,
            Err(e) => break Some(e.to_string()),
        };

        for frame in frames {
            match ServerResponse::decode(frame) {
                Ok(message) => {
                    if tx.send(ServerEvent::Message(message)).await.is_err() {
                        // Receiver gone; the connection is being torn down
                        return;
                    }
                }
                Err(e) => warn!("Failed to decode server message: {}", e),
            }
        }
    };

    debug!("Server read loop ended (error: {:?})", error);
    let _ = tx.send(ServerEvent::Closed { error }).await;
}
