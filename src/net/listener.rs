//! Listen socket module
//!
//! Accepts unsolicited inbound connections (pierce-firewall and
//! file-transfer flows). Each accepted socket has its first frame
//! read here, timeout-bounded; the orchestrator decides what the
//! socket becomes based on that message.

use anyhow::Result;
use bytes::{Buf, Bytes, BytesMut};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

use crate::error::SlskError;
use crate::protocol::frame::Frame;
use crate::protocol::peer::PeerMessage;

/// An accepted socket together with its decoded first message and any
/// bytes that arrived after it.
#[derive(Debug)]
pub struct InboundConnection {
    pub socket: TcpStream,
    pub addr: SocketAddr,
    pub first: PeerMessage,
    pub remainder: Bytes,
}

/// The TCP listener for unsolicited inbound connections
pub struct Listener {
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
}

impl Listener {
    /// Bind and start accepting
    pub async fn bind(
        port: u16,
        handshake_timeout: Duration,
        max_frame_size: usize,
    ) -> Result<(Self, mpsc::Receiver<InboundConnection>)> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await.map_err(|e| {
            SlskError::connection_error_full(
                "Failed to bind listen socket",
                format!("0.0.0.0:{}", port),
                e.to_string(),
            )
        })?;
        let local_addr = listener.local_addr()?;
        info!("Listening for inbound peers on {}", local_addr);

        let (tx, rx) = mpsc::channel(16);
        let accept_task = tokio::spawn(accept_loop(listener, tx, handshake_timeout, max_frame_size));

        Ok((
            Self {
                local_addr,
                accept_task,
            },
            rx,
        ))
    }

    /// The bound local address
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The bound local port
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Stop accepting connections
    pub fn destroy(&self) {
        debug!("Destroying listener on {}", self.local_addr);
        self.accept_task.abort();
    }
}

async fn accept_loop(
    listener: TcpListener,
    tx: mpsc::Sender<InboundConnection>,
    handshake_timeout: Duration,
    max_frame_size: usize,
) {
    loop {
        let (socket, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Accept failed: {}", e);
                continue;
            }
        };
        debug!("Accepted inbound connection from {}", addr);

        let tx = tx.clone();
        tokio::spawn(async move {
            match read_first_frame(socket, handshake_timeout, max_frame_size).await {
                Ok((socket, first, remainder)) => {
                    let _ = tx
                        .send(InboundConnection {
                            socket,
                            addr,
                            first,
                            remainder,
                        })
                        .await;
                }
                Err(e) => {
                    debug!("Dropping inbound connection from {}: {}", addr, e);
                }
            }
        });
    }
}

/// Read exactly one frame from a fresh socket, returning the socket,
/// the decoded message and any surplus bytes already received.
async fn read_first_frame(
    mut socket: TcpStream,
    handshake_timeout: Duration,
    max_frame_size: usize,
) -> Result<(TcpStream, PeerMessage, Bytes)> {
    use tokio::io::AsyncReadExt;

    let mut buf = BytesMut::with_capacity(1024);
    let deadline = tokio::time::Instant::now() + handshake_timeout;

    loop {
        if buf.len() >= 4 {
            let length = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
            if length < 4 {
                return Err(SlskError::protocol_error("Inbound frame length too short").into());
            }
            if length > max_frame_size {
                return Err(SlskError::protocol_error("Inbound frame exceeds maximum size").into());
            }
            if buf.len() >= 4 + length {
                let mut frame = buf.split_to(4 + length).freeze();
                frame.advance(4);
                let code = frame.get_u32_le();
                let first = PeerMessage::decode(Frame {
                    code,
                    payload: frame,
                })?;
                return Ok((socket, first, buf.freeze()));
            }
        }

        let remaining = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .ok_or_else(|| SlskError::timeout("inbound handshake timed out"))?;
        let n = timeout(remaining, socket.read_buf(&mut buf))
            .await
            .map_err(|_| SlskError::timeout("inbound handshake timed out"))??;
        if n == 0 {
            return Err(SlskError::connection_error("inbound socket closed before first frame").into());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::peer::ConnKind;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_inbound_peer_init() {
        let (listener, mut rx) = Listener::bind(0, Duration::from_secs(2), 1024 * 1024)
            .await
            .unwrap();
        let port = listener.port();

        let mut remote = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let init = PeerMessage::PeerInit {
            username: "alice".to_string(),
            kind: ConnKind::Peer,
            token: 0,
        };
        remote.write_all(&init.encode()).await.unwrap();

        let inbound = rx.recv().await.unwrap();
        assert_eq!(inbound.first, init);
        assert!(inbound.remainder.is_empty());
    }

    #[tokio::test]
    async fn test_inbound_pierce_with_bundled_bytes() {
        let (listener, mut rx) = Listener::bind(0, Duration::from_secs(2), 1024 * 1024)
            .await
            .unwrap();
        let port = listener.port();

        let mut remote = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let pierce = PeerMessage::PierceFirewall { token: 31 };
        let follow_up = PeerMessage::QueueUpload {
            filename: "music\\x.mp3".to_string(),
        };
        let mut bytes = pierce.encode();
        bytes.extend_from_slice(&follow_up.encode());
        remote.write_all(&bytes).await.unwrap();

        let inbound = rx.recv().await.unwrap();
        assert_eq!(inbound.first, pierce);
        assert_eq!(inbound.remainder, follow_up.encode().freeze());
    }

    #[tokio::test]
    async fn test_silent_inbound_socket_dropped() {
        let (listener, mut rx) = Listener::bind(0, Duration::from_millis(100), 1024)
            .await
            .unwrap();
        let port = listener.port();

        // Connect but never send a frame
        let _remote = TcpStream::connect(("127.0.0.1", port)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(rx.try_recv().is_err());
    }
}
