//! Peer connection module
//!
//! Wraps one TCP socket to a remote user. The socket may have been
//! accepted on the listener or dialed directly; either way the peer
//! owns it exclusively from here on.

use anyhow::Result;
use bytes::Bytes;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, trace, warn};

use crate::error::SlskError;
use crate::protocol::frame::MessageFramer;
use crate::protocol::peer::PeerMessage;

/// Events emitted by a peer connection
#[derive(Debug)]
pub enum PeerEvent {
    /// A decoded peer message
    Message(PeerMessage),
    /// The connection ended; `error` is set unless the remote closed cleanly
    Closed { error: Option<String> },
}

/// How to reach the peer: dial an address, or take over a socket that
/// already exists (an accepted inbound connection, or a dialed socket
/// the acquisition race produced).
pub enum ConnectVia {
    Address(SocketAddr),
    ExistingSocket {
        socket: TcpStream,
        /// Bytes already read past the init frame; replayed into the framer
        remainder: Bytes,
    },
}

/// A connection to one remote user
pub struct PeerConnection {
    username: String,
    addr: SocketAddr,
    writer: Mutex<Option<OwnedWriteHalf>>,
    reader_task: JoinHandle<()>,
}

impl PeerConnection {
    /// Establish the connection and start framing its message stream
    pub async fn establish(
        username: &str,
        via: ConnectVia,
        connect_timeout: Duration,
        max_frame_size: usize,
    ) -> Result<(Self, mpsc::Receiver<PeerEvent>)> {
        let (socket, remainder) = match via {
            ConnectVia::Address(addr) => {
                debug!("Dialing peer {} at {}", username, addr);
                let socket = timeout(connect_timeout, TcpStream::connect(addr))
                    .await
                    .map_err(|_| {
                        warn!("Connection timeout to peer {} ({})", username, addr);
                        SlskError::timeout_during("peer connect timed out", addr.to_string())
                    })?
                    .map_err(|e| {
                        warn!("Failed to connect to peer {} ({}): {}", username, addr, e);
                        SlskError::connection_error_full(
                            "Failed to connect to peer",
                            addr.to_string(),
                            e.to_string(),
                        )
                    })?;
                (socket, Bytes::new())
            }
            ConnectVia::ExistingSocket { socket, remainder } => (socket, remainder),
        };

        let addr = socket.peer_addr().map_err(|e| {
            SlskError::peer_error_full("Failed to get peer address", username, e.to_string())
        })?;

        let (read_half, write_half) = socket.into_split();
        let (tx, rx) = mpsc::channel(64);
        let reader_task = tokio::spawn(read_loop(read_half, tx, remainder, max_frame_size));

        info!("Peer connection established: {} ({})", username, addr);
        Ok((
            Self {
                username: username.to_string(),
                addr,
                writer: Mutex::new(Some(write_half)),
                reader_task,
            },
            rx,
        ))
    }

    /// Send a message, best-effort. A closed or unwritable socket makes
    /// this a no-op rather than an error; peers vanish routinely.
    pub async fn send(&self, message: &PeerMessage) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            debug!(
                "Dropping peer message {} for {} on closed connection",
                message.code(),
                self.username
            );
            return Ok(());
        };

        let frame = message.encode();
        trace!("Sending peer message to {}: code={}", self.username, message.code());
        if let Err(e) = writer.write_all(&frame).await {
            warn!("Peer write failed ({}): {}", self.username, e);
            *guard = None;
        }
        Ok(())
    }

    /// The remote user this connection belongs to
    pub fn username(&self) -> &str {
        &self.username
    }

    /// The remote socket address
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Tear the connection down, suppressing further events
    pub async fn destroy(&self) {
        debug!("Destroying peer connection: {}", self.username);
        self.reader_task.abort();
        *self.writer.lock().await = None;
    }
}

async fn read_loop(
    mut read_half: OwnedReadHalf,
    tx: mpsc::Sender<PeerEvent>,
    remainder: Bytes,
    max_frame_size: usize,
) {
    let mut framer = MessageFramer::new(max_frame_size);
    let mut chunk = vec![0u8; 8192];

    // Replay bytes that arrived bundled with the init frame
    let mut pending = match framer.push(&remainder) {
        Ok(frames) => frames,
        Err(e) => {
            let _ = tx.send(PeerEvent::Closed { error: Some(e.to_string()) }).await;
            return;
        }
    };

    let error = 'outer: loop {
        for frame in pending.drain(..) {
            match PeerMessage::decode(frame) {
                Ok(message) => {
                    if tx.send(PeerEvent::Message(message)).await.is_err() {
                        return;
                    }
                }
                Err(e) => warn!("Failed to decode peer message: {}", e),
            }
        }

        let n = match read_half.read(&mut chunk).await {
            Ok(0) => break 'outer None,
            Ok(n) => n,
            Err(e) => break 'outer Some(e.to_string()),
        };

        pending = match framer.push(&chunk[..n]) {
            Ok(frames) => frames,
            Err(e) => break 'outer Some(e.to_string()),
        };
    };

    debug!("Peer read loop ended (error: {:?})", error);
    let _ = tx.send(PeerEvent::Closed { error }).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_establish_via_existing_socket_with_remainder() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });
        let local = TcpStream::connect(addr).await.unwrap();
        let _remote = accept.await.unwrap();

        // A message that was already buffered when the socket was handed over
        let bundled = PeerMessage::PlaceInQueueResponse {
            filename: "music\\song.mp3".to_string(),
            place: 3,
        };
        let (_connection, mut rx) = PeerConnection::establish(
            "alice",
            ConnectVia::ExistingSocket {
                socket: local,
                remainder: bundled.encode().freeze(),
            },
            Duration::from_secs(2),
            1024 * 1024,
        )
        .await
        .unwrap();

        match rx.recv().await.unwrap() {
            PeerEvent::Message(message) => assert_eq!(message, bundled),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_messages_flow_and_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });
        let local = TcpStream::connect(addr).await.unwrap();
        let mut remote = accept.await.unwrap();

        let (_connection, mut rx) = PeerConnection::establish(
            "bob",
            ConnectVia::ExistingSocket {
                socket: local,
                remainder: Bytes::new(),
            },
            Duration::from_secs(2),
            1024 * 1024,
        )
        .await
        .unwrap();

        let message = PeerMessage::QueueUpload {
            filename: "music\\a.flac".to_string(),
        };
        remote.write_all(&message.encode()).await.unwrap();

        match rx.recv().await.unwrap() {
            PeerEvent::Message(decoded) => assert_eq!(decoded, message),
            other => panic!("unexpected event: {:?}", other),
        }

        drop(remote);
        match rx.recv().await.unwrap() {
            PeerEvent::Closed { error } => assert!(error.is_none()),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_send_on_destroyed_connection_is_noop() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });
        let local = TcpStream::connect(addr).await.unwrap();
        let _remote = accept.await.unwrap();

        let (connection, _rx) = PeerConnection::establish(
            "carol",
            ConnectVia::ExistingSocket {
                socket: local,
                remainder: Bytes::new(),
            },
            Duration::from_secs(2),
            1024 * 1024,
        )
        .await
        .unwrap();

        connection.destroy().await;
        let result = connection
            .send(&PeerMessage::PlaceInQueueRequest {
                filename: "music\\a.flac".to_string(),
            })
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_dial_refused_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = PeerConnection::establish(
            "dave",
            ConnectVia::Address(addr),
            Duration::from_secs(2),
            1024,
        )
        .await;
        assert!(result.is_err());
    }
}
