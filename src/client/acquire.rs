//! Peer acquisition
//!
//! Acquiring a peer races two strategies that share one correlation
//! token: ask the server to relay a connect request and wait for the
//! peer to pierce back on the listener, or ask for the peer's address
//! and dial it directly. First success wins; the loser is aborted and
//! its socket destroyed; both failing yields one aggregated error.

use anyhow::Result;
use bytes::Bytes;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::client::client::{AcquiredSocket, ClientInner, PendingAcquire};
use crate::error::SlskError;
use crate::net::peer::{ConnectVia, PeerConnection};
use crate::protocol::peer::{ConnKind, PeerMessage};
use crate::protocol::server::ServerRequest;

/// Acquire a messaging connection to `username`, reusing an existing
/// peer when there is one.
pub(crate) async fn acquire_peer(
    inner: &Arc<ClientInner>,
    username: &str,
) -> Result<Arc<PeerConnection>> {
    if let Some(entry) = inner.peers.read().await.get(username) {
        trace!("Reusing existing peer connection: {}", username);
        return Ok(entry.connection.clone());
    }

    let our_username = inner
        .username
        .read()
        .await
        .clone()
        .ok_or_else(|| SlskError::server_error("not logged in"))?;

    let token: u32 = rand::random();
    let (pierce_tx, pierce_rx) = oneshot::channel();
    inner.pending.lock().await.acquisitions.insert(
        token,
        PendingAcquire {
            username: username.to_string(),
            tx: pierce_tx,
        },
    );

    debug!("Acquiring peer {} (token {})", username, token);
    let indirect = tokio::spawn(indirect_connect(
        inner.clone(),
        username.to_string(),
        token,
        pierce_rx,
    ));
    let direct = tokio::spawn(direct_connect(
        inner.clone(),
        username.to_string(),
        our_username,
        token,
    ));

    let outcome = race(username, indirect, direct).await;
    inner.pending.lock().await.acquisitions.remove(&token);
    let acquired = outcome?;

    inner
        .register_peer(
            username,
            ConnectVia::ExistingSocket {
                socket: acquired.socket,
                remainder: acquired.remainder,
            },
        )
        .await
}

/// Join the two strategy tasks by first success. Aborting the loser
/// drops its socket, so no duplicate connection leaks.
async fn race(
    username: &str,
    mut indirect: JoinHandle<Result<AcquiredSocket>>,
    mut direct: JoinHandle<Result<AcquiredSocket>>,
) -> Result<AcquiredSocket> {
    let (first, second, first_name, second_name) = tokio::select! {
        result = &mut indirect => (result, direct, "indirect", "direct"),
        result = &mut direct => (result, indirect, "direct", "indirect"),
    };

    let first_error = match first {
        Ok(Ok(socket)) => {
            debug!("Peer {} acquired via {} strategy", username, first_name);
            second.abort();
            return Ok(socket);
        }
        Ok(Err(e)) => e.to_string(),
        Err(e) => e.to_string(),
    };

    match second.await {
        Ok(Ok(socket)) => {
            debug!("Peer {} acquired via {} strategy", username, second_name);
            Ok(socket)
        }
        Ok(Err(second_error)) => Err(SlskError::peer_error_full(
            "both acquisition strategies failed",
            username,
            format!(
                "{}: {}; {}: {}",
                first_name, first_error, second_name, second_error
            ),
        )
        .into()),
        Err(join_error) => Err(SlskError::peer_error_full(
            "both acquisition strategies failed",
            username,
            format!("{}: {}; {}: {}", first_name, first_error, second_name, join_error),
        )
        .into()),
    }
}

/// Strategy (a): server relays a connect request; the peer pierces
/// back to our listener with the shared token.
async fn indirect_connect(
    inner: Arc<ClientInner>,
    username: String,
    token: u32,
    pierce_rx: oneshot::Receiver<AcquiredSocket>,
) -> Result<AcquiredSocket> {
    inner
        .send_server(&ServerRequest::ConnectToPeer {
            token,
            username: username.clone(),
            kind: ConnKind::Peer,
        })
        .await?;

    match timeout(inner.config.peer_timeout, pierce_rx).await {
        Ok(Ok(socket)) => Ok(socket),
        // The pending entry was dropped: the server reported the peer
        // unreachable, or the session is tearing down
        Ok(Err(_)) => {
            Err(SlskError::peer_error_with_peer("peer did not pierce back", username).into())
        }
        Err(_) => Err(SlskError::timeout_during("pierce-firewall wait timed out", username).into()),
    }
}

/// Strategy (b): resolve the peer's address through the server, dial
/// it directly and announce intent with a peer-init.
async fn direct_connect(
    inner: Arc<ClientInner>,
    username: String,
    our_username: String,
    token: u32,
) -> Result<AcquiredSocket> {
    let (ip, port) = request_peer_address(&inner, &username).await?;
    let addr = SocketAddr::from((ip, port));

    let mut socket = timeout(inner.config.peer_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| SlskError::timeout_during("direct dial timed out", addr.to_string()))?
        .map_err(|e| {
            SlskError::connection_error_full("direct dial failed", addr.to_string(), e.to_string())
        })?;

    let init = PeerMessage::PeerInit {
        username: our_username,
        kind: ConnKind::Peer,
        token,
    };
    socket.write_all(&init.encode()).await.map_err(|e| {
        SlskError::peer_error_full("peer-init announce failed", &username, e.to_string())
    })?;

    Ok(AcquiredSocket {
        socket,
        remainder: Bytes::new(),
    })
}

/// Ask the server for a peer's address. An all-zero answer means the
/// peer is offline.
async fn request_peer_address(inner: &Arc<ClientInner>, username: &str) -> Result<(Ipv4Addr, u16)> {
    let (tx, rx) = oneshot::channel();
    inner
        .pending
        .lock()
        .await
        .peer_addresses
        .entry(username.to_string())
        .or_default()
        .push(tx);

    inner
        .send_server(&ServerRequest::GetPeerAddress {
            username: username.to_string(),
        })
        .await?;

    match timeout(inner.config.peer_timeout, rx).await {
        Ok(Ok((ip, port))) if port != 0 => Ok((ip, port)),
        Ok(Ok(_)) => Err(SlskError::peer_error_with_peer("peer is offline", username).into()),
        Ok(Err(_)) => Err(SlskError::peer_error_with_peer("address request dropped", username).into()),
        Err(_) => {
            Err(SlskError::timeout_during("peer address request timed out", username).into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spawn_ready() -> JoinHandle<Result<AcquiredSocket>> {
        tokio::spawn(async move {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let accept = tokio::spawn(async move { listener.accept().await.unwrap() });
            let socket = TcpStream::connect(addr).await.unwrap();
            let _ = accept.await.unwrap();
            Ok(AcquiredSocket {
                socket,
                remainder: Bytes::new(),
            })
        })
    }

    fn spawn_failing(delay_ms: u64) -> JoinHandle<Result<AcquiredSocket>> {
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
            Err(SlskError::peer_error("strategy failed").into())
        })
    }

    fn spawn_hanging() -> JoinHandle<Result<AcquiredSocket>> {
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
            Err(SlskError::peer_error("never reached").into())
        })
    }

    #[tokio::test]
    async fn test_race_first_success_wins_and_loser_aborted() {
        let winner = spawn_ready();
        let loser = spawn_hanging();
        let result = race("alice", winner, loser).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_race_falls_back_to_second_strategy() {
        let failing = spawn_failing(0);
        let winner = spawn_ready();
        let result = race("bob", failing, winner).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_race_aggregates_both_failures() {
        let a = spawn_failing(0);
        let b = spawn_failing(10);
        let err = race("carol", a, b).await.unwrap_err();
        let message = err.to_string();
        assert!(message.contains("both acquisition strategies failed"));
        assert!(message.contains("indirect"));
        assert!(message.contains("direct"));
    }
}
