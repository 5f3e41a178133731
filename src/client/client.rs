//! Session orchestrator
//!
//! Owns the server connection, listen socket, peer table and download
//! list; routes every inbound message to the component that acts on
//! it. All state is process-local and mutated only by the client's
//! own tasks.

use anyhow::Result;
use bytes::Bytes;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::client::acquire;
use crate::client::download::{cleanup_partial, run_transfer, DownloadHandle, DownloadTable};
use crate::client::events::ClientEvent;
use crate::config::ClientConfig;
use crate::error::SlskError;
use crate::net::listener::{InboundConnection, Listener};
use crate::net::peer::{ConnectVia, PeerConnection, PeerEvent};
use crate::net::server::{ServerConnection, ServerEvent};
use crate::protocol::peer::{ConnKind, PeerMessage, TransferDirection};
use crate::protocol::server::{ServerRequest, ServerResponse, STATUS_ONLINE};
use crate::search::session::{base_name, SearchHit, SearchOptions, SearchSession};

/// One entry in the active peer table
pub(crate) struct PeerEntry {
    pub connection: Arc<PeerConnection>,
    router: JoinHandle<()>,
}

/// A socket produced by one of the acquisition strategies
#[derive(Debug)]
pub(crate) struct AcquiredSocket {
    pub socket: TcpStream,
    pub remainder: Bytes,
}

/// A registered wait for a pierce-firewall on a specific token
pub(crate) struct PendingAcquire {
    pub username: String,
    pub tx: oneshot::Sender<AcquiredSocket>,
}

/// In-flight request/response correlation state
#[derive(Default)]
pub(crate) struct PendingState {
    pub login: Option<oneshot::Sender<std::result::Result<String, String>>>,
    pub peer_addresses: HashMap<String, Vec<oneshot::Sender<(Ipv4Addr, u16)>>>,
    pub acquisitions: HashMap<u32, PendingAcquire>,
}

/// Shared orchestrator state
pub(crate) struct ClientInner {
    pub config: ClientConfig,
    pub server: RwLock<Option<Arc<ServerConnection>>>,
    pub listener: RwLock<Option<Listener>>,
    pub peers: RwLock<HashMap<String, PeerEntry>>,
    pub downloads: RwLock<DownloadTable>,
    pub searches: RwLock<HashMap<u32, SearchSession>>,
    pub pending: Mutex<PendingState>,
    pub username: RwLock<Option<String>>,
    events_tx: broadcast::Sender<ClientEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ClientInner {
    /// Broadcast an event; nobody listening is fine
    pub(crate) fn emit(&self, event: ClientEvent) {
        let _ = self.events_tx.send(event);
    }

    /// Send to the server, or fail when the session is down
    pub(crate) async fn send_server(&self, request: &ServerRequest) -> Result<()> {
        let guard = self.server.read().await;
        match guard.as_ref() {
            Some(server) => server.send(request).await,
            None => Err(SlskError::server_error("not connected to server").into()),
        }
    }

    /// Register a peer connection, deduplicating by username: the
    /// existing connection wins and the duplicate socket is destroyed.
    pub(crate) async fn register_peer(
        self: &Arc<Self>,
        username: &str,
        via: ConnectVia,
    ) -> Result<Arc<PeerConnection>> {
        if let Some(entry) = self.peers.read().await.get(username) {
            debug!("Peer {} already connected, destroying duplicate socket", username);
            return Ok(entry.connection.clone());
        }

        let (connection, rx) = PeerConnection::establish(
            username,
            via,
            self.config.connect_timeout,
            self.config.max_frame_size,
        )
        .await?;
        let connection = Arc::new(connection);

        let mut peers = self.peers.write().await;
        if let Some(existing) = peers.get(username) {
            // Lost a registration race; this socket is the duplicate
            debug!("Peer {} registered concurrently, destroying duplicate", username);
            connection.destroy().await;
            return Ok(existing.connection.clone());
        }

        let router = tokio::spawn(route_peer(self.clone(), username.to_string(), rx));
        peers.insert(
            username.to_string(),
            PeerEntry {
                connection: connection.clone(),
                router,
            },
        );
        Ok(connection)
    }

    /// Drop a peer from the table once its socket closed
    pub(crate) async fn remove_peer(&self, username: &str) {
        if let Some(entry) = self.peers.write().await.remove(username) {
            entry.connection.destroy().await;
            entry.router.abort();
            debug!("Removed peer {} from active table", username);
        }
    }

    async fn peer_connection(&self, username: &str) -> Option<Arc<PeerConnection>> {
        self.peers.read().await.get(username).map(|e| e.connection.clone())
    }

    /// Handle one decoded server message
    async fn handle_server_message(self: &Arc<Self>, message: ServerResponse) {
        match message {
            ServerResponse::LoginOk { greeting, own_ip } => {
                debug!("Login accepted (own ip {}): {}", own_ip, greeting);
                if let Some(tx) = self.pending.lock().await.login.take() {
                    let _ = tx.send(Ok(greeting));
                }
            }
            ServerResponse::LoginFailed { reason } => {
                warn!("Login rejected: {}", reason);
                if let Some(tx) = self.pending.lock().await.login.take() {
                    let _ = tx.send(Err(reason));
                }
            }
            ServerResponse::GetPeerAddress { username, ip, port } => {
                trace!("Peer address for {}: {}:{}", username, ip, port);
                let waiters = self.pending.lock().await.peer_addresses.remove(&username);
                if let Some(waiters) = waiters {
                    for tx in waiters {
                        let _ = tx.send((ip, port));
                    }
                }
            }
            ServerResponse::ConnectToPeer {
                username,
                kind: ConnKind::FileTransfer,
                ip,
                port,
                token,
            } => {
                debug!("Transfer connect signal from {} ({}:{})", username, ip, port);
                let inner = self.clone();
                self.spawn_task(async move {
                    let addr = std::net::SocketAddr::from((ip, port));
                    match timeout(inner.config.connect_timeout, TcpStream::connect(addr)).await {
                        Ok(Ok(socket)) => {
                            run_transfer(inner.clone(), socket, username, Some(token), Bytes::new())
                                .await;
                        }
                        Ok(Err(e)) => {
                            warn!("Transfer dial to {} failed: {}", username, e);
                            inner.emit(ClientEvent::PeerError {
                                username,
                                message: format!("transfer dial failed: {}", e),
                            });
                        }
                        Err(_) => {
                            warn!("Transfer dial to {} timed out", username);
                            inner.emit(ClientEvent::PeerError {
                                username,
                                message: "transfer dial timed out".to_string(),
                            });
                        }
                    }
                })
                .await;
            }
            ServerResponse::ConnectToPeer {
                username,
                kind: ConnKind::Peer,
                ip,
                port,
                token,
            } => {
                debug!("Peer connect request from {} ({}:{})", username, ip, port);
                let inner = self.clone();
                self.spawn_task(async move {
                    if let Err(e) = inner.dial_back(&username, ip, port, token).await {
                        debug!("Dial-back to {} failed: {}", username, e);
                        let _ = inner
                            .send_server(&ServerRequest::CantConnectToPeer {
                                token,
                                username: username.clone(),
                            })
                            .await;
                    }
                })
                .await;
            }
            ServerResponse::ConnectToPeer {
                username,
                kind: ConnKind::Distributed,
                ..
            } => {
                trace!("Ignoring distributed connect request from {}", username);
            }
            ServerResponse::PossibleParents(parents) => {
                // We stay a leaf; presence was already announced at login
                trace!("Ignoring {} possible parents", parents.len());
            }
            ServerResponse::CantConnectToPeer { token, username } => {
                debug!("Server reports {} unreachable (token {})", username, token);
                // Dropping the sender fails the waiting strategy
                self.pending.lock().await.acquisitions.remove(&token);
            }
            ServerResponse::Unknown { code } => {
                trace!("Ignoring server message code {}", code);
            }
        }
    }

    /// Dial a peer that asked the server for a connection, announce
    /// the pierce token, and register it.
    async fn dial_back(self: &Arc<Self>, username: &str, ip: Ipv4Addr, port: u16, token: u32) -> Result<()> {
        use tokio::io::AsyncWriteExt;

        let addr = std::net::SocketAddr::from((ip, port));
        let mut socket = timeout(self.config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| SlskError::timeout_during("dial-back timed out", username))?
            .map_err(|e| {
                SlskError::connection_error_full("dial-back failed", addr.to_string(), e.to_string())
            })?;

        let frame = PeerMessage::PierceFirewall { token }.encode();
        socket.write_all(&frame).await.map_err(|e| {
            SlskError::peer_error_full("pierce announce failed", username, e.to_string())
        })?;

        self.register_peer(
            username,
            ConnectVia::ExistingSocket {
                socket,
                remainder: Bytes::new(),
            },
        )
        .await?;
        Ok(())
    }

    /// Handle one decoded message from an established peer
    async fn handle_peer_message(self: &Arc<Self>, username: &str, message: PeerMessage) {
        match message {
            PeerMessage::FileSearchResponse(reply) => {
                let searches = self.searches.read().await;
                match searches.get(&reply.token) {
                    Some(session) => session.push_reply(&reply),
                    None => trace!("Dropping reply for finished search {}", reply.token),
                }
            }
            PeerMessage::TransferRequest {
                direction: TransferDirection::Upload,
                token,
                filename,
                file_size,
            } => {
                let granted = self
                    .downloads
                    .write()
                    .await
                    .connect(username, &filename, token, file_size);
                let response = if granted {
                    info!(
                        "Transfer granted: {} from {} ({} bytes, token {})",
                        filename, username, file_size, token
                    );
                    self.emit(ClientEvent::DownloadStarted {
                        username: username.to_string(),
                        filename: filename.clone(),
                        total: file_size,
                    });
                    PeerMessage::TransferResponse {
                        token,
                        allowed: true,
                        reason: None,
                    }
                } else {
                    debug!("Unsolicited transfer request from {} for {}", username, filename);
                    PeerMessage::TransferResponse {
                        token,
                        allowed: false,
                        reason: Some("Cancelled".to_string()),
                    }
                };
                if let Some(peer) = self.peer_connection(username).await {
                    let _ = peer.send(&response).await;
                }
            }
            PeerMessage::TransferRequest {
                direction: TransferDirection::Download,
                token,
                ..
            } => {
                // This subsystem does not serve uploads
                if let Some(peer) = self.peer_connection(username).await {
                    let _ = peer
                        .send(&PeerMessage::TransferResponse {
                            token,
                            allowed: false,
                            reason: Some("Cancelled".to_string()),
                        })
                        .await;
                }
            }
            PeerMessage::PlaceInQueueResponse { filename, place } => {
                if self.downloads.write().await.set_queue_place(username, &filename, place) {
                    self.emit(ClientEvent::DownloadQueued {
                        username: username.to_string(),
                        filename,
                        place,
                    });
                }
            }
            PeerMessage::UploadDenied { filename, reason } => {
                let slot = self.downloads.write().await.deny(username, &filename, &reason);
                if let Some(slot) = slot {
                    warn!("Upload denied by {}: {} ({})", username, filename, reason);
                    cleanup_partial(&slot.output_path).await;
                    self.emit(ClientEvent::DownloadFailed {
                        username: username.to_string(),
                        filename,
                        reason,
                    });
                }
            }
            PeerMessage::UploadFailed { filename } => {
                let slot = self
                    .downloads
                    .write()
                    .await
                    .fail_by_name(username, &filename, "remote upload failed");
                if let Some(slot) = slot {
                    warn!("Upload failed at {}: {}", username, filename);
                    cleanup_partial(&slot.output_path).await;
                    self.emit(ClientEvent::DownloadFailed {
                        username: username.to_string(),
                        filename,
                        reason: "remote upload failed".to_string(),
                    });
                }
            }
            PeerMessage::PierceFirewall { .. } | PeerMessage::PeerInit { .. } => {
                trace!("Ignoring init message on established peer {}", username);
            }
            PeerMessage::TransferResponse { .. }
            | PeerMessage::QueueUpload { .. }
            | PeerMessage::PlaceInQueueRequest { .. } => {
                trace!("Ignoring unexpected message from {}", username);
            }
            PeerMessage::Unknown { code } => {
                trace!("Ignoring peer message code {} from {}", code, username);
            }
        }
    }

    /// Decide what an accepted inbound socket becomes
    async fn handle_inbound(self: &Arc<Self>, inbound: InboundConnection) {
        let InboundConnection {
            socket,
            addr,
            first,
            remainder,
        } = inbound;

        match first {
            PeerMessage::PeerInit {
                username,
                kind: ConnKind::Peer,
                ..
            } => {
                debug!("Inbound peer connection from {} ({})", username, addr);
                if let Err(e) = self
                    .register_peer(&username, ConnectVia::ExistingSocket { socket, remainder })
                    .await
                {
                    self.emit(ClientEvent::PeerError {
                        username,
                        message: format!("inbound registration failed: {}", e),
                    });
                }
            }
            PeerMessage::PeerInit {
                username,
                kind: ConnKind::FileTransfer,
                ..
            } => {
                debug!("Inbound transfer connection from {} ({})", username, addr);
                let inner = self.clone();
                self.spawn_task(async move {
                    run_transfer(inner, socket, username, None, remainder).await;
                })
                .await;
            }
            PeerMessage::PeerInit {
                username,
                kind: ConnKind::Distributed,
                ..
            } => {
                trace!("Dropping distributed connection from {}", username);
            }
            PeerMessage::PierceFirewall { token } => {
                let pending = self.pending.lock().await.acquisitions.remove(&token);
                match pending {
                    Some(acquire) => {
                        debug!("Pierce-back from {} matched token {}", acquire.username, token);
                        let _ = acquire.tx.send(AcquiredSocket { socket, remainder });
                    }
                    None => {
                        debug!("Dropping pierce with unknown token {} from {}", token, addr);
                    }
                }
            }
            other => {
                debug!("Dropping inbound connection opening with code {}", other.code());
            }
        }
    }

    async fn spawn_task<F>(&self, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(future);
        self.tasks.lock().await.push(handle);
    }
}

/// Routing task for the server message stream
async fn route_server(inner: Arc<ClientInner>, mut rx: mpsc::Receiver<ServerEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            ServerEvent::Message(message) => inner.handle_server_message(message).await,
            ServerEvent::Closed { error } => {
                let message = error.unwrap_or_else(|| "server connection closed".to_string());
                warn!("Server connection lost: {}", message);
                *inner.server.write().await = None;
                *inner.username.write().await = None;
                if let Some(tx) = inner.pending.lock().await.login.take() {
                    let _ = tx.send(Err(message.clone()));
                }
                inner.emit(ClientEvent::ServerError { message });
                break;
            }
        }
    }
}

/// Routing task for the listen socket
async fn route_inbound(inner: Arc<ClientInner>, mut rx: mpsc::Receiver<InboundConnection>) {
    while let Some(inbound) = rx.recv().await {
        inner.handle_inbound(inbound).await;
    }
}

/// Routing task for one peer's message stream
async fn route_peer(inner: Arc<ClientInner>, username: String, mut rx: mpsc::Receiver<PeerEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            PeerEvent::Message(message) => inner.handle_peer_message(&username, message).await,
            PeerEvent::Closed { error } => {
                if let Some(message) = error {
                    debug!("Peer {} connection error: {}", username, message);
                    inner.emit(ClientEvent::PeerError {
                        username: username.clone(),
                        message,
                    });
                }
                inner.remove_peer(&username).await;
                break;
            }
        }
    }
}

/// Background sweep of idle downloads
async fn sweep_loop(inner: Arc<ClientInner>) {
    let mut interval = tokio::time::interval(inner.config.sweep_interval);
    interval.tick().await;
    loop {
        interval.tick().await;
        let swept = inner
            .downloads
            .write()
            .await
            .sweep_idle(inner.config.transfer_idle_ttl);
        for slot in swept {
            warn!(
                "Swept idle download: {} from {} ({} bytes received)",
                slot.remote_path, slot.username, slot.received
            );
            cleanup_partial(&slot.output_path).await;
            inner.emit(ClientEvent::DownloadFailed {
                username: slot.username.clone(),
                filename: slot.remote_path.clone(),
                reason: "download inactive past TTL".to_string(),
            });
        }
    }
}

/// The Soulseek client
pub struct Client {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").finish_non_exhaustive()
    }
}

impl Client {
    /// Create a client; `connect` starts the session
    pub fn new(config: ClientConfig) -> Self {
        let (events_tx, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(ClientInner {
                config,
                server: RwLock::new(None),
                listener: RwLock::new(None),
                peers: RwLock::new(HashMap::new()),
                downloads: RwLock::new(DownloadTable::new()),
                searches: RwLock::new(HashMap::new()),
                pending: Mutex::new(PendingState::default()),
                username: RwLock::new(None),
                events_tx,
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &Arc<ClientInner> {
        &self.inner
    }

    /// Dial the server, bind the listener and start routing
    pub async fn connect(&self) -> Result<()> {
        self.inner.config.validate()?;

        let (server, server_rx) = ServerConnection::connect(
            &self.inner.config.server_addr,
            self.inner.config.connect_timeout,
            self.inner.config.max_frame_size,
        )
        .await?;
        let (listener, inbound_rx) = match Listener::bind(
            self.inner.config.listen_port,
            self.inner.config.handshake_timeout,
            self.inner.config.max_frame_size,
        )
        .await
        {
            Ok(bound) => bound,
            Err(e) => {
                self.inner.emit(ClientEvent::ListenError {
                    message: e.to_string(),
                });
                return Err(e);
            }
        };

        *self.inner.server.write().await = Some(Arc::new(server));
        *self.inner.listener.write().await = Some(listener);

        self.inner
            .spawn_task(route_server(self.inner.clone(), server_rx))
            .await;
        self.inner
            .spawn_task(route_inbound(self.inner.clone(), inbound_rx))
            .await;
        self.inner.spawn_task(sweep_loop(self.inner.clone())).await;

        info!("Client connected to {}", self.inner.config.server_addr);
        Ok(())
    }

    /// Log in and announce presence
    pub async fn login(&self, username: &str, password: &str) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.inner.pending.lock().await;
            if pending.login.is_some() {
                return Err(SlskError::AlreadyConnecting.into());
            }
            pending.login = Some(tx);
        }

        let sent = self
            .inner
            .send_server(&ServerRequest::Login {
                username: username.to_string(),
                password: password.to_string(),
            })
            .await;
        if let Err(e) = sent {
            self.inner.pending.lock().await.login = None;
            return Err(e);
        }

        let outcome = match timeout(self.inner.config.connect_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => {
                self.inner.pending.lock().await.login = None;
                return Err(SlskError::server_error("login dropped").into());
            }
            Err(_) => {
                self.inner.pending.lock().await.login = None;
                return Err(SlskError::timeout_during(
                    "login timed out",
                    self.inner.config.server_addr.clone(),
                )
                .into());
            }
        };

        match outcome {
            Ok(greeting) => {
                info!("Logged in as {}: {}", username, greeting);
                *self.inner.username.write().await = Some(username.to_string());

                // Announce reachability and presence; stay childless in
                // the distributed network
                let listen_port = self
                    .inner
                    .listener
                    .read()
                    .await
                    .as_ref()
                    .map(|l| l.port())
                    .unwrap_or(self.inner.config.listen_port);
                self.inner
                    .send_server(&ServerRequest::SetWaitPort(listen_port))
                    .await?;
                self.inner
                    .send_server(&ServerRequest::SharedFoldersFiles { dirs: 1, files: 1 })
                    .await?;
                self.inner
                    .send_server(&ServerRequest::SetStatus(STATUS_ONLINE))
                    .await?;
                self.inner
                    .send_server(&ServerRequest::HaveNoParents(true))
                    .await?;
                Ok(())
            }
            Err(reason) => {
                Err(SlskError::server_error_with_source("login rejected", reason).into())
            }
        }
    }

    /// Broadcast a search and collect hits until the cutoff
    pub async fn search(&self, query: &str, options: SearchOptions) -> Result<Vec<SearchHit>> {
        self.search_with(query, options, |_| {}).await
    }

    /// Like `search`, invoking `on_hit` as each result arrives
    pub async fn search_with<F>(
        &self,
        query: &str,
        options: SearchOptions,
        mut on_hit: F,
    ) -> Result<Vec<SearchHit>>
    where
        F: FnMut(&SearchHit),
    {
        if self.inner.server.read().await.is_none() {
            return Err(SlskError::server_error("not connected to server").into());
        }

        let token: u32 = rand::random();
        let (session, mut rx) = SearchSession::new(token, query.to_string(), options.max_responses);
        self.inner.searches.write().await.insert(token, session);

        debug!("Searching (token {}): {:?}", token, query);
        let sent = self
            .inner
            .send_server(&ServerRequest::FileSearch {
                token,
                query: query.to_string(),
            })
            .await;
        if let Err(e) = sent {
            self.inner.searches.write().await.remove(&token);
            return Err(e);
        }

        let deadline = tokio::time::Instant::now() + options.timeout;
        let mut hits = Vec::new();
        while hits.len() < options.max_responses {
            let Some(remaining) = deadline.checked_duration_since(tokio::time::Instant::now())
            else {
                break;
            };
            match timeout(remaining, rx.recv()).await {
                Ok(Some(hit)) => {
                    on_hit(&hit);
                    hits.push(hit);
                }
                Ok(None) | Err(_) => break,
            }
        }

        self.inner.searches.write().await.remove(&token);
        debug!("Search {} finished with {} hits", token, hits.len());
        Ok(hits)
    }

    /// Queue a remote file for download
    pub async fn download(&self, username: &str, remote_path: &str) -> Result<DownloadHandle> {
        let peer = acquire::acquire_peer(&self.inner, username).await?;

        let output_path = self.inner.config.download_dir.join(base_name(remote_path));
        let resume_from = tokio::fs::metadata(&output_path)
            .await
            .map(|m| m.len())
            .unwrap_or(0);

        let handle = self.inner.downloads.write().await.insert(
            username,
            remote_path,
            output_path,
            resume_from,
        )?;

        peer.send(&PeerMessage::QueueUpload {
            filename: remote_path.to_string(),
        })
        .await?;
        peer.send(&PeerMessage::PlaceInQueueRequest {
            filename: remote_path.to_string(),
        })
        .await?;

        info!("Download requested: {} from {}", remote_path, username);
        Ok(handle)
    }

    /// Look up an active peer by username
    pub async fn peer(&self, username: &str) -> Option<Arc<PeerConnection>> {
        self.inner.peer_connection(username).await
    }

    /// Subscribe to the categorized event stream
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events_tx.subscribe()
    }

    /// Whether the session is connected and logged in
    pub async fn is_connected(&self) -> bool {
        self.inner.server.read().await.is_some() && self.inner.username.read().await.is_some()
    }

    /// Tear the whole session down
    pub async fn shutdown(&self) {
        info!("Shutting down client");

        for task in self.inner.tasks.lock().await.drain(..) {
            task.abort();
        }

        if let Some(server) = self.inner.server.write().await.take() {
            server.destroy().await;
        }
        if let Some(listener) = self.inner.listener.write().await.take() {
            listener.destroy();
        }
        for (_, entry) in self.inner.peers.write().await.drain() {
            entry.connection.destroy().await;
            entry.router.abort();
        }

        let failed = self.inner.downloads.write().await.fail_all("client shut down");
        for slot in failed {
            cleanup_partial(&slot.output_path).await;
        }

        *self.inner.username.write().await = None;
        self.inner.searches.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::download::DownloadStatus;
    use crate::protocol::peer::{SearchReply, SharedFile};
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    fn test_config() -> ClientConfig {
        ClientConfig {
            listen_port: 0,
            download_dir: std::env::temp_dir().join("slsk_client_test"),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_search_response_routed_to_session() {
        let client = Client::new(test_config());
        let inner = client.inner().clone();

        let (session, mut rx) = SearchSession::new(11, "artist song".to_string(), 8);
        inner.searches.write().await.insert(11, session);

        inner
            .handle_peer_message(
                "alice",
                PeerMessage::FileSearchResponse(SearchReply {
                    username: "alice".to_string(),
                    token: 11,
                    files: vec![SharedFile {
                        name: "music\\song.mp3".to_string(),
                        size: 5_000_000,
                        extension: "mp3".to_string(),
                        attributes: vec![(0, 320)],
                    }],
                    slots_free: true,
                    avg_speed: 90_000,
                    queue_length: 1,
                }),
            )
            .await;

        let hit = rx.recv().await.unwrap();
        assert_eq!(hit.username, "alice");
        assert_eq!(hit.bitrate, Some(320));
    }

    #[tokio::test]
    async fn test_queue_and_deny_drive_download_state() {
        let client = Client::new(test_config());
        let inner = client.inner().clone();

        let handle = inner
            .downloads
            .write()
            .await
            .insert(
                "bob",
                "music\\song.mp3",
                std::env::temp_dir().join("slsk_client_test_deny.mp3"),
                0,
            )
            .unwrap();

        inner
            .handle_peer_message(
                "bob",
                PeerMessage::PlaceInQueueResponse {
                    filename: "music\\song.mp3".to_string(),
                    place: 5,
                },
            )
            .await;
        assert_eq!(handle.status(), DownloadStatus::Queued { place: 5 });

        inner
            .handle_peer_message(
                "bob",
                PeerMessage::UploadDenied {
                    filename: "music\\song.mp3".to_string(),
                    reason: "File not shared.".to_string(),
                },
            )
            .await;
        assert_eq!(
            handle.status(),
            DownloadStatus::Denied {
                reason: "File not shared.".to_string()
            }
        );
        assert_eq!(inner.downloads.read().await.len(), 0);
    }

    #[tokio::test]
    async fn test_transfer_request_grants_and_connects() {
        let client = Client::new(test_config());
        let inner = client.inner().clone();

        let handle = inner
            .downloads
            .write()
            .await
            .insert(
                "carol",
                "music\\tune.flac",
                std::env::temp_dir().join("slsk_client_test_tune.flac"),
                0,
            )
            .unwrap();

        inner
            .handle_peer_message(
                "carol",
                PeerMessage::TransferRequest {
                    direction: TransferDirection::Upload,
                    token: 314,
                    filename: "music\\tune.flac".to_string(),
                    file_size: 1024,
                },
            )
            .await;

        assert_eq!(handle.status(), DownloadStatus::Connected);
        let claim = inner.downloads.write().await.claim("carol", 314).unwrap();
        assert_eq!(claim.resume_offset, 0);
    }

    #[tokio::test]
    async fn test_transfer_socket_single_chunk_completes() {
        // One chunk carrying [token][8 data bytes] against a connected
        // download with total 8 must complete within that event
        let client = Client::new(test_config());
        let inner = client.inner().clone();

        let output = std::env::temp_dir().join(format!(
            "slsk_client_test_transfer_{}.bin",
            std::process::id()
        ));
        let _ = tokio::fs::remove_file(&output).await;

        let mut handle = inner
            .downloads
            .write()
            .await
            .insert("dave", "music\\tiny.bin", output.clone(), 0)
            .unwrap();
        assert!(inner
            .downloads
            .write()
            .await
            .connect("dave", "music\\tiny.bin", 4242, 8));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });
        let local = TcpStream::connect(addr).await.unwrap();
        let mut remote = accept.await.unwrap();

        let transfer = tokio::spawn(run_transfer(
            inner.clone(),
            local,
            "dave".to_string(),
            None,
            Bytes::new(),
        ));

        // Token and all eight data bytes in a single write
        let mut chunk = Vec::new();
        chunk.extend_from_slice(&4242u32.to_le_bytes());
        chunk.extend_from_slice(b"ABCDEFGH");
        remote.write_all(&chunk).await.unwrap();

        // The downloader replies with the 8-byte resume offset
        use tokio::io::AsyncReadExt;
        let mut offset = [0u8; 8];
        remote.read_exact(&mut offset).await.unwrap();
        assert_eq!(u64::from_le_bytes(offset), 0);

        let status = handle.wait().await;
        assert_eq!(status, DownloadStatus::Complete);
        transfer.await.unwrap();

        let written = tokio::fs::read(&output).await.unwrap();
        assert_eq!(written, b"ABCDEFGH");
        let _ = tokio::fs::remove_file(&output).await;
    }

    #[tokio::test]
    async fn test_transfer_socket_close_before_completion_errors() {
        let client = Client::new(test_config());
        let inner = client.inner().clone();

        let output = std::env::temp_dir().join(format!(
            "slsk_client_test_partial_{}.bin",
            std::process::id()
        ));
        let _ = tokio::fs::remove_file(&output).await;

        let mut handle = inner
            .downloads
            .write()
            .await
            .insert("erin", "music\\big.bin", output.clone(), 0)
            .unwrap();
        assert!(inner
            .downloads
            .write()
            .await
            .connect("erin", "music\\big.bin", 7, 100));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });
        let local = TcpStream::connect(addr).await.unwrap();
        let mut remote = accept.await.unwrap();

        let transfer = tokio::spawn(run_transfer(
            inner.clone(),
            local,
            "erin".to_string(),
            None,
            Bytes::new(),
        ));

        let mut chunk = Vec::new();
        chunk.extend_from_slice(&7u32.to_le_bytes());
        chunk.extend_from_slice(b"partial");
        remote.write_all(&chunk).await.unwrap();
        drop(remote);

        let status = handle.wait().await;
        assert!(matches!(status, DownloadStatus::Errored { .. }));
        transfer.await.unwrap();

        // Partial output was cleaned up
        assert!(tokio::fs::metadata(&output).await.is_err());
    }

    #[tokio::test]
    async fn test_unmatched_transfer_token_drops_socket() {
        let client = Client::new(test_config());
        let inner = client.inner().clone();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });
        let local = TcpStream::connect(addr).await.unwrap();
        let mut remote = accept.await.unwrap();

        let transfer = tokio::spawn(run_transfer(
            inner.clone(),
            local,
            "mallory".to_string(),
            None,
            Bytes::new(),
        ));

        remote.write_all(&999u32.to_le_bytes()).await.unwrap();
        transfer.await.unwrap();

        // The remote sees the socket close without an offset
        use tokio::io::AsyncReadExt;
        let mut buf = [0u8; 8];
        let n = tokio::time::timeout(Duration::from_secs(2), remote.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_login_without_server_fails() {
        let client = Client::new(test_config());
        let result = client.login("user", "pass").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_search_without_server_fails() {
        let client = Client::new(test_config());
        let result = client.search("query", SearchOptions::default()).await;
        assert!(result.is_err());
    }
}
