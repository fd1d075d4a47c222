//! Protocol controller.
//!
//! This module provides:
//! - Inbound listener and outbound connects
//! - Connection maps keyed by the peer's current id
//! - Handshake, ping and command dispatch
//! - Unicast and broadcast sends
//!
//! Every connection and acceptor notification is funnelled through one
//! dispatch task, so packets from a single connection are handled in arrival
//! order. Consumers observe the overlay through [`NetworkEvent`]s published on
//! a broadcast channel.

use crate::acceptor::{AcceptorEvent, ConnectionAcceptor};
use crate::codec::{LevinCodec, PacketCodec};
use crate::connection::{Connection, ConnectionConfig, ConnectionEvent};
use crate::handshake::HandshakeCheck;
use crate::message::{
    Command, HandshakePayload, LiteBlockPayload, MissingTransactionsPayload, NewBlockPayload,
    NewTransactionsPayload, Packet, Payload, PingPayload, RequestChainPayload,
    RequestGetObjectsPayload, RequestTxPoolPayload, ResponseChainEntryPayload,
    ResponseGetObjectsPayload, TimedSyncPayload,
};
use crate::peer::{generate_peer_id, PeerEntry};
use crate::{NetworkError, NetworkResult, DEFAULT_PORT};
use bytes::Bytes;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Maximum number of peers attached to a handshake reply.
pub const HANDSHAKE_PEERLIST_LIMIT: usize = 250;

/// Capacity of the event broadcast channel.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Controller configuration.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Listen address.
    pub bind_ip: String,
    /// Listen port, 0 for any free port.
    pub bind_port: u16,
    /// Port advertised in handshakes instead of the bound one.
    pub external_port: Option<u16>,
    /// Maximum accepted connections alive at once.
    pub max_incoming: Option<usize>,
    /// Connection configuration.
    pub connection: ConnectionConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            bind_ip: "0.0.0.0".to_string(),
            bind_port: DEFAULT_PORT,
            external_port: None,
            max_incoming: None,
            connection: ConnectionConfig::default(),
        }
    }
}

/// Events emitted by the controller.
#[derive(Debug, Clone)]
pub enum NetworkEvent {
    /// Listener bound.
    Listening(SocketAddr),
    /// Outbound connection established and handshake sent.
    Connect { id: String, ip: String, port: u16 },
    /// A tracked connection closed.
    Disconnect { id: String, error: Option<String> },
    /// Reading from a connection failed.
    ClientError { id: String, error: String },
    Handshake { id: String, payload: HandshakePayload },
    TimedSync { id: String, payload: TimedSyncPayload },
    NewBlock { id: String, payload: NewBlockPayload },
    NewTransactions { id: String, payload: NewTransactionsPayload },
    RequestGetObjects { id: String, payload: RequestGetObjectsPayload },
    ResponseGetObjects { id: String, payload: ResponseGetObjectsPayload },
    RequestChain { id: String, payload: RequestChainPayload },
    ResponseChainEntry { id: String, payload: ResponseChainEntryPayload },
    RequestTxPool { id: String, payload: RequestTxPoolPayload },
    LiteBlock { id: String, payload: LiteBlockPayload },
    MissingTransactions { id: String, payload: MissingTransactionsPayload },
    /// A connection learned its peer's identity.
    ChangeId { old_id: String, new_id: String },
    /// A command this crate does not interpret.
    Unknown { id: String, command: u32, payload: Bytes },
    /// Recoverable problem.
    Warn(String),
    /// Controller shut down.
    Close,
    /// Listener failure.
    Error(String),
}

impl NetworkEvent {
    /// Event name.
    pub fn name(&self) -> &'static str {
        match self {
            NetworkEvent::Listening(_) => "listening",
            NetworkEvent::Connect { .. } => "connect",
            NetworkEvent::Disconnect { .. } => "disconnect",
            NetworkEvent::ClientError { .. } => "client_error",
            NetworkEvent::Handshake { .. } => Command::Handshake.name(),
            NetworkEvent::TimedSync { .. } => Command::TimedSync.name(),
            NetworkEvent::NewBlock { .. } => Command::NewBlock.name(),
            NetworkEvent::NewTransactions { .. } => Command::NewTransactions.name(),
            NetworkEvent::RequestGetObjects { .. } => Command::RequestGetObjects.name(),
            NetworkEvent::ResponseGetObjects { .. } => Command::ResponseGetObjects.name(),
            NetworkEvent::RequestChain { .. } => Command::RequestChain.name(),
            NetworkEvent::ResponseChainEntry { .. } => Command::ResponseChainEntry.name(),
            NetworkEvent::RequestTxPool { .. } => Command::RequestTxPool.name(),
            NetworkEvent::LiteBlock { .. } => Command::LiteBlock.name(),
            NetworkEvent::MissingTransactions { .. } => Command::MissingTransactions.name(),
            NetworkEvent::ChangeId { .. } => "change_id",
            NetworkEvent::Unknown { .. } => "unknown",
            NetworkEvent::Warn(_) => "warn",
            NetworkEvent::Close => "close",
            NetworkEvent::Error(_) => "error",
        }
    }
}

/// Supplies the peer list attached to handshake replies.
pub trait PeerListSource: Send + Sync + 'static {
    /// Up to `limit` known peers.
    fn peer_list(&self, limit: usize) -> Vec<PeerEntry>;
}

/// Result of moving a connection to the id its peer asserted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rekey {
    Renamed,
    /// Another connection already uses the asserted id.
    Taken,
    /// The connection is no longer tracked.
    Untracked,
}

struct ControllerInner {
    config: ControllerConfig,
    codec: Arc<dyn PacketCodec>,
    local_id: RwLock<String>,
    outgoing: RwLock<HashMap<String, Connection>>,
    incoming: RwLock<HashMap<String, Connection>>,
    event_tx: broadcast::Sender<NetworkEvent>,
    conn_tx: mpsc::UnboundedSender<ConnectionEvent>,
    conn_rx: Mutex<Option<mpsc::UnboundedReceiver<ConnectionEvent>>>,
    acceptor: Mutex<Option<Arc<ConnectionAcceptor>>>,
    local_addr: RwLock<Option<SocketAddr>>,
    peer_source: RwLock<Option<Arc<dyn PeerListSource>>>,
    started: AtomicBool,
    dispatch: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

/// Owns every connection and runs the protocol state machine.
#[derive(Clone)]
pub struct ProtocolController {
    inner: Arc<ControllerInner>,
}

impl ProtocolController {
    /// Create a controller with a fresh local identity.
    pub fn new(config: ControllerConfig) -> Self {
        let codec: Arc<dyn PacketCodec> =
            Arc::new(LevinCodec::with_max_size(config.connection.max_packet_size));
        Self::with_codec(config, codec)
    }

    /// Create a controller using a custom packet codec.
    pub fn with_codec(config: ControllerConfig, codec: Arc<dyn PacketCodec>) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (conn_tx, conn_rx) = mpsc::unbounded_channel();

        Self {
            inner: Arc::new(ControllerInner {
                config,
                codec,
                local_id: RwLock::new(generate_peer_id()),
                outgoing: RwLock::new(HashMap::new()),
                incoming: RwLock::new(HashMap::new()),
                event_tx,
                conn_tx,
                conn_rx: Mutex::new(Some(conn_rx)),
                acceptor: Mutex::new(None),
                local_addr: RwLock::new(None),
                peer_source: RwLock::new(None),
                started: AtomicBool::new(false),
                dispatch: Mutex::new(None),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Set the source of peer lists for handshake replies.
    pub fn set_peer_source(&self, source: Arc<dyn PeerListSource>) {
        *self.inner.peer_source.write() = Some(source);
    }

    /// Subscribe to controller events.
    pub fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Our identity.
    pub fn local_id(&self) -> String {
        self.inner.local_id.read().clone()
    }

    /// Bound listener address, once listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.read()
    }

    /// Number of outbound connections.
    pub fn outgoing_count(&self) -> usize {
        self.inner.outgoing.read().len()
    }

    /// Number of inbound connections.
    pub fn incoming_count(&self) -> usize {
        self.inner.incoming.read().len()
    }

    /// Number of tracked connections.
    pub fn connection_count(&self) -> usize {
        self.outgoing_count() + self.incoming_count()
    }

    /// Ids of outbound connections.
    pub fn outgoing_ids(&self) -> Vec<String> {
        self.inner.outgoing.read().keys().cloned().collect()
    }

    /// Ids of inbound connections.
    pub fn incoming_ids(&self) -> Vec<String> {
        self.inner.incoming.read().keys().cloned().collect()
    }

    /// Whether a connection with this id is tracked.
    pub fn is_connected(&self, id: &str) -> bool {
        self.inner.outgoing.read().contains_key(id) || self.inner.incoming.read().contains_key(id)
    }

    /// Bind the listener and start dispatching. A controller listens once.
    pub async fn listen(&self) -> NetworkResult<SocketAddr> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(NetworkError::AlreadyStarted);
        }

        let Some(conn_rx) = self.inner.conn_rx.lock().take() else {
            return Err(NetworkError::InvalidState(
                "controller has been shut down".to_string(),
            ));
        };

        let (acceptor_tx, acceptor_rx) = mpsc::unbounded_channel();
        let config = &self.inner.config;
        let acceptor = match ConnectionAcceptor::bind(
            &config.bind_ip,
            config.bind_port,
            config.max_incoming,
            self.inner.codec.clone(),
            acceptor_tx,
        )
        .await
        {
            Ok(acceptor) => acceptor,
            Err(e) => {
                *self.inner.conn_rx.lock() = Some(conn_rx);
                self.inner.started.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        let addr = acceptor.local_addr();
        *self.inner.local_addr.write() = Some(addr);
        *self.inner.acceptor.lock() = Some(Arc::new(acceptor));

        let handle = tokio::spawn(dispatch_loop(
            self.inner.clone(),
            conn_rx,
            acceptor_rx,
            self.inner.cancel.clone(),
        ));
        *self.inner.dispatch.lock() = Some(handle);

        Ok(addr)
    }

    /// Open an outbound connection and send our handshake.
    ///
    /// Returns the connection's provisional id. Nothing is registered when
    /// the transport fails.
    pub async fn connect(&self, peer: &PeerEntry) -> NetworkResult<String> {
        info!(peer = %peer.address(), "Connecting to peer");

        let conn = Connection::connect(
            peer,
            &self.inner.config.connection,
            self.inner.codec.clone(),
        )
        .await?;

        let handshake = HandshakePayload::new(self.local_id(), self.advertised_port());
        let packet = Packet::new(Command::Handshake, Payload::Handshake(handshake), true);
        if let Err(e) = conn.send(&packet).await {
            conn.close().await;
            return Err(e);
        }

        let id = conn.id();
        self.inner.outgoing.write().insert(id.clone(), conn.clone());
        conn.start(self.inner.conn_tx.clone());

        self.emit(NetworkEvent::Connect {
            id: id.clone(),
            ip: peer.ip.clone(),
            port: peer.port,
        });

        Ok(id)
    }

    /// Send a packet.
    ///
    /// With a `target`, writes to that connection only and returns its error.
    /// Without one, writes to every outbound connection concurrently and
    /// returns `Ok(true)` only if every write succeeded.
    pub async fn send(
        &self,
        command: Command,
        payload: Payload,
        expects_response: bool,
        target: Option<&str>,
    ) -> NetworkResult<bool> {
        let packet = Packet::new(command, payload, expects_response);
        let bytes = self.inner.codec.encode(&packet)?;

        if let Some(id) = target {
            let conn = self
                .find(id)
                .ok_or_else(|| NetworkError::PeerNotFound(id.to_string()))?;
            conn.write(&bytes).await?;
            return Ok(true);
        }

        let peers: Vec<Connection> = self.inner.outgoing.read().values().cloned().collect();
        let results = join_all(peers.iter().map(|conn| conn.write(&bytes))).await;

        let mut all_ok = true;
        for (conn, result) in peers.iter().zip(results) {
            if let Err(e) = result {
                warn!(peer = %conn.id(), error = %e, command = %command, "Broadcast write failed");
                all_ok = false;
            }
        }
        Ok(all_ok)
    }

    /// Close the listener and every connection, then stop dispatching.
    pub async fn shutdown(&self) {
        info!("Protocol controller shutting down");

        let acceptor = self.inner.acceptor.lock().take();
        if let Some(acceptor) = acceptor {
            acceptor.close().await;
        }

        let conns: Vec<Connection> = {
            let outgoing = self.inner.outgoing.read();
            let incoming = self.inner.incoming.read();
            outgoing.values().chain(incoming.values()).cloned().collect()
        };
        join_all(conns.iter().map(|conn| conn.close())).await;

        self.inner.cancel.cancel();
        let dispatch = self.inner.dispatch.lock().take();
        if let Some(dispatch) = dispatch {
            let _ = dispatch.await;
        }

        // Without a dispatch task nothing drained the close notifications
        self.inner.outgoing.write().clear();
        self.inner.incoming.write().clear();
        self.inner.conn_rx.lock().take();

        self.emit(NetworkEvent::Close);
    }

    /// Publish a warning on the event feed.
    pub fn warn(&self, message: impl Into<String>) {
        self.emit(NetworkEvent::Warn(message.into()));
    }

    fn emit(&self, event: NetworkEvent) {
        self.inner.emit(event);
    }

    fn find(&self, id: &str) -> Option<Connection> {
        self.inner.find(id)
    }

    fn advertised_port(&self) -> u16 {
        self.inner.advertised_port()
    }

    #[cfg(test)]
    pub(crate) fn register_outgoing(&self, conn: Connection) {
        self.inner.outgoing.write().insert(conn.id(), conn);
    }
}

impl ControllerInner {
    fn emit(&self, event: NetworkEvent) {
        // No subscribers is fine
        let _ = self.event_tx.send(event);
    }

    fn find(&self, id: &str) -> Option<Connection> {
        if let Some(conn) = self.outgoing.read().get(id) {
            return Some(conn.clone());
        }
        self.incoming.read().get(id).cloned()
    }

    fn advertised_port(&self) -> u16 {
        self.config.external_port.unwrap_or_else(|| {
            self.local_addr
                .read()
                .map(|addr| addr.port())
                .unwrap_or(self.config.bind_port)
        })
    }

    /// Move a connection from `old_id` to `new_id` in whichever map holds
    /// it. `ChangeId` is emitted under the map locks, only when the move
    /// happens.
    fn rekey(&self, old_id: &str, new_id: &str) -> Rekey {
        let mut outgoing = self.outgoing.write();
        let mut incoming = self.incoming.write();

        if outgoing.contains_key(new_id) || incoming.contains_key(new_id) {
            return Rekey::Taken;
        }

        let map = if outgoing.contains_key(old_id) {
            &mut outgoing
        } else if incoming.contains_key(old_id) {
            &mut incoming
        } else {
            return Rekey::Untracked;
        };

        let Some(conn) = map.remove(old_id) else {
            return Rekey::Untracked;
        };
        self.emit(NetworkEvent::ChangeId {
            old_id: old_id.to_string(),
            new_id: new_id.to_string(),
        });
        conn.set_id(new_id);
        map.insert(new_id.to_string(), conn);
        Rekey::Renamed
    }

    /// Tracked connection with the given key.
    fn resolve(&self, key: u64) -> Option<Connection> {
        let by_key = |map: &HashMap<String, Connection>| {
            map.values().find(|conn| conn.key() == key).cloned()
        };
        by_key(&*self.outgoing.read()).or_else(|| by_key(&*self.incoming.read()))
    }

    /// Stop tracking the connection with the given key. Returns its id.
    fn remove(&self, key: u64) -> Option<String> {
        for map in [&self.outgoing, &self.incoming] {
            let mut map = map.write();
            let id = map
                .iter()
                .find(|(_, conn)| conn.key() == key)
                .map(|(id, _)| id.clone());
            if let Some(id) = id {
                map.remove(&id);
                return Some(id);
            }
        }
        None
    }

    fn handle_acceptor_event(&self, event: AcceptorEvent) {
        match event {
            AcceptorEvent::Listening(addr) => self.emit(NetworkEvent::Listening(addr)),
            AcceptorEvent::Connection(conn) => {
                info!(addr = ?conn.remote_addr(), id = %conn.id(), "Incoming connection");
                self.incoming.write().insert(conn.id(), conn.clone());
                conn.start(self.conn_tx.clone());
            }
            AcceptorEvent::Error(error) => self.emit(NetworkEvent::Error(error)),
            AcceptorEvent::Closed => debug!("Listener closed"),
        }
    }

    fn handle_connection_event(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Connected { key } => debug!(key, "Reader started"),
            ConnectionEvent::Packet { key, packet } => match self.resolve(key) {
                Some(conn) => self.dispatch(&conn, packet),
                None => debug!(key, command = %packet.command, "Packet from untracked connection"),
            },
            ConnectionEvent::Error { key, error } => {
                let Some(conn) = self.resolve(key) else {
                    debug!(key, error = %error, "Receive error on untracked connection");
                    return;
                };
                let id = conn.id();
                warn!(peer = %id, error = %error, "Receive error");
                self.emit(NetworkEvent::ClientError { id, error });
            }
            ConnectionEvent::Closed { key, error } => {
                if let Some(id) = self.remove(key) {
                    info!(peer = %id, "Peer disconnected");
                    self.emit(NetworkEvent::Disconnect { id, error });
                }
            }
        }
    }

    fn dispatch(&self, conn: &Connection, packet: Packet) {
        let id = conn.id();
        debug!(peer = %id, command = %packet.command, "Received packet");

        let event = match packet.payload {
            Payload::Handshake(payload) => {
                self.handle_handshake(conn, payload, packet.expects_response, packet.response);
                return;
            }
            Payload::Ping(_) => {
                if !packet.response {
                    let pong = PingPayload::ok(self.local_id.read().clone());
                    self.reply(conn, Command::Ping, Payload::Ping(pong));
                }
                return;
            }
            Payload::TimedSync(payload) => NetworkEvent::TimedSync { id, payload },
            Payload::NewBlock(payload) => NetworkEvent::NewBlock { id, payload },
            Payload::NewTransactions(payload) => NetworkEvent::NewTransactions { id, payload },
            Payload::RequestGetObjects(payload) => NetworkEvent::RequestGetObjects { id, payload },
            Payload::ResponseGetObjects(payload) => {
                NetworkEvent::ResponseGetObjects { id, payload }
            }
            Payload::RequestChain(payload) => NetworkEvent::RequestChain { id, payload },
            Payload::ResponseChainEntry(payload) => {
                NetworkEvent::ResponseChainEntry { id, payload }
            }
            Payload::RequestTxPool(payload) => NetworkEvent::RequestTxPool { id, payload },
            Payload::LiteBlock(payload) => NetworkEvent::LiteBlock { id, payload },
            Payload::MissingTransactions(payload) => {
                NetworkEvent::MissingTransactions { id, payload }
            }
            Payload::Unknown(payload) => NetworkEvent::Unknown {
                id,
                command: packet.command.id(),
                payload,
            },
        };

        self.emit(event);
    }

    fn handle_handshake(
        &self,
        conn: &Connection,
        payload: HandshakePayload,
        expects_response: bool,
        response: bool,
    ) {
        let mut id = conn.id();

        match payload.check() {
            HandshakeCheck::Match => {}
            HandshakeCheck::NetworkMismatch => {
                warn!(peer = %id, network = %payload.network_id, "Peer is on another network")
            }
            HandshakeCheck::VersionMismatch => {
                warn!(peer = %id, version = payload.version, "Peer speaks another protocol version")
            }
        }

        let asserted = payload.peer_id.clone();
        if !asserted.is_empty() && asserted != id {
            match self.rekey(&id, &asserted) {
                Rekey::Renamed => {
                    debug!(old = %id, new = %asserted, "Connection rekeyed");
                    id = asserted.clone();
                }
                Rekey::Taken => {
                    let message = format!(
                        "Peer {} claimed id {} which is already connected",
                        id, asserted
                    );
                    warn!("{}", message);
                    self.emit(NetworkEvent::Warn(message));
                }
                Rekey::Untracked => debug!(peer = %id, "Handshake on untracked connection"),
            }
        }

        {
            let mut local_id = self.local_id.write();
            if *local_id == asserted {
                let fresh = generate_peer_id();
                warn!(old = %local_id, new = %fresh, "Peer shares our id, regenerating");
                *local_id = fresh;
            }
        }

        info!(
            peer = %id,
            version = payload.version,
            my_port = payload.my_port,
            peers = payload.local_peerlist.len(),
            "Handshake received"
        );

        self.emit(NetworkEvent::Handshake {
            id: id.clone(),
            payload,
        });

        if expects_response && !response {
            let peers = self
                .peer_source
                .read()
                .as_ref()
                .map(|source| source.peer_list(HANDSHAKE_PEERLIST_LIMIT))
                .unwrap_or_default();
            let reply = HandshakePayload::new(self.local_id.read().clone(), self.advertised_port())
                .with_peerlist(peers);
            self.reply(conn, Command::Handshake, Payload::Handshake(reply));
        }
    }

    /// Fire-and-forget reply to one connection.
    fn reply(&self, conn: &Connection, command: Command, payload: Payload) {
        let conn = conn.clone();
        let packet = Packet::reply(command, payload);

        tokio::spawn(async move {
            if let Err(e) = conn.send(&packet).await {
                debug!(peer = %conn.id(), command = %packet.command, error = %e, "Reply failed");
            }
        });
    }
}

async fn dispatch_loop(
    inner: Arc<ControllerInner>,
    mut conn_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
    mut acceptor_rx: mpsc::UnboundedReceiver<AcceptorEvent>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;

            Some(event) = acceptor_rx.recv() => inner.handle_acceptor_event(event),

            Some(event) = conn_rx.recv() => inner.handle_connection_event(event),

            _ = cancel.cancelled() => break,
        }
    }

    while let Ok(event) = acceptor_rx.try_recv() {
        inner.handle_acceptor_event(event);
    }
    while let Ok(event) = conn_rx.try_recv() {
        inner.handle_connection_event(event);
    }

    debug!("Dispatch stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Decoded;
    use crate::connection::Direction;
    use crate::message::NewTransactionsPayload;
    use crate::{NETWORK_ID, P2P_VERSION};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn local_config() -> ControllerConfig {
        ControllerConfig {
            bind_ip: "127.0.0.1".to_string(),
            bind_port: 0,
            ..Default::default()
        }
    }

    fn codec() -> Arc<dyn PacketCodec> {
        Arc::new(LevinCodec::new())
    }

    async fn next_event(rx: &mut broadcast::Receiver<NetworkEvent>) -> NetworkEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("event timeout")
            .expect("event channel closed")
    }

    /// Read one packet from a raw stream.
    async fn read_packet(stream: &mut TcpStream) -> Packet {
        let codec = LevinCodec::new();
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            if let Decoded::Packet { packet, .. } = codec.decode(&buf) {
                return packet;
            }
            let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut chunk))
                .await
                .unwrap()
                .unwrap();
            assert!(n > 0, "stream closed before a packet arrived");
            buf.extend_from_slice(&chunk[..n]);
        }
    }

    async fn write_packet(stream: &mut TcpStream, packet: &Packet) {
        let bytes = LevinCodec::new().encode(packet).unwrap();
        stream.write_all(&bytes).await.unwrap();
    }

    /// A listening controller plus a raw client connected to it.
    async fn raw_client() -> (
        ProtocolController,
        broadcast::Receiver<NetworkEvent>,
        TcpStream,
    ) {
        let controller = ProtocolController::new(local_config());
        let mut events = controller.subscribe();
        let addr = controller.listen().await.unwrap();
        assert!(matches!(next_event(&mut events).await, NetworkEvent::Listening(_)));

        let client = TcpStream::connect(addr).await.unwrap();
        (controller, events, client)
    }

    struct FixedPeers(Vec<PeerEntry>);

    impl PeerListSource for FixedPeers {
        fn peer_list(&self, limit: usize) -> Vec<PeerEntry> {
            self.0.iter().take(limit).cloned().collect()
        }
    }

    #[test]
    fn test_event_names() {
        assert_eq!(NetworkEvent::Close.name(), "close");
        assert_eq!(
            NetworkEvent::ChangeId {
                old_id: "a".into(),
                new_id: "b".into()
            }
            .name(),
            "change_id"
        );
        assert_eq!(
            NetworkEvent::TimedSync {
                id: "a".into(),
                payload: TimedSyncPayload::default()
            }
            .name(),
            "timed_sync"
        );
    }

    #[tokio::test]
    async fn test_listen_once() {
        let controller = ProtocolController::new(local_config());
        let addr = controller.listen().await.unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(controller.local_addr(), Some(addr));

        assert!(matches!(
            controller.listen().await,
            Err(NetworkError::AlreadyStarted)
        ));
        controller.shutdown().await;
    }

    #[tokio::test]
    async fn test_broadcast_reports_partial_failure() {
        let controller = ProtocolController::new(local_config());

        let mut remotes = Vec::new();
        for _ in 0..3 {
            let (local, remote) = tokio::io::duplex(64 * 1024);
            controller.register_outgoing(Connection::new(local, None, Direction::Outbound, codec()));
            remotes.push(remote);
        }
        // One peer goes away
        remotes.pop();

        let payload = Payload::NewTransactions(NewTransactionsPayload {
            txs: vec!["ab".to_string()],
        });
        let ok = controller
            .send(Command::NewTransactions, payload.clone(), false, None)
            .await
            .unwrap();
        assert!(!ok);

        // The healthy peers still got the packet
        let expected = LevinCodec::new()
            .encode(&Packet::new(Command::NewTransactions, payload, false))
            .unwrap();
        for remote in remotes.iter_mut() {
            let mut buf = vec![0u8; expected.len()];
            remote.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf[..], &expected[..]);
        }
    }

    #[tokio::test]
    async fn test_send_unknown_target() {
        let controller = ProtocolController::new(local_config());
        let result = controller
            .send(
                Command::Ping,
                Payload::Ping(PingPayload::ok("x")),
                false,
                Some("0000000000000001"),
            )
            .await;
        assert!(matches!(result, Err(NetworkError::PeerNotFound(_))));
    }

    #[tokio::test]
    async fn test_broadcast_without_peers() {
        let controller = ProtocolController::new(local_config());
        let ok = controller
            .send(Command::Ping, Payload::Ping(PingPayload::ok("x")), false, None)
            .await
            .unwrap();
        assert!(ok);
    }

    #[tokio::test]
    async fn test_ping_answered() {
        let (controller, _events, mut client) = raw_client().await;

        let ping = Packet::new(Command::Ping, Payload::Ping(PingPayload::default()), true);
        write_packet(&mut client, &ping).await;

        let reply = read_packet(&mut client).await;
        assert_eq!(reply.command, Command::Ping);
        assert!(reply.response);
        match reply.payload {
            Payload::Ping(p) => {
                assert_eq!(p.status, "OK");
                assert_eq!(p.peer_id, controller.local_id());
            }
            other => panic!("Unexpected payload: {:?}", other),
        }

        controller.shutdown().await;
    }

    #[tokio::test]
    async fn test_handshake_rekeys_and_replies() {
        let (controller, mut events, mut client) = raw_client().await;
        controller.set_peer_source(Arc::new(FixedPeers(vec![PeerEntry::new(
            "10.0.0.9",
            11897,
            "00000000000000c1",
        )])));

        let handshake = HandshakePayload::new("00000000000000aa", 11897);
        write_packet(
            &mut client,
            &Packet::new(Command::Handshake, Payload::Handshake(handshake), true),
        )
        .await;

        match next_event(&mut events).await {
            NetworkEvent::ChangeId { new_id, .. } => assert_eq!(new_id, "00000000000000aa"),
            other => panic!("Unexpected event: {:?}", other),
        }
        match next_event(&mut events).await {
            NetworkEvent::Handshake { id, payload } => {
                assert_eq!(id, "00000000000000aa");
                assert_eq!(payload.my_port, 11897);
            }
            other => panic!("Unexpected event: {:?}", other),
        }
        assert!(controller.is_connected("00000000000000aa"));
        assert_eq!(controller.incoming_ids(), vec!["00000000000000aa".to_string()]);

        let reply = read_packet(&mut client).await;
        assert!(reply.response);
        match reply.payload {
            Payload::Handshake(p) => {
                assert_eq!(p.network_id, NETWORK_ID);
                assert_eq!(p.version, P2P_VERSION);
                assert_eq!(p.peer_id, controller.local_id());
                assert_eq!(p.my_port, controller.local_addr().unwrap().port());
                assert_eq!(p.local_peerlist.len(), 1);
            }
            other => panic!("Unexpected payload: {:?}", other),
        }

        controller.shutdown().await;
    }

    #[tokio::test]
    async fn test_handshake_then_close_emits_disconnect() {
        let (controller, mut events, mut client) = raw_client().await;

        let handshake = HandshakePayload::new("00000000000000aa", 11897);
        write_packet(
            &mut client,
            &Packet::new(Command::Handshake, Payload::Handshake(handshake), false),
        )
        .await;
        drop(client);

        loop {
            match next_event(&mut events).await {
                NetworkEvent::Disconnect { id, .. } => {
                    assert_eq!(id, "00000000000000aa");
                    break;
                }
                NetworkEvent::ChangeId { .. } | NetworkEvent::Handshake { .. } => {}
                other => panic!("Unexpected event: {:?}", other),
            }
        }
        assert_eq!(controller.connection_count(), 0);
        assert!(!controller.is_connected("00000000000000aa"));

        controller.shutdown().await;
    }

    #[tokio::test]
    async fn test_ping_in_same_write_as_handshake() {
        let (controller, _events, mut client) = raw_client().await;

        let codec = LevinCodec::new();
        let handshake = HandshakePayload::new("00000000000000bb", 11897);
        let mut bytes = codec
            .encode(&Packet::new(Command::Handshake, Payload::Handshake(handshake), false))
            .unwrap()
            .to_vec();
        bytes.extend_from_slice(
            &codec
                .encode(&Packet::new(Command::Ping, Payload::Ping(PingPayload::default()), true))
                .unwrap(),
        );
        client.write_all(&bytes).await.unwrap();

        let reply = read_packet(&mut client).await;
        assert_eq!(reply.command, Command::Ping);
        assert!(reply.response);
        match reply.payload {
            Payload::Ping(p) => assert_eq!(p.status, "OK"),
            other => panic!("Unexpected payload: {:?}", other),
        }
        assert!(controller.is_connected("00000000000000bb"));

        controller.shutdown().await;
    }

    #[tokio::test]
    async fn test_untracked_handshake_announces_no_rename() {
        let controller = ProtocolController::new(local_config());
        let mut events = controller.subscribe();
        let (local, _remote) = tokio::io::duplex(1024);
        let conn = Connection::new(local, None, Direction::Inbound, codec());
        let old_id = conn.id();

        controller.inner.handle_handshake(
            &conn,
            HandshakePayload::new("00000000000000bb", 11897),
            false,
            false,
        );

        match events.try_recv() {
            Ok(NetworkEvent::Handshake { id, .. }) => assert_eq!(id, old_id),
            other => panic!("Unexpected event: {:?}", other),
        }
        assert!(events.try_recv().is_err());
        assert_eq!(conn.id(), old_id);
    }

    #[tokio::test]
    async fn test_taken_id_warns_without_rename() {
        let controller = ProtocolController::new(local_config());
        let mut events = controller.subscribe();

        let (a, _remote_a) = tokio::io::duplex(1024);
        let (b, _remote_b) = tokio::io::duplex(1024);
        let first = Connection::new(a, None, Direction::Outbound, codec());
        let second = Connection::new(b, None, Direction::Outbound, codec());
        controller.register_outgoing(first.clone());
        controller.register_outgoing(second.clone());

        controller.inner.handle_handshake(
            &second,
            HandshakePayload::new(first.id(), 11897),
            false,
            false,
        );

        assert!(matches!(events.try_recv(), Ok(NetworkEvent::Warn(_))));
        assert!(matches!(events.try_recv(), Ok(NetworkEvent::Handshake { .. })));
        assert!(events.try_recv().is_err());
        assert!(controller.is_connected(&second.id()));
        assert_eq!(controller.outgoing_count(), 2);
    }

    #[tokio::test]
    async fn test_handshake_claiming_our_id() {
        let (controller, mut events, mut client) = raw_client().await;
        let ours = controller.local_id();

        let handshake = HandshakePayload::new(ours.clone(), 11897);
        write_packet(
            &mut client,
            &Packet::new(Command::Handshake, Payload::Handshake(handshake), false),
        )
        .await;

        loop {
            if let NetworkEvent::Handshake { .. } = next_event(&mut events).await {
                break;
            }
        }
        assert_ne!(controller.local_id(), ours);

        controller.shutdown().await;
    }

    #[tokio::test]
    async fn test_typed_and_unknown_events() {
        let (controller, mut events, mut client) = raw_client().await;

        let txs = Packet::new(
            Command::NewTransactions,
            Payload::NewTransactions(NewTransactionsPayload {
                txs: vec!["01".to_string()],
            }),
            false,
        );
        write_packet(&mut client, &txs).await;
        write_packet(
            &mut client,
            &Packet::new(
                Command::Unknown(4242),
                Payload::Unknown(Bytes::from_static(b"raw")),
                false,
            ),
        )
        .await;

        match next_event(&mut events).await {
            NetworkEvent::NewTransactions { payload, .. } => assert_eq!(payload.txs, vec!["01"]),
            other => panic!("Unexpected event: {:?}", other),
        }
        match next_event(&mut events).await {
            NetworkEvent::Unknown {
                command, payload, ..
            } => {
                assert_eq!(command, 4242);
                assert_eq!(&payload[..], b"raw");
            }
            other => panic!("Unexpected event: {:?}", other),
        }

        controller.shutdown().await;
    }

    #[tokio::test]
    async fn test_disconnect_removes_connection() {
        let (controller, mut events, client) = raw_client().await;

        // Wait for the acceptor to hand the connection over
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while controller.incoming_count() == 0 {
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        drop(client);
        match next_event(&mut events).await {
            NetworkEvent::Disconnect { error, .. } => assert!(error.is_none()),
            other => panic!("Unexpected event: {:?}", other),
        }
        assert_eq!(controller.connection_count(), 0);

        controller.shutdown().await;
    }

    #[tokio::test]
    async fn test_connect_and_shutdown() {
        let server = ProtocolController::new(local_config());
        let addr = server.listen().await.unwrap();

        let client = ProtocolController::new(local_config());
        let mut events = client.subscribe();
        client.listen().await.unwrap();

        let id = client
            .connect(&PeerEntry::anonymous("127.0.0.1", addr.port()))
            .await
            .unwrap();
        assert_eq!(client.outgoing_count(), 1);

        loop {
            match next_event(&mut events).await {
                NetworkEvent::Connect { id: connected, port, .. } => {
                    assert_eq!(connected, id);
                    assert_eq!(port, addr.port());
                }
                // The server answers with its own identity
                NetworkEvent::Handshake { id, payload } => {
                    assert_eq!(id, server.local_id());
                    assert_eq!(payload.peer_id, server.local_id());
                    break;
                }
                _ => {}
            }
        }
        assert!(client.is_connected(&server.local_id()));

        client.shutdown().await;
        assert_eq!(client.connection_count(), 0);
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_connect_failure_registers_nothing() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let controller = ProtocolController::new(local_config());
        let result = controller.connect(&PeerEntry::anonymous("127.0.0.1", port)).await;
        assert!(result.is_err());
        assert_eq!(controller.outgoing_count(), 0);
    }
}
