//! Connection handling.
//!
//! A [`Connection`] wraps one byte stream. Its read half is driven by a
//! reader task that frames packets and reports them as [`ConnectionEvent`]s.
//! Events are tagged with the connection's [`key`](Connection::key), which
//! never changes; the id may be replaced at any time. The write half sits
//! behind an async mutex so any task can write.

use crate::codec::{FrameDecoder, PacketCodec};
use crate::message::Packet;
use crate::peer::{generate_peer_id, PeerEntry};
use crate::{NetworkError, NetworkResult, MAX_PACKET_SIZE};
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace};

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Maximum packet body size.
    pub max_packet_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            max_packet_size: MAX_PACKET_SIZE,
        }
    }
}

/// Which side opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Accepted by our listener.
    Inbound,
    /// Dialed by us.
    Outbound,
}

/// Events reported by a connection's reader task.
///
/// `key` is the emitting connection's [`Connection::key`]. Resolve it to
/// the current id when the event is handled, not when it is sent.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// Reader started.
    Connected { key: u64 },
    /// A packet was framed.
    Packet { key: u64, packet: Packet },
    /// Reading failed; `Closed` follows.
    Error { key: u64, error: String },
    /// Terminal event, emitted exactly once.
    Closed { key: u64, error: Option<String> },
}

static NEXT_KEY: AtomicU64 = AtomicU64::new(1);

/// Any byte stream a connection can run over.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Transport for T {}

type BoxedTransport = Box<dyn Transport>;

/// Keeps a live-connection counter raised while held.
#[derive(Debug)]
pub struct ConnectionGuard(Arc<AtomicUsize>);

impl ConnectionGuard {
    /// Increment `counter` until the guard is dropped.
    pub fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct PendingReader {
    read: ReadHalf<BoxedTransport>,
    guard: Option<ConnectionGuard>,
}

struct ConnectionInner {
    key: u64,
    id: RwLock<String>,
    direction: Direction,
    remote_addr: Option<SocketAddr>,
    codec: Arc<dyn PacketCodec>,
    writer: tokio::sync::Mutex<WriteHalf<BoxedTransport>>,
    pending: Mutex<Option<PendingReader>>,
    read_task: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
    closed: Arc<AtomicBool>,
}

/// A P2P connection.
///
/// Cloning is cheap; all clones refer to the same stream.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("key", &self.inner.key)
            .field("id", &self.id())
            .field("direction", &self.inner.direction)
            .field("remote_addr", &self.inner.remote_addr)
            .finish()
    }
}

impl Connection {
    /// Wrap a stream. The id starts as a random pseudo-identity.
    pub fn new(
        stream: impl Transport,
        remote_addr: Option<SocketAddr>,
        direction: Direction,
        codec: Arc<dyn PacketCodec>,
    ) -> Self {
        Self::with_guard(stream, remote_addr, direction, codec, None)
    }

    /// Wrap a stream, holding `guard` until the reader stops.
    pub fn with_guard(
        stream: impl Transport,
        remote_addr: Option<SocketAddr>,
        direction: Direction,
        codec: Arc<dyn PacketCodec>,
        guard: Option<ConnectionGuard>,
    ) -> Self {
        let boxed: BoxedTransport = Box::new(stream);
        let (read, write) = tokio::io::split(boxed);

        Self {
            inner: Arc::new(ConnectionInner {
                key: NEXT_KEY.fetch_add(1, Ordering::Relaxed),
                id: RwLock::new(generate_peer_id()),
                direction,
                remote_addr,
                codec,
                writer: tokio::sync::Mutex::new(write),
                pending: Mutex::new(Some(PendingReader { read, guard })),
                read_task: Mutex::new(None),
                cancel: CancellationToken::new(),
                closed: Arc::new(AtomicBool::new(false)),
            }),
        }
    }

    /// Connect to a remote peer.
    #[instrument(skip_all, fields(peer = %peer.address()))]
    pub async fn connect(
        peer: &PeerEntry,
        config: &ConnectionConfig,
        codec: Arc<dyn PacketCodec>,
    ) -> NetworkResult<Self> {
        let stream = tokio::time::timeout(
            config.connect_timeout,
            TcpStream::connect((peer.ip.as_str(), peer.port)),
        )
        .await
        .map_err(|_| NetworkError::Timeout("Connection attempt timed out".to_string()))?
        .map_err(NetworkError::Io)?;

        let _ = stream.set_nodelay(true);
        let remote_addr = stream.peer_addr().ok();

        debug!("Connected");

        Ok(Self::new(stream, remote_addr, Direction::Outbound, codec))
    }

    /// Process-unique key, fixed for the connection's lifetime.
    pub fn key(&self) -> u64 {
        self.inner.key
    }

    /// Current id.
    pub fn id(&self) -> String {
        self.inner.id.read().clone()
    }

    /// Replace the id.
    pub fn set_id(&self, id: impl Into<String>) {
        *self.inner.id.write() = id.into();
    }

    /// Which side opened the connection.
    pub fn direction(&self) -> Direction {
        self.inner.direction
    }

    /// Remote address, if the transport has one.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.remote_addr
    }

    /// Whether the connection has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Start the reader task.
    ///
    /// Emits `Connected`, then packets in arrival order, then one `Closed`.
    /// Calling this more than once has no effect.
    pub fn start(&self, events: mpsc::UnboundedSender<ConnectionEvent>) {
        let Some(PendingReader { read, guard }) = self.inner.pending.lock().take() else {
            return;
        };

        let key = self.inner.key;
        let cancel = self.inner.cancel.clone();
        let closed = self.inner.closed.clone();
        let decoder = FrameDecoder::new(self.inner.codec.clone());

        let handle = tokio::spawn(async move {
            let _guard = guard;
            let _ = events.send(ConnectionEvent::Connected { key });

            let mut framed = FramedRead::new(read, decoder);
            let error = loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => break None,

                    next = framed.next() => match next {
                        Some(Ok(packet)) => {
                            trace!(key, command = %packet.command, "Framed packet");
                            let _ = events.send(ConnectionEvent::Packet { key, packet });
                        }
                        Some(Err(e)) => {
                            let error = e.to_string();
                            let _ = events.send(ConnectionEvent::Error {
                                key,
                                error: error.clone(),
                            });
                            break Some(error);
                        }
                        None => break None,
                    }
                }
            };

            closed.store(true, Ordering::SeqCst);
            debug!(key, error = ?error, "Connection reader stopped");
            let _ = events.send(ConnectionEvent::Closed { key, error });
        });

        *self.inner.read_task.lock() = Some(handle);
    }

    /// Write raw bytes.
    pub async fn write(&self, bytes: &[u8]) -> NetworkResult<()> {
        if self.is_closed() {
            return Err(NetworkError::ConnectionClosed);
        }

        let mut writer = self.inner.writer.lock().await;
        writer.write_all(bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Encode and write a packet.
    pub async fn send(&self, packet: &Packet) -> NetworkResult<()> {
        let bytes = self.inner.codec.encode(packet)?;
        self.write(&bytes).await
    }

    /// Destroy the connection.
    ///
    /// Stops packet emission at once, lets the reader emit its `Closed`
    /// event, then shuts the write half down.
    pub async fn close(&self) {
        self.inner.cancel.cancel();
        self.inner.closed.store(true, Ordering::SeqCst);

        let handle = self.inner.read_task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        // Reader never started; release the read half now
        self.inner.pending.lock().take();

        let mut writer = self.inner.writer.lock().await;
        let _ = writer.shutdown().await;
        debug!(id = %self.id(), "Connection closed");
    }
}
