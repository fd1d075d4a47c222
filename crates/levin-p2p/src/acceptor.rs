//! Inbound connection acceptor.

use crate::codec::PacketCodec;
use crate::connection::{Connection, ConnectionGuard, Direction};
use crate::{NetworkError, NetworkResult};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Pause after a failed accept before trying again.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Events reported by the acceptor.
#[derive(Debug)]
pub enum AcceptorEvent {
    /// Bound and accepting.
    Listening(SocketAddr),
    /// A new inbound connection, not yet started.
    Connection(Connection),
    /// Accept failed.
    Error(String),
    /// Stopped accepting.
    Closed,
}

/// Accepts inbound streams and wraps them as inbound connections.
pub struct ConnectionAcceptor {
    local_addr: SocketAddr,
    active: Arc<AtomicUsize>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionAcceptor {
    /// Bind `ip:port` and start accepting.
    ///
    /// Port 0 picks a free port; see [`local_addr`](Self::local_addr).
    pub async fn bind(
        ip: &str,
        port: u16,
        max_incoming: Option<usize>,
        codec: Arc<dyn PacketCodec>,
        events: mpsc::UnboundedSender<AcceptorEvent>,
    ) -> NetworkResult<Self> {
        let listener = TcpListener::bind((ip, port))
            .await
            .map_err(|e| NetworkError::ConnectionFailed(format!("bind {}:{}: {}", ip, port, e)))?;
        let local_addr = listener.local_addr()?;

        info!(addr = %local_addr, "Listening for peers");
        let _ = events.send(AcceptorEvent::Listening(local_addr));

        let active = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();

        let task = tokio::spawn(accept_loop(
            listener,
            max_incoming,
            codec,
            events,
            active.clone(),
            cancel.clone(),
        ));

        Ok(Self {
            local_addr,
            active,
            cancel,
            task: Mutex::new(Some(task)),
        })
    }

    /// Bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accepted connections whose reader is still alive.
    pub fn active_connection_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Stop accepting. Accepted connections stay open.
    pub async fn close(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    max_incoming: Option<usize>,
    codec: Arc<dyn PacketCodec>,
    events: mpsc::UnboundedSender<AcceptorEvent>,
    active: Arc<AtomicUsize>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            result = listener.accept() => match result {
                Ok((stream, addr)) => {
                    if let Some(max) = max_incoming {
                        if active.load(Ordering::SeqCst) >= max {
                            warn!(%addr, max, "Max incoming connections reached, rejecting");
                            drop(stream);
                            continue;
                        }
                    }

                    let _ = stream.set_nodelay(true);
                    debug!(%addr, "Accepted inbound connection");

                    let conn = Connection::with_guard(
                        stream,
                        Some(addr),
                        Direction::Inbound,
                        codec.clone(),
                        Some(ConnectionGuard::new(active.clone())),
                    );
                    let _ = events.send(AcceptorEvent::Connection(conn));
                }
                Err(e) => {
                    error!("Accept error: {}", e);
                    let _ = events.send(AcceptorEvent::Error(e.to_string()));
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                }
            }
        }
    }

    debug!("Acceptor stopped");
    let _ = events.send(AcceptorEvent::Closed);
}
