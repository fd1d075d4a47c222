//! Overlay manager.
//!
//! Composes the [`ProtocolController`] with the [`PeerDirectory`]:
//! - bootstraps from seed peers
//! - tops the outbound connection count up to a target on a timer
//! - demotes candidates that cannot be reached
//! - imports peer lists carried by handshakes and timed syncs
//! - persists the directory on a timer and at shutdown

use crate::config::OverlayConfig;
use crate::controller::{NetworkEvent, ProtocolController};
use crate::directory::PeerDirectory;
use crate::peer::PeerEntry;
use crate::{NetworkError, NetworkResult};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Overlay lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlayState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Result of one maintenance pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Another pass was in progress, or the overlay is not running.
    Skipped,
    /// The pass ran to completion.
    Ran {
        attempted: usize,
        connected: usize,
        demoted: usize,
    },
}

/// Clears the busy flag when a pass ends, including on cancellation.
struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Keeps the overlay connected.
///
/// A manager owns a single-use controller. A start that failed before the
/// controller began listening can be retried; each run gets its own
/// cancellation token.
pub struct OverlayManager {
    config: OverlayConfig,
    seeds: Vec<PeerEntry>,
    controller: ProtocolController,
    directory: Arc<PeerDirectory>,
    state: RwLock<OverlayState>,
    busy: AtomicBool,
    cancel: Mutex<CancellationToken>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl OverlayManager {
    /// Create a manager from configuration.
    pub fn new(config: OverlayConfig) -> Arc<Self> {
        let controller = ProtocolController::new(config.controller_config());
        let directory = Arc::new(PeerDirectory::new(config.state_file.clone()));
        controller.set_peer_source(directory.clone());

        Arc::new(Self {
            seeds: config.seeds(),
            config,
            controller,
            directory,
            state: RwLock::new(OverlayState::Stopped),
            busy: AtomicBool::new(false),
            cancel: Mutex::new(CancellationToken::new()),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn state(&self) -> OverlayState {
        *self.state.read()
    }

    pub fn controller(&self) -> &ProtocolController {
        &self.controller
    }

    pub fn directory(&self) -> &Arc<PeerDirectory> {
        &self.directory
    }

    /// Subscribe to overlay events.
    pub fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
        self.controller.subscribe()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.controller.local_addr()
    }

    /// Listen, bootstrap from the seeds and start the background loops.
    ///
    /// Fails with [`NetworkError::BootstrapFailed`] when no seed accepts a
    /// connection; the controller is shut down in that case.
    pub async fn start(self: &Arc<Self>) -> NetworkResult<()> {
        {
            let mut state = self.state.write();
            if *state != OverlayState::Stopped {
                return Err(NetworkError::InvalidState(format!(
                    "cannot start while {:?}",
                    *state
                )));
            }
            *state = OverlayState::Starting;
        }

        let cancel = CancellationToken::new();
        *self.cancel.lock() = cancel.clone();

        match self.bootstrap(&cancel).await {
            Ok(()) => {
                *self.state.write() = OverlayState::Running;
                self.spawn_timers(&cancel);
                info!(
                    outgoing = self.controller.outgoing_count(),
                    target = self.config.target_connections,
                    "Overlay running"
                );
                Ok(())
            }
            Err(e) => {
                self.stop_tasks().await;
                *self.state.write() = OverlayState::Stopped;
                Err(e)
            }
        }
    }

    async fn bootstrap(self: &Arc<Self>, cancel: &CancellationToken) -> NetworkResult<()> {
        let events = self.controller.subscribe();
        self.controller.listen().await?;

        if let Err(e) = self.directory.try_load() {
            warn!(error = %e, "Failed to load peer directory");
            self.controller.warn(format!("Failed to load peer directory: {}", e));
        }

        let import = tokio::spawn(import_peers(
            self.controller.clone(),
            self.directory.clone(),
            events,
            cancel.clone(),
        ));
        self.tasks.lock().push(import);

        info!(seeds = self.seeds.len(), "Connecting to seed nodes");
        let results = join_all(self.seeds.iter().map(|seed| self.controller.connect(seed))).await;

        let mut connected = 0;
        for (seed, result) in self.seeds.iter().zip(results) {
            match result {
                Ok(_) => connected += 1,
                Err(e) => warn!(seed = %seed.address(), error = %e, "Seed connection failed"),
            }
        }

        if connected == 0 {
            warn!("Could not connect to any seed nodes");
            self.controller.shutdown().await;
            return Err(NetworkError::BootstrapFailed {
                attempted: self.seeds.len(),
            });
        }

        info!(connected, "Connected to seed nodes");
        Ok(())
    }

    fn spawn_timers(self: &Arc<Self>, cancel: &CancellationToken) {
        let manager = self.clone();
        let run = cancel.clone();
        let maintenance = tokio::spawn(async move {
            let mut interval = tokio::time::interval(manager.config.maintenance_interval());
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = run.cancelled() => break,
                    _ = interval.tick() => {
                        let outcome = tokio::select! {
                            _ = run.cancelled() => break,
                            outcome = manager.maintain() => outcome,
                        };
                        if let TickOutcome::Ran { attempted, connected, demoted } = outcome {
                            if attempted > 0 {
                                debug!(attempted, connected, demoted, "Maintenance pass");
                            }
                        }
                    }
                }
            }
        });

        let directory = self.directory.clone();
        let controller = self.controller.clone();
        let cancel = cancel.clone();
        let period = self.config.persist_interval();
        let persist = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // First tick completes immediately
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = directory.try_persist() {
                            warn!(error = %e, "Failed to persist peer directory");
                            controller.warn(format!("Failed to persist peer directory: {}", e));
                        }
                    }
                }
            }
        });

        self.tasks.lock().extend([maintenance, persist]);
    }

    /// Run one maintenance pass.
    ///
    /// Dials random candidates until the outbound count reaches the target
    /// or no untried candidate is left. Candidates that fail are demoted.
    pub async fn maintain(&self) -> TickOutcome {
        if self.state() != OverlayState::Running {
            return TickOutcome::Skipped;
        }
        if self.busy.swap(true, Ordering::SeqCst) {
            return TickOutcome::Skipped;
        }
        let _guard = BusyGuard(&self.busy);

        let target = self.config.target_connections;
        let mut tried = HashSet::new();
        let mut attempted = 0;
        let mut connected = 0;
        let mut demoted = 0;

        while self.controller.outgoing_count() < target {
            let mut exclude = tried.clone();
            exclude.extend(self.controller.outgoing_ids());
            exclude.extend(self.controller.incoming_ids());
            exclude.insert(self.controller.local_id());

            let Some(peer) = self.directory.pick_excluding(&exclude) else {
                break;
            };
            tried.insert(peer.id.clone());
            attempted += 1;

            match self.controller.connect(&peer).await {
                Ok(_) => connected += 1,
                Err(e) => {
                    debug!(peer = %peer, error = %e, "Candidate unreachable");
                    if self.directory.demote(&peer.id) {
                        demoted += 1;
                    }
                }
            }
        }

        TickOutcome::Ran {
            attempted,
            connected,
            demoted,
        }
    }

    /// Stop the loops, close every connection and persist the directory.
    pub async fn shutdown(&self) -> NetworkResult<()> {
        {
            let mut state = self.state.write();
            if *state != OverlayState::Running {
                return Err(NetworkError::InvalidState(format!(
                    "cannot shut down while {:?}",
                    *state
                )));
            }
            *state = OverlayState::Stopping;
        }

        info!("Overlay shutting down");
        self.stop_tasks().await;
        self.controller.shutdown().await;
        self.directory.persist();

        *self.state.write() = OverlayState::Stopped;
        Ok(())
    }

    async fn stop_tasks(&self) {
        self.cancel.lock().cancel();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        join_all(tasks).await;
    }
}

async fn import_peers(
    controller: ProtocolController,
    directory: Arc<PeerDirectory>,
    mut events: broadcast::Receiver<NetworkEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => event,
        };

        let peers = match event {
            Ok(NetworkEvent::Handshake { payload, .. }) => payload.local_peerlist,
            Ok(NetworkEvent::TimedSync { payload, .. }) => payload.local_peerlist,
            Ok(_) => continue,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Peer import fell behind");
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        let local_id = controller.local_id();
        let added = directory.import(peers.into_iter().filter(|p| p.id != local_id));
        if added > 0 {
            debug!(added, candidates = directory.candidate_count(), "Imported peers");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn isolated_config(dir: &tempfile::TempDir) -> OverlayConfig {
        OverlayConfig {
            bind_ip: "127.0.0.1".to_string(),
            bind_port: 0,
            seed_peers: Vec::new(),
            state_file: dir.path().join("peerstate.json"),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_maintain_skipped_when_stopped() {
        let dir = tempfile::TempDir::new().unwrap();
        let manager = OverlayManager::new(isolated_config(&dir));
        assert_eq!(manager.state(), OverlayState::Stopped);
        assert_eq!(manager.maintain().await, TickOutcome::Skipped);
    }

    #[tokio::test]
    async fn test_no_seeds_fails_bootstrap() {
        let dir = tempfile::TempDir::new().unwrap();
        let manager = OverlayManager::new(isolated_config(&dir));

        let err = manager.start().await.unwrap_err();
        assert!(matches!(err, NetworkError::BootstrapFailed { attempted: 0 }));
        assert_eq!(manager.state(), OverlayState::Stopped);
    }

    #[tokio::test]
    async fn test_shutdown_requires_running() {
        let dir = tempfile::TempDir::new().unwrap();
        let manager = OverlayManager::new(isolated_config(&dir));
        assert!(matches!(
            manager.shutdown().await,
            Err(NetworkError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_maintain_skipped_while_busy() {
        let dir = tempfile::TempDir::new().unwrap();
        let manager = OverlayManager::new(isolated_config(&dir));
        *manager.state.write() = OverlayState::Running;

        manager.busy.store(true, Ordering::SeqCst);
        assert_eq!(manager.maintain().await, TickOutcome::Skipped);
        assert!(manager.busy.load(Ordering::SeqCst));

        manager.busy.store(false, Ordering::SeqCst);
        assert!(matches!(
            manager.maintain().await,
            TickOutcome::Ran { attempted: 0, .. }
        ));
        assert!(!manager.busy.load(Ordering::SeqCst));
    }

    #[test]
    fn test_busy_guard_resets() {
        let flag = AtomicBool::new(true);
        {
            let _guard = BusyGuard(&flag);
        }
        assert!(!flag.load(Ordering::SeqCst));
    }
}
