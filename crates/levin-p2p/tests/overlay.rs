//! Overlay integration tests over loopback TCP.

use levin_p2p::{
    ControllerConfig, NetworkError, NetworkEvent, OverlayConfig, OverlayManager, OverlayState,
    PeerDirectory, PeerEntry, ProtocolController, TickOutcome,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;

fn loopback_controller() -> ProtocolController {
    ProtocolController::new(ControllerConfig {
        bind_ip: "127.0.0.1".to_string(),
        bind_port: 0,
        ..Default::default()
    })
}

fn overlay_config(tmp: &TempDir, seeds: Vec<String>, target: usize) -> OverlayConfig {
    OverlayConfig {
        bind_ip: "127.0.0.1".to_string(),
        bind_port: 0,
        target_connections: target,
        seed_peers: seeds,
        connect_timeout_secs: 2,
        maintenance_interval_secs: 3600,
        persist_interval_secs: 3600,
        state_file: tmp.path().join("tmp").join("peerstate.json"),
        ..Default::default()
    }
}

/// A loopback port with nothing listening on it.
async fn dead_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn maintain_until_ran(manager: &OverlayManager) -> TickOutcome {
    loop {
        let outcome = manager.maintain().await;
        if outcome != TickOutcome::Skipped {
            return outcome;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_start_with_one_reachable_seed() {
    let seed = loopback_controller();
    let seed_addr = seed.listen().await.unwrap();

    let tmp = TempDir::new().unwrap();
    let seeds = vec![
        format!("127.0.0.1:{}", dead_port().await),
        format!("127.0.0.1:{}", seed_addr.port()),
    ];
    let manager = OverlayManager::new(overlay_config(&tmp, seeds, 8));

    manager.start().await.unwrap();
    assert_eq!(manager.state(), OverlayState::Running);
    assert_eq!(manager.controller().outgoing_count(), 1);

    // Seeds are never demoted
    assert_eq!(manager.directory().grey_count(), 0);

    manager.shutdown().await.unwrap();
    assert_eq!(manager.state(), OverlayState::Stopped);
    assert_eq!(manager.controller().connection_count(), 0);
    assert!(tmp.path().join("tmp").join("peerstate.json").exists());

    seed.shutdown().await;
}

#[tokio::test]
async fn test_all_seeds_unreachable() {
    let tmp = TempDir::new().unwrap();
    let seeds = vec![
        format!("127.0.0.1:{}", dead_port().await),
        format!("127.0.0.1:{}", dead_port().await),
    ];
    let manager = OverlayManager::new(overlay_config(&tmp, seeds, 8));

    let err = manager.start().await.unwrap_err();
    assert!(matches!(err, NetworkError::BootstrapFailed { attempted: 2 }));
    assert_eq!(
        err.to_string(),
        "Could not connect to any seed nodes (2 attempted)"
    );
    assert_eq!(manager.state(), OverlayState::Stopped);
    assert_eq!(manager.controller().connection_count(), 0);
}

#[tokio::test]
async fn test_maintenance_reaches_target() {
    let seed = loopback_controller();
    let seed_addr = seed.listen().await.unwrap();

    // Candidates that accept TCP but never speak
    let mut listeners = Vec::new();
    let mut candidates = Vec::new();
    for i in 0..5 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        candidates.push(PeerEntry::new("127.0.0.1", port, format!("{:016x}", 0xa0 + i)));
        listeners.push(listener);
    }

    let tmp = TempDir::new().unwrap();
    let seeds = vec![format!("127.0.0.1:{}", seed_addr.port())];
    let manager = OverlayManager::new(overlay_config(&tmp, seeds, 3));
    manager.start().await.unwrap();

    assert_eq!(manager.directory().import(candidates), 5);
    maintain_until_ran(&manager).await;

    assert_eq!(manager.controller().outgoing_count(), 3);
    // Unused candidates stay in the directory
    assert_eq!(manager.directory().candidate_count(), 5);
    assert_eq!(manager.directory().grey_count(), 0);

    // Already at target
    assert_eq!(
        maintain_until_ran(&manager).await,
        TickOutcome::Ran {
            attempted: 0,
            connected: 0,
            demoted: 0
        }
    );

    manager.shutdown().await.unwrap();
    seed.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_maintenance_runs_once() {
    let seed = loopback_controller();
    let seed_addr = seed.listen().await.unwrap();

    let mut listeners = Vec::new();
    let mut candidates = Vec::new();
    for i in 0..4 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        candidates.push(PeerEntry::new("127.0.0.1", port, format!("{:016x}", 0xb0 + i)));
        listeners.push(listener);
    }

    let tmp = TempDir::new().unwrap();
    let seeds = vec![format!("127.0.0.1:{}", seed_addr.port())];
    let manager = OverlayManager::new(overlay_config(&tmp, seeds, 3));
    manager.start().await.unwrap();
    manager.directory().import(candidates);

    // The first pass holds the guard while its dial is pending
    let (first, second) = tokio::join!(manager.maintain(), manager.maintain());
    let outcomes = [first, second];

    assert_eq!(
        outcomes.iter().filter(|o| **o == TickOutcome::Skipped).count(),
        1
    );
    assert!(outcomes.contains(&TickOutcome::Ran {
        attempted: 2,
        connected: 2,
        demoted: 0
    }));
    assert_eq!(manager.controller().outgoing_count(), 3);

    maintain_until_ran(&manager).await;
    assert_eq!(manager.controller().outgoing_count(), 3);

    manager.shutdown().await.unwrap();
    seed.shutdown().await;
}

#[tokio::test]
async fn test_restart_after_bind_failure_runs_maintenance() {
    let seed = loopback_controller();
    let seed_addr = seed.listen().await.unwrap();

    let candidate = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let candidate_port = candidate.local_addr().unwrap().port();

    let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let tmp = TempDir::new().unwrap();
    let seeds = vec![format!("127.0.0.1:{}", seed_addr.port())];
    let mut config = overlay_config(&tmp, seeds, 2);
    config.bind_port = occupied.local_addr().unwrap().port();
    let manager = OverlayManager::new(config);

    assert!(manager.start().await.is_err());
    assert_eq!(manager.state(), OverlayState::Stopped);

    drop(occupied);
    manager.directory().import(vec![PeerEntry::new(
        "127.0.0.1",
        candidate_port,
        "00000000000000c7",
    )]);
    manager.start().await.unwrap();
    assert_eq!(manager.state(), OverlayState::Running);

    // Only the maintenance loop dials the candidate
    wait_until(|| manager.controller().outgoing_count() == 2).await;
    assert!(!manager.directory().is_grey("00000000000000c7"));

    manager.shutdown().await.unwrap();
    seed.shutdown().await;
}

#[tokio::test]
async fn test_maintenance_demotes_unreachable() {
    let seed = loopback_controller();
    let seed_addr = seed.listen().await.unwrap();

    let live = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let live_port = live.local_addr().unwrap().port();
    let dead = PeerEntry::new("127.0.0.1", dead_port().await, "00000000000000dd");

    let tmp = TempDir::new().unwrap();
    let seeds = vec![format!("127.0.0.1:{}", seed_addr.port())];
    let manager = OverlayManager::new(overlay_config(&tmp, seeds, 4));
    manager.start().await.unwrap();

    manager.directory().import(vec![
        PeerEntry::new("127.0.0.1", live_port, "00000000000000ee"),
        dead.clone(),
    ]);

    let outcome = maintain_until_ran(&manager).await;
    assert!(matches!(outcome, TickOutcome::Ran { .. }));

    wait_until(|| manager.directory().is_grey(&dead.id)).await;
    assert!(manager.directory().contains("00000000000000ee"));
    assert_eq!(manager.controller().outgoing_count(), 2);

    manager.shutdown().await.unwrap();
    seed.shutdown().await;
}

#[tokio::test]
async fn test_handshake_reply_feeds_directory() {
    let tmp = TempDir::new().unwrap();

    let seed = loopback_controller();
    let mut seed_events = seed.subscribe();
    let seed_addr = seed.listen().await.unwrap();

    let seeds = vec![format!("127.0.0.1:{}", seed_addr.port())];
    let manager = OverlayManager::new(overlay_config(&tmp, seeds, 1));
    let our_id = manager.controller().local_id();

    let known = PeerDirectory::new(tmp.path().join("seed.json"));
    known.import(vec![
        PeerEntry::new("10.0.0.1", 11897, "0000000000000001"),
        PeerEntry::new("10.0.0.2", 11897, "0000000000000002"),
        PeerEntry::new("10.0.0.3", 11897, "0000000000000003"),
        PeerEntry::new("127.0.0.1", 1, our_id.clone()),
    ]);
    seed.set_peer_source(Arc::new(known));

    manager.start().await.unwrap();

    // The seed learns our identity from the handshake
    let new_id = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(NetworkEvent::ChangeId { new_id, .. }) = seed_events.recv().await {
                return new_id;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(new_id, our_id);

    // We learn the seed's peers, minus ourselves
    wait_until(|| manager.directory().candidate_count() == 3).await;
    assert!(!manager.directory().contains(&our_id));
    wait_until(|| manager.controller().is_connected(&seed.local_id())).await;

    manager.shutdown().await.unwrap();
    seed.shutdown().await;
}
