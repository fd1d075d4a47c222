//! Overlay configuration.

use crate::connection::ConnectionConfig;
use crate::controller::ControllerConfig;
use crate::directory::DEFAULT_STATE_FILE;
use crate::discovery::{parse_seed_list, DEFAULT_SEED_NODES};
use crate::peer::PeerEntry;
use crate::{DEFAULT_PORT, MAX_PACKET_SIZE};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Overlay configuration. Every field has a default.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    /// P2P bind address.
    pub bind_ip: String,
    /// P2P bind port, 0 for any free port.
    pub bind_port: u16,
    /// Port advertised to peers when behind NAT.
    pub external_port: Option<u16>,
    /// Outbound connections the maintenance loop keeps open.
    pub target_connections: usize,
    /// Bootstrap peers, `host:port` or `id@host:port`.
    pub seed_peers: Vec<String>,
    /// Maximum inbound connections alive at once.
    pub max_incoming: Option<usize>,
    pub connect_timeout_secs: u64,
    pub maintenance_interval_secs: u64,
    pub persist_interval_secs: u64,
    /// Peer directory file.
    pub state_file: PathBuf,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            bind_ip: "0.0.0.0".to_string(),
            bind_port: DEFAULT_PORT,
            external_port: None,
            target_connections: 8,
            seed_peers: DEFAULT_SEED_NODES
                .iter()
                .map(|(ip, port)| format!("{}:{}", ip, port))
                .collect(),
            max_incoming: None,
            connect_timeout_secs: 10,
            maintenance_interval_secs: 15,
            persist_interval_secs: 10,
            state_file: PathBuf::from(DEFAULT_STATE_FILE),
        }
    }
}

impl OverlayConfig {
    /// Parsed seed peers; invalid entries are dropped.
    pub fn seeds(&self) -> Vec<PeerEntry> {
        parse_seed_list(&self.seed_peers)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs.max(1))
    }

    pub fn persist_interval(&self) -> Duration {
        Duration::from_secs(self.persist_interval_secs.max(1))
    }

    /// Controller settings derived from this configuration.
    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            bind_ip: self.bind_ip.clone(),
            bind_port: self.bind_port,
            external_port: self.external_port,
            max_incoming: self.max_incoming,
            connection: ConnectionConfig {
                connect_timeout: self.connect_timeout(),
                max_packet_size: MAX_PACKET_SIZE,
            },
        }
    }
}
