//! Handshake construction and inspection.
//!
//! An outbound connection opens with a handshake carrying:
//! - Network identifier (fixed per deployment)
//! - P2P protocol version
//! - Local wall-clock time (seconds since epoch)
//! - Advertised port (external port override, else the bound port)
//! - Local peer identity
//! - Optional peer list, used when answering an inbound handshake
//!
//! The controller does not reject peers on a network or version mismatch;
//! [`HandshakePayload::check`] only classifies the remote so the mismatch can
//! be logged and the consumer can decide.

use crate::message::{CoreSyncData, HandshakePayload, PingPayload, TimedSyncPayload};
use crate::peer::PeerEntry;
use crate::{NETWORK_ID, P2P_VERSION};
use std::time::{SystemTime, UNIX_EPOCH};

/// Status string carried by ping replies.
pub const PING_OK_STATUS: &str = "OK";

/// Current wall-clock time in seconds since epoch.
pub fn unix_time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// How a remote handshake compares with ours.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeCheck {
    /// Same network and version.
    Match,
    /// The peer belongs to another network.
    NetworkMismatch,
    /// Same network, different protocol version.
    VersionMismatch,
}

impl HandshakePayload {
    /// Create our handshake.
    pub fn new(peer_id: impl Into<String>, my_port: u16) -> Self {
        Self {
            network_id: NETWORK_ID.to_string(),
            version: P2P_VERSION,
            local_time: unix_time(),
            my_port,
            peer_id: peer_id.into(),
            payload_data: CoreSyncData::default(),
            local_peerlist: Vec::new(),
        }
    }

    /// Attach a peer list.
    pub fn with_peerlist(mut self, peers: Vec<PeerEntry>) -> Self {
        self.local_peerlist = peers;
        self
    }

    /// Attach chain state.
    pub fn with_sync_data(mut self, data: CoreSyncData) -> Self {
        self.payload_data = data;
        self
    }

    /// Compare a remote handshake with our constants.
    pub fn check(&self) -> HandshakeCheck {
        if self.network_id != NETWORK_ID {
            HandshakeCheck::NetworkMismatch
        } else if self.version != P2P_VERSION {
            HandshakeCheck::VersionMismatch
        } else {
            HandshakeCheck::Match
        }
    }
}

impl TimedSyncPayload {
    /// Create a timed sync carrying a peer list.
    pub fn new(peers: Vec<PeerEntry>) -> Self {
        Self {
            local_time: unix_time(),
            payload_data: CoreSyncData::default(),
            local_peerlist: peers,
        }
    }
}

impl PingPayload {
    /// The fixed reply to a ping.
    pub fn ok(peer_id: impl Into<String>) -> Self {
        Self {
            status: PING_OK_STATUS.to_string(),
            peer_id: peer_id.into(),
        }
    }
}
