//! Peer identity and addressing.

use crate::{NetworkError, NetworkResult};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Generate a random peer identity.
///
/// 16 lowercase hex characters from a non-zero `u64`.
pub fn generate_peer_id() -> String {
    let mut rng = rand::thread_rng();
    loop {
        let id: u64 = rng.gen();
        if id != 0 {
            return format!("{:016x}", id);
        }
    }
}

/// A known peer on the overlay.
///
/// `id` is the identity; `ip` and `port` are only reachability hints, so two
/// entries are the same peer whenever their ids match.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerEntry {
    /// IP address (v4 or v6 literal) or host name.
    pub ip: String,
    /// P2P port.
    pub port: u16,
    /// Peer identity, empty if unknown.
    #[serde(default)]
    pub id: String,
}

impl PeerEntry {
    /// Create a new peer entry.
    pub fn new(ip: impl Into<String>, port: u16, id: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            port,
            id: id.into(),
        }
    }

    /// Create an entry for an address whose identity is not yet known.
    pub fn anonymous(ip: impl Into<String>, port: u16) -> Self {
        Self::new(ip, port, String::new())
    }

    /// Whether the peer carries an identity.
    pub fn has_id(&self) -> bool {
        !self.id.is_empty()
    }

    /// `ip:port`, bracketing IPv6 literals.
    pub fn address(&self) -> String {
        if self.ip.contains(':') {
            format!("[{}]:{}", self.ip, self.port)
        } else {
            format!("{}:{}", self.ip, self.port)
        }
    }
}

impl PartialEq for PeerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for PeerEntry {}

impl fmt::Display for PeerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.id, self.ip, self.port)
    }
}

impl FromStr for PeerEntry {
    type Err = NetworkError;

    /// Parse the `id@ip:port` text form.
    fn from_str(s: &str) -> NetworkResult<Self> {
        let (id, addr) = s
            .split_once('@')
            .ok_or_else(|| NetworkError::InvalidMessage(format!("Missing '@' in peer: {}", s)))?;
        let (ip, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| NetworkError::InvalidMessage(format!("Missing port in peer: {}", s)))?;
        let ip = ip.trim_start_matches('[').trim_end_matches(']');
        if ip.is_empty() {
            return Err(NetworkError::InvalidMessage(format!("Empty ip in peer: {}", s)));
        }
        let port = port
            .parse::<u16>()
            .map_err(|e| NetworkError::InvalidMessage(format!("Bad port in peer {}: {}", s, e)))?;

        Ok(Self::new(ip, port, id.to_ascii_lowercase()))
    }
}
