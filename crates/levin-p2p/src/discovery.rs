//! Seed peers for bootstrapping.
//!
//! Seeds are the fixed list a node dials at startup before the peer
//! directory has anything to offer. Their identities are learned from the
//! handshake they send back.

use crate::peer::PeerEntry;
use crate::DEFAULT_PORT;
use std::net::SocketAddr;

/// Built-in mainnet seed nodes.
pub const DEFAULT_SEED_NODES: &[(&str, u16)] = &[
    ("206.189.142.142", 11897),
    ("145.239.88.119", 11999),
    ("142.44.242.106", 11897),
    ("165.227.252.132", 11897),
    ("148.251.178.238", 11897),
    ("45.32.138.7", 11897),
    ("46.214.70.196", 11897),
    ("94.113.119.122", 11897),
];

/// Built-in seeds as peer entries.
pub fn default_seed_peers() -> Vec<PeerEntry> {
    DEFAULT_SEED_NODES
        .iter()
        .map(|(ip, port)| PeerEntry::anonymous(*ip, *port))
        .collect()
}

/// Parse a seed address.
///
/// Accepts `host`, `host:port`, `[v6]:port` and the `id@host:port` text form.
/// A missing port falls back to `default_port`.
pub fn parse_peer_address(addr: &str, default_port: u16) -> Option<PeerEntry> {
    let addr = addr.trim();
    if addr.is_empty() {
        return None;
    }

    if addr.contains('@') {
        return addr.parse().ok();
    }

    // Try direct parse first
    if let Ok(socket_addr) = addr.parse::<SocketAddr>() {
        return Some(PeerEntry::anonymous(
            socket_addr.ip().to_string(),
            socket_addr.port(),
        ));
    }

    // Bare IPv6 literal or bare host name
    if addr.parse::<std::net::IpAddr>().is_ok() || !addr.contains(':') {
        return Some(PeerEntry::anonymous(addr, default_port));
    }

    let (host, port) = addr.rsplit_once(':')?;
    let port = port.parse::<u16>().ok()?;
    if host.is_empty() {
        return None;
    }
    Some(PeerEntry::anonymous(host, port))
}

/// Parse a list of seed addresses, skipping invalid ones.
pub fn parse_seed_list<S: AsRef<str>>(addrs: &[S]) -> Vec<PeerEntry> {
    addrs
        .iter()
        .filter_map(|a| parse_peer_address(a.as_ref(), DEFAULT_PORT))
        .collect()
}
