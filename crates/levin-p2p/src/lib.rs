//! # levin-p2p
//!
//! Peer-to-peer overlay for CryptoNote-family nodes speaking the Levin
//! protocol.
//!
//! This crate provides:
//! - Levin packet framing over fragmented byte streams
//! - Inbound and outbound connection handling
//! - Handshake, ping and command dispatch
//! - A candidate/grey peer directory with file persistence
//! - An overlay manager that keeps a target number of outbound peers

mod acceptor;
mod codec;
mod config;
mod connection;
mod controller;
mod directory;
pub mod discovery;
mod error;
mod handshake;
mod message;
mod overlay;
mod peer;

pub use acceptor::{AcceptorEvent, ConnectionAcceptor};
pub use codec::{Decoded, FrameDecoder, LevinCodec, PacketCodec, HEADER_SIZE, LEVIN_SIGNATURE};
pub use config::OverlayConfig;
pub use connection::{
    Connection, ConnectionConfig, ConnectionEvent, ConnectionGuard, Direction, Transport,
};
pub use controller::{
    ControllerConfig, NetworkEvent, PeerListSource, ProtocolController, HANDSHAKE_PEERLIST_LIMIT,
};
pub use directory::{PeerDirectory, DEFAULT_STATE_FILE};
pub use discovery::{default_seed_peers, parse_peer_address, parse_seed_list, DEFAULT_SEED_NODES};
pub use error::{NetworkError, NetworkResult};
pub use handshake::{unix_time, HandshakeCheck, PING_OK_STATUS};
pub use message::{
    Command, CoreSyncData, HandshakePayload, LiteBlockPayload, MissingTransactionsPayload,
    NewBlockPayload, NewTransactionsPayload, Packet, Payload, PingPayload, RawBlock,
    RequestChainPayload, RequestGetObjectsPayload, RequestTxPoolPayload,
    ResponseChainEntryPayload, ResponseGetObjectsPayload, TimedSyncPayload,
};
pub use overlay::{OverlayManager, OverlayState, TickOutcome};
pub use peer::{generate_peer_id, PeerEntry};

/// Default P2P port.
pub const DEFAULT_PORT: u16 = 11897;

/// Network identifier exchanged in handshakes.
pub const NETWORK_ID: &str = "b50c4a6ccf52574165f991a4b6c143e9";

/// P2P protocol version.
pub const P2P_VERSION: u8 = 11;

/// Maximum packet body size.
pub const MAX_PACKET_SIZE: usize = 100 * 1024 * 1024; // 100 MB
