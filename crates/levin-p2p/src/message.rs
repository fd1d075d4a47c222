//! Levin protocol commands and typed payloads.

use crate::peer::PeerEntry;
use crate::{NetworkError, NetworkResult};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Base of the P2P command pool.
const P2P_COMMANDS_POOL_BASE: u32 = 1000;

/// Base of the blockchain command pool.
const BC_COMMANDS_POOL_BASE: u32 = 2000;

/// Levin command identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Initial message on a new connection.
    Handshake,
    /// Periodic sync info and peer list exchange.
    TimedSync,
    /// Liveness check.
    Ping,
    /// Full block announcement.
    NewBlock,
    /// Transaction relay.
    NewTransactions,
    /// Request blocks/transactions by hash.
    RequestGetObjects,
    /// Blocks/transactions answering a request.
    ResponseGetObjects,
    /// Request a chain of block ids.
    RequestChain,
    /// Chain of block ids answering a request.
    ResponseChainEntry,
    /// Request the remote transaction pool.
    RequestTxPool,
    /// Block template announcement without full transactions.
    LiteBlock,
    /// Transactions missing to rebuild a lite block.
    MissingTransactions,
    /// Any other command id.
    Unknown(u32),
}

impl Command {
    /// All known commands.
    pub const KNOWN: [Command; 12] = [
        Command::Handshake,
        Command::TimedSync,
        Command::Ping,
        Command::NewBlock,
        Command::NewTransactions,
        Command::RequestGetObjects,
        Command::ResponseGetObjects,
        Command::RequestChain,
        Command::ResponseChainEntry,
        Command::RequestTxPool,
        Command::LiteBlock,
        Command::MissingTransactions,
    ];

    /// Numeric id on the wire.
    pub fn id(&self) -> u32 {
        match self {
            Command::Handshake => P2P_COMMANDS_POOL_BASE + 1,
            Command::TimedSync => P2P_COMMANDS_POOL_BASE + 2,
            Command::Ping => P2P_COMMANDS_POOL_BASE + 3,
            Command::NewBlock => BC_COMMANDS_POOL_BASE + 1,
            Command::NewTransactions => BC_COMMANDS_POOL_BASE + 2,
            Command::RequestGetObjects => BC_COMMANDS_POOL_BASE + 3,
            Command::ResponseGetObjects => BC_COMMANDS_POOL_BASE + 4,
            Command::RequestChain => BC_COMMANDS_POOL_BASE + 6,
            Command::ResponseChainEntry => BC_COMMANDS_POOL_BASE + 7,
            Command::RequestTxPool => BC_COMMANDS_POOL_BASE + 8,
            Command::LiteBlock => BC_COMMANDS_POOL_BASE + 9,
            Command::MissingTransactions => BC_COMMANDS_POOL_BASE + 10,
            Command::Unknown(id) => *id,
        }
    }

    /// Map a wire id to a command.
    pub fn from_id(id: u32) -> Self {
        Self::KNOWN
            .iter()
            .copied()
            .find(|c| c.id() == id)
            .unwrap_or(Command::Unknown(id))
    }

    /// Whether this is the zero id, which carries no command.
    pub fn is_noise(&self) -> bool {
        self.id() == 0
    }

    /// Event name used for this command.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Handshake => "handshake",
            Command::TimedSync => "timed_sync",
            Command::Ping => "ping",
            Command::NewBlock => "new_block",
            Command::NewTransactions => "new_transactions",
            Command::RequestGetObjects => "request_get_objects",
            Command::ResponseGetObjects => "response_get_objects",
            Command::RequestChain => "request_chain",
            Command::ResponseChainEntry => "response_chain_entry",
            Command::RequestTxPool => "request_tx_pool",
            Command::LiteBlock => "lite_block",
            Command::MissingTransactions => "missing_transactions",
            Command::Unknown(_) => "unknown",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.id())
    }
}

/// Chain state advertised during handshake and timed sync.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoreSyncData {
    /// Height of the local chain.
    pub current_height: u32,
    /// Hex hash of the local chain tip.
    pub top_id: String,
}

/// Handshake message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HandshakePayload {
    /// Network identifier, fixed per deployment.
    pub network_id: String,
    /// P2P protocol version.
    pub version: u8,
    /// Sender wall-clock time, seconds since epoch.
    pub local_time: u64,
    /// Port the sender accepts connections on.
    pub my_port: u16,
    /// Sender identity.
    pub peer_id: String,
    /// Sender chain state.
    #[serde(default)]
    pub payload_data: CoreSyncData,
    /// Peers the sender knows about.
    #[serde(default)]
    pub local_peerlist: Vec<PeerEntry>,
}

/// Timed sync message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimedSyncPayload {
    /// Sender wall-clock time, seconds since epoch.
    pub local_time: u64,
    /// Sender chain state.
    #[serde(default)]
    pub payload_data: CoreSyncData,
    /// Peers the sender knows about.
    #[serde(default)]
    pub local_peerlist: Vec<PeerEntry>,
}

/// Ping message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PingPayload {
    /// "OK" on replies.
    #[serde(default)]
    pub status: String,
    /// Sender identity.
    #[serde(default)]
    pub peer_id: String,
}

/// Serialized block plus its transactions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawBlock {
    /// Hex block blob.
    pub block: String,
    /// Hex transaction blobs.
    #[serde(default)]
    pub transactions: Vec<String>,
}

/// New block announcement.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewBlockPayload {
    pub block: RawBlock,
    pub current_blockchain_height: u32,
    pub hop: u32,
}

/// Transaction relay.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewTransactionsPayload {
    /// Hex transaction blobs.
    pub txs: Vec<String>,
}

/// Request for blocks and transactions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestGetObjectsPayload {
    /// Transaction hashes.
    #[serde(default)]
    pub txs: Vec<String>,
    /// Block hashes.
    #[serde(default)]
    pub blocks: Vec<String>,
}

/// Response with blocks and transactions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseGetObjectsPayload {
    #[serde(default)]
    pub txs: Vec<String>,
    #[serde(default)]
    pub blocks: Vec<RawBlock>,
    /// Hashes the responder did not have.
    #[serde(default)]
    pub missed_ids: Vec<String>,
    pub current_blockchain_height: u32,
}

/// Request for a chain of block ids.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestChainPayload {
    /// Sparse list of known block ids, newest first.
    pub block_ids: Vec<String>,
}

/// Chain of block ids.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseChainEntryPayload {
    pub start_height: u32,
    pub total_height: u32,
    pub block_ids: Vec<String>,
}

/// Transaction pool request; carries the hashes the sender already has.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestTxPoolPayload {
    #[serde(default)]
    pub txs: Vec<String>,
}

/// Lite block announcement.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LiteBlockPayload {
    pub current_blockchain_height: u32,
    pub hop: u32,
    /// Hex block template blob.
    pub block_template: String,
}

/// Transactions needed to complete a lite block.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MissingTransactionsPayload {
    pub current_blockchain_height: u32,
    pub block_hash: String,
    pub missing_txs: Vec<String>,
}

/// Typed packet payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Handshake(HandshakePayload),
    TimedSync(TimedSyncPayload),
    Ping(PingPayload),
    NewBlock(NewBlockPayload),
    NewTransactions(NewTransactionsPayload),
    RequestGetObjects(RequestGetObjectsPayload),
    ResponseGetObjects(ResponseGetObjectsPayload),
    RequestChain(RequestChainPayload),
    ResponseChainEntry(ResponseChainEntryPayload),
    RequestTxPool(RequestTxPoolPayload),
    LiteBlock(LiteBlockPayload),
    MissingTransactions(MissingTransactionsPayload),
    /// Body of a command this crate does not interpret.
    Unknown(Bytes),
}

impl Payload {
    /// Command this payload belongs to, `None` for uninterpreted bodies.
    pub fn command(&self) -> Option<Command> {
        let command = match self {
            Payload::Handshake(_) => Command::Handshake,
            Payload::TimedSync(_) => Command::TimedSync,
            Payload::Ping(_) => Command::Ping,
            Payload::NewBlock(_) => Command::NewBlock,
            Payload::NewTransactions(_) => Command::NewTransactions,
            Payload::RequestGetObjects(_) => Command::RequestGetObjects,
            Payload::ResponseGetObjects(_) => Command::ResponseGetObjects,
            Payload::RequestChain(_) => Command::RequestChain,
            Payload::ResponseChainEntry(_) => Command::ResponseChainEntry,
            Payload::RequestTxPool(_) => Command::RequestTxPool,
            Payload::LiteBlock(_) => Command::LiteBlock,
            Payload::MissingTransactions(_) => Command::MissingTransactions,
            Payload::Unknown(_) => return None,
        };
        Some(command)
    }

    /// Serialize the payload body.
    pub fn encode_body(&self) -> NetworkResult<Vec<u8>> {
        let body = match self {
            Payload::Handshake(p) => serde_json::to_vec(p)?,
            Payload::TimedSync(p) => serde_json::to_vec(p)?,
            Payload::Ping(p) => serde_json::to_vec(p)?,
            Payload::NewBlock(p) => serde_json::to_vec(p)?,
            Payload::NewTransactions(p) => serde_json::to_vec(p)?,
            Payload::RequestGetObjects(p) => serde_json::to_vec(p)?,
            Payload::ResponseGetObjects(p) => serde_json::to_vec(p)?,
            Payload::RequestChain(p) => serde_json::to_vec(p)?,
            Payload::ResponseChainEntry(p) => serde_json::to_vec(p)?,
            Payload::RequestTxPool(p) => serde_json::to_vec(p)?,
            Payload::LiteBlock(p) => serde_json::to_vec(p)?,
            Payload::MissingTransactions(p) => serde_json::to_vec(p)?,
            Payload::Unknown(raw) => raw.to_vec(),
        };
        Ok(body)
    }

    /// Deserialize a payload body for the given command.
    ///
    /// An empty body decodes to the command's default payload.
    pub fn decode_body(command: Command, body: &[u8]) -> NetworkResult<Self> {
        let payload = match command {
            Command::Handshake => Payload::Handshake(parse_body(body)?),
            Command::TimedSync => Payload::TimedSync(parse_body(body)?),
            Command::Ping => Payload::Ping(parse_body(body)?),
            Command::NewBlock => Payload::NewBlock(parse_body(body)?),
            Command::NewTransactions => Payload::NewTransactions(parse_body(body)?),
            Command::RequestGetObjects => Payload::RequestGetObjects(parse_body(body)?),
            Command::ResponseGetObjects => Payload::ResponseGetObjects(parse_body(body)?),
            Command::RequestChain => Payload::RequestChain(parse_body(body)?),
            Command::ResponseChainEntry => Payload::ResponseChainEntry(parse_body(body)?),
            Command::RequestTxPool => Payload::RequestTxPool(parse_body(body)?),
            Command::LiteBlock => Payload::LiteBlock(parse_body(body)?),
            Command::MissingTransactions => Payload::MissingTransactions(parse_body(body)?),
            Command::Unknown(_) => Payload::Unknown(Bytes::copy_from_slice(body)),
        };
        Ok(payload)
    }
}

fn parse_body<T: DeserializeOwned + Default>(body: &[u8]) -> NetworkResult<T> {
    if body.is_empty() {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| NetworkError::Serialization(e.to_string()))
}

/// A decoded Levin packet.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    /// Command identifier.
    pub command: Command,
    /// Sender wants a reply.
    pub expects_response: bool,
    /// Packet is itself a reply.
    pub response: bool,
    /// Levin return code, 0 on requests.
    pub return_code: i32,
    /// Typed payload.
    pub payload: Payload,
}

impl Packet {
    /// Build a request packet.
    pub fn new(command: Command, payload: Payload, expects_response: bool) -> Self {
        Self {
            command,
            expects_response,
            response: false,
            return_code: 0,
            payload,
        }
    }

    /// Build a reply packet.
    pub fn reply(command: Command, payload: Payload) -> Self {
        Self {
            command,
            expects_response: false,
            response: true,
            return_code: 1,
            payload,
        }
    }

    /// Check that the payload type matches the command.
    pub fn validate(&self) -> NetworkResult<()> {
        match self.payload.command() {
            Some(expected) if expected != self.command => Err(NetworkError::InvalidMessage(
                format!("Payload for {} sent as {}", expected, self.command),
            )),
            _ => Ok(()),
        }
    }
}
