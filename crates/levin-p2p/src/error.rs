//! Network error types.

use thiserror::Error;

/// Network errors.
#[derive(Error, Debug)]
pub enum NetworkError {
    /// Connection failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Connection closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Invalid message.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Message too large.
    #[error("Message too large: {size} bytes, max {max} bytes")]
    MessageTooLarge { size: usize, max: usize },

    /// Peer not found.
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    /// Timeout.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Peer directory could not be read or written.
    #[error("Peer directory error: {0}")]
    Directory(String),

    /// None of the seed peers could be reached at startup.
    #[error("Could not connect to any seed nodes ({attempted} attempted)")]
    BootstrapFailed { attempted: usize },

    /// The component was already started once.
    #[error("Already started")]
    AlreadyStarted,

    /// Operation not valid in the current lifecycle state.
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl NetworkError {
    /// Whether the error belongs to a single connection's transport.
    ///
    /// Transport errors are isolated to the connection they occurred on.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            NetworkError::ConnectionFailed(_)
                | NetworkError::ConnectionClosed
                | NetworkError::Timeout(_)
                | NetworkError::Io(_)
        )
    }
}

impl From<serde_json::Error> for NetworkError {
    fn from(e: serde_json::Error) -> Self {
        NetworkError::Serialization(e.to_string())
    }
}

/// Result type for network operations.
pub type NetworkResult<T> = Result<T, NetworkError>;
