//! Error types for RingKV.

use crate::node::NodeId;
use std::fmt;

/// The main error type for RingKV operations.
#[derive(Debug)]
pub enum Error {
    /// A lock was poisoned (internal error)
    LockPoisoned,

    /// I/O error
    Io(std::io::Error),

    /// Serialization/deserialization error
    Serialization(String),

    /// On-disk data failed validation (bad magic, version or checksum)
    Corruption(String),

    /// Reading or writing a chunk, the tree metadata or the journal failed.
    ///
    /// A mutation that reports this error has already been rolled back.
    StorageFault(String),

    /// The store was closed and has not been reopened
    ClosedStore,

    /// Two ring members hash to the same position
    RingCollision {
        /// Occupied ring position
        hash: u128,
        /// Member already holding the position
        existing: NodeId,
    },

    /// The node is not a member of the ring
    NotInRing(NodeId),

    /// Ring metadata text could not be parsed
    MalformedMetadata(String),

    /// A wire message could not be parsed
    MalformedMessage(String),

    /// A handoff could not start or its lock handshake failed; nothing was deleted
    HandoffFailure(String),

    /// A single key could not be transferred during a handoff
    KeyTransferFailure {
        /// Key that stays on the source
        key: String,
        /// Reason reported by the transport or the peer
        reason: String,
    },

    /// A peer answered with a status other than the one the exchange requires
    UnexpectedPeerResponse {
        /// Status the exchange waited for
        expected: String,
        /// Status that arrived instead
        received: String,
    },

    /// The peer closed the exchange without acknowledging
    NoAckReceived,

    /// A peer could not be reached, dropped the connection, or the client gave up retrying
    Communication(String),

    /// Invalid operation
    InvalidOperation(String),
}

impl Error {
    /// Whether a caller may retry the failed operation unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Io(_)
                | Error::HandoffFailure(_)
                | Error::KeyTransferFailure { .. }
                | Error::NoAckReceived
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::LockPoisoned => write!(f, "Lock poisoned"),
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            Error::Corruption(msg) => write!(f, "Corrupted data: {}", msg),
            Error::StorageFault(msg) => write!(f, "Storage fault: {}", msg),
            Error::ClosedStore => write!(f, "Store is closed"),
            Error::RingCollision { hash, existing } => write!(
                f,
                "Hash collision: position {:x} is already occupied by {}",
                hash, existing
            ),
            Error::NotInRing(node) => write!(f, "{} is not a member of the ring", node),
            Error::MalformedMetadata(msg) => write!(f, "Malformed ring metadata: {}", msg),
            Error::MalformedMessage(msg) => write!(f, "Malformed message: {}", msg),
            Error::HandoffFailure(msg) => write!(f, "Handoff failed: {}", msg),
            Error::KeyTransferFailure { key, reason } => {
                write!(f, "Transfer of key '{}' failed: {}", key, reason)
            }
            Error::UnexpectedPeerResponse { expected, received } => write!(
                f,
                "Unexpected peer response: expected '{}', received '{}'",
                expected, received
            ),
            Error::NoAckReceived => write!(f, "No acknowledgement received"),
            Error::Communication(msg) => write!(f, "Communication error: {}", msg),
            Error::InvalidOperation(msg) => write!(f, "Invalid operation: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

/// A specialized `Result` type for RingKV operations.
pub type Result<T> = std::result::Result<T, Error>;
