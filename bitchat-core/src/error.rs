//! Error kinds for BitChat core, per the error-handling design.
//!
//! Propagation policy: transient errors (persistence, transport) are
//! recovered locally and never surfaced as this type. Only explicit user
//! actions (add/remove contact, block/unblock, send) produce one of these.

use thiserror::Error;

/// Result type for BitChat core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced to callers of `bitchat-core`.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed HashID, bad QR, or other caller-supplied garbage.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A QR URI didn't match the `bitchat://add/<hash>/<checksum>` shape.
    #[error("malformed QR URI")]
    MalformedUri,

    /// A QR URI's checksum didn't match its Hash ID.
    #[error("checksum mismatch")]
    ChecksumMismatch,

    /// The entity already exists; soft error, callers typically treat this
    /// as success and use the returned existing entity.
    #[error("already exists")]
    AlreadyExists,

    /// No such contact, message, or conversation.
    #[error("not found")]
    NotFound,

    /// The action targets a blocked peer and was refused.
    #[error("peer is blocked")]
    BlockedPeer,

    /// No Noise session exists yet; caller should initiate a handshake and
    /// retry (the send pipeline does this automatically).
    #[error("session unavailable")]
    SessionUnavailable,

    /// Disk, encryption, or schema error. Never surfaced for reads (empty
    /// result instead); surfaced for explicit writes so the caller can retry.
    #[error("persistence failure: {0}")]
    PersistenceFailure(String),

    /// The send queue is saturated.
    #[error("backpressure")]
    Backpressure,

    /// The send pipeline has been shut down; no further sends are accepted.
    #[error("shutting down")]
    ShuttingDown,
}
