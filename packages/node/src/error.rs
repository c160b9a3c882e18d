//! Error kinds for the store facade and the replication apply boundary.

use thiserror::Error;

/// Errors surfaced through the public facade.
///
/// `Set`/`Delete` never return one of these; writes are best-effort by
/// design and replicate asynchronously.
#[derive(Debug, Error)]
pub enum StoreError {
    /// `Get` on an absent key.
    #[error("key not found: {0}")]
    KeyNotFound(String),
    /// A collection name without a matching registered type.
    #[error("type {0} has not been registered")]
    TypeNotRegistered(String),
    /// A stored value does not have the requested type.
    #[error("record in collection {collection} does not have the requested type")]
    WrongType {
        /// The collection holding the mismatched record.
        collection: String,
    },
    /// Filesystem failure. Recoverable; collections stay in memory.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// JSON (de)serialization failure.
    #[error(transparent)]
    Encoding(#[from] serde_json::Error),
    /// Operation on a node after `close()`.
    #[error("node is closed")]
    Closed,
}

/// Reasons a remote packet is dropped at the apply boundary.
///
/// These are logged at debug level and never propagated: protocol and
/// data-level mismatches end at the boundary.
#[derive(Debug, Error)]
pub enum ApplyError {
    /// The packet timestamp is older than the local last-modification clock.
    #[error("packet timestamp {packet_ns} is older than local {local_ns}")]
    OutdatedPacket {
        /// Timestamp carried by the packet.
        packet_ns: i64,
        /// Local last-modification timestamp for the key.
        local_ns: i64,
    },
    /// The target collection is not present locally.
    #[error("collection {0} is not known locally")]
    UnknownCollection(String),
    /// The record payload does not decode into the registered type.
    #[error("undecodable record payload: {0}")]
    Decode(#[from] serde_json::Error),
}
