//! Error taxonomy for the mesh core.
//!
//! Every variant except [`MeshError::RadioInit`] is recovered where it is
//! raised: the offending packet or table entry is dropped, the event is logged
//! and counted in [`crate::metrics`], and processing continues. Nothing is
//! reported back to a packet's originator.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MeshError {
    /// A configuration parameter is out of its valid range.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Node or route table is at capacity; the new entry was not stored.
    #[error("{table} table full (capacity {capacity}), entry {id} dropped")]
    RegistryFull {
        table: &'static str,
        capacity: usize,
        id: u8,
    },

    /// Invalid cipher padding or a failed decrypt.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// No active route toward the requested destination.
    #[error("no route to node {0}")]
    NoRoute(u8),

    /// Transmit queue stayed full for the whole enqueue timeout.
    #[error("transmit queue full after {timeout_ms}ms")]
    TransportTimeout { timeout_ms: u64 },

    /// The transmit consumer has gone away (node shutting down).
    #[error("transmit queue closed")]
    QueueClosed,

    /// Frame or payload shorter than its declared layout.
    #[error("malformed packet: {0}")]
    Malformed(String),

    /// Encoded (and possibly encrypted) frame would exceed the PHY limit.
    #[error("frame of {len} bytes exceeds the {max}-byte radio limit")]
    FrameTooLarge { len: usize, max: usize },

    /// The physical radio could not be brought up. Fatal.
    #[error("radio initialisation failed: {0}")]
    RadioInit(String),

    /// A single physical send or receive failed.
    #[error("radio error: {0}")]
    Radio(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl MeshError {
    /// Only a radio that cannot start stops the node.
    pub fn is_fatal(&self) -> bool {
        matches!(self, MeshError::RadioInit(_))
    }
}

pub type MeshResult<T> = Result<T, MeshError>;
