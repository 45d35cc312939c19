//! Failure taxonomy of a verified transfer.

use crate::digest::Digest;

/// Which side of the transfer a read was issued against.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Side {
    Source,
    Destination,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Source => write!(f, "source"),
            Side::Destination => write!(f, "destination"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    /// Fatal for the source. For destination read-back it only consumes a retry attempt.
    #[error("short read from {side} at offset {offset}: expected {expected} bytes, got {actual}")]
    ShortRead {
        side: Side,
        offset: u64,
        expected: u64,
        actual: u64,
    },

    #[error(
        "chunk at offset {offset} failed verification after {attempts} attempt(s): expected {expected}, last seen {}",
        .last_seen.as_ref().map_or("nothing (short read)".to_string(), Digest::to_string)
    )]
    ChunkVerificationFailed {
        offset: u64,
        attempts: u32,
        expected: Digest,
        last_seen: Option<Digest>,
    },

    #[error("whole-file verification failed: source {source_digest} != destination {destination_digest}")]
    WholeFileVerificationFailed {
        source_digest: Digest,
        destination_digest: Digest,
    },

    /// Never fatal, only reported as a warning.
    #[error("failed removing partially written destination {path:?}: {reason}")]
    DestinationCleanupFailed {
        path: std::path::PathBuf,
        reason: String,
    },

    #[error("chunk index {index} is out of range for a file of {file_size} bytes")]
    InvalidIndex { index: u64, file_size: u64 },
}
