//! Content-addressed archives (CAR) and the block stores built on them.

pub mod blockstore;
pub mod format;

pub use blockstore::{CarBlockstore, index_path};
pub use format::{ArchiveScan, BlockCid, CarHeader, SectionRef, scan_archive};

use crate::storage::StorageError;

/// Errors that occur while encoding, decoding or accessing an archive.
#[derive(Debug, thiserror::Error)]
pub enum CarError {
    #[error("Archive truncated at byte {offset}")]
    Truncated { offset: u64 },

    #[error("Malformed varint length prefix")]
    VarintOverflow,

    #[error("Archive header of {length} bytes is too large")]
    HeaderTooLarge { length: u64 },

    #[error("Block digest {actual} does not match identifier {expected}")]
    DigestMismatch { expected: BlockCid, actual: BlockCid },

    #[error("Unsupported multihash code {code:#x}")]
    UnsupportedHash { code: u64 },

    #[error("Unsupported archive version {version}")]
    UnsupportedVersion { version: u64 },

    #[error("Invalid block identifier {value:?}: {reason}")]
    InvalidCid { value: String, reason: String },

    #[error("Invalid archive header: {0}")]
    InvalidHeader(#[from] serde_json::Error),

    #[error("Blockstore is finalized and read-only")]
    Finalized,

    #[error("Blockstore is closed")]
    Closed,

    #[error("Piece storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
