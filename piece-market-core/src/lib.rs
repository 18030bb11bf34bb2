//! Piece Market Core - piece storage and metadata for a storage-market node
//!
//! This crate records where every deal's piece data lives, stores and reads
//! that data through a backend-agnostic interface, and exposes pieces as
//! content-addressed block stores for deal serving.

pub mod blockstore;
pub mod car;
pub mod config;
pub mod datastore;
pub mod home;
pub mod journal;
pub mod piece;
pub mod piecestore;
pub mod services;
pub mod storage;
pub mod tracing_setup;

// Re-export main types for convenient access
pub use blockstore::{BlockstoreAccessor, BlockstoreError};
pub use car::{BlockCid, CarBlockstore, CarError};
pub use config::{ConfigError, MarketConfig, PieceStorageConfig};
pub use datastore::{Datastore, DatastoreError, FileDatastore, MemoryDatastore};
pub use journal::{FsJournal, Journal, JournalError, NullJournal};
pub use piece::{DealId, DealRecord, PieceCid, PieceCidError, PieceInfo, PieceLocation, SectorId};
pub use piecestore::{DsPieceStore, PieceStore, PieceStoreError};
pub use services::PieceServices;
pub use storage::{LocalPieceStorage, PieceReader, PieceStorage, StorageError, create_piece_storage};

/// Errors that can bubble up from any piece market subsystem.
#[derive(Debug, thiserror::Error)]
pub enum MarketError {
    #[error("Invalid piece identifier: {0}")]
    PieceCid(#[from] PieceCidError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Piece store error: {0}")]
    PieceStore(#[from] PieceStoreError),

    #[error("Datastore error: {0}")]
    Datastore(#[from] DatastoreError),

    #[error("Blockstore error: {0}")]
    Blockstore(#[from] BlockstoreError),

    #[error("CAR error: {0}")]
    Car(#[from] CarError),

    #[error("Journal error: {0}")]
    Journal(#[from] JournalError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl MarketError {
    /// Returns a message suitable for an operator.
    pub fn user_message(&self) -> String {
        match self {
            MarketError::PieceCid(e) => format!("Invalid piece identifier: {e}"),
            MarketError::Storage(e) => match e {
                StorageError::NotFound { piece_cid } => {
                    format!("Piece {piece_cid} is not in piece storage")
                }
                StorageError::OutOfRange {
                    offset,
                    length,
                    size,
                    ..
                } => format!("Range {offset}+{length} is past the end of the piece ({size} bytes)"),
                StorageError::Config { reason } => format!("Piece storage misconfigured: {reason}"),
                _ => "Piece storage error occurred".to_string(),
            },
            MarketError::PieceStore(PieceStoreError::NotFound { piece_cid }) => {
                format!("Piece {piece_cid} is not known")
            }
            MarketError::PieceStore(_) | MarketError::Datastore(_) => {
                "Piece metadata error occurred".to_string()
            }
            MarketError::Blockstore(BlockstoreError::NotFound { piece_cid, reason }) => {
                format!("Piece {piece_cid} is unavailable: {reason}")
            }
            MarketError::Blockstore(_) | MarketError::Car(_) => "Blockstore error occurred".to_string(),
            MarketError::Journal(_) => "Journal error occurred".to_string(),
            MarketError::Config(e) => format!("Configuration error: {e}"),
            MarketError::Io(_) => "File system error occurred".to_string(),
        }
    }

    /// Checks if this error is due to operator input.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            MarketError::PieceCid(_)
                | MarketError::Config(_)
                | MarketError::Storage(StorageError::OutOfRange { .. })
                | MarketError::PieceStore(PieceStoreError::NotFound { .. })
        )
    }
}

pub type Result<T> = std::result::Result<T, MarketError>;
