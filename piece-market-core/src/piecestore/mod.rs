//! Piece metadata index.
//!
//! Maps a piece identifier to the deals that reference it and the locations
//! its bytes can be read from. Shared by the storage and retrieval providers.

pub mod ds;
pub mod keyed_lock;

use async_trait::async_trait;
pub use ds::{DsPieceStore, PIECE_STORE_NAMESPACE};
use futures::stream::BoxStream;
pub use keyed_lock::{KeyedGuard, KeyedLocks};

use crate::datastore::DatastoreError;
use crate::piece::{DealId, DealRecord, PieceCid, PieceInfo, PieceLocation};

/// Lazy, finite sequence of known piece identifiers.
pub type PieceStream = BoxStream<'static, Result<PieceCid, PieceStoreError>>;

/// Durable metadata about pieces.
///
/// Mutations of one piece are linearized; mutations of different pieces run
/// in parallel.
#[async_trait]
pub trait PieceStore: Send + Sync {
    /// Appends a deal to the piece, creating the entry on first use.
    ///
    /// Re-adding an identical record is a no-op.
    ///
    /// # Errors
    ///
    /// - `PieceStoreError::Datastore` - If the metadata could not be read or written
    async fn add_deal_for_piece(
        &self,
        piece_cid: &PieceCid,
        deal: DealRecord,
    ) -> Result<(), PieceStoreError>;

    /// Merges locations into the piece, skipping known (sector, offset) slots.
    ///
    /// # Errors
    ///
    /// - `PieceStoreError::Datastore` - If the metadata could not be read or written
    async fn add_piece_block_locations(
        &self,
        piece_cid: &PieceCid,
        locations: &[PieceLocation],
    ) -> Result<(), PieceStoreError>;

    /// Returns everything known about a piece.
    ///
    /// # Errors
    ///
    /// - `PieceStoreError::NotFound` - If the piece was never recorded
    /// - `PieceStoreError::Datastore` - If the metadata could not be read
    async fn piece_info(&self, piece_cid: &PieceCid) -> Result<PieceInfo, PieceStoreError>;

    /// Lists known pieces. Not restartable under concurrent mutation.
    ///
    /// # Errors
    ///
    /// - `PieceStoreError::Datastore` - If the namespace could not be listed
    async fn list_pieces(&self) -> Result<PieceStream, PieceStoreError>;

    /// Drops every record of `deal_id` from the piece, returning whether any existed.
    ///
    /// # Errors
    ///
    /// - `PieceStoreError::NotFound` - If the piece was never recorded
    /// - `PieceStoreError::Datastore` - If the metadata could not be read or written
    async fn remove_deal_for_piece(
        &self,
        piece_cid: &PieceCid,
        deal_id: DealId,
    ) -> Result<bool, PieceStoreError>;

    /// Deletes all metadata of a piece. Expunging an unknown piece succeeds.
    ///
    /// # Errors
    ///
    /// - `PieceStoreError::Datastore` - If the metadata could not be deleted
    async fn expunge_piece(&self, piece_cid: &PieceCid) -> Result<(), PieceStoreError>;
}

/// Errors that occur during metadata index operations.
#[derive(Debug, thiserror::Error)]
pub enum PieceStoreError {
    #[error("Piece {piece_cid} not found")]
    NotFound { piece_cid: PieceCid },

    #[error("Corrupt metadata for piece {piece_cid}: {source}")]
    Corrupt {
        piece_cid: PieceCid,
        source: serde_json::Error,
    },

    #[error("Unrecognized key {key} in piece namespace")]
    UnrecognizedKey { key: String },

    #[error("Encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("Datastore error: {0}")]
    Datastore(#[from] DatastoreError),
}
