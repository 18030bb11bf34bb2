//! Storage layer for raw piece bytes.
//!
//! Defines the backend-agnostic `PieceStorage` interface and the factory that
//! selects a concrete backend from configuration. Only the local filesystem
//! backend exists today; remote backends implement the same trait.

pub mod local;
pub mod reader;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_fixtures;

use std::sync::Arc;

use async_trait::async_trait;
pub use local::LocalPieceStorage;
pub use reader::PieceReader;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;

use crate::config::PieceStorageConfig;
use crate::piece::{BackendKind, PieceCid};

/// Byte-level operations over stored pieces.
///
/// Every operation may block on disk or network I/O. Handles returned by
/// `read` are owned by the caller and released when dropped.
#[async_trait]
pub trait PieceStorage: Send + Sync {
    /// Backend variant, recorded in piece locations.
    fn kind(&self) -> BackendKind;

    /// Checks whether a complete piece is stored, without opening it.
    ///
    /// # Errors
    ///
    /// - `StorageError::Io` - If the backend could not be queried
    async fn has(&self, piece_cid: &PieceCid) -> Result<bool, StorageError>;

    /// Returns the stored size of a piece in bytes.
    ///
    /// # Errors
    ///
    /// - `StorageError::NotFound` - If the piece is not stored
    /// - `StorageError::Io` - If the backend could not be queried
    async fn size(&self, piece_cid: &PieceCid) -> Result<u64, StorageError>;

    /// Stores exactly `length` bytes from `reader` as the piece content.
    ///
    /// Either the whole piece becomes visible or nothing does. An existing
    /// piece with the same identifier is replaced atomically.
    ///
    /// # Errors
    ///
    /// - `StorageError::IncompleteData` - If `reader` ends before `length` bytes
    /// - `StorageError::Io` - If writing failed
    async fn save(
        &self,
        piece_cid: &PieceCid,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        length: u64,
    ) -> Result<(), StorageError> {
        self.save_with_cancel(piece_cid, reader, length, &CancellationToken::new())
            .await
    }

    /// Like `save`, but stops and rolls back when `cancel` fires.
    ///
    /// # Errors
    ///
    /// - `StorageError::Cancelled` - If the token fired before the save finished
    /// - `StorageError::IncompleteData` - If `reader` ends before `length` bytes
    /// - `StorageError::Io` - If writing failed
    async fn save_with_cancel(
        &self,
        piece_cid: &PieceCid,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        length: u64,
        cancel: &CancellationToken,
    ) -> Result<(), StorageError>;

    /// Opens a stream over `length` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// - `StorageError::NotFound` - If the piece is not stored
    /// - `StorageError::OutOfRange` - If `offset + length` exceeds the piece size
    /// - `StorageError::Io` - If the piece could not be opened
    async fn read(
        &self,
        piece_cid: &PieceCid,
        offset: u64,
        length: u64,
    ) -> Result<PieceReader, StorageError>;

    /// Removes a piece. Removing an absent piece succeeds.
    ///
    /// # Errors
    ///
    /// - `StorageError::Io` - If the piece exists but could not be removed
    async fn delete(&self, piece_cid: &PieceCid) -> Result<(), StorageError>;
}

/// Errors that occur during piece storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Piece is not stored in this backend
    #[error("Piece {piece_cid} not found")]
    NotFound { piece_cid: PieceCid },

    /// Requested window extends past the end of the piece
    #[error("Range {offset}+{length} exceeds size {size} of piece {piece_cid}")]
    OutOfRange {
        piece_cid: PieceCid,
        offset: u64,
        length: u64,
        size: u64,
    },

    /// Source stream ended before the declared length
    #[error("Incomplete data for piece {piece_cid}: expected {expected} bytes, received {received}")]
    IncompleteData {
        piece_cid: PieceCid,
        expected: u64,
        received: u64,
    },

    /// Save aborted by the caller and rolled back
    #[error("Save of piece {piece_cid} cancelled")]
    Cancelled { piece_cid: PieceCid },

    /// Backend is misconfigured or unreachable
    #[error("Piece storage misconfigured: {reason}")]
    Config { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Builds the backend selected by configuration.
///
/// # Errors
///
/// - `StorageError::Config` - If the backend root cannot be prepared
pub async fn create_piece_storage(
    config: &PieceStorageConfig,
) -> Result<Arc<dyn PieceStorage>, StorageError> {
    match config.kind {
        BackendKind::Local => {
            let storage = LocalPieceStorage::open(&config.path).await?;
            Ok(Arc::new(storage))
        }
    }
}
