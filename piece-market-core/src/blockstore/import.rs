//! Per-piece staging block stores for the storage client.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{BlockstoreAccessor, BlockstoreError, OpenStores};
use crate::car::CarBlockstore;
use crate::piece::PieceCid;
use crate::storage::PieceStorage;

/// Stages imported blocks in `<dir>/<piece>.car` and hands the sealed archive
/// to piece storage on finalize.
pub struct ImportBlockstoreAccessor {
    stores: OpenStores<PieceCid>,
    storage: Arc<dyn PieceStorage>,
}

impl ImportBlockstoreAccessor {
    /// # Errors
    ///
    /// - `BlockstoreError::Config` - If `dir` cannot be created
    pub fn new(
        dir: impl Into<PathBuf>,
        storage: Arc<dyn PieceStorage>,
    ) -> Result<Self, BlockstoreError> {
        let stores = OpenStores::new(dir.into())?;
        info!(dir = %stores.dir().display(), "Import blockstore accessor ready");
        Ok(Self { stores, storage })
    }

    pub fn dir(&self) -> &Path {
        self.stores.dir()
    }

    /// Staging archive path used for `piece_cid`.
    pub fn path_for(&self, piece_cid: &PieceCid) -> PathBuf {
        self.stores.path_for(piece_cid)
    }

    /// Like `finalize`, but aborts the transfer into piece storage when
    /// `cancel` fires. The staged archive stays sealed either way.
    ///
    /// # Errors
    ///
    /// - `BlockstoreError::NotOpen` - If `get` was not called for `piece_cid`
    /// - `BlockstoreError::Storage` - If saving failed or was cancelled
    pub async fn finalize_with_cancel(
        &self,
        piece_cid: &PieceCid,
        cancel: &CancellationToken,
    ) -> Result<(), BlockstoreError> {
        let store = self.stores.handle(piece_cid)?;
        store.finalize().await?;

        let path = self.path_for(piece_cid);
        let mut file = fs::File::open(&path).await?;
        let length = file.metadata().await?.len();
        self.storage
            .save_with_cancel(piece_cid, &mut file, length, cancel)
            .await?;

        info!(piece_cid = %piece_cid, bytes = length, "Imported piece saved to storage");
        Ok(())
    }
}

#[async_trait]
impl BlockstoreAccessor for ImportBlockstoreAccessor {
    type Key = PieceCid;

    async fn get(&self, piece_cid: &PieceCid) -> Result<Arc<CarBlockstore>, BlockstoreError> {
        self.stores.get_or_open(piece_cid).await
    }

    async fn finalize(&self, piece_cid: &PieceCid) -> Result<(), BlockstoreError> {
        self.finalize_with_cancel(piece_cid, &CancellationToken::new())
            .await
    }

    async fn done(&self, piece_cid: &PieceCid) -> Result<(), BlockstoreError> {
        self.stores.release(piece_cid).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{LocalPieceStorage, StorageError};

    async fn setup() -> (tempfile::TempDir, Arc<dyn PieceStorage>, ImportBlockstoreAccessor) {
        let temp_dir = tempfile::tempdir().unwrap();
        let storage: Arc<dyn PieceStorage> =
            Arc::new(LocalPieceStorage::open(temp_dir.path().join("pieces")).await.unwrap());
        let accessor =
            ImportBlockstoreAccessor::new(temp_dir.path().join("imports"), storage.clone()).unwrap();
        (temp_dir, storage, accessor)
    }

    #[tokio::test]
    async fn test_finalize_saves_archive_to_storage() {
        let (_temp_dir, storage, accessor) = setup().await;
        let piece = PieceCid::new("QmImport").unwrap();

        let staging = accessor.get(&piece).await.unwrap();
        let cid = staging.put(b"imported block").await.unwrap();
        accessor.finalize(&piece).await.unwrap();

        let staged = std::fs::read(accessor.path_for(&piece)).unwrap();
        assert_eq!(storage.size(&piece).await.unwrap(), staged.len() as u64);

        let stored = storage
            .read(&piece, 0, staged.len() as u64)
            .await
            .unwrap()
            .read_to_vec()
            .await
            .unwrap();
        let reopened = CarBlockstore::from_bytes(stored).await.unwrap();
        assert_eq!(
            reopened.get(&cid).await.unwrap().unwrap().as_ref(),
            b"imported block"
        );
    }

    #[tokio::test]
    async fn test_done_removes_staging_but_keeps_piece() {
        let (_temp_dir, storage, accessor) = setup().await;
        let piece = PieceCid::new("QmStaged").unwrap();

        accessor.get(&piece).await.unwrap().put(b"x").await.unwrap();
        accessor.finalize(&piece).await.unwrap();
        accessor.done(&piece).await.unwrap();

        assert!(!accessor.path_for(&piece).exists());
        assert!(storage.has(&piece).await.unwrap());
    }

    #[tokio::test]
    async fn test_cancelled_finalize_stores_nothing() {
        let (_temp_dir, storage, accessor) = setup().await;
        let piece = PieceCid::new("QmCancelled").unwrap();
        accessor.get(&piece).await.unwrap().put(b"x").await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = accessor.finalize_with_cancel(&piece, &cancel).await;

        assert!(matches!(
            result,
            Err(BlockstoreError::Storage(StorageError::Cancelled { .. }))
        ));
        assert!(!storage.has(&piece).await.unwrap());
    }
}
