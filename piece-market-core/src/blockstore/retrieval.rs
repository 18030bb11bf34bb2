//! Per-deal block stores for the retrieval client.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::{BlockstoreAccessor, BlockstoreError, OpenStores};
use crate::car::CarBlockstore;
use crate::piece::DealId;

/// Stores retrieved blocks in `<dir>/<deal>.car` while a retrieval runs.
///
/// `done` deletes the archive; callers copy out what they need first.
pub struct CarBlockstoreAccessor {
    stores: OpenStores<DealId>,
}

impl CarBlockstoreAccessor {
    /// # Errors
    ///
    /// - `BlockstoreError::Config` - If `dir` cannot be created
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, BlockstoreError> {
        let stores = OpenStores::new(dir.into())?;
        info!(dir = %stores.dir().display(), "Retrieval blockstore accessor ready");
        Ok(Self { stores })
    }

    pub fn dir(&self) -> &Path {
        self.stores.dir()
    }

    /// Archive path used for `deal_id`.
    pub fn path_for(&self, deal_id: DealId) -> PathBuf {
        self.stores.path_for(&deal_id)
    }

    /// Number of deals with an open store.
    pub fn open_count(&self) -> usize {
        self.stores.open_count()
    }
}

#[async_trait]
impl BlockstoreAccessor for CarBlockstoreAccessor {
    type Key = DealId;

    async fn get(&self, deal_id: &DealId) -> Result<Arc<CarBlockstore>, BlockstoreError> {
        self.stores.get_or_open(deal_id).await
    }

    async fn finalize(&self, deal_id: &DealId) -> Result<(), BlockstoreError> {
        let store = self.stores.handle(deal_id)?;
        store.finalize().await?;
        info!(deal_id = %deal_id, "Retrieval blockstore finalized");
        Ok(())
    }

    async fn done(&self, deal_id: &DealId) -> Result<(), BlockstoreError> {
        self.stores.release(deal_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::car::{BlockCid, CarError, index_path};

    #[tokio::test]
    async fn test_get_reuses_open_store() {
        let temp_dir = tempfile::tempdir().unwrap();
        let accessor = CarBlockstoreAccessor::new(temp_dir.path().join("retrievals")).unwrap();
        let deal = DealId::new(42);

        let first = accessor.get(&deal).await.unwrap();
        let cid = first.put(b"block").await.unwrap();
        let second = accessor.get(&deal).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert!(second.has(&cid).await.unwrap());
        assert!(accessor.path_for(deal).exists());
    }

    #[tokio::test]
    async fn test_finalize_then_done_removes_files() {
        let temp_dir = tempfile::tempdir().unwrap();
        let accessor = CarBlockstoreAccessor::new(temp_dir.path().join("retrievals")).unwrap();
        let deal = DealId::new(7);

        let store = accessor.get(&deal).await.unwrap();
        store.put(b"payload").await.unwrap();
        accessor.finalize(&deal).await.unwrap();

        let path = accessor.path_for(deal);
        assert!(index_path(&path).exists());
        assert!(matches!(store.put(b"late").await, Err(CarError::Finalized)));

        accessor.done(&deal).await.unwrap();
        accessor.done(&deal).await.unwrap();
        assert!(!path.exists());
        assert!(!index_path(&path).exists());
        assert!(matches!(store.get(&BlockCid::of(b"payload")).await, Err(CarError::Closed)));
        assert_eq!(accessor.open_count(), 0);
    }

    #[tokio::test]
    async fn test_finalize_unknown_deal_fails() {
        let temp_dir = tempfile::tempdir().unwrap();
        let accessor = CarBlockstoreAccessor::new(temp_dir.path().join("retrievals")).unwrap();

        let result = accessor.finalize(&DealId::new(1)).await;
        assert!(matches!(result, Err(BlockstoreError::NotOpen { .. })));
    }

    #[tokio::test]
    async fn test_construction_fails_fast() {
        let temp_dir = tempfile::tempdir().unwrap();
        let blocker = temp_dir.path().join("blocker");
        std::fs::write(&blocker, b"file").unwrap();

        let result = CarBlockstoreAccessor::new(blocker.join("retrievals"));
        assert!(matches!(result, Err(BlockstoreError::Config(_))));
    }
}
