//! Session-scoped block store accessors.
//!
//! An accessor hands out one CAR-backed block store per deal or piece.
//! Callers `get` a handle, optionally `finalize` it once their transfer is
//! complete, and call `done` to release it. File-backed accessors create their
//! directory when constructed so misconfiguration surfaces at startup.

pub mod import;
pub mod piece;
pub mod retrieval;

use std::collections::HashMap;
use std::hash::Hash;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
pub use import::ImportBlockstoreAccessor;
pub use piece::PieceBlockstoreAccessor;
pub use retrieval::CarBlockstoreAccessor;
use parking_lot::Mutex;
use tracing::debug;

use crate::car::blockstore::remove_if_exists;
use crate::car::{CarBlockstore, CarError, index_path};
use crate::config::ConfigError;
use crate::home::ensure_dir;
use crate::piece::PieceCid;
use crate::piecestore::{KeyedLocks, PieceStoreError};
use crate::storage::StorageError;

/// Hands out CAR-backed block stores keyed by deal or piece.
#[async_trait]
pub trait BlockstoreAccessor: Send + Sync {
    type Key: Send + Sync;

    /// Opens, or reuses, the block store for `key`.
    ///
    /// # Errors
    ///
    /// - `BlockstoreError::NotFound` - If a read-only store has no resolvable source
    /// - `BlockstoreError::Car` - If the archive could not be opened
    async fn get(&self, key: &Self::Key) -> Result<Arc<CarBlockstore>, BlockstoreError>;

    /// Makes the store for `key` immutable and flushes its index.
    ///
    /// # Errors
    ///
    /// - `BlockstoreError::NotOpen` - If `get` was not called for `key`
    /// - `BlockstoreError::Car` - If the archive could not be flushed
    async fn finalize(&self, key: &Self::Key) -> Result<(), BlockstoreError>;

    /// Releases the store for `key`. Releasing an unknown key succeeds.
    ///
    /// # Errors
    ///
    /// - `BlockstoreError::Car` - If the archive could not be closed
    async fn done(&self, key: &Self::Key) -> Result<(), BlockstoreError>;
}

/// Errors that occur while accessing block stores.
#[derive(Debug, thiserror::Error)]
pub enum BlockstoreError {
    /// No location of the piece could be turned into a block store
    #[error("Piece {piece_cid} unavailable: {reason}")]
    NotFound { piece_cid: PieceCid, reason: String },

    #[error("No open blockstore for {key}")]
    NotOpen { key: String },

    #[error("Blockstore directory unavailable: {0}")]
    Config(#[from] ConfigError),

    #[error("CAR error: {0}")]
    Car(#[from] CarError),

    #[error("Piece storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Piece store error: {0}")]
    PieceStore(#[from] PieceStoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Open file-backed stores under one directory.
///
/// Opening and releasing a key hold that key's lock across the file I/O; the
/// map itself is only locked for lookups and inserts.
struct OpenStores<K> {
    dir: PathBuf,
    open: Mutex<HashMap<K, Arc<CarBlockstore>>>,
    locks: KeyedLocks<K>,
}

impl<K: Eq + Hash + Clone + std::fmt::Display> OpenStores<K> {
    fn new(dir: PathBuf) -> Result<Self, BlockstoreError> {
        ensure_dir(&dir)?;
        Ok(Self {
            dir,
            open: Mutex::new(HashMap::new()),
            locks: KeyedLocks::new(),
        })
    }

    fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &K) -> PathBuf {
        self.dir.join(format!("{key}.car"))
    }

    async fn get_or_open(&self, key: &K) -> Result<Arc<CarBlockstore>, BlockstoreError> {
        if let Some(store) = self.open.lock().get(key) {
            return Ok(store.clone());
        }

        let _guard = self.locks.lock(key).await;
        // Another task may have opened the store while we waited.
        if let Some(store) = self.open.lock().get(key) {
            return Ok(store.clone());
        }

        let path = self.path_for(key);
        let store = Arc::new(CarBlockstore::open_or_create(&path).await?);
        self.open.lock().insert(key.clone(), store.clone());
        debug!(key = %key, path = %path.display(), "Blockstore opened");
        Ok(store)
    }

    fn handle(&self, key: &K) -> Result<Arc<CarBlockstore>, BlockstoreError> {
        self.open
            .lock()
            .get(key)
            .cloned()
            .ok_or_else(|| BlockstoreError::NotOpen {
                key: key.to_string(),
            })
    }

    /// Closes the store for `key` and removes its archive and index.
    async fn release(&self, key: &K) -> Result<(), BlockstoreError> {
        let _guard = self.locks.lock(key).await;
        let store = self.open.lock().remove(key);
        if let Some(store) = store {
            store.close().await?;
        }

        let path = self.path_for(key);
        remove_if_exists(&path).await?;
        remove_if_exists(&index_path(&path)).await?;
        debug!(key = %key, "Blockstore released");
        Ok(())
    }

    fn open_count(&self) -> usize {
        self.open.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::piece::DealId;

    #[tokio::test]
    async fn test_opening_one_key_does_not_block_others() {
        let temp_dir = tempfile::tempdir().unwrap();
        let stores = OpenStores::<DealId>::new(temp_dir.path().join("stores")).unwrap();

        // Stands in for a slow open of deal 1
        let busy = stores.locks.lock(&DealId::new(1)).await;
        let other = tokio::time::timeout(Duration::from_secs(5), stores.get_or_open(&DealId::new(2)))
            .await
            .expect("open of another key waited on a busy key");
        assert!(other.is_ok());
        drop(busy);

        let deal3 = DealId::new(3);
        let (first, second) = tokio::join!(
            stores.get_or_open(&deal3),
            stores.get_or_open(&deal3)
        );
        assert!(Arc::ptr_eq(&first.unwrap(), &second.unwrap()));
        assert_eq!(stores.open_count(), 2);
    }
}
