//! Read-only block stores reconstructed from stored pieces.
//!
//! Used on the provider side to serve retrievals: the piece is resolved
//! through the metadata index and the archive is opened over its window in
//! piece storage. Blocks are read from storage on demand.

use std::num::NonZeroUsize;
use std::sync::Arc;

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::{BlockstoreAccessor, BlockstoreError};
use crate::car::CarBlockstore;
use crate::piece::PieceCid;
use crate::piecestore::{PieceStore, PieceStoreError};
use crate::storage::PieceStorage;

/// Opens pieces as read-only block stores, keeping recently used ones open.
///
/// Handles are shared: every caller of `get` for a cached piece receives the
/// same store. Eviction and `done` only drop the cache's reference, so
/// handles already given out stay usable until their holders drop them.
pub struct PieceBlockstoreAccessor {
    piece_store: Arc<dyn PieceStore>,
    storage: Arc<dyn PieceStorage>,
    cache: Mutex<LruCache<PieceCid, Arc<CarBlockstore>>>,
}

impl PieceBlockstoreAccessor {
    /// Creates an accessor caching up to `max_open` stores.
    pub fn new(
        piece_store: Arc<dyn PieceStore>,
        storage: Arc<dyn PieceStorage>,
        max_open: usize,
    ) -> Self {
        let capacity = NonZeroUsize::new(max_open).unwrap_or(NonZeroUsize::MIN);
        Self {
            piece_store,
            storage,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Number of stores currently cached.
    pub fn open_count(&self) -> usize {
        self.cache.lock().len()
    }

    /// Tries each recorded location in order until one yields a valid archive.
    async fn resolve(&self, piece_cid: &PieceCid) -> Result<CarBlockstore, BlockstoreError> {
        let info = match self.piece_store.piece_info(piece_cid).await {
            Ok(info) => info,
            Err(PieceStoreError::NotFound { .. }) => {
                return Err(BlockstoreError::NotFound {
                    piece_cid: piece_cid.clone(),
                    reason: "piece is not in the metadata index".to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        };

        if info.locations.is_empty() {
            return Err(BlockstoreError::NotFound {
                piece_cid: piece_cid.clone(),
                reason: "piece has no recorded locations".to_string(),
            });
        }

        let mut failures = Vec::with_capacity(info.locations.len());
        for location in &info.locations {
            let (offset, length) = location.storage_window();
            let attempt =
                CarBlockstore::open_piece(self.storage.clone(), piece_cid.clone(), offset, length)
                    .await;

            match attempt {
                Ok(store) => {
                    debug!(
                        piece_cid = %piece_cid,
                        sector_id = %location.sector_id,
                        offset = location.offset,
                        "Resolved piece location"
                    );
                    return Ok(store);
                }
                Err(e) => {
                    warn!(
                        piece_cid = %piece_cid,
                        sector_id = %location.sector_id,
                        offset = location.offset,
                        length = location.length,
                        error = %e,
                        "Skipping unusable piece location"
                    );
                    failures.push(format!("sector {} offset {}: {e}", location.sector_id, location.offset));
                }
            }
        }

        Err(BlockstoreError::NotFound {
            piece_cid: piece_cid.clone(),
            reason: failures.join("; "),
        })
    }
}

#[async_trait]
impl BlockstoreAccessor for PieceBlockstoreAccessor {
    type Key = PieceCid;

    async fn get(&self, piece_cid: &PieceCid) -> Result<Arc<CarBlockstore>, BlockstoreError> {
        if let Some(store) = self.cache.lock().get(piece_cid) {
            return Ok(store.clone());
        }

        let store = Arc::new(self.resolve(piece_cid).await?);
        let evicted = {
            let mut cache = self.cache.lock();
            // Another task may have resolved the same piece meanwhile.
            if let Some(existing) = cache.get(piece_cid) {
                return Ok(existing.clone());
            }
            cache.push(piece_cid.clone(), store.clone())
        };

        if let Some((evicted_cid, _)) = evicted {
            debug!(piece_cid = %evicted_cid, "Evicted piece blockstore");
        }
        info!(piece_cid = %piece_cid, "Piece blockstore opened");
        Ok(store)
    }

    async fn finalize(&self, _piece_cid: &PieceCid) -> Result<(), BlockstoreError> {
        // Reconstructed stores are read-only from the start.
        Ok(())
    }

    async fn done(&self, piece_cid: &PieceCid) -> Result<(), BlockstoreError> {
        if self.cache.lock().pop(piece_cid).is_some() {
            debug!(piece_cid = %piece_cid, "Piece blockstore released");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::car::{BlockCid, CarHeader};
    use crate::car::format::encode_section;
    use crate::datastore::MemoryDatastore;
    use crate::journal::NullJournal;
    use crate::piece::{PieceLocation, SectorId};
    use crate::piecestore::DsPieceStore;
    use crate::storage::LocalPieceStorage;

    struct Fixture {
        _temp_dir: tempfile::TempDir,
        piece_store: Arc<dyn PieceStore>,
        storage: Arc<dyn PieceStorage>,
    }

    async fn fixture() -> Fixture {
        let temp_dir = tempfile::tempdir().unwrap();
        let storage: Arc<dyn PieceStorage> =
            Arc::new(LocalPieceStorage::open(temp_dir.path().join("pieces")).await.unwrap());
        let piece_store: Arc<dyn PieceStore> = Arc::new(
            DsPieceStore::new(Arc::new(MemoryDatastore::new()), Arc::new(NullJournal)).unwrap(),
        );
        Fixture {
            _temp_dir: temp_dir,
            piece_store,
            storage,
        }
    }

    fn car_bytes(blocks: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        CarHeader::new(Vec::new()).encode(&mut out).unwrap();
        for block in blocks {
            encode_section(&BlockCid::of(block), block, &mut out);
        }
        out
    }

    async fn store_piece(fixture: &Fixture, piece: &PieceCid, bytes: &[u8]) {
        fixture
            .storage
            .save(piece, &mut &bytes[..], bytes.len() as u64)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_get_serves_blocks_from_stored_piece() {
        let fixture = fixture().await;
        let piece = PieceCid::new("QmServe").unwrap();
        let archive = car_bytes(&[b"block one", b"block two"]);
        store_piece(&fixture, &piece, &archive).await;
        fixture
            .piece_store
            .add_piece_block_locations(
                &piece,
                &[PieceLocation::new(SectorId::new(3), 0, archive.len() as u64)],
            )
            .await
            .unwrap();

        let accessor = PieceBlockstoreAccessor::new(fixture.piece_store.clone(), fixture.storage.clone(), 2);
        let store = accessor.get(&piece).await.unwrap();

        let cid = BlockCid::of(b"block two");
        assert_eq!(store.get(&cid).await.unwrap().unwrap().as_ref(), b"block two");
        assert!(store.is_finalized().await.unwrap());
        assert!(Arc::ptr_eq(&store, &accessor.get(&piece).await.unwrap()));

        accessor.finalize(&piece).await.unwrap();
        accessor.done(&piece).await.unwrap();
        assert_eq!(accessor.open_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_piece_explains_absence() {
        let fixture = fixture().await;
        let accessor = PieceBlockstoreAccessor::new(fixture.piece_store.clone(), fixture.storage.clone(), 2);

        let result = accessor.get(&PieceCid::new("QmNowhere").unwrap()).await;
        assert!(matches!(result, Err(BlockstoreError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_bad_location_skipped_for_next() {
        let fixture = fixture().await;
        let piece = PieceCid::new("QmFallback").unwrap();
        let archive = car_bytes(&[b"payload"]);
        store_piece(&fixture, &piece, &archive).await;

        let length = archive.len() as u64;
        let locations = [
            // Longer than the stored piece
            PieceLocation::new(SectorId::new(1), 0, length + 1),
            PieceLocation::new(SectorId::new(2), 4096, length),
        ];
        fixture
            .piece_store
            .add_piece_block_locations(&piece, &locations)
            .await
            .unwrap();

        let accessor = PieceBlockstoreAccessor::new(fixture.piece_store.clone(), fixture.storage.clone(), 2);
        let store = accessor.get(&piece).await.unwrap();
        assert!(store.has(&BlockCid::of(b"payload")).await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_bytes_reported_not_found() {
        let fixture = fixture().await;
        let piece = PieceCid::new("QmCollected").unwrap();
        fixture
            .piece_store
            .add_piece_block_locations(&piece, &[PieceLocation::new(SectorId::new(9), 0, 128)])
            .await
            .unwrap();

        let accessor = PieceBlockstoreAccessor::new(fixture.piece_store.clone(), fixture.storage.clone(), 2);
        match accessor.get(&piece).await {
            Err(BlockstoreError::NotFound { reason, .. }) => assert!(reason.contains("sector 9")),
            other => panic!("expected NotFound, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_sector_offset_does_not_shift_read() {
        let fixture = fixture().await;
        let piece = PieceCid::new("QmOffset").unwrap();
        let archive = car_bytes(&[b"sealed at 4096"]);
        store_piece(&fixture, &piece, &archive).await;
        fixture
            .piece_store
            .add_piece_block_locations(
                &piece,
                &[PieceLocation::new(SectorId::new(7), 4096, archive.len() as u64)],
            )
            .await
            .unwrap();

        let accessor = PieceBlockstoreAccessor::new(fixture.piece_store.clone(), fixture.storage.clone(), 2);
        let store = accessor.get(&piece).await.unwrap();
        let data = store.get(&BlockCid::of(b"sealed at 4096")).await.unwrap().unwrap();
        assert_eq!(data.as_ref(), b"sealed at 4096");
    }

    async fn record_pieces(fixture: &Fixture, names: &[&str]) -> Vec<PieceCid> {
        let mut pieces = Vec::new();
        for name in names {
            let piece = PieceCid::new(*name).unwrap();
            let archive = car_bytes(&[name.as_bytes()]);
            store_piece(fixture, &piece, &archive).await;
            fixture
                .piece_store
                .add_piece_block_locations(
                    &piece,
                    &[PieceLocation::new(SectorId::new(1), 0, archive.len() as u64)],
                )
                .await
                .unwrap();
            pieces.push(piece);
        }
        pieces
    }

    #[tokio::test]
    async fn test_cache_evicts_least_recent() {
        let fixture = fixture().await;
        let pieces = record_pieces(&fixture, &["QmOne", "QmTwo", "QmThree"]).await;

        let accessor = PieceBlockstoreAccessor::new(fixture.piece_store.clone(), fixture.storage.clone(), 2);
        let first = accessor.get(&pieces[0]).await.unwrap();
        accessor.get(&pieces[1]).await.unwrap();
        accessor.get(&pieces[2]).await.unwrap();
        assert_eq!(accessor.open_count(), 2);

        // An evicted handle keeps serving its holder
        let data = first.get(&BlockCid::of(b"QmOne")).await.unwrap().unwrap();
        assert_eq!(data.as_ref(), b"QmOne");

        let reopened = accessor.get(&pieces[0]).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &reopened));
    }

    #[tokio::test]
    async fn test_done_keeps_other_readers_working() {
        let fixture = fixture().await;
        let pieces = record_pieces(&fixture, &["QmA", "QmB"]).await;
        let accessor = PieceBlockstoreAccessor::new(fixture.piece_store.clone(), fixture.storage.clone(), 1);

        let reader1 = accessor.get(&pieces[0]).await.unwrap();
        let reader2 = accessor.get(&pieces[0]).await.unwrap();
        assert!(Arc::ptr_eq(&reader1, &reader2));

        accessor.done(&pieces[0]).await.unwrap();
        drop(reader2);
        let data = reader1.get(&BlockCid::of(b"QmA")).await.unwrap().unwrap();
        assert_eq!(data.as_ref(), b"QmA");

        let in_flight = accessor.get(&pieces[0]).await.unwrap();
        accessor.get(&pieces[1]).await.unwrap();
        assert_eq!(accessor.open_count(), 1);
        assert!(in_flight.has(&BlockCid::of(b"QmA")).await.unwrap());
        assert!(in_flight.get(&BlockCid::of(b"QmA")).await.unwrap().is_some());
    }
}
