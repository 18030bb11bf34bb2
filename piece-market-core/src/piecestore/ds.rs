//! Piece metadata index persisted in a namespaced datastore.
//!
//! Each piece is one JSON-encoded `PieceInfo` stored under
//! `/storagemarket/<piece>`. Mutations are read-modify-write cycles guarded
//! by a per-piece lock; reads rely on the datastore's atomic puts.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{KeyedLocks, PieceStore, PieceStoreError, PieceStream};
use crate::datastore::{Datastore, DatastoreError, Key, Namespaced};
use crate::journal::{EventType, Journal};
use crate::piece::{DealId, DealRecord, PieceCid, PieceInfo, PieceLocation, merge_locations};

/// Datastore namespace holding piece metadata.
pub const PIECE_STORE_NAMESPACE: &str = "/storagemarket";

const JOURNAL_SYSTEM: &str = "markets/piecestore";

struct PieceStoreEvents {
    deal_added: EventType,
    deal_removed: EventType,
    locations_added: EventType,
    piece_expunged: EventType,
}

impl PieceStoreEvents {
    fn register(journal: &dyn Journal) -> Self {
        Self {
            deal_added: journal.register_event_type(JOURNAL_SYSTEM, "deal_added"),
            deal_removed: journal.register_event_type(JOURNAL_SYSTEM, "deal_removed"),
            locations_added: journal.register_event_type(JOURNAL_SYSTEM, "locations_added"),
            piece_expunged: journal.register_event_type(JOURNAL_SYSTEM, "piece_expunged"),
        }
    }
}

/// `PieceStore` backed by any `Datastore`.
pub struct DsPieceStore<D> {
    ds: Namespaced<D>,
    locks: KeyedLocks<PieceCid>,
    journal: Arc<dyn Journal>,
    events: PieceStoreEvents,
    ready: watch::Sender<bool>,
}

impl<D: Datastore> DsPieceStore<D> {
    /// Wraps `ds` in the piece store namespace.
    ///
    /// # Errors
    ///
    /// - `PieceStoreError::Datastore` - If the namespace key is invalid
    pub fn new(ds: D, journal: Arc<dyn Journal>) -> Result<Self, PieceStoreError> {
        let prefix = Key::new(PIECE_STORE_NAMESPACE)?;
        let events = PieceStoreEvents::register(journal.as_ref());
        let (ready, _) = watch::channel(false);

        Ok(Self {
            ds: Namespaced::new(ds, prefix),
            locks: KeyedLocks::new(),
            journal,
            events,
            ready,
        })
    }

    /// Marks the store ready after checking the namespace is readable.
    ///
    /// # Errors
    ///
    /// - `PieceStoreError::Datastore` - If the namespace could not be listed
    pub async fn start(&self) -> Result<(), PieceStoreError> {
        let pieces = self.ds.query_keys(&Key::root()).await?.len();
        self.ready.send_replace(true);
        info!(pieces, "piecestore ready");
        Ok(())
    }

    /// Flushes the datastore and clears the ready flag.
    ///
    /// # Errors
    ///
    /// - `PieceStoreError::Datastore` - If flushing failed
    pub async fn stop(&self) -> Result<(), PieceStoreError> {
        self.ready.send_replace(false);
        self.ds.sync().await?;
        info!("piecestore stopped");
        Ok(())
    }

    /// Readiness flag, `true` between `start` and `stop`.
    pub fn ready(&self) -> watch::Receiver<bool> {
        self.ready.subscribe()
    }

    async fn load(&self, piece_cid: &PieceCid) -> Result<Option<PieceInfo>, PieceStoreError> {
        let Some(bytes) = self.ds.get(&piece_key(piece_cid)?).await? else {
            return Ok(None);
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| PieceStoreError::Corrupt {
                piece_cid: piece_cid.clone(),
                source,
            })
    }

    /// Applies `apply` to the piece under its lock, persisting when it
    /// reports a change.
    async fn update<F>(
        &self,
        piece_cid: &PieceCid,
        create_missing: bool,
        apply: F,
    ) -> Result<bool, PieceStoreError>
    where
        F: FnOnce(&mut PieceInfo) -> bool + Send,
    {
        let key = piece_key(piece_cid)?;
        let _guard = self.locks.lock(piece_cid).await;

        let mut info = match self.load(piece_cid).await? {
            Some(info) => info,
            None if create_missing => PieceInfo::new(piece_cid.clone()),
            None => {
                return Err(PieceStoreError::NotFound {
                    piece_cid: piece_cid.clone(),
                });
            }
        };

        if !apply(&mut info) {
            return Ok(false);
        }

        self.ds.put(&key, serde_json::to_vec(&info)?).await?;
        Ok(true)
    }
}

#[async_trait]
impl<D: Datastore> PieceStore for DsPieceStore<D> {
    async fn add_deal_for_piece(
        &self,
        piece_cid: &PieceCid,
        deal: DealRecord,
    ) -> Result<(), PieceStoreError> {
        let deal_id = deal.deal_id;
        let sector_id = deal.sector_id;
        let added = self
            .update(piece_cid, true, move |info| info.add_deal(deal))
            .await?;

        if added {
            debug!(piece_cid = %piece_cid, deal_id = %deal_id, "Deal added for piece");
            self.journal.record_event(&self.events.deal_added, &|| {
                json!({
                    "piece_cid": piece_cid.as_str(),
                    "deal_id": deal_id.as_u64(),
                    "sector_id": sector_id.as_u64(),
                })
            });
        }
        Ok(())
    }

    async fn add_piece_block_locations(
        &self,
        piece_cid: &PieceCid,
        locations: &[PieceLocation],
    ) -> Result<(), PieceStoreError> {
        let mut added = 0;
        self.update(piece_cid, true, |info| {
            added = merge_locations(&mut info.locations, locations);
            added > 0
        })
        .await?;

        if added > 0 {
            debug!(piece_cid = %piece_cid, added, "Piece locations merged");
            self.journal.record_event(&self.events.locations_added, &|| {
                json!({ "piece_cid": piece_cid.as_str(), "added": added })
            });
        }
        Ok(())
    }

    async fn piece_info(&self, piece_cid: &PieceCid) -> Result<PieceInfo, PieceStoreError> {
        self.load(piece_cid)
            .await?
            .ok_or_else(|| PieceStoreError::NotFound {
                piece_cid: piece_cid.clone(),
            })
    }

    async fn list_pieces(&self) -> Result<PieceStream, PieceStoreError> {
        let keys = self.ds.query_keys(&Key::root()).await?;
        let stream = futures::stream::iter(keys).map(|key| {
            key.name()
                .and_then(|name| PieceCid::new(name).ok())
                .filter(|_| key.segments().count() == 1)
                .ok_or_else(|| {
                    warn!(key = %key, "Unrecognized key in piece namespace");
                    PieceStoreError::UnrecognizedKey {
                        key: key.to_string(),
                    }
                })
        });
        Ok(stream.boxed())
    }

    async fn remove_deal_for_piece(
        &self,
        piece_cid: &PieceCid,
        deal_id: DealId,
    ) -> Result<bool, PieceStoreError> {
        let removed = self
            .update(piece_cid, false, |info| info.remove_deal(deal_id) > 0)
            .await?;

        if removed {
            debug!(piece_cid = %piece_cid, deal_id = %deal_id, "Deal removed from piece");
            self.journal.record_event(&self.events.deal_removed, &|| {
                json!({ "piece_cid": piece_cid.as_str(), "deal_id": deal_id.as_u64() })
            });
        }
        Ok(removed)
    }

    async fn expunge_piece(&self, piece_cid: &PieceCid) -> Result<(), PieceStoreError> {
        let key = piece_key(piece_cid)?;
        let _guard = self.locks.lock(piece_cid).await;

        if self.ds.has(&key).await? {
            self.ds.delete(&key).await?;
            info!(piece_cid = %piece_cid, "Piece metadata expunged");
            self.journal.record_event(&self.events.piece_expunged, &|| {
                json!({ "piece_cid": piece_cid.as_str() })
            });
        }
        Ok(())
    }
}

fn piece_key(piece_cid: &PieceCid) -> Result<Key, DatastoreError> {
    Key::root().child(piece_cid.as_str())
}
