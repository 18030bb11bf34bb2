//! Composition of the piece subsystems from a `MarketConfig`.

use std::sync::Arc;

use tracing::info;

use crate::blockstore::{CarBlockstoreAccessor, ImportBlockstoreAccessor, PieceBlockstoreAccessor};
use crate::config::MarketConfig;
use crate::datastore::FileDatastore;
use crate::home::HomeDir;
use crate::journal::{FsJournal, Journal};
use crate::piecestore::{DsPieceStore, PieceStore};
use crate::storage::{PieceStorage, create_piece_storage};
use crate::Result;

/// Piece store, storage backend and blockstore accessors of one node.
///
/// Built by `open` and torn down by `close`; nothing is started implicitly.
pub struct PieceServices {
    pub home: HomeDir,
    pub journal: Arc<FsJournal>,
    pub piece_store: Arc<DsPieceStore<FileDatastore>>,
    pub storage: Arc<dyn PieceStorage>,
    pub imports: ImportBlockstoreAccessor,
    pub retrievals: CarBlockstoreAccessor,
    pub pieces: PieceBlockstoreAccessor,
}

impl PieceServices {
    /// Creates the home layout and opens every subsystem.
    ///
    /// # Errors
    ///
    /// - `MarketError::Config` - If a directory cannot be created
    /// - `MarketError::Storage` - If the piece storage backend is misconfigured
    /// - `MarketError::Datastore` - If the metadata datastore cannot be opened
    /// - `MarketError::Journal` - If the journal cannot be opened
    pub async fn open(config: &MarketConfig) -> Result<Self> {
        let home = HomeDir::open(&config.home)?;
        home.data_transfer()?;

        let datastore = FileDatastore::open(home.metadata()?).await?;
        let journal = Arc::new(FsJournal::open(&config.journal_dir(), &config.journal.disabled_events).await?);

        let piece_store = Arc::new(DsPieceStore::new(
            datastore,
            journal.clone() as Arc<dyn Journal>,
        )?);
        piece_store.start().await?;

        let storage = create_piece_storage(&config.piece_storage).await?;

        let imports = ImportBlockstoreAccessor::new(home.imports()?, storage.clone())?;
        let retrievals = CarBlockstoreAccessor::new(home.retrievals()?)?;
        let pieces = PieceBlockstoreAccessor::new(
            piece_store.clone() as Arc<dyn PieceStore>,
            storage.clone(),
            config.blockstore.max_open_pieces,
        );

        info!(
            home = %home.path().display(),
            piece_storage = %config.piece_storage,
            "Piece services ready"
        );
        Ok(Self {
            home,
            journal,
            piece_store,
            storage,
            imports,
            retrievals,
            pieces,
        })
    }

    /// Stops the piece store and flushes the journal.
    ///
    /// # Errors
    ///
    /// - `MarketError::PieceStore` - If the metadata could not be synced
    /// - `MarketError::Journal` - If the journal writer failed
    pub async fn close(&self) -> Result<()> {
        self.piece_store.stop().await?;
        self.journal.close().await?;
        info!("Piece services stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::home::{DATA_TRANSFER_DIR, IMPORTS_DIR, METADATA_DIR, RETRIEVALS_DIR};

    #[tokio::test]
    async fn test_open_creates_layout() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = MarketConfig::for_testing(temp_dir.path());

        let services = PieceServices::open(&config).await.unwrap();
        for dir in [IMPORTS_DIR, RETRIEVALS_DIR, DATA_TRANSFER_DIR, METADATA_DIR, "journal"] {
            assert!(config.home.join(dir).is_dir(), "{dir} missing");
        }
        assert!(config.piece_storage.path.is_dir());
        assert!(*services.piece_store.ready().borrow());

        services.close().await.unwrap();
        assert!(!*services.piece_store.ready().borrow());
    }

    #[tokio::test]
    async fn test_open_fails_on_blocked_home() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut config = MarketConfig::for_testing(temp_dir.path());
        std::fs::write(temp_dir.path().join("file"), b"x").unwrap();
        config.home = temp_dir.path().join("file").join("home");

        let result = PieceServices::open(&config).await;
        assert!(matches!(result, Err(crate::MarketError::Config(_))));
    }
}
