//! CLI command implementations

use std::path::{Path, PathBuf};

use clap::Subcommand;
use futures::StreamExt;
use piece_market_core::blockstore::BlockstoreAccessor;
use piece_market_core::{
    DealId, DealRecord, MarketConfig, PieceCid, PieceLocation, PieceServices, PieceStorage,
    PieceStore, Result, SectorId,
};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{info, warn};

/// Size of the blocks an imported file is split into.
const IMPORT_BLOCK_SIZE: usize = 256 * 1024;

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Import a file as a piece and record where it lives
    Import {
        /// Piece identifier
        piece: PieceCid,
        /// File to import
        file: PathBuf,
        /// Sector the piece is sealed into
        #[arg(long)]
        sector: u64,
        /// Offset of the piece inside the sector
        #[arg(long, default_value_t = 0)]
        offset: u64,
        /// Deal that produced the piece
        #[arg(long)]
        deal: Option<u64>,
        /// Mark the deal as verified
        #[arg(long)]
        verified: bool,
    },
    /// Show deals and locations recorded for a piece
    Info {
        /// Piece identifier
        piece: PieceCid,
    },
    /// List every known piece
    List,
    /// Read a byte range of a stored piece
    Read {
        /// Piece identifier
        piece: PieceCid,
        #[arg(long, default_value_t = 0)]
        offset: u64,
        #[arg(long)]
        length: u64,
        /// Write to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Remove a piece's metadata and stored bytes
    Expunge {
        /// Piece identifier
        piece: PieceCid,
        /// Keep the bytes in piece storage
        #[arg(long)]
        keep_data: bool,
    },
}

/// Runs a command against the node described by `config`.
///
/// # Errors
///
/// Any `MarketError` raised by the command or while opening the node.
pub async fn handle_command(command: Commands, config: &MarketConfig) -> Result<()> {
    let services = PieceServices::open(config).await?;

    let result = match command {
        Commands::Import {
            piece,
            file,
            sector,
            offset,
            deal,
            verified,
        } => {
            let deal = deal.map(|id| {
                DealRecord::new(DealId::new(id), SectorId::new(sector)).with_verified(verified)
            });
            import_piece(&services, &piece, &file, SectorId::new(sector), offset, deal).await
        }
        Commands::Info { piece } => show_info(&services, &piece).await,
        Commands::List => list_pieces(&services).await,
        Commands::Read {
            piece,
            offset,
            length,
            output,
        } => read_range(&services, &piece, offset, length, output.as_deref()).await,
        Commands::Expunge { piece, keep_data } => expunge_piece(&services, &piece, keep_data).await,
    };

    let closed = services.close().await;
    settle(result, closed)
}

/// Prefers the command's own error over a failure to close the node.
fn settle(result: Result<()>, closed: Result<()>) -> Result<()> {
    if let Err(e) = closed {
        if result.is_ok() {
            return Err(e);
        }
        warn!(error = %e, "Failed to close piece services");
    }
    result
}

/// Packs `file` into a CAR archive, stores it and records its location.
///
/// # Errors
///
/// - `MarketError::Io` - If the file cannot be read
/// - `MarketError::Blockstore` - If staging or saving the archive failed
/// - `MarketError::PieceStore` - If the metadata could not be written
pub async fn import_piece(
    services: &PieceServices,
    piece: &PieceCid,
    file: &Path,
    sector: SectorId,
    offset: u64,
    deal: Option<DealRecord>,
) -> Result<()> {
    let mut input = fs::File::open(file).await?;
    let staging = services.imports.get(piece).await?;

    let imported = async {
        let mut buffer = vec![0u8; IMPORT_BLOCK_SIZE];
        let mut blocks = 0usize;
        loop {
            let filled = read_full(&mut input, &mut buffer).await?;
            if filled == 0 {
                break;
            }
            staging.put(&buffer[..filled]).await?;
            blocks += 1;
        }
        services.imports.finalize(piece).await?;
        Ok::<_, piece_market_core::MarketError>(blocks)
    }
    .await;

    // The staging archive is only needed until the piece is in storage.
    services.imports.done(piece).await?;
    let blocks = imported?;

    let length = services.storage.size(piece).await?;
    services
        .piece_store
        .add_piece_block_locations(piece, &[PieceLocation::new(sector, offset, length)])
        .await?;
    if let Some(deal) = deal {
        services.piece_store.add_deal_for_piece(piece, deal).await?;
    }

    info!(piece_cid = %piece, blocks, bytes = length, "Piece imported");
    println!("Imported {piece}: {blocks} blocks, {length} bytes in sector {sector}");
    Ok(())
}

/// # Errors
///
/// - `MarketError::PieceStore` - If the piece is unknown or metadata is unreadable
pub async fn show_info(services: &PieceServices, piece: &PieceCid) -> Result<()> {
    let info = services.piece_store.piece_info(piece).await?;
    let stored_size = if services.storage.has(piece).await? {
        Some(services.storage.size(piece).await?)
    } else {
        None
    };

    let report = serde_json::json!({
        "piece_cid": info.piece_cid,
        "deals": info.deals,
        "locations": info.locations,
        "stored_size": stored_size,
    });
    println!("{report:#}");
    Ok(())
}

/// # Errors
///
/// - `MarketError::PieceStore` - If the index could not be listed
pub async fn list_pieces(services: &PieceServices) -> Result<()> {
    let mut pieces = services.piece_store.list_pieces().await?;
    let mut count = 0usize;
    while let Some(piece) = pieces.next().await {
        println!("{}", piece?);
        count += 1;
    }
    info!(count, "Listed pieces");
    Ok(())
}

/// # Errors
///
/// - `MarketError::Storage` - If the piece is missing or the range is out of bounds
/// - `MarketError::Io` - If the output could not be written
pub async fn read_range(
    services: &PieceServices,
    piece: &PieceCid,
    offset: u64,
    length: u64,
    output: Option<&Path>,
) -> Result<()> {
    let mut reader = services.storage.read(piece, offset, length).await?;

    let copied = match output {
        Some(path) => {
            let mut file = fs::File::create(path).await?;
            let copied = tokio::io::copy(&mut reader, &mut file).await?;
            file.sync_all().await?;
            copied
        }
        None => {
            let mut stdout = tokio::io::stdout();
            let copied = tokio::io::copy(&mut reader, &mut stdout).await?;
            stdout.flush().await?;
            copied
        }
    };

    info!(piece_cid = %piece, offset, bytes = copied, "Range read");
    Ok(())
}

/// # Errors
///
/// - `MarketError::PieceStore` - If the metadata could not be removed
/// - `MarketError::Storage` - If the stored bytes could not be removed
pub async fn expunge_piece(services: &PieceServices, piece: &PieceCid, keep_data: bool) -> Result<()> {
    services.piece_store.expunge_piece(piece).await?;
    if !keep_data {
        services.storage.delete(piece).await?;
    }
    println!("Expunged {piece}");
    Ok(())
}

/// Fills `buffer` as far as the input allows, returning the bytes read.
async fn read_full(input: &mut fs::File, buffer: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        let read = input.read(&mut buffer[filled..]).await?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use piece_market_core::{BlockCid, BlockstoreError, MarketError, PieceStoreError, StorageError};
    use tempfile::TempDir;

    use super::*;

    async fn open_node() -> (TempDir, PieceServices) {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = MarketConfig::for_testing(temp_dir.path());
        let services = PieceServices::open(&config).await.unwrap();
        (temp_dir, services)
    }

    async fn import(services: &PieceServices, temp_dir: &TempDir, piece: &PieceCid, content: &[u8]) {
        let file = temp_dir.path().join("input.bin");
        std::fs::write(&file, content).unwrap();
        let deal = DealRecord::new(DealId::new(1), SectorId::new(7));
        import_piece(services, piece, &file, SectorId::new(7), 4096, Some(deal))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_import_at_sector_offset_is_servable() {
        let (temp_dir, services) = open_node().await;
        let piece = PieceCid::new("QmOffset").unwrap();
        let content = vec![0x42u8; IMPORT_BLOCK_SIZE + 100];
        import(&services, &temp_dir, &piece, &content).await;

        let info = services.piece_store.piece_info(&piece).await.unwrap();
        assert_eq!(info.locations[0].offset, 4096);
        assert_eq!(info.deals.len(), 1);

        let store = services.pieces.get(&piece).await.unwrap();
        let head = store.get(&BlockCid::of(&content[..IMPORT_BLOCK_SIZE])).await.unwrap();
        let tail = store.get(&BlockCid::of(&content[IMPORT_BLOCK_SIZE..])).await.unwrap();
        assert_eq!(head.unwrap().len(), IMPORT_BLOCK_SIZE);
        assert_eq!(tail.unwrap().as_ref(), &content[IMPORT_BLOCK_SIZE..]);
        assert!(!services.imports.path_for(&piece).exists());

        services.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_read_range_writes_output_file() {
        let (temp_dir, services) = open_node().await;
        let piece = PieceCid::new("QmRange").unwrap();
        import(&services, &temp_dir, &piece, b"range content").await;

        let size = services.storage.size(&piece).await.unwrap();
        let output = temp_dir.path().join("out.bin");
        read_range(&services, &piece, 0, size, Some(output.as_path())).await.unwrap();

        let archive = std::fs::read(&output).unwrap();
        assert_eq!(archive.len() as u64, size);
        assert!(archive.windows(13).any(|window| window == b"range content"));

        let past_end = read_range(&services, &piece, size, 1, Some(output.as_path())).await;
        assert!(matches!(
            past_end,
            Err(MarketError::Storage(StorageError::OutOfRange { .. }))
        ));

        services.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_expunge_with_and_without_data() {
        let (temp_dir, services) = open_node().await;
        let kept = PieceCid::new("QmKept").unwrap();
        let dropped = PieceCid::new("QmDropped").unwrap();
        import(&services, &temp_dir, &kept, b"kept bytes").await;
        import(&services, &temp_dir, &dropped, b"dropped bytes").await;

        expunge_piece(&services, &kept, true).await.unwrap();
        expunge_piece(&services, &dropped, false).await.unwrap();

        for piece in [&kept, &dropped] {
            assert!(matches!(
                services.piece_store.piece_info(piece).await,
                Err(PieceStoreError::NotFound { .. })
            ));
            assert!(matches!(
                services.pieces.get(piece).await,
                Err(BlockstoreError::NotFound { .. })
            ));
        }
        assert!(services.storage.has(&kept).await.unwrap());
        assert!(!services.storage.has(&dropped).await.unwrap());

        services.close().await.unwrap();
    }

    #[test]
    fn test_command_error_wins_over_close_error() {
        let command = || Err(MarketError::Io(std::io::Error::other("command")));
        let close = || Err(MarketError::Io(std::io::Error::other("close")));

        let settled = settle(command(), close()).unwrap_err();
        assert!(settled.to_string().contains("command"));

        let settled = settle(Ok(()), close()).unwrap_err();
        assert!(settled.to_string().contains("close"));

        assert!(settle(Ok(()), Ok(())).is_ok());
    }
}
