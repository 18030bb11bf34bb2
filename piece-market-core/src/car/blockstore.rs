//! Block store over a single CAR archive.
//!
//! File-backed stores append sections to the archive as blocks arrive and keep
//! an in-memory index from block identifier to section. Finalizing flushes the
//! archive and writes the index to a `<file>.idx` sidecar, after which the
//! store is read-only. Piece-backed stores are read-only views of an archive
//! held in piece storage; each block is read on demand through
//! `PieceStorage::read`. Memory-backed stores hold the archive in a buffer.

use std::collections::HashMap;
use std::ffi::OsString;
use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::format::{CarHeader, SectionRef, encode_section, scan_archive};
use super::{BlockCid, CarError};
use crate::piece::PieceCid;
use crate::storage::PieceStorage;

const INDEX_SUFFIX: &str = ".idx";

/// Sidecar written on finalize so reopening skips the scan.
#[derive(Debug, Serialize, Deserialize)]
struct CarIndex {
    roots: Vec<BlockCid>,
    end: u64,
    blocks: Vec<SectionRef>,
}

/// Window of a stored piece holding an archive.
#[derive(Clone)]
struct PieceWindow {
    storage: Arc<dyn PieceStorage>,
    piece_cid: PieceCid,
    offset: u64,
}

enum Backing {
    File(fs::File),
    Memory(Vec<u8>),
    Piece(PieceWindow),
}

struct Inner {
    backing: Backing,
    roots: Vec<BlockCid>,
    index: HashMap<BlockCid, SectionRef>,
    order: Vec<BlockCid>,
    end: u64,
    finalized: bool,
}

impl Inner {
    fn new(backing: Backing, roots: Vec<BlockCid>, sections: Vec<SectionRef>, end: u64) -> Self {
        let mut index = HashMap::with_capacity(sections.len());
        let mut order = Vec::with_capacity(sections.len());
        for section in sections {
            // Duplicate sections are legal; the first one wins.
            if !index.contains_key(&section.cid) {
                order.push(section.cid);
                index.insert(section.cid, section);
            }
        }
        Self {
            backing,
            roots,
            index,
            order,
            end,
            finalized: false,
        }
    }

    fn to_index(&self) -> CarIndex {
        CarIndex {
            roots: self.roots.clone(),
            end: self.end,
            blocks: self.order.iter().map(|cid| self.index[cid]).collect(),
        }
    }
}

/// Returns the index sidecar path of an archive.
pub fn index_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(INDEX_SUFFIX);
    PathBuf::from(name)
}

/// Content-addressed block store backed by a CAR archive.
///
/// All operations serialize on an internal async mutex, so one handle may be
/// shared between tasks. After `close` every operation fails with
/// `CarError::Closed`.
pub struct CarBlockstore {
    path: Option<PathBuf>,
    inner: Mutex<Option<Inner>>,
}

impl CarBlockstore {
    /// Creates a new archive at `path`, replacing any existing file.
    ///
    /// # Errors
    ///
    /// - `CarError::Io` - If the file cannot be created or written
    pub async fn create(path: impl AsRef<Path>, roots: Vec<BlockCid>) -> Result<Self, CarError> {
        let path = path.as_ref().to_path_buf();
        remove_if_exists(&index_path(&path)).await?;

        let mut header = Vec::new();
        CarHeader::new(roots.clone()).encode(&mut header)?;

        let mut file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .await?;
        file.write_all(&header).await?;
        file.flush().await?;

        debug!(path = %path.display(), "Created CAR blockstore");
        let inner = Inner::new(Backing::File(file), roots, Vec::new(), header.len() as u64);
        Ok(Self {
            path: Some(path),
            inner: Mutex::new(Some(inner)),
        })
    }

    /// Opens an existing archive, or creates an empty one if `path` is absent.
    ///
    /// A finalized archive is reopened read-only from its index sidecar; an
    /// unfinalized one is scanned and accepts further blocks.
    ///
    /// # Errors
    ///
    /// - `CarError::Io` - If the file cannot be opened
    /// - Any decoding error if the archive is corrupt
    pub async fn open_or_create(path: impl AsRef<Path>) -> Result<Self, CarError> {
        let path = path.as_ref();
        if !fs::try_exists(path).await? {
            return Self::create(path, Vec::new()).await;
        }

        let file_len = fs::metadata(path).await?.len();
        if let Some(index) = load_index(path, file_len).await {
            let file = fs::File::open(path).await?;
            let mut inner = Inner::new(Backing::File(file), index.roots, index.blocks, index.end);
            inner.finalized = true;
            info!(path = %path.display(), blocks = inner.order.len(), "Opened finalized CAR blockstore");
            return Ok(Self {
                path: Some(path.to_path_buf()),
                inner: Mutex::new(Some(inner)),
            });
        }

        let mut file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .await?;
        let scan = scan_archive(&mut file).await?;
        let inner = Inner::new(Backing::File(file), scan.header.roots, scan.sections, scan.end);
        info!(path = %path.display(), blocks = inner.order.len(), "Reopened CAR blockstore");
        Ok(Self {
            path: Some(path.to_path_buf()),
            inner: Mutex::new(Some(inner)),
        })
    }

    /// Creates an empty, writable store held in memory.
    ///
    /// # Errors
    ///
    /// - `CarError::InvalidHeader` - If the header cannot be serialized
    pub fn in_memory(roots: Vec<BlockCid>) -> Result<Self, CarError> {
        let mut buffer = Vec::new();
        CarHeader::new(roots.clone()).encode(&mut buffer)?;
        let end = buffer.len() as u64;
        Ok(Self {
            path: None,
            inner: Mutex::new(Some(Inner::new(Backing::Memory(buffer), roots, Vec::new(), end))),
        })
    }

    /// Wraps an encoded archive as a read-only store.
    ///
    /// # Errors
    ///
    /// Any scanning error if `bytes` is not a valid archive.
    pub async fn from_bytes(bytes: Vec<u8>) -> Result<Self, CarError> {
        let scan = scan_archive(&bytes[..]).await?;
        let mut inner = Inner::new(Backing::Memory(bytes), scan.header.roots, scan.sections, scan.end);
        inner.finalized = true;
        Ok(Self {
            path: None,
            inner: Mutex::new(Some(inner)),
        })
    }

    /// Opens the archive stored in `[offset, offset + length)` of a piece as a
    /// read-only store.
    ///
    /// The window is streamed once to build the index; blocks are read back
    /// individually on `get`.
    ///
    /// # Errors
    ///
    /// - `CarError::Storage` - If the window cannot be read from storage
    /// - Any scanning error if the window does not hold exactly one valid archive
    pub async fn open_piece(
        storage: Arc<dyn PieceStorage>,
        piece_cid: PieceCid,
        offset: u64,
        length: u64,
    ) -> Result<Self, CarError> {
        let reader = storage.read(&piece_cid, offset, length).await?;
        let scan = scan_archive(reader).await?;

        debug!(piece_cid = %piece_cid, offset, blocks = scan.sections.len(), "Opened piece CAR blockstore");
        let window = PieceWindow {
            storage,
            piece_cid,
            offset,
        };
        let mut inner = Inner::new(Backing::Piece(window), scan.header.roots, scan.sections, scan.end);
        inner.finalized = true;
        Ok(Self {
            path: None,
            inner: Mutex::new(Some(inner)),
        })
    }

    /// Backing file, if the store is file-backed.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Stores a block, returning its identifier. Storing a known block is a no-op.
    ///
    /// # Errors
    ///
    /// - `CarError::Finalized` - If the store is read-only
    /// - `CarError::Closed` - If the store was closed
    /// - `CarError::Io` - If the section could not be written
    pub async fn put(&self, data: &[u8]) -> Result<BlockCid, CarError> {
        let cid = BlockCid::of(data);
        let mut guard = self.inner.lock().await;
        let inner = guard.as_mut().ok_or(CarError::Closed)?;

        if inner.finalized {
            return Err(CarError::Finalized);
        }
        if inner.index.contains_key(&cid) {
            return Ok(cid);
        }

        let mut section = Vec::with_capacity(data.len() + 48);
        encode_section(&cid, data, &mut section);
        let start = inner.end;

        match &mut inner.backing {
            Backing::File(file) => {
                let written = async {
                    file.seek(SeekFrom::Start(start)).await?;
                    file.write_all(&section).await?;
                    file.flush().await
                }
                .await;
                if let Err(e) = written {
                    // Drop the partial section so a rescan stays consistent.
                    if let Err(truncate_error) = file.set_len(start).await {
                        warn!(error = %truncate_error, "Failed to roll back partial CAR section");
                    }
                    return Err(CarError::Io(e));
                }
            }
            Backing::Memory(buffer) => buffer.extend_from_slice(&section),
            Backing::Piece(_) => return Err(CarError::Finalized),
        }

        let section_len = section.len() as u64;
        inner.end = start + section_len;
        inner.index.insert(
            cid,
            SectionRef {
                cid,
                offset: inner.end - data.len() as u64,
                length: data.len() as u64,
            },
        );
        inner.order.push(cid);
        Ok(cid)
    }

    /// Returns a block's bytes, or `None` if the store does not hold it.
    ///
    /// # Errors
    ///
    /// - `CarError::Closed` - If the store was closed
    /// - `CarError::Storage` - If a piece-backed block could not be read
    /// - `CarError::Io` - If the block could not be read
    pub async fn get(&self, cid: &BlockCid) -> Result<Option<Bytes>, CarError> {
        let (window, section) = {
            let mut guard = self.inner.lock().await;
            let inner = guard.as_mut().ok_or(CarError::Closed)?;
            let Some(section) = inner.index.get(cid).copied() else {
                return Ok(None);
            };

            match &mut inner.backing {
                Backing::File(file) => {
                    let mut data = vec![0u8; section.length as usize];
                    file.seek(SeekFrom::Start(section.offset)).await?;
                    file.read_exact(&mut data).await?;
                    return Ok(Some(Bytes::from(data)));
                }
                Backing::Memory(buffer) => {
                    let start = section.offset as usize;
                    let data = Bytes::copy_from_slice(&buffer[start..start + section.length as usize]);
                    return Ok(Some(data));
                }
                Backing::Piece(window) => (window.clone(), section),
            }
        };

        // Each read opens its own handle, so the store lock is not held.
        let data = window
            .storage
            .read(&window.piece_cid, window.offset + section.offset, section.length)
            .await?
            .read_to_vec()
            .await?;
        Ok(Some(Bytes::from(data)))
    }

    /// # Errors
    ///
    /// - `CarError::Closed` - If the store was closed
    pub async fn has(&self, cid: &BlockCid) -> Result<bool, CarError> {
        let guard = self.inner.lock().await;
        let inner = guard.as_ref().ok_or(CarError::Closed)?;
        Ok(inner.index.contains_key(cid))
    }

    /// Size of a block in bytes, or `None` if the store does not hold it.
    ///
    /// # Errors
    ///
    /// - `CarError::Closed` - If the store was closed
    pub async fn size(&self, cid: &BlockCid) -> Result<Option<u64>, CarError> {
        let guard = self.inner.lock().await;
        let inner = guard.as_ref().ok_or(CarError::Closed)?;
        Ok(inner.index.get(cid).map(|section| section.length))
    }

    /// Identifiers of all blocks in insertion order.
    ///
    /// # Errors
    ///
    /// - `CarError::Closed` - If the store was closed
    pub async fn cids(&self) -> Result<Vec<BlockCid>, CarError> {
        let guard = self.inner.lock().await;
        let inner = guard.as_ref().ok_or(CarError::Closed)?;
        Ok(inner.order.clone())
    }

    /// Root identifiers recorded in the archive header.
    ///
    /// # Errors
    ///
    /// - `CarError::Closed` - If the store was closed
    pub async fn roots(&self) -> Result<Vec<BlockCid>, CarError> {
        let guard = self.inner.lock().await;
        let inner = guard.as_ref().ok_or(CarError::Closed)?;
        Ok(inner.roots.clone())
    }

    /// Total archive size in bytes, header included.
    ///
    /// # Errors
    ///
    /// - `CarError::Closed` - If the store was closed
    pub async fn archive_len(&self) -> Result<u64, CarError> {
        let guard = self.inner.lock().await;
        let inner = guard.as_ref().ok_or(CarError::Closed)?;
        Ok(inner.end)
    }

    /// # Errors
    ///
    /// - `CarError::Closed` - If the store was closed
    pub async fn is_finalized(&self) -> Result<bool, CarError> {
        let guard = self.inner.lock().await;
        let inner = guard.as_ref().ok_or(CarError::Closed)?;
        Ok(inner.finalized)
    }

    /// Makes the store immutable, flushing the archive and its index.
    ///
    /// Finalizing twice is a no-op.
    ///
    /// # Errors
    ///
    /// - `CarError::Closed` - If the store was closed
    /// - `CarError::Io` - If the archive or index could not be flushed
    pub async fn finalize(&self) -> Result<(), CarError> {
        let mut guard = self.inner.lock().await;
        let inner = guard.as_mut().ok_or(CarError::Closed)?;
        if inner.finalized {
            return Ok(());
        }

        if let (Backing::File(file), Some(path)) = (&mut inner.backing, &self.path) {
            file.flush().await?;
            file.sync_all().await?;
            write_index(path, &inner.to_index()).await?;
            info!(path = %path.display(), blocks = inner.order.len(), bytes = inner.end, "Finalized CAR blockstore");
        }

        inner.finalized = true;
        Ok(())
    }

    /// Releases the backing resources and index. Closing twice is a no-op.
    ///
    /// # Errors
    ///
    /// - `CarError::Io` - If pending writes could not be flushed
    pub async fn close(&self) -> Result<(), CarError> {
        let Some(inner) = self.inner.lock().await.take() else {
            return Ok(());
        };
        if let Backing::File(mut file) = inner.backing {
            file.flush().await?;
        }
        debug!(path = ?self.path, "Closed CAR blockstore");
        Ok(())
    }
}

async fn load_index(path: &Path, file_len: u64) -> Option<CarIndex> {
    let bytes = fs::read(index_path(path)).await.ok()?;
    match serde_json::from_slice::<CarIndex>(&bytes) {
        Ok(index) if index.end == file_len => Some(index),
        Ok(_) => {
            warn!(path = %path.display(), "Stale CAR index, rescanning");
            None
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Unreadable CAR index, rescanning");
            None
        }
    }
}

async fn write_index(path: &Path, index: &CarIndex) -> Result<(), CarError> {
    let target = index_path(path);
    let mut temp = OsString::from(target.as_os_str());
    temp.push(format!(".{}.tmp", Uuid::new_v4()));
    let temp = PathBuf::from(temp);
    let bytes = serde_json::to_vec(index)?;

    let written = async {
        let mut file = fs::File::create(&temp).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        fs::rename(&temp, &target).await
    }
    .await;

    if let Err(e) = written {
        let _ = fs::remove_file(&temp).await;
        return Err(CarError::Io(e));
    }
    Ok(())
}

pub(crate) async fn remove_if_exists(path: &Path) -> Result<(), std::io::Error> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
