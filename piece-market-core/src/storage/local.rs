//! Local filesystem piece storage.
//!
//! Each piece is one file named after its identifier directly under the
//! configured root. Saves go through a hidden temp file that is fsynced and
//! renamed into place, so `has` never sees a half-written piece.

use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{PieceReader, PieceStorage, StorageError};
use crate::piece::{BackendKind, PieceCid};

/// Suffix of in-progress piece files.
const TEMP_FILE_SUFFIX: &str = ".tmp";

/// Chunk size used while copying piece data to disk.
const COPY_BUFFER_SIZE: usize = 65536; // 64 KiB

/// Piece storage backed by a directory on the local filesystem.
#[derive(Debug, Clone)]
pub struct LocalPieceStorage {
    root: PathBuf,
}

impl LocalPieceStorage {
    /// Opens storage rooted at `root`, creating the directory if needed.
    ///
    /// Temp files left behind by an interrupted save are removed.
    ///
    /// # Errors
    ///
    /// - `StorageError::Config` - If the root cannot be created or is not a directory
    pub async fn open(root: impl AsRef<Path>) -> Result<Self, StorageError> {
        let root = root.as_ref().to_path_buf();

        fs::create_dir_all(&root)
            .await
            .map_err(|e| StorageError::Config {
                reason: format!("failed to create piece storage root {}: {e}", root.display()),
            })?;

        let storage = Self { root };
        let removed = storage.remove_stale_temp_files().await?;
        if removed > 0 {
            warn!(root = %storage.root.display(), removed, "Removed interrupted piece writes");
        }

        info!(root = %storage.root.display(), "Local piece storage opened");
        Ok(storage)
    }

    /// Root directory holding piece files.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Deterministic location of a piece's file.
    pub fn piece_path(&self, piece_cid: &PieceCid) -> PathBuf {
        self.root.join(piece_cid.as_str())
    }

    fn temp_path(&self, piece_cid: &PieceCid) -> PathBuf {
        self.root
            .join(format!(".{}.{}{TEMP_FILE_SUFFIX}", piece_cid, Uuid::new_v4()))
    }

    async fn remove_stale_temp_files(&self) -> Result<usize, StorageError> {
        let mut removed = 0;
        let mut entries = fs::read_dir(&self.root)
            .await
            .map_err(|e| StorageError::Config {
                reason: format!("failed to list piece storage root {}: {e}", self.root.display()),
            })?;

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') && name.ends_with(TEMP_FILE_SUFFIX) {
                remove_if_exists(&entry.path()).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn write_temp(
        &self,
        piece_cid: &PieceCid,
        temp_path: &Path,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        length: u64,
        cancel: &CancellationToken,
    ) -> Result<(), StorageError> {
        let mut file = fs::File::create(temp_path).await?;
        let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
        let mut received = 0u64;

        while received < length {
            let want = (length - received).min(COPY_BUFFER_SIZE as u64) as usize;
            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(StorageError::Cancelled { piece_cid: piece_cid.clone() });
                }
                read = reader.read(&mut buffer[..want]) => read?,
            };

            if read == 0 {
                return Err(StorageError::IncompleteData {
                    piece_cid: piece_cid.clone(),
                    expected: length,
                    received,
                });
            }

            file.write_all(&buffer[..read]).await?;
            received += read as u64;
        }

        file.flush().await?;
        file.sync_all().await?;

        if cancel.is_cancelled() {
            return Err(StorageError::Cancelled {
                piece_cid: piece_cid.clone(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl PieceStorage for LocalPieceStorage {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    async fn has(&self, piece_cid: &PieceCid) -> Result<bool, StorageError> {
        Ok(fs::try_exists(self.piece_path(piece_cid)).await?)
    }

    async fn size(&self, piece_cid: &PieceCid) -> Result<u64, StorageError> {
        match fs::metadata(self.piece_path(piece_cid)).await {
            Ok(metadata) => Ok(metadata.len()),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StorageError::NotFound {
                piece_cid: piece_cid.clone(),
            }),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    async fn save_with_cancel(
        &self,
        piece_cid: &PieceCid,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        length: u64,
        cancel: &CancellationToken,
    ) -> Result<(), StorageError> {
        if cancel.is_cancelled() {
            return Err(StorageError::Cancelled {
                piece_cid: piece_cid.clone(),
            });
        }

        fs::create_dir_all(&self.root).await?;

        let temp_path = self.temp_path(piece_cid);
        let guard = TempFileGuard::new(temp_path.clone());

        if let Err(e) = self
            .write_temp(piece_cid, &temp_path, reader, length, cancel)
            .await
        {
            remove_if_exists(&temp_path).await?;
            guard.disarm();
            warn!(piece_cid = %piece_cid, error = %e, "Piece save rolled back");
            return Err(e);
        }

        fs::rename(&temp_path, self.piece_path(piece_cid)).await?;
        guard.disarm();

        debug!(piece_cid = %piece_cid, length, "Piece saved");
        Ok(())
    }

    async fn read(
        &self,
        piece_cid: &PieceCid,
        offset: u64,
        length: u64,
    ) -> Result<PieceReader, StorageError> {
        let mut file = match fs::File::open(self.piece_path(piece_cid)).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StorageError::NotFound {
                    piece_cid: piece_cid.clone(),
                });
            }
            Err(e) => return Err(StorageError::Io(e)),
        };

        // Size comes from the open handle so a concurrent replace cannot
        // change it under us.
        let size = file.metadata().await?.len();
        let in_range = offset.checked_add(length).is_some_and(|end| end <= size);
        if !in_range {
            return Err(StorageError::OutOfRange {
                piece_cid: piece_cid.clone(),
                offset,
                length,
                size,
            });
        }

        file.seek(SeekFrom::Start(offset)).await?;
        debug!(piece_cid = %piece_cid, offset, length, "Piece opened for read");
        Ok(PieceReader::new(file.take(length), length))
    }

    async fn delete(&self, piece_cid: &PieceCid) -> Result<(), StorageError> {
        if remove_if_exists(&self.piece_path(piece_cid)).await? {
            debug!(piece_cid = %piece_cid, "Piece deleted");
        }
        Ok(())
    }
}

/// Removes a file, returning whether it existed.
async fn remove_if_exists(path: &Path) -> Result<bool, StorageError> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(StorageError::Io(e)),
    }
}

/// Removes a temp file if the owning save future is dropped mid-write.
struct TempFileGuard {
    path: Option<PathBuf>,
}

impl TempFileGuard {
    fn new(path: PathBuf) -> Self {
        Self { path: Some(path) }
    }

    fn disarm(mut self) {
        self.path = None;
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs as std_fs;
    use std::os::unix::fs::PermissionsExt;

    use super::*;
    use crate::storage::test_fixtures::{create_temp_piece_root, pattern_bytes};

    fn test_piece_cid() -> PieceCid {
        PieceCid::new("Qm123").unwrap()
    }

    async fn save_bytes(storage: &LocalPieceStorage, piece_cid: &PieceCid, data: &[u8]) {
        let mut reader = data;
        storage
            .save(piece_cid, &mut reader, data.len() as u64)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_save_then_read_roundtrip() {
        let (_temp_dir, root) = create_temp_piece_root();
        let storage = LocalPieceStorage::open(&root).await.unwrap();
        let piece_cid = test_piece_cid();
        let data = b"roundtrip data with special bytes: \x00\xFF\xAB\xCD";

        save_bytes(&storage, &piece_cid, data).await;

        let reader = storage
            .read(&piece_cid, 0, data.len() as u64)
            .await
            .unwrap();
        assert_eq!(reader.read_to_vec().await.unwrap(), data);
        assert_eq!(storage.size(&piece_cid).await.unwrap(), data.len() as u64);
    }

    #[tokio::test]
    async fn test_read_window_from_middle() {
        let (_temp_dir, root) = create_temp_piece_root();
        let storage = LocalPieceStorage::open(&root).await.unwrap();
        let piece_cid = test_piece_cid();
        let data: Vec<u8> = (0..=255).collect();

        save_bytes(&storage, &piece_cid, &data).await;

        let window = storage
            .read(&piece_cid, 100, 10)
            .await
            .unwrap()
            .read_to_vec()
            .await
            .unwrap();
        assert_eq!(window, &data[100..110]);
    }

    #[tokio::test]
    async fn test_read_past_end_is_out_of_range() {
        let (_temp_dir, root) = create_temp_piece_root();
        let storage = LocalPieceStorage::open(&root).await.unwrap();
        let piece_cid = test_piece_cid();

        save_bytes(&storage, &piece_cid, &pattern_bytes(1024, 0xAB)).await;

        match storage.read(&piece_cid, 1000, 25).await {
            Err(StorageError::OutOfRange {
                offset,
                length,
                size,
                ..
            }) => {
                assert_eq!((offset, length, size), (1000, 25, 1024));
            }
            other => panic!("Expected OutOfRange, got {other:?}"),
        }

        assert!(matches!(
            storage.read(&piece_cid, u64::MAX, 2).await,
            Err(StorageError::OutOfRange { .. })
        ));

        let tail = storage.read(&piece_cid, 1024, 0).await.unwrap();
        assert!(tail.is_empty());
    }

    #[tokio::test]
    async fn test_read_missing_piece_is_not_found() {
        let (_temp_dir, root) = create_temp_piece_root();
        let storage = LocalPieceStorage::open(&root).await.unwrap();

        let result = storage.read(&test_piece_cid(), 0, 1).await;
        assert!(matches!(result, Err(StorageError::NotFound { .. })));

        let result = storage.size(&test_piece_cid()).await;
        assert!(matches!(result, Err(StorageError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let (_temp_dir, root) = create_temp_piece_root();
        let storage = LocalPieceStorage::open(&root).await.unwrap();
        let piece_cid = test_piece_cid();

        save_bytes(&storage, &piece_cid, b"to be deleted").await;
        assert!(storage.has(&piece_cid).await.unwrap());

        storage.delete(&piece_cid).await.unwrap();
        assert!(!storage.has(&piece_cid).await.unwrap());

        storage.delete(&piece_cid).await.unwrap();
        assert!(!storage.has(&piece_cid).await.unwrap());
    }

    #[tokio::test]
    async fn test_short_reader_leaves_no_piece() {
        let (_temp_dir, root) = create_temp_piece_root();
        let storage = LocalPieceStorage::open(&root).await.unwrap();
        let piece_cid = test_piece_cid();
        let mut reader = &b"only ten b"[..];

        let result = storage.save(&piece_cid, &mut reader, 100).await;

        match result {
            Err(StorageError::IncompleteData {
                expected, received, ..
            }) => {
                assert_eq!(expected, 100);
                assert_eq!(received, 10);
            }
            other => panic!("Expected IncompleteData, got {other:?}"),
        }
        assert!(!storage.has(&piece_cid).await.unwrap());
        assert_eq!(std_fs::read_dir(&root).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_failed_overwrite_keeps_previous_piece() {
        let (_temp_dir, root) = create_temp_piece_root();
        let storage = LocalPieceStorage::open(&root).await.unwrap();
        let piece_cid = test_piece_cid();

        save_bytes(&storage, &piece_cid, b"original").await;

        let mut short = &b"new"[..];
        assert!(storage.save(&piece_cid, &mut short, 50).await.is_err());

        let reader = storage.read(&piece_cid, 0, 8).await.unwrap();
        assert_eq!(reader.read_to_vec().await.unwrap(), b"original");
    }

    #[tokio::test]
    async fn test_save_only_consumes_declared_length() {
        let (_temp_dir, root) = create_temp_piece_root();
        let storage = LocalPieceStorage::open(&root).await.unwrap();
        let piece_cid = test_piece_cid();
        let mut reader = &b"0123456789"[..];

        storage.save(&piece_cid, &mut reader, 4).await.unwrap();

        assert_eq!(storage.size(&piece_cid).await.unwrap(), 4);
        assert_eq!(reader, b"456789");
    }

    #[tokio::test]
    async fn test_save_recreates_missing_root() {
        let (_temp_dir, root) = create_temp_piece_root();
        let storage = LocalPieceStorage::open(&root).await.unwrap();
        std_fs::remove_dir(&root).unwrap();

        save_bytes(&storage, &test_piece_cid(), b"data").await;
        assert!(storage.piece_path(&test_piece_cid()).exists());
    }

    #[tokio::test]
    async fn test_open_removes_interrupted_writes() {
        let (_temp_dir, root) = create_temp_piece_root();
        std_fs::write(root.join(".Qm123.abc.tmp"), b"partial").unwrap();
        std_fs::write(root.join("Qm456"), b"complete").unwrap();

        let storage = LocalPieceStorage::open(&root).await.unwrap();

        assert!(!root.join(".Qm123.abc.tmp").exists());
        assert!(storage.has(&PieceCid::new("Qm456").unwrap()).await.unwrap());
    }

    #[tokio::test]
    async fn test_piece_path_stays_under_root() {
        let (_temp_dir, root) = create_temp_piece_root();
        let storage = LocalPieceStorage::open(&root).await.unwrap();
        let piece_cid = PieceCid::digest(b"content");

        let path = storage.piece_path(&piece_cid);
        assert!(path.starts_with(&root));
        assert_eq!(path.parent(), Some(root.as_path()));
    }

    #[tokio::test]
    async fn test_save_permission_denied() {
        let (_temp_dir, root) = create_temp_piece_root();
        let storage = LocalPieceStorage::open(&root).await.unwrap();

        let mut perms = std_fs::metadata(&root).unwrap().permissions();
        perms.set_mode(0o555);
        std_fs::set_permissions(&root, perms).unwrap();

        let mut reader = &b"data"[..];
        let result = storage.save(&test_piece_cid(), &mut reader, 4).await;

        let mut perms = std_fs::metadata(&root).unwrap().permissions();
        perms.set_mode(0o755);
        std_fs::set_permissions(&root, perms).unwrap();

        // Root bypasses permission bits, in which case the save succeeds.
        match result {
            Ok(()) => assert!(storage.has(&test_piece_cid()).await.unwrap()),
            Err(StorageError::Io(e)) => assert_eq!(e.kind(), ErrorKind::PermissionDenied),
            Err(e) => panic!("Unexpected error type: {e}"),
        }
    }

    #[tokio::test]
    async fn test_concurrent_saves_of_distinct_pieces() {
        let (_temp_dir, root) = create_temp_piece_root();
        let storage = std::sync::Arc::new(LocalPieceStorage::open(&root).await.unwrap());

        let mut handles = Vec::new();
        for i in 0..8u8 {
            let storage = storage.clone();
            handles.push(tokio::spawn(async move {
                let piece_cid = PieceCid::new(format!("QmPiece{i}")).unwrap();
                let data = pattern_bytes(4096, i);
                let mut reader = &data[..];
                storage.save(&piece_cid, &mut reader, 4096).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        for i in 0..8u8 {
            let piece_cid = PieceCid::new(format!("QmPiece{i}")).unwrap();
            let data = storage
                .read(&piece_cid, 0, 4096)
                .await
                .unwrap()
                .read_to_vec()
                .await
                .unwrap();
            assert!(data.iter().all(|&b| b == i));
        }
    }
}
