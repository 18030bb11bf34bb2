//! Datastore persisted as one file per key.
//!
//! Key `/a/b/c` lives at `<root>/a/b/c.value`. The suffix keeps a value and a
//! directory of child keys from colliding when one key prefixes another.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use uuid::Uuid;

use super::{Datastore, DatastoreError, Key};

const VALUE_SUFFIX: &str = ".value";
const TEMP_FILE_SUFFIX: &str = ".tmp";

/// Durable datastore rooted at a directory.
#[derive(Debug, Clone)]
pub struct FileDatastore {
    root: PathBuf,
}

impl FileDatastore {
    /// Opens the datastore, creating the root directory if needed.
    ///
    /// # Errors
    ///
    /// - `DatastoreError::Io` - If the root cannot be created
    pub async fn open(root: impl AsRef<Path>) -> Result<Self, DatastoreError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        info!(root = %root.display(), "File datastore opened");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn dir_for(&self, key: &Key) -> Result<PathBuf, DatastoreError> {
        check_segments(key)?;
        Ok(key
            .segments()
            .fold(self.root.clone(), |path, segment| path.join(segment)))
    }

    fn value_path(&self, key: &Key) -> Result<PathBuf, DatastoreError> {
        let name = key.name().ok_or_else(|| DatastoreError::InvalidKey {
            key: key.to_string(),
            reason: "cannot store a value at the root key",
        })?;
        check_segments(key)?;

        let segments: Vec<&str> = key.segments().collect();
        let dir = segments[..segments.len() - 1]
            .iter()
            .fold(self.root.clone(), |path, segment| path.join(segment));
        Ok(dir.join(format!("{name}{VALUE_SUFFIX}")))
    }
}

/// Rejects keys with a segment that could collide with a value file.
fn check_segments(key: &Key) -> Result<(), DatastoreError> {
    if key.segments().any(|segment| segment.ends_with(VALUE_SUFFIX)) {
        return Err(DatastoreError::InvalidKey {
            key: key.to_string(),
            reason: "segment ends with the reserved value suffix",
        });
    }
    Ok(())
}

#[async_trait]
impl Datastore for FileDatastore {
    async fn get(&self, key: &Key) -> Result<Option<Vec<u8>>, DatastoreError> {
        if key.is_root() {
            return Ok(None);
        }
        match fs::read(self.value_path(key)?).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(DatastoreError::Io(e)),
        }
    }

    async fn has(&self, key: &Key) -> Result<bool, DatastoreError> {
        if key.is_root() {
            return Ok(false);
        }
        Ok(fs::try_exists(self.value_path(key)?).await?)
    }

    async fn put(&self, key: &Key, value: Vec<u8>) -> Result<(), DatastoreError> {
        let path = self.value_path(key)?;
        let dir = path.parent().unwrap_or(&self.root).to_path_buf();
        fs::create_dir_all(&dir).await?;

        let temp_path = dir.join(format!(
            ".{}.{}{TEMP_FILE_SUFFIX}",
            key.name().unwrap_or_default(),
            Uuid::new_v4()
        ));

        let written = async {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(&value).await?;
            file.flush().await?;
            file.sync_all().await?;
            fs::rename(&temp_path, &path).await
        }
        .await;

        if let Err(e) = written {
            let _ = fs::remove_file(&temp_path).await;
            return Err(DatastoreError::Io(e));
        }

        debug!(key = %key, bytes = value.len(), "Datastore value written");
        Ok(())
    }

    async fn delete(&self, key: &Key) -> Result<(), DatastoreError> {
        if key.is_root() {
            return Ok(());
        }
        match fs::remove_file(self.value_path(key)?).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DatastoreError::Io(e)),
        }
    }

    async fn query_keys(&self, prefix: &Key) -> Result<Vec<Key>, DatastoreError> {
        let mut keys = Vec::new();
        let mut pending = vec![(self.dir_for(prefix)?, prefix.clone())];

        while let Some((dir, dir_key)) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(DatastoreError::Io(e)),
            };

            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if name.starts_with('.') {
                    continue;
                }

                if entry.file_type().await?.is_dir() {
                    if let Ok(child) = dir_key.child(&name) {
                        pending.push((entry.path(), child));
                    }
                } else if let Some(stem) = name.strip_suffix(VALUE_SUFFIX)
                    && let Ok(child) = dir_key.child(stem)
                {
                    keys.push(child);
                }
            }
        }

        keys.sort();
        Ok(keys)
    }

    async fn sync(&self) -> Result<(), DatastoreError> {
        // Every put is fsynced before it is renamed into place.
        Ok(())
    }
}
