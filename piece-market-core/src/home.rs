//! Home directory layout of a market node.

use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::ConfigError;

/// Staging CAR files for storage deals made by this node as a client.
pub const IMPORTS_DIR: &str = "imports";
/// CAR files received by retrieval deals.
pub const RETRIEVALS_DIR: &str = "retrievals";
/// Scratch space owned by the data-transfer layer.
pub const DATA_TRANSFER_DIR: &str = "data-transfer";
/// File datastore holding piece metadata.
pub const METADATA_DIR: &str = "metadata";

/// Permission bits for directories created under the home directory.
const DIR_MODE: u32 = 0o755;

/// Root directory of a node's on-disk state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HomeDir(PathBuf);

impl HomeDir {
    /// Wraps `path` and makes sure it exists.
    ///
    /// # Errors
    ///
    /// - `ConfigError::Directory` - If the directory cannot be created
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let home = Self(path.into());
        ensure_dir(&home.0)?;
        Ok(home)
    }

    pub fn path(&self) -> &Path {
        &self.0
    }

    /// Returns the named subdirectory, creating it with mode 0755 on demand.
    ///
    /// # Errors
    ///
    /// - `ConfigError::Directory` - If the directory cannot be created
    pub fn subdir(&self, name: &str) -> Result<PathBuf, ConfigError> {
        let dir = self.0.join(name);
        ensure_dir(&dir)?;
        Ok(dir)
    }

    /// # Errors
    ///
    /// - `ConfigError::Directory` - If the directory cannot be created
    pub fn imports(&self) -> Result<PathBuf, ConfigError> {
        self.subdir(IMPORTS_DIR)
    }

    /// # Errors
    ///
    /// - `ConfigError::Directory` - If the directory cannot be created
    pub fn retrievals(&self) -> Result<PathBuf, ConfigError> {
        self.subdir(RETRIEVALS_DIR)
    }

    /// # Errors
    ///
    /// - `ConfigError::Directory` - If the directory cannot be created
    pub fn data_transfer(&self) -> Result<PathBuf, ConfigError> {
        self.subdir(DATA_TRANSFER_DIR)
    }

    /// # Errors
    ///
    /// - `ConfigError::Directory` - If the directory cannot be created
    pub fn metadata(&self) -> Result<PathBuf, ConfigError> {
        self.subdir(METADATA_DIR)
    }
}

/// Creates `dir` and its parents with mode 0755; existing directories are fine.
///
/// # Errors
///
/// - `ConfigError::Directory` - If the directory cannot be created
pub fn ensure_dir(dir: &Path) -> Result<(), ConfigError> {
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(DIR_MODE)
        .create(dir)
        .map_err(|source| ConfigError::Directory {
            path: dir.to_path_buf(),
            source,
        })?;
    debug!(dir = %dir.display(), "Directory ready");
    Ok(())
}
