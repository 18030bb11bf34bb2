//! Centralized configuration for the market node core.
//!
//! All tunable parameters and settings are defined here to avoid
//! hard-coded values scattered throughout the codebase.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::piece::BackendKind;

/// Default home directory, `~` is expanded from `HOME`.
pub const DEFAULT_HOME: &str = "~/.piecemarket";

/// Default piece storage backend.
pub const DEFAULT_PIECE_STORAGE: &str = "fs:/mnt/piece";

/// Errors raised while building configuration.
///
/// Configuration errors are fatal: they fail construction of the component
/// that consumes the configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid piece storage {value:?}: {reason}")]
    InvalidPieceStorage { value: String, reason: String },

    #[error("Invalid value {value:?} for {name}")]
    InvalidValue { name: &'static str, value: String },

    #[error("Failed to create directory {}: {source}", path.display())]
    Directory {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Central configuration for all core components.
#[derive(Debug, Clone)]
pub struct MarketConfig {
    /// Node home directory (imports, retrievals, metadata, journal)
    pub home: PathBuf,
    pub piece_storage: PieceStorageConfig,
    pub journal: JournalConfig,
    pub blockstore: BlockstoreConfig,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            home: expand_home(DEFAULT_HOME),
            piece_storage: PieceStorageConfig::default(),
            journal: JournalConfig::default(),
            blockstore: BlockstoreConfig::default(),
        }
    }
}

/// Backend selection for raw piece bytes.
///
/// Written as `"<kind>:<path>"`, for example `fs:/mnt/piece`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PieceStorageConfig {
    pub kind: BackendKind,
    pub path: PathBuf,
}

impl Default for PieceStorageConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::Local,
            path: PathBuf::from("/mnt/piece"),
        }
    }
}

impl FromStr for PieceStorageConfig {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: String| ConfigError::InvalidPieceStorage {
            value: value.to_string(),
            reason,
        };

        let (kind, path) = value
            .split_once(':')
            .ok_or_else(|| invalid("expected <kind>:<path>".to_string()))?;
        let kind = kind.parse::<BackendKind>().map_err(invalid)?;
        if path.is_empty() {
            return Err(invalid("path is empty".to_string()));
        }

        Ok(Self {
            kind,
            path: expand_home(path),
        })
    }
}

impl fmt::Display for PieceStorageConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.path.display())
    }
}

/// Event journal settings.
#[derive(Debug, Clone)]
pub struct JournalConfig {
    /// Journal directory, relative paths resolve against the home directory
    pub path: PathBuf,
    /// Event types never recorded, as `(system, event)` pairs
    pub disabled_events: Vec<(String, String)>,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("journal"),
            disabled_events: Vec::new(),
        }
    }
}

impl JournalConfig {
    /// Parses `system:event,system:event` into disabled event pairs.
    ///
    /// # Errors
    ///
    /// - `ConfigError::InvalidValue` - If an entry lacks the `:` separator
    pub fn parse_disabled_events(value: &str) -> Result<Vec<(String, String)>, ConfigError> {
        value
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(|entry| match entry.split_once(':') {
                Some((system, event)) if !system.is_empty() && !event.is_empty() => {
                    Ok((system.to_string(), event.to_string()))
                }
                _ => Err(ConfigError::InvalidValue {
                    name: "journal disabled events",
                    value: entry.to_string(),
                }),
            })
            .collect()
    }
}

/// Blockstore accessor settings.
#[derive(Debug, Clone)]
pub struct BlockstoreConfig {
    /// Read-only piece blockstores kept open for reuse
    pub max_open_pieces: usize,
}

impl Default for BlockstoreConfig {
    fn default() -> Self {
        Self {
            max_open_pieces: 16,
        }
    }
}

impl MarketConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// # Errors
    ///
    /// - `ConfigError::InvalidPieceStorage` - If `PIECE_MARKET_PIECE_STORAGE` is malformed
    /// - `ConfigError::InvalidValue` - If any other override cannot be parsed
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(home) = std::env::var("PIECE_MARKET_HOME") {
            config.home = expand_home(&home);
        }

        if let Ok(storage) = std::env::var("PIECE_MARKET_PIECE_STORAGE") {
            config.piece_storage = storage.parse()?;
        }

        if let Ok(disabled) = std::env::var("PIECE_MARKET_JOURNAL_DISABLED") {
            config.journal.disabled_events = JournalConfig::parse_disabled_events(&disabled)?;
        }

        if let Ok(max_open) = std::env::var("PIECE_MARKET_MAX_OPEN_PIECES") {
            config.blockstore.max_open_pieces =
                max_open
                    .parse::<usize>()
                    .map_err(|_| ConfigError::InvalidValue {
                        name: "PIECE_MARKET_MAX_OPEN_PIECES",
                        value: max_open.clone(),
                    })?;
        }

        Ok(config)
    }

    /// Creates a configuration rooted entirely under `root`.
    pub fn for_testing(root: &Path) -> Self {
        Self {
            home: root.join("home"),
            piece_storage: PieceStorageConfig {
                kind: BackendKind::Local,
                path: root.join("pieces"),
            },
            journal: JournalConfig::default(),
            blockstore: BlockstoreConfig { max_open_pieces: 4 },
        }
    }

    /// Journal directory with relative paths resolved against the home.
    pub fn journal_dir(&self) -> PathBuf {
        if self.journal.path.is_absolute() {
            self.journal.path.clone()
        } else {
            self.home.join(&self.journal.path)
        }
    }
}

/// Expands a leading `~` using the `HOME` environment variable.
pub fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix('~') {
        Some(rest) => match std::env::var("HOME") {
            Ok(home) => PathBuf::from(home).join(rest.trim_start_matches('/')),
            Err(_) => PathBuf::from(path),
        },
        None => PathBuf::from(path),
    }
}
