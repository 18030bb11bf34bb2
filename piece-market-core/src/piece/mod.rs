//! Identifiers and metadata records for pieces, deals and sectors.
//!
//! A piece is addressed by its content-derived `PieceCid`. Everything else
//! known about a piece (the deals that reference it and where its bytes live)
//! is carried by the records in `records`.

pub mod records;

use std::fmt;
use std::str::FromStr;

pub use records::{BackendKind, DealRecord, PieceInfo, PieceLocation, merge_locations};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Longest identifier accepted by `PieceCid::new`.
pub const MAX_PIECE_CID_LEN: usize = 128;

/// Errors produced when parsing a piece identifier.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PieceCidError {
    #[error("Piece identifier is empty")]
    Empty,

    #[error("Piece identifier is {len} characters, limit is {MAX_PIECE_CID_LEN}")]
    TooLong { len: usize },

    #[error("Piece identifier contains invalid character {character:?}")]
    InvalidCharacter { character: char },
}

/// Content-derived identifier of a piece.
///
/// Always 1..=128 ASCII alphanumeric characters, which makes it usable as a
/// single path component and datastore key segment without escaping.
/// Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PieceCid(String);

impl PieceCid {
    /// Validates and wraps an identifier string.
    ///
    /// # Errors
    ///
    /// - `PieceCidError::Empty` - If the string is empty
    /// - `PieceCidError::TooLong` - If longer than `MAX_PIECE_CID_LEN`
    /// - `PieceCidError::InvalidCharacter` - If not ASCII alphanumeric
    pub fn new(value: impl Into<String>) -> Result<Self, PieceCidError> {
        let value = value.into();
        if value.is_empty() {
            return Err(PieceCidError::Empty);
        }
        if value.len() > MAX_PIECE_CID_LEN {
            return Err(PieceCidError::TooLong { len: value.len() });
        }
        if let Some(character) = value.chars().find(|c| !c.is_ascii_alphanumeric()) {
            return Err(PieceCidError::InvalidCharacter { character });
        }
        Ok(Self(value))
    }

    /// Derives an identifier from piece content (`p` + hex SHA-256).
    pub fn digest(data: &[u8]) -> Self {
        Self(format!("p{}", hex::encode(Sha256::digest(data))))
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PieceCid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PieceCid {
    type Err = PieceCidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for PieceCid {
    type Error = PieceCidError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<PieceCid> for String {
    fn from(cid: PieceCid) -> Self {
        cid.0
    }
}

/// On-chain identifier of a storage deal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DealId(pub u64);

impl DealId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for DealId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Provider-local number of a sealed sector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SectorId(pub u64);

impl SectorId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SectorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_piece_cid_accepts_alphanumeric() {
        let cid = PieceCid::new("Qm123").unwrap();
        assert_eq!(cid.as_str(), "Qm123");
        assert_eq!(cid.to_string(), "Qm123");
    }

    #[test]
    fn test_piece_cid_rejects_path_characters() {
        assert_eq!(
            PieceCid::new("../etc"),
            Err(PieceCidError::InvalidCharacter { character: '.' })
        );
        assert_eq!(
            PieceCid::new("a/b"),
            Err(PieceCidError::InvalidCharacter { character: '/' })
        );
        assert_eq!(PieceCid::new(""), Err(PieceCidError::Empty));
    }

    #[test]
    fn test_piece_cid_length_limit() {
        let long = "a".repeat(MAX_PIECE_CID_LEN + 1);
        assert_eq!(
            PieceCid::new(long),
            Err(PieceCidError::TooLong {
                len: MAX_PIECE_CID_LEN + 1
            })
        );
        assert!(PieceCid::new("a".repeat(MAX_PIECE_CID_LEN)).is_ok());
    }

    #[test]
    fn test_piece_cid_digest_is_deterministic() {
        let first = PieceCid::digest(b"piece payload");
        let second = PieceCid::digest(b"piece payload");
        let other = PieceCid::digest(b"other payload");

        assert_eq!(first, second);
        assert_ne!(first, other);
        assert_eq!(first.as_str().len(), 65);
        assert!(PieceCid::new(first.as_str()).is_ok());
    }

    #[test]
    fn test_piece_cid_deserialize_validates() {
        let cid: PieceCid = serde_json::from_str("\"QmABC\"").unwrap();
        assert_eq!(cid.as_str(), "QmABC");

        let invalid = serde_json::from_str::<PieceCid>("\"bad/cid\"");
        assert!(invalid.is_err());
    }
}
