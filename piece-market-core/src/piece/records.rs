//! Metadata records stored per piece in the metadata index.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::{DealId, PieceCid, SectorId};

/// Physical medium a piece location refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Files under a local directory root
    #[default]
    Local,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Local => f.write_str("local"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fs" | "local" => Ok(BackendKind::Local),
            other => Err(format!("unsupported piece storage type {other}")),
        }
    }
}

/// Where a piece's bytes live inside a backend.
///
/// `offset` is the position of the piece inside its sector and, together
/// with `sector_id`, identifies the slot. `length` is the number of piece
/// bytes. How a location maps onto backend bytes depends on the backend; see
/// `storage_window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PieceLocation {
    pub sector_id: SectorId,
    pub offset: u64,
    pub length: u64,
    #[serde(default)]
    pub backend: BackendKind,
}

impl PieceLocation {
    /// Creates a location on the local backend.
    pub fn new(sector_id: SectorId, offset: u64, length: u64) -> Self {
        Self {
            sector_id,
            offset,
            length,
            backend: BackendKind::Local,
        }
    }

    /// Byte window `(offset, length)` to request from the backend.
    ///
    /// The local backend stores each piece as its own object, so the piece
    /// starts at byte zero whatever its offset inside the sector.
    pub fn storage_window(&self) -> (u64, u64) {
        match self.backend {
            BackendKind::Local => (0, self.length),
        }
    }

    /// Two locations are the same slot when sector and offset match.
    pub fn same_slot(&self, other: &PieceLocation) -> bool {
        self.sector_id == other.sector_id && self.offset == other.offset
    }
}

/// A deal that produced or reuses a piece.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DealRecord {
    pub deal_id: DealId,
    /// Proposal reference, when the deal is not yet published on chain
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proposal: Option<String>,
    pub sector_id: SectorId,
    #[serde(default)]
    pub verified: bool,
}

impl DealRecord {
    pub fn new(deal_id: DealId, sector_id: SectorId) -> Self {
        Self {
            deal_id,
            proposal: None,
            sector_id,
            verified: false,
        }
    }

    pub fn with_verified(mut self, verified: bool) -> Self {
        self.verified = verified;
        self
    }

    pub fn with_proposal(mut self, proposal: impl Into<String>) -> Self {
        self.proposal = Some(proposal.into());
        self
    }
}

/// Everything the index knows about one piece.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PieceInfo {
    pub piece_cid: PieceCid,
    pub deals: Vec<DealRecord>,
    pub locations: Vec<PieceLocation>,
}

impl PieceInfo {
    /// Creates an empty record for a newly seen piece.
    pub fn new(piece_cid: PieceCid) -> Self {
        Self {
            piece_cid,
            deals: Vec::new(),
            locations: Vec::new(),
        }
    }

    /// Appends a deal unless an identical record is already present.
    ///
    /// Returns whether the record was added.
    pub fn add_deal(&mut self, deal: DealRecord) -> bool {
        if self.deals.contains(&deal) {
            return false;
        }
        self.deals.push(deal);
        true
    }

    /// Removes every record for `deal_id`, returning how many were dropped.
    pub fn remove_deal(&mut self, deal_id: DealId) -> usize {
        let before = self.deals.len();
        self.deals.retain(|deal| deal.deal_id != deal_id);
        before - self.deals.len()
    }

    /// Whether the piece currently has a readable location.
    pub fn is_retrievable(&self) -> bool {
        !self.locations.is_empty()
    }
}

/// Merges `incoming` into `existing`, skipping slots already present.
///
/// The first location recorded for a (sector, offset) slot wins. Returns the
/// number of locations added.
pub fn merge_locations(existing: &mut Vec<PieceLocation>, incoming: &[PieceLocation]) -> usize {
    let mut added = 0;
    for location in incoming {
        if existing.iter().any(|known| known.same_slot(location)) {
            continue;
        }
        existing.push(*location);
        added += 1;
    }
    added
}
