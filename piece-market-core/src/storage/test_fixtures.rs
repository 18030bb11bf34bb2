//! Test fixtures for storage testing.
//!
//! Provides standardized storage setup for consistent testing across
//! storage-related modules.

use std::path::PathBuf;

/// Creates a temporary directory to serve as a piece storage root.
///
/// # Panics
///
/// Panics if the temporary directory cannot be created. This is acceptable
/// in test fixtures where failures indicate environment issues.
pub fn create_temp_piece_root() -> (tempfile::TempDir, PathBuf) {
    let temp_dir = tempfile::tempdir().unwrap();
    let root = temp_dir.path().join("pieces");
    std::fs::create_dir_all(&root).unwrap();
    (temp_dir, root)
}

/// Returns `length` bytes of a repeated byte pattern.
pub fn pattern_bytes(length: usize, byte: u8) -> Vec<u8> {
    vec![byte; length]
}
