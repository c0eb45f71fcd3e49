pub mod disk;
pub mod object;
pub mod retry;
pub mod throttle;

use std::collections::BTreeMap;

use crate::error::{BkError, Result};

/// Raw persistence plane: named pack blobs plus a disjoint metadata
/// namespace. Implemented by the local-directory and object-store backends;
/// the chunk-plane layers sit above this trait.
pub trait Backend: Send + Sync {
    /// Write a blob. Blobs are written once and never rewritten.
    fn write_blob(&self, name: &str, data: &[u8]) -> Result<()>;

    /// Read a whole blob. Fails with `NotFound` if absent.
    fn read_blob(&self, name: &str) -> Result<Vec<u8>>;

    /// Read `len` bytes of a blob starting at `offset`. A short read is an
    /// error, not a truncation.
    fn read_blob_range(&self, name: &str, offset: u64, len: u64) -> Result<Vec<u8>>;

    fn blob_exists(&self, name: &str) -> Result<bool>;

    /// List blobs whose name starts with `prefix`, with their sizes.
    fn list_blobs(&self, prefix: &str) -> Result<Vec<(String, u64)>>;

    /// Write a small named metadata value, whole.
    fn write_metadata(&self, key: &str, data: &[u8]) -> Result<()>;

    /// Read a metadata value, whole. Fails with `NotFound` if absent.
    fn read_metadata(&self, key: &str) -> Result<Vec<u8>>;

    fn metadata_exists(&self, key: &str) -> Result<bool>;

    /// All metadata keys with their stored sizes.
    fn list_metadata(&self) -> Result<BTreeMap<String, u64>>;

    /// Make everything written so far durable.
    fn sync(&self) -> Result<()>;

    /// Backend-level self check (readability of what it claims to hold).
    fn fsck(&self) -> Result<()> {
        Ok(())
    }

    fn stats(&self) -> TransferStats;

    fn describe(&self) -> String;
}

/// Cumulative transfer counters for one backend instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub write_ops: u64,
    pub read_ops: u64,
}

/// Reject names that are empty, non-printable, or could escape a directory
/// root. Shared by both backends; metadata keys and blob names follow the
/// same rules.
pub(crate) fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(BkError::Integrity("empty storage name".into()));
    }
    if name == "." || name == ".." {
        return Err(BkError::Integrity(format!(
            "unsafe storage name: '{name}'"
        )));
    }
    if !name
        .bytes()
        .all(|b| b.is_ascii_graphic() && b != b'/' && b != b'\\')
    {
        return Err(BkError::Integrity(format!(
            "unsafe storage name: '{name}'"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_name_rejects_unsafe() {
        assert!(validate_name("").is_err());
        assert!(validate_name("a/b").is_err());
        assert!(validate_name("a\\b").is_err());
        assert!(validate_name("has space").is_err());
        assert!(validate_name("..").is_err());
    }

    #[test]
    fn validate_name_accepts_repo_names() {
        assert!(validate_name("readme_bk.txt").is_ok());
        assert!(validate_name("encrypt.txt").is_ok());
        assert!(validate_name("pack-0c8b48c2-5a3f-4a2e-9f0d-2f6f7f1c9ab1").is_ok());
        assert!(validate_name("backup-home-20260801-120000").is_ok());
    }
}
