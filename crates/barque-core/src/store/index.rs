use std::collections::HashMap;
use std::fmt;

use uuid::Uuid;

use crate::error::{BkError, Result};
use crate::hash::Hash;

/// Identifier of one pack file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PackId(pub Uuid);

impl PackId {
    pub fn generate() -> Self {
        PackId(Uuid::new_v4())
    }

    /// Blob name under which this pack is stored.
    pub fn blob_name(&self) -> String {
        format!("pack-{}", self.0)
    }

    /// Metadata key under which this pack's index is stored.
    pub fn index_key(&self) -> String {
        format!("packidx-{}", self.0)
    }

    /// First byte of the id as a two-char hex string, used for shard
    /// directories.
    pub fn shard_prefix(&self) -> String {
        hex::encode(&self.0.as_bytes()[..1])
    }

    /// Recover a pack id from either of its storage names. The longer
    /// `packidx-` prefix is tried first; `pack-` would also match it.
    pub fn from_name(name: &str) -> Result<Self> {
        let uuid_part = name
            .strip_prefix("packidx-")
            .or_else(|| name.strip_prefix("pack-"))
            .ok_or_else(|| BkError::Integrity(format!("not a pack name: '{name}'")))?;
        let uuid = Uuid::parse_str(uuid_part)
            .map_err(|_| BkError::Integrity(format!("malformed pack id in '{name}'")))?;
        Ok(PackId(uuid))
    }
}

impl fmt::Display for PackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where one chunk lives: which pack, the offset of its record's length
/// prefix, and both its plaintext and storage-layer lengths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkLocation {
    pub pack: PackId,
    pub offset: u64,
    pub plain_len: u64,
    pub stored_len: u64,
}

/// In-memory mapping from chunk hash to pack location. Rebuilt on open from
/// the persisted `packidx-*` metadata blobs; a total function on every
/// stored chunk.
#[derive(Default)]
pub struct ChunkIndex {
    map: HashMap<Hash, ChunkLocation>,
}

impl ChunkIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a chunk. The first location wins: a chunk lives in exactly one
    /// pack per repository, so a duplicate insert is ignored.
    pub fn insert(&mut self, hash: Hash, location: ChunkLocation) {
        self.map.entry(hash).or_insert(location);
    }

    pub fn get(&self, hash: &Hash) -> Option<&ChunkLocation> {
        self.map.get(hash)
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.map.contains_key(hash)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn hashes(&self) -> impl Iterator<Item = &Hash> {
        self.map.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Hash, &ChunkLocation)> {
        self.map.iter()
    }
}
