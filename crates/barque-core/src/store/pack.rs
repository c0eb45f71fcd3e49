use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use crate::error::{BkError, Result};
use crate::hash::{Hash, HASH_LEN};
use crate::report::{Report, StoreStats};
use crate::storage::{Backend, TransferStats};
use crate::store::index::{ChunkIndex, ChunkLocation, PackId};
use crate::store::Layer;
use crate::wire;

/// Magic bytes at the start of every pack file.
pub const PACK_MAGIC: &[u8; 4] = b"BKPK";
pub const PACK_VERSION: u8 = 1;
const PACK_HEADER_LEN: usize = 5;
/// Fixed trailer: TRAILER_OFFSET at end-16, INDEX_LEN at end-8.
const PACK_FOOTER_LEN: usize = 16;

/// Target size at which the open pack rotates.
pub const PACK_TARGET_SIZE: usize = 64 * 1024 * 1024;
/// Upper bound a well-formed pack never exceeds (target + one max chunk's
/// storage form + index).
pub const PACK_HARD_CAP: usize = 128 * 1024 * 1024;

/// One entry of a pack's trailing index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackIndexEntry {
    pub hash: Hash,
    pub offset: u64,
    pub plain_len: u64,
    pub stored_len: u64,
}

/// Serialize index entries, sorted by hash:
/// repeated `hash[32] | offset(varint) | plain_len(varint) | stored_len(varint)`.
pub fn encode_index(entries: &[PackIndexEntry]) -> Vec<u8> {
    let mut sorted: Vec<&PackIndexEntry> = entries.iter().collect();
    sorted.sort_by_key(|e| e.hash);
    let mut out = Vec::with_capacity(entries.len() * (HASH_LEN + 12));
    for entry in sorted {
        out.extend_from_slice(&entry.hash.0);
        wire::put_uvarint(&mut out, entry.offset);
        wire::put_uvarint(&mut out, entry.plain_len);
        wire::put_uvarint(&mut out, entry.stored_len);
    }
    out
}

pub fn decode_index(mut buf: &[u8]) -> Result<Vec<PackIndexEntry>> {
    let mut entries = Vec::new();
    while !buf.is_empty() {
        if buf.len() < HASH_LEN {
            return Err(BkError::Integrity("truncated pack index entry".into()));
        }
        let hash = Hash::from_bytes(&buf[..HASH_LEN])?;
        buf = &buf[HASH_LEN..];
        let (offset, n) = wire::get_uvarint(buf)?;
        buf = &buf[n..];
        let (plain_len, n) = wire::get_uvarint(buf)?;
        buf = &buf[n..];
        let (stored_len, n) = wire::get_uvarint(buf)?;
        buf = &buf[n..];
        entries.push(PackIndexEntry {
            hash,
            offset,
            plain_len,
            stored_len,
        });
    }
    Ok(entries)
}

/// Accumulates storage-layer chunk records for one pack file.
pub struct PackWriter {
    id: PackId,
    buf: Vec<u8>,
    entries: Vec<PackIndexEntry>,
    by_hash: BTreeMap<Hash, usize>,
}

impl PackWriter {
    pub fn new() -> Self {
        let mut buf = Vec::with_capacity(1024 * 1024);
        buf.extend_from_slice(PACK_MAGIC);
        buf.push(PACK_VERSION);
        PackWriter {
            id: PackId::generate(),
            buf,
            entries: Vec::new(),
            by_hash: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> PackId {
        self.id
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn size(&self) -> usize {
        self.buf.len()
    }

    /// Append one record. Returns the offset of its length prefix.
    pub fn add(&mut self, hash: Hash, plain_len: u64, payload: &[u8]) -> u64 {
        let offset = self.buf.len() as u64;
        wire::put_uvarint(&mut self.buf, payload.len() as u64);
        self.buf.extend_from_slice(payload);
        self.by_hash.insert(hash, self.entries.len());
        self.entries.push(PackIndexEntry {
            hash,
            offset,
            plain_len,
            stored_len: payload.len() as u64,
        });
        offset
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.by_hash.contains_key(hash)
    }

    /// Read back a still-buffered record's storage-layer payload.
    pub fn get(&self, hash: &Hash) -> Option<&[u8]> {
        let entry = self.entries[*self.by_hash.get(hash)?];
        let start = entry.offset as usize + wire::uvarint_len(entry.stored_len);
        Some(&self.buf[start..start + entry.stored_len as usize])
    }

    pub fn pending_entries(&self) -> &[PackIndexEntry] {
        &self.entries
    }

    /// Close the pack: append the sorted index and the fixed trailer.
    /// Returns the pack id, the finished file image, and its index entries.
    pub fn seal(self) -> (PackId, Vec<u8>, Vec<PackIndexEntry>) {
        let mut buf = self.buf;
        let index_bytes = encode_index(&self.entries);
        let trailer_offset = buf.len() as u64;
        buf.extend_from_slice(&index_bytes);
        wire::put_fixed64(&mut buf, trailer_offset);
        wire::put_fixed64(&mut buf, index_bytes.len() as u64);
        (self.id, buf, self.entries)
    }
}

impl Default for PackWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse a complete pack file image and return its index entries.
/// Used for recovery when a pack exists without its `packidx-*` blob, and by
/// fsck for structural verification.
pub fn parse_pack(data: &[u8]) -> Result<Vec<PackIndexEntry>> {
    if data.len() < PACK_HEADER_LEN + PACK_FOOTER_LEN {
        return Err(BkError::Integrity("pack too small".into()));
    }
    if &data[..4] != PACK_MAGIC {
        return Err(BkError::Integrity("bad pack magic".into()));
    }
    if data[4] != PACK_VERSION {
        return Err(BkError::Integrity(format!(
            "unsupported pack version {}",
            data[4]
        )));
    }
    let trailer_offset = wire::get_fixed64(&data[data.len() - 16..])? as usize;
    let index_len = wire::get_fixed64(&data[data.len() - 8..])? as usize;
    if trailer_offset < PACK_HEADER_LEN
        || trailer_offset
            .checked_add(index_len)
            .map_or(true, |end| end != data.len() - PACK_FOOTER_LEN)
    {
        return Err(BkError::Integrity("bad pack trailer geometry".into()));
    }
    let entries = decode_index(&data[trailer_offset..trailer_offset + index_len])?;

    // Every entry must point at a well-formed record inside the data region.
    for entry in &entries {
        let offset = entry.offset as usize;
        if offset < PACK_HEADER_LEN || offset >= trailer_offset {
            return Err(BkError::Integrity(format!(
                "record offset {offset} outside pack data region"
            )));
        }
        let (len, n) = wire::get_uvarint(&data[offset..trailer_offset])?;
        if len != entry.stored_len || offset + n + len as usize > trailer_offset {
            return Err(BkError::Integrity(format!(
                "record for {} does not match its index entry",
                entry.hash
            )));
        }
    }
    Ok(entries)
}

/// Result of a blob-pack self check.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsckSummary {
    pub chunks_checked: u64,
    pub bytes_verified: u64,
}

/// The blob pack: content-addressed chunk storage over bounded pack files.
///
/// Chunks pass down through the layer chain (compression, then encryption)
/// on write and back up on read; addressing is always by the hash of the
/// plaintext. At most one pack is open for append; closed packs are
/// immutable.
pub struct PackStore {
    backend: Box<dyn Backend>,
    layer: Box<dyn Layer>,
    index: ChunkIndex,
    open_pack: PackWriter,
    target_pack_size: usize,
    stats: StoreStats,
}

impl PackStore {
    /// Open a store: load every persisted pack index, then recover any pack
    /// that has no index blob (crash between pack-close and index-write).
    pub fn open(backend: Box<dyn Backend>, layer: Box<dyn Layer>) -> Result<Self> {
        let mut store = PackStore {
            backend,
            layer,
            index: ChunkIndex::new(),
            open_pack: PackWriter::new(),
            target_pack_size: PACK_TARGET_SIZE,
            stats: StoreStats::default(),
        };
        store.load_index()?;
        Ok(store)
    }

    #[cfg(test)]
    pub(crate) fn set_target_pack_size(&mut self, size: usize) {
        self.target_pack_size = size;
    }

    fn load_index(&mut self) -> Result<()> {
        let mut indexed_packs = std::collections::HashSet::new();

        for key in self.backend.list_metadata()?.into_keys() {
            if !key.starts_with("packidx-") {
                continue;
            }
            let pack = PackId::from_name(&key)?;
            let raw = self.backend.read_metadata(&key)?;
            let plain = self.layer.decode_metadata(&raw)?;
            for entry in decode_index(&plain)? {
                self.index.insert(
                    entry.hash,
                    ChunkLocation {
                        pack,
                        offset: entry.offset,
                        plain_len: entry.plain_len,
                        stored_len: entry.stored_len,
                    },
                );
            }
            indexed_packs.insert(pack);
        }

        // A pack file with no index blob is scanned and re-indexed; a pack
        // that does not parse was interrupted mid-write and is left orphaned.
        for (name, _) in self.backend.list_blobs("pack-")? {
            let pack = match PackId::from_name(&name) {
                Ok(pack) => pack,
                Err(_) => {
                    warn!("ignoring stray blob '{name}'");
                    continue;
                }
            };
            if indexed_packs.contains(&pack) {
                continue;
            }
            let data = self.backend.read_blob(&name)?;
            match parse_pack(&data) {
                Ok(entries) => {
                    info!("recovered index for pack {pack} ({} chunks)", entries.len());
                    let encoded = self.layer.encode_metadata(&encode_index(&entries))?;
                    self.backend.write_metadata(&pack.index_key(), &encoded)?;
                    for entry in entries {
                        self.index.insert(
                            entry.hash,
                            ChunkLocation {
                                pack,
                                offset: entry.offset,
                                plain_len: entry.plain_len,
                                stored_len: entry.stored_len,
                            },
                        );
                    }
                }
                Err(e) => {
                    warn!("pack {pack} is unreadable, leaving as orphan: {e}");
                }
            }
        }
        debug!("chunk index loaded: {} chunks", self.index.len());
        Ok(())
    }

    /// Hash the plaintext and store it unless the hash is already present.
    /// This is the write path of the whole stack: dedup first, then the
    /// layer chain, then the open pack.
    pub fn write(&mut self, data: &[u8]) -> Result<Hash> {
        let hash = Hash::of(data);
        self.stats.bytes_ingested += data.len() as u64;
        if self.contains(&hash) {
            self.stats.chunks_deduped += 1;
            self.stats.bytes_deduped += data.len() as u64;
            return Ok(hash);
        }
        let stored = self.layer.encode_chunk(data)?;
        self.stats.chunks_stored += 1;
        self.stats.bytes_packed += stored.len() as u64;
        self.open_pack.add(hash, data.len() as u64, &stored);
        if self.open_pack.size() >= self.target_pack_size {
            self.rotate_pack()?;
        }
        Ok(hash)
    }

    /// Fetch a chunk's plaintext.
    pub fn read(&mut self, hash: &Hash) -> Result<Vec<u8>> {
        if let Some(stored) = self.open_pack.get(hash) {
            return self.layer.decode_chunk(stored);
        }
        let location = *self
            .index
            .get(hash)
            .ok_or_else(|| BkError::NotFound(format!("chunk {hash}")))?;
        let stored = self.read_stored(&location)?;
        self.layer.decode_chunk(&stored)
    }

    /// Fetch a chunk's storage-layer record payload by its index location.
    fn read_stored(&self, location: &ChunkLocation) -> Result<Vec<u8>> {
        let prefix_len = wire::uvarint_len(location.stored_len);
        let record = self.backend.read_blob_range(
            &location.pack.blob_name(),
            location.offset,
            (prefix_len as u64) + location.stored_len,
        )?;
        let (len, n) = wire::get_uvarint(&record)?;
        if len != location.stored_len || n != prefix_len {
            return Err(BkError::Integrity(format!(
                "record length mismatch in pack {}",
                location.pack
            )));
        }
        Ok(record[n..].to_vec())
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.index.contains(hash) || self.open_pack.contains(hash)
    }

    /// Every chunk hash currently addressable, including not-yet-synced ones.
    pub fn hashes(&self) -> Vec<Hash> {
        let mut out: Vec<Hash> = self.index.hashes().copied().collect();
        out.extend(self.open_pack.pending_entries().iter().map(|e| e.hash));
        out
    }

    /// Close and persist the open pack: blob first, then its index blob, so
    /// a crash between the two is recoverable by re-scanning the pack.
    fn rotate_pack(&mut self) -> Result<()> {
        let writer = std::mem::take(&mut self.open_pack);
        if writer.is_empty() {
            return Ok(());
        }
        let (pack, data, entries) = writer.seal();
        debug!(
            "writing pack {pack}: {} chunks, {} bytes",
            entries.len(),
            data.len()
        );
        self.backend.write_blob(&pack.blob_name(), &data)?;
        let encoded = self.layer.encode_metadata(&encode_index(&entries))?;
        self.backend.write_metadata(&pack.index_key(), &encoded)?;
        for entry in entries {
            self.index.insert(
                entry.hash,
                ChunkLocation {
                    pack,
                    offset: entry.offset,
                    plain_len: entry.plain_len,
                    stored_len: entry.stored_len,
                },
            );
        }
        self.stats.packs_written += 1;
        Ok(())
    }

    /// Flush the open pack and make everything durable.
    pub fn sync(&mut self) -> Result<()> {
        self.rotate_pack()?;
        self.backend.sync()
    }

    // --- metadata plane (values pass through the layer chain) ---

    pub fn put_metadata(&mut self, key: &str, value: &[u8]) -> Result<()> {
        let encoded = self.layer.encode_metadata(value)?;
        self.backend.write_metadata(key, &encoded)
    }

    pub fn get_metadata(&mut self, key: &str) -> Result<Vec<u8>> {
        let raw = self.backend.read_metadata(key)?;
        self.layer.decode_metadata(&raw)
    }

    pub fn metadata_exists(&self, key: &str) -> Result<bool> {
        self.backend.metadata_exists(key)
    }

    /// Metadata keys and stored sizes (sizes are of the storage-layer form).
    pub fn list_metadata(&self) -> Result<BTreeMap<String, u64>> {
        self.backend.list_metadata()
    }

    /// Self check: structural verification of every pack, then for every
    /// indexed chunk a full fetch, decode, and rehash against its key.
    /// Problems are reported and counted, never repaired.
    pub fn fsck(&mut self, report: &Report) -> Result<FsckSummary> {
        let mut summary = FsckSummary::default();

        for (name, _) in self.backend.list_blobs("pack-")? {
            let data = self.backend.read_blob(&name)?;
            if data.len() > PACK_HARD_CAP {
                report.error(format!("pack '{name}' exceeds the hard size cap"));
            }
            if let Err(e) = parse_pack(&data) {
                report.error(format!("pack '{name}': {e}"));
            }
        }

        let locations: Vec<(Hash, ChunkLocation)> =
            self.index.iter().map(|(h, l)| (*h, *l)).collect();
        for (hash, location) in locations {
            let plaintext = match self
                .read_stored(&location)
                .and_then(|stored| self.layer.decode_chunk(&stored))
            {
                Ok(plaintext) => plaintext,
                Err(e) => {
                    report.error(format!("chunk {hash}: {e}"));
                    continue;
                }
            };
            if Hash::of(&plaintext) != hash {
                report.error(format!(
                    "chunk {hash}: content does not match its hash (pack {})",
                    location.pack
                ));
                continue;
            }
            if plaintext.len() as u64 != location.plain_len {
                report.error(format!("chunk {hash}: plaintext length drifted"));
                continue;
            }
            summary.chunks_checked += 1;
            summary.bytes_verified += plaintext.len() as u64;
        }

        self.backend.fsck()?;
        Ok(summary)
    }

    pub fn stats(&self) -> StoreStats {
        self.stats
    }

    pub fn transfer_stats(&self) -> TransferStats {
        self.backend.stats()
    }

    pub fn describe(&self) -> String {
        format!("{} over {}", self.layer.describe(), self.backend.describe())
    }

    /// Log cumulative counters after a command.
    pub fn log_stats(&self) {
        let s = self.stats;
        let t = self.backend.stats();
        info!(
            "store: {} chunks written ({} bytes packed), {} deduplicated ({} bytes saved)",
            s.chunks_stored, s.bytes_packed, s.chunks_deduped, s.bytes_deduped
        );
        info!(
            "transfer: {} bytes up / {} bytes down ({} writes, {} reads) via {}",
            t.bytes_up,
            t.bytes_down,
            t.write_ops,
            t.read_ops,
            self.backend.describe()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::IdentityLayer;
    use crate::testutil::MemoryBackend;

    fn mem_store() -> PackStore {
        PackStore::open(Box::new(MemoryBackend::new()), Box::new(IdentityLayer)).unwrap()
    }

    #[test]
    fn pack_roundtrip_via_parse() {
        let mut writer = PackWriter::new();
        let h1 = Hash::of(b"one");
        let h2 = Hash::of(b"two");
        writer.add(h1, 3, b"ONE-STORED");
        writer.add(h2, 3, b"TWO-STORED");
        let (_, data, entries) = writer.seal();

        let parsed = parse_pack(&data).unwrap();
        assert_eq!(parsed.len(), 2);
        // parse returns the sorted trailer; compare as sets.
        for entry in &entries {
            assert!(parsed.contains(entry));
        }
    }

    #[test]
    fn parse_rejects_corruption() {
        let mut writer = PackWriter::new();
        writer.add(Hash::of(b"x"), 1, b"STORED");
        let (_, data, _) = writer.seal();

        let mut bad_magic = data.clone();
        bad_magic[0] ^= 0xff;
        assert!(parse_pack(&bad_magic).is_err());

        let mut bad_trailer = data.clone();
        let at = data.len() - 12;
        bad_trailer[at] ^= 0xff;
        assert!(parse_pack(&bad_trailer).is_err());

        assert!(parse_pack(&data[..4]).is_err());
    }

    #[test]
    fn write_read_dedup() {
        let mut store = mem_store();
        let h1 = store.write(b"hello chunk").unwrap();
        let h2 = store.write(b"hello chunk").unwrap();
        assert_eq!(h1, h2);
        assert_eq!(store.stats().chunks_stored, 1);
        assert_eq!(store.stats().chunks_deduped, 1);
        assert_eq!(store.read(&h1).unwrap(), b"hello chunk");
    }

    #[test]
    fn read_after_sync_uses_range_reads() {
        let mut store = mem_store();
        let h = store.write(b"durable chunk").unwrap();
        store.sync().unwrap();
        assert_eq!(store.read(&h).unwrap(), b"durable chunk");
        assert!(store.contains(&h));
    }

    #[test]
    fn index_survives_reopen() {
        let backend = MemoryBackend::shared();
        let h = {
            let mut store =
                PackStore::open(Box::new(backend.clone()), Box::new(IdentityLayer)).unwrap();
            let h = store.write(b"persistent").unwrap();
            store.sync().unwrap();
            h
        };
        let mut store =
            PackStore::open(Box::new(backend), Box::new(IdentityLayer)).unwrap();
        assert!(store.contains(&h));
        assert_eq!(store.read(&h).unwrap(), b"persistent");
    }

    #[test]
    fn pack_without_index_blob_is_recovered() {
        let backend = MemoryBackend::shared();
        let h = {
            let mut store =
                PackStore::open(Box::new(backend.clone()), Box::new(IdentityLayer)).unwrap();
            let h = store.write(b"recover me").unwrap();
            store.sync().unwrap();
            h
        };
        // Simulate a crash between pack-close and index-write.
        let index_keys: Vec<String> = backend
            .metadata_keys()
            .into_iter()
            .filter(|k| k.starts_with("packidx-"))
            .collect();
        assert_eq!(index_keys.len(), 1);
        backend.remove_metadata(&index_keys[0]);

        let mut store = PackStore::open(Box::new(backend), Box::new(IdentityLayer)).unwrap();
        assert!(store.contains(&h));
        assert_eq!(store.read(&h).unwrap(), b"recover me");
    }

    #[test]
    fn rotation_respects_target_size() {
        let mut store = mem_store();
        store.set_target_pack_size(4 * 1024);
        for i in 0..64u32 {
            let chunk = vec![i as u8; 512];
            store.write(&chunk).unwrap();
        }
        store.sync().unwrap();
        assert!(store.stats().packs_written >= 2, "expected pack rotation");
        // Everything still readable after rotation.
        for i in 0..64u32 {
            let chunk = vec![i as u8; 512];
            assert_eq!(store.read(&Hash::of(&chunk)).unwrap(), chunk);
        }
    }

    #[test]
    fn fsck_detects_flipped_byte() {
        let backend = MemoryBackend::shared();
        let mut store =
            PackStore::open(Box::new(backend.clone()), Box::new(IdentityLayer)).unwrap();
        store.write(b"chunk under test, long enough to matter").unwrap();
        store.sync().unwrap();

        let report = Report::new();
        let summary = store.fsck(&report).unwrap();
        assert_eq!(report.error_count(), 0);
        assert_eq!(summary.chunks_checked, 1);

        let pack_names = backend.blob_names();
        assert_eq!(pack_names.len(), 1);
        backend.flip_blob_byte(&pack_names[0], 7);

        let report = Report::new();
        store.fsck(&report).unwrap();
        assert!(report.error_count() >= 1);
    }

    #[test]
    fn unsynced_chunk_is_readable() {
        let mut store = mem_store();
        let h = store.write(b"still pending").unwrap();
        assert_eq!(store.read(&h).unwrap(), b"still pending");
        assert!(store.hashes().contains(&h));
    }
}
