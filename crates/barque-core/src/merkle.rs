//! Named byte streams over a tree of hash references.
//!
//! A depth-0 stream is a single chunk holding the user data. A depth-d
//! stream is a chunk holding a packed array of child records for depth d-1.
//! The writer feeds data through the splitter and recursively splits the
//! serialized record arrays until one chunk remains; its record (hash,
//! depth, total length) names the stream.

use std::io::{self, Read, Write};

use crate::error::{BkError, Result};
use crate::hash::{Hash, HASH_LEN};
use crate::report::Report;
use crate::splitter::Splitter;
use crate::store::pack::PackStore;

/// Serialized record: hash(32) | depth(1) | length(8, little-endian).
pub const MERKLE_RECORD_LEN: usize = HASH_LEN + 1 + 8;

/// Root of a Merkle stream, or one child reference inside an interior node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MerkleHash {
    pub hash: Hash,
    pub depth: u8,
    pub length: u64,
}

impl MerkleHash {
    pub fn to_bytes(&self) -> [u8; MERKLE_RECORD_LEN] {
        let mut out = [0u8; MERKLE_RECORD_LEN];
        out[..HASH_LEN].copy_from_slice(&self.hash.0);
        out[HASH_LEN] = self.depth;
        out[HASH_LEN + 1..].copy_from_slice(&self.length.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != MERKLE_RECORD_LEN {
            return Err(BkError::Integrity(format!(
                "merkle record must be {MERKLE_RECORD_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        let hash = Hash::from_bytes(&bytes[..HASH_LEN])?;
        let depth = bytes[HASH_LEN];
        let length = u64::from_le_bytes(bytes[HASH_LEN + 1..].try_into().unwrap());
        Ok(MerkleHash {
            hash,
            depth,
            length,
        })
    }

    /// Parse an interior node's payload as a packed record array.
    pub fn parse_records(data: &[u8]) -> Result<Vec<MerkleHash>> {
        if data.is_empty() || data.len() % MERKLE_RECORD_LEN != 0 {
            return Err(BkError::Integrity(format!(
                "interior node of {} bytes is not a whole record array",
                data.len()
            )));
        }
        data.chunks(MERKLE_RECORD_LEN).map(Self::from_bytes).collect()
    }
}

/// One per-depth accumulator of child records.
struct Level {
    splitter: Splitter,
    buf: Vec<u8>,
    /// Stream bytes covered by the records currently buffered.
    length: u64,
}

impl Level {
    fn new(split_bits: u32) -> Result<Self> {
        Ok(Level {
            splitter: Splitter::new(split_bits)?,
            buf: Vec::new(),
            length: 0,
        })
    }

    fn record_count(&self) -> usize {
        self.buf.len() / MERKLE_RECORD_LEN
    }
}

/// Streaming writer. Feed bytes via `io::Write`, then call
/// [`StreamWriter::finish`] to obtain the root.
pub struct StreamWriter<'a> {
    store: &'a mut PackStore,
    split_bits: u32,
    splitter: Splitter,
    chunk: Vec<u8>,
    levels: Vec<Level>,
    total: u64,
}

impl<'a> StreamWriter<'a> {
    pub fn new(store: &'a mut PackStore, split_bits: u32) -> Result<Self> {
        Ok(StreamWriter {
            store,
            split_bits,
            splitter: Splitter::new(split_bits)?,
            chunk: Vec::new(),
            levels: Vec::new(),
            total: 0,
        })
    }

    pub fn push(&mut self, data: &[u8]) -> Result<()> {
        self.total += data.len() as u64;
        for &byte in data {
            self.chunk.push(byte);
            if self.splitter.roll(byte) {
                self.flush_leaf()?;
            }
        }
        Ok(())
    }

    fn flush_leaf(&mut self) -> Result<()> {
        let chunk = std::mem::take(&mut self.chunk);
        let hash = self.store.write(&chunk)?;
        self.add_record(
            0,
            MerkleHash {
                hash,
                depth: 0,
                length: chunk.len() as u64,
            },
        )
    }

    fn add_record(&mut self, level: usize, record: MerkleHash) -> Result<()> {
        if self.levels.len() == level {
            self.levels.push(Level::new(self.split_bits)?);
        }
        let bytes = record.to_bytes();
        let cut = {
            let lvl = &mut self.levels[level];
            lvl.buf.extend_from_slice(&bytes);
            lvl.length += record.length;
            // The accumulator is itself content-split. A boundary anywhere
            // inside the record closes it at the record's end, keeping
            // interior chunks whole-record aligned.
            let mut cut = false;
            for &b in &bytes {
                cut |= lvl.splitter.roll(b);
            }
            cut
        };
        if cut {
            self.flush_level(level)?;
        }
        Ok(())
    }

    fn flush_level(&mut self, level: usize) -> Result<()> {
        let (buf, length) = {
            let lvl = &mut self.levels[level];
            (std::mem::take(&mut lvl.buf), std::mem::replace(&mut lvl.length, 0))
        };
        let hash = self.store.write(&buf)?;
        self.add_record(
            level + 1,
            MerkleHash {
                hash,
                depth: (level + 1) as u8,
                length,
            },
        )
    }

    /// Close every level bottom-up until one record names the whole stream.
    pub fn finish(mut self) -> Result<MerkleHash> {
        if self.total == 0 {
            let hash = self.store.write(&[])?;
            return Ok(MerkleHash {
                hash,
                depth: 0,
                length: 0,
            });
        }
        if !self.chunk.is_empty() {
            self.flush_leaf()?;
        }

        let mut level = 0;
        loop {
            let is_top = level + 1 == self.levels.len();
            let count = self.levels[level].record_count();
            if is_top && count == 1 {
                let lvl = &self.levels[level];
                return MerkleHash::from_bytes(&lvl.buf);
            }
            if count > 0 {
                self.flush_level(level)?;
            }
            level += 1;
        }
    }
}

impl Write for StreamWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.push(buf).map_err(io::Error::other)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct Frame {
    records: Vec<MerkleHash>,
    next: usize,
}

impl Frame {
    fn new(records: Vec<MerkleHash>) -> Self {
        Frame { records, next: 0 }
    }

    fn next_record(&mut self) -> Option<MerkleHash> {
        let record = self.records.get(self.next).copied();
        if record.is_some() {
            self.next += 1;
        }
        record
    }
}

/// Lazy forward reader over a stream. Yields bytes in order, one pass.
pub struct StreamReader<'a> {
    store: &'a mut PackStore,
    stack: Vec<Frame>,
    current: Vec<u8>,
    pos: usize,
}

impl<'a> StreamReader<'a> {
    pub fn new(store: &'a mut PackStore, root: MerkleHash) -> Self {
        StreamReader {
            store,
            stack: vec![Frame::new(vec![root])],
            current: Vec::new(),
            pos: 0,
        }
    }

    /// Fetch the next leaf chunk, descending through interior nodes.
    fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            let Some(frame) = self.stack.last_mut() else {
                return Ok(None);
            };
            let Some(record) = frame.next_record() else {
                self.stack.pop();
                continue;
            };
            let data = self.store.read(&record.hash)?;
            if record.depth == 0 {
                if data.len() as u64 != record.length {
                    return Err(BkError::Integrity(format!(
                        "leaf chunk {} is {} bytes, record says {}",
                        record.hash,
                        data.len(),
                        record.length
                    )));
                }
                return Ok(Some(data));
            }
            let children = MerkleHash::parse_records(&data)?;
            verify_children(&record, &children)?;
            self.stack.push(Frame::new(children));
        }
    }

    /// Read the entire remaining stream into memory.
    pub fn read_all(mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.current[self.pos..]);
        while let Some(chunk) = self.next_chunk()? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }
}

fn verify_children(parent: &MerkleHash, children: &[MerkleHash]) -> Result<()> {
    let mut sum = 0u64;
    for child in children {
        // Depth bytes come straight from storage; widen so a corrupt 0xFF
        // cannot wrap past the check.
        if u16::from(child.depth) + 1 != u16::from(parent.depth) {
            return Err(BkError::Integrity(format!(
                "node {} at depth {} holds a child at depth {}",
                parent.hash, parent.depth, child.depth
            )));
        }
        sum += child.length;
    }
    if sum != parent.length {
        return Err(BkError::Integrity(format!(
            "node {} claims {} bytes but children cover {}",
            parent.hash, parent.length, sum
        )));
    }
    Ok(())
}

impl Read for StreamReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.current.len() {
            match self.next_chunk().map_err(io::Error::other)? {
                Some(chunk) => {
                    self.current = chunk;
                    self.pos = 0;
                }
                None => return Ok(0),
            }
            // An empty stream stores one empty leaf.
            if self.current.is_empty() {
                return Ok(0);
            }
        }
        let n = (self.current.len() - self.pos).min(buf.len());
        buf[..n].copy_from_slice(&self.current[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// Depth-first traversal asserting every referenced chunk exists and
/// rehashes to its key. Errors are counted on the report; a broken subtree
/// is skipped, not fatal. Returns (chunks visited, stream bytes verified).
pub fn fsck_stream(store: &mut PackStore, root: MerkleHash, report: &Report) -> Result<(u64, u64)> {
    let mut chunks = 0u64;
    let mut bytes = 0u64;
    let mut stack = vec![root];
    while let Some(record) = stack.pop() {
        if !store.contains(&record.hash) {
            report.error(format!("missing chunk {} (depth {})", record.hash, record.depth));
            continue;
        }
        let data = match store.read(&record.hash) {
            Ok(data) => data,
            Err(e) => {
                report.error(format!("unreadable chunk {}: {e}", record.hash));
                continue;
            }
        };
        if Hash::of(&data) != record.hash {
            report.error(format!("chunk {} fails rehash", record.hash));
            continue;
        }
        chunks += 1;
        if record.depth == 0 {
            bytes += data.len() as u64;
            if data.len() as u64 != record.length {
                report.error(format!(
                    "leaf {} length mismatch: {} vs {}",
                    record.hash,
                    data.len(),
                    record.length
                ));
            }
            continue;
        }
        match MerkleHash::parse_records(&data) {
            Ok(children) => {
                if let Err(e) = verify_children(&record, &children) {
                    report.error(e);
                }
                stack.extend(children);
            }
            Err(e) => report.error(format!("node {}: {e}", record.hash)),
        }
    }
    Ok((chunks, bytes))
}
