//! Manifest records.
//!
//! A manifest is a name-sorted sequence of entries, each wrapped in a
//! length-prefixed envelope:
//!
//! `record_len(varint) | name_len(varint) | name | kind(1) | mode(varint) |
//!  uid(varint) | gid(varint) | mtime(fixed64 nanos) | size(varint) |
//!  target_len(varint) | target`
//!
//! Bytes past the target inside an envelope belong to future fields and are
//! skipped on decode.

use std::io::Read;

use crate::error::{BkError, Result};
use crate::merkle::MerkleHash;
use crate::wire;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
    Symlink,
}

impl EntryKind {
    fn to_u8(self) -> u8 {
        match self {
            EntryKind::File => 0,
            EntryKind::Dir => 1,
            EntryKind::Symlink => 2,
        }
    }

    fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(EntryKind::File),
            1 => Ok(EntryKind::Dir),
            2 => Ok(EntryKind::Symlink),
            other => Err(BkError::Integrity(format!("unknown entry kind {other}"))),
        }
    }
}

/// One directory entry. For files and directories `target` is a serialized
/// [`MerkleHash`]; for symlinks it is the literal link text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub name: String,
    pub kind: EntryKind,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime_ns: i64,
    pub size: u64,
    pub target: Vec<u8>,
}

impl Entry {
    /// Append the enveloped record to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        let mut body = Vec::with_capacity(self.name.len() + self.target.len() + 32);
        wire::put_uvarint(&mut body, self.name.len() as u64);
        body.extend_from_slice(self.name.as_bytes());
        body.push(self.kind.to_u8());
        wire::put_uvarint(&mut body, u64::from(self.mode));
        wire::put_uvarint(&mut body, u64::from(self.uid));
        wire::put_uvarint(&mut body, u64::from(self.gid));
        wire::put_fixed64(&mut body, self.mtime_ns as u64);
        wire::put_uvarint(&mut body, self.size);
        wire::put_uvarint(&mut body, self.target.len() as u64);
        body.extend_from_slice(&self.target);

        wire::put_uvarint(out, body.len() as u64);
        out.extend_from_slice(&body);
    }

    /// Decode one enveloped record. Returns `None` at a clean end of input.
    pub fn decode<R: Read>(reader: &mut R) -> Result<Option<Entry>> {
        // Distinguish "no more records" from a record torn mid-envelope.
        let mut first = [0u8; 1];
        match reader.read(&mut first)? {
            0 => return Ok(None),
            _ => {}
        }
        let record_len = if first[0] & 0x80 == 0 {
            u64::from(first[0])
        } else {
            let mut value = u64::from(first[0] & 0x7f);
            let mut shift = 7u32;
            loop {
                let mut byte = [0u8; 1];
                reader.read_exact(&mut byte)?;
                if shift >= 64 {
                    return Err(BkError::Integrity("record envelope varint overflow".into()));
                }
                value |= u64::from(byte[0] & 0x7f) << shift;
                if byte[0] & 0x80 == 0 {
                    break value;
                }
                shift += 7;
            }
        };

        if record_len > 1024 * 1024 {
            return Err(BkError::Integrity(format!(
                "manifest record of {record_len} bytes is implausible"
            )));
        }
        let mut body = vec![0u8; record_len as usize];
        reader.read_exact(&mut body)?;
        Self::decode_body(&body).map(Some)
    }

    fn decode_body(mut buf: &[u8]) -> Result<Entry> {
        let (name_len, n) = wire::get_uvarint(buf)?;
        buf = &buf[n..];
        let name_len = name_len as usize;
        if buf.len() < name_len + 1 {
            return Err(BkError::Integrity("manifest record torn in name".into()));
        }
        let name = std::str::from_utf8(&buf[..name_len])
            .map_err(|_| BkError::Integrity("manifest entry name is not UTF-8".into()))?
            .to_string();
        validate_entry_name(&name)?;
        buf = &buf[name_len..];

        let kind = EntryKind::from_u8(buf[0])?;
        buf = &buf[1..];
        let (mode, n) = wire::get_uvarint(buf)?;
        buf = &buf[n..];
        let (uid, n) = wire::get_uvarint(buf)?;
        buf = &buf[n..];
        let (gid, n) = wire::get_uvarint(buf)?;
        buf = &buf[n..];
        let mtime_ns = wire::get_fixed64(buf)? as i64;
        buf = &buf[8..];
        let (size, n) = wire::get_uvarint(buf)?;
        buf = &buf[n..];
        let (target_len, n) = wire::get_uvarint(buf)?;
        buf = &buf[n..];
        if buf.len() < target_len as usize {
            return Err(BkError::Integrity("manifest record torn in target".into()));
        }
        let target = buf[..target_len as usize].to_vec();
        // Any remaining bytes are future fields: skipped.

        Ok(Entry {
            name,
            kind,
            mode: mode as u32,
            uid: uid as u32,
            gid: gid as u32,
            mtime_ns,
            size,
            target,
        })
    }

    /// Interpret the target as a stream root (files and directories).
    pub fn merkle_target(&self) -> Result<MerkleHash> {
        MerkleHash::from_bytes(&self.target)
    }

    /// Interpret the target as symlink text.
    pub fn link_target(&self) -> Result<&str> {
        std::str::from_utf8(&self.target)
            .map_err(|_| BkError::Integrity(format!("symlink target of '{}' is not UTF-8", self.name)))
    }
}

/// A manifest entry names exactly one child: path separators, `.`/`..`, and
/// empty names never appear and are refused on decode.
fn validate_entry_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." {
        return Err(BkError::Integrity(format!("bad entry name '{name}'")));
    }
    if name.contains('/') || name.contains('\0') {
        return Err(BkError::Integrity(format!("bad entry name '{name}'")));
    }
    Ok(())
}

/// Serialize a name-sorted entry slice.
pub fn encode_manifest(entries: &[Entry]) -> Vec<u8> {
    debug_assert!(entries.windows(2).all(|w| w[0].name < w[1].name));
    let mut out = Vec::new();
    for entry in entries {
        entry.encode(&mut out);
    }
    out
}

/// Parse a whole manifest back into entries.
pub fn parse_manifest(bytes: &[u8]) -> Result<Vec<Entry>> {
    let mut cursor = std::io::Cursor::new(bytes);
    let mut entries = Vec::new();
    while let Some(entry) = Entry::decode(&mut cursor)? {
        entries.push(entry);
    }
    Ok(entries)
}
