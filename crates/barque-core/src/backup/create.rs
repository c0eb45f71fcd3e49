use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;

use tracing::{debug, warn};

use crate::backup::entry::{encode_manifest, Entry, EntryKind};
use crate::error::{BkError, Result};
use crate::merkle::{MerkleHash, StreamReader, StreamWriter};
use crate::report::Report;
use crate::store::pack::PackStore;

/// Per-entry stat fields, normalized across platforms.
struct StatSummary {
    mode: u32,
    uid: u32,
    gid: u32,
    mtime_ns: i64,
    size: u64,
}

#[cfg(unix)]
fn stat_summary(meta: &fs::Metadata) -> StatSummary {
    use std::os::unix::fs::MetadataExt;
    StatSummary {
        mode: meta.mode(),
        uid: meta.uid(),
        gid: meta.gid(),
        mtime_ns: meta
            .mtime()
            .saturating_mul(1_000_000_000)
            .saturating_add(meta.mtime_nsec()),
        size: meta.len(),
    }
}

#[cfg(not(unix))]
fn stat_summary(meta: &fs::Metadata) -> StatSummary {
    let mtime_ns = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0);
    StatSummary {
        mode: if meta.is_dir() { 0o755 } else { 0o644 },
        uid: 0,
        gid: 0,
        mtime_ns,
        size: meta.len(),
    }
}

#[cfg(unix)]
fn link_target_bytes(target: &Path) -> Vec<u8> {
    use std::os::unix::ffi::OsStrExt;
    target.as_os_str().as_bytes().to_vec()
}

#[cfg(not(unix))]
fn link_target_bytes(target: &Path) -> Vec<u8> {
    target.to_string_lossy().into_owned().into_bytes()
}

/// `(path, size, mtime) -> body root`, built from a base snapshot's
/// manifests. A matching file's body hash is reused without reading the
/// file; correctness never depends on a hit.
pub struct BaseIndex {
    map: HashMap<String, (u64, i64, MerkleHash)>,
}

impl BaseIndex {
    /// Walk the base snapshot's manifest tree and index its regular files.
    pub fn build(store: &mut PackStore, root: MerkleHash) -> Result<BaseIndex> {
        let mut index = BaseIndex {
            map: HashMap::new(),
        };
        index.walk(store, root, "")?;
        debug!("base index holds {} files", index.map.len());
        Ok(index)
    }

    fn walk(&mut self, store: &mut PackStore, manifest: MerkleHash, prefix: &str) -> Result<()> {
        let bytes = StreamReader::new(store, manifest).read_all()?;
        for entry in crate::backup::entry::parse_manifest(&bytes)? {
            let path = if prefix.is_empty() {
                entry.name.clone()
            } else {
                format!("{prefix}/{}", entry.name)
            };
            match entry.kind {
                EntryKind::File => {
                    self.map
                        .insert(path, (entry.size, entry.mtime_ns, entry.merkle_target()?));
                }
                EntryKind::Dir => self.walk(store, entry.merkle_target()?, &path)?,
                EntryKind::Symlink => {}
            }
        }
        Ok(())
    }

    fn lookup(&self, path: &str, size: u64, mtime_ns: i64) -> Option<MerkleHash> {
        match self.map.get(path) {
            Some(&(base_size, base_mtime, root)) if base_size == size && base_mtime == mtime_ns => {
                Some(root)
            }
            _ => None,
        }
    }
}

/// Counters for one ingest session.
#[derive(Debug, Default, Clone, Copy)]
pub struct BackupStats {
    pub files: u64,
    pub dirs: u64,
    pub symlinks: u64,
    pub bytes_read: u64,
    pub files_reused: u64,
}

/// Recursively back up `dir`, returning the root of its manifest stream.
/// Unreadable entries are reported and skipped; the session keeps going.
pub fn backup_dir(
    store: &mut PackStore,
    dir: &Path,
    split_bits: u32,
    base: Option<&BaseIndex>,
    report: &Report,
) -> Result<(MerkleHash, BackupStats)> {
    if !dir.is_dir() {
        return Err(BkError::User(format!(
            "{}: not a directory",
            dir.display()
        )));
    }
    let mut stats = BackupStats::default();
    let root = ingest_dir(store, dir, "", split_bits, base, report, &mut stats)?;
    Ok((root, stats))
}

fn ingest_dir(
    store: &mut PackStore,
    dir: &Path,
    rel: &str,
    split_bits: u32,
    base: Option<&BaseIndex>,
    report: &Report,
    stats: &mut BackupStats,
) -> Result<MerkleHash> {
    let mut names: Vec<std::ffi::OsString> = Vec::new();
    match fs::read_dir(dir) {
        Ok(iter) => {
            for dirent in iter {
                names.push(dirent?.file_name());
            }
        }
        Err(e) => {
            report.error(format!("{}: {e}", dir.display()));
            return store_manifest(store, &[], split_bits);
        }
    }
    names.sort();

    let mut entries: Vec<Entry> = Vec::with_capacity(names.len());
    for os_name in names {
        let name = match os_name.to_str() {
            Some(name) => name.to_string(),
            None => {
                report.error(format!(
                    "{}: skipping non-UTF-8 name {:?}",
                    dir.display(),
                    os_name
                ));
                continue;
            }
        };
        let path = dir.join(&name);
        let rel_path = if rel.is_empty() {
            name.clone()
        } else {
            format!("{rel}/{name}")
        };

        let meta = match fs::symlink_metadata(&path) {
            Ok(meta) => meta,
            Err(e) => {
                report.error(format!("{}: {e}", path.display()));
                continue;
            }
        };
        let summary = stat_summary(&meta);
        let file_type = meta.file_type();

        let (kind, size, target) = if file_type.is_dir() {
            let child = ingest_dir(store, &path, &rel_path, split_bits, base, report, stats)?;
            stats.dirs += 1;
            (EntryKind::Dir, 0, child.to_bytes().to_vec())
        } else if file_type.is_symlink() {
            let link = match fs::read_link(&path) {
                Ok(link) => link,
                Err(e) => {
                    report.error(format!("{}: {e}", path.display()));
                    continue;
                }
            };
            stats.symlinks += 1;
            // Link text is stored uninterpreted; targets are never followed.
            (EntryKind::Symlink, 0, link_target_bytes(&link))
        } else if file_type.is_file() {
            if let Some(root) = base.and_then(|b| b.lookup(&rel_path, summary.size, summary.mtime_ns))
            {
                stats.files += 1;
                stats.files_reused += 1;
                (EntryKind::File, summary.size, root.to_bytes().to_vec())
            } else {
                let root = match store_file(store, &path, split_bits) {
                    Ok(root) => root,
                    Err(e) => {
                        report.error(format!("{}: {e}", path.display()));
                        continue;
                    }
                };
                debug!("{}: stored {} bytes", path.display(), root.length);
                stats.files += 1;
                stats.bytes_read += root.length;
                report.add_bytes(root.length);
                (EntryKind::File, root.length, root.to_bytes().to_vec())
            }
        } else {
            debug!("{}: skipping special file", path.display());
            continue;
        };

        entries.push(Entry {
            name,
            kind,
            mode: summary.mode,
            uid: summary.uid,
            gid: summary.gid,
            mtime_ns: summary.mtime_ns,
            size,
            target,
        });
    }

    store_manifest(store, &entries, split_bits)
}

fn store_file(store: &mut PackStore, path: &Path, split_bits: u32) -> Result<MerkleHash> {
    let mut file = fs::File::open(path)?;
    let mut writer = StreamWriter::new(store, split_bits)?;
    match io::copy(&mut file, &mut writer) {
        Ok(_) => writer.finish(),
        Err(e) => {
            // Chunks already packed stay as harmless orphans.
            warn!("{}: aborted mid-read: {e}", path.display());
            Err(e.into())
        }
    }
}

fn store_manifest(store: &mut PackStore, entries: &[Entry], split_bits: u32) -> Result<MerkleHash> {
    let bytes = encode_manifest(entries);
    let mut writer = StreamWriter::new(store, split_bits)?;
    writer.push(&bytes)?;
    writer.finish()
}
