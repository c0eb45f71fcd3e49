use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::Path;

use tracing::{info, warn};

use crate::backup::entry::{parse_manifest, Entry, EntryKind};
use crate::error::{BkError, Result};
use crate::hash::Hash;
use crate::merkle::{self, MerkleHash, StreamReader};
use crate::report::Report;
use crate::store::pack::PackStore;

#[derive(Debug, Default, Clone, Copy)]
pub struct RestoreStats {
    pub files: u64,
    pub dirs: u64,
    pub symlinks: u64,
    pub bytes_written: u64,
}

/// Reads a snapshot's manifest graph for restore and integrity checking.
pub struct BackupReader<'a> {
    store: &'a mut PackStore,
    root: MerkleHash,
}

impl<'a> BackupReader<'a> {
    pub fn new(store: &'a mut PackStore, root: MerkleHash) -> Self {
        BackupReader { store, root }
    }

    /// Recreate the snapshot under `target`, which must be empty or absent.
    /// Ownership, permissions, and mtimes are applied best-effort; denials
    /// are logged, not fatal.
    pub fn restore(&mut self, target: &Path, report: &Report) -> Result<RestoreStats> {
        if target.exists() {
            let mut children = fs::read_dir(target)?;
            if children.next().is_some() {
                return Err(BkError::TargetExists(target.to_path_buf()));
            }
        } else {
            fs::create_dir_all(target)?;
        }

        let mut stats = RestoreStats::default();
        let root = self.root;
        self.restore_dir(root, target, report, &mut stats)?;
        info!(
            "restored {} files, {} dirs, {} symlinks ({} bytes)",
            stats.files, stats.dirs, stats.symlinks, stats.bytes_written
        );
        Ok(stats)
    }

    fn restore_dir(
        &mut self,
        manifest: MerkleHash,
        dir: &Path,
        report: &Report,
        stats: &mut RestoreStats,
    ) -> Result<()> {
        let bytes = StreamReader::new(self.store, manifest).read_all()?;
        for entry in parse_manifest(&bytes)? {
            let path = dir.join(&entry.name);
            match entry.kind {
                EntryKind::Dir => {
                    fs::create_dir_all(&path)?;
                    self.restore_dir(entry.merkle_target()?, &path, report, stats)?;
                    stats.dirs += 1;
                    // Applied after children so their writes don't bump it.
                    apply_entry_metadata(&path, &entry);
                }
                EntryKind::File => {
                    let root = entry.merkle_target()?;
                    let mut reader = StreamReader::new(self.store, root);
                    let mut file = fs::File::create(&path)?;
                    let written = io::copy(&mut reader, &mut file).map_err(unwrap_stream_err)?;
                    drop(file);
                    if written != root.length {
                        report.error(format!(
                            "{}: wrote {written} bytes, stream names {}",
                            path.display(),
                            root.length
                        ));
                    }
                    stats.files += 1;
                    stats.bytes_written += written;
                    report.add_bytes(written);
                    apply_entry_metadata(&path, &entry);
                }
                EntryKind::Symlink => {
                    restore_symlink(&path, &entry, report)?;
                    stats.symlinks += 1;
                }
            }
        }
        Ok(())
    }

    /// Verify every manifest and file body reachable from the root. Shared
    /// subtrees are verified once. Returns (chunks checked, bytes verified).
    pub fn fsck(&mut self, report: &Report) -> Result<(u64, u64)> {
        let mut seen: HashSet<Hash> = HashSet::new();
        let mut chunks = 0u64;
        let mut bytes = 0u64;
        let root = self.root;
        self.fsck_dir(root, &mut seen, report, &mut chunks, &mut bytes)?;
        Ok((chunks, bytes))
    }

    fn fsck_dir(
        &mut self,
        manifest: MerkleHash,
        seen: &mut HashSet<Hash>,
        report: &Report,
        chunks: &mut u64,
        bytes: &mut u64,
    ) -> Result<()> {
        if !seen.insert(manifest.hash) {
            return Ok(());
        }
        let (c, b) = merkle::fsck_stream(self.store, manifest, report)?;
        *chunks += c;
        *bytes += b;

        let manifest_bytes = match StreamReader::new(self.store, manifest).read_all() {
            Ok(bytes) => bytes,
            Err(e) => {
                report.error(format!("manifest {}: {e}", manifest.hash));
                return Ok(());
            }
        };
        let entries = match parse_manifest(&manifest_bytes) {
            Ok(entries) => entries,
            Err(e) => {
                report.error(format!("manifest {}: {e}", manifest.hash));
                return Ok(());
            }
        };
        for entry in entries {
            match entry.kind {
                EntryKind::Dir => {
                    match entry.merkle_target() {
                        Ok(child) => self.fsck_dir(child, seen, report, chunks, bytes)?,
                        Err(e) => report.error(format!("entry '{}': {e}", entry.name)),
                    }
                }
                EntryKind::File => match entry.merkle_target() {
                    Ok(body) => {
                        if seen.insert(body.hash) {
                            let (c, b) = merkle::fsck_stream(self.store, body, report)?;
                            *chunks += c;
                            *bytes += b;
                        }
                    }
                    Err(e) => report.error(format!("entry '{}': {e}", entry.name)),
                },
                EntryKind::Symlink => {}
            }
        }
        Ok(())
    }
}

/// io::copy wraps stream errors; recover the original error text.
fn unwrap_stream_err(e: io::Error) -> BkError {
    match e.get_ref() {
        Some(inner) => BkError::Integrity(inner.to_string()),
        None => e.into(),
    }
}

#[cfg(unix)]
fn restore_symlink(path: &Path, entry: &Entry, report: &Report) -> Result<()> {
    let target = match entry.link_target() {
        Ok(target) => target,
        Err(e) => {
            report.error(e);
            return Ok(());
        }
    };
    std::os::unix::fs::symlink(target, path)?;
    if let Err(e) = std::os::unix::fs::lchown(path, Some(entry.uid), Some(entry.gid)) {
        warn!("{}: chown: {e}", path.display());
    }
    Ok(())
}

#[cfg(not(unix))]
fn restore_symlink(path: &Path, entry: &Entry, report: &Report) -> Result<()> {
    let _ = entry;
    report.error(format!(
        "{}: symlinks are not supported on this platform",
        path.display()
    ));
    Ok(())
}

/// Apply mode, ownership, and mtime. Best-effort: a non-root restore
/// cannot chown, and that must not fail the session.
fn apply_entry_metadata(path: &Path, entry: &Entry) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(entry.mode & 0o7777)) {
            warn!("{}: chmod: {e}", path.display());
        }
        if let Err(e) = std::os::unix::fs::chown(path, Some(entry.uid), Some(entry.gid)) {
            warn!("{}: chown: {e}", path.display());
        }
    }
    let secs = entry.mtime_ns.div_euclid(1_000_000_000);
    let nanos = entry.mtime_ns.rem_euclid(1_000_000_000) as u32;
    let mtime = filetime::FileTime::from_unix_time(secs, nanos);
    if let Err(e) = filetime::set_file_mtime(path, mtime) {
        warn!("{}: set mtime: {e}", path.display());
    }
}
