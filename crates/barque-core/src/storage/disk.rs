use std::collections::BTreeMap;
use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{BkError, Result};
use crate::storage::{validate_name, Backend, TransferStats};
use crate::store::index::PackId;

/// Local-directory backend. Pack blobs live under `blobs/<xx>/` where `xx`
/// is the first byte of the pack id as two hex characters; metadata lives
/// flat under `meta/`.
pub struct DiskBackend {
    root: PathBuf,
    bytes_up: AtomicU64,
    bytes_down: AtomicU64,
    write_ops: AtomicU64,
    read_ops: AtomicU64,
}

impl DiskBackend {
    pub fn new(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)?;
        let root = fs::canonicalize(root)?;
        Ok(DiskBackend {
            root,
            bytes_up: AtomicU64::new(0),
            bytes_down: AtomicU64::new(0),
            write_ops: AtomicU64::new(0),
            read_ops: AtomicU64::new(0),
        })
    }

    /// Two-character shard directory: the first raw byte of the pack id.
    /// Blobs whose names don't carry a pack id land in a catch-all shard.
    fn shard(name: &str) -> String {
        match PackId::from_name(name) {
            Ok(pack) => pack.shard_prefix(),
            Err(_) => "00".to_string(),
        }
    }

    fn blob_path(&self, name: &str) -> Result<PathBuf> {
        validate_name(name)?;
        Ok(self.root.join("blobs").join(Self::shard(name)).join(name))
    }

    fn meta_path(&self, key: &str) -> Result<PathBuf> {
        validate_name(key)?;
        Ok(self.root.join("meta").join(key))
    }

    /// Write via a temporary sibling and rename, fsyncing the data first, so
    /// a crash never leaves a half-written object under its final name.
    fn write_atomic(&self, path: &Path, data: &[u8]) -> Result<()> {
        let parent = path
            .parent()
            .ok_or_else(|| BkError::IoFatal(format!("no parent for {}", path.display())))?;
        fs::create_dir_all(parent)?;
        let file_name = path
            .file_name()
            .ok_or_else(|| BkError::IoFatal(format!("no file name in {}", path.display())))?;
        let mut tmp_name = file_name.to_os_string();
        tmp_name.push(".tmp");
        let tmp = parent.join(tmp_name);
        let mut file = fs::File::create(&tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp, path)?;
        self.bytes_up.fetch_add(data.len() as u64, Ordering::Relaxed);
        self.write_ops.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn read_whole(&self, path: &Path, what: &str) -> Result<Vec<u8>> {
        match fs::read(path) {
            Ok(data) => {
                self.bytes_down
                    .fetch_add(data.len() as u64, Ordering::Relaxed);
                self.read_ops.fetch_add(1, Ordering::Relaxed);
                Ok(data)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(BkError::NotFound(what.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl Backend for DiskBackend {
    fn write_blob(&self, name: &str, data: &[u8]) -> Result<()> {
        self.write_atomic(&self.blob_path(name)?, data)
    }

    fn read_blob(&self, name: &str) -> Result<Vec<u8>> {
        self.read_whole(&self.blob_path(name)?, name)
    }

    fn read_blob_range(&self, name: &str, offset: u64, len: u64) -> Result<Vec<u8>> {
        let path = self.blob_path(name)?;
        let mut file = match fs::File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BkError::NotFound(name.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len as usize];
        file.read_exact(&mut buf).map_err(|_| {
            BkError::Integrity(format!(
                "short read in blob '{name}' at offset {offset} (wanted {len} bytes)"
            ))
        })?;
        self.bytes_down.fetch_add(len, Ordering::Relaxed);
        self.read_ops.fetch_add(1, Ordering::Relaxed);
        Ok(buf)
    }

    fn blob_exists(&self, name: &str) -> Result<bool> {
        Ok(self.blob_path(name)?.is_file())
    }

    fn list_blobs(&self, prefix: &str) -> Result<Vec<(String, u64)>> {
        let blobs_dir = self.root.join("blobs");
        let mut out = Vec::new();
        let shards = match fs::read_dir(&blobs_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        for shard in shards {
            let shard = shard?;
            if !shard.file_type()?.is_dir() {
                continue;
            }
            for entry in fs::read_dir(shard.path())? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.starts_with(prefix) && !name.ends_with(".tmp") {
                    out.push((name, entry.metadata()?.len()));
                }
            }
        }
        out.sort();
        Ok(out)
    }

    fn write_metadata(&self, key: &str, data: &[u8]) -> Result<()> {
        self.write_atomic(&self.meta_path(key)?, data)
    }

    fn read_metadata(&self, key: &str) -> Result<Vec<u8>> {
        self.read_whole(&self.meta_path(key)?, key)
    }

    fn metadata_exists(&self, key: &str) -> Result<bool> {
        Ok(self.meta_path(key)?.is_file())
    }

    fn list_metadata(&self) -> Result<BTreeMap<String, u64>> {
        let meta_dir = self.root.join("meta");
        let mut out = BTreeMap::new();
        let entries = match fs::read_dir(&meta_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                let name = entry.file_name().to_string_lossy().into_owned();
                if !name.ends_with(".tmp") {
                    out.insert(name, entry.metadata()?.len());
                }
            }
        }
        Ok(out)
    }

    fn sync(&self) -> Result<()> {
        // Individual writes already fsync before rename.
        Ok(())
    }

    fn fsck(&self) -> Result<()> {
        // Confirm every listed blob opens and has a plausible size.
        for (name, size) in self.list_blobs("")? {
            let path = self.blob_path(&name)?;
            let meta = fs::metadata(&path)?;
            if meta.len() != size {
                return Err(BkError::Integrity(format!(
                    "blob '{name}' changed size during fsck"
                )));
            }
        }
        Ok(())
    }

    fn stats(&self) -> TransferStats {
        TransferStats {
            bytes_up: self.bytes_up.load(Ordering::Relaxed),
            bytes_down: self.bytes_down.load(Ordering::Relaxed),
            write_ops: self.write_ops.load(Ordering::Relaxed),
            read_ops: self.read_ops.load(Ordering::Relaxed),
        }
    }

    fn describe(&self) -> String {
        format!("disk:{}", self.root.display())
    }
}
