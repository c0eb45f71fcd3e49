use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use crate::error::{BkError, Result};
use crate::storage::{Backend, TransferStats};
use crate::store::pack::PackStore;
use crate::store::IdentityLayer;

#[derive(Default)]
struct Inner {
    blobs: HashMap<String, Vec<u8>>,
    meta: BTreeMap<String, Vec<u8>>,
}

/// In-memory storage backend for tests. Clones share the same state, so a
/// "reopened" store sees what an earlier one wrote.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Alias making shared-state intent explicit at call sites.
    pub fn shared() -> Self {
        Self::default()
    }

    pub fn blob_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.lock().unwrap().blobs.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn metadata_keys(&self) -> Vec<String> {
        self.inner.lock().unwrap().meta.keys().cloned().collect()
    }

    pub fn remove_metadata(&self, key: &str) {
        self.inner.lock().unwrap().meta.remove(key);
    }

    /// Corrupt one byte of a stored blob (for fsck tests).
    pub fn flip_blob_byte(&self, name: &str, index: usize) {
        let mut inner = self.inner.lock().unwrap();
        let blob = inner.blobs.get_mut(name).expect("blob exists");
        blob[index] ^= 0xff;
    }
}

impl Backend for MemoryBackend {
    fn write_blob(&self, name: &str, data: &[u8]) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .blobs
            .insert(name.to_string(), data.to_vec());
        Ok(())
    }

    fn read_blob(&self, name: &str) -> Result<Vec<u8>> {
        self.inner
            .lock()
            .unwrap()
            .blobs
            .get(name)
            .cloned()
            .ok_or_else(|| BkError::NotFound(name.to_string()))
    }

    fn read_blob_range(&self, name: &str, offset: u64, len: u64) -> Result<Vec<u8>> {
        let inner = self.inner.lock().unwrap();
        let blob = inner
            .blobs
            .get(name)
            .ok_or_else(|| BkError::NotFound(name.to_string()))?;
        let start = offset as usize;
        let end = start + len as usize;
        if end > blob.len() {
            return Err(BkError::Integrity(format!(
                "short read in blob '{name}' at offset {offset}"
            )));
        }
        Ok(blob[start..end].to_vec())
    }

    fn blob_exists(&self, name: &str) -> Result<bool> {
        Ok(self.inner.lock().unwrap().blobs.contains_key(name))
    }

    fn list_blobs(&self, prefix: &str) -> Result<Vec<(String, u64)>> {
        let inner = self.inner.lock().unwrap();
        let mut out: Vec<(String, u64)> = inner
            .blobs
            .iter()
            .filter(|(name, _)| name.starts_with(prefix))
            .map(|(name, data)| (name.clone(), data.len() as u64))
            .collect();
        out.sort();
        Ok(out)
    }

    fn write_metadata(&self, key: &str, data: &[u8]) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .meta
            .insert(key.to_string(), data.to_vec());
        Ok(())
    }

    fn read_metadata(&self, key: &str) -> Result<Vec<u8>> {
        self.inner
            .lock()
            .unwrap()
            .meta
            .get(key)
            .cloned()
            .ok_or_else(|| BkError::NotFound(key.to_string()))
    }

    fn metadata_exists(&self, key: &str) -> Result<bool> {
        Ok(self.inner.lock().unwrap().meta.contains_key(key))
    }

    fn list_metadata(&self) -> Result<BTreeMap<String, u64>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .meta
            .iter()
            .map(|(k, v)| (k.clone(), v.len() as u64))
            .collect())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }

    fn stats(&self) -> TransferStats {
        TransferStats::default()
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

/// A pack store over a fresh in-memory backend with no transform layers.
pub fn mem_store() -> PackStore {
    PackStore::open(Box::new(MemoryBackend::new()), Box::new(IdentityLayer)).unwrap()
}
