//! Environment-driven repository resolution and layer-stack construction.

use tracing::debug;

use crate::error::{BkError, Result};
use crate::storage::disk::DiskBackend;
use crate::storage::object::{ObjectStoreBackend, ObjectStoreOptions};
use crate::storage::retry::RetryConfig;
use crate::storage::Backend;
use crate::store::compressed::CompressedLayer;
use crate::store::encrypted::{EncryptedLayer, KdfParams};
use crate::store::pack::PackStore;
use crate::store::{IdentityLayer, Layer};

pub const ENV_DIR: &str = "BK_DIR";
pub const ENV_GCS_PROJECT_ID: &str = "BK_GCS_PROJECT_ID";
pub const ENV_GCS_TOKEN: &str = "BK_GCS_TOKEN";
pub const ENV_PASSPHRASE: &str = "BK_PASSPHRASE";

/// Marks an initialized repository.
pub const README_KEY: &str = "readme_bk.txt";
/// Holds the KDF salt and parameters of an encrypted repository.
pub const ENCRYPT_KEY: &str = "encrypt.txt";

/// Default transfer throttles for the object-store backend.
const DEFAULT_UPLOAD_BPS: u64 = 900 * 1024;
const DEFAULT_DOWNLOAD_BPS: u64 = 5 * 1024 * 1024;

pub const README_TEXT: &str = "\
This directory holds a barque backup repository: pack files of
content-addressed, deduplicated chunks plus a metadata namespace of named
snapshot roots. Do not modify or remove files here by hand; use the barque
tool to access the backups.
";

fn required_env(name: &str) -> Result<String> {
    match std::env::var(name) {
        Ok(value) if !value.is_empty() => Ok(value),
        _ => Err(BkError::Config(format!(
            "{name} environment variable not set"
        ))),
    }
}

/// The raw backend named by `BK_DIR`: a `gs://bucket` object store or a
/// local directory.
pub fn base_backend() -> Result<Box<dyn Backend>> {
    let dir = required_env(ENV_DIR)?;
    if let Some(bucket) = dir.strip_prefix("gs://") {
        let project_id = required_env(ENV_GCS_PROJECT_ID)?;
        let access_token = std::env::var(ENV_GCS_TOKEN).ok().filter(|t| !t.is_empty());
        Ok(Box::new(ObjectStoreBackend::new(ObjectStoreOptions {
            bucket: bucket.trim_end_matches('/').to_string(),
            project_id,
            access_token,
            max_upload_bytes_per_second: DEFAULT_UPLOAD_BPS,
            max_download_bytes_per_second: DEFAULT_DOWNLOAD_BPS,
            retry: RetryConfig::default(),
        })))
    } else {
        Ok(Box::new(DiskBackend::new(std::path::Path::new(&dir))?))
    }
}

pub fn passphrase() -> Result<String> {
    required_env(ENV_PASSPHRASE)
}

/// Stack the transform layers the repository's markers call for:
/// compression always, encryption iff `encrypt.txt` exists. The passphrase
/// is only consulted (and required) for an encrypted repository.
pub fn build_layer(backend: &dyn Backend, passphrase: Option<&str>) -> Result<Box<dyn Layer>> {
    let mut layer: Box<dyn Layer> = Box::new(IdentityLayer);
    if backend.metadata_exists(ENCRYPT_KEY)? {
        let params = KdfParams::from_bytes(&backend.read_metadata(ENCRYPT_KEY)?)?;
        let passphrase = passphrase.ok_or_else(|| {
            BkError::Config(format!("{ENV_PASSPHRASE} environment variable not set"))
        })?;
        layer = Box::new(EncryptedLayer::new(layer, passphrase, &params)?);
    }
    Ok(Box::new(CompressedLayer::new(layer)))
}

/// Open the repository for an operation: backend, layers, chunk index.
/// Fails with a configuration error when the repository was never
/// initialized.
pub fn open_store() -> Result<PackStore> {
    let backend = base_backend()?;
    if !backend.metadata_exists(README_KEY)? {
        return Err(BkError::Uninitialized(backend.describe()));
    }
    let passphrase = if backend.metadata_exists(ENCRYPT_KEY)? {
        Some(passphrase()?)
    } else {
        None
    };
    let layer = build_layer(backend.as_ref(), passphrase.as_deref())?;
    let store = PackStore::open(backend, layer)?;
    debug!("opened {}", store.describe());
    Ok(store)
}
