use tracing::info;

use crate::config::{build_layer, ENCRYPT_KEY, README_KEY, README_TEXT};
use crate::error::{BkError, Result};
use crate::storage::Backend;
use crate::store::encrypted::KdfParams;
use crate::store::pack::PackStore;

/// Initialize a repository. Writes `readme_bk.txt`, and with `encrypt` also
/// `encrypt.txt` holding the KDF salt and parameters. A repository is
/// initialized exactly once.
pub fn run(backend: Box<dyn Backend>, encrypt: bool, passphrase: Option<&str>) -> Result<()> {
    if backend.metadata_exists(README_KEY)? {
        return Err(BkError::User(format!(
            "{}: already initialized",
            backend.describe()
        )));
    }

    if encrypt {
        let passphrase = passphrase.ok_or_else(|| {
            BkError::Config("BK_PASSPHRASE environment variable not set".into())
        })?;
        if passphrase.is_empty() {
            return Err(BkError::Config("passphrase must not be empty".into()));
        }
        let params = KdfParams::generate();
        // Written below the encryption layer: the salt must be readable
        // before any key can be derived.
        backend.write_metadata(ENCRYPT_KEY, &params.to_bytes()?)?;
    }

    let description = backend.describe();
    let layer = build_layer(backend.as_ref(), passphrase)?;
    let mut store = PackStore::open(backend, layer)?;
    store.put_metadata(README_KEY, README_TEXT.as_bytes())?;
    store.sync()?;
    info!("initialized repository at {description}");
    Ok(())
}
