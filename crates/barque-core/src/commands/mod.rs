pub mod backup;
pub mod fsck;
pub mod init;
pub mod list;
pub mod restore;
pub mod restorebits;
pub mod savebits;

use chrono::Utc;

use crate::error::{BkError, Result};
use crate::merkle::MerkleHash;
use crate::store::pack::PackStore;

/// UTC timestamp suffix appended to every snapshot and bitstream name.
pub(crate) fn timestamp_now() -> String {
    Utc::now().format("%Y%m%d-%H%M%S").to_string()
}

/// Resolve a metadata key to the stream root it names.
pub(crate) fn lookup_root(store: &mut PackStore, key: &str, shown_name: &str) -> Result<MerkleHash> {
    if !store.metadata_exists(key)? {
        return Err(BkError::NotFound(shown_name.to_string()));
    }
    let value = store.get_metadata(key)?;
    MerkleHash::from_bytes(&value)
}

/// Refuse to overwrite an existing name: commit is exists-check followed by
/// write, never last-writer-wins.
pub(crate) fn claim_name(store: &mut PackStore, key: &str) -> Result<()> {
    if store.metadata_exists(key)? {
        return Err(BkError::DuplicateName(key.to_string()));
    }
    Ok(())
}
