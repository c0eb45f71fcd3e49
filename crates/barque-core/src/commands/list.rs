use crate::error::Result;
use crate::store::pack::PackStore;

/// Snapshot and bitstream names, grouped by kind, sorted, with their
/// namespace prefixes stripped.
#[derive(Debug, Default)]
pub struct Listing {
    pub backups: Vec<String>,
    pub bits: Vec<String>,
}

pub fn run(store: &mut PackStore) -> Result<Listing> {
    let mut listing = Listing::default();
    for key in store.list_metadata()?.into_keys() {
        if let Some(name) = key.strip_prefix("backup-") {
            listing.backups.push(name.to_string());
        } else if let Some(name) = key.strip_prefix("bits-") {
            listing.bits.push(name.to_string());
        }
        // packidx-*, readme_bk.txt, encrypt.txt are repository internals.
    }
    listing.backups.sort();
    listing.bits.sort();
    Ok(listing)
}
