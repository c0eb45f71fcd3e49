use std::path::Path;

use crate::backup::restore::{BackupReader, RestoreStats};
use crate::error::Result;
use crate::report::Report;
use crate::store::pack::PackStore;

use super::lookup_root;

/// Restore the named snapshot under `dir`.
pub fn run(store: &mut PackStore, name: &str, dir: &Path, report: &Report) -> Result<RestoreStats> {
    let root = lookup_root(store, &format!("backup-{name}"), name)?;
    let stats = BackupReader::new(store, root).restore(dir, report)?;
    store.log_stats();
    Ok(stats)
}
