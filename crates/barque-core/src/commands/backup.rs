use std::path::Path;

use tracing::info;

use crate::backup::create::{backup_dir, BackupStats, BaseIndex};
use crate::error::Result;
use crate::report::Report;
use crate::store::pack::PackStore;

use super::{claim_name, lookup_root, timestamp_now};

/// Create a snapshot of `dir` named `backup-<name>-<UTC timestamp>`.
/// Returns the full snapshot name.
pub fn run(
    store: &mut PackStore,
    name: &str,
    dir: &Path,
    split_bits: u32,
    base: Option<&str>,
    report: &Report,
) -> Result<String> {
    run_with_timestamp(store, name, &timestamp_now(), dir, split_bits, base, report)
}

pub fn run_with_timestamp(
    store: &mut PackStore,
    name: &str,
    timestamp: &str,
    dir: &Path,
    split_bits: u32,
    base: Option<&str>,
    report: &Report,
) -> Result<String> {
    let full_name = format!("{name}-{timestamp}");
    let key = format!("backup-{full_name}");
    claim_name(store, &key)?;

    let base_index = match base {
        Some(base_name) => {
            let base_root = lookup_root(store, &format!("backup-{base_name}"), base_name)?;
            Some(BaseIndex::build(store, base_root)?)
        }
        None => None,
    };

    let (root, stats) = backup_dir(store, dir, split_bits, base_index.as_ref(), report)?;

    // Commit sequence: every referenced chunk and pack index is durable
    // before the name becomes observable.
    store.sync()?;
    claim_name(store, &key)?;
    store.put_metadata(&key, &root.to_bytes())?;
    store.sync()?;

    log_backup(&full_name, &stats);
    store.log_stats();
    Ok(full_name)
}

fn log_backup(full_name: &str, stats: &BackupStats) {
    info!(
        "{full_name}: saved {} files ({} reused from base), {} dirs, {} symlinks, {} bytes read",
        stats.files, stats.files_reused, stats.dirs, stats.symlinks, stats.bytes_read
    );
}
