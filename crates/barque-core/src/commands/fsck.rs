use tracing::{debug, info};

use crate::backup::restore::BackupReader;
use crate::error::Result;
use crate::merkle::{self, MerkleHash};
use crate::report::Report;
use crate::store::pack::PackStore;

#[derive(Debug, Default, Clone, Copy)]
pub struct FsckTotals {
    pub names_checked: u64,
    pub chunks_checked: u64,
    pub bytes_verified: u64,
}

/// Integrity-check the whole repository: walk the hash graph under every
/// `backup-*` and `bits-*` name, then let the blob layer verify every
/// indexed chunk. Errors accumulate on the report so one pass surfaces all
/// problems.
pub fn run(store: &mut PackStore, report: &Report) -> Result<FsckTotals> {
    let mut totals = FsckTotals::default();

    for key in store.list_metadata()?.into_keys() {
        let is_backup = key.starts_with("backup-");
        let is_bits = key.starts_with("bits-");
        if !is_backup && !is_bits {
            continue;
        }
        debug!("checking {key}");
        totals.names_checked += 1;

        let root = match store
            .get_metadata(&key)
            .and_then(|value| MerkleHash::from_bytes(&value))
        {
            Ok(root) => root,
            Err(e) => {
                report.error(format!("{key}: {e}"));
                continue;
            }
        };

        let walked = if is_backup {
            BackupReader::new(store, root).fsck(report)
        } else {
            merkle::fsck_stream(store, root, report)
        };
        match walked {
            Ok((chunks, bytes)) => {
                totals.chunks_checked += chunks;
                totals.bytes_verified += bytes;
            }
            Err(e) => report.error(format!("{key}: {e}")),
        }
    }

    // Blob-layer self check: every indexed chunk fetched and rehashed.
    let summary = store.fsck(report)?;
    totals.chunks_checked += summary.chunks_checked;
    totals.bytes_verified += summary.bytes_verified;

    info!(
        "fsck: {} names, {} chunks, {} bytes verified, {} errors",
        totals.names_checked,
        totals.chunks_checked,
        totals.bytes_verified,
        report.error_count()
    );
    store.log_stats();
    Ok(totals)
}
