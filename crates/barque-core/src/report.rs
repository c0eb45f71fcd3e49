use std::fmt::Display;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Error tally and progress counters for one invocation. Passed explicitly
/// into sessions; the process exit code is the error count clipped to a
/// byte.
#[derive(Default)]
pub struct Report {
    errors: AtomicU32,
    bytes_processed: AtomicU64,
}

impl Report {
    pub fn new() -> Self {
        Self::default()
    }

    /// Log an error and count it. The operation keeps going; fsck and
    /// restore surface every problem in one pass.
    pub fn error(&self, msg: impl Display) {
        tracing::error!("{msg}");
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes(&self, n: u64) {
        self.bytes_processed.fetch_add(n, Ordering::Relaxed);
    }

    pub fn bytes_processed(&self) -> u64 {
        self.bytes_processed.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> u32 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Exit status: the error count, clipped to a byte.
    pub fn exit_code(&self) -> u8 {
        self.error_count().min(255) as u8
    }
}

/// Cumulative blob-pack counters, logged after each command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Chunks newly appended to packs.
    pub chunks_stored: u64,
    /// Chunks skipped because their hash was already present.
    pub chunks_deduped: u64,
    /// Plaintext bytes offered to the store.
    pub bytes_ingested: u64,
    /// Plaintext bytes skipped by deduplication.
    pub bytes_deduped: u64,
    /// Storage-layer bytes appended to packs.
    pub bytes_packed: u64,
    /// Pack files closed and written.
    pub packs_written: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_code_clips_to_byte() {
        let report = Report::new();
        assert_eq!(report.exit_code(), 0);
        for _ in 0..300 {
            report.error("boom");
        }
        assert_eq!(report.error_count(), 300);
        assert_eq!(report.exit_code(), 255);
    }

    #[test]
    fn byte_counter_accumulates() {
        let report = Report::new();
        report.add_bytes(10);
        report.add_bytes(32);
        assert_eq!(report.bytes_processed(), 42);
    }
}
