use std::io::{self, Read};

use tracing::info;

use crate::error::Result;
use crate::merkle::StreamWriter;
use crate::report::Report;
use crate::store::pack::PackStore;

use super::{claim_name, timestamp_now};

/// Save an opaque byte stream as `bits-<name>-<UTC timestamp>`.
/// Returns the full stream name.
pub fn run(
    store: &mut PackStore,
    name: &str,
    split_bits: u32,
    input: &mut dyn Read,
    report: &Report,
) -> Result<String> {
    run_with_timestamp(store, name, &timestamp_now(), split_bits, input, report)
}

pub fn run_with_timestamp(
    store: &mut PackStore,
    name: &str,
    timestamp: &str,
    split_bits: u32,
    input: &mut dyn Read,
    report: &Report,
) -> Result<String> {
    let full_name = format!("{name}-{timestamp}");
    let key = format!("bits-{full_name}");
    claim_name(store, &key)?;

    let mut writer = StreamWriter::new(store, split_bits)?;
    let copied = io::copy(input, &mut writer)?;
    let root = writer.finish()?;
    report.add_bytes(copied);

    store.sync()?;
    claim_name(store, &key)?;
    store.put_metadata(&key, &root.to_bytes())?;
    store.sync()?;

    info!("{full_name}: saved {copied} bytes");
    store.log_stats();
    Ok(full_name)
}
