use std::io::{self, Write};

use crate::error::{BkError, Result};
use crate::merkle::StreamReader;
use crate::store::pack::PackStore;

use super::lookup_root;

/// Write the named bitstream to `output`. Returns the byte count.
pub fn run(store: &mut PackStore, name: &str, output: &mut dyn Write) -> Result<u64> {
    let root = lookup_root(store, &format!("bits-{name}"), name)?;
    let mut reader = StreamReader::new(store, root);
    let copied = io::copy(&mut reader, output).map_err(|e| match e.get_ref() {
        Some(inner) => BkError::Integrity(inner.to_string()),
        None => BkError::Io(e),
    })?;
    if copied != root.length {
        return Err(BkError::Integrity(format!(
            "stream '{name}' yielded {copied} bytes, root names {}",
            root.length
        )));
    }
    store.log_stats();
    Ok(copied)
}
