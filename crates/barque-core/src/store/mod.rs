pub mod compressed;
pub mod encrypted;
pub mod index;
pub mod pack;

use crate::error::Result;

/// One transform layer between the blob pack and raw storage. Layers form a
/// decorator chain ending at [`IdentityLayer`]; each transforms chunk
/// payloads and metadata values on their way down and reverses the transform
/// on the way back up. Content addressing happens above the chain, so a
/// chunk's hash is always over its plaintext no matter which layers are
/// stacked.
pub trait Layer: Send + Sync {
    /// Transform a chunk payload into its storage-layer form.
    fn encode_chunk(&self, plaintext: &[u8]) -> Result<Vec<u8>>;

    /// Recover a chunk's plaintext from its storage-layer form.
    fn decode_chunk(&self, stored: &[u8]) -> Result<Vec<u8>>;

    /// Transform a metadata value before it reaches the backend.
    fn encode_metadata(&self, value: &[u8]) -> Result<Vec<u8>>;

    fn decode_metadata(&self, stored: &[u8]) -> Result<Vec<u8>>;

    fn describe(&self) -> String;
}

/// Terminal layer: stores bytes as given.
pub struct IdentityLayer;

impl Layer for IdentityLayer {
    fn encode_chunk(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        Ok(plaintext.to_vec())
    }

    fn decode_chunk(&self, stored: &[u8]) -> Result<Vec<u8>> {
        Ok(stored.to_vec())
    }

    fn encode_metadata(&self, value: &[u8]) -> Result<Vec<u8>> {
        Ok(value.to_vec())
    }

    fn decode_metadata(&self, stored: &[u8]) -> Result<Vec<u8>> {
        Ok(stored.to_vec())
    }

    fn describe(&self) -> String {
        "raw".to_string()
    }
}
