use crate::compress::{self, Codec};
use crate::error::Result;
use crate::store::Layer;

/// Transparent per-payload compression. Sits above the encryption layer so
/// that compression sees plaintext (ciphertext does not compress).
pub struct CompressedLayer {
    inner: Box<dyn Layer>,
    codec: Codec,
}

impl CompressedLayer {
    pub fn new(inner: Box<dyn Layer>) -> Self {
        CompressedLayer {
            inner,
            codec: Codec::default(),
        }
    }

    pub fn with_codec(inner: Box<dyn Layer>, codec: Codec) -> Self {
        CompressedLayer { inner, codec }
    }
}

impl Layer for CompressedLayer {
    fn encode_chunk(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let compressed = compress::encode(self.codec, plaintext)?;
        self.inner.encode_chunk(&compressed)
    }

    fn decode_chunk(&self, stored: &[u8]) -> Result<Vec<u8>> {
        let compressed = self.inner.decode_chunk(stored)?;
        compress::decode(&compressed)
    }

    fn encode_metadata(&self, value: &[u8]) -> Result<Vec<u8>> {
        let compressed = compress::encode(self.codec, value)?;
        self.inner.encode_metadata(&compressed)
    }

    fn decode_metadata(&self, stored: &[u8]) -> Result<Vec<u8>> {
        let compressed = self.inner.decode_metadata(stored)?;
        compress::decode(&compressed)
    }

    fn describe(&self) -> String {
        format!("compressed+{}", self.inner.describe())
    }
}
