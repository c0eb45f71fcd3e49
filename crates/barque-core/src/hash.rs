use std::fmt;

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use serde::{Deserialize, Serialize};

use crate::error::{BkError, Result};

type Blake2b256 = Blake2b<U32>;

/// A 32-byte content identifier computed as Blake2b-256 over chunk plaintext.
/// Total-ordered by byte comparison; the all-zero value is reserved as "none".
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Hash(pub [u8; 32]);

/// Number of bytes in a serialized hash.
pub const HASH_LEN: usize = 32;

impl Hash {
    /// Hash a chunk plaintext.
    pub fn of(data: &[u8]) -> Self {
        let mut hasher = Blake2b256::new();
        hasher.update(data);
        let mut out = [0u8; 32];
        out.copy_from_slice(&hasher.finalize());
        Hash(out)
    }

    /// The reserved "none" value.
    pub fn zero() -> Self {
        Hash([0u8; 32])
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// Decode from a byte slice. Fails unless the slice is exactly 32 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| BkError::InvalidHash(bytes.len()))?;
        Ok(Hash(arr))
    }

    /// Lowercase hexadecimal text form.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|_| BkError::InvalidHash(s.len() / 2))?;
        Self::from_bytes(&bytes)
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}
