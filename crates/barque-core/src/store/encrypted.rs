use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use argon2::Argon2;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error::{BkError, Result};
use crate::store::Layer;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Domain-separation tags: a chunk ciphertext can never be replayed as a
/// metadata value or vice versa.
const AAD_CHUNK: &[u8] = b"barque:chunk:v1";
const AAD_METADATA: &[u8] = b"barque:metadata:v1";

/// KDF parameters, persisted in `encrypt.txt` alongside the salt. Written
/// below the encryption layer: they must be readable before keys exist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KdfParams {
    pub algorithm: String,
    pub time_cost: u32,
    pub memory_cost: u32,
    pub parallelism: u32,
    pub salt: Vec<u8>,
}

// Bounds rejecting maliciously crafted parameter blocks.
const MAX_TIME_COST: u32 = 10;
const MAX_PARALLELISM: u32 = 16;
const MAX_MEMORY_KIB: u32 = 524_288; // 512 MiB
const MIN_SALT_LEN: usize = 16;
const MAX_SALT_LEN: usize = 64;

impl KdfParams {
    /// Fresh parameters for repository initialization.
    pub fn generate() -> Self {
        let mut salt = vec![0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut salt);
        KdfParams {
            algorithm: "argon2id".to_string(),
            time_cost: 3,
            memory_cost: 65_536, // 64 MiB
            parallelism: 4,
            salt,
        }
    }

    /// Serialized form stored in `encrypt.txt`.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let params: KdfParams = rmp_serde::from_slice(bytes)?;
        params.validate()?;
        Ok(params)
    }

    fn validate(&self) -> Result<()> {
        if self.algorithm != "argon2id" {
            return Err(BkError::KeyDerivation(format!(
                "unsupported KDF '{}'",
                self.algorithm
            )));
        }
        if self.time_cost == 0 || self.time_cost > MAX_TIME_COST {
            return Err(BkError::KeyDerivation("time_cost out of bounds".into()));
        }
        if self.parallelism == 0 || self.parallelism > MAX_PARALLELISM {
            return Err(BkError::KeyDerivation("parallelism out of bounds".into()));
        }
        if self.memory_cost == 0 || self.memory_cost > MAX_MEMORY_KIB {
            return Err(BkError::KeyDerivation("memory_cost out of bounds".into()));
        }
        if self.salt.len() < MIN_SALT_LEN || self.salt.len() > MAX_SALT_LEN {
            return Err(BkError::KeyDerivation("bad salt length".into()));
        }
        Ok(())
    }
}

/// Derive the 32-byte master key from the passphrase (Argon2id).
fn derive_key(passphrase: &str, params: &KdfParams) -> Result<Zeroizing<[u8; 32]>> {
    params.validate()?;
    let argon_params = argon2::Params::new(
        params.memory_cost,
        params.time_cost,
        params.parallelism,
        Some(32),
    )
    .map_err(|e| BkError::KeyDerivation(format!("argon2 params: {e}")))?;
    let argon2 = Argon2::new(
        argon2::Algorithm::Argon2id,
        argon2::Version::V0x13,
        argon_params,
    );
    let mut output = Zeroizing::new([0u8; 32]);
    argon2
        .hash_password_into(passphrase.as_bytes(), &params.salt, output.as_mut())
        .map_err(|e| BkError::KeyDerivation(format!("argon2: {e}")))?;
    Ok(output)
}

/// Authenticated encryption for chunk payloads and metadata values.
/// AES-256-GCM with a random 96-bit nonce stored inline and a 128-bit tag;
/// a MAC failure is fatal and never retried. Content addressing sits above
/// this layer, so identical plaintexts dedup to one ciphertext even though
/// nonces differ between writers.
pub struct EncryptedLayer {
    inner: Box<dyn Layer>,
    cipher: Aes256Gcm,
}

impl EncryptedLayer {
    pub fn new(inner: Box<dyn Layer>, passphrase: &str, params: &KdfParams) -> Result<Self> {
        let key = derive_key(passphrase, params)?;
        let cipher = Aes256Gcm::new_from_slice(key.as_ref())
            .map_err(|e| BkError::KeyDerivation(format!("cipher init: {e}")))?;
        Ok(EncryptedLayer { inner, cipher })
    }

    fn seal(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(
                nonce,
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| BkError::AuthFailed)?;
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn open(&self, data: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        if data.len() < NONCE_LEN + TAG_LEN {
            return Err(BkError::AuthFailed);
        }
        let nonce = Nonce::from_slice(&data[..NONCE_LEN]);
        self.cipher
            .decrypt(
                nonce,
                Payload {
                    msg: &data[NONCE_LEN..],
                    aad,
                },
            )
            .map_err(|_| BkError::AuthFailed)
    }
}

impl Layer for EncryptedLayer {
    fn encode_chunk(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let sealed = self.seal(plaintext, AAD_CHUNK)?;
        self.inner.encode_chunk(&sealed)
    }

    fn decode_chunk(&self, stored: &[u8]) -> Result<Vec<u8>> {
        let sealed = self.inner.decode_chunk(stored)?;
        self.open(&sealed, AAD_CHUNK)
    }

    fn encode_metadata(&self, value: &[u8]) -> Result<Vec<u8>> {
        let sealed = self.seal(value, AAD_METADATA)?;
        self.inner.encode_metadata(&sealed)
    }

    fn decode_metadata(&self, stored: &[u8]) -> Result<Vec<u8>> {
        let sealed = self.inner.decode_metadata(stored)?;
        self.open(&sealed, AAD_METADATA)
    }

    fn describe(&self) -> String {
        format!("encrypted+{}", self.inner.describe())
    }
}
