use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, BkError>;

#[derive(Debug, Error)]
pub enum BkError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("repository at '{0}' is not initialized (run 'barque init')")]
    Uninitialized(String),

    #[error("{0}: not found")]
    NotFound(String),

    #[error("integrity error: {0}")]
    Integrity(String),

    #[error("authentication failed: wrong passphrase or tampered data")]
    AuthFailed,

    #[error("invalid hash: expected 32 bytes, got {0}")]
    InvalidHash(usize),

    #[error("key derivation error: {0}")]
    KeyDerivation(String),

    #[error("decompression error: {0}")]
    Decompression(String),

    #[error("unknown compression tag: {0}")]
    UnknownCompressionTag(u8),

    #[error("name already exists: '{0}'")]
    DuplicateName(String),

    #[error("restore target '{0}' is not empty")]
    TargetExists(PathBuf),

    #[error("{0}")]
    User(String),

    #[error("unrecoverable storage failure: {0}")]
    IoFatal(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),

    #[error("deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),
}

impl BkError {
    /// Exit status when this error aborts the process before a session runs.
    /// Argument and configuration mistakes exit 1; everything else is counted
    /// by the report and clipped to a byte by the caller.
    pub fn is_usage(&self) -> bool {
        matches!(
            self,
            BkError::Config(_) | BkError::User(_) | BkError::Uninitialized(_)
        )
    }
}
