//! Error types for `CloakDB` operations.

use std::fmt;

/// Main error type for `CloakDB` operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Master-key provider operation failed
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Key vault or document store operation failed
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Malformed encoded data-key identifier
    #[error("invalid data key encoding: {0}")]
    Format(String),

    /// Schema, key vault, or provider configuration mismatch detected before I/O
    #[error("encryption configuration error: {0}")]
    EncryptionConfig(String),

    /// Ciphertext cannot be decrypted with the available key material
    #[error("decryption failed: {0}")]
    Decryption(String),

    /// Operation attempted on a released client handle
    #[error("client handle is closed")]
    UseAfterClose,
}

/// Errors specific to master-key provider operations.
#[derive(Debug)]
pub enum ProviderError {
    /// Master key material is missing, malformed, or has the wrong length
    InvalidMasterKey(String),

    /// Wrapping a data key under the master key failed
    WrapFailed(String),

    /// Unwrapping a data key failed (wrong master key, wrong provider, or corrupt blob)
    UnwrapFailed(String),

    /// Provider backend could not be reached
    Unreachable(String),

    /// I/O operation failed
    Io(std::io::Error),
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidMasterKey(msg) => write!(f, "invalid master key: {msg}"),
            Self::WrapFailed(msg) => write!(f, "data key wrap failed: {msg}"),
            Self::UnwrapFailed(msg) => write!(f, "data key unwrap failed: {msg}"),
            Self::Unreachable(msg) => write!(f, "provider unreachable: {msg}"),
            Self::Io(err) => write!(f, "I/O error: {err}"),
        }
    }
}

impl std::error::Error for ProviderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ProviderError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

/// Errors specific to document store operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Store backend could not be reached or opened
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Write to the store failed
    #[error("write failed: {0}")]
    WriteFailed(String),

    /// A unique index rejected the write
    #[error("duplicate key for unique index on {path}")]
    DuplicateKey {
        /// Indexed field path that collided
        path: String,
    },

    /// Document serialization or deserialization failed
    #[error("document serialization failed: {0}")]
    Serialization(String),

    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
