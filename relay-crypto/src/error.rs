//! Crypto error types

use thiserror::Error;

/// Result type for crypto operations
pub type CryptoResult<T> = Result<T, CryptoError>;

/// Errors surfaced by the crypto layer.
///
/// Decryption failures must be propagated by callers, never substituted
/// with a default value.
#[derive(Error, Debug)]
pub enum CryptoError {
    /// Key file could not be read or written
    #[error("Key file error: {0}")]
    KeyFile(#[from] std::io::Error),

    /// Key material has the wrong length
    #[error("Invalid key length: expected {expected} bytes, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    /// Encryption failed
    #[error("Encryption failed")]
    EncryptionFailed,

    /// Authentication tag mismatch or corrupted ciphertext
    #[error("Decryption failed: tag mismatch or corrupted ciphertext")]
    DecryptionFailed,

    /// Ciphertext blob is structurally invalid
    #[error("Invalid ciphertext format: {0}")]
    InvalidFormat(String),
}
