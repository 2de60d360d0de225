//! # Relay Crypto
//!
//! Symmetric encryption for sensitive store columns, salted password
//! hashing, random token generation, PKCE material, and passphrase-based
//! backup encryption.
//!
//! The 32-byte master key lives in a file with owner-only permissions.
//! Losing that file renders encrypted columns unrecoverable.

pub mod backup;
pub mod cipher;
pub mod error;
pub mod hashing;
pub mod keyfile;
pub mod pkce;

pub use cipher::SecretCipher;
pub use error::{CryptoError, CryptoResult};
pub use keyfile::KeyFile;
pub use pkce::{pkce_challenge, random_token};
