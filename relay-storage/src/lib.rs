//! # Relay Storage
//!
//! Single-file relational persistence for the Relay broker: servers, clients,
//! client tokens, tool preferences, OAuth configuration and token material,
//! in-flight authorization states, and the audit trail.
//!
//! The store is the authoritative consistency barrier between components.
//! Sensitive columns hold ciphertext produced by `relay-crypto`; this crate
//! never sees plaintext secrets.

pub mod connection;
pub mod entities;
pub mod error;
pub mod migrations;
pub mod repositories;

pub use connection::Store;
pub use error::{StorageError, StorageResult};
pub use migrations::{MigrationRunner, SchemaMigration};

/// Current wall-clock time as integer milliseconds since the Unix epoch
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
