//! Persisted entity types
//!
//! Columns named with an `_enc` suffix hold ciphertext produced by the
//! crypto layer; the store never handles the corresponding plaintext.

pub mod audit;
pub mod client;
pub mod oauth;
pub mod server;
pub mod token;
pub mod tool_preference;

pub use audit::{AuditRecord, AuditSeverity};
pub use client::Client;
pub use oauth::{AuthStateRecord, OAuthConfigRecord, OAuthTokenRecord};
pub use server::{ServerRecord, ServerType};
pub use token::ClientToken;
pub use tool_preference::ToolPreference;
