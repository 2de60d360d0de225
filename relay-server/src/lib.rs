//! # Relay Server
//!
//! Explicit wiring of the broker's dependency graph:
//! Store → Crypto → {Tokens, Filter, OAuth} → Manager → Gateway.
//! Teardown runs in reverse. No process-wide singletons.

pub mod bridge;
pub mod context;
pub mod paths;

pub use bridge::OAuthHeaderBridge;
pub use context::{AppContext, ServerError};
pub use paths::DataPaths;
