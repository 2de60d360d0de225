//! # Relay MCP
//!
//! The broker's MCP-facing core: a minimal upstream client over three
//! transport flavors (stdio, SSE, streamable HTTP), the client token
//! service, per-client tool filtering, upstream server supervision, and
//! the router gate that ties them together.
//!
//! OAuth header injection is a pull interface (`HeaderProvider`); the
//! OAuth subsystem never appears as a dependency here.

pub mod error;
pub mod filters;
pub mod gateway;
pub mod manager;
pub mod protocol;
pub mod security;
pub mod transport;

pub use error::{McpError, McpResult};
pub use filters::{ToolFilterService, ToolPolicy};
pub use gateway::{Gateway, GatewayTool};
pub use manager::{ServerDefinition, ServerManager, ServerStatus};
pub use protocol::{Tool, ToolsCallResult, ToolsListResult};
pub use security::TokenService;
pub use transport::{
    HeaderProvider, McpTransport, NoAuthHeaders, TransportFactory, TransportType,
};
