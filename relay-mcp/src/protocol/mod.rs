//! Minimal MCP protocol surface consumed from upstream servers

pub mod messages;

pub use messages::{
    InitializeParams, InitializeResult, JsonRpcError, JsonRpcRequest, JsonRpcResponse, Tool,
    ToolContent, ToolsCallParams, ToolsCallResult, ToolsListResult,
};

/// Protocol version announced during the handshake
pub const PROTOCOL_VERSION: &str = "2024-11-05";
