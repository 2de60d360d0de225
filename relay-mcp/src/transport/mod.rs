//! Transport layer for upstream MCP servers
//!
//! Three flavors behind one capability set: `connect`, `list_tools`,
//! `call_tool`, `close`. Remote transports receive their authorization
//! headers through the pull-style `HeaderProvider` before every open.

pub mod sse;
pub mod stdio;
pub mod streamable_http;

pub use sse::SseTransport;
pub use stdio::StdioTransport;
pub use streamable_http::StreamableHttpTransport;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{McpError, McpResult};
use crate::protocol::{Tool, ToolsCallResult};

/// Transport configuration, tagged by flavor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TransportType {
    /// Child process over stdio
    #[serde(rename = "stdio")]
    Stdio {
        command: String,

        #[serde(default)]
        args: Vec<String>,

        #[serde(default)]
        env: HashMap<String, String>,
    },

    /// Remote SSE endpoint
    #[serde(rename = "sse")]
    Sse {
        url: String,

        #[serde(default)]
        headers: HashMap<String, String>,
    },

    /// Remote streamable-HTTP endpoint
    #[serde(rename = "streamable_http")]
    StreamableHttp {
        url: String,

        #[serde(default)]
        headers: HashMap<String, String>,
    },
}

impl TransportType {
    /// Validate the transport configuration
    pub fn validate(&self) -> McpResult<()> {
        match self {
            TransportType::Stdio { command, .. } => {
                if command.trim().is_empty() {
                    return Err(McpError::configuration(
                        "stdio transport command cannot be empty",
                    ));
                }
            }
            TransportType::Sse { url, .. } | TransportType::StreamableHttp { url, .. } => {
                if url.trim().is_empty() {
                    return Err(McpError::configuration("transport URL cannot be empty"));
                }
                url::Url::parse(url).map_err(|e| {
                    McpError::configuration(format!("invalid transport URL: {}", e))
                })?;
            }
        }
        Ok(())
    }

    /// Transport flavor name
    pub fn type_name(&self) -> &'static str {
        match self {
            TransportType::Stdio { .. } => "stdio",
            TransportType::Sse { .. } => "sse",
            TransportType::StreamableHttp { .. } => "streamable_http",
        }
    }
}

/// Capability set of an upstream MCP connection
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait McpTransport: Send + Sync {
    /// Establish the connection and run the `initialize` handshake
    async fn connect(&mut self) -> McpResult<()>;

    /// List the tools the upstream announces, upstream ordering preserved
    async fn list_tools(&mut self) -> McpResult<Vec<Tool>>;

    /// Invoke one tool; the result is returned verbatim
    async fn call_tool(
        &mut self,
        name: &str,
        arguments: Option<serde_json::Value>,
    ) -> McpResult<ToolsCallResult>;

    /// Close the connection
    async fn close(&mut self) -> McpResult<()>;
}

/// Pull interface for outbound authorization headers.
///
/// The server manager asks before every remote transport open; the SSE
/// transport asks again (once) after a 401. Implemented over the OAuth
/// subsystem at wiring time, so no dependency points back here.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HeaderProvider: Send + Sync {
    /// Current authorization header for a server, if any
    async fn headers_for(&self, server_id: &str) -> McpResult<Option<(String, String)>>;

    /// Force a refresh and return the new header; used on upstream 401
    async fn refresh_headers(&self, server_id: &str) -> McpResult<Option<(String, String)>>;
}

/// Header provider for deployments without OAuth
pub struct NoAuthHeaders;

#[async_trait]
impl HeaderProvider for NoAuthHeaders {
    async fn headers_for(&self, _server_id: &str) -> McpResult<Option<(String, String)>> {
        Ok(None)
    }

    async fn refresh_headers(&self, _server_id: &str) -> McpResult<Option<(String, String)>> {
        Ok(None)
    }
}

/// Creates transports from configuration; substitutable in tests
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        server_id: &str,
        config: TransportType,
    ) -> McpResult<Box<dyn McpTransport>>;
}

/// Default factory wiring the real transports with header injection
pub struct DefaultTransportFactory {
    headers: Arc<dyn HeaderProvider>,
}

impl DefaultTransportFactory {
    pub fn new(headers: Arc<dyn HeaderProvider>) -> Self {
        Self { headers }
    }
}

#[async_trait]
impl TransportFactory for DefaultTransportFactory {
    async fn create(
        &self,
        server_id: &str,
        config: TransportType,
    ) -> McpResult<Box<dyn McpTransport>> {
        config.validate()?;
        match config {
            TransportType::Stdio { command, args, env } => {
                Ok(Box::new(StdioTransport::new(command, args, env)?))
            }
            TransportType::Sse { url, mut headers } => {
                // OAuth wins over a pre-configured bearer token
                if let Some((name, value)) = self.headers.headers_for(server_id).await? {
                    headers.insert(name, value);
                }
                Ok(Box::new(SseTransport::new(
                    url,
                    headers,
                    server_id.to_string(),
                    self.headers.clone(),
                )?))
            }
            TransportType::StreamableHttp { url, mut headers } => {
                if let Some((name, value)) = self.headers.headers_for(server_id).await? {
                    headers.insert(name, value);
                }
                Ok(Box::new(StreamableHttpTransport::new(url, headers)?))
            }
        }
    }
}
