//! Streamable-HTTP transport for remote MCP servers
//!
//! JSON-RPC over POST with the `Mcp-Session-Id` header threading the
//! session established by `initialize`.

use async_trait::async_trait;
use std::collections::HashMap;

use super::McpTransport;
use crate::error::{McpError, McpResult};
use crate::protocol::{
    JsonRpcRequest, JsonRpcResponse, Tool, ToolsCallParams, ToolsCallResult, ToolsListResult,
    PROTOCOL_VERSION,
};

const SESSION_HEADER: &str = "Mcp-Session-Id";

/// Streamable-HTTP transport for remote MCP servers
pub struct StreamableHttpTransport {
    url: String,
    headers: HashMap<String, String>,
    http: reqwest::Client,
    session_id: Option<String>,
    next_id: i64,
}

impl StreamableHttpTransport {
    pub fn new(url: String, headers: HashMap<String, String>) -> McpResult<Self> {
        Ok(Self {
            url,
            headers,
            http: reqwest::Client::new(),
            session_id: None,
            next_id: 0,
        })
    }

    async fn request(
        &mut self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> McpResult<serde_json::Value> {
        self.next_id += 1;
        let request = JsonRpcRequest::new(self.next_id, method, params);

        let mut builder = self
            .http
            .post(&self.url)
            .header("Accept", "application/json, text/event-stream")
            .json(&request);
        for (name, value) in &self.headers {
            builder = builder.header(name, value);
        }
        if let Some(session_id) = &self.session_id {
            builder = builder.header(SESSION_HEADER, session_id);
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(McpError::upstream(format!("status {}: {}", status, body)));
        }

        // The server assigns the session on the initialize response
        if let Some(session_id) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            self.session_id = Some(session_id.to_string());
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let body = response.text().await?;

        let payload = if content_type.starts_with("text/event-stream") {
            super::sse::first_data_frame(&body).ok_or_else(|| {
                McpError::upstream("event stream carried no data frame")
            })?
        } else {
            body
        };

        let parsed: JsonRpcResponse = serde_json::from_str(&payload)?;
        if let Some(error) = parsed.error {
            return Err(McpError::upstream(format!(
                "{} (code {})",
                error.message, error.code
            )));
        }
        parsed
            .result
            .ok_or_else(|| McpError::upstream("response carried neither result nor error"))
    }
}

#[async_trait]
impl McpTransport for StreamableHttpTransport {
    async fn connect(&mut self) -> McpResult<()> {
        let params = serde_json::json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {"name": "relay", "version": env!("CARGO_PKG_VERSION")},
        });
        self.request("initialize", Some(params)).await?;
        Ok(())
    }

    async fn list_tools(&mut self) -> McpResult<Vec<Tool>> {
        let result = self.request("tools/list", Some(serde_json::json!({}))).await?;
        let parsed: ToolsListResult = serde_json::from_value(result)?;
        Ok(parsed.tools)
    }

    async fn call_tool(
        &mut self,
        name: &str,
        arguments: Option<serde_json::Value>,
    ) -> McpResult<ToolsCallResult> {
        let params = ToolsCallParams {
            name: name.to_string(),
            arguments,
        };
        let result = self
            .request("tools/call", Some(serde_json::to_value(params)?))
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    async fn close(&mut self) -> McpResult<()> {
        self.session_id = None;
        Ok(())
    }
}
