//! SSE transport for remote MCP servers
//!
//! JSON-RPC requests are POSTed to the endpoint; responses arrive either
//! as plain JSON or as the first `data:` frame of an event stream. The
//! sender is authorization-aware: one 401 triggers one header refresh and
//! one retry.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use super::{HeaderProvider, McpTransport};
use crate::error::{McpError, McpResult};
use crate::protocol::{
    JsonRpcRequest, JsonRpcResponse, Tool, ToolsCallParams, ToolsCallResult, ToolsListResult,
    PROTOCOL_VERSION,
};

/// SSE transport for remote MCP servers
pub struct SseTransport {
    url: String,
    headers: HashMap<String, String>,
    server_id: String,
    header_provider: Arc<dyn HeaderProvider>,
    http: reqwest::Client,
    next_id: i64,
}

impl SseTransport {
    pub fn new(
        url: String,
        headers: HashMap<String, String>,
        server_id: String,
        header_provider: Arc<dyn HeaderProvider>,
    ) -> McpResult<Self> {
        Ok(Self {
            url,
            headers,
            server_id,
            header_provider,
            http: reqwest::Client::new(),
            next_id: 0,
        })
    }

    fn apply_headers(&self, mut request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        for (name, value) in &self.headers {
            request = request.header(name, value);
        }
        request
    }

    async fn post_once(&self, request: &JsonRpcRequest) -> McpResult<reqwest::Response> {
        let builder = self
            .http
            .post(&self.url)
            .header("Accept", "application/json, text/event-stream")
            .json(request);
        Ok(self.apply_headers(builder).send().await?)
    }

    /// POST with the single-refresh 401 retry
    async fn post(&mut self, request: &JsonRpcRequest) -> McpResult<reqwest::Response> {
        let response = self.post_once(request).await?;
        if response.status() != reqwest::StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        tracing::debug!(server_id = %self.server_id, "upstream returned 401, refreshing token");
        match self.header_provider.refresh_headers(&self.server_id).await? {
            Some((name, value)) => {
                self.headers.insert(name, value);
            }
            None => {
                return Err(McpError::upstream(format!(
                    "upstream {} rejected credentials (401) and no refresh is available",
                    self.server_id
                )))
            }
        }

        let retried = self.post_once(request).await?;
        if retried.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(McpError::upstream(format!(
                "upstream {} rejected refreshed credentials (401)",
                self.server_id
            )));
        }
        Ok(retried)
    }

    async fn request(
        &mut self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> McpResult<serde_json::Value> {
        self.next_id += 1;
        let request = JsonRpcRequest::new(self.next_id, method, params);

        let response = self.post(&request).await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(McpError::upstream(format!("status {}: {}", status, body)));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let body = response.text().await?;

        let payload = if content_type.starts_with("text/event-stream") {
            first_data_frame(&body).ok_or_else(|| {
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

/// Extract the first `data:` payload from an SSE body
pub(crate) fn first_data_frame(body: &str) -> Option<String> {
    body.lines()
        .find_map(|line| line.strip_prefix("data:"))
        .map(|data| data.trim().to_string())
}

#[async_trait]
impl McpTransport for SseTransport {
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
        Ok(())
    }
}
