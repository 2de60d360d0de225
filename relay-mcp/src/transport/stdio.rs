//! Child-process transport over stdio
//!
//! Line-delimited JSON-RPC on stdin/stdout; stderr is captured into a
//! bounded buffer so connect failures can surface the process's own
//! complaint.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;

use super::McpTransport;
use crate::error::{McpError, McpResult};
use crate::protocol::{
    JsonRpcRequest, JsonRpcResponse, Tool, ToolsCallParams, ToolsCallResult, ToolsListResult,
    PROTOCOL_VERSION,
};

const STDERR_CAPACITY: usize = 200;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Stdio transport for local MCP server processes
pub struct StdioTransport {
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,

    child: Option<Child>,
    stdin: Option<BufWriter<ChildStdin>>,
    stdout: Option<BufReader<ChildStdout>>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    next_id: i64,
}

impl StdioTransport {
    pub fn new(
        command: String,
        args: Vec<String>,
        env: HashMap<String, String>,
    ) -> McpResult<Self> {
        if command.trim().is_empty() {
            return Err(McpError::configuration("command cannot be empty"));
        }
        Ok(Self {
            command,
            args,
            env,
            child: None,
            stdin: None,
            stdout: None,
            stderr_tail: Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_CAPACITY))),
            next_id: 0,
        })
    }

    /// Recent stderr lines from the child, newest last
    pub async fn stderr_tail(&self) -> Vec<String> {
        self.stderr_tail.lock().await.iter().cloned().collect()
    }

    async fn spawn_process(&mut self) -> McpResult<()> {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .envs(&self.env)
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            McpError::connection_failed(format!(
                "failed to spawn process '{}': {}",
                self.command, e
            ))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::transport("failed to get stdin handle"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::transport("failed to get stdout handle"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| McpError::transport("failed to get stderr handle"))?;

        // Drain stderr in the background into a bounded tail
        let tail = self.stderr_tail.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let mut tail = tail.lock().await;
                if tail.len() == STDERR_CAPACITY {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
        });

        self.stdin = Some(BufWriter::new(stdin));
        self.stdout = Some(BufReader::new(stdout));
        self.child = Some(child);
        Ok(())
    }

    async fn send(&mut self, request: &JsonRpcRequest) -> McpResult<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| McpError::transport("transport not connected"))?;
        let line = serde_json::to_string(request)?;
        stdin.write_all(line.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn read_response(&mut self, id: i64) -> McpResult<JsonRpcResponse> {
        loop {
            let stdout = self
                .stdout
                .as_mut()
                .ok_or_else(|| McpError::transport("transport not connected"))?;
            let mut line = String::new();
            let bytes = stdout.read_line(&mut line).await?;
            if bytes == 0 {
                let stderr = self.stderr_tail().await.join("\n");
                return Err(McpError::connection_failed(format!(
                    "process closed stdout; stderr: {}",
                    stderr
                )));
            }
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            match serde_json::from_str::<JsonRpcResponse>(line) {
                Ok(response)
                    if response.id.as_ref().and_then(serde_json::Value::as_i64)
                        == Some(id) =>
                {
                    return Ok(response);
                }
                // Notifications and unrelated ids are skipped
                Ok(_) => continue,
                Err(_) => {
                    tracing::debug!(line, "ignoring non-response output from upstream");
                    continue;
                }
            }
        }
    }

    async fn request(
        &mut self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> McpResult<serde_json::Value> {
        self.next_id += 1;
        let id = self.next_id;
        let request = JsonRpcRequest::new(id, method, params);
        self.send(&request).await?;

        let response = tokio::time::timeout(REQUEST_TIMEOUT, self.read_response(id))
            .await
            .map_err(|_| McpError::Timeout {
                timeout: REQUEST_TIMEOUT,
            })??;

        if let Some(error) = response.error {
            return Err(McpError::upstream(format!(
                "{} (code {})",
                error.message, error.code
            )));
        }
        response
            .result
            .ok_or_else(|| McpError::upstream("response carried neither result nor error"))
    }
}

#[async_trait]
impl McpTransport for StdioTransport {
    async fn connect(&mut self) -> McpResult<()> {
        self.spawn_process().await?;

        let params = serde_json::json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {"name": "relay", "version": env!("CARGO_PKG_VERSION")},
        });
        self.request("initialize", Some(params)).await?;
        self.send(&JsonRpcRequest::notification(
            "notifications/initialized",
            None,
        ))
        .await?;
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
        self.stdin = None;
        self.stdout = None;
        if let Some(mut child) = self.child.take() {
            let _ = child.kill().await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_command_rejected() {
        assert!(StdioTransport::new("".to_string(), vec![], HashMap::new()).is_err());
    }

    #[tokio::test]
    async fn test_spawn_failure_surfaces_command() {
        let mut transport = StdioTransport::new(
            "definitely-not-a-real-binary-xyz".to_string(),
            vec![],
            HashMap::new(),
        )
        .unwrap();
        let error = transport.connect().await.unwrap_err();
        assert!(error.to_string().contains("definitely-not-a-real-binary-xyz"));
    }

    #[tokio::test]
    async fn test_round_trip_against_scripted_server() {
        // A tiny shell MCP server: answers initialize and tools/list
        let script = r#"
read line
printf '%s\n' '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05","capabilities":{},"serverInfo":{"name":"stub"}}}'
read line
read line
printf '%s\n' '{"jsonrpc":"2.0","id":2,"result":{"tools":[{"name":"echo","description":"repeat input"}]}}'
"#;
        let mut transport = StdioTransport::new(
            "sh".to_string(),
            vec!["-c".to_string(), script.to_string()],
            HashMap::new(),
        )
        .unwrap();

        transport.connect().await.unwrap();
        let tools = transport.list_tools().await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "echo");
        assert_eq!(tools[0].description.as_deref(), Some("repeat input"));
        transport.close().await.unwrap();
    }
}
