//! Upstream server supervision
//!
//! Owns the in-memory maps (definitions, live transports, name index,
//! status mirror) and the lifecycle operations over them. Lifecycle
//! operations for a fixed server are serialized in request order; the
//! shared maps are only ever locked for copy-in/copy-out, never across
//! I/O.

pub mod definition;

pub use definition::{InputParam, ServerDefinition};

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use relay_config::domains::manager::ManagerConfig;
use relay_crypto::SecretCipher;
use relay_storage::entities::ServerType;
use relay_storage::Store;

use crate::error::{McpError, McpResult};
use crate::filters::ToolFilterService;
use crate::transport::{McpTransport, TransportFactory, TransportType};

/// Runtime status of an upstream server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

/// One structured log line retained per server
#[derive(Debug, Clone)]
pub struct ServerLogEntry {
    pub timestamp: i64,
    pub level: &'static str,
    pub message: String,
}

/// Point-in-time view of one supervised server
#[derive(Debug, Clone)]
pub struct ServerSnapshot {
    pub definition: ServerDefinition,
    pub status: ServerStatus,
    pub error_message: Option<String>,
}

type SharedTransport = Arc<Mutex<Box<dyn McpTransport>>>;

/// Supervises upstream MCP server connections
pub struct ServerManager {
    store: Store,
    cipher: Arc<SecretCipher>,
    filters: Arc<ToolFilterService>,
    factory: Arc<dyn TransportFactory>,
    config: ManagerConfig,

    servers: RwLock<HashMap<String, ServerDefinition>>,
    connections: RwLock<HashMap<String, SharedTransport>>,
    name_to_id: RwLock<HashMap<String, String>>,
    status: RwLock<HashMap<String, ServerStatus>>,
    errors: RwLock<HashMap<String, String>>,
    logs: RwLock<HashMap<String, VecDeque<ServerLogEntry>>>,

    // Serializes start/stop/remove per server, in request order
    lifecycle_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ServerManager {
    /// Construct and hydrate the in-memory maps from the store
    pub async fn new(
        store: Store,
        cipher: Arc<SecretCipher>,
        filters: Arc<ToolFilterService>,
        factory: Arc<dyn TransportFactory>,
        config: ManagerConfig,
    ) -> McpResult<Arc<Self>> {
        let manager = Arc::new(Self {
            store,
            cipher,
            filters,
            factory,
            config,
            servers: RwLock::new(HashMap::new()),
            connections: RwLock::new(HashMap::new()),
            name_to_id: RwLock::new(HashMap::new()),
            status: RwLock::new(HashMap::new()),
            errors: RwLock::new(HashMap::new()),
            logs: RwLock::new(HashMap::new()),
            lifecycle_locks: Mutex::new(HashMap::new()),
        });

        let records = manager.store.servers().list().await?;
        {
            let mut servers = manager.servers.write().await;
            let mut names = manager.name_to_id.write().await;
            let mut status = manager.status.write().await;
            for record in records {
                let definition = ServerDefinition::from_record(&manager.cipher, &record)?;
                names.insert(definition.name.clone(), definition.id.clone());
                status.insert(definition.id.clone(), ServerStatus::Stopped);
                servers.insert(definition.id.clone(), definition);
            }
        }
        Ok(manager)
    }

    async fn lifecycle_lock(&self, server_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.lifecycle_locks.lock().await;
        locks
            .entry(server_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn push_log(&self, server_id: &str, level: &'static str, message: String) {
        let mut logs = self.logs.write().await;
        let ring = logs.entry(server_id.to_string()).or_default();
        if ring.len() == self.config.log_capacity {
            ring.pop_front();
        }
        ring.push_back(ServerLogEntry {
            timestamp: relay_storage::now_millis(),
            level,
            message,
        });
    }

    async fn set_status(&self, server_id: &str, status: ServerStatus) {
        self.status
            .write()
            .await
            .insert(server_id.to_string(), status);
    }

    /// Register a new server
    pub async fn add_server(&self, definition: ServerDefinition) -> McpResult<ServerDefinition> {
        definition.validate()?;
        let record = definition.to_record(&self.cipher)?;
        self.store.servers().insert(&record).await?;

        self.name_to_id
            .write()
            .await
            .insert(definition.name.clone(), definition.id.clone());
        self.status
            .write()
            .await
            .insert(definition.id.clone(), ServerStatus::Stopped);
        self.servers
            .write()
            .await
            .insert(definition.id.clone(), definition.clone());
        Ok(definition)
    }

    /// Update a registered server's definition
    pub async fn update_server(&self, definition: ServerDefinition) -> McpResult<()> {
        definition.validate()?;
        let record = definition.to_record(&self.cipher)?;
        self.store.servers().update(&record).await?;

        let previous = self
            .servers
            .write()
            .await
            .insert(definition.id.clone(), definition.clone());
        let mut names = self.name_to_id.write().await;
        if let Some(previous) = previous {
            if previous.name != definition.name {
                names.remove(&previous.name);
            }
        }
        names.insert(definition.name.clone(), definition.id.clone());
        Ok(())
    }

    /// Resolve a server reference: id first, then unique name
    pub async fn resolve_id(&self, server_ref: &str) -> McpResult<String> {
        if self.servers.read().await.contains_key(server_ref) {
            return Ok(server_ref.to_string());
        }
        self.name_to_id
            .read()
            .await
            .get(server_ref)
            .cloned()
            .ok_or_else(|| McpError::not_found("server", server_ref))
    }

    /// Copy of one definition
    pub async fn get(&self, server_id: &str) -> McpResult<ServerDefinition> {
        self.servers
            .read()
            .await
            .get(server_id)
            .cloned()
            .ok_or_else(|| McpError::not_found("server", server_id))
    }

    /// Current status; `Stopped` for unknown ids
    pub async fn status(&self, server_id: &str) -> ServerStatus {
        self.status
            .read()
            .await
            .get(server_id)
            .copied()
            .unwrap_or(ServerStatus::Stopped)
    }

    /// Snapshot of every supervised server
    pub async fn snapshot(&self) -> Vec<ServerSnapshot> {
        let servers = self.servers.read().await;
        let status = self.status.read().await;
        let errors = self.errors.read().await;
        let mut snapshots: Vec<ServerSnapshot> = servers
            .values()
            .map(|definition| ServerSnapshot {
                definition: definition.clone(),
                status: status
                    .get(&definition.id)
                    .copied()
                    .unwrap_or(ServerStatus::Stopped),
                error_message: errors.get(&definition.id).cloned(),
            })
            .collect();
        snapshots.sort_by(|a, b| a.definition.name.cmp(&b.definition.name));
        snapshots
    }

    /// Recent structured log lines for a server
    pub async fn logs(&self, server_id: &str) -> Vec<ServerLogEntry> {
        self.logs
            .read()
            .await
            .get(server_id)
            .map(|ring| ring.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Live transport handle; `ServerNotRunning` when absent
    pub async fn get_transport(&self, server_id: &str) -> McpResult<SharedTransport> {
        self.connections
            .read()
            .await
            .get(server_id)
            .cloned()
            .ok_or_else(|| McpError::ServerNotRunning {
                server_id: server_id.to_string(),
            })
    }

    /// Start an upstream server. Idempotent while running.
    pub async fn start(self: &Arc<Self>, server_id: &str) -> McpResult<()> {
        let lock = self.lifecycle_lock(server_id).await;
        let _guard = lock.lock().await;

        let definition = self.get(server_id).await?;
        if definition.disabled {
            return Err(McpError::configuration(format!(
                "server {} is disabled",
                definition.name
            )));
        }
        if self.status(server_id).await == ServerStatus::Running {
            return Ok(());
        }

        self.set_status(server_id, ServerStatus::Starting).await;
        self.errors.write().await.remove(server_id);

        let connect_result = async {
            let transport_config = definition.transport_config()?;
            let mut transport = self.factory.create(server_id, transport_config).await?;
            tokio::time::timeout(self.config.start_timeout, transport.connect())
                .await
                .map_err(|_| McpError::Timeout {
                    timeout: self.config.start_timeout,
                })??;
            Ok::<_, McpError>(transport)
        }
        .await;

        match connect_result {
            Ok(transport) => {
                self.connections
                    .write()
                    .await
                    .insert(server_id.to_string(), Arc::new(Mutex::new(transport)));
                self.set_status(server_id, ServerStatus::Running).await;
                self.push_log(
                    server_id,
                    "info",
                    format!(
                        "server '{}' started ({})",
                        definition.name,
                        definition.server_type.as_str()
                    ),
                )
                .await;
                tracing::info!(server_id, name = %definition.name, "upstream server started");

                // Discovery runs off the start path; the filter service
                // reconciles whenever it lands
                let manager = self.clone();
                let sid = server_id.to_string();
                tokio::spawn(async move {
                    if let Err(error) = manager.discover_tools(&sid).await {
                        tracing::warn!(server_id = %sid, %error, "tool discovery failed");
                    }
                });
                Ok(())
            }
            Err(error) => {
                let message = error.to_string();
                self.errors
                    .write()
                    .await
                    .insert(server_id.to_string(), message.clone());
                self.set_status(server_id, ServerStatus::Error).await;
                self.push_log(server_id, "error", format!("start failed: {}", message))
                    .await;
                Err(error)
            }
        }
    }

    /// Fetch the upstream tool list and reconcile filter rows
    pub async fn discover_tools(&self, server_id: &str) -> McpResult<usize> {
        let transport = self.get_transport(server_id).await?;
        let tools = {
            let mut transport = transport.lock().await;
            transport.list_tools().await?
        };
        let count = tools.len();
        self.filters.sync_discovered(server_id, &tools).await?;
        self.push_log(server_id, "info", format!("discovered {} tools", count))
            .await;
        Ok(count)
    }

    /// Stop an upstream server. Idempotent while stopped.
    pub async fn stop(&self, server_id: &str) -> McpResult<()> {
        let lock = self.lifecycle_lock(server_id).await;
        let _guard = lock.lock().await;

        // Unknown ids are rejected; stopping a stopped server is not
        self.get(server_id).await?;

        let Some(transport) = self.connections.write().await.remove(server_id) else {
            self.set_status(server_id, ServerStatus::Stopped).await;
            return Ok(());
        };

        self.set_status(server_id, ServerStatus::Stopping).await;
        {
            let mut transport = transport.lock().await;
            if let Err(error) = transport.close().await {
                tracing::warn!(server_id, %error, "transport close reported an error");
            }
        }
        self.set_status(server_id, ServerStatus::Stopped).await;
        self.push_log(server_id, "info", "server stopped".to_string())
            .await;
        Ok(())
    }

    /// Stop then start
    pub async fn restart(self: &Arc<Self>, server_id: &str) -> McpResult<()> {
        self.stop(server_id).await?;
        self.start(server_id).await
    }

    /// Remove a server entirely: stopped if running, token grants shrink
    /// via the store cascade, record deleted
    pub async fn remove(&self, server_id: &str) -> McpResult<()> {
        let lock = self.lifecycle_lock(server_id).await;
        let _guard = lock.lock().await;

        let definition = self.get(server_id).await?;

        if let Some(transport) = self.connections.write().await.remove(server_id) {
            let mut transport = transport.lock().await;
            let _ = transport.close().await;
        }

        self.store.servers().delete(server_id).await?;

        self.servers.write().await.remove(server_id);
        self.name_to_id.write().await.remove(&definition.name);
        self.status.write().await.remove(server_id);
        self.errors.write().await.remove(server_id);
        self.logs.write().await.remove(server_id);
        tracing::info!(server_id, name = %definition.name, "server removed");
        Ok(())
    }

    /// Start every non-disabled auto-start server; individual failures do
    /// not abort startup
    pub async fn auto_start_all(self: &Arc<Self>) -> usize {
        let candidates: Vec<String> = {
            let servers = self.servers.read().await;
            servers
                .values()
                .filter(|d| d.auto_start && !d.disabled)
                .map(|d| d.id.clone())
                .collect()
        };

        let mut started = 0;
        for server_id in candidates {
            match self.start(&server_id).await {
                Ok(()) => started += 1,
                Err(error) => {
                    tracing::warn!(server_id = %server_id, %error, "auto-start failed");
                }
            }
        }
        started
    }

    /// Workspace switch: stop everything, drop all maps
    pub async fn clear_all(&self) {
        let running: Vec<String> = self.connections.read().await.keys().cloned().collect();
        for server_id in running {
            if let Err(error) = self.stop(&server_id).await {
                tracing::warn!(server_id = %server_id, %error, "stop during clear failed");
            }
        }
        self.servers.write().await.clear();
        self.connections.write().await.clear();
        self.name_to_id.write().await.clear();
        self.status.write().await.clear();
        self.errors.write().await.clear();
        self.logs.write().await.clear();
        self.lifecycle_locks.lock().await.clear();
    }
}

/// Substitute `${KEY}`, `{KEY}`, and their `user_config.`-prefixed forms
/// in command arguments
pub(crate) fn substitute_placeholders(
    args: &[String],
    values: &HashMap<String, String>,
) -> Vec<String> {
    args.iter()
        .map(|arg| {
            let mut out = arg.clone();
            for (key, value) in values {
                for pattern in [
                    format!("${{{}}}", key),
                    format!("{{{}}}", key),
                    format!("${{user_config.{}}}", key),
                    format!("{{user_config.{}}}", key),
                ] {
                    out = out.replace(&pattern, value);
                }
            }
            out
        })
        .collect()
}

/// Build the effective placeholder values: input-parameter defaults
/// overlaid with the configured environment
pub(crate) fn placeholder_values(
    input_params: &HashMap<String, InputParam>,
    env: &HashMap<String, String>,
) -> HashMap<String, String> {
    let mut values: HashMap<String, String> = input_params
        .iter()
        .filter_map(|(key, param)| param.default.clone().map(|v| (key.clone(), v)))
        .collect();
    for (key, value) in env {
        values.insert(key.clone(), value.clone());
    }
    values
}

impl ServerDefinition {
    /// Transport configuration for this definition, placeholders applied
    pub(crate) fn transport_config(&self) -> McpResult<TransportType> {
        match self.server_type {
            ServerType::Local => {
                let command = self.command.clone().ok_or_else(|| {
                    McpError::configuration("local server has no command")
                })?;
                let values = placeholder_values(&self.input_params, &self.env);
                Ok(TransportType::Stdio {
                    command,
                    args: substitute_placeholders(&self.args, &values),
                    env: self.env.clone(),
                })
            }
            ServerType::Remote | ServerType::RemoteStreamable => {
                let url = self.remote_url.clone().ok_or_else(|| {
                    McpError::configuration("remote server has no URL")
                })?;
                let mut headers = HashMap::new();
                if let Some(bearer) = &self.bearer_token {
                    headers.insert("Authorization".to_string(), format!("Bearer {}", bearer));
                }
                Ok(match self.server_type {
                    ServerType::Remote => TransportType::Sse { url, headers },
                    _ => TransportType::StreamableHttp { url, headers },
                })
            }
        }
    }
}
