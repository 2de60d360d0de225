//! Per-(server, client) tool policy
//!
//! Resolution order: client-specific row, then global row, then an
//! implicit enabled default. Rows are seeded at tool discovery and
//! removed when tools vanish. Reads go through a per-scope cache that is
//! invalidated on any write to that scope.

use std::collections::HashMap;
use tokio::sync::RwLock;

use relay_storage::entities::ToolPreference;
use relay_storage::Store;

use crate::error::McpResult;
use crate::protocol::Tool;

/// Resolved policy for one `(server, tool, client)` query
#[derive(Debug, Clone, PartialEq)]
pub struct ToolPolicy {
    pub enabled: bool,
    pub custom_name: Option<String>,
    pub custom_description: Option<String>,
    pub original_description: Option<String>,
}

impl Default for ToolPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            custom_name: None,
            custom_description: None,
            original_description: None,
        }
    }
}

impl From<&ToolPreference> for ToolPolicy {
    fn from(row: &ToolPreference) -> Self {
        Self {
            enabled: row.enabled,
            custom_name: row.custom_name.clone(),
            custom_description: row.custom_description.clone(),
            original_description: row.original_description.clone(),
        }
    }
}

type ScopeKey = (String, Option<String>);

/// Tool filter service with per-scope caching
pub struct ToolFilterService {
    store: Store,
    cache: RwLock<HashMap<ScopeKey, HashMap<String, ToolPolicy>>>,
}

impl ToolFilterService {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// All policies for one scope, from cache when warm
    async fn scope_policies(
        &self,
        server_id: &str,
        client_id: Option<&str>,
    ) -> McpResult<HashMap<String, ToolPolicy>> {
        let key: ScopeKey = (server_id.to_string(), client_id.map(String::from));
        if let Some(cached) = self.cache.read().await.get(&key) {
            return Ok(cached.clone());
        }

        let rows = self
            .store
            .tool_preferences()
            .list_scope(server_id, client_id)
            .await?;
        let policies: HashMap<String, ToolPolicy> = rows
            .iter()
            .map(|row| (row.tool_name.clone(), ToolPolicy::from(row)))
            .collect();

        self.cache.write().await.insert(key, policies.clone());
        Ok(policies)
    }

    async fn invalidate_scope(&self, server_id: &str, client_id: Option<&str>) {
        let key: ScopeKey = (server_id.to_string(), client_id.map(String::from));
        self.cache.write().await.remove(&key);
    }

    async fn invalidate_server(&self, server_id: &str) {
        self.cache
            .write()
            .await
            .retain(|(sid, _), _| sid != server_id);
    }

    /// Resolve the effective policy for a `(server, tool, client)` query
    pub async fn resolve(
        &self,
        server_id: &str,
        tool_name: &str,
        client_id: Option<&str>,
    ) -> McpResult<ToolPolicy> {
        if let Some(client_id) = client_id {
            let client_scope = self.scope_policies(server_id, Some(client_id)).await?;
            if let Some(policy) = client_scope.get(tool_name) {
                return Ok(policy.clone());
            }
        }

        let global = self.scope_policies(server_id, None).await?;
        if let Some(policy) = global.get(tool_name) {
            return Ok(policy.clone());
        }

        Ok(ToolPolicy::default())
    }

    /// Seed and reconcile preference rows against a fresh tool discovery.
    ///
    /// Absent global rows are inserted enabled with the announced
    /// description; present rows get only `original_description` updated
    /// when it drifted. Rows for tools no longer announced are removed,
    /// client-specific rows included.
    pub async fn sync_discovered(&self, server_id: &str, tools: &[Tool]) -> McpResult<()> {
        let prefs = self.store.tool_preferences();

        for tool in tools {
            match prefs.get(server_id, &tool.name, None).await? {
                None => {
                    prefs
                        .insert(
                            server_id,
                            &tool.name,
                            None,
                            true,
                            tool.description.as_deref(),
                            None,
                            None,
                        )
                        .await?;
                }
                Some(existing) => {
                    if existing.original_description != tool.description {
                        prefs
                            .update_original_description(
                                server_id,
                                &tool.name,
                                tool.description.as_deref(),
                            )
                            .await?;
                    }
                }
            }
        }

        let announced: Vec<String> = tools.iter().map(|t| t.name.clone()).collect();
        let removed = prefs.delete_missing(server_id, &announced).await?;
        if removed > 0 {
            tracing::info!(server_id, removed, "stale tool preferences removed");
        }

        self.invalidate_server(server_id).await;
        Ok(())
    }

    /// Reverse lookup: the upstream tool name behind a custom name,
    /// client scope winning over global
    pub async fn find_by_custom_name(
        &self,
        server_id: &str,
        custom_name: &str,
        client_id: Option<&str>,
    ) -> McpResult<Option<String>> {
        if let Some(client_id) = client_id {
            let scoped = self.scope_policies(server_id, Some(client_id)).await?;
            if let Some((tool_name, _)) = scoped
                .iter()
                .find(|(_, policy)| policy.custom_name.as_deref() == Some(custom_name))
            {
                return Ok(Some(tool_name.clone()));
            }
        }
        let global = self.scope_policies(server_id, None).await?;
        Ok(global
            .iter()
            .find(|(_, policy)| policy.custom_name.as_deref() == Some(custom_name))
            .map(|(tool_name, _)| tool_name.clone()))
    }

    /// Set (or create) the policy row for one scope
    pub async fn set_preference(
        &self,
        server_id: &str,
        tool_name: &str,
        client_id: Option<&str>,
        enabled: bool,
        custom_name: Option<&str>,
        custom_description: Option<&str>,
    ) -> McpResult<()> {
        let prefs = self.store.tool_preferences();
        match prefs.get(server_id, tool_name, client_id).await? {
            Some(_) => {
                prefs
                    .update_policy(
                        server_id,
                        tool_name,
                        client_id,
                        enabled,
                        custom_name,
                        custom_description,
                    )
                    .await?;
            }
            None => {
                prefs
                    .insert(
                        server_id,
                        tool_name,
                        client_id,
                        enabled,
                        None,
                        custom_name,
                        custom_description,
                    )
                    .await?;
            }
        }
        self.invalidate_scope(server_id, client_id).await;
        Ok(())
    }

    /// Enable or disable every tool in one scope.
    ///
    /// For a client scope, rows are materialized from the globally known
    /// tool set first so the flag covers all of them.
    pub async fn set_all(
        &self,
        server_id: &str,
        client_id: Option<&str>,
        enabled: bool,
    ) -> McpResult<()> {
        let prefs = self.store.tool_preferences();

        if let Some(client_id) = client_id {
            for tool_name in prefs.known_tools(server_id).await? {
                if prefs
                    .get(server_id, &tool_name, Some(client_id))
                    .await?
                    .is_none()
                {
                    prefs
                        .insert(server_id, &tool_name, Some(client_id), enabled, None, None, None)
                        .await?;
                }
            }
        }

        prefs.set_enabled_all(server_id, client_id, enabled).await?;
        self.invalidate_scope(server_id, client_id).await;
        Ok(())
    }

    /// Reset one scope to defaults
    pub async fn reset(&self, server_id: &str, client_id: Option<&str>) -> McpResult<()> {
        self.store
            .tool_preferences()
            .reset_scope(server_id, client_id)
            .await?;
        self.invalidate_scope(server_id, client_id).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_storage::entities::{Client, ServerRecord, ServerType};

    async fn fixture() -> (Store, ToolFilterService, String, String) {
        let store = Store::in_memory().await.unwrap();
        let server = ServerRecord::new("srv", ServerType::Local);
        store.servers().insert(&server).await.unwrap();
        let client = Client::new("app", None);
        store.clients().insert(&client).await.unwrap();
        let service = ToolFilterService::new(store.clone());
        (store, service, server.id, client.id)
    }

    fn tools(names: &[(&str, Option<&str>)]) -> Vec<Tool> {
        names
            .iter()
            .map(|(name, description)| Tool::new(*name, *description))
            .collect()
    }

    #[tokio::test]
    async fn test_discovery_seeds_enabled_defaults() {
        let (_store, service, server_id, _client_id) = fixture().await;

        service
            .sync_discovered(&server_id, &tools(&[("t1", Some("first")), ("t2", None)]))
            .await
            .unwrap();

        let policy = service.resolve(&server_id, "t1", None).await.unwrap();
        assert!(policy.enabled);
        assert_eq!(policy.original_description.as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn test_rediscovery_updates_only_original_description() {
        let (_store, service, server_id, _client_id) = fixture().await;

        service
            .sync_discovered(&server_id, &tools(&[("t1", Some("old"))]))
            .await
            .unwrap();
        service
            .set_preference(&server_id, "t1", None, false, Some("alias"), None)
            .await
            .unwrap();

        service
            .sync_discovered(&server_id, &tools(&[("t1", Some("new"))]))
            .await
            .unwrap();

        let policy = service.resolve(&server_id, "t1", None).await.unwrap();
        assert!(!policy.enabled);
        assert_eq!(policy.custom_name.as_deref(), Some("alias"));
        assert_eq!(policy.original_description.as_deref(), Some("new"));
    }

    #[tokio::test]
    async fn test_vanished_tools_are_cleaned_up() {
        let (_store, service, server_id, client_id) = fixture().await;

        service
            .sync_discovered(&server_id, &tools(&[("keep", None), ("drop", None)]))
            .await
            .unwrap();
        service
            .set_preference(&server_id, "drop", Some(&client_id), false, None, None)
            .await
            .unwrap();

        service
            .sync_discovered(&server_id, &tools(&[("keep", None)]))
            .await
            .unwrap();

        // Both the global and the client-specific row are gone: back to default
        let global = service.resolve(&server_id, "drop", None).await.unwrap();
        assert_eq!(global, ToolPolicy::default());
        let scoped = service
            .resolve(&server_id, "drop", Some(&client_id))
            .await
            .unwrap();
        assert_eq!(scoped, ToolPolicy::default());
    }

    #[tokio::test]
    async fn test_client_row_overrides_global() {
        let (_store, service, server_id, client_id) = fixture().await;

        service
            .sync_discovered(&server_id, &tools(&[("t", None)]))
            .await
            .unwrap();
        service
            .set_preference(&server_id, "t", Some(&client_id), false, None, None)
            .await
            .unwrap();

        assert!(service.resolve(&server_id, "t", None).await.unwrap().enabled);
        assert!(
            !service
                .resolve(&server_id, "t", Some(&client_id))
                .await
                .unwrap()
                .enabled
        );
        // An unrelated client falls through to the global row
        assert!(
            service
                .resolve(&server_id, "t", Some("other-client"))
                .await
                .unwrap()
                .enabled
        );
    }

    #[tokio::test]
    async fn test_unknown_tool_defaults_enabled() {
        let (_store, service, server_id, _client_id) = fixture().await;
        let policy = service.resolve(&server_id, "never-seen", None).await.unwrap();
        assert_eq!(policy, ToolPolicy::default());
    }

    #[tokio::test]
    async fn test_disable_all_for_client_scope() {
        let (_store, service, server_id, client_id) = fixture().await;

        service
            .sync_discovered(&server_id, &tools(&[("a", None), ("b", None)]))
            .await
            .unwrap();
        service
            .set_all(&server_id, Some(&client_id), false)
            .await
            .unwrap();

        for tool in ["a", "b"] {
            assert!(
                !service
                    .resolve(&server_id, tool, Some(&client_id))
                    .await
                    .unwrap()
                    .enabled
            );
            // Global scope untouched
            assert!(service.resolve(&server_id, tool, None).await.unwrap().enabled);
        }
    }

    #[tokio::test]
    async fn test_reset_client_scope_falls_back_to_global() {
        let (_store, service, server_id, client_id) = fixture().await;

        service
            .sync_discovered(&server_id, &tools(&[("t", None)]))
            .await
            .unwrap();
        service
            .set_preference(&server_id, "t", Some(&client_id), false, None, None)
            .await
            .unwrap();
        service.reset(&server_id, Some(&client_id)).await.unwrap();

        assert!(
            service
                .resolve(&server_id, "t", Some(&client_id))
                .await
                .unwrap()
                .enabled
        );
    }

    #[tokio::test]
    async fn test_cache_invalidation_on_write() {
        let (_store, service, server_id, _client_id) = fixture().await;

        service
            .sync_discovered(&server_id, &tools(&[("t", None)]))
            .await
            .unwrap();
        // Warm the cache
        assert!(service.resolve(&server_id, "t", None).await.unwrap().enabled);

        service
            .set_preference(&server_id, "t", None, false, None, None)
            .await
            .unwrap();
        // The write must be visible immediately
        assert!(!service.resolve(&server_id, "t", None).await.unwrap().enabled);
    }
}
