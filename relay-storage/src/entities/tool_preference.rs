//! Tool visibility preferences

/// A persisted statement of whether (and under what name/description) one
/// upstream tool is exposed, globally or for a specific client.
///
/// `client_id = None` denotes the global default row; the triple
/// `(server_id, tool_name, client_id)` is unique.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolPreference {
    pub id: i64,
    pub server_id: String,
    pub tool_name: String,
    pub client_id: Option<String>,
    pub enabled: bool,
    /// Description announced by the upstream at discovery time
    pub original_description: Option<String>,
    pub custom_name: Option<String>,
    pub custom_description: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}
