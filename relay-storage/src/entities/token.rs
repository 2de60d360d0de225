//! Client bearer tokens

/// An opaque bearer credential bound to a client and an explicit server set.
///
/// The `id` is the credential itself. An empty `server_ids` grants nothing;
/// access is always explicit.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientToken {
    pub id: String,
    pub client_id: String,
    pub server_ids: Vec<String>,
    pub scopes: Vec<String>,
    pub issued_at: i64,
}
