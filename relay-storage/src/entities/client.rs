//! API client records

/// An API client of the broker. Lifetime is independent of its tokens;
/// deleting a client cascades its tokens away.
#[derive(Debug, Clone, PartialEq)]
pub struct Client {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Client {
    pub fn new(name: impl Into<String>, description: Option<String>) -> Self {
        let now = crate::now_millis();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            description,
            created_at: now,
            updated_at: now,
        }
    }
}
