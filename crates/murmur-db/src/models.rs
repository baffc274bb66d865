//! Database row types. These map directly to SQLite rows.
//! Distinct from murmur-types wire models to keep the DB layer independent.

use chrono::{DateTime, Utc};

pub struct UserRow {
    pub username: String,
    pub password: String,
    pub created_at: String,
}

/// A message about to be appended. It has no timestamp: the store assigns
/// one at insertion.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub sender: String,
    pub recipient: Option<String>,
    pub iv: Vec<u8>,
    pub tag: Vec<u8>,
    pub ciphertext: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRow {
    pub id: i64,
    pub sender: String,
    pub recipient: Option<String>,
    pub iv: Vec<u8>,
    pub tag: Vec<u8>,
    pub ciphertext: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub warned: bool,
}

impl MessageRow {
    /// Whether `username` may see this message: broadcasts are public,
    /// directed messages only to their two parties.
    pub fn is_visible_to(&self, username: &str) -> bool {
        match &self.recipient {
            None => true,
            Some(recipient) => recipient == username || self.sender == username,
        }
    }
}
