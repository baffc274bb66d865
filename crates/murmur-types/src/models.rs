use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A message as a client sees it: already decrypted by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: i64,
    pub sender: String,
    /// `None` for broadcast messages.
    pub recipient: Option<String>,
    pub content: MessageContent,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    pub fn is_broadcast(&self) -> bool {
        self.recipient.is_none()
    }

    /// Plaintext if the stored record could be decrypted.
    pub fn text(&self) -> Option<&str> {
        match &self.content {
            MessageContent::Text { text } => Some(text),
            MessageContent::Undecryptable => None,
        }
    }
}

/// Body of a delivered message. A record whose envelope fails authentication
/// is still listed in history, but with its content replaced by a marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageContent {
    Text { text: String },
    Undecryptable,
}
