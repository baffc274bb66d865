use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::ChatMessage;

/// Events sent over the WebSocket gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayEvent {
    /// Server confirms successful authentication
    Ready {
        username: String,
        online_users: Vec<String>,
    },

    /// Stored messages visible to this user, oldest first. Always sent
    /// exactly once, right after `Ready` and before any `MessageCreate`.
    History { messages: Vec<ChatMessage> },

    /// A new message was posted
    MessageCreate { message: ChatMessage },

    /// A user came online or went offline
    PresenceUpdate { username: String, online: bool },

    /// Some of this user's messages are about to expire
    RetentionWarning {
        message_count: u64,
        delete_at: DateTime<Utc>,
    },

    /// A command was rejected
    Error { code: ErrorCode, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    BadCommand,
    InvalidCredentials,
    NotIdentified,
    AlreadyIdentified,
    InvalidMessage,
    StorageUnavailable,
    Internal,
}

/// Commands sent FROM client TO server over WebSocket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayCommand {
    /// Authenticate the WebSocket connection
    Identify { username: String, password: String },

    /// Post a message. Without a recipient it goes to everyone online.
    SendMessage {
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        recipient: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MessageContent;

    #[test]
    fn command_wire_format() {
        let cmd: GatewayCommand = serde_json::from_str(
            r#"{"type":"SendMessage","data":{"content":"hi"}}"#,
        )
        .unwrap();
        assert_eq!(
            cmd,
            GatewayCommand::SendMessage {
                content: "hi".into(),
                recipient: None
            }
        );

        let cmd: GatewayCommand = serde_json::from_str(
            r#"{"type":"SendMessage","data":{"content":"psst","recipient":"bob"}}"#,
        )
        .unwrap();
        assert!(matches!(
            cmd,
            GatewayCommand::SendMessage { recipient: Some(ref r), .. } if r == "bob"
        ));
    }

    #[test]
    fn undecryptable_marker_serializes_without_text() {
        let event = GatewayEvent::MessageCreate {
            message: ChatMessage {
                id: 7,
                sender: "alice".into(),
                recipient: None,
                content: MessageContent::Undecryptable,
                timestamp: DateTime::<Utc>::UNIX_EPOCH,
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "MessageCreate");
        assert_eq!(json["data"]["message"]["content"]["kind"], "undecryptable");
        assert!(json["data"]["message"]["content"].get("text").is_none());
    }

    #[test]
    fn error_codes_are_snake_case() {
        let json = serde_json::to_string(&ErrorCode::StorageUnavailable).unwrap();
        assert_eq!(json, r#""storage_unavailable""#);
    }
}
