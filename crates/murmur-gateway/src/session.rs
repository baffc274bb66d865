//! Per-connection state machine.
//!
//! ```text
//! Connecting --Identify ok--> Authenticated --history queued--> Joined
//!      |                            |                             |
//!      +----------------------------+------- close() ------------> Closed
//! ```
//!
//! A session reacts to [`GatewayCommand`]s and queues [`GatewayEvent`]s on
//! its outbound channel. It knows nothing about WebSockets; `connection`
//! feeds it frames.

use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use murmur_types::events::{ErrorCode, GatewayCommand, GatewayEvent};

use crate::auth::{AuthError, AuthService, validate_username};
use crate::dispatcher::Dispatcher;
use crate::error::GatewayError;
use crate::registry::{ConnectionId, EventSender};

/// Longest accepted message body, in characters.
pub const MAX_MESSAGE_CHARS: usize = 4000;

/// Failed `Identify` attempts before the connection is dropped.
pub const MAX_IDENTIFY_ATTEMPTS: u8 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Authenticated { username: String },
    Joined { username: String },
    Closed,
}

/// What the transport should do after a command was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

pub struct Session {
    id: ConnectionId,
    state: SessionState,
    dispatcher: Dispatcher,
    auth: Arc<dyn AuthService>,
    outbound: EventSender,
    failed_identifies: u8,
}

impl Session {
    pub fn new(dispatcher: Dispatcher, auth: Arc<dyn AuthService>, outbound: EventSender) -> Self {
        Self {
            id: Uuid::new_v4(),
            state: SessionState::Connecting,
            dispatcher,
            auth,
            outbound,
            failed_identifies: 0,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn is_joined(&self) -> bool {
        matches!(self.state, SessionState::Joined { .. })
    }

    /// Handle one raw text frame.
    pub async fn handle_text(&mut self, text: &str) -> Flow {
        match serde_json::from_str::<GatewayCommand>(text) {
            Ok(cmd) => self.handle(cmd).await,
            Err(e) => {
                warn!(
                    conn_id = %self.id,
                    "bad command: {} -- raw: {}",
                    e,
                    text.chars().take(200).collect::<String>()
                );
                self.reply_error(ErrorCode::BadCommand, format!("unrecognized command: {}", e));
                Flow::Continue
            }
        }
    }

    pub async fn handle(&mut self, cmd: GatewayCommand) -> Flow {
        if self.state == SessionState::Closed {
            return Flow::Close;
        }

        match cmd {
            GatewayCommand::Identify { username, password } => {
                if self.state != SessionState::Connecting {
                    self.reply_error(ErrorCode::AlreadyIdentified, "already identified".into());
                    return Flow::Continue;
                }
                self.identify(username, password).await
            }

            GatewayCommand::SendMessage { content, recipient } => {
                let SessionState::Joined { username } = &self.state else {
                    self.reply_error(ErrorCode::NotIdentified, "identify before sending".into());
                    return Flow::Continue;
                };
                let username = username.clone();
                self.send_message(&username, content, recipient).await;
                Flow::Continue
            }
        }
    }

    /// Leave the registry. Idempotent; must run before the transport drops
    /// the outbound receiver.
    pub async fn close(&mut self) {
        if let SessionState::Joined { username } | SessionState::Authenticated { username } =
            &self.state
        {
            info!(conn_id = %self.id, username = %username, "Connection closed");
            self.dispatcher.leave(self.id).await;
        }
        self.state = SessionState::Closed;
    }

    async fn identify(&mut self, username: String, password: String) -> Flow {
        let identity = match self.auth.verify(&username, &password).await {
            Ok(identity) => identity,
            Err(AuthError::Unavailable(reason)) => {
                warn!(conn_id = %self.id, %reason, "Credential store unavailable");
                self.reply_error(ErrorCode::Internal, "login temporarily unavailable".into());
                return Flow::Continue;
            }
            Err(e) => {
                self.failed_identifies += 1;
                warn!(
                    conn_id = %self.id,
                    username = %username,
                    attempt = self.failed_identifies,
                    reason = %e,
                    "Identify rejected"
                );
                self.reply_error(ErrorCode::InvalidCredentials, "invalid username or password".into());
                if self.failed_identifies >= MAX_IDENTIFY_ATTEMPTS {
                    return Flow::Close;
                }
                return Flow::Continue;
            }
        };

        self.state = SessionState::Authenticated {
            username: identity.username.clone(),
        };

        match self
            .dispatcher
            .join(self.id, &identity.username, self.outbound.clone())
            .await
        {
            Ok(()) => {
                self.state = SessionState::Joined {
                    username: identity.username,
                };
                Flow::Continue
            }
            Err(e) => {
                warn!(conn_id = %self.id, error = %e, "Join failed");
                self.reply_error(e.code(), "history unavailable, try again later".into());
                Flow::Close
            }
        }
    }

    async fn send_message(&self, username: &str, content: String, recipient: Option<String>) {
        if let Err(e) = validate_message(&content, recipient.as_deref()) {
            self.reply_error(e.code(), e.client_message());
            return;
        }

        if let Err(e) = self
            .dispatcher
            .send_message(self.id, username, &content, recipient.as_deref())
            .await
        {
            self.reply_error(e.code(), e.client_message());
        }
    }

    fn reply_error(&self, code: ErrorCode, message: String) {
        // A closed queue means the transport is already gone.
        let _ = self.outbound.send(GatewayEvent::Error { code, message });
    }
}

/// Boundary validation for `SendMessage`.
pub fn validate_message(content: &str, recipient: Option<&str>) -> Result<(), GatewayError> {
    if content.trim().is_empty() {
        return Err(GatewayError::Validation("message is empty".into()));
    }
    if content.chars().count() > MAX_MESSAGE_CHARS {
        return Err(GatewayError::Validation(format!(
            "message exceeds {} characters",
            MAX_MESSAGE_CHARS
        )));
    }
    if let Some(recipient) = recipient {
        validate_username(recipient)
            .map_err(|reason| GatewayError::Validation(format!("recipient: {}", reason)))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_validation() {
        assert!(validate_message("hi", None).is_ok());
        assert!(validate_message("hi", Some("bob")).is_ok());
        assert!(validate_message("   ", None).is_err());
        assert!(validate_message("", None).is_err());
        assert!(validate_message(&"é".repeat(MAX_MESSAGE_CHARS), None).is_ok());
        assert!(validate_message(&"x".repeat(MAX_MESSAGE_CHARS + 1), None).is_err());
        assert!(matches!(
            validate_message("hi", Some("no spaces")),
            Err(GatewayError::Validation(_))
        ));
    }
}
