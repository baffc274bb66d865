use async_trait::async_trait;
use thiserror::Error;

pub const USERNAME_MIN_LEN: usize = 3;
pub const USERNAME_MAX_LEN: usize = 32;
pub const PASSWORD_MIN_LEN: usize = 8;

/// A verified user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub username: String,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("username already taken")]
    UsernameTaken,

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("no such user")]
    NotFound,

    #[error("wrong password")]
    WrongPassword,

    #[error("credential store unavailable: {0}")]
    Unavailable(String),
}

/// Credential storage and verification. The gateway only looks at whether
/// `verify` succeeded before letting a connection join.
#[async_trait]
pub trait AuthService: Send + Sync {
    async fn register(&self, username: &str, password: &str) -> Result<(), AuthError>;

    async fn verify(&self, username: &str, password: &str) -> Result<Identity, AuthError>;
}

/// Usernames are 3-32 characters of ASCII letters, digits, `_`, `.` and `-`.
pub fn validate_username(username: &str) -> Result<(), String> {
    if username.len() < USERNAME_MIN_LEN || username.len() > USERNAME_MAX_LEN {
        return Err(format!(
            "username must be {}-{} characters",
            USERNAME_MIN_LEN, USERNAME_MAX_LEN
        ));
    }
    if !username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
    {
        return Err("username may only contain letters, digits, '_', '.' and '-'".into());
    }
    Ok(())
}

pub fn validate_password(password: &str) -> Result<(), String> {
    if password.len() < PASSWORD_MIN_LEN {
        return Err(format!("password must be at least {} characters", PASSWORD_MIN_LEN));
    }
    Ok(())
}
