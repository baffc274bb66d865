use thiserror::Error;

use murmur_crypto::CryptoError;
use murmur_db::StoreError;
use murmur_types::events::ErrorCode;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Malformed or missing input, rejected before it reaches the store.
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// The message was not persisted and must not be delivered.
    #[error("storage unavailable: {0}")]
    Storage(#[from] StoreError),
}

impl GatewayError {
    /// Code reported to the client in an `Error` event.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Validation(_) => ErrorCode::InvalidMessage,
            Self::Crypto(_) => ErrorCode::Internal,
            Self::Storage(_) => ErrorCode::StorageUnavailable,
        }
    }

    /// Message safe to show a client. Internal details stay in the logs.
    pub fn client_message(&self) -> String {
        match self {
            Self::Validation(reason) => reason.clone(),
            Self::Crypto(_) => "message could not be encrypted".into(),
            Self::Storage(_) => "message was not stored, try again".into(),
        }
    }
}

/// Inconsistent settings. Fatal at startup.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid retention policy: {0}")]
    Retention(String),
}
