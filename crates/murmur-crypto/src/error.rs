use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Tag mismatch: wrong key, wrong associated data, or tampered bytes.
    #[error("message failed authentication")]
    Authentication,

    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("encryption failed")]
    Encryption,

    #[error("invalid key: {0}")]
    InvalidKey(String),
}

impl CryptoError {
    /// Errors that mean "this stored record cannot be read", as opposed to a
    /// problem with the local key material.
    pub fn is_undecryptable(&self) -> bool {
        matches!(self, Self::Authentication | Self::MalformedEnvelope(_))
    }
}
