/// Murmur Crypto Library
///
/// Authenticated encryption (AES-256-GCM) of message payloads under per-user
/// keys. Every user key is derived from the server master key with
/// HKDF-SHA256 and the username, so keys are never written to the database.
/// The derived key is shown to its owner once, at registration.

pub mod encrypt;
pub mod error;
pub mod keys;

pub use encrypt::{Envelope, decrypt_message, encrypt_message, message_aad};
pub use error::CryptoError;
pub use keys::{KeyRing, SecretKey};
