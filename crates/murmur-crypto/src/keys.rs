use std::fmt;

use aes_gcm::aead::OsRng;
use aes_gcm::aead::rand_core::RngCore;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use hkdf::Hkdf;
use sha2::Sha256;

use crate::error::CryptoError;

pub const KEY_SIZE: usize = 32;

/// 256-bit AES-GCM key.
pub type SecretKey = [u8; KEY_SIZE];

const USER_KEY_INFO: &[u8] = b"murmur-user-key:";

/// Generate a random 256-bit key.
pub fn generate_key() -> SecretKey {
    let mut key = [0u8; KEY_SIZE];
    OsRng.fill_bytes(&mut key);
    key
}

/// Encode a key to base64 for display/sharing.
pub fn key_to_base64(key: &SecretKey) -> String {
    BASE64.encode(key)
}

/// Decode a base64 key.
pub fn key_from_base64(encoded: &str) -> Result<SecretKey, CryptoError> {
    let bytes = BASE64
        .decode(encoded.trim())
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| CryptoError::InvalidKey(format!("expected {} bytes, got {}", KEY_SIZE, b.len())))
}

/// Holds the server master key and derives per-user message keys from it.
///
/// user_key = HKDF-SHA256(ikm = master, salt = none, info = "murmur-user-key:" || username)
#[derive(Clone)]
pub struct KeyRing {
    master: SecretKey,
}

impl KeyRing {
    pub fn new(master: SecretKey) -> Self {
        Self { master }
    }

    pub fn user_key(&self, username: &str) -> Result<SecretKey, CryptoError> {
        let hk = Hkdf::<Sha256>::new(None, &self.master);

        let mut info = Vec::with_capacity(USER_KEY_INFO.len() + username.len());
        info.extend_from_slice(USER_KEY_INFO);
        info.extend_from_slice(username.as_bytes());

        let mut key = [0u8; KEY_SIZE];
        hk.expand(&info, &mut key)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Ok(key)
    }
}

impl fmt::Debug for KeyRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyRing").field("master", &"<redacted>").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_keys_are_stable_and_distinct() {
        let ring = KeyRing::new([7u8; KEY_SIZE]);
        let alice = ring.user_key("alice").unwrap();
        assert_eq!(alice, ring.user_key("alice").unwrap());
        assert_ne!(alice, ring.user_key("bob").unwrap());

        let other = KeyRing::new([8u8; KEY_SIZE]);
        assert_ne!(alice, other.user_key("alice").unwrap());
    }

    #[test]
    fn base64_roundtrip_and_length_check() {
        let key = generate_key();
        assert_eq!(key_from_base64(&key_to_base64(&key)).unwrap(), key);

        let short = BASE64.encode([1u8; 16]);
        assert!(matches!(key_from_base64(&short), Err(CryptoError::InvalidKey(_))));
        assert!(key_from_base64("not base64!").is_err());
    }

    #[test]
    fn debug_does_not_leak_master_key() {
        let ring = KeyRing::new([0xAB; KEY_SIZE]);
        let printed = format!("{:?}", ring);
        assert!(printed.contains("redacted"));
        assert!(!printed.contains("171"));
    }
}
