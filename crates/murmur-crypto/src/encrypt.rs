use aes_gcm::{
    Aes256Gcm, Key, Nonce, Tag,
    aead::{AeadInPlace, KeyInit, OsRng, rand_core::RngCore},
};

use crate::error::CryptoError;
use crate::keys::SecretKey;

pub const IV_SIZE: usize = 12;
pub const TAG_SIZE: usize = 16;

/// Ciphertext with its IV and detached GCM tag, stored as three columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub iv: Vec<u8>,
    pub tag: Vec<u8>,
    pub ciphertext: Vec<u8>,
}

/// Associated data for a chat message: binds the ciphertext to who sent it
/// and who it was addressed to.
///
/// Layout: `"murmur-msg:" || sender || 0x00 || recipient` (empty recipient
/// for broadcast). Usernames cannot contain NUL, so the encoding is unambiguous.
pub fn message_aad(sender: &str, recipient: Option<&str>) -> Vec<u8> {
    let recipient = recipient.unwrap_or("");
    let mut aad = Vec::with_capacity(11 + sender.len() + 1 + recipient.len());
    aad.extend_from_slice(b"murmur-msg:");
    aad.extend_from_slice(sender.as_bytes());
    aad.push(0);
    aad.extend_from_slice(recipient.as_bytes());
    aad
}

/// Encrypt with AES-256-GCM under a fresh random 96-bit IV.
pub fn encrypt_message(
    key: &SecretKey,
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Envelope, CryptoError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));

    let mut iv = [0u8; IV_SIZE];
    OsRng.fill_bytes(&mut iv);

    let mut buffer = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(Nonce::from_slice(&iv), aad, &mut buffer)
        .map_err(|_| CryptoError::Encryption)?;

    Ok(Envelope {
        iv: iv.to_vec(),
        tag: tag.to_vec(),
        ciphertext: buffer,
    })
}

/// Decrypt and verify an envelope. Never returns plaintext that failed
/// authentication.
pub fn decrypt_message(
    key: &SecretKey,
    envelope: &Envelope,
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    // from_slice panics on a length mismatch, so check before building them
    if envelope.iv.len() != IV_SIZE {
        return Err(CryptoError::MalformedEnvelope(format!(
            "iv is {} bytes, expected {}",
            envelope.iv.len(),
            IV_SIZE
        )));
    }
    if envelope.tag.len() != TAG_SIZE {
        return Err(CryptoError::MalformedEnvelope(format!(
            "tag is {} bytes, expected {}",
            envelope.tag.len(),
            TAG_SIZE
        )));
    }

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let mut buffer = envelope.ciphertext.clone();
    cipher
        .decrypt_in_place_detached(
            Nonce::from_slice(&envelope.iv),
            aad,
            &mut buffer,
            Tag::from_slice(&envelope.tag),
        )
        .map_err(|_| CryptoError::Authentication)?;

    Ok(buffer)
}
