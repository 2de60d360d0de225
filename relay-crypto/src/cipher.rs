//! Column cipher for sensitive store values

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use arc_swap::ArcSwap;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;
use std::sync::Arc;

use crate::error::{CryptoError, CryptoResult};
use crate::keyfile::KEY_LEN;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// AES-256-GCM cipher over a swappable master key.
///
/// Output layout is `nonce(12) || tag(16) || ciphertext`, base64-encoded.
/// The empty string encrypts to the empty string. Reads of the key are
/// lock-free; `swap_key` is called by rotation after the re-encrypted rows
/// have been committed.
pub struct SecretCipher {
    key: ArcSwap<[u8; KEY_LEN]>,
}

impl std::fmt::Debug for SecretCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecretCipher(************)")
    }
}

impl SecretCipher {
    pub fn new(key: [u8; KEY_LEN]) -> Self {
        Self {
            key: ArcSwap::from_pointee(key),
        }
    }

    /// Encrypt a plaintext column value
    pub fn encrypt(&self, plaintext: &str) -> CryptoResult<String> {
        if plaintext.is_empty() {
            return Ok(String::new());
        }
        let key = self.key.load();
        encrypt_with_key(key.as_ref(), plaintext)
    }

    /// Decrypt a column value; tag mismatch is an error the caller must
    /// propagate
    pub fn decrypt(&self, ciphertext: &str) -> CryptoResult<String> {
        if ciphertext.is_empty() {
            return Ok(String::new());
        }
        let key = self.key.load();
        decrypt_with_key(key.as_ref(), ciphertext)
    }

    /// Replace the active key. Rotation commits re-encrypted rows first.
    pub fn swap_key(&self, key: [u8; KEY_LEN]) {
        self.key.store(Arc::new(key));
    }
}

/// Encrypt under an explicit key (rotation uses this before the swap)
pub fn encrypt_with_key(key: &[u8; KEY_LEN], plaintext: &str) -> CryptoResult<String> {
    if plaintext.is_empty() {
        return Ok(String::new());
    }

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    // aes-gcm appends the tag to the ciphertext; re-order into
    // nonce || tag || ciphertext
    let sealed = cipher
        .encrypt(nonce, plaintext.as_bytes())
        .map_err(|_| CryptoError::EncryptionFailed)?;
    let (body, tag) = sealed.split_at(sealed.len() - TAG_LEN);

    let mut out = Vec::with_capacity(NONCE_LEN + TAG_LEN + body.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(tag);
    out.extend_from_slice(body);
    Ok(BASE64.encode(out))
}

/// Decrypt under an explicit key
pub fn decrypt_with_key(key: &[u8; KEY_LEN], ciphertext: &str) -> CryptoResult<String> {
    if ciphertext.is_empty() {
        return Ok(String::new());
    }

    let raw = BASE64
        .decode(ciphertext)
        .map_err(|e| CryptoError::InvalidFormat(format!("base64: {}", e)))?;
    if raw.len() < NONCE_LEN + TAG_LEN {
        return Err(CryptoError::InvalidFormat(format!(
            "ciphertext too short: {} bytes",
            raw.len()
        )));
    }

    let (nonce_bytes, rest) = raw.split_at(NONCE_LEN);
    let (tag, body) = rest.split_at(TAG_LEN);

    let mut sealed = Vec::with_capacity(body.len() + TAG_LEN);
    sealed.extend_from_slice(body);
    sealed.extend_from_slice(tag);

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let nonce = Nonce::from_slice(nonce_bytes);
    let plaintext = cipher
        .decrypt(nonce, sealed.as_ref())
        .map_err(|_| CryptoError::DecryptionFailed)?;

    String::from_utf8(plaintext)
        .map_err(|_| CryptoError::InvalidFormat("decrypted value is not UTF-8".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> [u8; KEY_LEN] {
        let mut key = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut key);
        key
    }

    #[test]
    fn test_round_trip() {
        let cipher = SecretCipher::new(test_key());
        let plaintext = "ghp_supersecrettoken";
        let sealed = cipher.encrypt(plaintext).unwrap();
        assert_ne!(sealed, plaintext);
        assert!(!sealed.contains(plaintext));
        assert_eq!(cipher.decrypt(&sealed).unwrap(), plaintext);
    }

    #[test]
    fn test_empty_string_passthrough() {
        let cipher = SecretCipher::new(test_key());
        assert_eq!(cipher.encrypt("").unwrap(), "");
        assert_eq!(cipher.decrypt("").unwrap(), "");
    }

    #[test]
    fn test_fresh_nonce_per_call() {
        let cipher = SecretCipher::new(test_key());
        let a = cipher.encrypt("same input").unwrap();
        let b = cipher.encrypt("same input").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let cipher = SecretCipher::new(test_key());
        let sealed = cipher.encrypt("payload").unwrap();

        let mut raw = BASE64.decode(&sealed).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        let tampered = BASE64.encode(raw);

        assert!(matches!(
            cipher.decrypt(&tampered),
            Err(CryptoError::DecryptionFailed)
        ));
    }

    #[test]
    fn test_wrong_key_fails() {
        let cipher = SecretCipher::new(test_key());
        let sealed = cipher.encrypt("payload").unwrap();

        let other = SecretCipher::new(test_key());
        assert!(other.decrypt(&sealed).is_err());
    }

    #[test]
    fn test_swap_key_changes_active_key() {
        let cipher = SecretCipher::new(test_key());
        let sealed_old = cipher.encrypt("payload").unwrap();

        let new_key = test_key();
        cipher.swap_key(new_key);
        // Old ciphertext no longer decrypts, new round trips do
        assert!(cipher.decrypt(&sealed_old).is_err());
        let sealed_new = cipher.encrypt("payload").unwrap();
        assert_eq!(cipher.decrypt(&sealed_new).unwrap(), "payload");
    }

    #[test]
    fn test_garbage_input_is_invalid_format() {
        let cipher = SecretCipher::new(test_key());
        assert!(matches!(
            cipher.decrypt("not base64!!!"),
            Err(CryptoError::InvalidFormat(_))
        ));
        assert!(matches!(
            cipher.decrypt("AAAA"),
            Err(CryptoError::InvalidFormat(_))
        ));
    }
}
