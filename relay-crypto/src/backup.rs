//! Passphrase-based backup encryption

use aes_gcm::{
    aead::{consts::U16, Aead, KeyInit},
    aes::Aes256,
    AesGcm, Key, Nonce,
};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;

use crate::error::{CryptoError, CryptoResult};

const SALT_LEN: usize = 32;
const IV_LEN: usize = 16;
const TAG_LEN: usize = 16;
const ITERATIONS: u32 = 100_000;

// Backup blobs use a 128-bit IV for compatibility with the on-disk format
type BackupCipher = AesGcm<Aes256, U16>;

fn derive_key(passphrase: &str, salt: &[u8]) -> [u8; 32] {
    let mut key = [0u8; 32];
    pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, ITERATIONS, &mut key);
    key
}

/// Encrypt a backup blob under a passphrase.
///
/// Output layout: `salt(32) || iv(16) || tag(16) || ciphertext`.
pub fn backup_encrypt(blob: &[u8], passphrase: &str) -> CryptoResult<Vec<u8>> {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);

    let key = derive_key(passphrase, &salt);
    let cipher = BackupCipher::new(Key::<BackupCipher>::from_slice(&key));
    let sealed = cipher
        .encrypt(Nonce::<U16>::from_slice(&iv), blob)
        .map_err(|_| CryptoError::EncryptionFailed)?;
    let (body, tag) = sealed.split_at(sealed.len() - TAG_LEN);

    let mut out = Vec::with_capacity(SALT_LEN + IV_LEN + TAG_LEN + body.len());
    out.extend_from_slice(&salt);
    out.extend_from_slice(&iv);
    out.extend_from_slice(tag);
    out.extend_from_slice(body);
    Ok(out)
}

/// Decrypt a backup blob; a wrong passphrase fails the tag check
pub fn backup_decrypt(blob: &[u8], passphrase: &str) -> CryptoResult<Vec<u8>> {
    if blob.len() < SALT_LEN + IV_LEN + TAG_LEN {
        return Err(CryptoError::InvalidFormat(format!(
            "backup blob too short: {} bytes",
            blob.len()
        )));
    }

    let (salt, rest) = blob.split_at(SALT_LEN);
    let (iv, rest) = rest.split_at(IV_LEN);
    let (tag, body) = rest.split_at(TAG_LEN);

    let mut sealed = Vec::with_capacity(body.len() + TAG_LEN);
    sealed.extend_from_slice(body);
    sealed.extend_from_slice(tag);

    let key = derive_key(passphrase, salt);
    let cipher = BackupCipher::new(Key::<BackupCipher>::from_slice(&key));
    cipher
        .decrypt(Nonce::<U16>::from_slice(iv), sealed.as_ref())
        .map_err(|_| CryptoError::DecryptionFailed)
}
