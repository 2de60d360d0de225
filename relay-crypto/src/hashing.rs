//! Salted password hashing with constant-time verification

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha512;
use subtle::ConstantTimeEq;

const SALT_LEN: usize = 64;
const DIGEST_LEN: usize = 64;
const ITERATIONS: u32 = 10_000;

/// Hash `data` with a fresh 64-byte salt.
///
/// Output format is `base64(salt):base64(digest)`.
pub fn hash(data: &str) -> String {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);

    let mut digest = [0u8; DIGEST_LEN];
    pbkdf2_hmac::<Sha512>(data.as_bytes(), &salt, ITERATIONS, &mut digest);

    format!("{}:{}", BASE64.encode(salt), BASE64.encode(digest))
}

/// Verify `data` against a stored salted digest in constant time
pub fn verify(data: &str, stored: &str) -> bool {
    let Some((salt_b64, digest_b64)) = stored.split_once(':') else {
        return false;
    };
    let (Ok(salt), Ok(expected)) = (BASE64.decode(salt_b64), BASE64.decode(digest_b64)) else {
        return false;
    };
    if expected.len() != DIGEST_LEN {
        return false;
    }

    let mut digest = [0u8; DIGEST_LEN];
    pbkdf2_hmac::<Sha512>(data.as_bytes(), &salt, ITERATIONS, &mut digest);

    digest.ct_eq(expected.as_slice()).into()
}

/// Constant-time equality over two untrusted strings
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_verify_round_trip() {
        let stored = hash("correct horse battery staple");
        assert!(verify("correct horse battery staple", &stored));
        assert!(!verify("incorrect horse", &stored));
    }

    #[test]
    fn test_hashes_are_salted() {
        assert_ne!(hash("same"), hash("same"));
    }

    #[test]
    fn test_malformed_stored_digest() {
        assert!(!verify("anything", "no-colon-here"));
        assert!(!verify("anything", "bad!:base64!"));
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq("token-a", "token-a"));
        assert!(!constant_time_eq("token-a", "token-b"));
        assert!(!constant_time_eq("token-a", "token-aa"));
    }
}
