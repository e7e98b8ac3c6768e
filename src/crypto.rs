//! Cryptographic primitives shared by the vault and the encrypted log.
//!
//! - **KDF**: Argon2id with 64 MiB memory, 3 iterations, parallelism=1 (RFC 9106
//!   interactive profile).
//! - **Cipher**: XChaCha20-Poly1305 (authenticated encryption, 24-byte random nonce).
//! - **Salt**: 32 bytes, randomly generated once per vault.
//!
//! Changing the KDF or its parameters requires bumping `VAULT_FORMAT_VERSION`
//! in [`crate::vault`] — existing vaults would otherwise silently fail to unlock.

use argon2::{Algorithm, Argon2, Params, Version};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::Serialize;
use subtle::ConstantTimeEq;
use thiserror::Error;

/// Length of the salt used for key derivation.
pub const SALT_LEN: usize = 32;
/// Length of the XChaCha20-Poly1305 nonce.
pub const NONCE_LEN: usize = 24;
/// Length of the derived content-encryption key.
pub const KEY_LEN: usize = 32;

/// Errors produced by the crypto layer.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("key derivation failed: {0}")]
    BadKey(String),
    #[error("decryption failed: authentication error")]
    BadCiphertext,
    #[error("serialization error: {0}")]
    SerializationError(String),
}

/// Generates a cryptographically secure random salt.
pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// Derives a 256-bit content key from a password using Argon2id.
///
/// Interactive-profile parameters: 64 MiB memory, 3 iterations, 1 lane.
pub fn derive_key(password: &str, salt: &[u8]) -> Result<[u8; KEY_LEN], CryptoError> {
    let params = Params::new(64 * 1024, 3, 1, Some(KEY_LEN))
        .map_err(|e| CryptoError::BadKey(format!("argon2 params: {e}")))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut key = [0u8; KEY_LEN];
    argon2
        .hash_password_into(password.as_bytes(), salt, &mut key)
        .map_err(|e| CryptoError::BadKey(format!("argon2: {e}")))?;
    Ok(key)
}

/// Serializes `value` to JSON and encrypts it under `key`.
///
/// Returns `nonce || ciphertext || tag`, a fresh random nonce on every call.
pub fn encrypt_json<T: Serialize>(value: &T, key: &[u8; KEY_LEN]) -> Result<Vec<u8>, CryptoError> {
    let plaintext =
        serde_json::to_vec(value).map_err(|e| CryptoError::SerializationError(e.to_string()))?;

    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce), plaintext.as_ref())
        .map_err(|_| CryptoError::BadCiphertext)?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Inverse of [`encrypt_json`]. Fails loudly on auth-tag mismatch.
pub fn decrypt_json<T: DeserializeOwned>(bytes: &[u8], key: &[u8; KEY_LEN]) -> Result<T, CryptoError> {
    if bytes.len() < NONCE_LEN {
        return Err(CryptoError::BadCiphertext);
    }
    let (nonce_bytes, ciphertext) = bytes.split_at(NONCE_LEN);

    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    let plaintext = cipher
        .decrypt(XNonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| CryptoError::BadCiphertext)?;

    serde_json::from_slice(&plaintext).map_err(|e| CryptoError::SerializationError(e.to_string()))
}

/// Keeps the first `keep` characters of `s`, replacing the remainder with `*`.
pub fn mask_sensitive_value(s: &str, keep: usize) -> String {
    let chars: Vec<char> = s.chars().collect();
    if chars.len() <= keep {
        return s.to_string();
    }
    let head: String = chars[..keep].iter().collect();
    format!("{head}{}", "*".repeat(chars.len() - keep))
}

/// Constant-time byte-string equality, for bearer-token comparison.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Payload {
        a: u32,
        b: String,
    }

    #[test]
    fn roundtrip_encrypt_decrypt() {
        let salt = generate_salt();
        let key = derive_key("correct horse battery staple", &salt).unwrap();
        let payload = Payload { a: 7, b: "hello".into() };

        let bytes = encrypt_json(&payload, &key).unwrap();
        let decoded: Payload = decrypt_json(&bytes, &key).unwrap();
        assert_eq!(payload, decoded);
    }

    #[test]
    fn wrong_key_fails_loudly() {
        let salt = generate_salt();
        let key1 = derive_key("pw1", &salt).unwrap();
        let key2 = derive_key("pw2", &salt).unwrap();
        let bytes = encrypt_json(&Payload { a: 1, b: "x".into() }, &key1).unwrap();

        let result: Result<Payload, _> = decrypt_json(&bytes, &key2);
        assert!(matches!(result, Err(CryptoError::BadCiphertext)));
    }

    #[test]
    fn nonce_is_fresh_each_call() {
        let key = [0u8; KEY_LEN];
        let a = encrypt_json(&Payload { a: 1, b: "x".into() }, &key).unwrap();
        let b = encrypt_json(&Payload { a: 1, b: "x".into() }, &key).unwrap();
        assert_ne!(a[..NONCE_LEN], b[..NONCE_LEN]);
    }

    #[test]
    fn mask_keeps_prefix() {
        assert_eq!(mask_sensitive_value("abcdef", 2), "ab****");
        assert_eq!(mask_sensitive_value("ab", 4), "ab");
    }

    #[test]
    fn constant_time_eq_matches_regular_eq() {
        assert!(constant_time_eq(b"token123", b"token123"));
        assert!(!constant_time_eq(b"token123", b"token124"));
        assert!(!constant_time_eq(b"short", b"longer-string"));
    }
}
