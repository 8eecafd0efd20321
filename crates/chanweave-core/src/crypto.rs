//! Password-based payload encryption using ChaCha20-Poly1305 AEAD
//!
//! Password-protected channels encrypt every JSON payload with a key derived
//! from the shared channel secret. Each message gets its own random salt and
//! nonce, so identical plaintexts never produce identical ciphertexts.
//!
//! # Wire Format
//!
//! `base64( [salt (16 bytes)] + [nonce (12 bytes)] + [ciphertext + auth_tag (16 bytes)] )`
//!
//! The key is `HKDF-SHA256(ikm = secret, salt = salt, info = KEY_INFO)`.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use hkdf::Hkdf;
use rand::RngCore;
use serde_json::Value;
use sha2::Sha256;

use crate::error::{ChannelError, ChannelResult};

/// Nonce size for ChaCha20-Poly1305 (12 bytes)
pub const NONCE_SIZE: usize = 12;

/// Per-message salt size for key derivation
pub const SALT_SIZE: usize = 16;

/// Authentication tag appended by the AEAD
const TAG_SIZE: usize = 16;

/// Domain separation for derived channel keys
const KEY_INFO: &[u8] = b"chanweave/channel-secret/v1";

fn derive_cipher(secret: &str, salt: &[u8]) -> ChannelResult<ChaCha20Poly1305> {
    let hk = Hkdf::<Sha256>::new(Some(salt), secret.as_bytes());
    let mut key = [0u8; 32];
    hk.expand(KEY_INFO, &mut key)
        .map_err(|e| ChannelError::Crypto(format!("Key derivation failed: {}", e)))?;
    Ok(ChaCha20Poly1305::new((&key).into()))
}

/// Encrypt a JSON value under a channel secret.
///
/// Returns an opaque base64 string suitable for publishing as a payload.
pub fn encrypt_json(value: &Value, secret: &str) -> ChannelResult<String> {
    let plaintext = serde_json::to_vec(value)?;

    let mut salt = [0u8; SALT_SIZE];
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    let mut rng = rand::rng();
    rng.fill_bytes(&mut salt);
    rng.fill_bytes(&mut nonce_bytes);

    let cipher = derive_cipher(secret, &salt)?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_slice())
        .map_err(|e| ChannelError::Crypto(format!("Encryption failed: {}", e)))?;

    let mut out = Vec::with_capacity(SALT_SIZE + NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(&salt);
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);

    Ok(STANDARD.encode(out))
}

/// Decrypt an opaque string produced by [`encrypt_json`].
///
/// A wrong secret, tampered data, or malformed input all produce
/// [`ChannelError::DecryptionFailure`].
pub fn decrypt_json(opaque: &str, secret: &str) -> ChannelResult<Value> {
    let data = STANDARD
        .decode(opaque)
        .map_err(|e| ChannelError::DecryptionFailure(format!("Invalid base64: {}", e)))?;

    if data.len() < SALT_SIZE + NONCE_SIZE + TAG_SIZE {
        return Err(ChannelError::DecryptionFailure(
            "Data too short to contain salt, nonce and tag".to_string(),
        ));
    }

    let (salt, rest) = data.split_at(SALT_SIZE);
    let (nonce, ciphertext) = rest.split_at(NONCE_SIZE);

    let cipher = derive_cipher(secret, salt)?;
    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|e| ChannelError::DecryptionFailure(format!("{}", e)))?;

    serde_json::from_slice(&plaintext)
        .map_err(|e| ChannelError::DecryptionFailure(format!("Plaintext is not JSON: {}", e)))
}

/// Random lowercase hex string of exactly `length` characters.
pub fn random_hex(length: usize) -> String {
    let mut bytes = vec![0u8; length.div_ceil(2)];
    rand::rng().fill_bytes(&mut bytes);
    let mut encoded = hex::encode(bytes);
    encoded.truncate(length);
    encoded
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_encrypt_decrypt() {
        let value = json!({"type": "text", "text": "hello", "timestamp": 1});
        let opaque = encrypt_json(&value, "hunter2").unwrap();
        assert_eq!(decrypt_json(&opaque, "hunter2").unwrap(), value);
    }

    #[test]
    fn test_ciphertext_is_randomized() {
        let value = json!({"text": "same"});
        let a = encrypt_json(&value, "s").unwrap();
        let b = encrypt_json(&value, "s").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_secret_fails() {
        let opaque = encrypt_json(&json!("secret stuff"), "right").unwrap();
        let err = decrypt_json(&opaque, "wrong").unwrap_err();
        assert!(matches!(err, ChannelError::DecryptionFailure(_)));
    }

    #[test]
    fn test_tampered_and_malformed_input() {
        let opaque = encrypt_json(&json!({"n": 1}), "k").unwrap();
        let mut bytes = STANDARD.decode(&opaque).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        let tampered = STANDARD.encode(bytes);

        assert!(matches!(
            decrypt_json(&tampered, "k"),
            Err(ChannelError::DecryptionFailure(_))
        ));
        assert!(matches!(
            decrypt_json("not base64!!", "k"),
            Err(ChannelError::DecryptionFailure(_))
        ));
        assert!(matches!(
            decrypt_json(&STANDARD.encode([0u8; 8]), "k"),
            Err(ChannelError::DecryptionFailure(_))
        ));
    }

    #[test]
    fn test_random_hex_length() {
        for len in [0, 1, 7, 16, 33] {
            let h = random_hex(len);
            assert_eq!(h.len(), len);
            assert!(h.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        }
        assert_ne!(random_hex(32), random_hex(32));
    }
}
