//! At-rest encryption for credentials.
//!
//! AES-256-GCM with a per-row key derived by PBKDF2-HMAC-SHA256 from the
//! service master key and a random per-row salt. Wire form is
//! base64(salt ‖ nonce ‖ ciphertext).

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use ovs_schemas::OvsError;
use rand::RngCore;
use sha2::Sha256;

pub const PBKDF2_ITERATIONS: u32 = 100_000;
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;

fn derive_key(master_key: &str, salt: &[u8]) -> [u8; 32] {
    let mut key = [0u8; 32];
    pbkdf2::pbkdf2_hmac::<Sha256>(master_key.as_bytes(), salt, PBKDF2_ITERATIONS, &mut key);
    key
}

/// Encrypt `plaintext` under the master key. Every call uses a fresh salt
/// and nonce, so equal plaintexts never share ciphertext.
pub fn encrypt(master_key: &str, plaintext: &str) -> Result<String, OvsError> {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);

    let key_bytes = derive_key(master_key, &salt);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let ct = cipher
        .encrypt(&nonce, plaintext.as_bytes())
        .map_err(|_| OvsError::internal("credential encryption failed"))?;

    let mut blob = Vec::with_capacity(SALT_LEN + NONCE_LEN + ct.len());
    blob.extend_from_slice(&salt);
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&ct);
    Ok(B64.encode(blob))
}

/// Decrypt a wire-form ciphertext produced by [`encrypt`].
///
/// # Errors
/// `INTERNAL` on malformed input or authentication failure (wrong master
/// key or tampered ciphertext). The message never includes key material.
pub fn decrypt(master_key: &str, wire: &str) -> Result<String, OvsError> {
    let blob = B64
        .decode(wire)
        .map_err(|_| OvsError::internal("credential ciphertext is not valid base64"))?;

    if blob.len() < SALT_LEN + NONCE_LEN + 1 {
        return Err(OvsError::internal("credential ciphertext is truncated"));
    }

    let (salt, rest) = blob.split_at(SALT_LEN);
    let (nonce_bytes, ct) = rest.split_at(NONCE_LEN);

    let key_bytes = derive_key(master_key, salt);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));
    let nonce = Nonce::from_slice(nonce_bytes);

    let plain = cipher
        .decrypt(nonce, ct)
        .map_err(|_| OvsError::internal("credential decryption failed"))?;

    String::from_utf8(plain).map_err(|_| OvsError::internal("credential plaintext is not utf-8"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let ct = encrypt("master-key", "s3cr3t-p@ss").unwrap();
        assert_eq!(decrypt("master-key", &ct).unwrap(), "s3cr3t-p@ss");
    }

    #[test]
    fn equal_plaintexts_produce_distinct_ciphertexts() {
        let a = encrypt("master-key", "same").unwrap();
        let b = encrypt("master-key", "same").unwrap();
        assert_ne!(a, b, "fresh salt+nonce per call");
    }

    #[test]
    fn wrong_master_key_fails_closed() {
        let ct = encrypt("master-key", "secret").unwrap();
        assert!(decrypt("other-key", &ct).is_err());
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let ct = encrypt("master-key", "secret").unwrap();
        let mut blob = B64.decode(&ct).unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0x01;
        let tampered = B64.encode(blob);
        assert!(decrypt("master-key", &tampered).is_err());
    }

    #[test]
    fn garbage_input_is_an_error_not_a_panic() {
        assert!(decrypt("master-key", "not-base64!!!").is_err());
        assert!(decrypt("master-key", "AAAA").is_err());
    }
}
