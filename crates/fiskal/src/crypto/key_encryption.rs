/*
 *  Copyright 2025-2026 Colliery Software
 *
 *  Licensed under the Apache License, Version 2.0 (the "License");
 *  you may not use this file except in compliance with the License.
 *  You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 *  Unless required by applicable law or agreed to in writing, software
 *  distributed under the License is distributed on an "AS IS" BASIS,
 *  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  See the License for the specific language governing permissions and
 *  limitations under the License.
 */

//! AES-256-GCM encryption for secrets at rest.
//!
//! Stored passphrases are sealed with the active data key, and data keys are
//! in turn sealed with the master key before they reach the database. The
//! sealed format is: `nonce (12 bytes) || ciphertext || tag (16 bytes)`.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use thiserror::Error;
use zeroize::Zeroizing;

/// Errors that can occur during secret encryption/decryption.
#[derive(Debug, Error)]
pub enum KeyEncryptionError {
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("Invalid key length: expected 32 bytes, got {0}")]
    InvalidKeyLength(usize),

    #[error("Invalid encrypted data: too short")]
    InvalidEncryptedData,
}

/// Length in bytes of an AES-256 data key.
pub const DATA_KEY_LEN: usize = 32;

/// Size of the AES-256-GCM nonce in bytes.
const NONCE_SIZE: usize = 12;

/// Size of the AES-256-GCM authentication tag in bytes.
const TAG_SIZE: usize = 16;

/// Generates a fresh random 32-byte data key.
pub fn generate_data_key() -> Zeroizing<[u8; DATA_KEY_LEN]> {
    let mut key = Zeroizing::new([0u8; DATA_KEY_LEN]);
    rand::thread_rng().fill_bytes(key.as_mut_slice());
    key
}

/// Encrypts `plaintext` with a 32-byte AES-256 key.
///
/// # Returns
///
/// The sealed data in format: `nonce (12 bytes) || ciphertext || tag (16 bytes)`
///
/// # Errors
///
/// Returns `KeyEncryptionError` if encryption fails or the key length is invalid.
pub fn encrypt_secret(plaintext: &[u8], key: &[u8]) -> Result<Vec<u8>, KeyEncryptionError> {
    if key.len() != DATA_KEY_LEN {
        return Err(KeyEncryptionError::InvalidKeyLength(key.len()));
    }

    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| KeyEncryptionError::EncryptionFailed(e.to_string()))?;

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| KeyEncryptionError::EncryptionFailed(e.to_string()))?;

    let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    sealed.extend_from_slice(&nonce_bytes);
    sealed.extend_from_slice(&ciphertext);

    Ok(sealed)
}

/// Decrypts data sealed by [`encrypt_secret`].
///
/// The plaintext is returned in a [`Zeroizing`] buffer so passphrases do not
/// linger in freed memory.
///
/// # Errors
///
/// Returns `KeyEncryptionError` if the key is wrong, the data was tampered
/// with, or the input is malformed.
pub fn decrypt_secret(
    sealed: &[u8],
    key: &[u8],
) -> Result<Zeroizing<Vec<u8>>, KeyEncryptionError> {
    if key.len() != DATA_KEY_LEN {
        return Err(KeyEncryptionError::InvalidKeyLength(key.len()));
    }

    // nonce + tag + at least 1 byte of ciphertext
    if sealed.len() < NONCE_SIZE + TAG_SIZE + 1 {
        return Err(KeyEncryptionError::InvalidEncryptedData);
    }

    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| KeyEncryptionError::DecryptionFailed(e.to_string()))?;

    let nonce = Nonce::from_slice(&sealed[..NONCE_SIZE]);
    let ciphertext = &sealed[NONCE_SIZE..];

    let plaintext = cipher
        .decrypt(nonce, ciphertext)
        .map_err(|e| KeyEncryptionError::DecryptionFailed(e.to_string()))?;

    Ok(Zeroizing::new(plaintext))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let secret = b"pkcs12-passphrase";
        let key = [0x01u8; 32];

        let sealed = encrypt_secret(secret, &key).unwrap();
        assert_eq!(sealed.len(), NONCE_SIZE + secret.len() + TAG_SIZE);

        let opened = decrypt_secret(&sealed, &key).unwrap();
        assert_eq!(opened.as_slice(), secret);
    }

    #[test]
    fn test_nonce_is_fresh_per_call() {
        let key = [0x01u8; 32];
        let a = encrypt_secret(b"same", &key).unwrap();
        let b = encrypt_secret(b"same", &key).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_key_fails() {
        let key = [0x01u8; 32];
        let wrong_key = [0x02u8; 32];

        let sealed = encrypt_secret(b"secret", &key).unwrap();
        assert!(matches!(
            decrypt_secret(&sealed, &wrong_key),
            Err(KeyEncryptionError::DecryptionFailed(_))
        ));
    }

    #[test]
    fn test_invalid_key_length() {
        let result = encrypt_secret(b"secret", &[0x01u8; 16]);
        assert!(matches!(
            result,
            Err(KeyEncryptionError::InvalidKeyLength(16))
        ));
    }

    #[test]
    fn test_invalid_encrypted_data() {
        let result = decrypt_secret(&[0u8; 20], &[0x01u8; 32]);
        assert!(matches!(
            result,
            Err(KeyEncryptionError::InvalidEncryptedData)
        ));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = [0x01u8; 32];
        let mut sealed = encrypt_secret(b"secret passphrase", &key).unwrap();
        sealed[NONCE_SIZE + 3] ^= 0xFF;

        assert!(decrypt_secret(&sealed, &key).is_err());
    }

    #[test]
    fn test_generated_keys_differ() {
        let a = generate_data_key();
        let b = generate_data_key();
        assert_ne!(*a, *b);
    }
}
