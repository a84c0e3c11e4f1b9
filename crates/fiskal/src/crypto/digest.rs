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

//! SHA-256 helpers.
//!
//! Provides functions for:
//! - Base64 content digests (XML-DSig `DigestValue`)
//! - Hex key hashes recorded in rotation records
//! - Colon-separated certificate fingerprints used by the pinning guard

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sha2::{Digest, Sha256};

/// Computes the SHA-256 digest of `data`, base64 encoded.
pub fn sha256_base64(data: &[u8]) -> String {
    STANDARD.encode(Sha256::digest(data))
}

/// Computes the SHA-256 digest of `data` as a 64-character hex string.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Computes the hash of a symmetric key for audit records.
///
/// Only the hash ever leaves the key ring; the key value itself is never
/// written to a log or a rotation record.
pub fn key_hash(key: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"fiskal-data-key:");
    hasher.update(key);
    hex::encode(hasher.finalize())
}

/// Formats raw bytes as upper-case, colon-separated hex (`AB:CD:EF`).
pub fn format_fingerprint(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}

/// Computes the SHA-256 fingerprint of a DER-encoded certificate.
pub fn certificate_fingerprint(der: &[u8]) -> String {
    format_fingerprint(&Sha256::digest(der))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_hex_known_value() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_sha256_base64_known_value() {
        assert_eq!(
            sha256_base64(b"hello world"),
            "uU0nuZNNPgilLlLX2n2r+sSE7+N6U4DukIj3rOLvzek="
        );
    }

    #[test]
    fn test_key_hash_is_not_plain_digest() {
        let key = [0x42u8; 32];
        assert_ne!(key_hash(&key), sha256_hex(&key));
        assert_eq!(key_hash(&key), key_hash(&key));
    }

    #[test]
    fn test_format_fingerprint() {
        assert_eq!(format_fingerprint(&[0x11, 0x22, 0xab]), "11:22:AB");
        assert_eq!(format_fingerprint(&[]), "");
    }

    #[test]
    fn test_certificate_fingerprint_shape() {
        let fp = certificate_fingerprint(b"not really der");
        assert_eq!(fp.len(), 32 * 3 - 1);
        assert!(fp.chars().all(|c| c == ':' || c.is_ascii_hexdigit()));
    }
}
