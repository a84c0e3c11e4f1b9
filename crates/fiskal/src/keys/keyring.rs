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

//! Immutable key ring snapshots.
//!
//! A [`KeyRing`] holds the current data key plus the keys it superseded.
//! Nothing mutates a ring in place: rotation builds a new ring and publishes
//! it through a [`KeyRingHandle`], and every decrypt call receives the
//! snapshot it should use.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::crypto::{
    decrypt_secret, encrypt_secret, generate_data_key, key_hash, KeyEncryptionError, DATA_KEY_LEN,
};

/// Algorithm tag written into every [`EncryptedSecret`].
pub const SECRET_ALGORITHM: &str = "aes-256-gcm";

/// Errors raised while resolving or using keys from a ring.
#[derive(Debug, Error)]
pub enum KeyRingError {
    #[error("No key with version {0} is retained")]
    UnknownKeyVersion(u32),

    #[error("Key version {version} left its overlap window at {expired_at}")]
    KeyExpired {
        version: u32,
        expired_at: DateTime<Utc>,
    },

    #[error("Unsupported secret algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("Malformed encrypted secret: {0}")]
    MalformedSecret(String),

    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error("Key ring has no keys")]
    Empty,

    #[error(transparent)]
    Crypto(#[from] KeyEncryptionError),
}

/// A symmetric data key.
#[derive(Clone)]
pub struct DataKey {
    version: u32,
    material: Zeroizing<[u8; DATA_KEY_LEN]>,
    hash: String,
    created_at: DateTime<Utc>,
}

impl DataKey {
    /// Generates a new random key with the given version.
    pub fn generate(version: u32) -> Self {
        let material = generate_data_key();
        let hash = key_hash(material.as_slice());
        Self {
            version,
            material,
            hash,
            created_at: Utc::now(),
        }
    }

    /// Rebuilds a key from stored material.
    pub fn from_bytes(
        version: u32,
        bytes: &[u8],
        created_at: DateTime<Utc>,
    ) -> Result<Self, KeyRingError> {
        let array: [u8; DATA_KEY_LEN] = bytes.try_into().map_err(|_| {
            KeyRingError::InvalidKey(format!(
                "expected {} bytes, got {}",
                DATA_KEY_LEN,
                bytes.len()
            ))
        })?;
        let material = Zeroizing::new(array);
        let hash = key_hash(material.as_slice());
        Ok(Self {
            version,
            material,
            hash,
            created_at,
        })
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Hash of the key value (never the value itself).
    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Raw key bytes. Only the key ring and key stores should need this.
    pub(crate) fn material(&self) -> &[u8] {
        self.material.as_slice()
    }

    pub(crate) fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }
}

impl fmt::Debug for DataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataKey")
            .field("version", &self.version)
            .field("hash", &self.hash)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

/// A superseded key kept for reading secrets that have not been migrated.
#[derive(Debug, Clone)]
pub struct RetainedKey {
    pub key: DataKey,
    pub retired_at: DateTime<Utc>,
    /// End of the read window. `None` while the rotation that retired this
    /// key has not completed; such a key stays readable.
    pub overlap_until: Option<DateTime<Utc>>,
}

impl RetainedKey {
    /// Whether secrets under this key may still be decrypted at `now`.
    pub fn is_readable_at(&self, now: DateTime<Utc>) -> bool {
        match self.overlap_until {
            None => true,
            Some(until) => now < until,
        }
    }
}

/// A secret sealed under a versioned data key.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptedSecret {
    pub ciphertext: Vec<u8>,
    pub algorithm: String,
    pub key_version: u32,
}

impl EncryptedSecret {
    /// Encodes the secret as `v{version}:{algorithm}:{base64}`.
    pub fn to_token(&self) -> String {
        format!(
            "v{}:{}:{}",
            self.key_version,
            self.algorithm,
            STANDARD.encode(&self.ciphertext)
        )
    }
}

impl fmt::Debug for EncryptedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptedSecret")
            .field("algorithm", &self.algorithm)
            .field("key_version", &self.key_version)
            .field("ciphertext_len", &self.ciphertext.len())
            .finish()
    }
}

impl fmt::Display for EncryptedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_token())
    }
}

impl FromStr for EncryptedSecret {
    type Err = KeyRingError;

    fn from_str(token: &str) -> Result<Self, Self::Err> {
        let mut parts = token.trim().splitn(3, ':');
        let (version, algorithm, payload) = match (parts.next(), parts.next(), parts.next()) {
            (Some(v), Some(a), Some(p)) => (v, a, p),
            _ => {
                return Err(KeyRingError::MalformedSecret(
                    "expected v<version>:<algorithm>:<base64>".to_string(),
                ))
            }
        };

        let key_version = version
            .strip_prefix('v')
            .and_then(|v| v.parse::<u32>().ok())
            .ok_or_else(|| KeyRingError::MalformedSecret(format!("bad key version '{}'", version)))?;

        if algorithm != SECRET_ALGORITHM {
            return Err(KeyRingError::UnsupportedAlgorithm(algorithm.to_string()));
        }

        let ciphertext = STANDARD
            .decode(payload)
            .map_err(|e| KeyRingError::MalformedSecret(e.to_string()))?;

        Ok(Self {
            ciphertext,
            algorithm: algorithm.to_string(),
            key_version,
        })
    }
}

/// An immutable set of data keys: one current, any number retained.
#[derive(Debug, Clone)]
pub struct KeyRing {
    current: DataKey,
    retained: Vec<RetainedKey>,
}

impl KeyRing {
    /// Creates a ring with a single current key.
    pub fn new(current: DataKey) -> Self {
        Self {
            current,
            retained: Vec::new(),
        }
    }

    /// Adds a retained key to the ring.
    pub fn with_retained(mut self, retained: RetainedKey) -> Self {
        self.retained.push(retained);
        self.retained.sort_by(|a, b| b.key.version.cmp(&a.key.version));
        self
    }

    pub fn current(&self) -> &DataKey {
        &self.current
    }

    pub fn retained(&self) -> &[RetainedKey] {
        &self.retained
    }

    /// Highest version known to the ring.
    pub fn max_version(&self) -> u32 {
        self.retained
            .iter()
            .map(|r| r.key.version)
            .chain(std::iter::once(self.current.version))
            .max()
            .unwrap_or(self.current.version)
    }

    /// Seals `plaintext` under the current key.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<EncryptedSecret, KeyRingError> {
        let ciphertext = encrypt_secret(plaintext, self.current.material())?;
        Ok(EncryptedSecret {
            ciphertext,
            algorithm: SECRET_ALGORITHM.to_string(),
            key_version: self.current.version,
        })
    }

    /// Decrypts a secret, honoring the overlap window of retained keys.
    pub fn decrypt(
        &self,
        secret: &EncryptedSecret,
        now: DateTime<Utc>,
    ) -> Result<Zeroizing<Vec<u8>>, KeyRingError> {
        if secret.algorithm != SECRET_ALGORITHM {
            return Err(KeyRingError::UnsupportedAlgorithm(secret.algorithm.clone()));
        }

        if secret.key_version == self.current.version {
            return Ok(decrypt_secret(&secret.ciphertext, self.current.material())?);
        }

        let retained = self
            .find_retained(secret.key_version)
            .ok_or(KeyRingError::UnknownKeyVersion(secret.key_version))?;

        if !retained.is_readable_at(now) {
            return Err(KeyRingError::KeyExpired {
                version: secret.key_version,
                expired_at: retained.overlap_until.unwrap_or(retained.retired_at),
            });
        }

        tracing::debug!(
            key_version = secret.key_version,
            current_version = self.current.version,
            "Decrypting with retained key inside overlap window"
        );
        Ok(decrypt_secret(&secret.ciphertext, retained.key.material())?)
    }

    /// Decrypts with any retained key regardless of its overlap window.
    ///
    /// Used by the rotation routine, which must be able to migrate every
    /// secret still pointing at a key the ring retains.
    pub(crate) fn decrypt_for_migration(
        &self,
        secret: &EncryptedSecret,
    ) -> Result<Zeroizing<Vec<u8>>, KeyRingError> {
        let key = if secret.key_version == self.current.version {
            &self.current
        } else {
            &self
                .find_retained(secret.key_version)
                .ok_or(KeyRingError::UnknownKeyVersion(secret.key_version))?
                .key
        };
        Ok(decrypt_secret(&secret.ciphertext, key.material())?)
    }

    /// Returns a new ring with `next` as current and the present current key
    /// retained without an overlap deadline.
    pub fn rotated(&self, next: DataKey, retired_at: DateTime<Utc>) -> KeyRing {
        let mut retained = self.retained.clone();
        retained.retain(|r| r.key.version != next.version);
        retained.push(RetainedKey {
            key: self.current.clone(),
            retired_at,
            overlap_until: None,
        });
        retained.sort_by(|a, b| b.key.version.cmp(&a.key.version));
        KeyRing {
            current: next,
            retained,
        }
    }

    /// Returns a new ring where every draining key gets `until` as the end
    /// of its overlap window.
    pub fn with_overlap_closing(&self, until: DateTime<Utc>) -> KeyRing {
        let retained = self
            .retained
            .iter()
            .cloned()
            .map(|mut r| {
                if r.overlap_until.is_none() {
                    r.overlap_until = Some(until);
                }
                r
            })
            .collect();
        KeyRing {
            current: self.current.clone(),
            retained,
        }
    }

    /// Returns a new ring without retained keys whose window ended before `now`.
    pub fn without_expired(&self, now: DateTime<Utc>) -> KeyRing {
        KeyRing {
            current: self.current.clone(),
            retained: self
                .retained
                .iter()
                .filter(|r| r.is_readable_at(now))
                .cloned()
                .collect(),
        }
    }

    fn find_retained(&self, version: u32) -> Option<&RetainedKey> {
        self.retained.iter().find(|r| r.key.version == version)
    }
}

/// Shared handle through which the current [`KeyRing`] snapshot is published.
#[derive(Debug, Clone)]
pub struct KeyRingHandle {
    inner: Arc<RwLock<Arc<KeyRing>>>,
}

impl KeyRingHandle {
    pub fn new(ring: KeyRing) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(ring))),
        }
    }

    /// The ring as of now. Later publications do not affect the returned value.
    pub fn snapshot(&self) -> Arc<KeyRing> {
        self.inner.read().clone()
    }

    /// Replaces the published ring.
    pub fn publish(&self, ring: KeyRing) {
        *self.inner.write() = Arc::new(ring);
    }

    /// Version of the current key in the published ring.
    pub fn current_version(&self) -> u32 {
        self.inner.read().current.version
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_token_roundtrip() {
        let ring = KeyRing::new(DataKey::generate(3));
        let secret = ring.encrypt(b"passphrase").unwrap();
        let token = secret.to_token();

        assert!(token.starts_with("v3:aes-256-gcm:"));
        let parsed: EncryptedSecret = token.parse().unwrap();
        assert_eq!(parsed, secret);
    }

    #[test]
    fn test_malformed_tokens() {
        assert!(matches!(
            "garbage".parse::<EncryptedSecret>(),
            Err(KeyRingError::MalformedSecret(_))
        ));
        assert!(matches!(
            "vx:aes-256-gcm:AAAA".parse::<EncryptedSecret>(),
            Err(KeyRingError::MalformedSecret(_))
        ));
        assert!(matches!(
            "v1:des:AAAA".parse::<EncryptedSecret>(),
            Err(KeyRingError::UnsupportedAlgorithm(_))
        ));
    }

    #[test]
    fn test_debug_hides_material() {
        let key = DataKey::generate(1);
        let rendered = format!("{:?}", key);
        assert!(rendered.contains("version"));
        assert!(!rendered.contains("material"));
    }

    #[test]
    fn test_rotated_ring_reads_old_secrets_in_overlap() {
        let v1 = KeyRing::new(DataKey::generate(1));
        let secret = v1.encrypt(b"old secret").unwrap();
        let now = Utc::now();

        let v2 = v1
            .rotated(DataKey::generate(2), now)
            .with_overlap_closing(now + Duration::hours(24));

        assert_eq!(v2.current().version(), 2);
        let plain = v2.decrypt(&secret, now + Duration::hours(1)).unwrap();
        assert_eq!(plain.as_slice(), b"old secret");
    }

    #[test]
    fn test_retained_key_expires_after_overlap() {
        let v1 = KeyRing::new(DataKey::generate(1));
        let secret = v1.encrypt(b"old secret").unwrap();
        let now = Utc::now();

        let v2 = v1
            .rotated(DataKey::generate(2), now)
            .with_overlap_closing(now + Duration::hours(24));

        assert!(matches!(
            v2.decrypt(&secret, now + Duration::hours(25)),
            Err(KeyRingError::KeyExpired { version: 1, .. })
        ));
        // Migration ignores the window.
        assert!(v2.decrypt_for_migration(&secret).is_ok());
    }

    #[test]
    fn test_draining_key_has_no_deadline() {
        let v1 = KeyRing::new(DataKey::generate(1));
        let secret = v1.encrypt(b"draining").unwrap();
        let now = Utc::now();
        let v2 = v1.rotated(DataKey::generate(2), now);

        assert!(v2.decrypt(&secret, now + Duration::days(365)).is_ok());
    }

    #[test]
    fn test_unknown_version() {
        let ring = KeyRing::new(DataKey::generate(5));
        let foreign = KeyRing::new(DataKey::generate(9)).encrypt(b"x").unwrap();
        assert!(matches!(
            ring.decrypt(&foreign, Utc::now()),
            Err(KeyRingError::UnknownKeyVersion(9))
        ));
    }

    #[test]
    fn test_without_expired_drops_closed_keys() {
        let now = Utc::now();
        let ring = KeyRing::new(DataKey::generate(1))
            .rotated(DataKey::generate(2), now)
            .with_overlap_closing(now + Duration::hours(1))
            .rotated(DataKey::generate(3), now);

        assert_eq!(ring.retained().len(), 2);
        let pruned = ring.without_expired(now + Duration::hours(2));
        assert_eq!(pruned.retained().len(), 1);
        assert_eq!(pruned.retained()[0].key.version(), 2);
        assert_eq!(ring.max_version(), 3);
    }

    #[test]
    fn test_handle_snapshots_are_stable() {
        let handle = KeyRingHandle::new(KeyRing::new(DataKey::generate(1)));
        let before = handle.snapshot();

        let next = before.rotated(DataKey::generate(2), Utc::now());
        handle.publish(next);

        assert_eq!(before.current().version(), 1);
        assert_eq!(handle.current_version(), 2);
    }
}
