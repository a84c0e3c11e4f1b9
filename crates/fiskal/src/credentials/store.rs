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

//! Loading signing credentials from password-protected PKCS#12 files.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use openssl::pkcs12::Pkcs12;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;
use zeroize::Zeroizing;

use super::credential::SigningCredential;
use crate::audit;
use crate::crypto::sha256_hex;
use crate::keys::{EncryptedSecret, KeyRingError, KeyRingHandle, SecretStore, StoreError};

/// Reasons a credential could not be loaded.
#[derive(Debug, Error)]
pub enum CredentialLoadError {
    #[error("Credential file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("Could not read credential file {}: {reason}", .path.display())]
    Io { path: PathBuf, reason: String },

    #[error("Credential password is wrong")]
    WrongPassword,

    #[error("Credential file is not a valid PKCS#12 bundle: {0}")]
    Corrupt(String),

    #[error("Credential bundle contains no private key")]
    MissingPrivateKey,

    #[error("Credential bundle contains no certificate")]
    MissingCertificate,

    #[error("Encrypted password is malformed: {0}")]
    MalformedPassword(String),

    #[error("Password was encrypted with key version {0}, which is no longer retained")]
    UnknownKeyVersion(u32),

    #[error("Password key version {0} is past its overlap window")]
    KeyExpired(u32),

    #[error("Could not decrypt password: {0}")]
    PasswordDecryption(String),

    #[error("No stored password named '{0}'")]
    SecretNotFound(String),

    #[error("No secret store configured")]
    NoSecretStore,

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<KeyRingError> for CredentialLoadError {
    fn from(err: KeyRingError) -> Self {
        match err {
            KeyRingError::UnknownKeyVersion(v) => CredentialLoadError::UnknownKeyVersion(v),
            KeyRingError::KeyExpired { version, .. } => CredentialLoadError::KeyExpired(version),
            KeyRingError::MalformedSecret(m) => CredentialLoadError::MalformedPassword(m),
            KeyRingError::UnsupportedAlgorithm(a) => {
                CredentialLoadError::MalformedPassword(format!("unsupported algorithm {}", a))
            }
            other => CredentialLoadError::PasswordDecryption(other.to_string()),
        }
    }
}

struct CacheEntry {
    token_hash: String,
    credential: SigningCredential,
}

struct CredentialCache {
    ring_version: u32,
    entries: HashMap<PathBuf, CacheEntry>,
}

/// Loads signing credentials, decrypting their passwords with the
/// current key ring snapshot.
pub struct CertificateStore {
    ring: KeyRingHandle,
    secrets: Option<Arc<dyn SecretStore>>,
    cache: Option<Mutex<CredentialCache>>,
}

impl CertificateStore {
    pub fn new(ring: KeyRingHandle) -> Self {
        Self {
            ring,
            secrets: None,
            cache: None,
        }
    }

    /// Enables loading passwords by name.
    pub fn with_secret_store(mut self, secrets: Arc<dyn SecretStore>) -> Self {
        self.secrets = Some(secrets);
        self
    }

    /// Keeps loaded credentials in memory until the key ring changes version.
    pub fn with_cache(mut self) -> Self {
        self.cache = Some(Mutex::new(CredentialCache {
            ring_version: self.ring.current_version(),
            entries: HashMap::new(),
        }));
        self
    }

    /// Loads the PKCS#12 bundle at `path` using an encrypted password token
    /// (`v{n}:aes-256-gcm:{base64}`).
    pub fn load(
        &self,
        path: impl AsRef<Path>,
        encrypted_password: &str,
    ) -> Result<SigningCredential, CredentialLoadError> {
        let path = path.as_ref();
        let result = self.load_inner(path, encrypted_password);
        match &result {
            Ok(credential) => audit::log_credential_loaded(
                &path.display().to_string(),
                &credential.subject(),
                credential.key_version().unwrap_or_default(),
            ),
            Err(e) => audit::log_credential_load_failed(&path.display().to_string(), &e.to_string()),
        }
        result
    }

    /// Loads the bundle at `path` with the password stored under `secret_name`.
    pub async fn load_named(
        &self,
        path: impl AsRef<Path>,
        secret_name: &str,
    ) -> Result<SigningCredential, CredentialLoadError> {
        let secrets = self
            .secrets
            .as_ref()
            .ok_or(CredentialLoadError::NoSecretStore)?;
        let secret = secrets
            .get_secret(secret_name)
            .await?
            .ok_or_else(|| CredentialLoadError::SecretNotFound(secret_name.to_string()))?;
        self.load(path, &secret.to_token())
    }

    /// Encrypts a plaintext password under the current key.
    pub fn encrypt_password(&self, plaintext: &str) -> Result<EncryptedSecret, CredentialLoadError> {
        Ok(self.ring.snapshot().encrypt(plaintext.as_bytes())?)
    }

    /// Encrypts a password and stores it under `name` so rotation migrates it.
    pub async fn register_password(
        &self,
        name: &str,
        plaintext: &str,
    ) -> Result<EncryptedSecret, CredentialLoadError> {
        let secrets = self
            .secrets
            .as_ref()
            .ok_or(CredentialLoadError::NoSecretStore)?;
        let secret = self.encrypt_password(plaintext)?;
        secrets.put_secret(name, &secret).await?;
        Ok(secret)
    }

    /// Drops every cached credential.
    pub fn invalidate_cache(&self) {
        if let Some(cache) = &self.cache {
            cache.lock().entries.clear();
        }
    }

    fn load_inner(
        &self,
        path: &Path,
        token: &str,
    ) -> Result<SigningCredential, CredentialLoadError> {
        let token_hash = sha256_hex(token.as_bytes());
        if let Some(hit) = self.cached(path, &token_hash) {
            return Ok(hit);
        }

        let secret: EncryptedSecret = token.parse()?;
        let ring = self.ring.snapshot();
        let password = ring.decrypt(&secret, Utc::now())?;
        let password = Zeroizing::new(
            String::from_utf8(password.to_vec())
                .map_err(|_| CredentialLoadError::PasswordDecryption("not UTF-8".to_string()))?,
        );

        let der = std::fs::read(path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => CredentialLoadError::NotFound(path.to_path_buf()),
            _ => CredentialLoadError::Io {
                path: path.to_path_buf(),
                reason: e.to_string(),
            },
        })?;

        let bundle =
            Pkcs12::from_der(&der).map_err(|e| CredentialLoadError::Corrupt(e.to_string()))?;
        let parsed = bundle.parse2(&password).map_err(|e| {
            debug!(path = %path.display(), error = %e, "PKCS#12 parse failed");
            CredentialLoadError::WrongPassword
        })?;

        let key = parsed.pkey.ok_or(CredentialLoadError::MissingPrivateKey)?;
        let certificate = parsed.cert.ok_or(CredentialLoadError::MissingCertificate)?;
        let chain = parsed
            .ca
            .map(|stack| stack.into_iter().collect())
            .unwrap_or_default();

        let credential = SigningCredential::from_parts(key, certificate, chain, path)
            .with_key_version(secret.key_version);

        self.remember(path, token_hash, &credential);
        Ok(credential)
    }

    fn cached(&self, path: &Path, token_hash: &str) -> Option<SigningCredential> {
        let cache = self.cache.as_ref()?;
        let mut cache = cache.lock();

        let version = self.ring.current_version();
        if cache.ring_version != version {
            debug!(
                from = cache.ring_version,
                to = version,
                "Key ring changed; clearing credential cache"
            );
            cache.entries.clear();
            cache.ring_version = version;
            return None;
        }

        cache
            .entries
            .get(path)
            .filter(|entry| entry.token_hash == token_hash)
            .map(|entry| entry.credential.share())
    }

    fn remember(&self, path: &Path, token_hash: String, credential: &SigningCredential) {
        if let Some(cache) = &self.cache {
            cache.lock().entries.insert(
                path.to_path_buf(),
                CacheEntry {
                    token_hash,
                    credential: credential.share(),
                },
            );
        }
    }
}
