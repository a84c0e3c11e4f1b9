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

//! The in-memory signing credential.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use openssl::asn1::Asn1Time;
use openssl::pkey::{Id, PKey, PKeyRef, Private};
use openssl::x509::{X509NameRef, X509Ref, X509};
use tracing::debug;

use crate::crypto::certificate_fingerprint;

/// Private key and X.509 certificate used to sign documents.
///
/// Deliberately not `Clone` and not serializable. `Debug` shows the
/// certificate subject and fingerprint only.
pub struct SigningCredential {
    key: PKey<Private>,
    certificate: X509,
    chain: Vec<X509>,
    source: PathBuf,
    key_version: Option<u32>,
}

impl SigningCredential {
    /// Builds a credential from an already-parsed key and certificate.
    pub fn from_parts(
        key: PKey<Private>,
        certificate: X509,
        chain: Vec<X509>,
        source: impl Into<PathBuf>,
    ) -> Self {
        Self {
            key,
            certificate,
            chain,
            source: source.into(),
            key_version: None,
        }
    }

    pub(crate) fn with_key_version(mut self, version: u32) -> Self {
        self.key_version = Some(version);
        self
    }

    /// Reference-counted copy for the credential cache.
    pub(crate) fn share(&self) -> Self {
        Self {
            key: self.key.clone(),
            certificate: self.certificate.clone(),
            chain: self.chain.clone(),
            source: self.source.clone(),
            key_version: self.key_version,
        }
    }

    pub fn private_key(&self) -> &PKeyRef<Private> {
        &self.key
    }

    /// The leaf (signing) certificate.
    pub fn certificate(&self) -> &X509Ref {
        &self.certificate
    }

    /// Additional certificates shipped in the bundle.
    pub fn chain(&self) -> &[X509] {
        &self.chain
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    /// Version of the data key that decrypted this credential's password.
    pub fn key_version(&self) -> Option<u32> {
        self.key_version
    }

    /// Whether the private key is EC (otherwise RSA).
    pub fn is_ec(&self) -> bool {
        self.key.id() == Id::EC
    }

    pub fn subject(&self) -> String {
        name_to_string(self.certificate.subject_name())
    }

    pub fn issuer(&self) -> String {
        name_to_string(self.certificate.issuer_name())
    }

    /// Colon-separated SHA-256 fingerprint of the leaf certificate.
    pub fn fingerprint(&self) -> String {
        self.certificate
            .to_der()
            .map(|der| certificate_fingerprint(&der))
            .unwrap_or_default()
    }

    /// Whether `at` falls inside the certificate's validity period.
    pub fn is_valid_at(&self, at: DateTime<Utc>) -> bool {
        certificate_valid_at(&self.certificate, at)
    }

    /// Drops the key material now.
    pub fn release(self) {
        debug!(source = %self.source.display(), "Signing credential released");
    }
}

impl fmt::Debug for SigningCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningCredential")
            .field("subject", &self.subject())
            .field("fingerprint", &self.fingerprint())
            .field("source", &self.source)
            .field("key_version", &self.key_version)
            .finish_non_exhaustive()
    }
}

/// Renders an X.509 name as `CN=..., O=...`.
pub fn name_to_string(name: &X509NameRef) -> String {
    name.entries()
        .map(|entry| {
            let field = entry.object().nid().short_name().unwrap_or("?");
            let value = entry.data().to_string().unwrap_or_default();
            format!("{}={}", field, value)
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Checks `at` against notBefore/notAfter of `certificate`.
pub fn certificate_valid_at(certificate: &X509Ref, at: DateTime<Utc>) -> bool {
    match Asn1Time::from_unix(at.timestamp()) {
        Ok(t) => certificate.not_before() <= t && t <= certificate.not_after(),
        Err(_) => false,
    }
}
