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

//! Shared helpers: throwaway credentials, sample documents and a scripted
//! transport.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use fiskal::keys::MemoryKeyStore;
use fiskal::submission::{DeliveryReceipt, DocumentTransport};
use fiskal::{
    CertificateStore, DeliveryError, KeyRotationService, RotationPolicy, SigningCredential,
};
use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkcs12::Pkcs12;
use openssl::pkey::{PKey, Private};
use openssl::x509::{X509Name, X509};
use parking_lot::Mutex;
use url::Url;

pub const PASSWORD: &str = "correct horse battery staple";

pub fn ec_key() -> PKey<Private> {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
    PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap()
}

/// Self-signed certificate valid from `from_days` to `to_days` around now.
pub fn certificate(key: &PKey<Private>, cn: &str, from_days: i64, to_days: i64) -> X509 {
    let mut name = X509Name::builder().unwrap();
    name.append_entry_by_nid(Nid::COMMONNAME, cn).unwrap();
    name.append_entry_by_nid(Nid::COUNTRYNAME, "HR").unwrap();
    let name = name.build();

    let now = chrono::Utc::now().timestamp();
    let mut serial = BigNum::new().unwrap();
    serial.rand(64, MsbOption::MAYBE_ZERO, false).unwrap();

    let mut builder = X509::builder().unwrap();
    builder.set_version(2).unwrap();
    builder
        .set_serial_number(&serial.to_asn1_integer().unwrap())
        .unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder
        .set_not_before(&Asn1Time::from_unix(now + from_days * 86_400).unwrap())
        .unwrap();
    builder
        .set_not_after(&Asn1Time::from_unix(now + to_days * 86_400).unwrap())
        .unwrap();
    builder.set_pubkey(key).unwrap();
    builder.sign(key, MessageDigest::sha256()).unwrap();
    builder.build()
}

/// Writes a PKCS#12 bundle for a fresh EC key into `dir`.
pub fn write_bundle(dir: &Path, cn: &str, password: &str) -> PathBuf {
    let key = ec_key();
    let cert = certificate(&key, cn, -1, 365);
    let der = Pkcs12::builder()
        .name(cn)
        .pkey(&key)
        .cert(&cert)
        .build2(password)
        .unwrap()
        .to_der()
        .unwrap();
    let path = dir.join(format!("{}.p12", cn));
    std::fs::write(&path, der).unwrap();
    path
}

/// An invoice of exactly `len` bytes.
pub fn invoice(number: &str, len: usize) -> String {
    let head = format!(
        r#"<Invoice xmlns="urn:fiskal:test" Id="inv-{number}"><Number>{number}</Number><Issuer>Test d.o.o.</Issuer><Notes>"#
    );
    let tail = "</Notes><Total currency=\"EUR\">125.00</Total></Invoice>";
    let padding = len.saturating_sub(head.len() + tail.len());
    format!("{}{}{}", head, "x".repeat(padding), tail)
}

/// A rotation service and certificate store sharing one in-memory key store.
pub struct KeyedStore {
    pub keys: Arc<MemoryKeyStore>,
    pub rotation: KeyRotationService,
    pub certificates: CertificateStore,
}

impl KeyedStore {
    pub async fn new() -> Self {
        let keys = Arc::new(MemoryKeyStore::new());
        let rotation = KeyRotationService::initialize(keys.clone(), RotationPolicy::default())
            .await
            .unwrap();
        let certificates =
            CertificateStore::new(rotation.key_ring()).with_secret_store(keys.clone());
        Self {
            keys,
            rotation,
            certificates,
        }
    }

    /// Registers `password` under `name` and loads the bundle with it.
    pub async fn load(&self, path: &Path, name: &str, password: &str) -> SigningCredential {
        self.certificates
            .register_password(name, password)
            .await
            .unwrap();
        self.certificates.load_named(path, name).await.unwrap()
    }
}

pub fn accepted() -> DeliveryReceipt {
    DeliveryReceipt {
        http_status: 200,
        remote_status: Some("accepted".into()),
        message: None,
    }
}

/// Transport that replays a fixed list of outcomes and records payloads.
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Result<DeliveryReceipt, DeliveryError>>>,
    delivered: Mutex<Vec<String>>,
}

impl ScriptedTransport {
    pub fn new(script: Vec<Result<DeliveryReceipt, DeliveryError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            delivered: Mutex::new(Vec::new()),
        }
    }

    pub fn attempts(&self) -> usize {
        self.delivered.lock().len()
    }

    pub fn payloads(&self) -> Vec<String> {
        self.delivered.lock().clone()
    }
}

#[async_trait]
impl DocumentTransport for ScriptedTransport {
    async fn deliver(
        &self,
        _target_id: &str,
        _url: &Url,
        payload: &str,
    ) -> Result<DeliveryReceipt, DeliveryError> {
        self.delivered.lock().push(payload.to_string());
        self.script
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(accepted()))
    }
}
