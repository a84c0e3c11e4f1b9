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

//! XAdES-BES style enveloped signatures.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, Timelike, Utc};
use openssl::bn::BigNum;
use openssl::ecdsa::EcdsaSig;
use openssl::error::ErrorStack;
use openssl::hash::MessageDigest;
use openssl::pkey::{Id, PKeyRef, Private, Public};
use openssl::sign::{Signer, Verifier};
use openssl::x509::X509;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::canonical::{
    canonicalize_element, canonicalize_enveloped, canonicalize_signature_part, CanonicalError,
    DSIG_NS,
};
use super::envelope::{self, parse_envelope, SignedPropertiesInput, XADES_NS};
use crate::audit;
use crate::credentials::{certificate_valid_at, name_to_string, SigningCredential};
use crate::crypto::sha256_base64;

/// Errors raised while producing a signature. Verification never errors;
/// it returns [`Verification::Invalid`].
#[derive(Debug, Error)]
pub enum SigningError {
    #[error("Document is empty")]
    EmptyDocument,

    #[error("Document cannot be canonicalized: {0}")]
    Canonicalization(#[from] CanonicalError),

    #[error("Certificate {subject} is outside its validity window ({not_before} to {not_after})")]
    CertificateNotValid {
        subject: String,
        not_before: String,
        not_after: String,
    },

    #[error("Unsupported key type: {0}")]
    UnsupportedKey(String),

    #[error("Cryptographic operation failed: {0}")]
    Crypto(String),
}

impl From<ErrorStack> for SigningError {
    fn from(err: ErrorStack) -> Self {
        SigningError::Crypto(err.to_string())
    }
}

/// Signature algorithms the signer produces and accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignatureAlgorithm {
    RsaSha256,
    EcdsaSha256,
}

impl SignatureAlgorithm {
    pub fn uri(&self) -> &'static str {
        match self {
            SignatureAlgorithm::RsaSha256 => "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256",
            SignatureAlgorithm::EcdsaSha256 => {
                "http://www.w3.org/2001/04/xmldsig-more#ecdsa-sha256"
            }
        }
    }

    pub fn from_uri(uri: &str) -> Option<Self> {
        [SignatureAlgorithm::RsaSha256, SignatureAlgorithm::EcdsaSha256]
            .into_iter()
            .find(|alg| alg.uri() == uri)
    }

    fn for_key(key: &PKeyRef<Private>) -> Result<Self, SigningError> {
        match key.id() {
            Id::RSA => Ok(SignatureAlgorithm::RsaSha256),
            Id::EC => Ok(SignatureAlgorithm::EcdsaSha256),
            other => Err(SigningError::UnsupportedKey(format!("{:?}", other))),
        }
    }
}

/// Outcome of a signature check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    Valid,
    Invalid(String),
}

impl Verification {
    pub fn is_valid(&self) -> bool {
        matches!(self, Verification::Valid)
    }
}

/// A signed document. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedDocument {
    document_id: String,
    original_xml: String,
    canonical_xml: String,
    digest: String,
    envelope: String,
    certificate_base64: String,
    signing_time: DateTime<Utc>,
    signature_algorithm: SignatureAlgorithm,
}

impl SignedDocument {
    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn original_xml(&self) -> &str {
        &self.original_xml
    }

    /// Base64 SHA-256 of the canonical document.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// The detached `ds:Signature` element.
    pub fn envelope(&self) -> &str {
        &self.envelope
    }

    pub fn certificate_base64(&self) -> &str {
        &self.certificate_base64
    }

    pub fn signing_time(&self) -> DateTime<Utc> {
        self.signing_time
    }

    pub fn signature_algorithm(&self) -> SignatureAlgorithm {
        self.signature_algorithm
    }

    /// The canonical document with the signature as the last child of its root.
    pub fn enveloped_xml(&self) -> String {
        match self.canonical_xml.rfind("</") {
            Some(at) => format!(
                "{}{}{}",
                &self.canonical_xml[..at],
                self.envelope,
                &self.canonical_xml[at..]
            ),
            None => self.canonical_xml.clone(),
        }
    }

    /// The signing certificate as PEM.
    pub fn certificate_pem(&self) -> Result<String, SigningError> {
        let der = STANDARD
            .decode(&self.certificate_base64)
            .map_err(|e| SigningError::Crypto(e.to_string()))?;
        Ok(pem::encode(&pem::Pem::new("CERTIFICATE", der)))
    }
}

/// Base64 SHA-256 of canonical bytes.
pub fn calculate_digest(canonical: &[u8]) -> String {
    sha256_base64(canonical)
}

/// Stateless XAdES signer and verifier.
#[derive(Debug, Clone, Copy, Default)]
pub struct XadesSigner;

impl XadesSigner {
    pub fn new() -> Self {
        Self
    }

    /// Signs `xml` with `credential`.
    ///
    /// Empty or malformed documents are rejected before any cryptographic
    /// work, as are credentials whose certificate is not currently valid.
    pub fn sign_xml(
        &self,
        document_id: &str,
        xml: &str,
        credential: &SigningCredential,
    ) -> Result<SignedDocument, SigningError> {
        let result = self.sign_inner(document_id, xml, credential);
        match &result {
            Ok(signed) => {
                audit::log_document_signed(&credential.subject(), document_id, &signed.digest)
            }
            Err(e) => {
                audit::log_document_sign_failed(&credential.subject(), document_id, &e.to_string())
            }
        }
        result
    }

    /// Checks a [`SignedDocument`] against its own original XML.
    pub fn verify_signature(&self, signed: &SignedDocument) -> Verification {
        let outcome = self.check(
            &signed.original_xml,
            &signed.envelope,
            Some(&signed.digest),
            Some(&signed.certificate_base64),
        );
        Self::report(&signed.document_id, outcome)
    }

    /// Checks a document carrying its signature as a child of the root.
    pub fn verify_enveloped(&self, xml: &str) -> Verification {
        let outcome = self.check(xml, xml, None, None);
        Self::report("enveloped", outcome)
    }

    /// Base64 SHA-256 of canonical bytes.
    pub fn calculate_digest(&self, canonical: &[u8]) -> String {
        calculate_digest(canonical)
    }

    /// DER of the leaf certificate, base64 encoded. The chain is not included.
    pub fn certificate_base64(&self, credential: &SigningCredential) -> Result<String, SigningError> {
        Ok(STANDARD.encode(credential.certificate().to_der()?))
    }

    fn sign_inner(
        &self,
        document_id: &str,
        xml: &str,
        credential: &SigningCredential,
    ) -> Result<SignedDocument, SigningError> {
        if xml.trim().is_empty() {
            return Err(SigningError::EmptyDocument);
        }
        let canonical = canonicalize_enveloped(xml)?;

        let now = Utc::now();
        let now = now.with_nanosecond(0).unwrap_or(now);
        let certificate = credential.certificate();
        if !credential.is_valid_at(now) {
            return Err(SigningError::CertificateNotValid {
                subject: credential.subject(),
                not_before: certificate.not_before().to_string(),
                not_after: certificate.not_after().to_string(),
            });
        }

        let algorithm = SignatureAlgorithm::for_key(credential.private_key())?;
        let digest = calculate_digest(canonical.as_bytes());
        let certificate_der = certificate.to_der()?;
        let certificate_base64 = STANDARD.encode(&certificate_der);
        let serial = certificate.serial_number().to_bn()?.to_dec_str()?.to_string();

        let id = Uuid::new_v4().simple().to_string();
        let signature_id = format!("Signature-{}", id);
        let properties_id = format!("SignedProperties-{}", id);

        let properties = envelope::signed_properties(&SignedPropertiesInput {
            id: &properties_id,
            signing_time: &now.to_rfc3339_opts(SecondsFormat::Secs, true),
            certificate_digest: &sha256_base64(&certificate_der),
            issuer: &credential.issuer(),
            serial: &serial,
        });
        let properties_c14n = canonicalize_element(&properties, XADES_NS, "SignedProperties")?
            .ok_or(CanonicalError::NoRoot)?;

        let signed_info = envelope::signed_info(
            algorithm.uri(),
            &digest,
            &properties_id,
            &calculate_digest(properties_c14n.as_bytes()),
        );
        let signed_info_c14n = canonicalize_element(&signed_info, DSIG_NS, "SignedInfo")?
            .ok_or(CanonicalError::NoRoot)?;

        let signature_value = sign_bytes(
            credential.private_key(),
            algorithm,
            signed_info_c14n.as_bytes(),
        )?;

        let envelope = envelope::signature(
            &signature_id,
            &signed_info,
            &STANDARD.encode(signature_value),
            &certificate_base64,
            &properties,
        );

        Ok(SignedDocument {
            document_id: document_id.to_string(),
            original_xml: xml.to_string(),
            canonical_xml: canonical,
            digest,
            envelope,
            certificate_base64,
            signing_time: now,
            signature_algorithm: algorithm,
        })
    }

    /// Returns the signer subject on success, or why the signature is invalid.
    fn check(
        &self,
        document: &str,
        envelope_source: &str,
        expected_digest: Option<&str>,
        expected_certificate: Option<&str>,
    ) -> Result<String, String> {
        let fields = parse_envelope(envelope_source)
            .map_err(|e| format!("signature envelope is malformed: {}", e))?
            .ok_or("no signature found")?;

        let canonical = canonicalize_enveloped(document)
            .map_err(|e| format!("document cannot be canonicalized: {}", e))?;
        let recomputed = calculate_digest(canonical.as_bytes());

        if let Some(expected) = expected_digest {
            if expected != recomputed {
                return Err("document digest does not match the signed digest".into());
            }
        }
        if fields.document_digest() != Some(recomputed.as_str()) {
            return Err("document was modified after signing".into());
        }

        let properties = canonicalize_signature_part(envelope_source, XADES_NS, "SignedProperties")
            .map_err(|e| e.to_string())?
            .ok_or("signed properties are missing")?;
        if fields.properties_digest() != Some(calculate_digest(properties.as_bytes()).as_str()) {
            return Err("signed properties were modified after signing".into());
        }

        if let Some(expected) = expected_certificate {
            if expected != fields.certificate {
                return Err("embedded certificate differs from the signing certificate".into());
            }
        }
        let certificate_der = STANDARD
            .decode(&fields.certificate)
            .map_err(|e| format!("certificate is not valid base64: {}", e))?;
        let certificate = X509::from_der(&certificate_der)
            .map_err(|e| format!("certificate cannot be parsed: {}", e))?;
        if sha256_base64(&certificate_der) != fields.certificate_digest {
            return Err("signing certificate digest does not match".into());
        }

        let algorithm = SignatureAlgorithm::from_uri(&fields.signature_method)
            .ok_or_else(|| format!("unsupported signature method {}", fields.signature_method))?;
        let signed_info = canonicalize_signature_part(envelope_source, DSIG_NS, "SignedInfo")
            .map_err(|e| e.to_string())?
            .ok_or("signed info is missing")?;
        let signature_value = STANDARD
            .decode(&fields.signature_value)
            .map_err(|e| format!("signature value is not valid base64: {}", e))?;
        let public_key = certificate
            .public_key()
            .map_err(|e| format!("certificate has no usable public key: {}", e))?;

        match verify_bytes(&public_key, algorithm, signed_info.as_bytes(), &signature_value) {
            Ok(true) => {}
            _ => return Err("signature value does not verify".into()),
        }

        if !certificate_valid_at(&certificate, Utc::now()) {
            return Err("certificate is outside its validity window".into());
        }

        Ok(name_to_string(certificate.subject_name()))
    }

    fn report(document_id: &str, outcome: Result<String, String>) -> Verification {
        match outcome {
            Ok(signer) => {
                audit::log_signature_verified(document_id, &signer);
                Verification::Valid
            }
            Err(reason) => {
                audit::log_signature_rejected(document_id, &reason);
                Verification::Invalid(reason)
            }
        }
    }
}

fn sign_bytes(
    key: &PKeyRef<Private>,
    algorithm: SignatureAlgorithm,
    data: &[u8],
) -> Result<Vec<u8>, SigningError> {
    let mut signer = Signer::new(MessageDigest::sha256(), key)?;
    signer.update(data)?;
    let der = signer.sign_to_vec()?;

    match algorithm {
        SignatureAlgorithm::RsaSha256 => Ok(der),
        SignatureAlgorithm::EcdsaSha256 => {
            // XML signatures carry ECDSA as fixed-width r || s.
            let width = (key.ec_key()?.group().degree() as i32 + 7) / 8;
            let sig = EcdsaSig::from_der(&der)?;
            let mut raw = sig.r().to_vec_padded(width)?;
            raw.extend(sig.s().to_vec_padded(width)?);
            Ok(raw)
        }
    }
}

fn verify_bytes(
    key: &PKeyRef<Public>,
    algorithm: SignatureAlgorithm,
    data: &[u8],
    signature: &[u8],
) -> Result<bool, ErrorStack> {
    let der = match algorithm {
        SignatureAlgorithm::RsaSha256 => signature.to_vec(),
        SignatureAlgorithm::EcdsaSha256 => {
            if signature.is_empty() || signature.len() % 2 != 0 {
                return Ok(false);
            }
            let (r, s) = signature.split_at(signature.len() / 2);
            EcdsaSig::from_private_components(BigNum::from_slice(r)?, BigNum::from_slice(s)?)?
                .to_der()?
        }
    };

    let mut verifier = Verifier::new(MessageDigest::sha256(), key)?;
    verifier.update(data)?;
    verifier.verify(&der)
}
