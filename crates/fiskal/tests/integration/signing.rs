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

//! Credential loading and XAdES signing through the public API.

use fiskal::{CredentialLoadError, Verification, XadesSigner};

use crate::fixtures::{self, KeyedStore, PASSWORD};

#[tokio::test]
async fn test_sign_and_verify_loaded_credential() {
    let dir = tempfile::tempdir().unwrap();
    let bundle = fixtures::write_bundle(dir.path(), "issuer-one", PASSWORD);
    let keys = KeyedStore::new().await;
    let credential = keys.load(&bundle, "issuer-one", PASSWORD).await;
    assert_eq!(credential.key_version(), Some(1));

    let xml = fixtures::invoice("2026-0001", 500);
    assert_eq!(xml.len(), 500);

    let signer = XadesSigner::new();
    let signed = signer.sign_xml("2026-0001", &xml, &credential).unwrap();
    assert_eq!(signer.verify_signature(&signed), Verification::Valid);
    assert_eq!(
        signer.verify_enveloped(&signed.enveloped_xml()),
        Verification::Valid
    );
}

#[tokio::test]
async fn test_tampered_enveloped_document_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let bundle = fixtures::write_bundle(dir.path(), "issuer-two", PASSWORD);
    let keys = KeyedStore::new().await;
    let credential = keys.load(&bundle, "issuer-two", PASSWORD).await;

    let signer = XadesSigner::new();
    let signed = signer
        .sign_xml("2026-0002", &fixtures::invoice("2026-0002", 400), &credential)
        .unwrap();
    let tampered = signed.enveloped_xml().replace("125.00", "12.50");

    assert!(!signer.verify_enveloped(&tampered).is_valid());
}

#[tokio::test]
async fn test_wrong_password_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let bundle = fixtures::write_bundle(dir.path(), "issuer-three", PASSWORD);
    let keys = KeyedStore::new().await;
    let token = keys
        .certificates
        .encrypt_password("not the password")
        .unwrap()
        .to_string();

    assert!(matches!(
        keys.certificates.load(&bundle, &token),
        Err(CredentialLoadError::WrongPassword)
    ));
}

#[tokio::test]
async fn test_missing_bundle_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let keys = KeyedStore::new().await;
    let token = keys
        .certificates
        .encrypt_password(PASSWORD)
        .unwrap()
        .to_string();

    let result = keys.certificates.load(dir.path().join("absent.p12"), &token);
    assert!(matches!(result, Err(CredentialLoadError::NotFound(_))));
}
