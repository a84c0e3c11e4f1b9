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

//! Data key rotation against the SQLite key store.

use std::sync::Arc;

use fiskal::keys::SecretStore;
use fiskal::{
    CertificateStore, Database, DbKeyStore, KeyRotationService, RotationPolicy, RotationReason,
};

use crate::fixtures::{self, PASSWORD};

const MASTER_KEY: [u8; 32] = [0x42; 32];

async fn open(url: &str) -> (Arc<DbKeyStore>, KeyRotationService) {
    let db = Database::connect(url).await.unwrap();
    let store = Arc::new(DbKeyStore::new(db, &MASTER_KEY).unwrap());
    let service = KeyRotationService::initialize(store.clone(), RotationPolicy::default())
        .await
        .unwrap();
    (store, service)
}

#[tokio::test]
async fn test_rotation_migrates_passwords_and_keeps_old_tokens_readable() {
    let dir = tempfile::tempdir().unwrap();
    let url = dir.path().join("keys.db").to_str().unwrap().to_string();
    let bundle = fixtures::write_bundle(dir.path(), "rotating-signer", PASSWORD);

    let (store, service) = open(&url).await;
    let certificates = CertificateStore::new(service.key_ring()).with_secret_store(store.clone());
    let v1_token = certificates
        .register_password("rotating-signer", PASSWORD)
        .await
        .unwrap()
        .to_string();
    assert!(v1_token.starts_with("v1:"));

    let outcome = service.rotate_now().await.unwrap();
    assert!(outcome.rotated);
    assert_eq!(outcome.reason, RotationReason::Forced);
    assert_eq!(outcome.current_version, 2);

    let migrated = store.get_secret("rotating-signer").await.unwrap().unwrap();
    assert_eq!(migrated.key_version, 2);

    let credential = certificates
        .load_named(&bundle, "rotating-signer")
        .await
        .unwrap();
    assert_eq!(credential.key_version(), Some(2));

    // Tokens handed out before the rotation still work inside the overlap.
    let credential = certificates.load(&bundle, &v1_token).unwrap();
    assert_eq!(credential.key_version(), Some(1));
}

#[tokio::test]
async fn test_rotated_keys_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let url = dir.path().join("keys.db").to_str().unwrap().to_string();

    let token = {
        let (_store, service) = open(&url).await;
        service.rotate_now().await.unwrap();
        service
            .key_ring()
            .snapshot()
            .encrypt(b"after rotation")
            .unwrap()
    };

    let (_store, service) = open(&url).await;
    let ring = service.key_ring().snapshot();
    assert_eq!(ring.current().version(), 2);
    assert_eq!(
        ring.decrypt(&token, chrono::Utc::now()).unwrap().as_slice(),
        b"after rotation"
    );

    let outcome = service.check_and_rotate_if_needed().await.unwrap();
    assert!(!outcome.rotated);
    assert_eq!(outcome.reason, RotationReason::NotDue);
}

#[tokio::test]
async fn test_keys_are_unreadable_with_another_master_key() {
    let dir = tempfile::tempdir().unwrap();
    let url = dir.path().join("keys.db").to_str().unwrap().to_string();
    let _ = open(&url).await;

    let db = Database::connect(&url).await.unwrap();
    let store = Arc::new(DbKeyStore::new(db, &[0x24; 32]).unwrap());
    assert!(
        KeyRotationService::initialize(store, RotationPolicy::default())
            .await
            .is_err()
    );
}
