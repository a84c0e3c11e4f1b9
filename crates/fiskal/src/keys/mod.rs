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

//! Data keys, encrypted secrets and key rotation.

mod db_store;
mod keyring;
mod memory;
mod rotation;
pub mod store;

pub use db_store::DbKeyStore;
pub use keyring::{
    DataKey, EncryptedSecret, KeyRing, KeyRingError, KeyRingHandle, RetainedKey, SECRET_ALGORITHM,
};
pub use memory::MemoryKeyStore;
pub use rotation::{
    KeyRotationService, RotationFailure, RotationOutcome, RotationPolicy, RotationReason,
};
pub use store::{
    KeyRotationRecord, KeyStore, KeyVault, RotationLog, RotationStatus, SecretStore, StoreError,
    StoredKey,
};
