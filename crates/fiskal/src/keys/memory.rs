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

//! In-memory implementation of the key store contracts.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use super::keyring::{DataKey, EncryptedSecret};
use super::store::{
    KeyRotationRecord, KeyVault, RotationLog, RotationStatus, SecretStore, StoreError, StoredKey,
};

#[derive(Default)]
struct State {
    keys: BTreeMap<u32, StoredKey>,
    secrets: HashMap<String, EncryptedSecret>,
    rotations: Vec<KeyRotationRecord>,
}

/// Key, secret and rotation storage held in process memory.
#[derive(Default)]
pub struct MemoryKeyStore {
    state: Mutex<State>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every rotation record, oldest first.
    pub fn rotations(&self) -> Vec<KeyRotationRecord> {
        self.state.lock().rotations.clone()
    }
}

#[async_trait]
impl KeyVault for MemoryKeyStore {
    async fn load_keys(&self) -> Result<Vec<StoredKey>, StoreError> {
        Ok(self.state.lock().keys.values().cloned().collect())
    }

    async fn get_key(&self, version: u32) -> Result<Option<StoredKey>, StoreError> {
        Ok(self.state.lock().keys.get(&version).cloned())
    }

    async fn insert_key(&self, key: &DataKey) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        if state.keys.contains_key(&key.version()) {
            return Err(StoreError::Conflict(format!(
                "key version {} already exists",
                key.version()
            )));
        }
        state.keys.insert(
            key.version(),
            StoredKey {
                key: key.clone(),
                retired_at: None,
                overlap_until: None,
            },
        );
        Ok(())
    }

    async fn retire_key(
        &self,
        version: u32,
        retired_at: DateTime<Utc>,
        overlap_until: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        let stored = state
            .keys
            .get_mut(&version)
            .ok_or_else(|| StoreError::NotFound(format!("key version {}", version)))?;
        stored.retired_at = Some(retired_at);
        stored.overlap_until = overlap_until;
        Ok(())
    }

    async fn delete_key(&self, version: u32) -> Result<(), StoreError> {
        self.state.lock().keys.remove(&version);
        Ok(())
    }
}

#[async_trait]
impl SecretStore for MemoryKeyStore {
    async fn put_secret(&self, name: &str, secret: &EncryptedSecret) -> Result<(), StoreError> {
        self.state
            .lock()
            .secrets
            .insert(name.to_string(), secret.clone());
        Ok(())
    }

    async fn get_secret(&self, name: &str) -> Result<Option<EncryptedSecret>, StoreError> {
        Ok(self.state.lock().secrets.get(name).cloned())
    }

    async fn list_not_on_version(
        &self,
        version: u32,
    ) -> Result<Vec<(String, EncryptedSecret)>, StoreError> {
        let mut found: Vec<_> = self
            .state
            .lock()
            .secrets
            .iter()
            .filter(|(_, s)| s.key_version != version)
            .map(|(n, s)| (n.clone(), s.clone()))
            .collect();
        found.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(found)
    }

    async fn count_on_version(&self, version: u32) -> Result<u32, StoreError> {
        let count = self
            .state
            .lock()
            .secrets
            .values()
            .filter(|s| s.key_version == version)
            .count();
        Ok(count as u32)
    }

    async fn replace_secret(
        &self,
        name: &str,
        expected: &EncryptedSecret,
        secret: &EncryptedSecret,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock();
        match state.secrets.get_mut(name) {
            Some(existing) if existing == expected => {
                *existing = secret.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl RotationLog for MemoryKeyStore {
    async fn latest_completed(&self) -> Result<Option<KeyRotationRecord>, StoreError> {
        Ok(self
            .state
            .lock()
            .rotations
            .iter()
            .filter(|r| r.status == RotationStatus::Completed)
            .max_by_key(|r| r.completed_at)
            .cloned())
    }

    async fn latest(&self) -> Result<Option<KeyRotationRecord>, StoreError> {
        Ok(self
            .state
            .lock()
            .rotations
            .iter()
            .max_by_key(|r| r.started_at)
            .cloned())
    }

    async fn open_rotation(&self) -> Result<Option<KeyRotationRecord>, StoreError> {
        Ok(self
            .state
            .lock()
            .rotations
            .iter()
            .find(|r| r.status.is_open())
            .cloned())
    }

    async fn begin_rotation(&self, record: &KeyRotationRecord) -> Result<bool, StoreError> {
        let mut state = self.state.lock();
        if state.rotations.iter().any(|r| r.status.is_open()) {
            return Ok(false);
        }
        state.rotations.push(record.clone());
        Ok(true)
    }

    async fn update_rotation(&self, record: &KeyRotationRecord) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        let existing = state
            .rotations
            .iter_mut()
            .find(|r| r.id == record.id)
            .ok_or_else(|| StoreError::NotFound(format!("rotation {}", record.id)))?;
        *existing = record.clone();
        Ok(())
    }

    async fn claim_stale(
        &self,
        id: Uuid,
        observed_updated_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock();
        match state.rotations.iter_mut().find(|r| r.id == id) {
            Some(r) if r.status.is_open() && r.updated_at == observed_updated_at => {
                r.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
