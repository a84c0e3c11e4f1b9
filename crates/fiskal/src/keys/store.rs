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

//! Storage contracts for data keys, encrypted secrets and rotation records.
//!
//! The rotation service and the certificate store only talk to these traits.
//! [`MemoryKeyStore`](super::MemoryKeyStore) and
//! [`DbKeyStore`](super::DbKeyStore) implement all three.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use super::keyring::{DataKey, EncryptedSecret, KeyRing, KeyRingError, RetainedKey};
use crate::database::DatabaseError;

/// Errors raised by key, secret and rotation stores.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Conflicting write: {0}")]
    Conflict(String),

    #[error("Key wrapping error: {0}")]
    KeyWrap(String),

    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

impl From<DatabaseError> for StoreError {
    fn from(err: DatabaseError) -> Self {
        StoreError::Database(err.to_string())
    }
}

/// A data key as persisted, with its retirement state.
#[derive(Debug, Clone)]
pub struct StoredKey {
    pub key: DataKey,
    pub retired_at: Option<DateTime<Utc>>,
    pub overlap_until: Option<DateTime<Utc>>,
}

/// Builds a ring from persisted keys. The highest version becomes current.
pub fn ring_from_stored(mut keys: Vec<StoredKey>) -> Result<KeyRing, KeyRingError> {
    keys.sort_by(|a, b| b.key.version().cmp(&a.key.version()));
    let mut iter = keys.into_iter();
    let current = iter.next().ok_or(KeyRingError::Empty)?;
    let retired_default = current.key.created_at();

    Ok(iter.fold(KeyRing::new(current.key), |ring, stored| {
        ring.with_retained(RetainedKey {
            retired_at: stored.retired_at.unwrap_or(retired_default),
            overlap_until: stored.overlap_until,
            key: stored.key,
        })
    }))
}

/// Lifecycle state of a rotation record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl RotationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RotationStatus::Pending => "pending",
            RotationStatus::InProgress => "in_progress",
            RotationStatus::Completed => "completed",
            RotationStatus::Failed => "failed",
        }
    }

    /// Whether the record still holds the rotation lock.
    pub fn is_open(&self) -> bool {
        matches!(self, RotationStatus::Pending | RotationStatus::InProgress)
    }
}

impl fmt::Display for RotationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RotationStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RotationStatus::Pending),
            "in_progress" => Ok(RotationStatus::InProgress),
            "completed" => Ok(RotationStatus::Completed),
            "failed" => Ok(RotationStatus::Failed),
            other => Err(StoreError::Corrupt(format!(
                "unknown rotation status '{}'",
                other
            ))),
        }
    }
}

/// One key rotation attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyRotationRecord {
    pub id: Uuid,
    pub status: RotationStatus,
    pub previous_key_hash: String,
    pub new_key_hash: String,
    pub previous_version: u32,
    pub new_version: u32,
    pub records_processed: u32,
    pub records_total: u32,
    pub last_error: Option<String>,
    /// Failed record this one picked up from.
    pub resumed_from: Option<Uuid>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl KeyRotationRecord {
    /// A fresh `pending` record for rotating `previous` to `next`.
    pub fn pending(previous: &DataKey, next: &DataKey, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            status: RotationStatus::Pending,
            previous_key_hash: previous.hash().to_string(),
            new_key_hash: next.hash().to_string(),
            previous_version: previous.version(),
            new_version: next.version(),
            records_processed: 0,
            records_total: 0,
            last_error: None,
            resumed_from: None,
            started_at: now,
            updated_at: now,
            completed_at: None,
        }
    }
}

/// Persistence for data keys.
#[async_trait]
pub trait KeyVault: Send + Sync {
    /// All keys, in no particular order.
    async fn load_keys(&self) -> Result<Vec<StoredKey>, StoreError>;

    async fn get_key(&self, version: u32) -> Result<Option<StoredKey>, StoreError>;

    /// Stores a new key. Fails with `Conflict` if the version exists.
    async fn insert_key(&self, key: &DataKey) -> Result<(), StoreError>;

    /// Marks a key superseded. `overlap_until = None` means still draining.
    async fn retire_key(
        &self,
        version: u32,
        retired_at: DateTime<Utc>,
        overlap_until: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError>;

    async fn delete_key(&self, version: u32) -> Result<(), StoreError>;
}

/// Persistence for encrypted secrets, addressed by name.
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn put_secret(&self, name: &str, secret: &EncryptedSecret) -> Result<(), StoreError>;

    async fn get_secret(&self, name: &str) -> Result<Option<EncryptedSecret>, StoreError>;

    /// Secrets whose key version differs from `version`.
    async fn list_not_on_version(
        &self,
        version: u32,
    ) -> Result<Vec<(String, EncryptedSecret)>, StoreError>;

    async fn count_on_version(&self, version: u32) -> Result<u32, StoreError>;

    /// Replaces a secret only if it still holds exactly `expected`
    /// (same version and ciphertext). Returns `false` when another writer
    /// got there first.
    async fn replace_secret(
        &self,
        name: &str,
        expected: &EncryptedSecret,
        secret: &EncryptedSecret,
    ) -> Result<bool, StoreError>;
}

/// Persistence for rotation records. Doubles as the deployment-wide
/// rotation lock: at most one record is open at a time.
#[async_trait]
pub trait RotationLog: Send + Sync {
    async fn latest_completed(&self) -> Result<Option<KeyRotationRecord>, StoreError>;

    /// Most recently started record of any status.
    async fn latest(&self) -> Result<Option<KeyRotationRecord>, StoreError>;

    /// The pending or in-progress record, if any.
    async fn open_rotation(&self) -> Result<Option<KeyRotationRecord>, StoreError>;

    /// Inserts `record` unless another record is open. Returns whether the
    /// insert happened.
    async fn begin_rotation(&self, record: &KeyRotationRecord) -> Result<bool, StoreError>;

    async fn update_rotation(&self, record: &KeyRotationRecord) -> Result<(), StoreError>;

    /// Takes over an open record whose `updated_at` still equals
    /// `observed_updated_at`, bumping it to `now`.
    async fn claim_stale(
        &self,
        id: Uuid,
        observed_updated_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;
}

/// Everything the rotation service needs from persistence.
pub trait KeyStore: KeyVault + SecretStore + RotationLog {}

impl<T: KeyVault + SecretStore + RotationLog> KeyStore for T {}
