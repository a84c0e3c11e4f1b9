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

//! SQLite-backed key store.
//!
//! Data keys never touch disk in the clear: each one is sealed with the
//! deployment master key before it is written to `data_keys`.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use uuid::Uuid;
use zeroize::Zeroizing;

use super::keyring::{DataKey, EncryptedSecret};
use super::store::{
    KeyRotationRecord, KeyVault, RotationLog, RotationStatus, SecretStore, StoreError, StoredKey,
};
use crate::crypto::{decrypt_secret, encrypt_secret, DATA_KEY_LEN};
use crate::database::models::{DataKeyRow, RotationRow, SecretRow};
use crate::database::schema::{data_keys, encrypted_secrets, key_rotations};
use crate::database::Database;

const OPEN_STATUSES: [&str; 2] = ["pending", "in_progress"];

fn db_err(e: impl std::fmt::Display) -> StoreError {
    StoreError::Database(e.to_string())
}

fn to_utc(ts: NaiveDateTime) -> DateTime<Utc> {
    ts.and_utc()
}

/// Key, secret and rotation storage in SQLite.
pub struct DbKeyStore {
    database: Database,
    master_key: Zeroizing<Vec<u8>>,
}

impl DbKeyStore {
    /// Creates a store that wraps data keys with `master_key` (32 bytes).
    pub fn new(database: Database, master_key: &[u8]) -> Result<Self, StoreError> {
        if master_key.len() != DATA_KEY_LEN {
            return Err(StoreError::KeyWrap(format!(
                "master key must be {} bytes, got {}",
                DATA_KEY_LEN,
                master_key.len()
            )));
        }
        Ok(Self {
            database,
            master_key: Zeroizing::new(master_key.to_vec()),
        })
    }

    fn wrap(&self, key: &DataKey) -> Result<DataKeyRow, StoreError> {
        let wrapped = encrypt_secret(key.material(), &self.master_key)
            .map_err(|e| StoreError::KeyWrap(e.to_string()))?;
        Ok(DataKeyRow {
            version: key.version() as i32,
            wrapped_key: wrapped,
            key_hash: key.hash().to_string(),
            created_at: key.created_at().naive_utc(),
            retired_at: None,
            overlap_until: None,
        })
    }

    fn unwrap_row(&self, row: DataKeyRow) -> Result<StoredKey, StoreError> {
        let material = decrypt_secret(&row.wrapped_key, &self.master_key)
            .map_err(|e| StoreError::KeyWrap(format!("key version {}: {}", row.version, e)))?;
        let key = DataKey::from_bytes(row.version as u32, &material, to_utc(row.created_at))
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;

        if key.hash() != row.key_hash {
            return Err(StoreError::Corrupt(format!(
                "key version {} does not match its recorded hash",
                row.version
            )));
        }

        Ok(StoredKey {
            key,
            retired_at: row.retired_at.map(to_utc),
            overlap_until: row.overlap_until.map(to_utc),
        })
    }

    fn secret_from_row(row: SecretRow) -> (String, EncryptedSecret) {
        (
            row.name,
            EncryptedSecret {
                ciphertext: row.ciphertext,
                algorithm: row.algorithm,
                key_version: row.key_version as u32,
            },
        )
    }

    fn rotation_to_row(record: &KeyRotationRecord) -> RotationRow {
        RotationRow {
            id: record.id.to_string(),
            status: record.status.as_str().to_string(),
            previous_key_hash: record.previous_key_hash.clone(),
            new_key_hash: record.new_key_hash.clone(),
            previous_version: record.previous_version as i32,
            new_version: record.new_version as i32,
            records_processed: record.records_processed as i32,
            records_total: record.records_total as i32,
            last_error: record.last_error.clone(),
            resumed_from: record.resumed_from.map(|id| id.to_string()),
            started_at: record.started_at.naive_utc(),
            updated_at: record.updated_at.naive_utc(),
            completed_at: record.completed_at.map(|t| t.naive_utc()),
        }
    }

    fn rotation_from_row(row: RotationRow) -> Result<KeyRotationRecord, StoreError> {
        let parse_id = |s: &str| Uuid::parse_str(s).map_err(|e| StoreError::Corrupt(e.to_string()));
        Ok(KeyRotationRecord {
            id: parse_id(&row.id)?,
            status: row.status.parse::<RotationStatus>()?,
            previous_key_hash: row.previous_key_hash,
            new_key_hash: row.new_key_hash,
            previous_version: row.previous_version as u32,
            new_version: row.new_version as u32,
            records_processed: row.records_processed as u32,
            records_total: row.records_total as u32,
            last_error: row.last_error,
            resumed_from: row.resumed_from.as_deref().map(parse_id).transpose()?,
            started_at: to_utc(row.started_at),
            updated_at: to_utc(row.updated_at),
            completed_at: row.completed_at.map(to_utc),
        })
    }
}

#[async_trait]
impl KeyVault for DbKeyStore {
    async fn load_keys(&self) -> Result<Vec<StoredKey>, StoreError> {
        let conn = self.database.connection().await?;
        let rows: Vec<DataKeyRow> = conn
            .interact(|conn| {
                data_keys::table
                    .select(DataKeyRow::as_select())
                    .order(data_keys::version.asc())
                    .load(conn)
            })
            .await
            .map_err(db_err)?
            .map_err(db_err)?;

        rows.into_iter().map(|row| self.unwrap_row(row)).collect()
    }

    async fn get_key(&self, version: u32) -> Result<Option<StoredKey>, StoreError> {
        let conn = self.database.connection().await?;
        let row: Option<DataKeyRow> = conn
            .interact(move |conn| {
                data_keys::table
                    .find(version as i32)
                    .select(DataKeyRow::as_select())
                    .first(conn)
                    .optional()
            })
            .await
            .map_err(db_err)?
            .map_err(db_err)?;

        row.map(|r| self.unwrap_row(r)).transpose()
    }

    async fn insert_key(&self, key: &DataKey) -> Result<(), StoreError> {
        let row = self.wrap(key)?;
        let version = key.version();
        let conn = self.database.connection().await?;
        conn.interact(move |conn| {
            diesel::insert_into(data_keys::table)
                .values(&row)
                .execute(conn)
        })
        .await
        .map_err(db_err)?
        .map_err(|e| match e {
            DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _) => {
                StoreError::Conflict(format!("key version {} already exists", version))
            }
            other => db_err(other),
        })?;
        Ok(())
    }

    async fn retire_key(
        &self,
        version: u32,
        retired_at: DateTime<Utc>,
        overlap_until: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let conn = self.database.connection().await?;
        let updated = conn
            .interact(move |conn| {
                diesel::update(data_keys::table.find(version as i32))
                    .set((
                        data_keys::retired_at.eq(Some(retired_at.naive_utc())),
                        data_keys::overlap_until.eq(overlap_until.map(|t| t.naive_utc())),
                    ))
                    .execute(conn)
            })
            .await
            .map_err(db_err)?
            .map_err(db_err)?;

        if updated == 0 {
            return Err(StoreError::NotFound(format!("key version {}", version)));
        }
        Ok(())
    }

    async fn delete_key(&self, version: u32) -> Result<(), StoreError> {
        let conn = self.database.connection().await?;
        conn.interact(move |conn| {
            diesel::delete(data_keys::table.find(version as i32)).execute(conn)
        })
        .await
        .map_err(db_err)?
        .map_err(db_err)?;
        Ok(())
    }
}

#[async_trait]
impl SecretStore for DbKeyStore {
    async fn put_secret(&self, name: &str, secret: &EncryptedSecret) -> Result<(), StoreError> {
        let row = SecretRow {
            name: name.to_string(),
            ciphertext: secret.ciphertext.clone(),
            algorithm: secret.algorithm.clone(),
            key_version: secret.key_version as i32,
            updated_at: Utc::now().naive_utc(),
        };
        let conn = self.database.connection().await?;
        conn.interact(move |conn| {
            diesel::replace_into(encrypted_secrets::table)
                .values(&row)
                .execute(conn)
        })
        .await
        .map_err(db_err)?
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_secret(&self, name: &str) -> Result<Option<EncryptedSecret>, StoreError> {
        let name = name.to_string();
        let conn = self.database.connection().await?;
        let row: Option<SecretRow> = conn
            .interact(move |conn| {
                encrypted_secrets::table
                    .find(name)
                    .select(SecretRow::as_select())
                    .first(conn)
                    .optional()
            })
            .await
            .map_err(db_err)?
            .map_err(db_err)?;
        Ok(row.map(|r| Self::secret_from_row(r).1))
    }

    async fn list_not_on_version(
        &self,
        version: u32,
    ) -> Result<Vec<(String, EncryptedSecret)>, StoreError> {
        let conn = self.database.connection().await?;
        let rows: Vec<SecretRow> = conn
            .interact(move |conn| {
                encrypted_secrets::table
                    .filter(encrypted_secrets::key_version.ne(version as i32))
                    .order(encrypted_secrets::name.asc())
                    .select(SecretRow::as_select())
                    .load(conn)
            })
            .await
            .map_err(db_err)?
            .map_err(db_err)?;
        Ok(rows.into_iter().map(Self::secret_from_row).collect())
    }

    async fn count_on_version(&self, version: u32) -> Result<u32, StoreError> {
        let conn = self.database.connection().await?;
        let count: i64 = conn
            .interact(move |conn| {
                encrypted_secrets::table
                    .filter(encrypted_secrets::key_version.eq(version as i32))
                    .count()
                    .get_result(conn)
            })
            .await
            .map_err(db_err)?
            .map_err(db_err)?;
        Ok(count as u32)
    }

    async fn replace_secret(
        &self,
        name: &str,
        expected: &EncryptedSecret,
        secret: &EncryptedSecret,
    ) -> Result<bool, StoreError> {
        let name = name.to_string();
        let expected = expected.clone();
        let secret = secret.clone();
        let conn = self.database.connection().await?;
        let updated = conn
            .interact(move |conn| {
                diesel::update(
                    encrypted_secrets::table
                        .filter(encrypted_secrets::name.eq(name))
                        .filter(encrypted_secrets::key_version.eq(expected.key_version as i32))
                        .filter(encrypted_secrets::algorithm.eq(expected.algorithm))
                        .filter(encrypted_secrets::ciphertext.eq(expected.ciphertext)),
                )
                .set((
                    encrypted_secrets::ciphertext.eq(secret.ciphertext),
                    encrypted_secrets::algorithm.eq(secret.algorithm),
                    encrypted_secrets::key_version.eq(secret.key_version as i32),
                    encrypted_secrets::updated_at.eq(Utc::now().naive_utc()),
                ))
                .execute(conn)
            })
            .await
            .map_err(db_err)?
            .map_err(db_err)?;
        Ok(updated == 1)
    }
}

#[async_trait]
impl RotationLog for DbKeyStore {
    async fn latest_completed(&self) -> Result<Option<KeyRotationRecord>, StoreError> {
        let conn = self.database.connection().await?;
        let row: Option<RotationRow> = conn
            .interact(|conn| {
                key_rotations::table
                    .filter(key_rotations::status.eq(RotationStatus::Completed.as_str()))
                    .order(key_rotations::completed_at.desc())
                    .select(RotationRow::as_select())
                    .first(conn)
                    .optional()
            })
            .await
            .map_err(db_err)?
            .map_err(db_err)?;
        row.map(Self::rotation_from_row).transpose()
    }

    async fn latest(&self) -> Result<Option<KeyRotationRecord>, StoreError> {
        let conn = self.database.connection().await?;
        let row: Option<RotationRow> = conn
            .interact(|conn| {
                key_rotations::table
                    .order(key_rotations::started_at.desc())
                    .select(RotationRow::as_select())
                    .first(conn)
                    .optional()
            })
            .await
            .map_err(db_err)?
            .map_err(db_err)?;
        row.map(Self::rotation_from_row).transpose()
    }

    async fn open_rotation(&self) -> Result<Option<KeyRotationRecord>, StoreError> {
        let conn = self.database.connection().await?;
        let row: Option<RotationRow> = conn
            .interact(|conn| {
                key_rotations::table
                    .filter(key_rotations::status.eq_any(OPEN_STATUSES))
                    .select(RotationRow::as_select())
                    .first(conn)
                    .optional()
            })
            .await
            .map_err(db_err)?
            .map_err(db_err)?;
        row.map(Self::rotation_from_row).transpose()
    }

    async fn begin_rotation(&self, record: &KeyRotationRecord) -> Result<bool, StoreError> {
        let row = Self::rotation_to_row(record);
        let conn = self.database.connection().await?;
        // IMMEDIATE takes the write lock up front, so the check and the insert
        // cannot interleave with another process doing the same.
        conn.interact(move |conn| {
            conn.immediate_transaction::<bool, DieselError, _>(|conn| {
                let open: i64 = key_rotations::table
                    .filter(key_rotations::status.eq_any(OPEN_STATUSES))
                    .count()
                    .get_result(conn)?;
                if open > 0 {
                    return Ok(false);
                }
                diesel::insert_into(key_rotations::table)
                    .values(&row)
                    .execute(conn)?;
                Ok(true)
            })
        })
        .await
        .map_err(db_err)?
        .map_err(db_err)
    }

    async fn update_rotation(&self, record: &KeyRotationRecord) -> Result<(), StoreError> {
        let row = Self::rotation_to_row(record);
        let id = row.id.clone();
        let conn = self.database.connection().await?;
        let updated = conn
            .interact(move |conn| {
                diesel::update(key_rotations::table.find(id))
                    .set(&row)
                    .execute(conn)
            })
            .await
            .map_err(db_err)?
            .map_err(db_err)?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!("rotation {}", record.id)));
        }
        Ok(())
    }

    async fn claim_stale(
        &self,
        id: Uuid,
        observed_updated_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let conn = self.database.connection().await?;
        let updated = conn
            .interact(move |conn| {
                diesel::update(
                    key_rotations::table
                        .filter(key_rotations::id.eq(id.to_string()))
                        .filter(key_rotations::status.eq_any(OPEN_STATUSES))
                        .filter(key_rotations::updated_at.eq(observed_updated_at.naive_utc())),
                )
                .set(key_rotations::updated_at.eq(now.naive_utc()))
                .execute(conn)
            })
            .await
            .map_err(db_err)?
            .map_err(db_err)?;
        Ok(updated == 1)
    }
}
