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

//! Subcommand implementations and the shared service wiring they use.

pub mod encrypt_password;
pub mod queue_status;
pub mod rotate_keys;
pub mod sign;
pub mod verify;
pub mod worker;

use std::sync::Arc;

use anyhow::{Context, Result};
use fiskal::submission::DurableBackend;
use fiskal::{
    CertificateStore, Database, DbKeyStore, FiskalConfig, KeyRotationService, SubmissionQueue,
};

/// Opens the configured database, applying migrations.
pub async fn open_database(config: &FiskalConfig) -> Result<Database> {
    let url = config.database_url().context(
        "Database URL is required. Set --database-url or FISKAL_DATABASE_URL environment variable",
    )?;
    Database::connect(url)
        .await
        .with_context(|| format!("Failed to open database {}", url))
}

/// Key store and rotation service over the configured database.
pub struct KeyServices {
    pub store: Arc<DbKeyStore>,
    pub rotation: Arc<KeyRotationService>,
}

impl KeyServices {
    pub async fn open(config: &FiskalConfig, database: Database) -> Result<Self> {
        let master_key = config
            .master_key()
            .context("FISKAL_MASTER_KEY (64 hex characters) is required")?;
        let store = Arc::new(DbKeyStore::new(database, master_key.as_bytes())?);
        let rotation = KeyRotationService::initialize(store.clone(), config.rotation_policy())
            .await
            .context("Failed to load the data key ring")?;
        Ok(Self {
            store,
            rotation: Arc::new(rotation),
        })
    }

    pub fn certificate_store(&self) -> CertificateStore {
        CertificateStore::new(self.rotation.key_ring()).with_secret_store(self.store.clone())
    }
}

/// Durable submission queue over the configured database and targets.
pub fn submission_queue(config: &FiskalConfig, database: Database) -> SubmissionQueue {
    SubmissionQueue::durable(
        Arc::new(DurableBackend::new(database)),
        config.targets().clone(),
        config.retry_policy(),
    )
}
