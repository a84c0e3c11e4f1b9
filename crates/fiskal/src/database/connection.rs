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

//! Connection pool management.
//!
//! [`Database`] wraps a `deadpool-diesel` SQLite pool. SQLite has limited
//! concurrent write support even in WAL mode, so the pool holds a single
//! connection and every write goes through it.

use deadpool_diesel::sqlite::{Manager, Object, Pool, Runtime};
use thiserror::Error;
use tracing::info;

/// Errors raised while creating or using the connection pool.
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Migration failed: {0}")]
    Migration(String),
}

/// Shared handle to the SQLite connection pool.
///
/// `Database` is `Clone`; clones reference the same pool.
#[derive(Clone)]
pub struct Database {
    pool: Pool,
    url: String,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").field("url", &self.url).finish()
    }
}

impl Database {
    /// Creates a pool for a SQLite database.
    ///
    /// Accepts a file path, `sqlite://path` or `:memory:`.
    pub fn new(connection_string: &str) -> Result<Self, DatabaseError> {
        let url = Self::build_sqlite_url(connection_string);
        let manager = Manager::new(url.clone(), Runtime::Tokio1);
        let pool_size = 1;
        let pool = Pool::builder(manager)
            .max_size(pool_size)
            .build()
            .map_err(|e| DatabaseError::Pool(e.to_string()))?;

        info!(url = %url, "SQLite connection pool initialized (size: {})", pool_size);

        Ok(Self { pool, url })
    }

    /// Opens the database and applies pending migrations.
    pub async fn connect(connection_string: &str) -> Result<Self, DatabaseError> {
        let database = Self::new(connection_string)?;
        database.run_migrations().await?;
        Ok(database)
    }

    /// Location of the database file.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Checks out the pooled connection.
    pub async fn connection(&self) -> Result<Object, DatabaseError> {
        self.pool
            .get()
            .await
            .map_err(|e| DatabaseError::Pool(e.to_string()))
    }

    /// Sets a busy timeout, then WAL mode, then runs pending migrations. The
    /// timeout must come first so switching journal mode waits out other
    /// handles on the same file.
    pub async fn run_migrations(&self) -> Result<(), DatabaseError> {
        use diesel_migrations::MigrationHarness;

        let conn = self.connection().await?;
        conn.interact(|conn| -> Result<(), String> {
            use diesel::prelude::*;

            diesel::sql_query("PRAGMA busy_timeout=30000;")
                .execute(conn)
                .map_err(|e| format!("Failed to set busy_timeout: {}", e))?;
            diesel::sql_query("PRAGMA journal_mode=WAL;")
                .execute(conn)
                .map_err(|e| format!("Failed to set WAL mode: {}", e))?;

            conn.run_pending_migrations(crate::database::SQLITE_MIGRATIONS)
                .map_err(|e| e.to_string())?;
            Ok(())
        })
        .await
        .map_err(|e| DatabaseError::Migration(e.to_string()))?
        .map_err(DatabaseError::Migration)
    }

    fn build_sqlite_url(connection_string: &str) -> String {
        if let Some(path) = connection_string.strip_prefix("sqlite://") {
            path.to_string()
        } else {
            connection_string.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqlite_connection_strings() {
        assert_eq!(
            Database::build_sqlite_url("/path/to/fiskal.db"),
            "/path/to/fiskal.db"
        );
        assert_eq!(Database::build_sqlite_url(":memory:"), ":memory:");
        assert_eq!(
            Database::build_sqlite_url("sqlite:///var/lib/fiskal.sqlite"),
            "/var/lib/fiskal.sqlite"
        );
    }

    #[tokio::test]
    async fn test_migrations_apply_to_fresh_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fiskal.db");
        let db = Database::connect(path.to_str().unwrap()).await.unwrap();

        // Running again is a no-op.
        db.run_migrations().await.unwrap();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_reopen_while_another_handle_is_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fiskal.db");
        let url = path.to_str().unwrap();

        let first = Database::connect(url).await.unwrap();
        first.run_migrations().await.unwrap();
        let second = Database::connect(url).await.unwrap();
        second.run_migrations().await.unwrap();
        drop(first);
        Database::connect(url).await.unwrap();
    }
}
