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

//! SQLite persistence for durable queue jobs, data keys, secrets and
//! rotation records.

pub mod connection;
pub mod models;
pub mod schema;

pub use connection::{Database, DatabaseError};

use diesel_migrations::{embed_migrations, EmbeddedMigrations};

/// Migrations embedded from `migrations/`.
pub const SQLITE_MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");
