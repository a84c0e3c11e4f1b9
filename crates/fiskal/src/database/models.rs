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

//! Row types mapped onto the SQLite tables.
//!
//! These mirror [`schema`](super::schema) column-for-column. Conversion to
//! domain types lives next to the code that uses them.

use chrono::NaiveDateTime;
use diesel::prelude::*;

use super::schema::{data_keys, encrypted_secrets, key_rotations, submission_jobs};

#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = data_keys)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct DataKeyRow {
    pub version: i32,
    pub wrapped_key: Vec<u8>,
    pub key_hash: String,
    pub created_at: NaiveDateTime,
    pub retired_at: Option<NaiveDateTime>,
    pub overlap_until: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = encrypted_secrets)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct SecretRow {
    pub name: String,
    pub ciphertext: Vec<u8>,
    pub algorithm: String,
    pub key_version: i32,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable, AsChangeset)]
#[diesel(table_name = key_rotations)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
#[diesel(treat_none_as_null = true)]
pub struct RotationRow {
    pub id: String,
    pub status: String,
    pub previous_key_hash: String,
    pub new_key_hash: String,
    pub previous_version: i32,
    pub new_version: i32,
    pub records_processed: i32,
    pub records_total: i32,
    pub last_error: Option<String>,
    pub resumed_from: Option<String>,
    pub started_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
    pub completed_at: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = submission_jobs)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct SubmissionJobRow {
    pub id: String,
    pub document_id: String,
    pub target_id: String,
    pub payload: String,
    pub attempts: i32,
    pub state: String,
    pub next_eligible_at: NaiveDateTime,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<NaiveDateTime>,
    pub last_error: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}
