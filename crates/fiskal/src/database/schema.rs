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

// Diesel table definitions for the SQLite schema in `migrations/`.

diesel::table! {
    data_keys (version) {
        version -> Integer,
        wrapped_key -> Binary,
        key_hash -> Text,
        created_at -> Timestamp,
        retired_at -> Nullable<Timestamp>,
        overlap_until -> Nullable<Timestamp>,
    }
}

diesel::table! {
    encrypted_secrets (name) {
        name -> Text,
        ciphertext -> Binary,
        algorithm -> Text,
        key_version -> Integer,
        updated_at -> Timestamp,
    }
}

diesel::table! {
    key_rotations (id) {
        id -> Text,
        status -> Text,
        previous_key_hash -> Text,
        new_key_hash -> Text,
        previous_version -> Integer,
        new_version -> Integer,
        records_processed -> Integer,
        records_total -> Integer,
        last_error -> Nullable<Text>,
        resumed_from -> Nullable<Text>,
        started_at -> Timestamp,
        updated_at -> Timestamp,
        completed_at -> Nullable<Timestamp>,
    }
}

diesel::table! {
    submission_jobs (id) {
        id -> Text,
        document_id -> Text,
        target_id -> Text,
        payload -> Text,
        attempts -> Integer,
        state -> Text,
        next_eligible_at -> Timestamp,
        claimed_by -> Nullable<Text>,
        claimed_at -> Nullable<Timestamp>,
        last_error -> Nullable<Text>,
        created_at -> Timestamp,
        updated_at -> Timestamp,
    }
}

diesel::allow_tables_to_appear_in_same_query!(
    data_keys,
    encrypted_secrets,
    key_rotations,
    submission_jobs,
);
