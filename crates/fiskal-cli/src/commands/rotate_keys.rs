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

//! Implementation of the `rotate-keys` command.

use anyhow::{bail, Result};
use fiskal::FiskalConfig;
use serde_json::json;
use tracing::info;

use super::{open_database, KeyServices};

pub async fn run(config: &FiskalConfig, force: bool, prune: bool) -> Result<()> {
    let database = open_database(config).await?;
    let keys = KeyServices::open(config, database).await?;

    let outcome = if force {
        keys.rotation.rotate_now().await
    } else {
        keys.rotation.check_and_rotate_if_needed().await
    };
    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(e) => bail!(
            "{} (rotation {}); the previous key is still retained, manual follow-up required",
            e,
            e.rotation_id
                .map(|id| id.to_string())
                .unwrap_or_else(|| "not started".to_string())
        ),
    };

    let pruned = if prune {
        keys.rotation.prune_expired_keys().await?
    } else {
        Vec::new()
    };
    if !pruned.is_empty() {
        info!(versions = ?pruned, "Pruned expired data keys");
    }

    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "rotated": outcome.rotated,
            "reason": outcome.reason.as_str(),
            "current_version": outcome.current_version,
            "next_due": outcome.next_due.map(|t| t.to_rfc3339()),
            "pruned_versions": pruned,
        }))?
    );
    Ok(())
}
