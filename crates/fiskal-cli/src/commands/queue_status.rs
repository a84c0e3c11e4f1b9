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

//! Implementation of the `queue-status` command.

use anyhow::{Context, Result};
use fiskal::FiskalConfig;

use super::{open_database, submission_queue};

pub async fn run(config: &FiskalConfig) -> Result<()> {
    let database = open_database(config).await?;
    let queue = submission_queue(config, database);
    let status = queue
        .status()
        .await
        .context("Failed to read queue status")?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}
