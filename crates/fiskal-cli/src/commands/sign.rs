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

//! Implementation of the `sign` command.

use std::path::PathBuf;

use anyhow::{Context, Result};
use fiskal::{FiskalConfig, XadesSigner};
use tracing::info;

use super::{open_database, submission_queue, KeyServices};

pub enum Password {
    Token(String),
    Secret(String),
}

pub struct SignArgs {
    pub credential: PathBuf,
    pub password: Password,
    pub input: PathBuf,
    pub output: Option<PathBuf>,
    pub document_id: Option<String>,
    pub submit: Option<String>,
}

pub async fn run(config: &FiskalConfig, args: SignArgs) -> Result<()> {
    let database = open_database(config).await?;
    let keys = KeyServices::open(config, database.clone()).await?;
    let store = keys.certificate_store();

    let credential = match &args.password {
        Password::Token(token) => store.load(&args.credential, token),
        Password::Secret(name) => store.load_named(&args.credential, name).await,
    }
    .with_context(|| format!("Failed to load credential {}", args.credential.display()))?;

    let xml = std::fs::read_to_string(&args.input)
        .with_context(|| format!("Failed to read {}", args.input.display()))?;
    let document_id = args.document_id.clone().unwrap_or_else(|| {
        args.input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "document".to_string())
    });

    let signed = XadesSigner::new()
        .sign_xml(&document_id, &xml, &credential)
        .with_context(|| format!("Failed to sign {}", args.input.display()))?;
    credential.release();

    let enveloped = signed.enveloped_xml();
    match &args.output {
        Some(path) => {
            std::fs::write(path, &enveloped)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            info!(document_id = %document_id, output = %path.display(), digest = %signed.digest(), "Document signed");
        }
        None => println!("{}", enveloped),
    }

    if let Some(target) = &args.submit {
        let queue = submission_queue(config, database);
        let job_id = queue
            .enqueue(&signed, target)
            .await
            .with_context(|| format!("Failed to queue {} for {}", document_id, target))?;
        info!(job_id = %job_id, target = %target, durable = queue.is_durable(), "Queued for submission");
    }

    Ok(())
}
