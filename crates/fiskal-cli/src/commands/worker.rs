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

//! Implementation of the `worker` command.
//!
//! Runs the submission worker pool and the periodic key rotation check until
//! Ctrl-C.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use fiskal::{
    FiskalConfig, PinnedTransport, PinningGuard, ShutdownSignal, SubmissionWorker, TlsDialer,
};
use tracing::{info, warn};

use super::{open_database, submission_queue, KeyServices};

pub async fn run(config: &FiskalConfig, rotation_check_hours: u64) -> Result<()> {
    if config.targets().is_empty() {
        bail!("No submission targets configured. Set FISKAL_TARGET_<ID>_URL");
    }

    let database = open_database(config).await?;
    let keys = KeyServices::open(config, database.clone()).await?;
    let queue = Arc::new(submission_queue(config, database));

    let guard = Arc::new(PinningGuard::new(config.pinning().clone()));
    for target in config.targets().ids() {
        let host = config
            .targets()
            .get(target)
            .and_then(|url| url.host_str())
            .unwrap_or_default();
        if !guard.is_pinned(host) {
            warn!(target = %target, host = %host, "Submission target has no certificate pin");
        }
    }

    let dialer = Arc::new(TlsDialer::with_webpki_roots().context("Failed to build TLS client")?);
    let transport = Arc::new(PinnedTransport::new(dialer, guard, config.request_timeout()));
    let worker = Arc::new(SubmissionWorker::new(
        queue.clone(),
        transport,
        config.worker_pool_config(),
    ));

    let shutdown = ShutdownSignal::new();
    let pool = worker.spawn(shutdown.clone());
    let rotation = tokio::spawn(keys.rotation.clone().run_periodic(
        Duration::from_secs(rotation_check_hours.max(1) * 3600),
        shutdown.clone(),
    ));

    let status = queue.status().await?;
    info!(
        depth = status.depth,
        durable = status.durable,
        workers = config.workers(),
        "Worker running; press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutting down workers");

    pool.shutdown().await;
    rotation.await.context("Key rotation task failed")?;
    Ok(())
}
