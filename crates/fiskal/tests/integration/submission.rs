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

//! Signed documents flowing through the queue and worker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fiskal::submission::{
    BackendError, BackendKind, Completion, DurableBackend, JobBackend, JobId, RetryPolicy,
    StateCounts, SubmissionJob, WorkerPoolConfig,
};
use fiskal::{
    Database, DeliveryError, JobState, ShutdownSignal, SubmissionQueue, SubmissionWorker,
    TargetRegistry, XadesSigner,
};
use url::Url;

use crate::fixtures::{self, KeyedStore, ScriptedTransport, PASSWORD};

fn targets() -> TargetRegistry {
    TargetRegistry::new().with_target("tax", Url::parse("https://tax.example/submit").unwrap())
}

fn no_backoff() -> RetryPolicy {
    RetryPolicy::new(5, Duration::ZERO, Duration::ZERO)
}

#[tokio::test]
async fn test_transient_failures_then_success() {
    let dir = tempfile::tempdir().unwrap();
    let bundle = fixtures::write_bundle(dir.path(), "e2e-signer", PASSWORD);
    let keys = KeyedStore::new().await;
    let credential = keys.load(&bundle, "e2e-signer", PASSWORD).await;

    let signer = XadesSigner::new();
    let signed = signer
        .sign_xml("2026-0100", &fixtures::invoice("2026-0100", 500), &credential)
        .unwrap();
    assert!(signer.verify_signature(&signed).is_valid());

    let queue = Arc::new(SubmissionQueue::in_process(targets(), no_backoff()));
    let before = queue.size().await.unwrap();
    let job_id = queue.enqueue(&signed, "tax").await.unwrap();
    assert_eq!(queue.size().await.unwrap(), before + 1);

    let transport = Arc::new(ScriptedTransport::new(vec![
        Err(DeliveryError::Transient("503 Service Unavailable".into())),
        Err(DeliveryError::Transient("connection reset".into())),
        Ok(fixtures::accepted()),
    ]));
    let worker = SubmissionWorker::new(queue.clone(), transport.clone(), WorkerPoolConfig::default());
    let shutdown = ShutdownSignal::new();

    let mut states = Vec::new();
    while let Some(state) = worker.process_next("worker-0", &shutdown).await.unwrap() {
        states.push(state);
    }
    assert_eq!(
        states,
        vec![JobState::Queued, JobState::Queued, JobState::Succeeded]
    );

    let job = queue.get(job_id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Succeeded);
    assert_eq!(job.attempts, 3);
    assert_eq!(queue.size().await.unwrap(), before);

    // Every attempt carried the same signed payload.
    let payloads = transport.payloads();
    assert_eq!(payloads.len(), 3);
    assert!(payloads.iter().all(|p| p == &signed.enveloped_xml()));
    assert!(signer.verify_enveloped(&payloads[0]).is_valid());
}

#[tokio::test]
async fn test_attempt_limit_dead_letters() {
    let queue = Arc::new(SubmissionQueue::in_process(
        targets(),
        RetryPolicy::new(2, Duration::ZERO, Duration::ZERO),
    ));
    let job_id = queue
        .enqueue_payload("2026-0101", "tax", "<Invoice/>".into())
        .await
        .unwrap();

    let transport = Arc::new(ScriptedTransport::new(vec![
        Err(DeliveryError::Transient("timeout".into())),
        Err(DeliveryError::Transient("timeout".into())),
    ]));
    let worker = SubmissionWorker::new(queue.clone(), transport.clone(), WorkerPoolConfig::default());
    let shutdown = ShutdownSignal::new();

    while worker.process_next("worker-0", &shutdown).await.unwrap().is_some() {}

    let job = queue.get(job_id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::DeadLetter);
    assert_eq!(job.attempts, 2);
    assert_eq!(transport.attempts(), 2);
    assert_eq!(queue.status().await.unwrap().dead_letter, 1);
}

#[tokio::test]
async fn test_durable_queue_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queue.db");
    let url = path.to_str().unwrap().to_string();

    let job_id = {
        let db = Database::connect(&url).await.unwrap();
        let queue = SubmissionQueue::durable(Arc::new(DurableBackend::new(db)), targets(), no_backoff());
        queue
            .enqueue_payload("2026-0102", "tax", "<Invoice/>".into())
            .await
            .unwrap()
    };

    let db = Database::connect(&url).await.unwrap();
    let queue = Arc::new(SubmissionQueue::durable(
        Arc::new(DurableBackend::new(db)),
        targets(),
        no_backoff(),
    ));
    let status = queue.status().await.unwrap();
    assert_eq!(status.durable_depth, 1);
    assert!(status.durable);

    let transport = Arc::new(ScriptedTransport::new(vec![Ok(fixtures::accepted())]));
    let worker = SubmissionWorker::new(queue.clone(), transport, WorkerPoolConfig::default());
    let state = worker
        .process_next("worker-0", &ShutdownSignal::new())
        .await
        .unwrap();
    assert_eq!(state, Some(JobState::Succeeded));

    let job = queue.get(job_id).await.unwrap().unwrap();
    assert_eq!(job.backend, BackendKind::Durable);
    assert_eq!(job.state, JobState::Succeeded);
}

/// Durable backend with a switch to simulate an outage.
struct FlakyBackend {
    inner: DurableBackend,
    down: AtomicBool,
}

impl FlakyBackend {
    fn check(&self) -> Result<(), BackendError> {
        if self.down.load(Ordering::SeqCst) {
            Err(BackendError::Unavailable("database is locked".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl JobBackend for FlakyBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Durable
    }

    async fn push(&self, job: &SubmissionJob) -> Result<(), BackendError> {
        self.check()?;
        self.inner.push(job).await
    }

    async fn claim(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<SubmissionJob>, BackendError> {
        self.check()?;
        self.inner.claim(worker_id, now).await
    }

    async fn complete(
        &self,
        job_id: JobId,
        worker_id: &str,
        completion: &Completion,
        now: DateTime<Utc>,
    ) -> Result<bool, BackendError> {
        self.check()?;
        self.inner.complete(job_id, worker_id, completion, now).await
    }

    async fn get(&self, job_id: JobId) -> Result<Option<SubmissionJob>, BackendError> {
        self.check()?;
        self.inner.get(job_id).await
    }

    async fn counts(&self) -> Result<StateCounts, BackendError> {
        self.check()?;
        self.inner.counts().await
    }

    async fn recover_stale(
        &self,
        lease: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<SubmissionJob>, BackendError> {
        self.check()?;
        self.inner.recover_stale(lease, now).await
    }
}

#[tokio::test]
async fn test_outage_falls_back_then_promotes() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::connect(dir.path().join("queue.db").to_str().unwrap())
        .await
        .unwrap();
    let backend = Arc::new(FlakyBackend {
        inner: DurableBackend::new(db),
        down: AtomicBool::new(true),
    });
    let queue = Arc::new(SubmissionQueue::durable(backend.clone(), targets(), no_backoff()));

    let job_id = queue
        .enqueue_payload("2026-0103", "tax", "<Invoice/>".into())
        .await
        .unwrap();
    assert!(queue.is_degraded());
    let job = queue.get(job_id).await.unwrap().unwrap();
    assert_eq!(job.backend, BackendKind::InProcess);

    let status = queue.status().await.unwrap();
    assert_eq!(status.in_process_depth, 1);
    assert!(status.degraded);

    // Still down: promotion fails and the job stays in process.
    assert!(queue.promote_fallback().await.is_err());
    assert_eq!(queue.status().await.unwrap().in_process_depth, 1);

    backend.down.store(false, Ordering::SeqCst);
    assert_eq!(queue.promote_fallback().await.unwrap(), 1);
    assert!(!queue.is_degraded());

    let status = queue.status().await.unwrap();
    assert_eq!(status.in_process_depth, 0);
    assert_eq!(status.durable_depth, 1);

    let transport = Arc::new(ScriptedTransport::new(vec![Ok(fixtures::accepted())]));
    let worker = SubmissionWorker::new(queue.clone(), transport, WorkerPoolConfig::default());
    let state = worker
        .process_next("worker-0", &ShutdownSignal::new())
        .await
        .unwrap();
    assert_eq!(state, Some(JobState::Succeeded));

    let job = queue.get(job_id).await.unwrap().unwrap();
    assert_eq!(job.backend, BackendKind::Durable);
    assert_eq!(job.state, JobState::Succeeded);
}

#[tokio::test]
async fn test_worker_pool_drains_queue() {
    let queue = Arc::new(SubmissionQueue::in_process(targets(), no_backoff()));
    let mut ids = Vec::new();
    for n in 0..6 {
        ids.push(
            queue
                .enqueue_payload(&format!("2026-02{:02}", n), "tax", "<Invoice/>".into())
                .await
                .unwrap(),
        );
    }

    let transport = Arc::new(ScriptedTransport::new(vec![Err(DeliveryError::Transient(
        "busy".into(),
    ))]));
    let config = WorkerPoolConfig {
        workers: 3,
        poll_interval: Duration::from_millis(10),
        ..WorkerPoolConfig::default()
    };
    let worker = Arc::new(SubmissionWorker::new(queue.clone(), transport.clone(), config));
    let pool = worker.spawn(ShutdownSignal::new());

    let drained = tokio::time::timeout(Duration::from_secs(10), async {
        while queue.size().await.unwrap() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    pool.shutdown().await;
    assert!(drained.is_ok(), "queue did not drain");

    for id in ids {
        let job = queue.get(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Succeeded);
    }
    // One retry on top of one delivery per job.
    assert_eq!(transport.attempts(), 7);
}
