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

//! Worker pool draining the submission queue.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::delivery::{DeliveryError, DeliveryReceipt, DocumentTransport};
use super::job::{JobState, SubmissionJob};
use super::queue::{QueueError, SubmissionQueue};
use crate::shutdown::ShutdownSignal;

/// Worker pool settings.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub workers: usize,
    /// Idle wait between claims when nothing signals new work.
    pub poll_interval: Duration,
    pub request_timeout: Duration,
    /// In-flight jobs older than this are assumed abandoned.
    pub stale_lease: Duration,
    pub maintenance_interval: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            poll_interval: Duration::from_millis(500),
            request_timeout: Duration::from_secs(30),
            stale_lease: Duration::from_secs(300),
            maintenance_interval: Duration::from_secs(30),
        }
    }
}

/// Claims jobs, delivers them and records the outcome.
pub struct SubmissionWorker {
    queue: Arc<SubmissionQueue>,
    transport: Arc<dyn DocumentTransport>,
    config: WorkerPoolConfig,
}

/// Handle to a running pool.
pub struct WorkerPoolHandle {
    shutdown: ShutdownSignal,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPoolHandle {
    /// Stops every worker and waits for them to finish.
    pub async fn shutdown(self) {
        self.shutdown.trigger();
        self.join().await;
    }

    /// Waits for the workers to exit on their own signal.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Submission worker task panicked");
            }
        }
    }
}

impl SubmissionWorker {
    pub fn new(
        queue: Arc<SubmissionQueue>,
        transport: Arc<dyn DocumentTransport>,
        config: WorkerPoolConfig,
    ) -> Self {
        Self {
            queue,
            transport,
            config,
        }
    }

    pub fn queue(&self) -> &Arc<SubmissionQueue> {
        &self.queue
    }

    /// Starts `config.workers` delivery tasks plus one maintenance task.
    pub fn spawn(self: Arc<Self>, shutdown: ShutdownSignal) -> WorkerPoolHandle {
        let mut handles = Vec::with_capacity(self.config.workers + 1);
        for n in 0..self.config.workers.max(1) {
            let worker = self.clone();
            let signal = shutdown.clone();
            let worker_id = format!("worker-{}", n);
            handles.push(tokio::spawn(async move {
                worker.run_worker(worker_id, signal).await
            }));
        }

        let worker = self.clone();
        let signal = shutdown.clone();
        handles.push(tokio::spawn(async move { worker.run_maintenance(signal).await }));

        info!(workers = self.config.workers.max(1), "Submission worker pool started");
        WorkerPoolHandle { shutdown, handles }
    }

    /// Claims and delivers at most one job. Returns the state the job ended
    /// in, or `None` when nothing was claimable.
    pub async fn process_next(
        &self,
        worker_id: &str,
        shutdown: &ShutdownSignal,
    ) -> Result<Option<JobState>, QueueError> {
        let Some(job) = self.queue.claim(worker_id).await? else {
            return Ok(None);
        };
        debug!(worker = %worker_id, job_id = %job.id, attempt = job.attempts + 1, "Delivering submission");

        let state = match self.deliver(&job, shutdown).await {
            Ok(receipt) => {
                info!(
                    job_id = %job.id,
                    document_id = %job.document_id,
                    http_status = receipt.http_status,
                    remote_status = ?receipt.remote_status,
                    "Submission accepted"
                );
                self.queue.record_success(&job, worker_id).await?
            }
            Err(e) => {
                warn!(job_id = %job.id, document_id = %job.document_id, error = %e, "Submission attempt failed");
                self.queue.record_failure(&job, worker_id, &e).await?
            }
        };
        Ok(Some(state))
    }

    async fn deliver(
        &self,
        job: &SubmissionJob,
        shutdown: &ShutdownSignal,
    ) -> Result<DeliveryReceipt, DeliveryError> {
        let url = self.queue.targets().get(&job.target_id).cloned().ok_or_else(|| {
            DeliveryError::NonRetriable(format!("target '{}' is not configured", job.target_id))
        })?;

        let attempt = tokio::time::timeout(
            self.config.request_timeout,
            self.transport.deliver(&job.target_id, &url, &job.payload),
        );
        tokio::select! {
            biased;
            _ = shutdown.wait() => Err(DeliveryError::Interrupted),
            outcome = attempt => outcome.unwrap_or_else(|_| {
                Err(DeliveryError::Transient(format!(
                    "no response within {:?}",
                    self.config.request_timeout
                )))
            }),
        }
    }

    async fn run_worker(self: Arc<Self>, worker_id: String, shutdown: ShutdownSignal) {
        let notify = self.queue.notifier();
        debug!(worker = %worker_id, "Submission worker started");

        while !shutdown.is_triggered() {
            match self.process_next(&worker_id, &shutdown).await {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(e) => warn!(worker = %worker_id, error = %e, "Submission worker error"),
            }

            tokio::select! {
                _ = shutdown.wait() => break,
                _ = notify.notified() => {}
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
        debug!(worker = %worker_id, "Submission worker stopped");
    }

    async fn run_maintenance(self: Arc<Self>, shutdown: ShutdownSignal) {
        let mut interval = tokio::time::interval(self.config.maintenance_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = interval.tick() => {}
            }

            if let Err(e) = self.queue.recover_stale(self.config.stale_lease).await {
                warn!(error = %e, "Stale submission recovery failed");
            }
            if self.queue.is_degraded() {
                match self.queue.promote_fallback().await {
                    Ok(promoted) => info!(promoted, "Promoted in-process submissions"),
                    Err(e) => debug!(error = %e, "Durable backend still unreachable"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::submission::delivery::TargetRegistry;
    use crate::submission::retry::RetryPolicy;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use url::Url;

    struct ScriptedTransport {
        outcomes: Mutex<VecDeque<Result<DeliveryReceipt, DeliveryError>>>,
        calls: Mutex<usize>,
        delay: Duration,
    }

    impl ScriptedTransport {
        fn new(outcomes: Vec<Result<DeliveryReceipt, DeliveryError>>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes.into()),
                calls: Mutex::new(0),
                delay: Duration::ZERO,
            }
        }
    }

    fn accepted() -> Result<DeliveryReceipt, DeliveryError> {
        Ok(DeliveryReceipt {
            http_status: 200,
            remote_status: Some("accepted".into()),
            message: None,
        })
    }

    #[async_trait]
    impl DocumentTransport for ScriptedTransport {
        async fn deliver(
            &self,
            _target_id: &str,
            _url: &Url,
            _payload: &str,
        ) -> Result<DeliveryReceipt, DeliveryError> {
            *self.calls.lock() += 1;
            tokio::time::sleep(self.delay).await;
            let next = self.outcomes.lock().pop_front();
            next.unwrap_or_else(accepted)
        }
    }

    fn queue(retry: RetryPolicy) -> Arc<SubmissionQueue> {
        Arc::new(SubmissionQueue::in_process(
            TargetRegistry::new().with_target(
                "tax_authority",
                Url::parse("https://tax.example/submit").unwrap(),
            ),
            retry,
        ))
    }

    fn config() -> WorkerPoolConfig {
        WorkerPoolConfig {
            workers: 2,
            poll_interval: Duration::from_millis(10),
            request_timeout: Duration::from_secs(5),
            stale_lease: Duration::from_secs(60),
            maintenance_interval: Duration::from_millis(50),
        }
    }

    async fn wait_for_state(queue: &SubmissionQueue, id: uuid::Uuid, state: JobState) -> SubmissionJob {
        for _ in 0..200 {
            if let Some(job) = queue.get(id).await.unwrap() {
                if job.state == state {
                    return job;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {} never reached {}", id, state);
    }

    #[tokio::test]
    async fn test_pool_retries_until_success() {
        let queue = queue(RetryPolicy::new(5, Duration::ZERO, Duration::ZERO));
        let transport = Arc::new(ScriptedTransport::new(vec![
            Err(DeliveryError::Transient("503".into())),
            Err(DeliveryError::Transient("timeout".into())),
            accepted(),
        ]));
        let worker = Arc::new(SubmissionWorker::new(queue.clone(), transport.clone(), config()));
        let pool = worker.spawn(ShutdownSignal::new());

        let id = queue
            .enqueue_payload("inv-1", "tax_authority", "<a/>".into())
            .await
            .unwrap();
        let job = wait_for_state(&queue, id, JobState::Succeeded).await;
        pool.shutdown().await;

        assert_eq!(job.attempts, 3);
        assert_eq!(*transport.calls.lock(), 3);
        assert_eq!(queue.size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_timeout_is_transient() {
        let queue = queue(RetryPolicy::new(5, Duration::from_secs(60), Duration::from_secs(60)));
        let mut transport = ScriptedTransport::new(vec![]);
        transport.delay = Duration::from_secs(10);
        let mut config = config();
        config.request_timeout = Duration::from_millis(20);
        let worker = SubmissionWorker::new(queue.clone(), Arc::new(transport), config);

        let id = queue
            .enqueue_payload("inv-1", "tax_authority", "<a/>".into())
            .await
            .unwrap();
        let state = worker
            .process_next("w", &ShutdownSignal::new())
            .await
            .unwrap();

        assert_eq!(state, Some(JobState::Queued));
        let job = queue.get(id).await.unwrap().unwrap();
        assert_eq!(job.attempts, 1);
        assert!(job.last_error.unwrap().contains("no response"));
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_in_flight_delivery() {
        let queue = queue(RetryPolicy::default());
        let mut transport = ScriptedTransport::new(vec![]);
        transport.delay = Duration::from_secs(10);
        let worker = Arc::new(SubmissionWorker::new(queue.clone(), Arc::new(transport), config()));

        let id = queue
            .enqueue_payload("inv-1", "tax_authority", "<a/>".into())
            .await
            .unwrap();
        let pool = worker.spawn(ShutdownSignal::new());
        wait_for_state(&queue, id, JobState::InFlight).await;

        tokio::time::timeout(Duration::from_secs(2), pool.shutdown())
            .await
            .expect("pool stops promptly");

        let job = queue.get(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.attempts, 0);
        assert!(job.last_error.unwrap().contains("interrupted by shutdown"));
        assert!(job.next_eligible_at <= chrono::Utc::now());
    }

    #[tokio::test]
    async fn test_repeated_shutdowns_never_dead_letter() {
        let queue = queue(RetryPolicy::new(1, Duration::ZERO, Duration::ZERO));
        let mut transport = ScriptedTransport::new(vec![]);
        transport.delay = Duration::from_secs(10);
        let worker = SubmissionWorker::new(queue.clone(), Arc::new(transport), config());

        let id = queue
            .enqueue_payload("inv-1", "tax_authority", "<a/>".into())
            .await
            .unwrap();
        let stopped = ShutdownSignal::new();
        stopped.trigger();
        for _ in 0..3 {
            let state = worker.process_next("w", &stopped).await.unwrap();
            assert_eq!(state, Some(JobState::Queued));
        }

        let job = queue.get(id).await.unwrap().unwrap();
        assert_eq!(job.attempts, 0);
        assert_eq!(job.state, JobState::Queued);
    }

    #[tokio::test]
    async fn test_process_next_on_empty_queue() {
        let worker = SubmissionWorker::new(
            queue(RetryPolicy::default()),
            Arc::new(ScriptedTransport::new(vec![])),
            config(),
        );
        assert_eq!(
            worker.process_next("w", &ShutdownSignal::new()).await.unwrap(),
            None
        );
    }
}
