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

//! The submission queue facade.
//!
//! Jobs go to the durable backend when one is configured and reachable. When
//! it is not, they are accepted into an in-process backend instead and the
//! queue reports itself as degraded until [`SubmissionQueue::promote_fallback`]
//! succeeds.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use super::backend::{BackendError, InProcessBackend, JobBackend, StateCounts};
use super::delivery::{DeliveryError, TargetRegistry};
use super::job::{BackendKind, Completion, JobId, JobState, SubmissionJob};
use super::retry::{RetryDecision, RetryPolicy};
use crate::audit;
use crate::xades::SignedDocument;

/// Audit actor for transitions the queue makes on its own.
const QUEUE_ACTOR: &str = "submission_queue";
/// Audit `from_state` of a job that did not exist before.
const NEW_JOB: &str = "new";

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Unknown submission target '{0}'")]
    UnknownTarget(String),

    #[error("Job {0} is no longer held by this worker")]
    ClaimLost(JobId),

    #[error("No durable backend configured for job {0}")]
    NoDurableBackend(JobId),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Operational snapshot of the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    /// Queued plus in-flight jobs across both backends.
    pub depth: usize,
    pub durable_depth: usize,
    /// Jobs that would be lost on restart.
    pub in_process_depth: usize,
    pub dead_letter: usize,
    pub durable: bool,
    pub degraded: bool,
}

pub struct SubmissionQueue {
    durable: Option<Arc<dyn JobBackend>>,
    fallback: Arc<InProcessBackend>,
    targets: TargetRegistry,
    retry: RetryPolicy,
    degraded: AtomicBool,
    notify: Arc<Notify>,
}

impl SubmissionQueue {
    /// A queue without durable storage.
    pub fn in_process(targets: TargetRegistry, retry: RetryPolicy) -> Self {
        Self {
            durable: None,
            fallback: Arc::new(InProcessBackend::new()),
            targets,
            retry,
            degraded: AtomicBool::new(false),
            notify: Arc::new(Notify::new()),
        }
    }

    /// A queue backed by `backend`, falling back to process memory.
    pub fn durable(backend: Arc<dyn JobBackend>, targets: TargetRegistry, retry: RetryPolicy) -> Self {
        Self {
            durable: Some(backend),
            ..Self::in_process(targets, retry)
        }
    }

    pub fn targets(&self) -> &TargetRegistry {
        &self.targets
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Signalled whenever a job becomes claimable.
    pub fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    /// True when a durable backend is configured and currently in use.
    pub fn is_durable(&self) -> bool {
        self.durable.is_some() && !self.is_degraded()
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    fn mark_degraded(&self, reason: &BackendError) {
        if !self.degraded.swap(true, Ordering::SeqCst) {
            warn!(error = %reason, "Durable submission backend unreachable; queue degraded");
        }
    }

    /// Queues the enveloped form of `signed` for delivery to `target_id`.
    pub async fn enqueue(&self, signed: &SignedDocument, target_id: &str) -> Result<JobId, QueueError> {
        self.enqueue_payload(signed.document_id(), target_id, signed.enveloped_xml())
            .await
    }

    /// Queues an already-enveloped payload.
    pub async fn enqueue_payload(
        &self,
        document_id: &str,
        target_id: &str,
        payload: String,
    ) -> Result<JobId, QueueError> {
        if !self.targets.contains(target_id) {
            return Err(QueueError::UnknownTarget(target_id.to_string()));
        }

        let mut job = SubmissionJob::new(
            document_id,
            target_id,
            payload,
            BackendKind::Durable,
            Utc::now(),
        );

        if let Some(durable) = &self.durable {
            match durable.push(&job).await {
                Ok(()) => {
                    info!(job_id = %job.id, document_id = %document_id, target = %target_id, "Submission queued");
                    Self::audit_queued(&job);
                    self.notify.notify_one();
                    return Ok(job.id);
                }
                Err(e) => {
                    self.mark_degraded(&e);
                    audit::log_queue_fallback(&job.id.to_string(), document_id, &e.to_string());
                    metrics::counter!("fiskal_queue_fallback_enqueued_total").increment(1);
                }
            }
        }

        job.backend = BackendKind::InProcess;
        self.fallback.push(&job).await?;
        debug!(job_id = %job.id, document_id = %document_id, "Submission queued in process");
        Self::audit_queued(&job);
        self.notify.notify_one();
        Ok(job.id)
    }

    fn audit_queued(job: &SubmissionJob) {
        audit::log_submission_transition(
            QUEUE_ACTOR,
            &job.id.to_string(),
            &job.document_id,
            NEW_JOB,
            JobState::Queued.as_str(),
            job.attempts,
        );
    }

    /// Queued plus in-flight jobs across both backends.
    pub async fn size(&self) -> Result<usize, QueueError> {
        Ok(self.status().await?.depth)
    }

    /// Current depths and durability. Also refreshes the queue gauges.
    pub async fn status(&self) -> Result<QueueStatus, QueueError> {
        let in_process = self.fallback.counts().await?;
        let durable = match &self.durable {
            Some(backend) => match backend.counts().await {
                Ok(counts) => counts,
                Err(e) => {
                    self.mark_degraded(&e);
                    StateCounts::default()
                }
            },
            None => StateCounts::default(),
        };

        let status = QueueStatus {
            depth: durable.depth() + in_process.depth(),
            durable_depth: durable.depth(),
            in_process_depth: in_process.depth(),
            dead_letter: durable.dead_letter + in_process.dead_letter,
            durable: self.is_durable(),
            degraded: self.is_degraded(),
        };
        metrics::gauge!("fiskal_submission_queue_depth").set(status.depth as f64);
        metrics::gauge!("fiskal_submission_queue_durable").set(if status.durable { 1.0 } else { 0.0 });
        Ok(status)
    }

    pub async fn get(&self, job_id: JobId) -> Result<Option<SubmissionJob>, QueueError> {
        let durable = match &self.durable {
            Some(backend) => backend.get(job_id).await,
            None => Ok(None),
        };
        match durable {
            Ok(Some(job)) => Ok(Some(job)),
            Ok(None) => Ok(self.fallback.get(job_id).await?),
            Err(e) => match self.fallback.get(job_id).await? {
                Some(job) => Ok(Some(job)),
                None => Err(e.into()),
            },
        }
    }

    /// Claims the next eligible job for `worker_id`, durable jobs first.
    pub async fn claim(&self, worker_id: &str) -> Result<Option<SubmissionJob>, QueueError> {
        let now = Utc::now();
        let mut claimed = None;
        if let Some(durable) = &self.durable {
            match durable.claim(worker_id, now).await {
                Ok(job) => claimed = job,
                Err(e) => self.mark_degraded(&e),
            }
        }
        if claimed.is_none() {
            claimed = self.fallback.claim(worker_id, now).await?;
        }

        if let Some(job) = &claimed {
            audit::log_submission_transition(
                worker_id,
                &job.id.to_string(),
                &job.document_id,
                JobState::Queued.as_str(),
                JobState::InFlight.as_str(),
                job.attempts,
            );
        }
        Ok(claimed)
    }

    /// Records a successful delivery.
    pub async fn record_success(
        &self,
        job: &SubmissionJob,
        worker_id: &str,
    ) -> Result<JobState, QueueError> {
        self.complete(job, worker_id, JobState::InFlight, Completion::Succeeded).await
    }

    /// Records a failed delivery. Transient failures are retried with
    /// backoff until the attempt limit; everything else is dead-lettered.
    /// An interrupted delivery is requeued as it was, without spending an
    /// attempt.
    pub async fn record_failure(
        &self,
        job: &SubmissionJob,
        worker_id: &str,
        error: &DeliveryError,
    ) -> Result<JobState, QueueError> {
        if matches!(error, DeliveryError::Interrupted) {
            let completion = Completion::Retry {
                attempts: job.attempts,
                next_eligible_at: Utc::now(),
                error: error.to_string(),
            };
            return self.complete(job, worker_id, JobState::InFlight, completion).await;
        }

        let attempts = job.attempts + 1;
        audit::log_submission_transition(
            worker_id,
            &job.id.to_string(),
            &job.document_id,
            JobState::InFlight.as_str(),
            JobState::Failed.as_str(),
            attempts,
        );

        let completion = match error {
            DeliveryError::Transient(reason) => match self.retry.decide(attempts, Utc::now()) {
                RetryDecision::RetryAt(next_eligible_at) => Completion::Retry {
                    attempts,
                    next_eligible_at,
                    error: reason.clone(),
                },
                RetryDecision::DeadLetter => Completion::DeadLetter {
                    attempts,
                    error: format!("gave up after {} attempts: {}", attempts, reason),
                },
            },
            other => Completion::DeadLetter {
                attempts,
                error: other.to_string(),
            },
        };
        self.complete(job, worker_id, JobState::Failed, completion).await
    }

    async fn complete(
        &self,
        job: &SubmissionJob,
        worker_id: &str,
        from: JobState,
        completion: Completion,
    ) -> Result<JobState, QueueError> {
        let backend: &dyn JobBackend = match job.backend {
            BackendKind::Durable => self
                .durable
                .as_deref()
                .ok_or(QueueError::NoDurableBackend(job.id))?,
            BackendKind::InProcess => self.fallback.as_ref(),
        };

        if !backend
            .complete(job.id, worker_id, &completion, Utc::now())
            .await?
        {
            return Err(QueueError::ClaimLost(job.id));
        }

        let job_id = job.id.to_string();
        let state = completion.state();
        let attempts = match &completion {
            Completion::Succeeded => job.attempts + 1,
            Completion::Retry { attempts, .. } | Completion::DeadLetter { attempts, .. } => *attempts,
        };
        audit::log_submission_transition(
            worker_id,
            &job_id,
            &job.document_id,
            from.as_str(),
            state.as_str(),
            attempts,
        );

        match &completion {
            Completion::Succeeded => {
                metrics::counter!("fiskal_submission_succeeded_total").increment(1);
            }
            Completion::Retry { .. } => {
                metrics::counter!("fiskal_submission_retried_total").increment(1);
                self.notify.notify_one();
            }
            Completion::DeadLetter { error, .. } => {
                audit::log_submission_dead_lettered(
                    worker_id,
                    &job_id,
                    &job.document_id,
                    &job.target_id,
                    error,
                );
                metrics::counter!("fiskal_submission_dead_letter_total").increment(1);
            }
        }
        Ok(state)
    }

    /// Moves queued in-process jobs into the durable backend. Clears the
    /// degraded flag once no job is left in process; an in-process job still
    /// in flight keeps the queue degraded until it finishes or is requeued
    /// and promoted.
    pub async fn promote_fallback(&self) -> Result<usize, QueueError> {
        let Some(durable) = &self.durable else {
            return Ok(0);
        };

        let mut pending = self.fallback.drain_queued().into_iter();
        let mut promoted = 0;
        while let Some(mut job) = pending.next() {
            job.backend = BackendKind::Durable;
            if let Err(e) = durable.push(&job).await {
                job.backend = BackendKind::InProcess;
                self.fallback.restore(job);
                for rest in pending {
                    self.fallback.restore(rest);
                }
                self.mark_degraded(&e);
                return Err(e.into());
            }
            audit::log_queue_promoted(&job.id.to_string(), &job.document_id);
            promoted += 1;
        }

        let remaining = self.fallback.counts().await?.depth();
        if remaining > 0 {
            debug!(promoted, remaining, "In-process submissions still in flight; staying degraded");
        } else if self.degraded.swap(false, Ordering::SeqCst) {
            info!(promoted, "Durable submission backend reachable again");
        }
        if promoted > 0 {
            self.notify.notify_one();
        }
        Ok(promoted)
    }

    /// Requeues jobs whose worker has held them longer than `lease`.
    pub async fn recover_stale(&self, lease: Duration) -> Result<usize, QueueError> {
        let lease = chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::days(36500));
        let now = Utc::now();
        let mut stale = self.fallback.recover_stale(lease, now).await?;
        if let Some(durable) = &self.durable {
            stale.extend(durable.recover_stale(lease, now).await?);
        }

        for job in &stale {
            audit::log_submission_transition(
                QUEUE_ACTOR,
                &job.id.to_string(),
                &job.document_id,
                JobState::InFlight.as_str(),
                JobState::Queued.as_str(),
                job.attempts,
            );
            debug!(job_id = %job.id, worker = ?job.claimed_by, "Requeued abandoned submission");
        }
        let recovered = stale.len();
        if recovered > 0 {
            warn!(recovered, "Requeued submissions abandoned by their worker");
            self.notify.notify_one();
        }
        Ok(recovered)
    }
}
