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

//! Job storage behind the submission queue.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;

use super::job::{BackendKind, Completion, JobId, JobState, SubmissionJob};

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("Corrupt job row {id}: {reason}")]
    Corrupt { id: String, reason: String },
}

/// Job counts by state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StateCounts {
    pub queued: usize,
    pub in_flight: usize,
    pub succeeded: usize,
    pub dead_letter: usize,
}

impl StateCounts {
    /// Jobs still awaiting an outcome.
    pub fn depth(&self) -> usize {
        self.queued + self.in_flight
    }

    pub(crate) fn add(&mut self, state: JobState) {
        self.add_many(state, 1);
    }

    pub(crate) fn add_many(&mut self, state: JobState, n: usize) {
        match state {
            JobState::Queued => self.queued += n,
            JobState::InFlight => self.in_flight += n,
            JobState::Succeeded => self.succeeded += n,
            JobState::DeadLetter => self.dead_letter += n,
            JobState::Failed => {}
        }
    }
}

/// Storage contract for submission jobs.
///
/// `claim` is the only mutual exclusion between workers: a job is handed to
/// at most one worker until that worker completes it or its lease expires.
#[async_trait]
pub trait JobBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    async fn push(&self, job: &SubmissionJob) -> Result<(), BackendError>;

    /// Claims the queued job that has been eligible the longest.
    async fn claim(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<SubmissionJob>, BackendError>;

    /// Records the outcome of a claimed job. Returns `false` when `worker_id`
    /// no longer holds the job.
    async fn complete(
        &self,
        job_id: JobId,
        worker_id: &str,
        completion: &Completion,
        now: DateTime<Utc>,
    ) -> Result<bool, BackendError>;

    async fn get(&self, job_id: JobId) -> Result<Option<SubmissionJob>, BackendError>;

    async fn counts(&self) -> Result<StateCounts, BackendError>;

    /// Returns in-flight jobs claimed before `now - lease` to the queue.
    /// The recovered jobs are reported as they were last claimed.
    async fn recover_stale(
        &self,
        lease: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<SubmissionJob>, BackendError>;
}

pub(crate) fn apply_completion(
    job: &mut SubmissionJob,
    completion: &Completion,
    now: DateTime<Utc>,
) {
    job.state = completion.state();
    job.updated_at = now;
    job.claimed_by = None;
    job.claimed_at = None;
    match completion {
        Completion::Succeeded => {
            job.attempts += 1;
            job.last_error = None;
        }
        Completion::Retry {
            attempts,
            next_eligible_at,
            error,
        } => {
            job.attempts = *attempts;
            job.next_eligible_at = *next_eligible_at;
            job.last_error = Some(error.clone());
        }
        Completion::DeadLetter { attempts, error } => {
            job.attempts = *attempts;
            job.last_error = Some(error.clone());
        }
    }
}

/// Jobs held in process memory. Used when no durable backend is configured
/// or while it is unreachable.
#[derive(Debug, Default)]
pub struct InProcessBackend {
    jobs: Mutex<HashMap<JobId, SubmissionJob>>,
}

impl InProcessBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes and returns every queued job, oldest first.
    pub fn drain_queued(&self) -> Vec<SubmissionJob> {
        let mut jobs = self.jobs.lock();
        let ids: Vec<JobId> = jobs
            .values()
            .filter(|job| job.state == JobState::Queued)
            .map(|job| job.id)
            .collect();
        let mut drained: Vec<SubmissionJob> =
            ids.iter().filter_map(|id| jobs.remove(id)).collect();
        drained.sort_by_key(|job| job.created_at);
        drained
    }

    /// Puts a job back unchanged.
    pub fn restore(&self, job: SubmissionJob) {
        self.jobs.lock().insert(job.id, job);
    }
}

#[async_trait]
impl JobBackend for InProcessBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::InProcess
    }

    async fn push(&self, job: &SubmissionJob) -> Result<(), BackendError> {
        let mut job = job.clone();
        job.backend = BackendKind::InProcess;
        self.jobs.lock().insert(job.id, job);
        Ok(())
    }

    async fn claim(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<SubmissionJob>, BackendError> {
        let mut jobs = self.jobs.lock();
        let next = jobs
            .values_mut()
            .filter(|job| job.is_claimable(now))
            .min_by_key(|job| (job.next_eligible_at, job.created_at));

        Ok(next.map(|job| {
            job.state = JobState::InFlight;
            job.claimed_by = Some(worker_id.to_string());
            job.claimed_at = Some(now);
            job.updated_at = now;
            job.clone()
        }))
    }

    async fn complete(
        &self,
        job_id: JobId,
        worker_id: &str,
        completion: &Completion,
        now: DateTime<Utc>,
    ) -> Result<bool, BackendError> {
        let mut jobs = self.jobs.lock();
        match jobs.get_mut(&job_id) {
            Some(job)
                if job.state == JobState::InFlight
                    && job.claimed_by.as_deref() == Some(worker_id) =>
            {
                apply_completion(job, completion, now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get(&self, job_id: JobId) -> Result<Option<SubmissionJob>, BackendError> {
        Ok(self.jobs.lock().get(&job_id).cloned())
    }

    async fn counts(&self) -> Result<StateCounts, BackendError> {
        let mut counts = StateCounts::default();
        for job in self.jobs.lock().values() {
            counts.add(job.state);
        }
        Ok(counts)
    }

    async fn recover_stale(
        &self,
        lease: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<SubmissionJob>, BackendError> {
        let cutoff = now - lease;
        let mut recovered = Vec::new();
        for job in self.jobs.lock().values_mut() {
            if job.state == JobState::InFlight && job.claimed_at.is_some_and(|at| at < cutoff) {
                recovered.push(job.clone());
                job.state = JobState::Queued;
                job.claimed_by = None;
                job.claimed_at = None;
                job.updated_at = now;
            }
        }
        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn job(doc: &str, now: DateTime<Utc>) -> SubmissionJob {
        SubmissionJob::new(doc, "tax_authority", "<a/>", BackendKind::InProcess, now)
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let backend = InProcessBackend::new();
        let now = Utc::now();
        backend.push(&job("a", now)).await.unwrap();

        let first = backend.claim("w1", now).await.unwrap();
        let second = backend.claim("w2", now).await.unwrap();
        assert!(first.is_some());
        assert!(second.is_none());
        assert_eq!(first.unwrap().claimed_by.as_deref(), Some("w1"));
    }

    #[tokio::test]
    async fn test_claim_respects_eligibility_and_order() {
        let backend = InProcessBackend::new();
        let now = Utc::now();
        let mut later = job("later", now);
        later.next_eligible_at = now + Duration::seconds(30);
        backend.push(&later).await.unwrap();
        backend.push(&job("b", now + Duration::milliseconds(1))).await.unwrap();
        backend.push(&job("a", now)).await.unwrap();

        let claimed = backend.claim("w", now + Duration::seconds(1)).await.unwrap();
        assert_eq!(claimed.unwrap().document_id, "a");
        let claimed = backend.claim("w", now + Duration::seconds(1)).await.unwrap();
        assert_eq!(claimed.unwrap().document_id, "b");
        assert!(backend.claim("w", now + Duration::seconds(1)).await.unwrap().is_none());
        assert!(backend.claim("w", now + Duration::seconds(31)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_complete_requires_owner() {
        let backend = InProcessBackend::new();
        let now = Utc::now();
        let j = job("a", now);
        backend.push(&j).await.unwrap();
        backend.claim("w1", now).await.unwrap();

        assert!(!backend
            .complete(j.id, "w2", &Completion::Succeeded, now)
            .await
            .unwrap());
        assert!(backend
            .complete(j.id, "w1", &Completion::Succeeded, now)
            .await
            .unwrap());

        let stored = backend.get(j.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Succeeded);
        assert_eq!(stored.attempts, 1);
        assert_eq!(backend.counts().await.unwrap().depth(), 0);
    }

    #[tokio::test]
    async fn test_recover_stale_and_drain() {
        let backend = InProcessBackend::new();
        let now = Utc::now();
        let j = job("a", now);
        backend.push(&j).await.unwrap();
        backend.claim("w1", now).await.unwrap();

        let later = now + Duration::minutes(10);
        assert!(backend.recover_stale(Duration::minutes(30), later).await.unwrap().is_empty());
        let recovered = backend.recover_stale(Duration::minutes(5), later).await.unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].claimed_by.as_deref(), Some("w1"));

        let drained = backend.drain_queued();
        assert_eq!(drained.len(), 1);
        assert_eq!(backend.counts().await.unwrap(), StateCounts::default());
    }
}
