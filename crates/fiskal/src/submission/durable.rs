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

//! SQLite-backed job storage.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::result::Error as DieselError;
use uuid::Uuid;

use super::backend::{apply_completion, BackendError, JobBackend, StateCounts};
use super::job::{BackendKind, Completion, JobId, JobState, SubmissionJob};
use crate::database::models::SubmissionJobRow;
use crate::database::schema::submission_jobs;
use crate::database::Database;

fn unavailable(e: impl std::fmt::Display) -> BackendError {
    BackendError::Unavailable(e.to_string())
}

impl From<&SubmissionJob> for SubmissionJobRow {
    fn from(job: &SubmissionJob) -> Self {
        SubmissionJobRow {
            id: job.id.to_string(),
            document_id: job.document_id.clone(),
            target_id: job.target_id.clone(),
            payload: job.payload.clone(),
            attempts: job.attempts as i32,
            state: job.state.as_str().to_string(),
            next_eligible_at: job.next_eligible_at.naive_utc(),
            claimed_by: job.claimed_by.clone(),
            claimed_at: job.claimed_at.map(|t| t.naive_utc()),
            last_error: job.last_error.clone(),
            created_at: job.created_at.naive_utc(),
            updated_at: job.updated_at.naive_utc(),
        }
    }
}

impl TryFrom<SubmissionJobRow> for SubmissionJob {
    type Error = BackendError;

    fn try_from(row: SubmissionJobRow) -> Result<Self, Self::Error> {
        let corrupt = |reason: String| BackendError::Corrupt {
            id: row.id.clone(),
            reason,
        };
        let id = Uuid::parse_str(&row.id).map_err(|e| corrupt(e.to_string()))?;
        let state = row.state.parse::<JobState>().map_err(corrupt)?;
        Ok(SubmissionJob {
            id,
            document_id: row.document_id,
            target_id: row.target_id,
            payload: row.payload,
            attempts: row.attempts.max(0) as u32,
            state,
            next_eligible_at: row.next_eligible_at.and_utc(),
            backend: BackendKind::Durable,
            claimed_by: row.claimed_by,
            claimed_at: row.claimed_at.map(|t| t.and_utc()),
            last_error: row.last_error,
            created_at: row.created_at.and_utc(),
            updated_at: row.updated_at.and_utc(),
        })
    }
}

/// Submission jobs in the `submission_jobs` table.
#[derive(Debug, Clone)]
pub struct DurableBackend {
    database: Database,
}

impl DurableBackend {
    pub fn new(database: Database) -> Self {
        Self { database }
    }
}

#[async_trait]
impl JobBackend for DurableBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Durable
    }

    async fn push(&self, job: &SubmissionJob) -> Result<(), BackendError> {
        let mut row = SubmissionJobRow::from(job);
        row.state = JobState::Queued.as_str().to_string();
        let conn = self.database.connection().await.map_err(unavailable)?;
        conn.interact(move |conn| {
            diesel::insert_into(submission_jobs::table)
                .values(&row)
                .execute(conn)
        })
        .await
        .map_err(unavailable)?
        .map_err(unavailable)?;
        Ok(())
    }

    async fn claim(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<SubmissionJob>, BackendError> {
        let worker_id = worker_id.to_string();
        let now = now.naive_utc();
        let conn = self.database.connection().await.map_err(unavailable)?;

        // IMMEDIATE takes the write lock before the select, so two claimers
        // can never both observe the same queued row.
        let claimed = conn
            .interact(move |conn| {
                conn.immediate_transaction::<Option<SubmissionJobRow>, DieselError, _>(|conn| {
                    let candidate: Option<SubmissionJobRow> = submission_jobs::table
                        .filter(submission_jobs::state.eq(JobState::Queued.as_str()))
                        .filter(submission_jobs::next_eligible_at.le(now))
                        .order((
                            submission_jobs::next_eligible_at.asc(),
                            submission_jobs::created_at.asc(),
                        ))
                        .select(SubmissionJobRow::as_select())
                        .first(conn)
                        .optional()?;

                    let Some(mut row) = candidate else {
                        return Ok(None);
                    };

                    diesel::update(submission_jobs::table.find(&row.id))
                        .set((
                            submission_jobs::state.eq(JobState::InFlight.as_str()),
                            submission_jobs::claimed_by.eq(Some(worker_id.clone())),
                            submission_jobs::claimed_at.eq(Some(now)),
                            submission_jobs::updated_at.eq(now),
                        ))
                        .execute(conn)?;

                    row.state = JobState::InFlight.as_str().to_string();
                    row.claimed_by = Some(worker_id.clone());
                    row.claimed_at = Some(now);
                    row.updated_at = now;
                    Ok(Some(row))
                })
            })
            .await
            .map_err(unavailable)?
            .map_err(unavailable)?;

        claimed.map(SubmissionJob::try_from).transpose()
    }

    async fn complete(
        &self,
        job_id: JobId,
        worker_id: &str,
        completion: &Completion,
        now: DateTime<Utc>,
    ) -> Result<bool, BackendError> {
        let Some(mut job) = self.get(job_id).await? else {
            return Ok(false);
        };
        if job.state != JobState::InFlight || job.claimed_by.as_deref() != Some(worker_id) {
            return Ok(false);
        }
        apply_completion(&mut job, completion, now);

        let row = SubmissionJobRow::from(&job);
        let worker_id = worker_id.to_string();
        let conn = self.database.connection().await.map_err(unavailable)?;
        let updated = conn
            .interact(move |conn| {
                diesel::update(
                    submission_jobs::table
                        .filter(submission_jobs::id.eq(&row.id))
                        .filter(submission_jobs::state.eq(JobState::InFlight.as_str()))
                        .filter(submission_jobs::claimed_by.eq(&worker_id)),
                )
                .set((
                    submission_jobs::state.eq(&row.state),
                    submission_jobs::attempts.eq(row.attempts),
                    submission_jobs::next_eligible_at.eq(row.next_eligible_at),
                    submission_jobs::claimed_by.eq(None::<String>),
                    submission_jobs::claimed_at.eq(None::<chrono::NaiveDateTime>),
                    submission_jobs::last_error.eq(&row.last_error),
                    submission_jobs::updated_at.eq(row.updated_at),
                ))
                .execute(conn)
            })
            .await
            .map_err(unavailable)?
            .map_err(unavailable)?;
        Ok(updated == 1)
    }

    async fn get(&self, job_id: JobId) -> Result<Option<SubmissionJob>, BackendError> {
        let id = job_id.to_string();
        let conn = self.database.connection().await.map_err(unavailable)?;
        let row = conn
            .interact(move |conn| {
                submission_jobs::table
                    .find(id)
                    .select(SubmissionJobRow::as_select())
                    .first(conn)
                    .optional()
            })
            .await
            .map_err(unavailable)?
            .map_err(unavailable)?;
        row.map(SubmissionJob::try_from).transpose()
    }

    async fn counts(&self) -> Result<StateCounts, BackendError> {
        let conn = self.database.connection().await.map_err(unavailable)?;
        let grouped: Vec<(String, i64)> = conn
            .interact(|conn| {
                submission_jobs::table
                    .group_by(submission_jobs::state)
                    .select((submission_jobs::state, diesel::dsl::count_star()))
                    .load(conn)
            })
            .await
            .map_err(unavailable)?
            .map_err(unavailable)?;

        let mut counts = StateCounts::default();
        for (state, count) in grouped {
            let state = state.parse::<JobState>().map_err(|reason| BackendError::Corrupt {
                id: "*".to_string(),
                reason,
            })?;
            counts.add_many(state, count.max(0) as usize);
        }
        Ok(counts)
    }

    async fn recover_stale(
        &self,
        lease: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<SubmissionJob>, BackendError> {
        let cutoff = (now - lease).naive_utc();
        let now = now.naive_utc();
        let conn = self.database.connection().await.map_err(unavailable)?;
        let rows = conn
            .interact(move |conn| {
                conn.immediate_transaction::<Vec<SubmissionJobRow>, DieselError, _>(|conn| {
                    let stale: Vec<SubmissionJobRow> = submission_jobs::table
                        .filter(submission_jobs::state.eq(JobState::InFlight.as_str()))
                        .filter(submission_jobs::claimed_at.lt(cutoff))
                        .select(SubmissionJobRow::as_select())
                        .load(conn)?;
                    let ids: Vec<String> = stale.iter().map(|row| row.id.clone()).collect();

                    diesel::update(submission_jobs::table.filter(submission_jobs::id.eq_any(ids)))
                        .set((
                            submission_jobs::state.eq(JobState::Queued.as_str()),
                            submission_jobs::claimed_by.eq(None::<String>),
                            submission_jobs::claimed_at.eq(None::<chrono::NaiveDateTime>),
                            submission_jobs::updated_at.eq(now),
                        ))
                        .execute(conn)?;
                    Ok(stale)
                })
            })
            .await
            .map_err(unavailable)?
            .map_err(unavailable)?;

        rows.into_iter().map(SubmissionJob::try_from).collect()
    }
}
