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

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier handed back by [`enqueue`](super::SubmissionQueue::enqueue).
pub type JobId = Uuid;

/// Lifecycle of a submission job.
///
/// `Succeeded` and `DeadLetter` are terminal. `Failed` only exists between a
/// failed attempt and the retry decision; it is never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    InFlight,
    Succeeded,
    Failed,
    DeadLetter,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::InFlight => "in_flight",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::DeadLetter => "dead_letter",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::DeadLetter)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobState::Queued),
            "in_flight" => Ok(JobState::InFlight),
            "succeeded" => Ok(JobState::Succeeded),
            "failed" => Ok(JobState::Failed),
            "dead_letter" => Ok(JobState::DeadLetter),
            other => Err(format!("unknown job state '{}'", other)),
        }
    }
}

/// Where a job is held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Survives restarts.
    Durable,
    /// Lost on restart.
    InProcess,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Durable => "durable",
            BackendKind::InProcess => "in_process",
        }
    }
}

/// One signed document awaiting delivery to one target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionJob {
    pub id: JobId,
    pub document_id: String,
    pub target_id: String,
    /// Enveloped signed XML.
    pub payload: String,
    pub attempts: u32,
    pub state: JobState,
    pub next_eligible_at: DateTime<Utc>,
    pub backend: BackendKind,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SubmissionJob {
    /// A fresh queued job, eligible immediately.
    pub fn new(
        document_id: impl Into<String>,
        target_id: impl Into<String>,
        payload: impl Into<String>,
        backend: BackendKind,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            document_id: document_id.into(),
            target_id: target_id.into(),
            payload: payload.into(),
            attempts: 0,
            state: JobState::Queued,
            next_eligible_at: now,
            backend,
            claimed_by: None,
            claimed_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Queued && self.next_eligible_at <= now
    }
}

/// What a worker records for a job it holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Succeeded,
    Retry {
        attempts: u32,
        next_eligible_at: DateTime<Utc>,
        error: String,
    },
    DeadLetter {
        attempts: u32,
        error: String,
    },
}

impl Completion {
    pub fn state(&self) -> JobState {
        match self {
            Completion::Succeeded => JobState::Succeeded,
            Completion::Retry { .. } => JobState::Queued,
            Completion::DeadLetter { .. } => JobState::DeadLetter,
        }
    }
}
