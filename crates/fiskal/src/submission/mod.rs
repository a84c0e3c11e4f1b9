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

//! Asynchronous, retrying submission of signed documents.
//!
//! ```text
//! queued -> in_flight -> succeeded
//!                     -> failed -> queued (retry, backoff)
//!                               -> dead_letter
//! ```

pub mod backend;
pub mod delivery;
pub mod durable;
pub mod job;
pub mod queue;
pub mod retry;
pub mod worker;

pub use backend::{BackendError, InProcessBackend, JobBackend, StateCounts};
pub use delivery::{classify, DeliveryError, DeliveryReceipt, DocumentTransport, TargetRegistry};
pub use durable::DurableBackend;
pub use job::{BackendKind, Completion, JobId, JobState, SubmissionJob};
pub use queue::{QueueError, QueueStatus, SubmissionQueue};
pub use retry::{RetryDecision, RetryPolicy};
pub use worker::{SubmissionWorker, WorkerPoolConfig, WorkerPoolHandle};
