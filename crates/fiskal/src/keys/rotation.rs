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

//! Data key rotation.
//!
//! [`KeyRotationService`] owns the data key lifecycle. It rotates the key
//! once per interval, re-encrypts every secret still sealed under an older
//! key, and then closes the read window of the superseded key after the
//! configured overlap.
//!
//! Two locks guard a rotation: a process-local mutex (tried, never waited
//! on) and the rotation log, which refuses to open a second record while one
//! is pending or in progress. A record that stops making progress for longer
//! than `stale_after` can be taken over; a failed record is picked up by a
//! new record that continues its counters.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::keyring::{DataKey, KeyRing, KeyRingError, KeyRingHandle};
use super::store::{ring_from_stored, KeyRotationRecord, KeyStore, RotationStatus, StoreError};
use crate::audit;
use crate::shutdown::ShutdownSignal;

/// Re-encryption passes before a rotation with leftover secrets fails.
const MIGRATION_PASSES: usize = 3;

/// A rotation that did not complete. The superseded key stays retained.
#[derive(Debug, Error)]
#[error("Key rotation failed: {message}")]
pub struct RotationFailure {
    pub rotation_id: Option<Uuid>,
    pub message: String,
}

impl RotationFailure {
    fn new(message: impl Into<String>) -> Self {
        Self {
            rotation_id: None,
            message: message.into(),
        }
    }
}

impl From<StoreError> for RotationFailure {
    fn from(err: StoreError) -> Self {
        Self::new(err.to_string())
    }
}

impl From<KeyRingError> for RotationFailure {
    fn from(err: KeyRingError) -> Self {
        Self::new(err.to_string())
    }
}

/// Timing parameters for rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationPolicy {
    /// Time between rotations.
    pub interval: Duration,
    /// How long a superseded key stays readable after its rotation completes.
    pub overlap: Duration,
    /// An open record with no progress for this long may be taken over.
    pub stale_after: Duration,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::days(90),
            overlap: Duration::hours(24),
            stale_after: Duration::hours(1),
        }
    }
}

/// Why a check did or did not rotate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationReason {
    /// The interval had elapsed.
    Due,
    /// An operator asked for it.
    Forced,
    /// Took over an in-progress record that had gone stale.
    ResumedStale,
    /// Continued the work of a failed record.
    ResumedFailed,
    NotDue,
    /// Another rotation holds the lock.
    AlreadyInProgress,
}

impl RotationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RotationReason::Due => "due",
            RotationReason::Forced => "forced",
            RotationReason::ResumedStale => "resumed_stale",
            RotationReason::ResumedFailed => "resumed_failed",
            RotationReason::NotDue => "not_due",
            RotationReason::AlreadyInProgress => "already_in_progress",
        }
    }
}

/// Result of a rotation check.
#[derive(Debug, Clone)]
pub struct RotationOutcome {
    pub rotated: bool,
    pub reason: RotationReason,
    /// Current key version after the check.
    pub current_version: u32,
    /// When the next rotation falls due, if known.
    pub next_due: Option<DateTime<Utc>>,
}

/// Rotates the data key and migrates dependent secrets.
pub struct KeyRotationService {
    store: Arc<dyn KeyStore>,
    ring: KeyRingHandle,
    policy: RotationPolicy,
    local: Mutex<()>,
}

impl KeyRotationService {
    /// Loads keys from `store`, creating version 1 if there are none.
    pub async fn initialize(
        store: Arc<dyn KeyStore>,
        policy: RotationPolicy,
    ) -> Result<Self, RotationFailure> {
        let keys = store.load_keys().await?;
        let ring = if keys.is_empty() {
            let key = DataKey::generate(1);
            store.insert_key(&key).await?;
            info!(key_hash = %key.hash(), "Initialized data key version 1");
            KeyRing::new(key)
        } else {
            ring_from_stored(keys)?
        };

        debug!(
            current_version = ring.current().version(),
            retained = ring.retained().len(),
            "Key ring loaded"
        );

        Ok(Self {
            store,
            ring: KeyRingHandle::new(ring),
            policy,
            local: Mutex::new(()),
        })
    }

    /// Handle to the published key ring.
    pub fn key_ring(&self) -> KeyRingHandle {
        self.ring.clone()
    }

    pub fn policy(&self) -> &RotationPolicy {
        &self.policy
    }

    /// Re-reads keys from the store and publishes the result.
    pub async fn reload(&self) -> Result<(), RotationFailure> {
        let ring = ring_from_stored(self.store.load_keys().await?)?;
        self.ring.publish(ring);
        Ok(())
    }

    /// Rotates if the interval has elapsed, or resumes an interrupted
    /// rotation.
    pub async fn check_and_rotate_if_needed(&self) -> Result<RotationOutcome, RotationFailure> {
        self.run(false).await
    }

    /// Rotates regardless of the age of the current key.
    pub async fn rotate_now(&self) -> Result<RotationOutcome, RotationFailure> {
        self.run(true).await
    }

    /// Deletes retained keys whose overlap has ended and that no secret
    /// still references. Returns the deleted versions.
    pub async fn prune_expired_keys(&self) -> Result<Vec<u32>, RotationFailure> {
        let now = Utc::now();
        let current = self.ring.current_version();
        let mut pruned = Vec::new();

        for stored in self.store.load_keys().await? {
            let version = stored.key.version();
            let expired = matches!(stored.overlap_until, Some(until) if until <= now);
            if version == current || !expired {
                continue;
            }

            let referenced = self.store.count_on_version(version).await?;
            if referenced > 0 {
                warn!(
                    key_version = version,
                    referenced, "Expired key still referenced by secrets; keeping it"
                );
                continue;
            }

            self.store.delete_key(version).await?;
            info!(key_version = version, "Pruned expired data key");
            pruned.push(version);
        }

        if !pruned.is_empty() {
            self.reload().await?;
        }
        Ok(pruned)
    }

    /// Checks for a due rotation every `every` until `shutdown` fires.
    ///
    /// Failures are logged and retried on the next tick.
    pub async fn run_periodic(self: Arc<Self>, every: StdDuration, shutdown: ShutdownSignal) {
        info!(interval = ?every, "Key rotation checker started");
        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = tokio::time::sleep(every) => {}
            }

            match self.check_and_rotate_if_needed().await {
                Ok(outcome) if outcome.rotated => info!(
                    reason = outcome.reason.as_str(),
                    current_version = outcome.current_version,
                    "Scheduled key rotation finished"
                ),
                Ok(outcome) => debug!(reason = outcome.reason.as_str(), "No rotation"),
                Err(e) => warn!(error = %e, "Scheduled key rotation failed"),
            }
        }
        info!("Key rotation checker stopped");
    }

    async fn run(&self, force: bool) -> Result<RotationOutcome, RotationFailure> {
        let _guard = match self.local.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                audit::log_rotation_skipped("rotation already running in this process");
                return Ok(self.skipped(RotationReason::AlreadyInProgress, None));
            }
        };

        self.reload().await?;
        let now = Utc::now();

        if let Some(open) = self.store.open_rotation().await? {
            if now - open.updated_at < self.policy.stale_after {
                audit::log_rotation_skipped("another rotation is in progress");
                return Ok(self.skipped(RotationReason::AlreadyInProgress, None));
            }
            if !self.store.claim_stale(open.id, open.updated_at, now).await? {
                audit::log_rotation_skipped("stale rotation claimed by another process");
                return Ok(self.skipped(RotationReason::AlreadyInProgress, None));
            }

            warn!(
                rotation_id = %open.id,
                last_update = %open.updated_at,
                "Taking over stale key rotation"
            );
            let mut record = open;
            record.updated_at = now;
            return self
                .execute(record, None, RotationReason::ResumedStale)
                .await;
        }

        if let Some(latest) = self.store.latest().await? {
            if latest.status == RotationStatus::Failed {
                let record = KeyRotationRecord {
                    id: Uuid::new_v4(),
                    status: RotationStatus::Pending,
                    last_error: None,
                    resumed_from: Some(latest.id),
                    started_at: now,
                    updated_at: now,
                    completed_at: None,
                    ..latest
                };
                if !self.store.begin_rotation(&record).await? {
                    return Ok(self.skipped(RotationReason::AlreadyInProgress, None));
                }
                return self
                    .execute(record, None, RotationReason::ResumedFailed)
                    .await;
            }
        }

        if !force {
            let next_due = self.next_due().await?;
            if now < next_due {
                return Ok(self.skipped(RotationReason::NotDue, Some(next_due)));
            }
        }

        let snapshot = self.ring.snapshot();
        let next = DataKey::generate(snapshot.max_version() + 1);
        let record = KeyRotationRecord::pending(snapshot.current(), &next, now);
        if !self.store.begin_rotation(&record).await? {
            return Ok(self.skipped(RotationReason::AlreadyInProgress, None));
        }

        let reason = if force {
            RotationReason::Forced
        } else {
            RotationReason::Due
        };
        self.execute(record, Some(next), reason).await
    }

    async fn next_due(&self) -> Result<DateTime<Utc>, RotationFailure> {
        let baseline = match self.store.latest_completed().await? {
            Some(record) => record.completed_at.unwrap_or(record.updated_at),
            None => self.ring.snapshot().current().created_at(),
        };
        Ok(baseline + self.policy.interval)
    }

    fn skipped(&self, reason: RotationReason, next_due: Option<DateTime<Utc>>) -> RotationOutcome {
        RotationOutcome {
            rotated: false,
            reason,
            current_version: self.ring.current_version(),
            next_due,
        }
    }

    async fn execute(
        &self,
        mut record: KeyRotationRecord,
        fresh_key: Option<DataKey>,
        reason: RotationReason,
    ) -> Result<RotationOutcome, RotationFailure> {
        match self.drive(&mut record, fresh_key, reason).await {
            Ok(()) => Ok(RotationOutcome {
                rotated: true,
                reason,
                current_version: self.ring.current_version(),
                next_due: record.completed_at.map(|t| t + self.policy.interval),
            }),
            Err(err) => {
                let message = err.message;
                record.status = RotationStatus::Failed;
                record.last_error = Some(message.clone());
                record.updated_at = Utc::now();
                if let Err(e) = self.store.update_rotation(&record).await {
                    warn!(rotation_id = %record.id, error = %e, "Could not record rotation failure");
                }

                audit::log_rotation_failed(&record.id.to_string(), &message);
                warn!(
                    rotation_id = %record.id,
                    processed = record.records_processed,
                    total = record.records_total,
                    "Key rotation failed; previous key retained, manual follow-up required"
                );

                Err(RotationFailure {
                    rotation_id: Some(record.id),
                    message,
                })
            }
        }
    }

    async fn drive(
        &self,
        record: &mut KeyRotationRecord,
        fresh_key: Option<DataKey>,
        reason: RotationReason,
    ) -> Result<(), RotationFailure> {
        let rotation_id = record.id.to_string();

        let new_key = match fresh_key {
            Some(key) => {
                self.store.insert_key(&key).await?;
                key
            }
            None => self.resolve_resumed_key(record).await?,
        };

        let previous = self
            .store
            .get_key(record.previous_version)
            .await?
            .ok_or_else(|| {
                RotationFailure::new(format!(
                    "previous key version {} is missing",
                    record.previous_version
                ))
            })?;
        if previous.retired_at.is_none() {
            self.store
                .retire_key(record.previous_version, Utc::now(), None)
                .await?;
        }

        // New key current, previous key draining.
        self.reload().await?;
        let ring = self.ring.snapshot();
        if ring.current().version() != new_key.version() {
            return Err(RotationFailure::new(format!(
                "key version {} is newer than rotation target {}",
                ring.current().version(),
                new_key.version()
            )));
        }

        let mut pending = self.store.list_not_on_version(new_key.version()).await?;
        record.status = RotationStatus::InProgress;
        record.records_total = record.records_processed + pending.len() as u32;
        record.updated_at = Utc::now();
        self.store.update_rotation(record).await?;

        match reason {
            RotationReason::ResumedStale | RotationReason::ResumedFailed => {
                audit::log_rotation_resumed(
                    &rotation_id,
                    record.records_processed,
                    record.records_total,
                )
            }
            _ => audit::log_rotation_started(
                &rotation_id,
                &record.previous_key_hash,
                &record.new_key_hash,
            ),
        }

        // Secrets rewritten under the old key while a pass runs are picked
        // up by the next pass.
        for _ in 0..MIGRATION_PASSES {
            for (name, secret) in pending {
                let plaintext = ring.decrypt_for_migration(&secret)?;
                let migrated = ring.encrypt(&plaintext)?;
                let replaced = self.store.replace_secret(&name, &secret, &migrated).await?;
                if !replaced {
                    debug!(secret = %name, "Secret changed during rotation; retrying");
                    continue;
                }

                record.records_processed += 1;
                record.updated_at = Utc::now();
                self.store.update_rotation(record).await?;
            }

            pending = self.store.list_not_on_version(new_key.version()).await?;
            if pending.is_empty() {
                break;
            }
            record.records_total = record.records_processed + pending.len() as u32;
        }
        if !pending.is_empty() {
            return Err(RotationFailure::new(format!(
                "{} secrets are still sealed under older keys",
                pending.len()
            )));
        }

        let completed_at = Utc::now();
        record.status = RotationStatus::Completed;
        record.completed_at = Some(completed_at);
        record.updated_at = completed_at;
        self.store.update_rotation(record).await?;

        let overlap_until = completed_at + self.policy.overlap;
        for stored in self.store.load_keys().await? {
            if stored.key.version() == new_key.version() || stored.overlap_until.is_some() {
                continue;
            }
            let retired_at = stored.retired_at.unwrap_or(completed_at);
            self.store
                .retire_key(stored.key.version(), retired_at, Some(overlap_until))
                .await?;
        }
        self.reload().await?;

        audit::log_rotation_completed(&rotation_id, new_key.version(), record.records_processed);
        info!(
            rotation_id = %record.id,
            new_version = new_key.version(),
            overlap_until = %overlap_until,
            "Key rotation completed"
        );
        Ok(())
    }

    /// Finds the new key of a resumed rotation, or generates a replacement
    /// when it never made it to the store.
    async fn resolve_resumed_key(
        &self,
        record: &mut KeyRotationRecord,
    ) -> Result<DataKey, RotationFailure> {
        if let Some(stored) = self.store.get_key(record.new_version).await? {
            if stored.key.hash() == record.new_key_hash {
                return Ok(stored.key);
            }
        }

        let highest = self
            .store
            .load_keys()
            .await?
            .iter()
            .map(|k| k.key.version())
            .max()
            .unwrap_or(record.previous_version);
        let key = DataKey::generate(highest + 1);
        self.store.insert_key(&key).await?;

        warn!(
            rotation_id = %record.id,
            new_version = key.version(),
            "Rotation target key was missing; generated a replacement"
        );
        record.new_version = key.version();
        record.new_key_hash = key.hash().to_string();
        Ok(key)
    }
}
