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

//! Audit logging for SIEM integration.
//!
//! Every sign, verify, rotate and submission state transition produces one
//! structured event. Events carry `event_type`, `actor`, `resource`,
//! `outcome` and `timestamp` fields and are emitted through `tracing`; where
//! they end up is the subscriber's business.

use chrono::Utc;

/// Event type names, dot-separated by subject.
pub mod events {
    /// Credential loaded from the certificate store.
    pub const CREDENTIAL_LOADED: &str = "credential.loaded";
    /// Credential load failure.
    pub const CREDENTIAL_LOAD_FAILED: &str = "credential.load_failed";

    /// Document signed.
    pub const DOCUMENT_SIGNED: &str = "document.signed";
    /// Document signing failure.
    pub const DOCUMENT_SIGN_FAILED: &str = "document.sign_failed";

    /// Signature verified as valid.
    pub const SIGNATURE_VERIFIED: &str = "signature.verified";
    /// Signature rejected during verification.
    pub const SIGNATURE_REJECTED: &str = "signature.rejected";

    /// Key rotation started.
    pub const KEY_ROTATION_STARTED: &str = "key.rotation.started";
    /// Interrupted key rotation resumed.
    pub const KEY_ROTATION_RESUMED: &str = "key.rotation.resumed";
    /// Key rotation completed.
    pub const KEY_ROTATION_COMPLETED: &str = "key.rotation.completed";
    /// Key rotation failed.
    pub const KEY_ROTATION_FAILED: &str = "key.rotation.failed";
    /// Key rotation check ran but nothing was rotated.
    pub const KEY_ROTATION_SKIPPED: &str = "key.rotation.skipped";

    /// Connection denied by a strict pin.
    pub const PINNING_DENIED: &str = "pinning.denied";
    /// Connection allowed without a configured pin, or despite a mismatch.
    pub const PINNING_BYPASSED: &str = "pinning.bypassed";

    /// Submission job state transition.
    pub const SUBMISSION_STATE_CHANGED: &str = "submission.state_changed";
    /// Submission job moved to the dead-letter state.
    pub const SUBMISSION_DEAD_LETTERED: &str = "submission.dead_lettered";
    /// Job accepted into the non-durable in-process queue.
    pub const QUEUE_FALLBACK: &str = "queue.fallback";
    /// In-process job moved into the durable queue.
    pub const QUEUE_PROMOTED: &str = "queue.promoted";
}

fn now() -> String {
    Utc::now().to_rfc3339()
}

/// Log a successful credential load.
pub fn log_credential_loaded(source: &str, subject: &str, key_version: u32) {
    tracing::info!(
        event_type = events::CREDENTIAL_LOADED,
        actor = "certificate_store",
        resource = %source,
        outcome = "success",
        timestamp = %now(),
        subject = %subject,
        key_version = key_version,
        "Signing credential loaded"
    );
}

/// Log a credential load failure.
pub fn log_credential_load_failed(source: &str, error: &str) {
    tracing::error!(
        event_type = events::CREDENTIAL_LOAD_FAILED,
        actor = "certificate_store",
        resource = %source,
        outcome = "failure",
        timestamp = %now(),
        error = %error,
        "Failed to load signing credential"
    );
}

/// Log a document signing event.
pub fn log_document_signed(signer: &str, document_id: &str, digest: &str) {
    tracing::info!(
        event_type = events::DOCUMENT_SIGNED,
        actor = %signer,
        resource = %document_id,
        outcome = "success",
        timestamp = %now(),
        digest = %digest,
        "Document signed"
    );
}

/// Log a document signing failure.
pub fn log_document_sign_failed(signer: &str, document_id: &str, error: &str) {
    tracing::error!(
        event_type = events::DOCUMENT_SIGN_FAILED,
        actor = %signer,
        resource = %document_id,
        outcome = "failure",
        timestamp = %now(),
        error = %error,
        "Document signing failed"
    );
}

/// Log a successful verification.
pub fn log_signature_verified(document_id: &str, signer: &str) {
    tracing::info!(
        event_type = events::SIGNATURE_VERIFIED,
        actor = "verifier",
        resource = %document_id,
        outcome = "valid",
        timestamp = %now(),
        signer = %signer,
        "Signature verified"
    );
}

/// Log a rejected verification.
pub fn log_signature_rejected(document_id: &str, reason: &str) {
    tracing::warn!(
        event_type = events::SIGNATURE_REJECTED,
        actor = "verifier",
        resource = %document_id,
        outcome = "invalid",
        timestamp = %now(),
        failure_reason = %reason,
        "Signature verification failed"
    );
}

/// Log the start of a key rotation.
pub fn log_rotation_started(rotation_id: &str, previous_key_hash: &str, new_key_hash: &str) {
    tracing::warn!(
        event_type = events::KEY_ROTATION_STARTED,
        actor = "key_rotation_service",
        resource = %rotation_id,
        outcome = "in_progress",
        timestamp = %now(),
        previous_key_hash = %previous_key_hash,
        new_key_hash = %new_key_hash,
        "Key rotation started"
    );
}

/// Log the resumption of an interrupted rotation.
pub fn log_rotation_resumed(rotation_id: &str, records_processed: u32, records_total: u32) {
    tracing::warn!(
        event_type = events::KEY_ROTATION_RESUMED,
        actor = "key_rotation_service",
        resource = %rotation_id,
        outcome = "in_progress",
        timestamp = %now(),
        records_processed = records_processed,
        records_total = records_total,
        "Key rotation resumed"
    );
}

/// Log a completed rotation.
pub fn log_rotation_completed(rotation_id: &str, new_version: u32, records_processed: u32) {
    tracing::info!(
        event_type = events::KEY_ROTATION_COMPLETED,
        actor = "key_rotation_service",
        resource = %rotation_id,
        outcome = "completed",
        timestamp = %now(),
        new_version = new_version,
        records_processed = records_processed,
        "Key rotation completed"
    );
}

/// Log a failed rotation. The previous key stays retained.
pub fn log_rotation_failed(rotation_id: &str, error: &str) {
    tracing::warn!(
        event_type = events::KEY_ROTATION_FAILED,
        actor = "key_rotation_service",
        resource = %rotation_id,
        outcome = "failed",
        timestamp = %now(),
        error = %error,
        "Key rotation failed; previous key retained, manual follow-up required"
    );
}

/// Log a rotation check that did not rotate.
pub fn log_rotation_skipped(reason: &str) {
    tracing::debug!(
        event_type = events::KEY_ROTATION_SKIPPED,
        actor = "key_rotation_service",
        resource = "data_key",
        outcome = "skipped",
        timestamp = %now(),
        reason = %reason,
        "Key rotation not performed"
    );
}

/// Log a connection denied by pinning policy.
pub fn log_pinning_denied(host: &str, presented: &[String]) {
    tracing::error!(
        event_type = events::PINNING_DENIED,
        actor = "pinning_guard",
        resource = %host,
        outcome = "denied",
        timestamp = %now(),
        presented = %presented.join(","),
        "Certificate pin mismatch; connection aborted before sending payload"
    );
}

/// Log a connection allowed without pin enforcement.
pub fn log_pinning_bypassed(host: &str, reason: &str) {
    tracing::warn!(
        event_type = events::PINNING_BYPASSED,
        actor = "pinning_guard",
        resource = %host,
        outcome = "allowed",
        timestamp = %now(),
        reason = %reason,
        "Connection allowed without pin match"
    );
}

/// Log a submission job state transition.
pub fn log_submission_transition(
    worker: &str,
    job_id: &str,
    document_id: &str,
    from: &str,
    to: &str,
    attempt: u32,
) {
    tracing::info!(
        event_type = events::SUBMISSION_STATE_CHANGED,
        actor = %worker,
        resource = %job_id,
        outcome = %to,
        timestamp = %now(),
        document_id = %document_id,
        from_state = %from,
        attempt = attempt,
        "Submission job state changed"
    );
}

/// Log a dead-lettered submission. This is the operator channel for
/// submissions that need manual attention.
pub fn log_submission_dead_lettered(
    worker: &str,
    job_id: &str,
    document_id: &str,
    target: &str,
    reason: &str,
) {
    tracing::error!(
        event_type = events::SUBMISSION_DEAD_LETTERED,
        actor = %worker,
        resource = %job_id,
        outcome = "dead_letter",
        timestamp = %now(),
        document_id = %document_id,
        target = %target,
        failure_reason = %reason,
        "Submission moved to dead letter"
    );
}

/// Log a job accepted into the non-durable fallback queue.
pub fn log_queue_fallback(job_id: &str, document_id: &str, error: &str) {
    tracing::warn!(
        event_type = events::QUEUE_FALLBACK,
        actor = "submission_queue",
        resource = %job_id,
        outcome = "non_durable",
        timestamp = %now(),
        document_id = %document_id,
        error = %error,
        "Durable queue unavailable; job held in process and will be lost on restart"
    );
}

/// Log an in-process job handed over to the durable queue.
pub fn log_queue_promoted(job_id: &str, document_id: &str) {
    tracing::info!(
        event_type = events::QUEUE_PROMOTED,
        actor = "submission_queue",
        resource = %job_id,
        outcome = "durable",
        timestamp = %now(),
        document_id = %document_id,
        "In-process job promoted to the durable queue"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tracing_subscriber::fmt::MakeWriter;

    #[derive(Clone)]
    struct StringWriter(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for StringWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for StringWriter {
        type Writer = StringWriter;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    fn with_captured_logs<F>(f: F) -> String
    where
        F: FnOnce(),
    {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let writer = StringWriter(buffer.clone());

        let subscriber = tracing_subscriber::fmt()
            .with_writer(writer)
            .with_max_level(tracing::Level::TRACE)
            .with_ansi(false)
            .finish();

        tracing::subscriber::with_default(subscriber, f);

        let result = String::from_utf8(buffer.lock().unwrap().clone()).unwrap();
        result
    }

    #[test]
    fn test_log_document_signed() {
        let output = with_captured_logs(|| {
            log_document_signed("CN=Issuer Ltd", "invoice-42", "digest-abc");
        });

        assert!(output.contains(events::DOCUMENT_SIGNED));
        assert!(output.contains("invoice-42"));
        assert!(output.contains("digest-abc"));
        assert!(output.contains("timestamp"));
    }

    #[test]
    fn test_log_pinning_denied() {
        let output = with_captured_logs(|| {
            log_pinning_denied("tax.example", &["44:55:66".to_string()]);
        });

        assert!(output.contains(events::PINNING_DENIED));
        assert!(output.contains("tax.example"));
        assert!(output.contains("44:55:66"));
    }

    #[test]
    fn test_log_submission_transition() {
        let output = with_captured_logs(|| {
            log_submission_transition("worker-1", "job-1", "doc-1", "queued", "in_flight", 0);
        });

        assert!(output.contains(events::SUBMISSION_STATE_CHANGED));
        assert!(output.contains("from_state"));
        assert!(output.contains("in_flight"));
    }

    #[test]
    fn test_log_queue_promoted() {
        let output = with_captured_logs(|| {
            log_queue_promoted("job-7", "doc-7");
        });

        assert!(output.contains(events::QUEUE_PROMOTED));
        assert!(output.contains("job-7"));
        assert!(output.contains("durable"));
    }

    #[test]
    fn test_rotation_failure_mentions_follow_up() {
        let output = with_captured_logs(|| {
            log_rotation_failed("rot-1", "disk full");
        });

        assert!(output.contains(events::KEY_ROTATION_FAILED));
        assert!(output.contains("manual follow-up"));
        assert!(output.contains("disk full"));
    }

    #[test]
    fn test_event_type_constants() {
        assert!(events::DOCUMENT_SIGNED.starts_with("document."));
        assert!(events::KEY_ROTATION_STARTED.starts_with("key."));
        assert!(events::SUBMISSION_STATE_CHANGED.starts_with("submission."));
    }
}
