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

//! Audit events as seen by a subscriber.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use fiskal::submission::RetryPolicy;
use fiskal::{
    Fingerprint, HostPin, PinningGuard, PinningPolicy, SubmissionQueue, TargetRegistry,
    XadesSigner,
};
use parking_lot::Mutex;
use tracing::subscriber::DefaultGuard;
use url::Url;

use crate::fixtures::{self, KeyedStore, PASSWORD};

#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl Captured {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl io::Write for Captured {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn capture() -> (Captured, DefaultGuard) {
    let captured = Captured::default();
    let writer = captured.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish();
    (captured, tracing::subscriber::set_default(subscriber))
}

#[test]
fn test_pin_denial_is_audited() {
    let (captured, _guard) = capture();
    let guard = PinningGuard::new(PinningPolicy::new().with_host(
        "tax.example",
        HostPin::strict(["11:22:33".parse::<Fingerprint>().unwrap()]),
    ));

    let presented = ["44:55:66".parse::<Fingerprint>().unwrap()];
    assert!(!guard.authorize("tax.example", &presented).is_allowed());

    let log = captured.text();
    assert!(log.contains("pinning.denied"));
    assert!(log.contains("tax.example"));
    assert!(log.contains("44:55:66"));
}

#[tokio::test]
async fn test_queue_transitions_are_audited() {
    let (captured, _guard) = capture();
    let targets =
        TargetRegistry::new().with_target("tax", Url::parse("https://tax.example/submit").unwrap());
    let queue = SubmissionQueue::in_process(targets, RetryPolicy::new(5, Duration::ZERO, Duration::ZERO));

    let job_id = queue
        .enqueue_payload("2026-0500", "tax", "<Invoice/>".into())
        .await
        .unwrap();
    queue.claim("worker-1").await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(queue.recover_stale(Duration::from_millis(5)).await.unwrap(), 1);

    let log = captured.text();
    let job_id = job_id.to_string();
    let transitions: Vec<&str> = log
        .lines()
        .filter(|line| line.contains("submission.state_changed") && line.contains(&job_id))
        .collect();
    assert_eq!(transitions.len(), 3);
    assert!(transitions[0].contains("from_state=new"));
    assert!(transitions[0].contains("outcome=queued"));
    assert!(transitions[1].contains("from_state=queued"));
    assert!(transitions[1].contains("outcome=in_flight"));
    assert!(transitions[1].contains("worker-1"));
    assert!(transitions[2].contains("from_state=in_flight"));
    assert!(transitions[2].contains("outcome=queued"));
}

#[tokio::test]
async fn test_signing_trail_never_contains_password() {
    let (captured, _guard) = capture();
    let dir = tempfile::tempdir().unwrap();
    let bundle = fixtures::write_bundle(dir.path(), "audited-signer", PASSWORD);
    let keys = KeyedStore::new().await;
    let credential = keys.load(&bundle, "audited-signer", PASSWORD).await;

    let signer = XadesSigner::new();
    let signed = signer
        .sign_xml("2026-0400", &fixtures::invoice("2026-0400", 300), &credential)
        .unwrap();
    assert!(signer.verify_signature(&signed).is_valid());

    let log = captured.text();
    assert!(log.contains("credential.loaded"));
    assert!(log.contains("document.signed"));
    assert!(log.contains("signature.verified"));
    assert!(log.contains("2026-0400"));
    assert!(!log.contains(PASSWORD));
}
