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

//! Certificate pinning on the delivery path.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fiskal::pinning::transport::{DialedConnection, Dialer, TransportError};
use fiskal::submission::{RetryPolicy, WorkerPoolConfig};
use fiskal::{
    Fingerprint, HostPin, JobState, PinnedTransport, PinningGuard, PinningPolicy,
    ShutdownSignal, SubmissionQueue, SubmissionWorker, TargetRegistry,
};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinHandle;
use url::Url;

/// Dialer whose peer presents fixed fingerprints. The far end records every
/// byte it receives and answers with `response` once a request arrives.
struct FakeServerDialer {
    fingerprints: Vec<Fingerprint>,
    response: &'static str,
    servers: Mutex<Vec<JoinHandle<Vec<u8>>>>,
}

impl FakeServerDialer {
    fn new(fingerprints: &[&str], response: &'static str) -> Self {
        Self {
            fingerprints: fingerprints.iter().map(|f| f.parse().unwrap()).collect(),
            response,
            servers: Mutex::new(Vec::new()),
        }
    }

    /// Bytes received across every connection.
    async fn received(&self) -> Vec<u8> {
        let handles: Vec<_> = self.servers.lock().drain(..).collect();
        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        all
    }
}

#[async_trait]
impl Dialer for FakeServerDialer {
    async fn dial(&self, _host: &str, _port: u16) -> Result<DialedConnection, TransportError> {
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        let response = self.response;
        let handle = tokio::spawn(async move {
            let mut seen = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                match server.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        seen.extend_from_slice(&buf[..n]);
                        if request_complete(&seen) {
                            let _ = server.write_all(response.as_bytes()).await;
                            let _ = server.shutdown().await;
                            break;
                        }
                    }
                }
            }
            seen
        });
        self.servers.lock().push(handle);
        Ok(DialedConnection::new(Box::new(client), self.fingerprints.clone()))
    }
}

const ACCEPTED: &str = "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: 21\r\nconnection: close\r\n\r\n{\"status\":\"accepted\"}";

/// Headers plus as many body bytes as `content-length` announces.
fn request_complete(data: &[u8]) -> bool {
    let Some(end) = data.windows(4).position(|w| w == b"\r\n\r\n") else {
        return false;
    };
    let headers = String::from_utf8_lossy(&data[..end]).to_ascii_lowercase();
    let length = headers
        .lines()
        .find_map(|line| line.strip_prefix("content-length:"))
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(0);
    data.len() >= end + 4 + length
}

fn strict_guard() -> Arc<PinningGuard> {
    let policy = PinningPolicy::new().with_host(
        "tax.example",
        HostPin::strict(["11:22:33".parse::<Fingerprint>().unwrap()]),
    );
    Arc::new(PinningGuard::new(policy))
}

fn queue() -> Arc<SubmissionQueue> {
    let targets = TargetRegistry::new()
        .with_target("tax", Url::parse("https://tax.example/submit").unwrap());
    Arc::new(SubmissionQueue::in_process(
        targets,
        RetryPolicy::new(5, Duration::ZERO, Duration::ZERO),
    ))
}

#[tokio::test]
async fn test_pin_mismatch_dead_letters_without_sending() {
    let dialer = Arc::new(FakeServerDialer::new(&["44:55:66"], ACCEPTED));
    let transport = PinnedTransport::new(dialer.clone(), strict_guard(), Duration::from_secs(5));

    let queue = queue();
    let job_id = queue
        .enqueue_payload("2026-0300", "tax", "<Invoice>secret</Invoice>".into())
        .await
        .unwrap();

    let worker = SubmissionWorker::new(queue.clone(), Arc::new(transport), WorkerPoolConfig::default());
    let state = worker
        .process_next("worker-0", &ShutdownSignal::new())
        .await
        .unwrap();
    assert_eq!(state, Some(JobState::DeadLetter));

    let job = queue.get(job_id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::DeadLetter);
    assert_eq!(job.attempts, 1);
    assert!(job.last_error.unwrap().contains("tax.example"));

    assert!(dialer.received().await.is_empty());
    assert_eq!(queue.size().await.unwrap(), 0);
}

#[tokio::test]
async fn test_matching_pin_delivers() {
    let dialer = Arc::new(FakeServerDialer::new(&["11:22:33"], ACCEPTED));
    let transport = PinnedTransport::new(dialer.clone(), strict_guard(), Duration::from_secs(5));

    let queue = queue();
    let job_id = queue
        .enqueue_payload("2026-0301", "tax", "<Invoice>ok</Invoice>".into())
        .await
        .unwrap();

    let worker = SubmissionWorker::new(queue.clone(), Arc::new(transport), WorkerPoolConfig::default());
    let state = worker
        .process_next("worker-0", &ShutdownSignal::new())
        .await
        .unwrap();
    assert_eq!(state, Some(JobState::Succeeded));
    assert_eq!(
        queue.get(job_id).await.unwrap().unwrap().state,
        JobState::Succeeded
    );

    let received = String::from_utf8(dialer.received().await).unwrap();
    assert!(received.starts_with("POST /submit HTTP/1.1\r\n"));
    assert!(received.to_lowercase().contains("host: tax.example"));
}

#[tokio::test]
async fn test_pins_added_at_runtime_apply_to_next_connection() {
    let guard = Arc::new(PinningGuard::new(PinningPolicy::new()));
    let dialer = Arc::new(FakeServerDialer::new(&["44:55:66"], ACCEPTED));
    let transport = PinnedTransport::new(dialer.clone(), guard.clone(), Duration::from_secs(5));
    let url = Url::parse("https://tax.example/submit").unwrap();

    let response = transport.post(&url, "application/xml", "<a/>").await.unwrap();
    assert_eq!(response.status, 200);
    assert!(!dialer.received().await.is_empty());

    let added = guard
        .extend_from_pairs([
            ("FISKAL_PIN_TAX_HOST", "tax.example"),
            ("FISKAL_PIN_TAX_FINGERPRINTS", "11:22:33"),
        ])
        .unwrap();
    assert_eq!(added, vec!["tax.example".to_string()]);

    let result = transport.post(&url, "application/xml", "<a/>").await;
    assert!(matches!(result, Err(TransportError::PinningDenied(_))));
    assert!(dialer.received().await.is_empty());
}
