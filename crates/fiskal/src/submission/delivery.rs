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

//! Delivery of signed documents to remote targets, and classification of
//! what came back.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::pinning::transport::{PinnedTransport, RemoteResponse, TransportError};
use crate::pinning::PinningDenied;

/// Why a delivery attempt did not succeed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// Worth retrying: network failure, timeout, overload, pending verification.
    #[error("Transient delivery failure: {0}")]
    Transient(String),

    /// The remote endpoint rejected the document.
    #[error("Delivery rejected: {0}")]
    NonRetriable(String),

    /// The endpoint presented a certificate outside its pin set.
    #[error(transparent)]
    PinningDenied(#[from] PinningDenied),

    /// The worker stopped before the endpoint answered. Does not count as
    /// an attempt.
    #[error("Delivery interrupted by shutdown")]
    Interrupted,
}

impl DeliveryError {
    pub fn is_retriable(&self) -> bool {
        matches!(self, DeliveryError::Transient(_) | DeliveryError::Interrupted)
    }
}

impl From<TransportError> for DeliveryError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::PinningDenied(denied) => DeliveryError::PinningDenied(denied),
            TransportError::InvalidEndpoint(_) | TransportError::TlsConfig(_) => {
                DeliveryError::NonRetriable(err.to_string())
            }
            TransportError::Connect(_)
            | TransportError::Handshake(_)
            | TransportError::Timeout(_)
            | TransportError::Http(_) => DeliveryError::Transient(err.to_string()),
        }
    }
}

/// Successful delivery as reported by the remote endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryReceipt {
    pub http_status: u16,
    pub remote_status: Option<String>,
    pub message: Option<String>,
}

#[derive(Deserialize)]
struct RemoteBody {
    status: Option<String>,
    message: Option<String>,
}

/// Maps a raw HTTP response onto a delivery outcome.
pub fn classify(response: &RemoteResponse) -> Result<DeliveryReceipt, DeliveryError> {
    let body: Option<RemoteBody> = serde_json::from_str(&response.body).ok();
    let (remote_status, message) = match body {
        Some(body) => (
            body.status.map(|s| s.trim().to_ascii_lowercase()),
            body.message,
        ),
        None => (None, None),
    };

    let describe = |what: &str| match &message {
        Some(message) => format!("{} (HTTP {}): {}", what, response.status, message),
        None => format!("{} (HTTP {})", what, response.status),
    };

    match response.status {
        200..=299 => match remote_status.as_deref() {
            None | Some("accepted") | Some("verified") | Some("authorized") => {
                Ok(DeliveryReceipt {
                    http_status: response.status,
                    remote_status,
                    message,
                })
            }
            Some("pending") => Err(DeliveryError::Transient(describe("verification pending"))),
            Some("rejected") | Some("invalid") => {
                Err(DeliveryError::NonRetriable(describe("document rejected")))
            }
            Some(other) => Err(DeliveryError::NonRetriable(describe(&format!(
                "unrecognized remote status '{}'",
                other
            )))),
        },
        408 | 429 | 500..=599 => Err(DeliveryError::Transient(describe("endpoint unavailable"))),
        400..=499 => Err(DeliveryError::NonRetriable(describe("document rejected"))),
        _ => Err(DeliveryError::NonRetriable(describe("unexpected response"))),
    }
}

/// Submission endpoints by target id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetRegistry {
    targets: BTreeMap<String, Url>,
}

impl TargetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_target(mut self, id: &str, url: Url) -> Self {
        self.insert(id, url);
        self
    }

    pub fn insert(&mut self, id: &str, url: Url) {
        self.targets.insert(id.to_ascii_lowercase(), url);
    }

    pub fn get(&self, id: &str) -> Option<&Url> {
        self.targets.get(&id.to_ascii_lowercase())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.targets.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

/// Sends one payload to one endpoint.
#[async_trait]
pub trait DocumentTransport: Send + Sync {
    async fn deliver(
        &self,
        target_id: &str,
        url: &Url,
        payload: &str,
    ) -> Result<DeliveryReceipt, DeliveryError>;
}

#[async_trait]
impl DocumentTransport for PinnedTransport {
    async fn deliver(
        &self,
        _target_id: &str,
        url: &Url,
        payload: &str,
    ) -> Result<DeliveryReceipt, DeliveryError> {
        let response = self
            .post(url, "application/xml", payload.to_owned())
            .await?;
        classify(&response)
    }
}
