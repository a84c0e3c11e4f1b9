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

//! Pinned HTTPS transport.
//!
//! The [`Dialer`] establishes TCP + TLS and reports the fingerprints of the
//! certificates the peer presented. [`PinnedTransport`] asks the
//! [`PinningGuard`] about them before handing the stream to hyper, so a denied
//! connection is dropped without a single request byte being written.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::{CONTENT_TYPE, HOST, USER_AGENT};
use hyper::Request;
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;
use url::Url;

use super::{Fingerprint, PinDecision, PinningDenied, PinningGuard};

/// Errors raised by the pinned transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("TLS handshake failed: {0}")]
    Handshake(String),

    #[error(transparent)]
    PinningDenied(#[from] PinningDenied),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("HTTP exchange failed: {0}")]
    Http(String),
}

/// Byte stream usable by the HTTP client.
pub trait Io: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Io for T {}

/// An established connection plus the peer's certificate fingerprints.
pub struct DialedConnection {
    pub stream: Box<dyn Io>,
    pub peer_fingerprints: Vec<Fingerprint>,
}

impl DialedConnection {
    pub fn new(stream: Box<dyn Io>, peer_fingerprints: Vec<Fingerprint>) -> Self {
        Self {
            stream,
            peer_fingerprints,
        }
    }

    /// Fingerprints every certificate of a DER chain.
    pub fn from_der_chain<'a, I>(stream: Box<dyn Io>, chain: I) -> Self
    where
        I: IntoIterator<Item = &'a [u8]>,
    {
        Self::new(stream, chain.into_iter().map(Fingerprint::of_der).collect())
    }
}

#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, host: &str, port: u16) -> Result<DialedConnection, TransportError>;
}

/// TCP + rustls dialer validating against the webpki root set.
#[derive(Clone)]
pub struct TlsDialer {
    connector: TlsConnector,
}

impl TlsDialer {
    pub fn with_webpki_roots() -> Result<Self, TransportError> {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let config =
            ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
                .with_safe_default_protocol_versions()
                .map_err(|e| TransportError::TlsConfig(e.to_string()))?
                .with_root_certificates(roots)
                .with_no_client_auth();
        Ok(Self::from_config(Arc::new(config)))
    }

    pub fn from_config(config: Arc<ClientConfig>) -> Self {
        Self {
            connector: TlsConnector::from(config),
        }
    }
}

#[async_trait]
impl Dialer for TlsDialer {
    async fn dial(&self, host: &str, port: u16) -> Result<DialedConnection, TransportError> {
        let tcp = TcpStream::connect((host, port))
            .await
            .map_err(|e| TransportError::Connect(format!("{}:{}: {}", host, port, e)))?;

        let server_name = ServerName::try_from(host.to_owned())
            .map_err(|e| TransportError::InvalidEndpoint(format!("{}: {}", host, e)))?;
        let tls = self
            .connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| TransportError::Handshake(e.to_string()))?;

        let fingerprints = tls
            .get_ref()
            .1
            .peer_certificates()
            .map(|chain| {
                chain
                    .iter()
                    .map(|cert| Fingerprint::of_der(cert.as_ref()))
                    .collect()
            })
            .unwrap_or_default();

        Ok(DialedConnection::new(Box::new(tls), fingerprints))
    }
}

/// Raw HTTP response from a remote endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteResponse {
    pub status: u16,
    pub body: String,
}

/// One-shot HTTPS POST client with certificate pinning.
#[derive(Clone)]
pub struct PinnedTransport {
    dialer: Arc<dyn Dialer>,
    guard: Arc<PinningGuard>,
    timeout: Duration,
}

impl PinnedTransport {
    pub fn new(dialer: Arc<dyn Dialer>, guard: Arc<PinningGuard>, timeout: Duration) -> Self {
        Self {
            dialer,
            guard,
            timeout,
        }
    }

    pub fn guard(&self) -> &Arc<PinningGuard> {
        &self.guard
    }

    /// POSTs `body` to `url`. Connect, handshake, pin check and the exchange
    /// share one deadline.
    pub async fn post(
        &self,
        url: &Url,
        content_type: &str,
        body: impl Into<Bytes>,
    ) -> Result<RemoteResponse, TransportError> {
        let body = body.into();
        tokio::time::timeout(self.timeout, self.exchange(url, content_type, body))
            .await
            .map_err(|_| TransportError::Timeout(self.timeout))?
    }

    async fn exchange(
        &self,
        url: &Url,
        content_type: &str,
        body: Bytes,
    ) -> Result<RemoteResponse, TransportError> {
        if url.scheme() != "https" {
            return Err(TransportError::InvalidEndpoint(format!(
                "{} is not an https URL",
                url
            )));
        }
        let host = url
            .host_str()
            .ok_or_else(|| TransportError::InvalidEndpoint(format!("{} has no host", url)))?;
        let port = url.port_or_known_default().unwrap_or(443);

        let connection = self.dialer.dial(host, port).await?;
        if let PinDecision::Deny(denied) = self.guard.authorize(host, &connection.peer_fingerprints)
        {
            drop(connection);
            return Err(denied.into());
        }

        let (mut sender, driver) =
            hyper::client::conn::http1::handshake(TokioIo::new(connection.stream))
                .await
                .map_err(|e| TransportError::Http(e.to_string()))?;
        tokio::spawn(async move {
            if let Err(e) = driver.await {
                debug!(error = %e, "HTTP connection closed with error");
            }
        });

        let host_header = match url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };
        let request = Request::post(&url[url::Position::BeforePath..])
            .header(HOST, host_header)
            .header(CONTENT_TYPE, content_type)
            .header(USER_AGENT, concat!("fiskal/", env!("CARGO_PKG_VERSION")))
            .body(Full::new(body))
            .map_err(|e| TransportError::Http(e.to_string()))?;

        let response = sender
            .send_request(request)
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;
        let status = response.status().as_u16();
        let bytes = response
            .into_body()
            .collect()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?
            .to_bytes();

        debug!(url = %url, status, "Received response");
        Ok(RemoteResponse {
            status,
            body: String::from_utf8_lossy(&bytes).into_owned(),
        })
    }
}
