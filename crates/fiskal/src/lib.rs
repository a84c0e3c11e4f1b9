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

//! # fiskal
//!
//! Signing and delivery core for fiscal documents:
//!
//! - [`credentials`]: signing credentials from encrypted PKCS#12 bundles.
//! - [`keys`]: the data key ring, encrypted secrets and periodic key rotation.
//! - [`xades`]: XAdES-BES enveloped signatures over canonical XML.
//! - [`pinning`]: per-host certificate pinning and the pinned HTTPS transport.
//! - [`submission`]: a durable, retrying submission queue and its workers.
//!
//! ```rust,ignore
//! let credential = store.load("company.p12", &token)?;
//! let signed = XadesSigner::new().sign_xml("INV-2026-0001", &xml, &credential)?;
//! let job_id = queue.enqueue(&signed, "tax_authority").await?;
//! ```
//!
//! Every security-relevant action emits a structured audit event; see
//! [`audit`].

pub mod audit;
pub mod config;
pub mod credentials;
pub mod crypto;
pub mod database;
pub mod error;
pub mod keys;
pub mod pinning;
pub mod shutdown;
pub mod submission;
pub mod xades;

pub use config::{ConfigError, FiskalConfig, FiskalConfigBuilder, MasterKey};
pub use credentials::{CertificateStore, CredentialLoadError, SigningCredential};
pub use database::{Database, DatabaseError};
pub use error::{Error, Result};
pub use keys::{
    DbKeyStore, EncryptedSecret, KeyRing, KeyRingHandle, KeyRotationService, KeyStore,
    MemoryKeyStore, RotationFailure, RotationOutcome, RotationPolicy, RotationReason,
};
pub use pinning::transport::{PinnedTransport, TlsDialer};
pub use pinning::{Fingerprint, HostPin, PinDecision, PinningDenied, PinningGuard, PinningPolicy};
pub use shutdown::ShutdownSignal;
pub use submission::{
    DeliveryError, JobState, QueueStatus, SubmissionQueue, SubmissionWorker, TargetRegistry,
};
pub use xades::{SignedDocument, SigningError, Verification, XadesSigner};
