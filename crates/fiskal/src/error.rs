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

use thiserror::Error;

use crate::config::ConfigError;
use crate::credentials::CredentialLoadError;
use crate::database::DatabaseError;
use crate::keys::{KeyRingError, RotationFailure, StoreError};
use crate::pinning::transport::TransportError;
use crate::pinning::PinningError;
use crate::submission::{DeliveryError, QueueError};
use crate::xades::SigningError;

/// Any error raised by this crate.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Credential load failed: {0}")]
    CredentialLoad(#[from] CredentialLoadError),

    #[error("Signing failed: {0}")]
    Signing(#[from] SigningError),

    #[error("Key ring error: {0}")]
    KeyRing(#[from] KeyRingError),

    #[error("Key store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Rotation(#[from] RotationFailure),

    #[error("Pinning configuration error: {0}")]
    Pinning(#[from] PinningError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Delivery failed: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Submission queue error: {0}")]
    Queue(#[from] QueueError),
}

pub type Result<T> = std::result::Result<T, Error>;
