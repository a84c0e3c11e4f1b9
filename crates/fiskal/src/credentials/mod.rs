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

//! Certificate store: signing credentials loaded from encrypted PKCS#12 files.

mod credential;
mod store;

pub use credential::{certificate_valid_at, name_to_string, SigningCredential};
pub use store::{CertificateStore, CredentialLoadError};

#[cfg(test)]
pub(crate) use credential::fixtures;
