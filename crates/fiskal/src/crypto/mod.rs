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

//! Cryptographic primitives shared by the signer, the key ring and the
//! pinning layer.
//!
//! This module provides:
//! - AES-256-GCM sealing of secrets and data keys at rest
//! - SHA-256 digests in the encodings the rest of the crate needs
//! - Certificate fingerprint formatting

mod digest;
mod key_encryption;

pub use digest::{
    certificate_fingerprint, format_fingerprint, key_hash, sha256_base64, sha256_hex,
};
pub use key_encryption::{
    decrypt_secret, encrypt_secret, generate_data_key, KeyEncryptionError, DATA_KEY_LEN,
};
