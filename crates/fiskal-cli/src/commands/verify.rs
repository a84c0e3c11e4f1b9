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

//! Implementation of the `verify` command.

use std::path::Path;

use anyhow::{bail, Context, Result};
use fiskal::{Verification, XadesSigner};

pub fn run(input: &Path) -> Result<()> {
    let xml = std::fs::read_to_string(input)
        .with_context(|| format!("Failed to read {}", input.display()))?;

    match XadesSigner::new().verify_enveloped(&xml) {
        Verification::Valid => {
            println!("valid");
            Ok(())
        }
        Verification::Invalid(reason) => bail!("Signature is invalid: {}", reason),
    }
}
