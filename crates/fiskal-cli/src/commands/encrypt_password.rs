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

//! Implementation of the `encrypt-password` command.
//!
//! Reads the plaintext password from the first line of stdin and prints the
//! encrypted token.

use std::io::BufRead;

use anyhow::{bail, Context, Result};
use fiskal::FiskalConfig;
use tracing::info;
use zeroize::Zeroizing;

use super::{open_database, KeyServices};

pub async fn run(config: &FiskalConfig, name: Option<&str>) -> Result<()> {
    let mut line = Zeroizing::new(String::new());
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("Failed to read password from stdin")?;
    let password = line.trim_end_matches(['\r', '\n']);
    if password.is_empty() {
        bail!("Password must not be empty");
    }

    let database = open_database(config).await?;
    let keys = KeyServices::open(config, database).await?;
    let store = keys.certificate_store();

    let secret = match name {
        Some(name) => {
            let secret = store.register_password(name, password).await?;
            info!(name = %name, key_version = secret.key_version, "Password stored");
            secret
        }
        None => store.encrypt_password(password)?,
    };
    println!("{}", secret);
    Ok(())
}
