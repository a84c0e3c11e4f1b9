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

//! fiskal CLI - sign, verify and submit fiscal documents.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use fiskal::FiskalConfig;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod commands;

/// fiskal - signed fiscal document delivery
#[derive(Parser)]
#[command(name = "fiskal")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Database URL (can also be set via FISKAL_DATABASE_URL)
    #[arg(long, env = "FISKAL_DATABASE_URL", global = true)]
    database_url: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign an XML document with a PKCS#12 credential
    Sign {
        /// PKCS#12 bundle holding the signing key and certificate
        #[arg(long)]
        credential: PathBuf,

        /// Encrypted password token (v{n}:aes-256-gcm:{base64})
        #[arg(
            long,
            env = "FISKAL_CREDENTIAL_PASSWORD",
            conflicts_with = "password_secret",
            required_unless_present = "password_secret"
        )]
        password_token: Option<String>,

        /// Name of a stored password secret
        #[arg(long)]
        password_secret: Option<String>,

        /// XML document to sign
        #[arg(long)]
        input: PathBuf,

        /// Where to write the enveloped document (stdout if omitted)
        #[arg(long)]
        output: Option<PathBuf>,

        /// Document id (defaults to the input file stem)
        #[arg(long)]
        document_id: Option<String>,

        /// Queue the signed document for this target after signing
        #[arg(long)]
        submit: Option<String>,
    },

    /// Verify an enveloped signed document
    Verify {
        /// Signed XML document
        #[arg(long)]
        input: PathBuf,
    },

    /// Encrypt a credential password under the current data key
    EncryptPassword {
        /// Store the encrypted password under this name so rotation migrates it
        #[arg(long)]
        name: Option<String>,
    },

    /// Rotate the data key if due
    RotateKeys {
        /// Rotate even if the interval has not elapsed
        #[arg(long)]
        force: bool,

        /// Drop retained keys whose overlap window has ended
        #[arg(long)]
        prune: bool,
    },

    /// Print submission queue depth and durability as JSON
    QueueStatus,

    /// Run submission workers until interrupted
    Worker {
        /// Number of concurrent workers (overrides FISKAL_WORKERS)
        #[arg(long)]
        workers: Option<usize>,

        /// Hours between scheduled key rotation checks
        #[arg(long, default_value_t = 6)]
        rotation_check_hours: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let mut config = FiskalConfig::from_env()?;
    if let Some(url) = cli.database_url {
        config = config.into_builder().database_url(url).build();
    }

    match cli.command {
        Commands::Sign {
            credential,
            password_token,
            password_secret,
            input,
            output,
            document_id,
            submit,
        } => {
            let password = match (password_token, password_secret) {
                (Some(token), _) => commands::sign::Password::Token(token),
                (None, Some(name)) => commands::sign::Password::Secret(name),
                (None, None) => anyhow::bail!("--password-token or --password-secret is required"),
            };
            commands::sign::run(
                &config,
                commands::sign::SignArgs {
                    credential,
                    password,
                    input,
                    output,
                    document_id,
                    submit,
                },
            )
            .await?;
        }
        Commands::Verify { input } => commands::verify::run(&input)?,
        Commands::EncryptPassword { name } => {
            commands::encrypt_password::run(&config, name.as_deref()).await?
        }
        Commands::RotateKeys { force, prune } => {
            commands::rotate_keys::run(&config, force, prune).await?
        }
        Commands::QueueStatus => commands::queue_status::run(&config).await?,
        Commands::Worker {
            workers,
            rotation_check_hours,
        } => {
            if let Some(n) = workers {
                config = config.into_builder().workers(n).build();
            }
            commands::worker::run(&config, rotation_check_hours).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_sign_requires_a_password_source() {
        if std::env::var_os("FISKAL_CREDENTIAL_PASSWORD").is_some() {
            return;
        }
        let parsed = Cli::try_parse_from([
            "fiskal",
            "sign",
            "--credential",
            "c.p12",
            "--input",
            "i.xml",
        ]);
        assert!(parsed.is_err());

        let parsed = Cli::try_parse_from([
            "fiskal",
            "sign",
            "--credential",
            "c.p12",
            "--input",
            "i.xml",
            "--password-secret",
            "company",
        ])
        .unwrap();
        assert!(matches!(
            parsed.command,
            Commands::Sign { password_secret: Some(ref s), .. } if s == "company"
        ));
    }

    #[test]
    fn test_rotate_keys_flags() {
        let parsed = Cli::try_parse_from(["fiskal", "rotate-keys", "--force"]).unwrap();
        assert!(matches!(
            parsed.command,
            Commands::RotateKeys {
                force: true,
                prune: false
            }
        ));
    }
}
