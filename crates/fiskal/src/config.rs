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

//! Runtime configuration.
//!
//! Use [`FiskalConfig::builder()`] in code, or [`FiskalConfig::from_env()`]
//! to read `FISKAL_*` variables (a `.env` file is loaded first when present):
//!
//! | Variable | Meaning | Default |
//! |---|---|---|
//! | `FISKAL_DATABASE_URL` | SQLite path or `sqlite://` URL | none (in-process only) |
//! | `FISKAL_MASTER_KEY` | 32-byte hex key wrapping stored data keys | none |
//! | `FISKAL_WORKERS` | submission workers | 4 |
//! | `FISKAL_POLL_INTERVAL_MS` | idle worker poll | 500 |
//! | `FISKAL_REQUEST_TIMEOUT_SECS` | per-delivery deadline | 30 |
//! | `FISKAL_MAX_ATTEMPTS` | attempts before dead letter | 5 |
//! | `FISKAL_BACKOFF_BASE_SECS` / `FISKAL_BACKOFF_CEILING_SECS` | retry backoff | 2 / 600 |
//! | `FISKAL_ROTATION_INTERVAL_DAYS` / `FISKAL_ROTATION_OVERLAP_HOURS` | key rotation | 90 / 24 |
//! | `FISKAL_TARGET_<ID>_URL` | submission endpoint for target `<id>` | |
//! | `FISKAL_PIN_<NAME>_*` | certificate pins, see [`crate::pinning`] | |

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use url::Url;
use zeroize::Zeroizing;

use crate::crypto::DATA_KEY_LEN;
use crate::keys::RotationPolicy;
use crate::pinning::{PinningError, PinningPolicy};
use crate::submission::{RetryPolicy, TargetRegistry, WorkerPoolConfig};

const TARGET_PREFIX: &str = "FISKAL_TARGET_";
const TARGET_SUFFIX: &str = "_URL";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {var}: {reason}")]
    Invalid { var: String, reason: String },

    #[error(transparent)]
    Pinning(#[from] PinningError),
}

/// Master key for wrapping data keys at rest. Never printed.
#[derive(Clone)]
pub struct MasterKey(Zeroizing<Vec<u8>>);

impl MasterKey {
    pub fn from_hex(hex_key: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: String| ConfigError::Invalid {
            var: "FISKAL_MASTER_KEY".to_string(),
            reason,
        };
        let bytes = Zeroizing::new(hex::decode(hex_key.trim()).map_err(|e| invalid(e.to_string()))?);
        if bytes.len() != DATA_KEY_LEN {
            return Err(invalid(format!(
                "expected {} bytes, got {}",
                DATA_KEY_LEN,
                bytes.len()
            )));
        }
        Ok(MasterKey(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterKey([REDACTED])")
    }
}

/// Configuration for the signing and submission services.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct FiskalConfig {
    database_url: Option<String>,
    master_key: Option<MasterKey>,
    workers: usize,
    poll_interval: Duration,
    request_timeout: Duration,
    stale_lease: Duration,
    max_attempts: u32,
    backoff_base: Duration,
    backoff_ceiling: Duration,
    rotation_interval_days: i64,
    rotation_overlap_hours: i64,
    targets: TargetRegistry,
    pinning: PinningPolicy,
}

impl FiskalConfig {
    pub fn builder() -> FiskalConfigBuilder {
        FiskalConfigBuilder::default()
    }

    /// A builder seeded with this configuration, for overriding single values.
    pub fn into_builder(self) -> FiskalConfigBuilder {
        FiskalConfigBuilder { config: self }
    }

    /// Loads `.env` if present, then reads the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        if let Ok(path) = dotenvy::dotenv() {
            tracing::debug!(path = %path.display(), "Loaded .env");
        }
        Self::from_env_pairs(std::env::vars())
    }

    /// Reads configuration from `(name, value)` pairs. Unset variables keep
    /// their defaults.
    pub fn from_env_pairs<I, K, V>(pairs: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars: HashMap<String, String> = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .filter(|(k, _)| k.starts_with("FISKAL_"))
            .collect();

        let mut builder = FiskalConfig::builder();
        if let Some(url) = vars.get("FISKAL_DATABASE_URL").filter(|v| !v.trim().is_empty()) {
            builder = builder.database_url(url.trim());
        }
        if let Some(key) = vars.get("FISKAL_MASTER_KEY") {
            builder = builder.master_key(MasterKey::from_hex(key)?);
        }
        if let Some(n) = parse_var::<usize>(&vars, "FISKAL_WORKERS")? {
            builder = builder.workers(n);
        }
        if let Some(ms) = parse_var::<u64>(&vars, "FISKAL_POLL_INTERVAL_MS")? {
            builder = builder.poll_interval(Duration::from_millis(ms));
        }
        if let Some(secs) = parse_var::<u64>(&vars, "FISKAL_REQUEST_TIMEOUT_SECS")? {
            builder = builder.request_timeout(Duration::from_secs(secs));
        }
        if let Some(n) = parse_var::<u32>(&vars, "FISKAL_MAX_ATTEMPTS")? {
            builder = builder.max_attempts(n);
        }
        if let Some(secs) = parse_var::<u64>(&vars, "FISKAL_BACKOFF_BASE_SECS")? {
            builder = builder.backoff_base(Duration::from_secs(secs));
        }
        if let Some(secs) = parse_var::<u64>(&vars, "FISKAL_BACKOFF_CEILING_SECS")? {
            builder = builder.backoff_ceiling(Duration::from_secs(secs));
        }
        if let Some(days) = parse_var::<u32>(&vars, "FISKAL_ROTATION_INTERVAL_DAYS")? {
            builder = builder.rotation_interval_days(days);
        }
        if let Some(hours) = parse_var::<u32>(&vars, "FISKAL_ROTATION_OVERLAP_HOURS")? {
            builder = builder.rotation_overlap_hours(hours);
        }

        let mut targets = TargetRegistry::new();
        for (name, value) in &vars {
            let Some(id) = name
                .strip_prefix(TARGET_PREFIX)
                .and_then(|rest| rest.strip_suffix(TARGET_SUFFIX))
            else {
                continue;
            };
            let url = Url::parse(value.trim()).map_err(|e| ConfigError::Invalid {
                var: name.clone(),
                reason: e.to_string(),
            })?;
            targets.insert(id, url);
        }

        Ok(builder
            .targets(targets)
            .pinning(PinningPolicy::from_env_pairs(&vars)?)
            .build())
    }

    pub fn database_url(&self) -> Option<&str> {
        self.database_url.as_deref()
    }

    pub fn master_key(&self) -> Option<&MasterKey> {
        self.master_key.as_ref()
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub fn targets(&self) -> &TargetRegistry {
        &self.targets
    }

    pub fn pinning(&self) -> &PinningPolicy {
        &self.pinning
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, self.backoff_base, self.backoff_ceiling)
    }

    pub fn worker_pool_config(&self) -> WorkerPoolConfig {
        WorkerPoolConfig {
            workers: self.workers,
            poll_interval: self.poll_interval,
            request_timeout: self.request_timeout,
            stale_lease: self.stale_lease,
            ..WorkerPoolConfig::default()
        }
    }

    pub fn rotation_policy(&self) -> RotationPolicy {
        RotationPolicy {
            interval: chrono::Duration::days(self.rotation_interval_days),
            overlap: chrono::Duration::hours(self.rotation_overlap_hours),
            ..RotationPolicy::default()
        }
    }
}

fn parse_var<T>(vars: &HashMap<String, String>, name: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    vars.get(name)
        .map(|raw| {
            raw.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
                var: name.to_string(),
                reason: e.to_string(),
            })
        })
        .transpose()
}

#[derive(Debug, Clone)]
pub struct FiskalConfigBuilder {
    config: FiskalConfig,
}

impl Default for FiskalConfigBuilder {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        let workers = WorkerPoolConfig::default();
        Self {
            config: FiskalConfig {
                database_url: None,
                master_key: None,
                workers: workers.workers,
                poll_interval: workers.poll_interval,
                request_timeout: workers.request_timeout,
                stale_lease: workers.stale_lease,
                max_attempts: retry.max_attempts(),
                backoff_base: retry.base_delay(),
                backoff_ceiling: retry.max_delay(),
                rotation_interval_days: 90,
                rotation_overlap_hours: 24,
                targets: TargetRegistry::new(),
                pinning: PinningPolicy::new(),
            },
        }
    }
}

impl FiskalConfigBuilder {
    pub fn database_url(mut self, value: impl Into<String>) -> Self {
        self.config.database_url = Some(value.into());
        self
    }

    pub fn master_key(mut self, value: MasterKey) -> Self {
        self.config.master_key = Some(value);
        self
    }

    pub fn workers(mut self, value: usize) -> Self {
        self.config.workers = value.max(1);
        self
    }

    pub fn poll_interval(mut self, value: Duration) -> Self {
        self.config.poll_interval = value;
        self
    }

    pub fn request_timeout(mut self, value: Duration) -> Self {
        self.config.request_timeout = value;
        self
    }

    /// How long a claimed job may stay in flight before another worker may take it.
    pub fn stale_lease(mut self, value: Duration) -> Self {
        self.config.stale_lease = value;
        self
    }

    pub fn max_attempts(mut self, value: u32) -> Self {
        self.config.max_attempts = value;
        self
    }

    pub fn backoff_base(mut self, value: Duration) -> Self {
        self.config.backoff_base = value;
        self
    }

    pub fn backoff_ceiling(mut self, value: Duration) -> Self {
        self.config.backoff_ceiling = value;
        self
    }

    pub fn rotation_interval_days(mut self, value: u32) -> Self {
        self.config.rotation_interval_days = i64::from(value);
        self
    }

    pub fn rotation_overlap_hours(mut self, value: u32) -> Self {
        self.config.rotation_overlap_hours = i64::from(value);
        self
    }

    pub fn targets(mut self, value: TargetRegistry) -> Self {
        self.config.targets = value;
        self
    }

    pub fn target(mut self, id: &str, url: Url) -> Self {
        self.config.targets.insert(id, url);
        self
    }

    pub fn pinning(mut self, value: PinningPolicy) -> Self {
        self.config.pinning = value;
        self
    }

    pub fn build(self) -> FiskalConfig {
        self.config
    }
}

impl Default for FiskalConfig {
    fn default() -> Self {
        FiskalConfigBuilder::default().build()
    }
}
