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

//! Certificate pinning.
//!
//! A [`PinningPolicy`] maps hostnames to the certificate fingerprints they are
//! allowed to present. [`PinningGuard::authorize`] is consulted after the TLS
//! handshake and before any request byte is written; see
//! [`transport::PinnedTransport`].

pub mod transport;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use parking_lot::RwLock;
use thiserror::Error;
use tracing::debug;

use crate::audit;
use crate::crypto::{certificate_fingerprint, format_fingerprint};

const PIN_PREFIX: &str = "FISKAL_PIN_";

/// Errors raised while building a pinning policy.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PinningError {
    #[error("Invalid fingerprint '{0}': expected hex bytes, optionally colon separated")]
    InvalidFingerprint(String),

    #[error("Pin '{0}' has no host")]
    MissingHost(String),

    #[error("Pin '{0}' has no fingerprints")]
    MissingFingerprints(String),

    #[error("Pin '{name}' has an invalid strict flag '{value}'")]
    InvalidStrict { name: String, value: String },
}

/// A connection was refused because the peer presented no pinned certificate.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Certificate pin mismatch for {host}: presented [{}]", presented.join(", "))]
pub struct PinningDenied {
    pub host: String,
    pub presented: Vec<String>,
}

/// A SHA-256 certificate fingerprint in `AA:BB:..` form.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Fingerprint of a DER encoded certificate.
    pub fn of_der(der: &[u8]) -> Self {
        Fingerprint(certificate_fingerprint(der))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Fingerprint {
    type Err = PinningError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || PinningError::InvalidFingerprint(s.to_string());
        let trimmed = s.trim();

        let hex_digits: String = if trimmed.contains(':') {
            let mut out = String::with_capacity(trimmed.len());
            for part in trimmed.split(':') {
                if part.len() != 2 {
                    return Err(invalid());
                }
                out.push_str(part);
            }
            out
        } else {
            trimmed.to_string()
        };

        if hex_digits.is_empty() {
            return Err(invalid());
        }
        let bytes = hex::decode(&hex_digits).map_err(|_| invalid())?;
        let normalized = format_fingerprint(&bytes);
        Ok(Fingerprint(normalized))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Pins for one host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPin {
    pub fingerprints: BTreeSet<Fingerprint>,
    /// Strict pins refuse the connection on mismatch; lenient pins only warn.
    pub strict: bool,
}

impl HostPin {
    pub fn strict<I: IntoIterator<Item = Fingerprint>>(fingerprints: I) -> Self {
        Self {
            fingerprints: fingerprints.into_iter().collect(),
            strict: true,
        }
    }

    pub fn lenient<I: IntoIterator<Item = Fingerprint>>(fingerprints: I) -> Self {
        Self {
            fingerprints: fingerprints.into_iter().collect(),
            strict: false,
        }
    }
}

/// Lower-cases and drops a trailing dot.
pub fn normalize_host(host: &str) -> String {
    host.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// Hostname to pin table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PinningPolicy {
    hosts: BTreeMap<String, HostPin>,
}

impl PinningPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(mut self, host: &str, pin: HostPin) -> Self {
        self.insert(host, pin);
        self
    }

    pub fn insert(&mut self, host: &str, pin: HostPin) {
        self.hosts.insert(normalize_host(host), pin);
    }

    pub fn get(&self, host: &str) -> Option<&HostPin> {
        self.hosts.get(&normalize_host(host))
    }

    pub fn hosts(&self) -> impl Iterator<Item = &str> {
        self.hosts.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    /// Builds a policy from `FISKAL_PIN_<NAME>_HOST`,
    /// `FISKAL_PIN_<NAME>_FINGERPRINTS` and `FISKAL_PIN_<NAME>_STRICT` pairs.
    /// Unrelated keys are ignored.
    pub fn from_env_pairs<I, K, V>(pairs: I) -> Result<Self, PinningError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        #[derive(Default)]
        struct Partial {
            host: Option<String>,
            fingerprints: Option<String>,
            strict: Option<String>,
        }

        let mut partials: BTreeMap<String, Partial> = BTreeMap::new();
        for (key, value) in pairs {
            let Some(rest) = key.as_ref().strip_prefix(PIN_PREFIX) else {
                continue;
            };
            let value = value.as_ref().to_string();
            if let Some(name) = rest.strip_suffix("_HOST") {
                partials.entry(name.to_string()).or_default().host = Some(value);
            } else if let Some(name) = rest.strip_suffix("_FINGERPRINTS") {
                partials.entry(name.to_string()).or_default().fingerprints = Some(value);
            } else if let Some(name) = rest.strip_suffix("_STRICT") {
                partials.entry(name.to_string()).or_default().strict = Some(value);
            }
        }

        let mut policy = PinningPolicy::new();
        for (name, partial) in partials {
            let host = partial
                .host
                .filter(|h| !h.trim().is_empty())
                .ok_or_else(|| PinningError::MissingHost(name.clone()))?;

            let fingerprints = partial
                .fingerprints
                .unwrap_or_default()
                .split(',')
                .map(str::trim)
                .filter(|f| !f.is_empty())
                .map(Fingerprint::from_str)
                .collect::<Result<BTreeSet<_>, _>>()?;
            if fingerprints.is_empty() {
                return Err(PinningError::MissingFingerprints(name));
            }

            let strict = match partial.strict {
                None => true,
                Some(value) => parse_flag(&value).ok_or_else(|| PinningError::InvalidStrict {
                    name: name.clone(),
                    value: value.clone(),
                })?,
            };

            policy.insert(
                &host,
                HostPin {
                    fingerprints,
                    strict,
                },
            );
        }
        Ok(policy)
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Result of checking a presented certificate chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PinDecision {
    /// A presented certificate matches a pin.
    Allow,
    /// No policy for this host.
    AllowUnpinned,
    /// Lenient policy, no match.
    AllowMismatch,
    Deny(PinningDenied),
}

impl PinDecision {
    pub fn is_allowed(&self) -> bool {
        !matches!(self, PinDecision::Deny(_))
    }
}

/// Thread-safe pin table consulted on every outbound connection.
#[derive(Debug, Default)]
pub struct PinningGuard {
    policy: RwLock<PinningPolicy>,
}

impl PinningGuard {
    pub fn new(policy: PinningPolicy) -> Self {
        Self {
            policy: RwLock::new(policy),
        }
    }

    /// Checks the certificates a host presented during the handshake.
    pub fn authorize(&self, host: &str, presented: &[Fingerprint]) -> PinDecision {
        let policy = self.policy.read();
        let Some(pin) = policy.get(host) else {
            audit::log_pinning_bypassed(host, "no pinning policy configured for host");
            return PinDecision::AllowUnpinned;
        };

        if presented.iter().any(|fp| pin.fingerprints.contains(fp)) {
            debug!(host = %host, "Certificate pin matched");
            return PinDecision::Allow;
        }

        let presented: Vec<String> = presented.iter().map(ToString::to_string).collect();
        if pin.strict {
            audit::log_pinning_denied(host, &presented);
            metrics::counter!("fiskal_pinning_denied_total").increment(1);
            PinDecision::Deny(PinningDenied {
                host: normalize_host(host),
                presented,
            })
        } else {
            audit::log_pinning_bypassed(host, "lenient pin did not match presented certificates");
            PinDecision::AllowMismatch
        }
    }

    /// Adds pins for hosts not already configured. Existing hosts keep their
    /// pins. Returns the hosts that were added.
    pub fn extend_from_pairs<I, K, V>(&self, pairs: I) -> Result<Vec<String>, PinningError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let incoming = PinningPolicy::from_env_pairs(pairs)?;
        let mut policy = self.policy.write();
        let mut added = Vec::new();
        for (host, pin) in incoming.hosts {
            if !policy.hosts.contains_key(&host) {
                policy.hosts.insert(host.clone(), pin);
                added.push(host);
            }
        }
        Ok(added)
    }

    pub fn is_pinned(&self, host: &str) -> bool {
        self.policy.read().get(host).is_some()
    }

    pub fn snapshot(&self) -> PinningPolicy {
        self.policy.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(s: &str) -> Fingerprint {
        s.parse().unwrap()
    }

    #[test]
    fn test_fingerprint_normalization() {
        assert_eq!(fp("ab:cd:ef").as_str(), "AB:CD:EF");
        assert_eq!(fp("abcdef"), fp("AB:CD:EF"));
        assert_eq!(fp(" 11:22:33 ").to_string(), "11:22:33");
        assert!("".parse::<Fingerprint>().is_err());
        assert!("abc".parse::<Fingerprint>().is_err());
        assert!("a:bc".parse::<Fingerprint>().is_err());
        assert!("zz:11".parse::<Fingerprint>().is_err());
    }

    #[test]
    fn test_authorize_outcomes() {
        let guard = PinningGuard::new(
            PinningPolicy::new()
                .with_host("tax.example", HostPin::strict([fp("11:22:33")]))
                .with_host("bank.example", HostPin::lenient([fp("AA:BB")])),
        );

        assert_eq!(guard.authorize("tax.example", &[fp("11:22:33")]), PinDecision::Allow);
        assert_eq!(
            guard.authorize("TAX.example.", &[fp("44:55:66"), fp("112233")]),
            PinDecision::Allow
        );
        assert_eq!(
            guard.authorize("tax.example", &[fp("44:55:66")]),
            PinDecision::Deny(PinningDenied {
                host: "tax.example".into(),
                presented: vec!["44:55:66".into()],
            })
        );
        assert_eq!(
            guard.authorize("bank.example", &[fp("CC:DD")]),
            PinDecision::AllowMismatch
        );
        assert_eq!(
            guard.authorize("other.example", &[fp("CC:DD")]),
            PinDecision::AllowUnpinned
        );
        assert!(!guard.authorize("tax.example", &[]).is_allowed());
    }

    #[test]
    fn test_policy_from_env_pairs() {
        let policy = PinningPolicy::from_env_pairs([
            ("FISKAL_PIN_TAX_HOST", "Tax.Example"),
            ("FISKAL_PIN_TAX_FINGERPRINTS", "11:22:33, aabbcc"),
            ("FISKAL_PIN_BANK_API_HOST", "bank.example"),
            ("FISKAL_PIN_BANK_API_FINGERPRINTS", "01:02"),
            ("FISKAL_PIN_BANK_API_STRICT", "off"),
            ("FISKAL_DATABASE_URL", "ignored"),
        ])
        .unwrap();

        let tax = policy.get("tax.example").unwrap();
        assert!(tax.strict);
        assert_eq!(tax.fingerprints.len(), 2);
        assert!(tax.fingerprints.contains(&fp("AA:BB:CC")));
        assert!(!policy.get("bank.example").unwrap().strict);
        assert_eq!(policy.len(), 2);
    }

    #[test]
    fn test_policy_from_env_pairs_errors() {
        assert_eq!(
            PinningPolicy::from_env_pairs([("FISKAL_PIN_X_FINGERPRINTS", "11")]),
            Err(PinningError::MissingHost("X".into()))
        );
        assert_eq!(
            PinningPolicy::from_env_pairs([("FISKAL_PIN_X_HOST", "x.example")]),
            Err(PinningError::MissingFingerprints("X".into()))
        );
        assert!(matches!(
            PinningPolicy::from_env_pairs([
                ("FISKAL_PIN_X_HOST", "x.example"),
                ("FISKAL_PIN_X_FINGERPRINTS", "11"),
                ("FISKAL_PIN_X_STRICT", "maybe"),
            ]),
            Err(PinningError::InvalidStrict { .. })
        ));
        assert!(matches!(
            PinningPolicy::from_env_pairs([
                ("FISKAL_PIN_X_HOST", "x.example"),
                ("FISKAL_PIN_X_FINGERPRINTS", "not-hex"),
            ]),
            Err(PinningError::InvalidFingerprint(_))
        ));
    }

    #[test]
    fn test_extend_is_additive() {
        let guard = PinningGuard::new(
            PinningPolicy::new().with_host("tax.example", HostPin::strict([fp("11:22:33")])),
        );

        let added = guard
            .extend_from_pairs([
                ("FISKAL_PIN_TAX_HOST", "tax.example"),
                ("FISKAL_PIN_TAX_FINGERPRINTS", "99:99"),
                ("FISKAL_PIN_BANK_HOST", "bank.example"),
                ("FISKAL_PIN_BANK_FINGERPRINTS", "01:02"),
            ])
            .unwrap();

        assert_eq!(added, vec!["bank.example".to_string()]);
        assert_eq!(guard.authorize("tax.example", &[fp("11:22:33")]), PinDecision::Allow);
        assert!(!guard.authorize("tax.example", &[fp("99:99")]).is_allowed());
        assert!(guard.is_pinned("bank.example"));
        assert_eq!(guard.snapshot().len(), 2);
    }

    #[test]
    fn test_fingerprint_of_der_matches_parsed_form() {
        let der = b"not really a certificate";
        let computed = Fingerprint::of_der(der);
        let reparsed: Fingerprint = computed.as_str().to_lowercase().parse().unwrap();
        assert_eq!(computed, reparsed);
        assert_eq!(computed.as_str().len(), 32 * 3 - 1);
    }
}
