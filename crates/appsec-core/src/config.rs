// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Environment-driven AppSec settings.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use crate::api_security::{Sampler, SamplerError};
use crate::rule_loader::Ruleset;

/// Name of the environment variable toggling AppSec protection.
const ENV_ENABLED: &str = "DD_APPSEC_ENABLED";
/// Path of a ruleset file replacing the built-in `recommended` rules.
const ENV_RULES: &str = "DD_APPSEC_RULES";
/// Per-run engine timeout in microseconds.
const ENV_WAF_TIMEOUT: &str = "DD_APPSEC_WAF_TIMEOUT";
const ENV_API_SECURITY_ENABLED: &str = "DD_API_SECURITY_ENABLED";
/// Legacy spelling of [`ENV_API_SECURITY_ENABLED`].
const ENV_API_SECURITY_ENABLED_EXPERIMENTAL: &str = "DD_EXPERIMENTAL_API_SECURITY_ENABLED";
const ENV_API_SECURITY_SAMPLE_RATE: &str = "DD_API_SECURITY_REQUEST_SAMPLE_RATE";
const ENV_API_SECURITY_SAMPLE_DELAY: &str = "DD_API_SECURITY_SAMPLE_DELAY";

pub const DEFAULT_WAF_TIMEOUT_US: u64 = 5_000;
pub const DEFAULT_SAMPLE_RATE: f64 = 0.1;
pub const DEFAULT_SAMPLE_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SettingsError {
    #[error(transparent)]
    SampleDelay(#[from] SamplerError),
}

/// API Security (schema extraction) options.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiSecuritySettings {
    pub enabled: bool,
    /// Fraction of requests considered for schema extraction, within `[0, 1]`.
    pub sample_rate: f64,
    /// Minimum delay between two samples of the same route.
    pub sample_delay: Duration,
}

impl Default for ApiSecuritySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            sample_rate: DEFAULT_SAMPLE_RATE,
            sample_delay: DEFAULT_SAMPLE_DELAY,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppSecSettings {
    pub enabled: bool,
    /// Ruleset file overriding the built-in rules.
    pub rules: Option<PathBuf>,
    pub waf_timeout_us: u64,
    pub api_security: ApiSecuritySettings,
}

impl Default for AppSecSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            rules: None,
            waf_timeout_us: DEFAULT_WAF_TIMEOUT_US,
            api_security: ApiSecuritySettings::default(),
        }
    }
}

impl AppSecSettings {
    /// Builds settings from the current process environment.
    pub fn from_os_env() -> Result<Self, SettingsError> {
        Self::from_env_iter(env::vars())
    }

    /// Builds settings from an iterator of key/value pairs (typically for tests).
    ///
    /// Malformed values fall back to their default, except the sample delay
    /// which must be a whole number of seconds.
    pub fn from_env_iter<I, K, V>(iter: I) -> Result<Self, SettingsError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let map: HashMap<String, String> = iter
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        let get = |key: &str| map.get(key).map(String::as_str);

        let enabled = parse_bool(get(ENV_ENABLED), false);
        let rules = get(ENV_RULES)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(PathBuf::from);
        let waf_timeout_us =
            parse_or_default(ENV_WAF_TIMEOUT, get(ENV_WAF_TIMEOUT), DEFAULT_WAF_TIMEOUT_US);

        // The current name wins over the experimental one when both are set.
        let api_security_enabled = parse_bool(
            get(ENV_API_SECURITY_ENABLED).or_else(|| get(ENV_API_SECURITY_ENABLED_EXPERIMENTAL)),
            false,
        );
        let sample_rate = parse_or_default(
            ENV_API_SECURITY_SAMPLE_RATE,
            get(ENV_API_SECURITY_SAMPLE_RATE),
            DEFAULT_SAMPLE_RATE,
        );
        let sample_rate = if sample_rate.is_nan() {
            DEFAULT_SAMPLE_RATE
        } else {
            sample_rate.clamp(0.0, 1.0)
        };
        let sample_delay = match get(ENV_API_SECURITY_SAMPLE_DELAY) {
            None => DEFAULT_SAMPLE_DELAY,
            Some(raw) => Sampler::parse_delay(raw)?,
        };

        Ok(Self {
            enabled,
            rules,
            waf_timeout_us,
            api_security: ApiSecuritySettings {
                enabled: api_security_enabled,
                sample_rate,
                sample_delay,
            },
        })
    }

    /// Ruleset selected by these settings.
    pub fn ruleset(&self) -> Ruleset {
        match &self.rules {
            Some(path) => Ruleset::FilePath(path.clone()),
            None => Ruleset::Recommended,
        }
    }
}

fn parse_or_default<T>(name: &str, value: Option<&str>, default: T) -> T
where
    T: std::str::FromStr,
{
    let Some(raw) = value else {
        return default;
    };
    match raw.trim().parse() {
        Ok(parsed) => parsed,
        Err(_) => {
            warn!(variable = name, value = raw, "appsec: ignoring malformed setting");
            default
        }
    }
}

/// Parses boolean values from strings, falling back to the provided default.
fn parse_bool(value: Option<&str>, default: bool) -> bool {
    match value.map(|s| s.trim().to_ascii_lowercase()) {
        Some(ref v) if ["1", "true", "t", "yes", "y"].contains(&v.as_str()) => true,
        Some(ref v) if ["0", "false", "f", "no", "n"].contains(&v.as_str()) => false,
        _ => default,
    }
}
