// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Loading of WAF rulesets and of the data/exclusion documents derived from
//! user settings.

use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, Read, Seek};
use std::path::PathBuf;

use remote_config_core::telemetry::{TelemetryLevel, TelemetrySink};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{error, warn};

use crate::assets;

/// Expiration used for denylist entries, far enough in the future to never expire.
pub const DENYLIST_EXPIRATION: u64 = 1 << 63;

/// Readable, rewindable source of a JSON ruleset.
pub trait RulesetStream: Read + Seek + Send {}

impl<T: Read + Seek + Send> RulesetStream for T {}

/// Where the ruleset comes from.
pub enum Ruleset {
    Recommended,
    Strict,
    /// Deprecated alias of [`Ruleset::Recommended`].
    Risky,
    FilePath(PathBuf),
    /// Parsed, then rewound so the caller can read it again.
    Stream(Box<dyn RulesetStream>),
    /// An already parsed document. Only JSON objects are accepted.
    Inline(Value),
}

impl fmt::Debug for Ruleset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ruleset::Recommended => f.write_str("Recommended"),
            Ruleset::Strict => f.write_str("Strict"),
            Ruleset::Risky => f.write_str("Risky"),
            Ruleset::FilePath(path) => f.debug_tuple("FilePath").field(path).finish(),
            Ruleset::Stream(_) => f.write_str("Stream(..)"),
            Ruleset::Inline(_) => f.write_str("Inline(..)"),
        }
    }
}

/// Error conditions raised while loading a ruleset.
#[derive(Debug, Error)]
pub enum RuleLoadError {
    #[error("appsec: failed to open ruleset file {path:?}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("appsec: failed to rewind ruleset stream: {0}")]
    Rewind(io::Error),
    #[error("appsec: failed to parse ruleset: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("appsec: unsupported ruleset, expected a JSON object")]
    UnsupportedRuleset,
}

/// Loads `ruleset` into a JSON document.
///
/// Failures never propagate: they are logged, reported to `telemetry`, and
/// yield `None`, meaning protection must stay inactive.
pub fn load_rules(ruleset: &mut Ruleset, telemetry: &dyn TelemetrySink) -> Option<Value> {
    match try_load_rules(ruleset) {
        Ok(document) => Some(document),
        Err(err) => {
            error!(error = %err, ruleset = ?ruleset, "appsec: ruleset failed to load");
            telemetry.report(
                TelemetryLevel::Error,
                "libddwaf ruleset failed to load",
                Some(&err),
            );
            None
        }
    }
}

fn try_load_rules(ruleset: &mut Ruleset) -> Result<Value, RuleLoadError> {
    let document: Value = match ruleset {
        Ruleset::Recommended => serde_json::from_str(assets::RECOMMENDED)?,
        Ruleset::Strict => serde_json::from_str(assets::STRICT)?,
        Ruleset::Risky => {
            warn!("appsec: the 'risky' ruleset is deprecated, falling back to 'recommended'");
            serde_json::from_str(assets::RECOMMENDED)?
        }
        Ruleset::FilePath(path) => {
            let file = File::open(&*path).map_err(|source| RuleLoadError::Io {
                path: path.clone(),
                source,
            })?;
            serde_json::from_reader(BufReader::new(file))?
        }
        Ruleset::Stream(stream) => {
            let document = serde_json::from_reader(&mut **stream)?;
            stream.rewind().map_err(RuleLoadError::Rewind)?;
            document
        }
        Ruleset::Inline(document) => document.clone(),
    };

    if document.is_object() {
        Ok(document)
    } else {
        Err(RuleLoadError::UnsupportedRuleset)
    }
}

/// Builds `data_with_expiration` entries for the configured denylists.
///
/// Each non-empty list yields one entry; empty lists are skipped.
pub fn load_data<S: AsRef<str>>(ip_denylist: &[S], user_id_denylist: &[S]) -> Vec<Value> {
    [("blocked_ips", ip_denylist), ("blocked_users", user_id_denylist)]
        .into_iter()
        .filter(|(_, list)| !list.is_empty())
        .map(|(id, list)| {
            let data: Vec<Value> = list
                .iter()
                .map(|value| {
                    let value: &str = value.as_ref();
                    json!({ "value": value, "expiration": DENYLIST_EXPIRATION })
                })
                .collect();
            json!({ "id": id, "type": "data_with_expiration", "data": data })
        })
        .collect()
}

/// IP addresses that bypass the WAF.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpPasslist {
    /// Every address is passed through.
    List(Vec<String>),
    /// `pass` addresses are excluded, `monitor` ones are only flagged.
    Split { pass: Vec<String>, monitor: Vec<String> },
}

impl Default for IpPasslist {
    fn default() -> Self {
        IpPasslist::List(Vec::new())
    }
}

/// Builds up to two `ip_match` exclusions for the passlist.
pub fn load_exclusions(ip_passlist: &IpPasslist) -> Vec<Value> {
    let (pass, monitor): (&[String], &[String]) = match ip_passlist {
        IpPasslist::List(pass) => (pass.as_slice(), &[][..]),
        IpPasslist::Split { pass, monitor } => (pass.as_slice(), monitor.as_slice()),
    };

    let mut exclusions = Vec::with_capacity(2);
    if !pass.is_empty() {
        exclusions.push(ip_exclusion(pass));
    }
    if !monitor.is_empty() {
        let mut exclusion = ip_exclusion(monitor);
        exclusion["on_match"] = json!("monitor");
        exclusions.push(exclusion);
    }
    exclusions
}

fn ip_exclusion(list: &[String]) -> Value {
    json!({
        "id": uuid::Uuid::new_v4().to_string(),
        "conditions": [{
            "operator": "ip_match",
            "parameters": {
                "inputs": [{ "address": "http.client_ip" }],
                "list": list
            }
        }]
    })
}
