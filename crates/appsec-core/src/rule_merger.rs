// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Combination of rule sources into the single document the engine compiles.

use std::collections::HashMap;
use std::sync::OnceLock;

use remote_config_core::telemetry::{TelemetryLevel, TelemetrySink};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::error;

use crate::assets;

static DEFAULT_WAF_PROCESSORS: OnceLock<Value> = OnceLock::new();
static DEFAULT_WAF_SCANNERS: OnceLock<Value> = OnceLock::new();

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RuleMergeError {
    #[error("appsec: rules version mismatch, expected '{expected}' but found '{found}'")]
    RuleVersionMismatch { expected: String, found: String },
    #[error("appsec: rules document is not a JSON object")]
    InvalidRules,
}

/// Sources to merge. Each `Vec<Value>` inside a list is one source document.
#[derive(Debug, Default, Clone)]
pub struct MergeInput {
    pub rules: Vec<Value>,
    pub data: Vec<Vec<Value>>,
    pub overrides: Vec<Vec<Value>>,
    pub exclusions: Vec<Vec<Value>>,
    pub custom_rules: Vec<Vec<Value>>,
    /// Overrides the built-in processors when set.
    pub processors: Option<Value>,
    /// Overrides the built-in scanners when set.
    pub scanners: Option<Value>,
}

impl MergeInput {
    pub fn new(rules: Vec<Value>) -> Self {
        Self {
            rules,
            ..Self::default()
        }
    }
}

/// Merges every source into one ruleset document.
///
/// Keys for absent sources (`rules_data`, `rules_override`, `exclusions`,
/// `custom_rules`) are omitted. Processors and scanners fall back to the
/// built-in definitions.
pub fn merge(input: MergeInput, telemetry: &dyn TelemetrySink) -> Result<Value, RuleMergeError> {
    let mut combined = combine_rules(&input.rules)?;

    if let Some(data) = combine_data(&input.data) {
        combined.insert("rules_data".to_string(), Value::Array(data));
    }
    if let Some(overrides) = combine_overrides(input.overrides) {
        combined.insert("rules_override".to_string(), Value::Array(overrides));
    }
    if let Some(exclusions) = combine_exclusions(input.exclusions) {
        combined.insert("exclusions".to_string(), Value::Array(exclusions));
    }
    if let Some(custom_rules) = combine_custom_rules(input.custom_rules) {
        combined.insert("custom_rules".to_string(), Value::Array(custom_rules));
    }

    let processors = input
        .processors
        .unwrap_or_else(|| default_waf_processors(telemetry));
    let scanners = input
        .scanners
        .unwrap_or_else(|| default_waf_scanners(telemetry));
    combined.insert("processors".to_string(), processors);
    combined.insert("scanners".to_string(), scanners);

    Ok(Value::Object(combined))
}

/// Combines rule documents.
///
/// A single document is copied as is. Several documents have their `rules`
/// concatenated and must all declare the same `version` (documents without
/// a version are accepted).
pub fn combine_rules(rules: &[Value]) -> Result<Map<String, Value>, RuleMergeError> {
    if let [single] = rules {
        return single.as_object().cloned().ok_or(RuleMergeError::InvalidRules);
    }

    let mut version: Option<&Value> = None;
    let mut combined = Vec::new();
    for document in rules {
        let document = document.as_object().ok_or(RuleMergeError::InvalidRules)?;
        match (version, document.get("version")) {
            (_, None | Some(Value::Null)) => {}
            (None, Some(declared)) => version = Some(declared),
            (Some(expected), Some(found)) if expected != found => {
                return Err(RuleMergeError::RuleVersionMismatch {
                    expected: version_text(expected),
                    found: version_text(found),
                });
            }
            (Some(_), Some(_)) => {}
        }
        if let Some(Value::Array(document_rules)) = document.get("rules") {
            combined.extend(document_rules.iter().cloned());
        }
    }

    let mut result = Map::new();
    if let Some(version) = version {
        result.insert("version".to_string(), version.clone());
    }
    result.insert("rules".to_string(), Value::Array(combined));
    Ok(result)
}

fn version_text(version: &Value) -> String {
    version
        .as_str()
        .map_or_else(|| version.to_string(), str::to_string)
}

/// Merges data sources keyed by `(id, type)`.
///
/// When a value appears twice for the same key the higher expiration wins.
/// A missing expiration means "never expires" and always wins. Returns
/// `None` when there is nothing to merge.
pub fn combine_data(data: &[Vec<Value>]) -> Option<Vec<Value>> {
    let mut result: Vec<Value> = Vec::new();
    let mut positions: HashMap<(String, String), usize> = HashMap::new();

    for entry in data.iter().flatten() {
        let key = (
            entry["id"].as_str().unwrap_or_default().to_string(),
            entry["type"].as_str().unwrap_or_default().to_string(),
        );
        match positions.get(&key) {
            Some(&position) => {
                let merged = merge_expirations(&result[position]["data"], &entry["data"]);
                result[position]["data"] = Value::Array(merged);
            }
            None => {
                positions.insert(key, result.len());
                result.push(entry.clone());
            }
        }
    }

    (!result.is_empty()).then_some(result)
}

fn merge_expirations(current: &Value, incoming: &Value) -> Vec<Value> {
    // `None` expiration never expires.
    let mut merged: Vec<(Value, Option<u64>)> = Vec::new();
    let entries = current
        .as_array()
        .into_iter()
        .flatten()
        .chain(incoming.as_array().into_iter().flatten());

    for entry in entries {
        let value = entry.get("value").cloned().unwrap_or(Value::Null);
        let expiration = entry.get("expiration").and_then(Value::as_u64);
        match merged.iter_mut().find(|(existing, _)| *existing == value) {
            Some((_, kept)) => {
                *kept = match (*kept, expiration) {
                    (Some(a), Some(b)) => Some(a.max(b)),
                    _ => None,
                };
            }
            None => merged.push((value, expiration)),
        }
    }

    merged
        .into_iter()
        .map(|(value, expiration)| match expiration {
            Some(expiration) => json!({ "value": value, "expiration": expiration }),
            None => json!({ "value": value }),
        })
        .collect()
}

pub fn combine_overrides(overrides: Vec<Vec<Value>>) -> Option<Vec<Value>> {
    flatten(overrides)
}

pub fn combine_exclusions(exclusions: Vec<Vec<Value>>) -> Option<Vec<Value>> {
    flatten(exclusions)
}

pub fn combine_custom_rules(custom_rules: Vec<Vec<Value>>) -> Option<Vec<Value>> {
    flatten(custom_rules)
}

fn flatten(sources: Vec<Vec<Value>>) -> Option<Vec<Value>> {
    if sources.is_empty() {
        return None;
    }
    Some(sources.into_iter().flatten().collect())
}

/// Built-in processors, parsed once and memoized.
pub fn default_waf_processors(telemetry: &dyn TelemetrySink) -> Value {
    load_default(
        &DEFAULT_WAF_PROCESSORS,
        assets::WAF_PROCESSORS,
        "libddwaf rulemerger failed to parse default waf processors",
        telemetry,
    )
}

/// Built-in scanners, parsed once and memoized.
pub fn default_waf_scanners(telemetry: &dyn TelemetrySink) -> Value {
    load_default(
        &DEFAULT_WAF_SCANNERS,
        assets::WAF_SCANNERS,
        "libddwaf rulemerger failed to parse default waf scanners",
        telemetry,
    )
}

/// Parses `raw` into `cell` on first success; failures degrade to `[]` and are not memoized.
fn load_default(
    cell: &OnceLock<Value>,
    raw: &str,
    description: &str,
    telemetry: &dyn TelemetrySink,
) -> Value {
    if let Some(value) = cell.get() {
        return value.clone();
    }
    match serde_json::from_str::<Vec<Value>>(raw) {
        Ok(list) => cell.get_or_init(|| Value::Array(list)).clone(),
        Err(err) => {
            error!(error = %err, "appsec: {description}");
            telemetry.report(TelemetryLevel::Error, description, Some(&err));
            Value::Array(Vec::new())
        }
    }
}
