//! Parsing and validation of Remote Config target paths.
//!
//! Every configuration document is addressed by a path of the form
//! `datadog/<org_id>/<product>/<config_id>/config` (customer issued) or
//! `employee/<product>/<config_id>/config` (Datadog issued). Paths are parsed
//! once from wire data and never mutated afterwards.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Anchored grammar accepted for target paths.
const PATH_GRAMMAR: &str = r"^(?:datadog/([0-9]+)|employee)/([^/]+)/([^/]+)/(config)$";

/// Returns the compiled path grammar.
fn grammar() -> &'static Regex {
    static GRAMMAR: OnceLock<Regex> = OnceLock::new();
    GRAMMAR.get_or_init(|| Regex::new(PATH_GRAMMAR).expect("config path grammar should compile"))
}

/// Raised when a string does not match the target path grammar.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("could not parse remote config path '{0}'")]
pub struct PathParseError(pub String);

/// Namespace a configuration document was issued from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigPathSource {
    /// Customer configs: `datadog/<org_id>/...`.
    Datadog { org_id: u64 },
    /// Internal configs: `employee/...`.
    Employee,
}

impl fmt::Display for ConfigPathSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigPathSource::Datadog { org_id } => write!(f, "datadog/{org_id}"),
            ConfigPathSource::Employee => f.write_str("employee"),
        }
    }
}

/// Structured, validated view of a target path.
///
/// Equality, hashing and ordering are defined over the canonical string so
/// two paths compare equal exactly when they render identically.
#[derive(Debug, Clone)]
pub struct ConfigPath {
    source: ConfigPathSource,
    product: String,
    config_id: String,
    name: String,
    canonical: String,
}

impl ConfigPath {
    /// Parses and validates a raw target path.
    pub fn parse(raw: &str) -> Result<Self, PathParseError> {
        let captures = grammar()
            .captures(raw)
            .ok_or_else(|| PathParseError(raw.to_string()))?;

        let source = match captures.get(1) {
            Some(org) => ConfigPathSource::Datadog {
                org_id: org
                    .as_str()
                    .parse()
                    .map_err(|_| PathParseError(raw.to_string()))?,
            },
            None => ConfigPathSource::Employee,
        };
        // Groups 2..=4 are mandatory in the grammar.
        let group = |idx: usize| {
            captures
                .get(idx)
                .map(|m| m.as_str().to_string())
                .ok_or_else(|| PathParseError(raw.to_string()))
        };

        Ok(Self {
            source,
            product: group(2)?,
            config_id: group(3)?,
            name: group(4)?,
            canonical: raw.to_string(),
        })
    }

    /// Namespace of the path.
    pub fn source(&self) -> ConfigPathSource {
        self.source
    }

    /// Organisation id, present only for `datadog/<org_id>` paths.
    pub fn org_id(&self) -> Option<u64> {
        match self.source {
            ConfigPathSource::Datadog { org_id } => Some(org_id),
            ConfigPathSource::Employee => None,
        }
    }

    /// Product segment (e.g. `ASM_DD`).
    pub fn product(&self) -> &str {
        &self.product
    }

    /// Config id segment.
    pub fn config_id(&self) -> &str {
        &self.config_id
    }

    /// File name segment, always `config`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Canonical `source/product/config_id/name` form.
    pub fn as_str(&self) -> &str {
        &self.canonical
    }
}

impl fmt::Display for ConfigPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}

impl FromStr for ConfigPath {
    type Err = PathParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl PartialEq for ConfigPath {
    fn eq(&self, other: &Self) -> bool {
        self.canonical == other.canonical
    }
}

impl Eq for ConfigPath {}

impl Hash for ConfigPath {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical.hash(state);
    }
}

impl PartialOrd for ConfigPath {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ConfigPath {
    fn cmp(&self, other: &Self) -> Ordering {
        self.canonical.cmp(&other.canonical)
    }
}

impl Serialize for ConfigPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.canonical)
    }
}

impl<'de> Deserialize<'de> for ConfigPath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        ConfigPath::parse(&raw).map_err(serde::de::Error::custom)
    }
}
