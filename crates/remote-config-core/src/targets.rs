//! Parsing of the signed targets manifest.
//!
//! The manifest advertises, for every configuration path, the digests, length
//! and version the delivered content is expected to have. Centralising the
//! serde shapes guarantees that the repository and the sync logic observe the
//! same view of the metadata.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::content::Content;
use crate::digest::{DigestError, DigestList};
use crate::path::{ConfigPath, PathParseError};

/// Errors raised while interpreting a targets manifest.
#[derive(Debug, Error)]
pub enum TargetsError {
    #[error("malformed targets metadata: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error(transparent)]
    Path(#[from] PathParseError),
    #[error(transparent)]
    Digest(#[from] DigestError),
    #[error("invalid expiration timestamp: {0}")]
    Expires(#[from] time::error::Parse),
}

/// Deserialised representation of a targets document.
#[derive(Debug, Deserialize)]
struct TargetsDocument {
    signed: TargetsSigned,
}

/// Signed payload containing the per-target metadata.
#[derive(Debug, Deserialize)]
struct TargetsSigned {
    version: u64,
    targets: BTreeMap<String, TargetDescription>,
    #[serde(default)]
    custom: Option<TargetsSignedCustom>,
    #[serde(default)]
    expires: Option<String>,
}

/// Top-level custom metadata embedded in a targets document.
#[derive(Debug, Deserialize, Default)]
struct TargetsSignedCustom {
    #[serde(default)]
    opaque_backend_state: Option<String>,
}

/// Metadata describing an individual target entry.
#[derive(Debug, Deserialize)]
struct TargetDescription {
    length: u64,
    hashes: BTreeMap<String, String>,
    custom: TargetCustom,
}

/// Per-target custom section; only the version is interpreted.
#[derive(Debug, Deserialize)]
struct TargetCustom {
    v: u64,
}

/// Expected metadata for one configuration path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    length: u64,
    digests: DigestList,
    version: u64,
}

impl Target {
    pub fn new(length: u64, digests: DigestList, version: u64) -> Self {
        Self {
            length,
            digests,
            version,
        }
    }

    /// Parses a single target descriptor (`length`, `hashes` and `custom.v` are required).
    pub fn parse(raw: &Value) -> Result<Self, TargetsError> {
        let description = TargetDescription::deserialize(raw)?;
        Self::from_description(description)
    }

    fn from_description(description: TargetDescription) -> Result<Self, TargetsError> {
        Ok(Self {
            length: description.length,
            digests: DigestList::parse(&description.hashes)?,
            version: description.custom.v,
        })
    }

    /// Advertised byte length.
    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn digests(&self) -> &DigestList {
        &self.digests
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Verifies the content digests. The advertised length is not enforced here.
    pub fn check(&self, content: &Content) -> bool {
        self.digests.check(content)
    }

    /// Returns `true` when the content size equals the advertised length.
    pub fn length_matches(&self, content: &Content) -> bool {
        content.length() as u64 == self.length
    }
}

/// Targets manifest keyed by configuration path.
#[derive(Debug, Clone, Default)]
pub struct TargetMap {
    targets: BTreeMap<ConfigPath, Target>,
    opaque_backend_state: Option<String>,
    version: u64,
    expires: Option<OffsetDateTime>,
}

impl TargetMap {
    /// Parses a manifest from its JSON value.
    pub fn parse(raw: &Value) -> Result<Self, TargetsError> {
        let document = TargetsDocument::deserialize(raw)?;
        Self::from_document(document)
    }

    /// Parses a manifest from raw JSON bytes.
    pub fn parse_bytes(bytes: &[u8]) -> Result<Self, TargetsError> {
        let document: TargetsDocument = serde_json::from_slice(bytes)?;
        Self::from_document(document)
    }

    fn from_document(document: TargetsDocument) -> Result<Self, TargetsError> {
        let signed = document.signed;
        let targets = signed
            .targets
            .into_iter()
            .map(|(path, description)| {
                Ok((ConfigPath::parse(&path)?, Target::from_description(description)?))
            })
            .collect::<Result<BTreeMap<_, _>, TargetsError>>()?;
        let expires = signed
            .expires
            .map(|raw| OffsetDateTime::parse(&raw, &Rfc3339))
            .transpose()?;

        Ok(Self {
            targets,
            opaque_backend_state: signed.custom.and_then(|custom| custom.opaque_backend_state),
            version: signed.version,
            expires,
        })
    }

    pub fn get(&self, path: &ConfigPath) -> Option<&Target> {
        self.targets.get(path)
    }

    pub fn opaque_backend_state(&self) -> Option<&str> {
        self.opaque_backend_state.as_deref()
    }

    /// Manifest version (`signed.version`).
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn expires(&self) -> Option<OffsetDateTime> {
        self.expires
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ConfigPath, &Target)> {
        self.targets.iter()
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}
