//! Typed content digests used to verify target files.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use hex::encode as hex_encode;
use sha2::{Digest as _, Sha256, Sha512};
use thiserror::Error;

use crate::content::Content;

/// Errors emitted while interpreting digest metadata.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DigestError {
    #[error("invalid hash type '{0}'")]
    InvalidHashType(String),
}

/// Hash algorithms accepted in target metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DigestType {
    Sha256,
    Sha512,
}

impl DigestType {
    /// Wire name of the algorithm.
    pub fn as_str(&self) -> &'static str {
        match self {
            DigestType::Sha256 => "sha256",
            DigestType::Sha512 => "sha512",
        }
    }
}

impl fmt::Display for DigestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DigestType {
    type Err = DigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sha256" => Ok(DigestType::Sha256),
            "sha512" => Ok(DigestType::Sha512),
            other => Err(DigestError::InvalidHashType(other.to_string())),
        }
    }
}

/// Computes the lowercase hex digest of `data`.
pub fn hexdigest(kind: DigestType, data: &[u8]) -> String {
    match kind {
        DigestType::Sha256 => {
            let mut hasher = Sha256::new();
            hasher.update(data);
            hex_encode(hasher.finalize())
        }
        DigestType::Sha512 => {
            let mut hasher = Sha512::new();
            hasher.update(data);
            hex_encode(hasher.finalize())
        }
    }
}

/// Expected digest for one algorithm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Digest {
    kind: DigestType,
    hexdigest: String,
}

impl Digest {
    pub fn new(kind: DigestType, hexdigest: impl Into<String>) -> Self {
        Self {
            kind,
            hexdigest: hexdigest.into(),
        }
    }

    pub fn kind(&self) -> DigestType {
        self.kind
    }

    pub fn hexdigest(&self) -> &str {
        &self.hexdigest
    }

    /// Returns `true` when the content hashes to the expected value.
    pub fn check(&self, content: &Content) -> bool {
        content.hexdigest(self.kind) == self.hexdigest
    }
}

/// Every digest advertised for a single target.
///
/// A document must independently satisfy each listed algorithm. An empty list
/// carries no constraint and therefore checks successfully.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DigestList(Vec<Digest>);

impl DigestList {
    pub fn new(digests: Vec<Digest>) -> Self {
        Self(digests)
    }

    /// Builds the list from a wire `hashes` map, rejecting unknown algorithms.
    pub fn parse(hashes: &BTreeMap<String, String>) -> Result<Self, DigestError> {
        hashes
            .iter()
            .map(|(kind, value)| Ok(Digest::new(kind.parse()?, value.clone())))
            .collect::<Result<Vec<_>, _>>()
            .map(Self)
    }

    pub fn check(&self, content: &Content) -> bool {
        self.0.iter().all(|digest| digest.check(content))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Digest> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::TargetFile;

    const HELLO_SHA256: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    fn content(data: &[u8]) -> Content {
        Content::parse(
            TargetFile {
                path: "employee/ASM_DD/rules/config".to_string(),
                raw: data.to_vec(),
            },
            None,
        )
        .unwrap()
    }

    /// Digests match the well-known reference values.
    #[test]
    fn hexdigest_matches_reference_values() {
        assert_eq!(hexdigest(DigestType::Sha256, b"hello"), HELLO_SHA256);
        assert_eq!(
            hexdigest(DigestType::Sha256, b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(
            hexdigest(DigestType::Sha512, b"hello"),
            "9b71d224bd62f3785d96d46ad3ea3d73319bfbc2890caadae2dff72519673ca72323c3d99ba5c11d7c7acc6e14b8c5da0c4663475c2e5c3adef46f73bcdec043"
        );
    }

    /// Only the two supported algorithms parse.
    #[test]
    fn rejects_unknown_hash_types() {
        assert_eq!("sha512".parse(), Ok(DigestType::Sha512));
        assert_eq!(
            "md5".parse::<DigestType>(),
            Err(DigestError::InvalidHashType("md5".to_string()))
        );
    }

    /// A digest checks only the content it was computed from.
    #[test]
    fn digest_check_compares_content_hash() {
        let digest = Digest::new(DigestType::Sha256, HELLO_SHA256);
        assert!(digest.check(&content(b"hello")));
        assert!(!digest.check(&content(b"hello world")));
    }

    /// One mismatching digest fails the whole list.
    #[test]
    fn digest_list_requires_every_digest() {
        let list = DigestList::new(vec![
            Digest::new(DigestType::Sha256, HELLO_SHA256),
            Digest::new(DigestType::Sha512, "00"),
        ]);
        assert!(!list.check(&content(b"hello")));

        let list = DigestList::new(vec![
            Digest::new(DigestType::Sha256, HELLO_SHA256),
            Digest::new(DigestType::Sha512, hexdigest(DigestType::Sha512, b"hello")),
        ]);
        assert!(list.check(&content(b"hello")));
    }

    /// An empty list carries no constraint.
    #[test]
    fn empty_digest_list_checks() {
        assert!(DigestList::default().check(&content(b"anything")));
    }

    /// Unknown algorithms in the wire map fail parsing.
    #[test]
    fn parse_rejects_unknown_algorithms() {
        let mut hashes = BTreeMap::new();
        hashes.insert("sha256".to_string(), HELLO_SHA256.to_string());
        assert_eq!(DigestList::parse(&hashes).unwrap().len(), 1);
        hashes.insert("crc32".to_string(), "abcd".to_string());
        assert_eq!(
            DigestList::parse(&hashes),
            Err(DigestError::InvalidHashType("crc32".to_string()))
        );
    }
}
