//! Configuration documents delivered alongside the targets manifest.
//!
//! A [`Content`] pairs a [`ConfigPath`] with the raw bytes of the document.
//! Digests are computed lazily and memoized per algorithm, so verifying the
//! same document against several targets hashes it at most once per type.

#[cfg(test)]
use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, RwLock};

use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use time::OffsetDateTime;

use crate::digest::{hexdigest, DigestType};
use crate::path::{ConfigPath, PathParseError};
use crate::targets::Target;

#[cfg(test)]
thread_local! {
    static DIGEST_COMPUTATIONS: Cell<usize> = const { Cell::new(0) };
}

/// Wire representation of a target file: a path and its base64 payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetFile {
    pub path: String,
    #[serde(serialize_with = "encode_raw", deserialize_with = "decode_raw")]
    pub raw: Vec<u8>,
}

fn encode_raw<S>(raw: &[u8], serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&BASE64_STANDARD.encode(raw))
}

fn decode_raw<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
where
    D: Deserializer<'de>,
{
    let encoded = String::deserialize(deserializer)?;
    BASE64_STANDARD
        .decode(encoded)
        .map_err(serde::de::Error::custom)
}

/// Whether a product acknowledged the configuration it received.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(into = "u8")]
pub enum ApplyState {
    #[default]
    Unacknowledged,
    Acknowledged,
    Error,
}

impl From<ApplyState> for u8 {
    /// Numeric encoding expected by the backend (`1`, `2`, `3`).
    fn from(state: ApplyState) -> Self {
        match state {
            ApplyState::Unacknowledged => 1,
            ApplyState::Acknowledged => 2,
            ApplyState::Error => 3,
        }
    }
}

#[derive(Debug, Default)]
struct ApplyStatus {
    state: ApplyState,
    error: Option<String>,
}

/// A configuration document and its lazily computed digests.
#[derive(Debug)]
pub struct Content {
    path: ConfigPath,
    data: Vec<u8>,
    expires: Option<OffsetDateTime>,
    sha256: OnceLock<String>,
    sha512: OnceLock<String>,
    version: AtomicU64,
    apply: RwLock<ApplyStatus>,
}

impl Content {
    /// Builds a content from a wire target file.
    ///
    /// This is the only constructor, so every content carries a validated path.
    pub fn parse(file: TargetFile, expires: Option<OffsetDateTime>) -> Result<Self, PathParseError> {
        Ok(Self {
            path: ConfigPath::parse(&file.path)?,
            data: file.raw,
            expires,
            sha256: OnceLock::new(),
            sha512: OnceLock::new(),
            version: AtomicU64::new(0),
            apply: RwLock::new(ApplyStatus::default()),
        })
    }

    pub fn path(&self) -> &ConfigPath {
        &self.path
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn expires(&self) -> Option<OffsetDateTime> {
        self.expires
    }

    /// Returns the hex digest for `kind`, computing it on first use.
    pub fn hexdigest(&self, kind: DigestType) -> &str {
        let cell = match kind {
            DigestType::Sha256 => &self.sha256,
            DigestType::Sha512 => &self.sha512,
        };
        cell.get_or_init(|| {
            #[cfg(test)]
            DIGEST_COMPUTATIONS.with(|count| count.set(count.get() + 1));
            hexdigest(kind, &self.data)
        })
    }

    /// Size of the document in bytes.
    pub fn length(&self) -> usize {
        self.data.len()
    }

    /// Target version this content was committed with (0 until committed).
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Relaxed)
    }

    pub fn set_version(&self, version: u64) {
        self.version.store(version, Ordering::Relaxed);
    }

    /// Marks the content as successfully applied by its product.
    pub fn applied(&self) {
        let mut status = self.apply.write().expect("content apply lock poisoned");
        status.state = ApplyState::Acknowledged;
        status.error = None;
    }

    /// Marks the content as rejected by its product.
    pub fn errored(&self, message: impl Into<String>) {
        let mut status = self.apply.write().expect("content apply lock poisoned");
        status.state = ApplyState::Error;
        status.error = Some(message.into());
    }

    pub fn apply_state(&self) -> ApplyState {
        self.apply.read().expect("content apply lock poisoned").state
    }

    pub fn apply_error(&self) -> Option<String> {
        self.apply
            .read()
            .expect("content apply lock poisoned")
            .error
            .clone()
    }
}

impl PartialEq for Content {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path && self.data == other.data
    }
}

/// Ordered collection of contents, possibly holding several entries per path.
#[derive(Debug, Clone, Default)]
pub struct ContentList(Vec<Arc<Content>>);

impl ContentList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses every wire target file, failing on the first invalid path.
    pub fn parse(
        files: Vec<TargetFile>,
        expires: Option<OffsetDateTime>,
    ) -> Result<Self, PathParseError> {
        files
            .into_iter()
            .map(|file| Content::parse(file, expires).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()
            .map(Self)
    }

    /// Returns the first content at `path` whose digests verify against `target`.
    ///
    /// This is the only integrity-checked lookup.
    pub fn find_content(&self, path: &ConfigPath, target: &Target) -> Option<&Arc<Content>> {
        self.0
            .iter()
            .find(|content| content.path() == path && target.check(content))
    }

    /// Returns the first content at `path` without verifying it.
    pub fn get(&self, path: &ConfigPath) -> Option<&Arc<Content>> {
        self.0.iter().find(|content| content.path() == path)
    }

    pub fn push(&mut self, content: Arc<Content>) {
        self.0.push(content);
    }

    /// Replaces the content stored at the same path, returning the previous one.
    ///
    /// Returns `None` and leaves the list untouched when the path is absent.
    pub fn replace(&mut self, content: Arc<Content>) -> Option<Arc<Content>> {
        let slot = self
            .0
            .iter_mut()
            .find(|existing| existing.path() == content.path())?;
        Some(std::mem::replace(slot, content))
    }

    /// Removes every content stored at `path`, returning the first removed entry.
    pub fn delete(&mut self, path: &ConfigPath) -> Option<Arc<Content>> {
        let first = self.get(path).cloned();
        self.0.retain(|content| content.path() != path);
        first
    }

    /// Distinct paths, in order of first occurrence.
    pub fn paths(&self) -> Vec<ConfigPath> {
        let mut paths: Vec<ConfigPath> = Vec::with_capacity(self.0.len());
        for content in &self.0 {
            if !paths.contains(content.path()) {
                paths.push(content.path().clone());
            }
        }
        paths
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Content>> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
