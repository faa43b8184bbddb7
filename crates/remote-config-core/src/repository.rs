//! Versioned store of applied configuration documents.
//!
//! The repository is mutated exclusively through [`Transaction`]s. A commit
//! applies the recorded operations to a private copy of the current state and
//! then publishes it by swapping a single `Arc`, so readers holding a
//! [`RepositorySnapshot`] never observe a partially applied transaction.

use std::sync::{Arc, Mutex, RwLock};

use serde::Serialize;
use tracing::{debug, warn};

use crate::content::{ApplyState, Content, ContentList};
use crate::digest::DigestType;
use crate::path::ConfigPath;
use crate::targets::Target;

/// Root version of a repository that has not verified any root yet.
pub const UNVERIFIED_ROOT_VERSION: u64 = 1;

/// Immutable view of the repository at a point in time.
#[derive(Debug, Clone)]
pub struct RepositorySnapshot {
    contents: ContentList,
    opaque_backend_state: Option<String>,
    root_version: u64,
    targets_version: u64,
}

impl Default for RepositorySnapshot {
    fn default() -> Self {
        Self {
            contents: ContentList::new(),
            opaque_backend_state: None,
            root_version: UNVERIFIED_ROOT_VERSION,
            targets_version: 0,
        }
    }
}

impl RepositorySnapshot {
    pub fn contents(&self) -> &ContentList {
        &self.contents
    }

    /// Unverified lookup of the content stored at `path`.
    pub fn get(&self, path: &ConfigPath) -> Option<&Arc<Content>> {
        self.contents.get(path)
    }

    /// Paths currently holding content.
    pub fn paths(&self) -> Vec<ConfigPath> {
        self.contents.paths()
    }

    pub fn opaque_backend_state(&self) -> Option<&str> {
        self.opaque_backend_state.as_deref()
    }

    pub fn root_version(&self) -> u64 {
        self.root_version
    }

    pub fn targets_version(&self) -> u64 {
        self.targets_version
    }
}

/// Partial update of the repository metadata. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetOptions {
    pub opaque_backend_state: Option<String>,
    pub targets_version: Option<u64>,
}

/// A pending, not yet applied operation.
#[derive(Debug, Clone)]
enum Operation {
    Insert {
        path: ConfigPath,
        target: Target,
        content: Arc<Content>,
    },
    Update {
        path: ConfigPath,
        target: Target,
        content: Arc<Content>,
    },
    Delete {
        path: ConfigPath,
    },
    Set(SetOptions),
}

/// Ordered, append-only list of operations to apply on commit.
#[derive(Debug, Default)]
pub struct Transaction {
    operations: Vec<Operation>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `content` at `path` unless the path already holds content.
    pub fn insert(&mut self, path: ConfigPath, target: Target, content: Arc<Content>) {
        self.operations.push(Operation::Insert {
            path,
            target,
            content,
        });
    }

    /// Replaces the content at `path`; does nothing when the path is absent.
    pub fn update(&mut self, path: ConfigPath, target: Target, content: Arc<Content>) {
        self.operations.push(Operation::Update {
            path,
            target,
            content,
        });
    }

    /// Removes every content stored at `path`.
    pub fn delete(&mut self, path: ConfigPath) {
        self.operations.push(Operation::Delete { path });
    }

    /// Overwrites the supplied metadata fields.
    pub fn set(&mut self, options: SetOptions) {
        self.operations.push(Operation::Set(options));
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

/// Effect of a committed content operation.
#[derive(Debug, Clone)]
pub enum Change {
    Inserted {
        path: ConfigPath,
        target: Target,
        content: Arc<Content>,
    },
    Updated {
        path: ConfigPath,
        target: Target,
        content: Arc<Content>,
        previous: Arc<Content>,
    },
    Deleted {
        path: ConfigPath,
        previous: Arc<Content>,
    },
}

impl Change {
    pub fn path(&self) -> &ConfigPath {
        match self {
            Change::Inserted { path, .. }
            | Change::Updated { path, .. }
            | Change::Deleted { path, .. } => path,
        }
    }

    /// Content now stored at the path, `None` for deletions.
    pub fn content(&self) -> Option<&Arc<Content>> {
        match self {
            Change::Inserted { content, .. } | Change::Updated { content, .. } => Some(content),
            Change::Deleted { .. } => None,
        }
    }

    /// Content that was stored before the change, if any.
    pub fn previous(&self) -> Option<&Arc<Content>> {
        match self {
            Change::Updated { previous, .. } | Change::Deleted { previous, .. } => Some(previous),
            Change::Inserted { .. } => None,
        }
    }
}

/// Ordered list of changes produced by one commit.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet(Vec<Change>);

impl ChangeSet {
    pub fn iter(&self) -> impl Iterator<Item = &Change> {
        self.0.iter()
    }

    /// Paths touched by the commit, in order.
    pub fn paths(&self) -> Vec<&ConfigPath> {
        self.0.iter().map(Change::path).collect()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn first(&self) -> Option<&Change> {
        self.0.first()
    }
}

impl<'a> IntoIterator for &'a ChangeSet {
    type Item = &'a Change;
    type IntoIter = std::slice::Iter<'a, Change>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Per-config acknowledgement reported upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfigState {
    pub id: String,
    pub version: u64,
    pub product: String,
    pub apply_state: ApplyState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub apply_error: Option<String>,
}

/// Hash of a cached target file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetFileHash {
    pub algorithm: String,
    pub hash: String,
}

/// Metadata describing a target file the client already holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CachedTargetFile {
    pub path: String,
    pub length: usize,
    pub hashes: Vec<TargetFileHash>,
}

/// Client state reported back to the configuration backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepositoryState {
    pub root_version: u64,
    pub targets_version: u64,
    #[serde(rename = "backend_client_state")]
    pub opaque_backend_state: Option<String>,
    pub config_states: Vec<ConfigState>,
    pub has_error: bool,
    pub error: String,
    #[serde(skip)]
    pub cached_target_files: Vec<CachedTargetFile>,
}

/// Authoritative, versioned store of configuration contents.
#[derive(Debug)]
pub struct Repository {
    current: RwLock<Arc<RepositorySnapshot>>,
    writer: Mutex<()>,
    last_error: RwLock<Option<String>>,
}

impl Default for Repository {
    fn default() -> Self {
        Self::new()
    }
}

impl Repository {
    /// Creates an empty repository with an unverified root.
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(RepositorySnapshot::default())),
            writer: Mutex::new(()),
            last_error: RwLock::new(None),
        }
    }

    /// Returns the currently published state.
    pub fn snapshot(&self) -> Arc<RepositorySnapshot> {
        self.current
            .read()
            .expect("repository snapshot lock poisoned")
            .clone()
    }

    /// Builds a transaction with `f` and commits it when `f` succeeds.
    ///
    /// Transactions are serialized: `f` observes the state every earlier
    /// transaction published. When `f` fails nothing is applied.
    pub fn transaction<F, E>(&self, f: F) -> Result<ChangeSet, E>
    where
        F: FnOnce(&RepositorySnapshot, &mut Transaction) -> Result<(), E>,
    {
        let _writer = self.writer.lock().expect("repository writer lock poisoned");
        let base = self.snapshot();
        let mut transaction = Transaction::new();
        f(&base, &mut transaction)?;
        Ok(self.apply(transaction))
    }

    /// Applies every operation of `transaction` in append order.
    pub fn commit(&self, transaction: Transaction) -> ChangeSet {
        let _writer = self.writer.lock().expect("repository writer lock poisoned");
        self.apply(transaction)
    }

    /// Applies operations to a copy of the current state and publishes it.
    ///
    /// Callers must hold the writer lock.
    fn apply(&self, transaction: Transaction) -> ChangeSet {
        let mut next = RepositorySnapshot::clone(&self.snapshot());
        let mut changes = Vec::new();

        for operation in transaction.operations {
            match operation {
                Operation::Insert {
                    path,
                    target,
                    content,
                } => {
                    if next.contents.get(&path).is_some() {
                        debug!(path = %path, "remote-config: insert skipped, path already present");
                        continue;
                    }
                    content.set_version(target.version());
                    next.contents.push(content.clone());
                    changes.push(Change::Inserted {
                        path,
                        target,
                        content,
                    });
                }
                Operation::Update {
                    path,
                    target,
                    content,
                } => {
                    match next.contents.replace(content.clone()) {
                        Some(previous) => {
                            content.set_version(target.version());
                            changes.push(Change::Updated {
                                path,
                                target,
                                content,
                                previous,
                            });
                        }
                        None => {
                            warn!(path = %path, "remote-config: update ignored, path not present");
                        }
                    }
                }
                Operation::Delete { path } => {
                    if let Some(previous) = next.contents.delete(&path) {
                        changes.push(Change::Deleted { path, previous });
                    }
                }
                Operation::Set(options) => {
                    if let Some(state) = options.opaque_backend_state {
                        next.opaque_backend_state = Some(state);
                    }
                    if let Some(version) = options.targets_version {
                        next.targets_version = version;
                    }
                }
            }
        }

        *self
            .current
            .write()
            .expect("repository snapshot lock poisoned") = Arc::new(next);
        debug!(
            changes = changes.len(),
            "remote-config: committed repository transaction"
        );
        ChangeSet(changes)
    }

    /// Records (or clears) the error reported with the next state.
    pub fn record_error(&self, error: Option<String>) {
        *self
            .last_error
            .write()
            .expect("repository error lock poisoned") = error;
    }

    /// Builds the client state to report upstream.
    pub fn state(&self) -> RepositoryState {
        let snapshot = self.snapshot();
        let error = self
            .last_error
            .read()
            .expect("repository error lock poisoned")
            .clone();

        let config_states = snapshot
            .contents
            .iter()
            .map(|content| ConfigState {
                id: content.path().config_id().to_string(),
                version: content.version(),
                product: content.path().product().to_string(),
                apply_state: content.apply_state(),
                apply_error: content.apply_error(),
            })
            .collect();
        let cached_target_files = snapshot
            .contents
            .iter()
            .map(|content| CachedTargetFile {
                path: content.path().to_string(),
                length: content.length(),
                hashes: vec![TargetFileHash {
                    algorithm: DigestType::Sha256.to_string(),
                    hash: content.hexdigest(DigestType::Sha256).to_string(),
                }],
            })
            .collect();

        RepositoryState {
            root_version: snapshot.root_version,
            targets_version: snapshot.targets_version,
            opaque_backend_state: snapshot.opaque_backend_state.clone(),
            config_states,
            has_error: error.is_some(),
            error: error.unwrap_or_default(),
            cached_target_files,
        }
    }
}
