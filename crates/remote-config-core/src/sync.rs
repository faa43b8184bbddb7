//! Reconciliation of a backend response with the local repository.
//!
//! The backend answers every poll with the exhaustive list of paths the
//! client should hold, the signed targets manifest, and the payloads of the
//! files that changed. This module derives the insert/update/delete diff and
//! commits it as a single repository transaction.

use std::sync::Arc;

use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use serde::{Deserialize, Deserializer};
use thiserror::Error;
use tracing::debug;

use crate::content::{ContentList, TargetFile};
use crate::path::{ConfigPath, PathParseError};
use crate::repository::{ChangeSet, Repository, SetOptions};
use crate::targets::{TargetMap, TargetsError};

/// Errors aborting a sync; none of them leave a partial commit behind.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Path(#[from] PathParseError),
    #[error(transparent)]
    Targets(#[from] TargetsError),
    #[error("no target for path '{0}'")]
    MissingTarget(ConfigPath),
    #[error("no valid content for target at path '{0}'")]
    MissingContent(ConfigPath),
}

/// Configuration payload returned by the backend for one client.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigResponse {
    /// Base64-encoded signed targets manifest.
    #[serde(default, deserialize_with = "decode_manifest")]
    pub targets: Option<Vec<u8>>,
    #[serde(default)]
    pub target_files: Vec<TargetFile>,
    /// Exhaustive list of paths the client must hold.
    #[serde(default)]
    pub client_configs: Vec<String>,
}

fn decode_manifest<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer)?
        .map(|encoded| BASE64_STANDARD.decode(encoded).map_err(serde::de::Error::custom))
        .transpose()
}

impl ConfigResponse {
    /// An empty response means "nothing changed".
    pub fn is_empty(&self) -> bool {
        self.targets.as_ref().map_or(true, Vec::is_empty)
            && self.target_files.is_empty()
            && self.client_configs.is_empty()
    }
}

/// Applies `response` to `repository` and returns the resulting changes.
///
/// The outcome is recorded in the repository error state so the next client
/// state reports it upstream.
pub fn apply_config_response(
    repository: &Repository,
    response: ConfigResponse,
) -> Result<ChangeSet, SyncError> {
    let result = sync(repository, response);
    repository.record_error(result.as_ref().err().map(ToString::to_string));
    result
}

fn sync(repository: &Repository, response: ConfigResponse) -> Result<ChangeSet, SyncError> {
    if response.is_empty() {
        debug!("remote-config: empty response, leaving repository unchanged");
        return Ok(ChangeSet::default());
    }

    let paths = response
        .client_configs
        .iter()
        .map(|raw| ConfigPath::parse(raw))
        .collect::<Result<Vec<_>, _>>()?;
    let targets = TargetMap::parse_bytes(response.targets.as_deref().unwrap_or_default())?;
    let contents = ContentList::parse(response.target_files, targets.expires())?;

    repository.transaction(|current, txn| {
        let current_paths = current.paths();

        for stale in current_paths.iter().filter(|path| !paths.contains(path)) {
            txn.delete(stale.clone());
        }

        for path in &paths {
            let target = targets
                .get(path)
                .ok_or_else(|| SyncError::MissingTarget(path.clone()))?;

            let is_new = !current_paths.contains(path);
            let changed = !is_new && current.contents().find_content(path, target).is_none();
            if !is_new && !changed {
                continue;
            }

            let content = contents
                .find_content(path, target)
                .map(Arc::clone)
                .ok_or_else(|| SyncError::MissingContent(path.clone()))?;

            if is_new {
                txn.insert(path.clone(), target.clone(), content);
            } else {
                txn.update(path.clone(), target.clone(), content);
            }
        }

        txn.set(SetOptions {
            opaque_backend_state: targets.opaque_backend_state().map(str::to_string),
            targets_version: Some(targets.version()),
        });
        Ok(())
    })
}
