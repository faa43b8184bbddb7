// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Rebuilds the AppSec processor from remote configuration.

use std::sync::{Arc, RwLock};

use remote_config_core::dispatcher::{ProductMatcher, Receiver};
use remote_config_core::repository::RepositorySnapshot;
use remote_config_core::telemetry::TelemetrySink;
use remote_config_core::{Capabilities, Content};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::config::AppSecSettings;
use crate::engine::Engine;
use crate::processor::Processor;
use crate::rule_loader::load_rules;
use crate::rule_merger::{merge, MergeInput, RuleMergeError};

pub const ASM_DD: &str = "ASM_DD";
pub const ASM: &str = "ASM";
pub const ASM_DATA: &str = "ASM_DATA";
pub const ASM_FEATURES: &str = "ASM_FEATURES";

/// Products AppSec subscribes to.
pub const PRODUCTS: [&str; 4] = [ASM_DD, ASM, ASM_DATA, ASM_FEATURES];

/// Remote activation through `ASM_FEATURES`.
pub const CAP_ASM_ACTIVATION: Capabilities = Capabilities::bit(1);
/// IP denylists from `ASM_DATA`.
pub const CAP_ASM_IP_BLOCKING: Capabilities = Capabilities::bit(2);
/// Base rules from `ASM_DD`.
pub const CAP_ASM_DD_RULES: Capabilities = Capabilities::bit(3);
/// Passlist exclusions from `ASM`.
pub const CAP_ASM_EXCLUSIONS: Capabilities = Capabilities::bit(4);
pub const CAP_ASM_REQUEST_BLOCKING: Capabilities = Capabilities::bit(5);
pub const CAP_ASM_RESPONSE_BLOCKING: Capabilities = Capabilities::bit(6);
/// User denylists from `ASM_DATA`.
pub const CAP_ASM_USER_BLOCKING: Capabilities = Capabilities::bit(7);
pub const CAP_ASM_CUSTOM_RULES: Capabilities = Capabilities::bit(8);
/// Custom status code or redirect when blocking.
pub const CAP_ASM_CUSTOM_BLOCKING_RESPONSE: Capabilities = Capabilities::bit(9);

/// Capabilities AppSec advertises alongside [`PRODUCTS`].
pub const CAPABILITIES: Capabilities = CAP_ASM_IP_BLOCKING
    .union(CAP_ASM_USER_BLOCKING)
    .union(CAP_ASM_CUSTOM_RULES)
    .union(CAP_ASM_EXCLUSIONS)
    .union(CAP_ASM_REQUEST_BLOCKING)
    .union(CAP_ASM_RESPONSE_BLOCKING)
    .union(CAP_ASM_DD_RULES);

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("appsec: no ruleset available")]
    NoRules,
    #[error(transparent)]
    Merge(#[from] RuleMergeError),
}

/// Builds the merged ruleset described by the AppSec contents of `snapshot`.
///
/// `ASM_DD` contents replace the base rules, which otherwise come from
/// `settings`. Contents that cannot be parsed, or whose merge fails, are
/// marked errored; the others are marked applied.
pub fn ruleset_from_snapshot(
    snapshot: &RepositorySnapshot,
    settings: &AppSecSettings,
    telemetry: &dyn TelemetrySink,
) -> Result<Value, RemoteError> {
    let mut input = MergeInput::new(Vec::new());
    let mut used: Vec<&Arc<Content>> = Vec::new();

    for content in snapshot.contents().iter() {
        let product = content.path().product();
        if ![ASM_DD, ASM, ASM_DATA].contains(&product) {
            continue;
        }
        let document: Value = match serde_json::from_slice(content.data()) {
            Ok(document) => document,
            Err(err) => {
                warn!(path = %content.path(), error = %err, "appsec: invalid remote configuration");
                content.errored(err.to_string());
                continue;
            }
        };
        match product {
            ASM_DD => input.rules.push(document),
            ASM_DATA => input.data.extend(array_field(&document, "rules_data")),
            _ => {
                input.overrides.extend(array_field(&document, "rules_override"));
                input.exclusions.extend(array_field(&document, "exclusions"));
                input.custom_rules.extend(array_field(&document, "custom_rules"));
            }
        }
        used.push(content);
    }

    if input.rules.is_empty() {
        let mut ruleset = settings.ruleset();
        let rules = load_rules(&mut ruleset, telemetry).ok_or(RemoteError::NoRules)?;
        input.rules.push(rules);
    }

    match merge(input, telemetry) {
        Ok(merged) => {
            used.iter().for_each(|content| content.applied());
            Ok(merged)
        }
        Err(err) => {
            for content in &used {
                content.errored(err.to_string());
            }
            Err(err.into())
        }
    }
}

/// Reads the `asm.enabled` toggle from the `ASM_FEATURES` content, if any.
pub fn activation_from_snapshot(snapshot: &RepositorySnapshot) -> Option<bool> {
    let content = snapshot
        .contents()
        .iter()
        .find(|content| content.path().product() == ASM_FEATURES)?;
    let enabled = serde_json::from_slice::<Value>(content.data())
        .ok()
        .and_then(|document| document.get("asm")?.get("enabled")?.as_bool());
    match enabled {
        Some(_) => content.applied(),
        None => content.errored("missing asm.enabled"),
    }
    enabled
}

fn array_field(document: &Value, key: &str) -> Option<Vec<Value>> {
    document.get(key).and_then(Value::as_array).cloned()
}

/// Owns the live [`Processor`] and swaps it when the ruleset changes.
///
/// Request threads clone the current processor out of the lock, so a swap
/// never affects contexts already in flight.
pub struct AppSecComponent {
    settings: AppSecSettings,
    engine: Arc<dyn Engine>,
    telemetry: Arc<dyn TelemetrySink>,
    processor: RwLock<Arc<Processor>>,
    remote_activation: RwLock<Option<bool>>,
}

impl AppSecComponent {
    /// Compiles the ruleset selected by `settings`.
    pub fn build(
        settings: AppSecSettings,
        engine: Arc<dyn Engine>,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Result<Self, RemoteError> {
        let mut ruleset = settings.ruleset();
        let rules = load_rules(&mut ruleset, telemetry.as_ref()).ok_or(RemoteError::NoRules)?;
        let merged = merge(MergeInput::new(vec![rules]), telemetry.as_ref())?;
        let processor = Processor::new(&merged, engine.as_ref(), &settings, Arc::clone(&telemetry));
        Ok(Self {
            settings,
            engine,
            telemetry,
            processor: RwLock::new(Arc::new(processor)),
            remote_activation: RwLock::new(None),
        })
    }

    pub fn settings(&self) -> &AppSecSettings {
        &self.settings
    }

    pub fn processor(&self) -> Arc<Processor> {
        self.processor
            .read()
            .expect("appsec processor lock poisoned")
            .clone()
    }

    /// Whether protection is on, with remote activation taking precedence.
    pub fn enabled(&self) -> bool {
        self.remote_activation
            .read()
            .expect("appsec activation lock poisoned")
            .unwrap_or(self.settings.enabled)
    }

    /// Compiles `ruleset` and installs it if it is usable.
    ///
    /// Returns `false` and keeps the current processor when compilation fails.
    pub fn reconfigure(&self, ruleset: &Value) -> bool {
        let current = self.processor();
        let candidate = Processor::new(
            ruleset,
            self.engine.as_ref(),
            &self.settings,
            Arc::clone(&self.telemetry),
        )
        .with_route_sampler(current.route_sampler());
        if !candidate.ready() {
            warn!("appsec: keeping previous ruleset after failed reconfiguration");
            return false;
        }
        *self
            .processor
            .write()
            .expect("appsec processor lock poisoned") = Arc::new(candidate);
        debug!("appsec: processor reconfigured");
        true
    }

    /// Applies the AppSec contents of `snapshot`.
    ///
    /// Without an `ASM_FEATURES` toggle the configured setting applies again.
    pub fn reconfigure_from(&self, snapshot: &RepositorySnapshot) -> Result<bool, RemoteError> {
        *self
            .remote_activation
            .write()
            .expect("appsec activation lock poisoned") = activation_from_snapshot(snapshot);
        let ruleset = ruleset_from_snapshot(snapshot, &self.settings, self.telemetry.as_ref())?;
        Ok(self.reconfigure(&ruleset))
    }

    /// Dispatcher receiver reconfiguring this component on AppSec changes.
    ///
    /// The receiver holds a weak reference and does nothing once the
    /// component is dropped.
    pub fn receiver(self: &Arc<Self>) -> Receiver {
        let component = Arc::downgrade(self);
        Receiver::new(ProductMatcher::products(PRODUCTS), move |snapshot, changes| {
            let Some(component) = component.upgrade() else {
                return;
            };
            debug!(changes = changes.len(), "appsec: remote configuration changed");
            if let Err(err) = component.reconfigure_from(snapshot) {
                error!(error = %err, "appsec: remote reconfiguration failed");
            }
        })
    }
}

impl std::fmt::Debug for AppSecComponent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppSecComponent")
            .field("settings", &self.settings)
            .field("processor", &self.processor())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;

    use remote_config_core::telemetry::NoopTelemetry;
    use remote_config_core::{
        ApplyState, ChangeSet, ConfigPath, DigestList, Repository, Target, TargetFile,
    };
    use serde_json::json;

    use super::*;
    use crate::engine::EngineError;
    use crate::processor::test_support::ScriptedEngine;

    const RULES_PATH: &str = "datadog/603646/ASM_DD/recommended/config";
    const DATA_PATH: &str = "datadog/603646/ASM_DATA/blocked_ips/config";
    const ASM_PATH: &str = "datadog/603646/ASM/exclusions/config";
    const FEATURES_PATH: &str = "datadog/603646/ASM_FEATURES/asm_features_activation/config";

    fn insert(repository: &Repository, raw_path: &str, document: &[u8]) -> ChangeSet {
        let content = Content::parse(
            TargetFile {
                path: raw_path.to_string(),
                raw: document.to_vec(),
            },
            None,
        )
        .unwrap();
        repository
            .transaction(|_, txn| {
                txn.insert(
                    ConfigPath::parse(raw_path).unwrap(),
                    Target::new(document.len() as u64, DigestList::new(Vec::new()), 1),
                    Arc::new(content),
                );
                Ok::<_, Infallible>(())
            })
            .unwrap()
    }

    fn remote_rules() -> Value {
        json!({ "version": "2.2", "rules": [{ "id": "remote-001" }] })
    }

    /// Remote rules, data and exclusions are merged together.
    #[test]
    fn merges_remote_documents() {
        let repository = Repository::new();
        insert(&repository, RULES_PATH, remote_rules().to_string().as_bytes());
        insert(
            &repository,
            DATA_PATH,
            json!({ "rules_data": [{
                "id": "blocked_ips",
                "type": "data_with_expiration",
                "data": [{ "value": "1.2.3.4", "expiration": 100 }],
            }] })
            .to_string()
            .as_bytes(),
        );
        insert(
            &repository,
            ASM_PATH,
            json!({ "exclusions": [{ "id": "ex-1" }], "rules_override": [{ "rules_target": [] }] })
                .to_string()
                .as_bytes(),
        );
        let snapshot = repository.snapshot();

        let merged =
            ruleset_from_snapshot(&snapshot, &AppSecSettings::default(), &NoopTelemetry).unwrap();

        assert_eq!(merged["rules"], remote_rules()["rules"]);
        assert_eq!(merged["rules_data"][0]["data"][0]["value"], "1.2.3.4");
        assert_eq!(merged["exclusions"], json!([{ "id": "ex-1" }]));
        assert_eq!(merged["rules_override"], json!([{ "rules_target": [] }]));
        assert!(merged.get("custom_rules").is_none());
        assert!(snapshot
            .contents()
            .iter()
            .all(|content| content.apply_state() == ApplyState::Acknowledged));
    }

    /// Without `ASM_DD` content the configured ruleset is used, and bad documents are flagged.
    #[test]
    fn falls_back_to_configured_rules() {
        let repository = Repository::new();
        insert(&repository, DATA_PATH, b"{not json");
        let snapshot = repository.snapshot();

        let merged =
            ruleset_from_snapshot(&snapshot, &AppSecSettings::default(), &NoopTelemetry).unwrap();

        let recommended: Value = serde_json::from_str(crate::assets::RECOMMENDED).unwrap();
        assert_eq!(merged["rules"], recommended["rules"]);
        let content = snapshot
            .get(&ConfigPath::parse(DATA_PATH).unwrap())
            .unwrap();
        assert_eq!(content.apply_state(), ApplyState::Error);
        assert!(content.apply_error().is_some());
    }

    /// Conflicting rule versions fail the merge and flag the contents.
    #[test]
    fn version_mismatch_marks_contents() {
        let repository = Repository::new();
        insert(&repository, RULES_PATH, remote_rules().to_string().as_bytes());
        insert(
            &repository,
            "datadog/603646/ASM_DD/custom/config",
            json!({ "version": "2.1", "rules": [] }).to_string().as_bytes(),
        );
        let snapshot = repository.snapshot();

        let err = ruleset_from_snapshot(&snapshot, &AppSecSettings::default(), &NoopTelemetry)
            .unwrap_err();

        assert!(matches!(err, RemoteError::Merge(RuleMergeError::RuleVersionMismatch { .. })));
        assert!(snapshot
            .contents()
            .iter()
            .all(|content| content.apply_state() == ApplyState::Error));
    }

    /// A failed recompilation keeps the running processor.
    #[test]
    fn reconfigure_keeps_processor_on_failure() {
        let engine = ScriptedEngine::new();
        let component = AppSecComponent::build(
            AppSecSettings::default(),
            Arc::new(engine.clone()),
            Arc::new(NoopTelemetry),
        )
        .unwrap();
        let before = component.processor();

        assert!(component.reconfigure(&remote_rules()));
        let after = component.processor();
        assert!(!Arc::ptr_eq(&before, &after));

        engine
            .script
            .fail_compilation(EngineError::new("bad rules"));
        assert!(!component.reconfigure(&remote_rules()));
        assert!(Arc::ptr_eq(&after, &component.processor()));
    }

    /// The dispatcher receiver applies remote rules and activation.
    #[test]
    fn receiver_reconfigures_component() {
        let engine = ScriptedEngine::new();
        let component = Arc::new(
            AppSecComponent::build(
                AppSecSettings::default(),
                Arc::new(engine.clone()),
                Arc::new(NoopTelemetry),
            )
            .unwrap(),
        );
        assert!(!component.enabled());
        let mut dispatcher = remote_config_core::Dispatcher::new();
        dispatcher.register(component.receiver());

        let repository = Repository::new();
        insert(&repository, RULES_PATH, remote_rules().to_string().as_bytes());
        let changes = insert(
            &repository,
            FEATURES_PATH,
            json!({ "asm": { "enabled": true } }).to_string().as_bytes(),
        );
        dispatcher.dispatch(&changes, &repository.snapshot());

        assert!(component.enabled());
        assert_eq!(engine.script.compiled().len(), 2);
        assert_eq!(engine.script.compiled()[1]["rules"], remote_rules()["rules"]);
    }

    /// The advertised set covers blocking, rules and exclusions but not activation.
    #[test]
    fn advertised_capabilities() {
        assert_eq!(CAPABILITIES.bits(), 0x1fc);
        assert_eq!(CAPABILITIES.to_bytes(), vec![0x01, 0xfc]);
        assert_eq!(CAPABILITIES.to_base64(), "Afw=");
        assert!(CAPABILITIES.contains(CAP_ASM_IP_BLOCKING | CAP_ASM_DD_RULES));
        assert!(!CAPABILITIES.contains(CAP_ASM_ACTIVATION));
        assert!(!CAPABILITIES.contains(CAP_ASM_CUSTOM_BLOCKING_RESPONSE));
        assert_eq!(CAP_ASM_ACTIVATION.bits(), 2);
    }

    /// Removing the `ASM_FEATURES` toggle falls back to the configured setting.
    #[test]
    fn deleted_activation_restores_configured_setting() {
        let component = Arc::new(
            AppSecComponent::build(
                AppSecSettings::default(),
                Arc::new(ScriptedEngine::new()),
                Arc::new(NoopTelemetry),
            )
            .unwrap(),
        );
        let mut dispatcher = remote_config_core::Dispatcher::new();
        dispatcher.register(component.receiver());

        let repository = Repository::new();
        let changes = insert(
            &repository,
            FEATURES_PATH,
            json!({ "asm": { "enabled": true } }).to_string().as_bytes(),
        );
        dispatcher.dispatch(&changes, &repository.snapshot());
        assert!(component.enabled());

        let changes = repository
            .transaction(|_, txn| {
                txn.delete(ConfigPath::parse(FEATURES_PATH).unwrap());
                Ok::<_, Infallible>(())
            })
            .unwrap();
        assert_eq!(changes.len(), 1);
        dispatcher.dispatch(&changes, &repository.snapshot());

        assert!(!component.enabled());
    }
}
