// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Request protection core: ruleset loading and merging, WAF execution
//! contexts, API Security sampling, and remote reconfiguration.

#![deny(clippy::all)]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]

pub mod api_security;
pub mod assets;
pub mod config;
pub mod engine;
pub mod processor;
pub mod remote;
pub mod rule_loader;
pub mod rule_merger;

pub use api_security::{LruCache, LruCacheError, SampleRate, Sampler, SamplerError};
pub use config::{ApiSecuritySettings, AppSecSettings, SettingsError};
pub use engine::{
    Engine, EngineContext, EngineError, EngineHandle, EngineResult, Input, RunStatus,
    RUN_TIMEOUT_MAX_US,
};
pub use processor::{Context, Processor, ProcessorError};
pub use remote::{ruleset_from_snapshot, AppSecComponent, RemoteError, CAPABILITIES, PRODUCTS};
pub use rule_loader::{load_data, load_exclusions, load_rules, IpPasslist, RuleLoadError, Ruleset};
pub use rule_merger::{merge, MergeInput, RuleMergeError};
