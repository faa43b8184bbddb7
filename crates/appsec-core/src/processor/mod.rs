// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Compiled ruleset plus the per-request contexts evaluating it.

mod context;
pub(crate) mod test_support;

use std::sync::{Arc, Mutex};

use remote_config_core::telemetry::{TelemetryLevel, TelemetrySink};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::api_security::{SampleRate, Sampler};
use crate::config::{ApiSecuritySettings, AppSecSettings};
use crate::engine::{Engine, EngineError, EngineHandle};

pub use context::Context;

#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("appsec: engine error: {0}")]
    Engine(#[from] EngineError),
}

/// Holds the compiled ruleset and hands out request contexts.
///
/// A processor whose ruleset failed to compile stays inert: it reports no
/// addresses and [`Processor::activate_context`] returns `None`, so requests
/// pass through unprotected.
pub struct Processor {
    handle: Option<Arc<dyn EngineHandle>>,
    diagnostics: Option<Value>,
    addresses: Vec<String>,
    waf_timeout_us: u64,
    api_security: ApiSecuritySettings,
    route_sampler: Option<Arc<Mutex<Sampler>>>,
    telemetry: Arc<dyn TelemetrySink>,
}

impl Processor {
    pub fn new(
        ruleset: &Value,
        engine: &dyn Engine,
        settings: &AppSecSettings,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        let (handle, diagnostics, addresses) = match engine.compile(ruleset) {
            Ok(handle) => {
                let diagnostics = handle.diagnostics();
                let addresses = handle.required_addresses();
                debug!(
                    version = %handle.version(),
                    addresses = addresses.len(),
                    "appsec: ruleset compiled"
                );
                (Some(handle), diagnostics, addresses)
            }
            Err(err) => {
                warn!(
                    error = %err,
                    "appsec: ruleset failed to compile, AppSec is disabled"
                );
                telemetry.report(
                    TelemetryLevel::Error,
                    "libddwaf failed to initialize",
                    Some(&err),
                );
                (None, err.diagnostics, Vec::new())
            }
        };

        let route_sampler = settings
            .api_security
            .enabled
            .then(|| Arc::new(Mutex::new(Sampler::new(settings.api_security.sample_delay))));

        Self {
            handle,
            diagnostics,
            addresses,
            waf_timeout_us: settings.waf_timeout_us,
            api_security: settings.api_security.clone(),
            route_sampler,
            telemetry,
        }
    }

    /// Replaces the route sampler, so sampling history survives a reconfiguration.
    pub fn with_route_sampler(mut self, sampler: Option<Arc<Mutex<Sampler>>>) -> Self {
        if self.api_security.enabled {
            self.route_sampler = sampler;
        }
        self
    }

    pub fn ready(&self) -> bool {
        self.handle.is_some()
    }

    /// Compilation diagnostics, including those of a failed compilation.
    pub fn diagnostics(&self) -> Option<&Value> {
        self.diagnostics.as_ref()
    }

    /// Addresses the ruleset consumes, empty when not ready.
    pub fn addresses(&self) -> &[String] {
        &self.addresses
    }

    pub fn version(&self) -> Option<String> {
        self.handle.as_ref().map(|handle| handle.version())
    }

    /// Timeout to pass to [`Context::run`] for regular request evaluation.
    pub fn waf_timeout_us(&self) -> u64 {
        self.waf_timeout_us
    }

    pub fn route_sampler(&self) -> Option<Arc<Mutex<Sampler>>> {
        self.route_sampler.clone()
    }

    /// Creates a context for one request, or `None` when not ready.
    pub fn activate_context(&self) -> Option<Context> {
        let Some(handle) = &self.handle else {
            debug!("appsec: processor not ready, no context activated");
            return None;
        };
        let schema_sampling = self
            .api_security
            .enabled
            .then(|| SampleRate::new(self.api_security.sample_rate));
        Some(Context::new(
            Arc::clone(handle),
            Arc::clone(&self.telemetry),
            schema_sampling,
        ))
    }

    pub fn deactivate_context(&self, context: Context) {
        context.finalize();
    }

    /// Runs `f` with a fresh context finalized right after.
    pub fn with_context<R, F>(&self, f: F) -> Option<R>
    where
        F: FnOnce(&Context) -> R,
    {
        let context = self.activate_context()?;
        let outcome = f(&context);
        self.deactivate_context(context);
        Some(outcome)
    }

    /// Whether the schema of this `(method, route, status)` should be reported.
    ///
    /// Always `false` when API Security is disabled.
    pub fn api_security_sample(&self, method: &str, route: &str, status: u16) -> bool {
        match &self.route_sampler {
            Some(sampler) => sampler
                .lock()
                .expect("route sampler lock poisoned")
                .sample(method, route, status),
            None => false,
        }
    }
}

impl std::fmt::Debug for Processor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Processor")
            .field("ready", &self.ready())
            .field("addresses", &self.addresses)
            .field("waf_timeout_us", &self.waf_timeout_us)
            .field("api_security", &self.api_security)
            .finish_non_exhaustive()
    }
}
