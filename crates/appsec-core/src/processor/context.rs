// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::{Arc, Mutex};
use std::time::Instant;

use remote_config_core::telemetry::{TelemetryLevel, TelemetrySink};
use serde_json::{json, Value};
use tracing::{debug, error};

use super::ProcessorError;
use crate::api_security::SampleRate;
use crate::engine::{
    EngineContext, EngineHandle, EngineResult, Input, RunStatus, RUN_TIMEOUT_MAX_US,
};

/// Evaluation state for a single request.
///
/// Runs are serialized by an internal mutex, so a context may be shared by
/// the threads serving one request. The engine context is finalized when the
/// `Context` is finalized or dropped, whichever comes first.
pub struct Context {
    state: Mutex<State>,
    // Keeps the compiled rules alive while the engine context exists.
    _handle: Arc<dyn EngineHandle>,
    telemetry: Arc<dyn TelemetrySink>,
    version: String,
    schema_sampling: Option<SampleRate>,
}

struct State {
    engine: Box<dyn EngineContext>,
    time_ns: u64,
    time_ext_ns: u64,
    timeouts: u64,
    events: Vec<Value>,
    finalized: bool,
}

impl Context {
    pub(crate) fn new(
        handle: Arc<dyn EngineHandle>,
        telemetry: Arc<dyn TelemetrySink>,
        schema_sampling: Option<SampleRate>,
    ) -> Self {
        let engine = handle.new_context();
        let version = handle.version();
        Self {
            state: Mutex::new(State {
                engine,
                time_ns: 0,
                time_ext_ns: 0,
                timeouts: 0,
                events: Vec::new(),
                finalized: false,
            }),
            _handle: handle,
            telemetry,
            version,
            schema_sampling,
        }
    }

    /// Evaluates `input` against the compiled rules.
    ///
    /// Entries whose value is null or an empty string, array or object are
    /// not sent to the engine. A non-successful status is logged and
    /// reported but still returned, leaving the decision to the caller.
    pub fn run(&self, input: &Input, timeout_us: u64) -> Result<EngineResult, ProcessorError> {
        let mut state = self.lock_state();
        let input = retain_present(input);

        let started = Instant::now();
        let outcome = state.engine.run(&input, timeout_us);
        state.time_ext_ns = state.time_ext_ns.saturating_add(elapsed_ns(started));

        let result = match outcome {
            Ok(result) => result,
            Err(err) => {
                error!(error = %err, version = %self.version, "appsec: engine run failed");
                self.telemetry.report(
                    TelemetryLevel::Error,
                    &format!("libddwaf:{} method:ddwaf_run execution error", self.version),
                    Some(&err),
                );
                return Err(err.into());
            }
        };

        state.time_ns = state.time_ns.saturating_add(result.total_runtime_ns);
        if result.timeout {
            state.timeouts += 1;
        }
        if result.status == RunStatus::Match {
            state.events.extend(result.events.iter().cloned());
        }
        drop(state);

        self.log_result(&result);
        Ok(result)
    }

    /// Asks the engine to extract the request schema.
    ///
    /// Returns `None` when API Security is disabled or the request was not
    /// sampled.
    pub fn extract_schema(&self) -> Option<Result<EngineResult, ProcessorError>> {
        let sampling = self.schema_sampling?;
        if !sampling.sample() {
            debug!("appsec: request not sampled for schema extraction");
            return None;
        }
        let mut input = Input::new();
        input.insert(
            "waf.context.processor".to_string(),
            json!({ "extract-schema": true }),
        );
        Some(self.run(&input, RUN_TIMEOUT_MAX_US))
    }

    /// Accumulated engine-internal runtime.
    pub fn time_ns(&self) -> u64 {
        self.lock_state().time_ns
    }

    /// Accumulated wall-clock runtime, including input conversion.
    pub fn time_ext_ns(&self) -> u64 {
        self.lock_state().time_ext_ns
    }

    pub fn timeouts(&self) -> u64 {
        self.lock_state().timeouts
    }

    /// Events collected from every matching run.
    pub fn events(&self) -> Vec<Value> {
        self.lock_state().events.clone()
    }

    /// Releases the engine context.
    pub fn finalize(self) {
        // Drop does the work.
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("appsec context lock poisoned")
    }

    fn log_result(&self, result: &EngineResult) {
        if result.status.is_success() {
            debug!(
                status = %result.status,
                events = result.events.len(),
                actions = ?result.actions,
                timeout = result.timeout,
                "appsec: engine run completed"
            );
            return;
        }
        error!(status = %result.status, version = %self.version, "appsec: engine run failed");
        self.telemetry.report(
            TelemetryLevel::Error,
            &format!(
                "libddwaf:{} method:ddwaf_run execution error: {}",
                self.version, result.status
            ),
            None,
        );
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        let state = match self.state.get_mut() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !state.finalized {
            state.engine.finalize();
            state.finalized = true;
        }
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("version", &self.version)
            .field("schema_sampling", &self.schema_sampling)
            .finish_non_exhaustive()
    }
}

fn retain_present(input: &Input) -> Input {
    input
        .iter()
        .filter(|(_, value)| match value {
            Value::Null => false,
            Value::String(s) => !s.is_empty(),
            Value::Array(items) => !items.is_empty(),
            Value::Object(map) => !map.is_empty(),
            Value::Bool(_) | Value::Number(_) => true,
        })
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

fn elapsed_ns(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_nanos()).unwrap_or(u64::MAX)
}
