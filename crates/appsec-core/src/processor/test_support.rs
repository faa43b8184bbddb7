// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Scripted engine used by processor and context tests.

#![cfg(test)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};

use crate::engine::{
    Engine, EngineContext, EngineError, EngineHandle, EngineResult, Input, RunStatus,
};

pub(crate) const ENGINE_VERSION: &str = "1.14.0";

/// Shared script and call log behind a [`ScriptedEngine`].
#[derive(Default)]
pub(crate) struct Script {
    results: Mutex<VecDeque<Result<EngineResult, EngineError>>>,
    compile_error: Mutex<Option<EngineError>>,
    compiled: Mutex<Vec<Value>>,
    inputs: Mutex<Vec<(Input, u64)>>,
    contexts: AtomicUsize,
    finalized: AtomicUsize,
    run_delay: Mutex<Option<Duration>>,
    running: AtomicUsize,
    max_running: AtomicUsize,
}

impl Script {
    /// Queues the result of the next run. Runs past the queue return `ok`.
    pub(crate) fn push_result(&self, result: EngineResult) {
        self.results.lock().unwrap().push_back(Ok(result));
    }

    pub(crate) fn push_error(&self, error: EngineError) {
        self.results.lock().unwrap().push_back(Err(error));
    }

    pub(crate) fn fail_compilation(&self, error: EngineError) {
        *self.compile_error.lock().unwrap() = Some(error);
    }

    pub(crate) fn compiled(&self) -> Vec<Value> {
        self.compiled.lock().unwrap().clone()
    }

    /// Inputs and timeouts passed to every run so far.
    pub(crate) fn inputs(&self) -> Vec<(Input, u64)> {
        self.inputs.lock().unwrap().clone()
    }

    pub(crate) fn contexts(&self) -> usize {
        self.contexts.load(Ordering::SeqCst)
    }

    pub(crate) fn finalized(&self) -> usize {
        self.finalized.load(Ordering::SeqCst)
    }

    /// Makes every run sleep for `delay` while it is in progress.
    pub(crate) fn delay_runs(&self, delay: Duration) {
        *self.run_delay.lock().unwrap() = Some(delay);
    }

    /// Highest number of runs observed in progress at the same time.
    pub(crate) fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }
}

#[derive(Default, Clone)]
pub(crate) struct ScriptedEngine {
    pub(crate) script: Arc<Script>,
}

impl ScriptedEngine {
    pub(crate) fn new() -> Self {
        Self::default()
    }
}

impl Engine for ScriptedEngine {
    fn compile(&self, ruleset: &Value) -> Result<Arc<dyn EngineHandle>, EngineError> {
        if let Some(error) = self.script.compile_error.lock().unwrap().clone() {
            return Err(error);
        }
        self.script.compiled.lock().unwrap().push(ruleset.clone());
        let rules = ruleset
            .get("rules")
            .and_then(Value::as_array)
            .map_or(0, Vec::len);
        Ok(Arc::new(ScriptedHandle {
            script: Arc::clone(&self.script),
            rules,
        }))
    }
}

struct ScriptedHandle {
    script: Arc<Script>,
    rules: usize,
}

impl EngineHandle for ScriptedHandle {
    fn new_context(&self) -> Box<dyn EngineContext> {
        self.script.contexts.fetch_add(1, Ordering::SeqCst);
        Box::new(ScriptedContext {
            script: Arc::clone(&self.script),
        })
    }

    fn diagnostics(&self) -> Option<Value> {
        Some(json!({ "rules": { "loaded": self.rules, "failed": [] } }))
    }

    fn required_addresses(&self) -> Vec<String> {
        vec!["http.client_ip".to_string(), "server.request.headers.no_cookies".to_string()]
    }

    fn version(&self) -> String {
        ENGINE_VERSION.to_string()
    }
}

struct ScriptedContext {
    script: Arc<Script>,
}

impl EngineContext for ScriptedContext {
    fn run(&mut self, input: &Input, timeout_us: u64) -> Result<EngineResult, EngineError> {
        let running = self.script.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.script.max_running.fetch_max(running, Ordering::SeqCst);
        self.script
            .inputs
            .lock()
            .unwrap()
            .push((input.clone(), timeout_us));
        let delay = *self.script.run_delay.lock().unwrap();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        let outcome = self
            .script
            .results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(EngineResult::ok()));
        self.script.running.fetch_sub(1, Ordering::SeqCst);
        outcome
    }

    fn finalize(&mut self) {
        self.script.finalized.fetch_add(1, Ordering::SeqCst);
    }
}

/// Builds a run result with the given status and engine runtime.
pub(crate) fn result(status: RunStatus, total_runtime_ns: u64) -> EngineResult {
    EngineResult {
        status,
        total_runtime_ns,
        ..EngineResult::ok()
    }
}

/// Builds a matching result carrying one event for `rule_id`.
pub(crate) fn matched(rule_id: &str, actions: &[&str]) -> EngineResult {
    EngineResult {
        status: RunStatus::Match,
        events: vec![json!({ "rule": { "id": rule_id } })],
        actions: actions.iter().map(|action| action.to_string()).collect(),
        total_runtime_ns: 100,
        ..EngineResult::ok()
    }
}
