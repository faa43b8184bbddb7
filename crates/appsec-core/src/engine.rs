// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Abstraction over the native rule evaluation engine.
//!
//! The engine compiles a merged ruleset into a [`EngineHandle`], which hands
//! out one [`EngineContext`] per request. Contexts own native resources and
//! must be finalized once the request completes.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

/// Mapping of WAF address names to the values extracted from a request.
pub type Input = Map<String, Value>;

/// Timeout value meaning "no timeout", used for schema extraction runs.
pub const RUN_TIMEOUT_MAX_US: u64 = u64::MAX;

/// Failure raised by the engine, optionally carrying compilation diagnostics.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct EngineError {
    pub message: String,
    pub diagnostics: Option<Value>,
}

impl EngineError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            diagnostics: None,
        }
    }

    pub fn with_diagnostics(mut self, diagnostics: Value) -> Self {
        self.diagnostics = Some(diagnostics);
        self
    }
}

/// Outcome of a single engine run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Ok,
    Match,
    InvalidArgument,
    InvalidObject,
    InvalidInternal,
    Unknown(i32),
}

impl RunStatus {
    /// Maps the native return code onto a status.
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => RunStatus::Ok,
            1 => RunStatus::Match,
            -1 => RunStatus::InvalidArgument,
            -2 => RunStatus::InvalidObject,
            -3 => RunStatus::InvalidInternal,
            other => RunStatus::Unknown(other),
        }
    }

    /// `ok` and `match` are the only successful statuses.
    pub fn is_success(self) -> bool {
        matches!(self, RunStatus::Ok | RunStatus::Match)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Ok => f.write_str("ok"),
            RunStatus::Match => f.write_str("match"),
            RunStatus::InvalidArgument => f.write_str("err_invalid_argument"),
            RunStatus::InvalidObject => f.write_str("err_invalid_object"),
            RunStatus::InvalidInternal => f.write_str("err_internal"),
            RunStatus::Unknown(code) => write!(f, "unknown({code})"),
        }
    }
}

/// Result returned by [`EngineContext::run`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineResult {
    pub status: RunStatus,
    /// Matched rule records (rule id, parameters, highlights).
    pub events: Vec<Value>,
    /// Actions requested by matching rules, e.g. `block`.
    pub actions: Vec<String>,
    /// Attributes derived by processors, such as extracted schemas.
    pub derivatives: Map<String, Value>,
    /// Engine-internal runtime in nanoseconds.
    pub total_runtime_ns: u64,
    pub timeout: bool,
}

impl EngineResult {
    /// A result with no match and no runtime.
    pub fn ok() -> Self {
        Self {
            status: RunStatus::Ok,
            events: Vec::new(),
            actions: Vec::new(),
            derivatives: Map::new(),
            total_runtime_ns: 0,
            timeout: false,
        }
    }
}

/// Compiles rulesets into executable handles.
pub trait Engine: Send + Sync {
    fn compile(&self, ruleset: &Value) -> Result<Arc<dyn EngineHandle>, EngineError>;
}

/// A compiled ruleset.
pub trait EngineHandle: Send + Sync {
    /// Allocates a per-request evaluation context.
    fn new_context(&self) -> Box<dyn EngineContext>;

    /// Diagnostics produced while compiling the ruleset.
    fn diagnostics(&self) -> Option<Value>;

    /// Addresses the compiled rules consume.
    fn required_addresses(&self) -> Vec<String>;

    /// Version of the engine library, used to tag telemetry.
    fn version(&self) -> String;
}

/// Per-request evaluation state. Not safe for concurrent runs.
pub trait EngineContext: Send {
    fn run(&mut self, input: &Input, timeout_us: u64) -> Result<EngineResult, EngineError>;

    /// Releases native resources; no run may follow.
    fn finalize(&mut self);
}
