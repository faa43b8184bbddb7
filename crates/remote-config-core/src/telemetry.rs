//! Telemetry sinks shared by Remote Configuration and its consumers.
//!
//! Subsystems never fail the host application when configuration cannot be
//! loaded. Instead they log and report the problem to a [`TelemetrySink`].
//! This module provides the trait plus drop-in implementations: a no-op sink,
//! a counting sink suitable for tests or metric exporters, and a composite
//! that fans out to several observers.

use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Severity attached to a telemetry report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelemetryLevel {
    Debug,
    Warn,
    Error,
}

impl fmt::Display for TelemetryLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TelemetryLevel::Debug => "debug",
            TelemetryLevel::Warn => "warn",
            TelemetryLevel::Error => "error",
        })
    }
}

/// Receives reports about degraded behaviour. All methods default to no-ops.
pub trait TelemetrySink: Send + Sync {
    /// Called with a short description and, when available, the underlying error.
    fn report(
        &self,
        _level: TelemetryLevel,
        _description: &str,
        _error: Option<&(dyn Error + 'static)>,
    ) {
    }

    /// Reports an error-level event without an attached error value.
    fn error(&self, description: &str) {
        self.report(TelemetryLevel::Error, description, None);
    }
}

/// Telemetry implementation that performs no-ops.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTelemetry;

impl TelemetrySink for NoopTelemetry {}

/// Aggregated telemetry counters (all values use relaxed atomics).
#[derive(Debug, Default)]
pub struct TelemetryCounters {
    debug: AtomicU64,
    warn: AtomicU64,
    error: AtomicU64,
    with_error_value: AtomicU64,
    descriptions: Mutex<Vec<String>>,
}

impl TelemetryCounters {
    /// Captures a point-in-time snapshot of the counters.
    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            debug: self.debug.load(Ordering::Relaxed),
            warn: self.warn.load(Ordering::Relaxed),
            error: self.error.load(Ordering::Relaxed),
            with_error_value: self.with_error_value.load(Ordering::Relaxed),
        }
    }

    /// Descriptions of every report received so far, in arrival order.
    pub fn descriptions(&self) -> Vec<String> {
        self.descriptions
            .lock()
            .expect("telemetry descriptions lock poisoned")
            .clone()
    }
}

/// Plain data representation of [`TelemetryCounters`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TelemetrySnapshot {
    /// Number of debug-level reports.
    pub debug: u64,
    /// Number of warn-level reports.
    pub warn: u64,
    /// Number of error-level reports.
    pub error: u64,
    /// Number of reports that carried an error value.
    pub with_error_value: u64,
}

impl fmt::Display for TelemetrySnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "debug={}, warn={}, error={}, with_error_value={}",
            self.debug, self.warn, self.error, self.with_error_value
        )
    }
}

/// Telemetry implementation that maintains atomic counters for every report.
///
/// The caller can expose the [`TelemetryCounters`] through any metric backend,
/// and tests use it to assert that a failure was surfaced.
#[derive(Debug, Clone)]
pub struct CountingTelemetry {
    counters: Arc<TelemetryCounters>,
}

impl CountingTelemetry {
    /// Creates a new telemetry instance backed by the provided counter set.
    pub fn new(counters: Arc<TelemetryCounters>) -> Self {
        Self { counters }
    }

    /// Returns the underlying counter set.
    pub fn counters(&self) -> Arc<TelemetryCounters> {
        self.counters.clone()
    }
}

impl Default for CountingTelemetry {
    fn default() -> Self {
        Self::new(Arc::new(TelemetryCounters::default()))
    }
}

impl TelemetrySink for CountingTelemetry {
    fn report(
        &self,
        level: TelemetryLevel,
        description: &str,
        error: Option<&(dyn Error + 'static)>,
    ) {
        let counter = match level {
            TelemetryLevel::Debug => &self.counters.debug,
            TelemetryLevel::Warn => &self.counters.warn,
            TelemetryLevel::Error => &self.counters.error,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        if error.is_some() {
            self.counters
                .with_error_value
                .fetch_add(1, Ordering::Relaxed);
        }
        self.counters
            .descriptions
            .lock()
            .expect("telemetry descriptions lock poisoned")
            .push(description.to_string());
    }
}

/// Telemetry implementation that forwards reports to multiple observers.
#[derive(Default)]
pub struct CompositeTelemetry {
    observers: Vec<Arc<dyn TelemetrySink>>,
}

impl CompositeTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a telemetry observer.
    pub fn with_observer(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.observers.push(telemetry);
        self
    }

    pub fn extend<I>(&mut self, iter: I)
    where
        I: IntoIterator<Item = Arc<dyn TelemetrySink>>,
    {
        self.observers.extend(iter);
    }
}

impl fmt::Debug for CompositeTelemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompositeTelemetry")
            .field("observer_count", &self.observers.len())
            .finish()
    }
}

impl TelemetrySink for CompositeTelemetry {
    fn report(
        &self,
        level: TelemetryLevel,
        description: &str,
        error: Option<&(dyn Error + 'static)>,
    ) {
        for observer in &self.observers {
            observer.report(level, description, error);
        }
    }
}
