// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::debug;

use super::lru_cache::LruCache;

const MAX_TRACKED_ROUTES: NonZeroUsize = match NonZeroUsize::new(4096) {
    Some(size) => size,
    None => panic!("route cache size must be positive"),
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SamplerError {
    #[error("appsec: API Security sample delay must be an integer number of seconds, got {0:?}")]
    InvalidDelay(String),
}

type RouteKey = (String, String, u16);

/// Per-route sampler for API Security schema extraction.
///
/// A `(method, route, status)` triple is accepted at most once per
/// `sample_delay`. The sampler is owned by the processor and shared across
/// request threads behind a mutex.
#[derive(Debug)]
pub struct Sampler {
    sample_delay: Duration,
    last_sampled: LruCache<RouteKey, Instant>,
}

impl Sampler {
    pub fn new(sample_delay: Duration) -> Self {
        Self {
            sample_delay,
            last_sampled: LruCache::with_capacity(MAX_TRACKED_ROUTES),
        }
    }

    /// Builds a sampler from a configured delay in whole seconds.
    pub fn from_setting(raw: &str) -> Result<Self, SamplerError> {
        Self::parse_delay(raw).map(Self::new)
    }

    /// Parses a configured delay, which must be a whole number of seconds.
    pub fn parse_delay(raw: &str) -> Result<Duration, SamplerError> {
        raw.trim()
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|_| SamplerError::InvalidDelay(raw.to_string()))
    }

    pub fn sample_delay(&self) -> Duration {
        self.sample_delay
    }

    pub fn sample(&mut self, method: &str, route: &str, status: u16) -> bool {
        self.sample_at(method, route, status, Instant::now())
    }

    /// Decides whether the route should be sampled at `now`.
    ///
    /// Accepts when the route was never sampled or strictly more than
    /// `sample_delay` elapsed since the last accepted sample. Rejections
    /// leave the recorded timestamp untouched.
    pub fn sample_at(&mut self, method: &str, route: &str, status: u16, now: Instant) -> bool {
        let key = (method.to_string(), route.to_string(), status);
        let accepted = match self.last_sampled.get(&key).copied() {
            None => true,
            Some(last) => now.saturating_duration_since(last) > self.sample_delay,
        };
        if accepted {
            debug!(method, route, status, "appsec: API Security route sampled");
            self.last_sampled.store(key, now);
        }
        accepted
    }
}
