// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! API Security sampling: which requests get their schema extracted.

pub mod lru_cache;
pub mod sampler;

use rand::Rng;

pub use lru_cache::{LruCache, LruCacheError};
pub use sampler::{Sampler, SamplerError};

/// Probabilistic request sampler for schema extraction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleRate {
    rate: f64,
}

impl SampleRate {
    /// Creates a sampler accepting `rate` of the requests. Out of range or
    /// NaN rates are clamped into `[0, 1]`.
    pub fn new(rate: f64) -> Self {
        let rate = if rate.is_nan() { 0.0 } else { rate.clamp(0.0, 1.0) };
        Self { rate }
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn sample(&self) -> bool {
        if self.rate >= 1.0 {
            return true;
        }
        if self.rate <= 0.0 {
            return false;
        }
        rand::thread_rng().gen_bool(self.rate)
    }
}
