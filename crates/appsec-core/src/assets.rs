// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Rulesets and WAF definitions embedded in the binary.

/// Default ruleset used when nothing else is configured.
pub const RECOMMENDED: &str = include_str!("../assets/recommended.json");

/// Ruleset restricted to rules with a very low false-positive rate.
pub const STRICT: &str = include_str!("../assets/strict.json");

/// Default processors, including API Security schema extraction.
pub const WAF_PROCESSORS: &str = include_str!("../assets/processors.json");

/// Default sensitive-data scanners used by schema extraction.
pub const WAF_SCANNERS: &str = include_str!("../assets/scanners.json");
