//! Utilities for constructing backend responses used by integration tests.
#![allow(dead_code)]

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use remote_config_core::{hexdigest, ConfigResponse, DigestType};
use serde_json::{json, Map, Value};

/// Blocking configuration delivered to the ASM product.
pub const BLOCKING_PATH: &str = "datadog/603646/ASM/blocking/config";

/// Built-in ruleset delivered to the ASM_DD product.
pub const RULES_PATH: &str = "employee/ASM_DD/1.recommended.json/config";

/// Denylist data delivered to the ASM_DATA product.
pub const DATA_PATH: &str = "datadog/603646/ASM_DATA/blocked_ips/config";

/// One file advertised by the manifest.
#[derive(Debug, Clone)]
pub struct TargetFixture {
    pub path: &'static str,
    pub payload: Vec<u8>,
    pub version: u64,
    /// Whether the payload is shipped in `target_files`.
    pub ship: bool,
}

impl TargetFixture {
    pub fn new(path: &'static str, payload: impl Into<Vec<u8>>, version: u64) -> Self {
        Self {
            path,
            payload: payload.into(),
            version,
            ship: true,
        }
    }

    /// Advertises the file without shipping its payload.
    pub fn cached(mut self) -> Self {
        self.ship = false;
        self
    }
}

/// Builds the JSON wire response the backend sends to a client.
#[derive(Debug, Default)]
pub struct ResponseBuilder {
    version: u64,
    opaque_backend_state: Option<String>,
    targets: Vec<TargetFixture>,
}

impl ResponseBuilder {
    pub fn new(version: u64) -> Self {
        Self {
            version,
            opaque_backend_state: Some(format!("opaque-{version}")),
            targets: Vec::new(),
        }
    }

    pub fn target(mut self, target: TargetFixture) -> Self {
        self.targets.push(target);
        self
    }

    pub fn wire(&self) -> Value {
        let mut targets = Map::new();
        for target in &self.targets {
            targets.insert(
                target.path.to_string(),
                json!({
                    "custom": { "v": target.version },
                    "hashes": {
                        "sha256": hexdigest(DigestType::Sha256, &target.payload),
                        "sha512": hexdigest(DigestType::Sha512, &target.payload)
                    },
                    "length": target.payload.len()
                }),
            );
        }
        let mut signed = json!({
            "_type": "targets",
            "expires": "2030-01-01T00:00:00Z",
            "spec_version": "1.0.0",
            "targets": targets,
            "version": self.version
        });
        if let Some(state) = &self.opaque_backend_state {
            signed["custom"] = json!({ "opaque_backend_state": state });
        }
        let manifest = serde_json::to_vec(&json!({ "signatures": [], "signed": signed }))
            .expect("manifest serializes");

        json!({
            "targets": STANDARD.encode(manifest),
            "target_files": self
                .targets
                .iter()
                .filter(|target| target.ship)
                .map(|target| json!({ "path": target.path, "raw": STANDARD.encode(&target.payload) }))
                .collect::<Vec<_>>(),
            "client_configs": self.targets.iter().map(|target| target.path).collect::<Vec<_>>()
        })
    }

    pub fn build(&self) -> ConfigResponse {
        serde_json::from_value(self.wire()).expect("wire response deserializes")
    }
}
