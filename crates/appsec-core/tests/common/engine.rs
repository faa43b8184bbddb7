//! Minimal engine evaluating `ip_match`/`exact_match` rules against rules data.
//!
//! Enough of the rule semantics to drive the processor end to end: data
//! lookups, `on_match` actions, and passlist exclusions on `http.client_ip`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use appsec_core::{
    Engine, EngineContext, EngineError, EngineHandle, EngineResult, Input, RunStatus,
};
use serde_json::{json, Value};

pub const ENGINE_VERSION: &str = "1.14.0";

#[derive(Debug, Default, Clone, Copy)]
pub struct DataMatchEngine;

impl Engine for DataMatchEngine {
    fn compile(&self, ruleset: &Value) -> Result<Arc<dyn EngineHandle>, EngineError> {
        let Some(raw_rules) = ruleset.get("rules").and_then(Value::as_array) else {
            return Err(EngineError::new("ruleset has no rules")
                .with_diagnostics(json!({ "rules": { "error": "missing rules" } })));
        };

        let rules = raw_rules.iter().filter_map(DataRule::parse).collect();
        let mut data: HashMap<String, HashSet<String>> = HashMap::new();
        for entry in array(ruleset, "rules_data") {
            let Some(id) = entry.get("id").and_then(Value::as_str) else {
                continue;
            };
            let values = data.entry(id.to_string()).or_default();
            for item in entry.get("data").and_then(Value::as_array).into_iter().flatten() {
                if let Some(value) = item.get("value").and_then(Value::as_str) {
                    values.insert(value.to_string());
                }
            }
        }
        let passlist = array(ruleset, "exclusions")
            .iter()
            .filter(|exclusion| exclusion.get("on_match").is_none())
            .flat_map(|exclusion| {
                exclusion["conditions"][0]["parameters"]["list"]
                    .as_array()
                    .cloned()
                    .unwrap_or_default()
            })
            .filter_map(|value| value.as_str().map(str::to_string))
            .collect();

        Ok(Arc::new(DataMatchHandle {
            rules,
            data: Arc::new(data),
            passlist: Arc::new(passlist),
        }))
    }
}

fn array<'a>(document: &'a Value, key: &str) -> &'a [Value] {
    document
        .get(key)
        .and_then(Value::as_array)
        .map_or(&[][..], Vec::as_slice)
}

#[derive(Debug, Clone)]
struct DataRule {
    id: String,
    addresses: Vec<String>,
    data: String,
    actions: Vec<String>,
}

impl DataRule {
    fn parse(rule: &Value) -> Option<Self> {
        let condition = rule.get("conditions")?.get(0)?;
        let operator = condition.get("operator")?.as_str()?;
        if operator != "ip_match" && operator != "exact_match" {
            return None;
        }
        let parameters = condition.get("parameters")?;
        Some(Self {
            id: rule.get("id")?.as_str()?.to_string(),
            addresses: parameters
                .get("inputs")?
                .as_array()?
                .iter()
                .filter_map(|input| input.get("address")?.as_str().map(str::to_string))
                .collect(),
            data: parameters.get("data")?.as_str()?.to_string(),
            actions: rule
                .get("on_match")
                .and_then(Value::as_array)
                .map(|actions| {
                    actions
                        .iter()
                        .filter_map(|action| action.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default(),
        })
    }
}

struct DataMatchHandle {
    rules: Vec<DataRule>,
    data: Arc<HashMap<String, HashSet<String>>>,
    passlist: Arc<HashSet<String>>,
}

impl EngineHandle for DataMatchHandle {
    fn new_context(&self) -> Box<dyn EngineContext> {
        Box::new(DataMatchContext {
            rules: self.rules.clone(),
            data: Arc::clone(&self.data),
            passlist: Arc::clone(&self.passlist),
        })
    }

    fn diagnostics(&self) -> Option<Value> {
        let loaded: Vec<&str> = self.rules.iter().map(|rule| rule.id.as_str()).collect();
        Some(json!({ "rules": { "loaded": loaded } }))
    }

    fn required_addresses(&self) -> Vec<String> {
        let mut addresses: Vec<String> = self
            .rules
            .iter()
            .flat_map(|rule| rule.addresses.iter().cloned())
            .collect();
        addresses.sort();
        addresses.dedup();
        addresses
    }

    fn version(&self) -> String {
        ENGINE_VERSION.to_string()
    }
}

struct DataMatchContext {
    rules: Vec<DataRule>,
    data: Arc<HashMap<String, HashSet<String>>>,
    passlist: Arc<HashSet<String>>,
}

impl EngineContext for DataMatchContext {
    fn run(&mut self, input: &Input, _timeout_us: u64) -> Result<EngineResult, EngineError> {
        let passlisted = input
            .get("http.client_ip")
            .and_then(Value::as_str)
            .is_some_and(|ip| self.passlist.contains(ip));
        if passlisted {
            return Ok(EngineResult {
                total_runtime_ns: 10,
                ..EngineResult::ok()
            });
        }

        let mut result = EngineResult {
            total_runtime_ns: 100,
            ..EngineResult::ok()
        };
        for rule in &self.rules {
            let Some(values) = self.data.get(&rule.data) else {
                continue;
            };
            let hit = rule.addresses.iter().find_map(|address| {
                input
                    .get(address)
                    .and_then(Value::as_str)
                    .filter(|value| values.contains(*value))
                    .map(|value| (address, value))
            });
            if let Some((address, value)) = hit {
                result.status = RunStatus::Match;
                result.events.push(json!({
                    "rule": { "id": rule.id },
                    "rule_matches": [{ "parameters": [{ "address": address, "value": value }] }],
                }));
                result.actions.extend(rule.actions.iter().cloned());
            }
        }
        Ok(result)
    }

    fn finalize(&mut self) {}
}
