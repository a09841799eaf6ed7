//! Resolves which chain a stage payload belongs to.
//!
//! Payloads should carry an explicit [`StageContext`]. Older producers don't,
//! so the resolver falls back to looking for a chain id inside the payload
//! body: first as a JSON key, then inside serialized strings.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Stage name recorded when neither the context nor the payload names one.
pub const UNKNOWN_STAGE: &str = "Unknown Stage";

/// Typed chain linkage carried by every well-formed stage payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageContext {
    pub chain_id: String,
    pub stage_name: String,
}

/// A unit of stage work as handed over by the queue runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StagePayload {
    /// Identifier of this unit; stable across retries.
    pub unit_id: String,
    #[serde(default)]
    pub queue: Option<String>,
    /// Name the runtime knows the unit by, used when no stage name is found.
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub context: Option<StageContext>,
    #[serde(default)]
    pub body: Value,
}

impl StagePayload {
    pub fn new(unit_id: impl Into<String>, context: StageContext) -> Self {
        Self {
            unit_id: unit_id.into(),
            queue: None,
            display_name: None,
            context: Some(context),
            body: Value::Null,
        }
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = body;
        self
    }
}

/// How the chain id was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Explicit,
    Degraded,
    Unresolved,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedIdentity {
    pub unit_id: String,
    pub chain_id: Option<String>,
    pub stage_name: String,
    pub queue: Option<String>,
    pub resolution: Resolution,
}

/// Chain id keys, in order of preference, compared without case or separators.
const CHAIN_KEYS: [&str; 3] = ["chainid", "rootid", "parentid"];
const STAGE_KEYS: [&str; 2] = ["stagename", "stage"];

// Matches `"chainId":"…"`, `chain_id=…` and length-prefixed `s:8:"chain_id";s:36:"…"`.
static RE_SERIALIZED_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)"?(chain[_-]?id|root[_-]?id|parent[_-]?id)"?\s*[:=;]\s*(?:s:\d+:)?"([^"]+)""#)
        .unwrap()
});

#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityResolver;

impl IdentityResolver {
    pub fn new() -> Self {
        Self
    }

    /// Resolves the chain linkage of `payload`. Never fails; an unrecoverable
    /// chain id yields [`Resolution::Unresolved`].
    pub fn resolve(&self, payload: &StagePayload) -> ResolvedIdentity {
        if let Some(context) = payload
            .context
            .as_ref()
            .filter(|c| !c.chain_id.trim().is_empty())
        {
            return ResolvedIdentity {
                unit_id: payload.unit_id.clone(),
                chain_id: Some(context.chain_id.clone()),
                stage_name: non_empty(&context.stage_name)
                    .unwrap_or_else(|| fallback_stage_name(payload)),
                queue: payload.queue.clone(),
                resolution: Resolution::Explicit,
            };
        }

        let stage_name = payload
            .context
            .as_ref()
            .and_then(|c| non_empty(&c.stage_name))
            .unwrap_or_else(|| fallback_stage_name(payload));

        let chain_id = find_chain_id(&payload.body).filter(|id| *id != payload.unit_id);
        let resolution = match chain_id {
            Some(ref id) => {
                log::warn!(
                    "Stage unit {} carries no chain context, recovered chain {} from its payload",
                    payload.unit_id,
                    id
                );
                Resolution::Degraded
            }
            None => {
                log::warn!(
                    "Stage unit {} ({}) has no recoverable chain id",
                    payload.unit_id,
                    stage_name
                );
                Resolution::Unresolved
            }
        };

        ResolvedIdentity {
            unit_id: payload.unit_id.clone(),
            chain_id,
            stage_name,
            queue: payload.queue.clone(),
            resolution,
        }
    }
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn normalize_key(key: &str) -> String {
    key.chars()
        .filter(|c| *c != '_' && *c != '-')
        .flat_map(char::to_lowercase)
        .collect()
}

fn fallback_stage_name(payload: &StagePayload) -> String {
    STAGE_KEYS
        .iter()
        .find_map(|key| find_key(&payload.body, key))
        .or_else(|| payload.display_name.as_deref().and_then(non_empty))
        .unwrap_or_else(|| UNKNOWN_STAGE.to_string())
}

fn find_chain_id(body: &Value) -> Option<String> {
    CHAIN_KEYS
        .iter()
        .find_map(|key| find_key(body, key))
        .or_else(|| find_in_strings(body))
}

/// Depth-first search for a string (or integer) value stored under `key`.
fn find_key(value: &Value, key: &str) -> Option<String> {
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                if normalize_key(k) == key {
                    let found = match v {
                        Value::String(s) => non_empty(s),
                        Value::Number(n) => Some(n.to_string()),
                        _ => None,
                    };
                    if found.is_some() {
                        return found;
                    }
                }
            }
            map.values().find_map(|v| find_key(v, key))
        }
        Value::Array(items) => items.iter().find_map(|v| find_key(v, key)),
        _ => None,
    }
}

/// Scans every string in the body for a serialized chain id.
fn find_in_strings(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => scan_serialized(s),
        Value::Object(map) => map.values().find_map(find_in_strings),
        Value::Array(items) => items.iter().find_map(find_in_strings),
        _ => None,
    }
}

fn scan_serialized(text: &str) -> Option<String> {
    let captures: Vec<(String, String)> = RE_SERIALIZED_ID
        .captures_iter(text)
        .filter_map(|c| Some((normalize_key(c.get(1)?.as_str()), c.get(2)?.as_str().to_string())))
        .collect();

    CHAIN_KEYS.iter().find_map(|key| {
        captures
            .iter()
            .find(|(k, _)| k.as_str() == *key)
            .and_then(|(_, v)| non_empty(v))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bare(unit_id: &str, body: Value) -> StagePayload {
        StagePayload {
            unit_id: unit_id.to_string(),
            queue: Some("documents".to_string()),
            display_name: Some("extract-text-job".to_string()),
            context: None,
            body,
        }
    }

    #[test]
    fn test_explicit_context_wins() {
        let payload = StagePayload::new(
            "u1",
            StageContext {
                chain_id: "root-1".to_string(),
                stage_name: "Extract Text".to_string(),
            },
        )
        .with_body(json!({"chainId": "other"}));

        let identity = IdentityResolver::new().resolve(&payload);
        assert_eq!(identity.resolution, Resolution::Explicit);
        assert_eq!(identity.chain_id.as_deref(), Some("root-1"));
        assert_eq!(identity.stage_name, "Extract Text");
    }

    #[test]
    fn test_degraded_json_key() {
        let payload = bare(
            "u1",
            json!({"job": {"data": {"parent_job_id": 7, "Chain_Id": "root-9", "stage": "Convert Document"}}}),
        );
        let identity = IdentityResolver::new().resolve(&payload);
        assert_eq!(identity.resolution, Resolution::Degraded);
        assert_eq!(identity.chain_id.as_deref(), Some("root-9"));
        assert_eq!(identity.stage_name, "Convert Document");
    }

    #[test]
    fn test_degraded_serialized_string() {
        let payload = bare(
            "u1",
            json!({"command": r#"O:12:"ExtractText":2:{s:8:"root_id";s:6:"root-3";s:4:"page";i:1;}"#}),
        );
        let identity = IdentityResolver::new().resolve(&payload);
        assert_eq!(identity.resolution, Resolution::Degraded);
        assert_eq!(identity.chain_id.as_deref(), Some("root-3"));
        assert_eq!(identity.stage_name, "extract-text-job");
    }

    #[test]
    fn test_serialized_prefers_chain_id() {
        assert_eq!(
            scan_serialized(r#"{"parentId":"p-1","chainId":"c-1"}"#).as_deref(),
            Some("c-1")
        );
        assert_eq!(scan_serialized("chain_id=\"c-2\"").as_deref(), Some("c-2"));
        assert!(scan_serialized("nothing here").is_none());
    }

    #[test]
    fn test_unresolved() {
        let mut payload = bare("u1", json!({"path": "/tmp/a.pdf"}));
        payload.display_name = None;
        let identity = IdentityResolver::new().resolve(&payload);
        assert_eq!(identity.resolution, Resolution::Unresolved);
        assert!(identity.chain_id.is_none());
        assert_eq!(identity.stage_name, UNKNOWN_STAGE);
    }

    #[test]
    fn test_own_id_is_not_a_chain_id() {
        let payload = bare("u1", json!({"parentId": "u1"}));
        let identity = IdentityResolver::new().resolve(&payload);
        assert_eq!(identity.resolution, Resolution::Unresolved);
    }

    #[test]
    fn test_blank_context_falls_back() {
        let mut payload = bare("u1", json!({"rootId": "root-5"}));
        payload.context = Some(StageContext {
            chain_id: " ".to_string(),
            stage_name: "Analyze Document".to_string(),
        });
        let identity = IdentityResolver::new().resolve(&payload);
        assert_eq!(identity.resolution, Resolution::Degraded);
        assert_eq!(identity.chain_id.as_deref(), Some("root-5"));
        assert_eq!(identity.stage_name, "Analyze Document");
    }

    #[test]
    fn test_payload_deserializes_without_optional_fields() {
        let payload: StagePayload = serde_json::from_value(json!({"unitId": "u7"})).unwrap();
        assert!(payload.context.is_none());
        assert_eq!(payload.body, Value::Null);
    }
}
