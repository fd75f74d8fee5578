//! Stateful Merge Engine
//!
//! Computes the final data of a `StatefulSecret` against the Secret that
//! already exists in the cluster:
//! - keys only in the existing Secret are dropped
//! - keys in both keep their existing value
//! - keys only in the template are added, forcing their random values now

use base64::Engine as _;
use nyl_core::{StatefulSecretResource, ThunkForcer};
use serde_json::{Value as JsonValue, json};
use std::collections::BTreeMap;

/// A Secret value as it will be emitted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecretValue {
    /// Emitted under `stringData`
    Text(String),
    /// Existing value that is not UTF-8, emitted under `data` as base64
    Binary(String),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeOutcome {
    pub data: BTreeMap<String, SecretValue>,
    pub added: Vec<String>,
    pub preserved: Vec<String>,
    pub dropped: Vec<String>,
}

/// Values of an existing Secret, keyed by data key
pub fn existing_values(secret: &JsonValue) -> BTreeMap<String, SecretValue> {
    let mut values = BTreeMap::new();

    if let Some(data) = secret.get("data").and_then(|d| d.as_object()) {
        for (key, raw) in data {
            let Some(raw) = raw.as_str() else { continue };
            let value = base64::engine::general_purpose::STANDARD
                .decode(raw.trim())
                .ok()
                .and_then(|bytes| String::from_utf8(bytes).ok())
                .map(SecretValue::Text)
                .unwrap_or_else(|| SecretValue::Binary(raw.to_string()));
            values.insert(key.clone(), value);
        }
    }
    if let Some(data) = secret.get("stringData").and_then(|d| d.as_object()) {
        for (key, value) in data {
            if let Some(text) = value.as_str() {
                values.insert(key.clone(), SecretValue::Text(text.to_string()));
            }
        }
    }

    values
}

/// Merge desired keys (possibly carrying random markers) with the existing Secret
pub fn merge(
    desired: &BTreeMap<String, String>,
    existing: Option<&JsonValue>,
    forcer: &mut ThunkForcer,
) -> MergeOutcome {
    let current = existing.map(existing_values).unwrap_or_default();
    let mut outcome = MergeOutcome::default();

    for (key, template_value) in desired {
        match current.get(key) {
            Some(value) => {
                outcome.data.insert(key.clone(), value.clone());
                outcome.preserved.push(key.clone());
            }
            None => {
                let value = forcer.force_str(template_value);
                outcome.data.insert(key.clone(), SecretValue::Text(value));
                outcome.added.push(key.clone());
            }
        }
    }

    outcome.dropped = current
        .keys()
        .filter(|key| !desired.contains_key(*key))
        .cloned()
        .collect();

    outcome
}

/// The `v1/Secret` manifest for a merged `StatefulSecret`
pub fn secret_manifest(
    resource: &StatefulSecretResource,
    namespace: Option<&str>,
    outcome: &MergeOutcome,
) -> JsonValue {
    let mut string_data = serde_json::Map::new();
    let mut data = serde_json::Map::new();
    for (key, value) in &outcome.data {
        match value {
            SecretValue::Text(text) => {
                string_data.insert(key.clone(), JsonValue::String(text.clone()));
            }
            SecretValue::Binary(raw) => {
                data.insert(key.clone(), JsonValue::String(raw.clone()));
            }
        }
    }

    let mut metadata = serde_json::to_value(&resource.metadata).unwrap_or_else(|_| json!({}));
    if let (Some(ns), Some(meta)) = (namespace, metadata.as_object_mut()) {
        meta.insert("namespace".into(), JsonValue::String(ns.to_string()));
    }

    let mut manifest = json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "metadata": metadata,
        "type": resource.secret_type.as_deref().unwrap_or("Opaque"),
        "stringData": string_data,
    });
    if !data.is_empty() {
        manifest["data"] = JsonValue::Object(data);
    }
    manifest
}

#[cfg(test)]
mod tests {
    use super::*;
    use nyl_core::RandomThunk;

    fn encode(s: &str) -> String {
        base64::engine::general_purpose::STANDARD.encode(s)
    }

    fn desired(pairs: &[(&str, String)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn test_merge_keeps_existing_drops_removed_adds_new() {
        let existing = json!({"data": {"A": encode("1"), "B": encode("2")}});
        let wanted = desired(&[
            ("B", RandomThunk::hex("s.0", 8).marker()),
            ("C", RandomThunk::hex("s.1", 8).marker()),
        ]);

        let mut forcer = ThunkForcer::seeded(3);
        let outcome = merge(&wanted, Some(&existing), &mut forcer);

        assert_eq!(outcome.data["B"], SecretValue::Text("2".into()));
        let SecretValue::Text(c) = &outcome.data["C"] else {
            panic!("C must be text");
        };
        assert_eq!(c.len(), 16);
        assert!(!outcome.data.contains_key("A"));
        assert_eq!(outcome.added, vec!["C"]);
        assert_eq!(outcome.preserved, vec!["B"]);
        assert_eq!(outcome.dropped, vec!["A"]);
    }

    #[test]
    fn test_preserved_keys_do_not_consume_random_draws() {
        let existing = json!({"data": {"B": encode("2")}});
        let wanted = desired(&[("B", RandomThunk::hex("s.0", 8).marker())]);

        let mut forcer = ThunkForcer::new();
        merge(&wanted, Some(&existing), &mut forcer);
        assert_eq!(forcer.forced(), 0);
    }

    #[test]
    fn test_new_secret_gets_every_key() {
        let wanted = desired(&[
            ("user", "admin".into()),
            ("password", RandomThunk::password("p", 20).marker()),
        ]);
        let outcome = merge(&wanted, None, &mut ThunkForcer::seeded(1));

        assert_eq!(outcome.added.len(), 2);
        assert_eq!(outcome.data["user"], SecretValue::Text("admin".into()));
        assert!(outcome.dropped.is_empty());
    }

    #[test]
    fn test_binary_values_stay_encoded() {
        let raw = base64::engine::general_purpose::STANDARD.encode([0xff, 0xfe, 0x00]);
        let existing = json!({"data": {"cert": raw.clone()}});
        let wanted = desired(&[("cert", "x".into())]);

        let outcome = merge(&wanted, Some(&existing), &mut ThunkForcer::seeded(1));
        assert_eq!(outcome.data["cert"], SecretValue::Binary(raw));
    }

    #[test]
    fn test_secret_manifest() {
        let resource: StatefulSecretResource = serde_json::from_value(json!({
            "metadata": {"name": "creds", "labels": {"app": "db"}},
            "stringData": {"password": "x"},
        }))
        .unwrap();
        let outcome = merge(&resource.desired().unwrap(), None, &mut ThunkForcer::seeded(1));

        let manifest = secret_manifest(&resource, Some("db"), &outcome);
        assert_eq!(manifest["kind"], "Secret");
        assert_eq!(manifest["type"], "Opaque");
        assert_eq!(manifest["metadata"]["namespace"], "db");
        assert_eq!(manifest["metadata"]["labels"]["app"], "db");
        assert_eq!(manifest["stringData"]["password"], "x");
        assert!(manifest.get("data").is_none());
    }
}
