//! Parameter values with deep merge support

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::path::Path;

use crate::error::{CoreError, Result};

/// Values container with deep merge capability
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Values(pub JsonValue);

impl Values {
    /// Create empty values
    pub fn new() -> Self {
        Self(JsonValue::Object(serde_json::Map::new()))
    }

    /// Load values from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&content)
    }

    /// Parse values from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let value: JsonValue = serde_yaml::from_str(yaml)?;
        Ok(Self::from_json_value(value))
    }

    /// Wrap a JSON value, treating `null` as an empty mapping
    pub fn from_json_value(value: JsonValue) -> Self {
        match value {
            JsonValue::Null => Self::new(),
            other => Self(other),
        }
    }

    /// Deep merge another Values into this one
    ///
    /// Rules:
    /// - Scalars: overlay replaces base
    /// - Objects: recursive merge
    /// - Arrays: overlay replaces base (not appended)
    pub fn merge(&mut self, overlay: &Values) {
        deep_merge(&mut self.0, &overlay.0);
    }

    /// Set a value by dotted path (e.g., "image.tag")
    pub fn set(&mut self, path: &str, value: JsonValue) -> Result<()> {
        let parts: Vec<&str> = path.split('.').collect();
        if parts.iter().any(|p| p.is_empty()) {
            return Err(CoreError::ValuesMerge {
                message: format!("Invalid value path '{}'", path),
            });
        }
        set_nested(&mut self.0, &parts, value);
        Ok(())
    }

    /// Get a value by dotted path
    pub fn get(&self, path: &str) -> Option<&JsonValue> {
        let parts: Vec<&str> = path.split('.').collect();
        get_nested(&self.0, &parts)
    }

    /// Get the inner JSON value
    pub fn inner(&self) -> &JsonValue {
        &self.0
    }

    /// Convert to JSON value
    pub fn into_inner(self) -> JsonValue {
        self.0
    }

    /// Check if values are empty
    pub fn is_empty(&self) -> bool {
        match &self.0 {
            JsonValue::Object(map) => map.is_empty(),
            JsonValue::Null => true,
            _ => false,
        }
    }

    /// Layer supplied values on top of schema defaults
    pub fn with_schema_defaults(schema_defaults: Values, supplied: Values) -> Self {
        let mut result = schema_defaults;
        if result.0.is_null() {
            result = Values::new();
        }
        result.merge(&supplied);
        result
    }
}

/// Deep merge two JSON values
fn deep_merge(base: &mut JsonValue, overlay: &JsonValue) {
    match (base, overlay) {
        (JsonValue::Object(base_map), JsonValue::Object(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(base_value) => deep_merge(base_value, overlay_value),
                    None => {
                        base_map.insert(key.clone(), overlay_value.clone());
                    }
                }
            }
        }
        (base, overlay) => {
            *base = overlay.clone();
        }
    }
}

fn set_nested(value: &mut JsonValue, path: &[&str], new_value: JsonValue) {
    let Some((key, remaining)) = path.split_first() else {
        *value = new_value;
        return;
    };

    if !value.is_object() {
        *value = JsonValue::Object(serde_json::Map::new());
    }

    if let JsonValue::Object(map) = value {
        let entry = map
            .entry(key.to_string())
            .or_insert_with(|| JsonValue::Object(serde_json::Map::new()));
        set_nested(entry, remaining, new_value);
    }
}

fn get_nested<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    match path.split_first() {
        None => Some(value),
        Some((key, remaining)) => value.get(*key).and_then(|v| get_nested(v, remaining)),
    }
}

/// Parse --set arguments (key=value format)
pub fn parse_set_values(set_args: &[String]) -> Result<Values> {
    let mut values = Values::new();

    for arg in set_args {
        let (key, val) = arg.split_once('=').ok_or_else(|| CoreError::ValuesMerge {
            message: format!("Invalid --set format: '{}'. Expected key=value", arg),
        })?;

        let json_value = match val {
            "true" => JsonValue::Bool(true),
            "false" => JsonValue::Bool(false),
            "null" => JsonValue::Null,
            _ => {
                if let Ok(num) = val.parse::<i64>() {
                    JsonValue::Number(num.into())
                } else if val.starts_with('[') || val.starts_with('{') {
                    serde_json::from_str(val).unwrap_or_else(|_| JsonValue::String(val.to_string()))
                } else {
                    JsonValue::String(val.to_string())
                }
            }
        };

        values.set(key, json_value)?;
    }

    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deep_merge() {
        let mut base = Values::from_yaml(
            r#"
database:
  host: postgres
  port: 5432
replicas: 1
"#,
        )
        .unwrap();

        let overlay = Values::from_yaml(
            r#"
database:
  port: 6432
  sslmode: require
replicas: 3
"#,
        )
        .unwrap();

        base.merge(&overlay);

        assert_eq!(base.get("database.host").unwrap(), "postgres");
        assert_eq!(base.get("database.port").unwrap(), 6432);
        assert_eq!(base.get("database.sslmode").unwrap(), "require");
        assert_eq!(base.get("replicas").unwrap(), 3);
    }

    #[test]
    fn test_null_document_is_empty() {
        let values = Values::from_yaml("").unwrap();
        assert!(values.is_empty());
    }

    #[test]
    fn test_schema_defaults_are_overridden() {
        let defaults = Values(serde_json::json!({"replicas": 1, "image": {"tag": "latest"}}));
        let supplied = Values(serde_json::json!({"image": {"tag": "v2"}}));

        let result = Values::with_schema_defaults(defaults, supplied);
        assert_eq!(result.get("replicas").unwrap(), 1);
        assert_eq!(result.get("image.tag").unwrap(), "v2");
    }

    #[test]
    fn test_parse_set_values() {
        let args = vec![
            "ingress.host=example.org".to_string(),
            "replicas=5".to_string(),
            "debug=true".to_string(),
            "ports=[80, 443]".to_string(),
        ];

        let values = parse_set_values(&args).unwrap();

        assert_eq!(values.get("ingress.host").unwrap(), "example.org");
        assert_eq!(values.get("replicas").unwrap(), 5);
        assert_eq!(values.get("debug").unwrap(), true);
        assert_eq!(values.get("ports").unwrap(), &serde_json::json!([80, 443]));
    }

    #[test]
    fn test_parse_set_values_rejects_missing_equals() {
        let result = parse_set_values(&["replicas".to_string()]);
        assert!(matches!(result, Err(CoreError::ValuesMerge { .. })));
    }
}
