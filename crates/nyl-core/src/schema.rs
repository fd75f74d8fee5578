//! Parameter schema validation for packages
//!
//! A package may declare the parameters it accepts in one of two formats:
//! - Standard JSON Schema (`nyl-schema.json`, `values.schema.json`)
//! - A simplified property list (`nyl-schema.yaml` with `schemaVersion: nyl/v1`)
//!
//! Both are compiled to JSON Schema and validated with `jsonschema`.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{CoreError, Result, ValidationErrorInfo};
use crate::values::Values;

/// Property type in the simplified schema
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
    Any,
}

/// A single parameter in the simplified schema
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParamProperty {
    #[serde(rename = "type")]
    pub prop_type: ParamType,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub default: Option<JsonValue>,

    #[serde(default)]
    pub required: bool,

    /// Allowed values
    #[serde(default)]
    pub enum_values: Option<Vec<JsonValue>>,

    /// Regex for strings
    #[serde(default)]
    pub pattern: Option<String>,

    #[serde(default)]
    pub min: Option<f64>,

    #[serde(default)]
    pub max: Option<f64>,

    #[serde(default)]
    pub min_length: Option<usize>,

    #[serde(default)]
    pub max_length: Option<usize>,

    /// Nested properties for objects
    #[serde(default)]
    pub properties: Option<BTreeMap<String, ParamProperty>>,

    /// Item schema for arrays
    #[serde(default)]
    pub items: Option<Box<ParamProperty>>,
}

/// Root of the simplified schema
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParamSchema {
    #[serde(default = "default_schema_version")]
    pub schema_version: String,

    #[serde(default)]
    pub title: Option<String>,

    #[serde(default)]
    pub properties: BTreeMap<String, ParamProperty>,
}

fn default_schema_version() -> String {
    "nyl/v1".to_string()
}

/// Unified schema that handles both formats
#[derive(Debug, Clone)]
pub enum Schema {
    JsonSchema(JsonValue),
    ParamSchema(ParamSchema),
}

impl Schema {
    /// Load a schema file, auto-detecting its format
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let is_json = path.extension().map(|e| e == "json").unwrap_or(false);

        if is_json {
            return Self::from_json_schema(&content);
        }

        let value: JsonValue =
            serde_yaml::from_str(&content).map_err(|e| CoreError::InvalidSchema {
                message: format!("{}: {}", path.display(), e),
            })?;

        if looks_like_json_schema(&value) {
            Ok(Schema::JsonSchema(value))
        } else {
            let params: ParamSchema =
                serde_json::from_value(value).map_err(|e| CoreError::InvalidSchema {
                    message: format!("{}: {}", path.display(), e),
                })?;
            Ok(Schema::ParamSchema(params))
        }
    }

    pub fn from_json_schema(json: &str) -> Result<Self> {
        let value: JsonValue = serde_json::from_str(json)?;
        Ok(Schema::JsonSchema(value))
    }

    pub fn from_param_schema(yaml: &str) -> Result<Self> {
        let params: ParamSchema = serde_yaml::from_str(yaml)?;
        Ok(Schema::ParamSchema(params))
    }

    /// Convert to JSON Schema for validation
    pub fn to_json_schema(&self) -> JsonValue {
        match self {
            Schema::JsonSchema(v) => v.clone(),
            Schema::ParamSchema(s) => convert_param_schema(s),
        }
    }

    /// Default values declared by the schema
    pub fn defaults(&self) -> Values {
        let defaults = match self {
            Schema::JsonSchema(v) => json_schema_defaults(v),
            Schema::ParamSchema(s) => param_defaults(&s.properties),
        };
        Values::from_json_value(defaults)
    }
}

fn looks_like_json_schema(value: &JsonValue) -> bool {
    let Some(obj) = value.as_object() else {
        return false;
    };

    if obj.contains_key("$schema") || obj.contains_key("$id") {
        return true;
    }

    let declares_param_version = obj
        .get("schemaVersion")
        .and_then(|v| v.as_str())
        .map(|s| s.starts_with("nyl/"))
        .unwrap_or(false);

    !declares_param_version && obj.get("type") == Some(&JsonValue::String("object".into()))
}

fn convert_param_schema(schema: &ParamSchema) -> JsonValue {
    let mut json = serde_json::Map::new();
    json.insert(
        "$schema".into(),
        JsonValue::String("http://json-schema.org/draft-07/schema#".into()),
    );
    json.insert("type".into(), JsonValue::String("object".into()));
    if let Some(title) = &schema.title {
        json.insert("title".into(), JsonValue::String(title.clone()));
    }
    insert_properties(&mut json, &schema.properties);
    JsonValue::Object(json)
}

fn insert_properties(
    json: &mut serde_json::Map<String, JsonValue>,
    props: &BTreeMap<String, ParamProperty>,
) {
    let mut properties = serde_json::Map::new();
    let mut required = Vec::new();

    for (name, prop) in props {
        properties.insert(name.clone(), convert_property(prop));
        if prop.required {
            required.push(JsonValue::String(name.clone()));
        }
    }

    json.insert("properties".into(), JsonValue::Object(properties));
    if !required.is_empty() {
        json.insert("required".into(), JsonValue::Array(required));
    }
}

fn convert_property(prop: &ParamProperty) -> JsonValue {
    let mut json = serde_json::Map::new();

    let type_name = match prop.prop_type {
        ParamType::String => Some("string"),
        ParamType::Number => Some("number"),
        ParamType::Integer => Some("integer"),
        ParamType::Boolean => Some("boolean"),
        ParamType::Array => Some("array"),
        ParamType::Object => Some("object"),
        ParamType::Any => None,
    };
    if let Some(type_name) = type_name {
        json.insert("type".into(), JsonValue::String(type_name.into()));
    }

    if let Some(desc) = &prop.description {
        json.insert("description".into(), JsonValue::String(desc.clone()));
    }
    if let Some(default) = &prop.default {
        json.insert("default".into(), default.clone());
    }
    if let Some(values) = &prop.enum_values {
        json.insert("enum".into(), JsonValue::Array(values.clone()));
    }
    if let Some(pattern) = &prop.pattern {
        json.insert("pattern".into(), JsonValue::String(pattern.clone()));
    }
    if let Some(min) = prop.min {
        json.insert("minimum".into(), JsonValue::from(min));
    }
    if let Some(max) = prop.max {
        json.insert("maximum".into(), JsonValue::from(max));
    }
    if let Some(min_len) = prop.min_length {
        json.insert("minLength".into(), JsonValue::from(min_len));
    }
    if let Some(max_len) = prop.max_length {
        json.insert("maxLength".into(), JsonValue::from(max_len));
    }
    if let Some(nested) = &prop.properties {
        insert_properties(&mut json, nested);
    }
    if let Some(items) = &prop.items {
        json.insert("items".into(), convert_property(items));
    }

    JsonValue::Object(json)
}

fn json_schema_defaults(schema: &JsonValue) -> JsonValue {
    let Some(obj) = schema.as_object() else {
        return JsonValue::Null;
    };

    if let Some(default) = obj.get("default") {
        return default.clone();
    }

    let mut defaults = serde_json::Map::new();
    if let Some(props) = obj.get("properties").and_then(|p| p.as_object()) {
        for (key, prop_schema) in props {
            let value = json_schema_defaults(prop_schema);
            if !value.is_null() {
                defaults.insert(key.clone(), value);
            }
        }
    }

    if defaults.is_empty() {
        JsonValue::Null
    } else {
        JsonValue::Object(defaults)
    }
}

fn param_defaults(props: &BTreeMap<String, ParamProperty>) -> JsonValue {
    let mut defaults = serde_json::Map::new();

    for (name, prop) in props {
        if let Some(default) = &prop.default {
            defaults.insert(name.clone(), default.clone());
        } else if let Some(nested) = &prop.properties {
            let nested = param_defaults(nested);
            if !nested.is_null() {
                defaults.insert(name.clone(), nested);
            }
        }
    }

    if defaults.is_empty() {
        JsonValue::Null
    } else {
        JsonValue::Object(defaults)
    }
}

/// Result of schema validation
#[derive(Debug)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<ValidationErrorInfo>,
}

impl ValidationResult {
    pub fn success() -> Self {
        Self {
            is_valid: true,
            errors: vec![],
        }
    }

    pub fn failure(errors: Vec<ValidationErrorInfo>) -> Self {
        Self {
            is_valid: false,
            errors,
        }
    }
}

/// Schema validator with cached compiled schema
pub struct SchemaValidator {
    compiled: jsonschema::Validator,
    defaults: Values,
}

impl std::fmt::Debug for SchemaValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaValidator")
            .field("defaults", &self.defaults)
            .finish_non_exhaustive()
    }
}

impl SchemaValidator {
    pub fn new(schema: &Schema) -> Result<Self> {
        let json_schema = schema.to_json_schema();
        let compiled =
            jsonschema::validator_for(&json_schema).map_err(|e| CoreError::InvalidSchema {
                message: format!("Invalid schema: {}", e),
            })?;

        Ok(Self {
            compiled,
            defaults: schema.defaults(),
        })
    }

    /// Validate values against the schema
    pub fn validate(&self, values: &JsonValue) -> ValidationResult {
        if self.compiled.is_valid(values) {
            return ValidationResult::success();
        }

        let mut errors: Vec<ValidationErrorInfo> = self
            .compiled
            .iter_errors(values)
            .map(|e| {
                let path = e.instance_path.to_string();
                ValidationErrorInfo {
                    path: if path.is_empty() {
                        "(root)".to_string()
                    } else {
                        path
                    },
                    message: e.to_string().replace('"', "'"),
                }
            })
            .collect();
        errors.sort_by(|a, b| a.path.cmp(&b.path));

        ValidationResult::failure(errors)
    }

    /// Apply schema defaults beneath `supplied` and validate the result
    pub fn apply(&self, supplied: Values) -> std::result::Result<Values, Vec<ValidationErrorInfo>> {
        let merged = Values::with_schema_defaults(self.defaults.clone(), supplied);
        let result = self.validate(merged.inner());
        if result.is_valid {
            Ok(merged)
        } else {
            Err(result.errors)
        }
    }

    pub fn defaults(&self) -> &Values {
        &self.defaults
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const POSTGRES_SCHEMA: &str = r#"
schemaVersion: nyl/v1
title: postgres
properties:
  database:
    type: string
    required: true
  replicas:
    type: integer
    default: 1
    min: 1
    max: 5
  storage:
    type: object
    properties:
      size:
        type: string
        default: 10Gi
"#;

    #[test]
    fn test_param_schema_parse() {
        let schema = Schema::from_param_schema(POSTGRES_SCHEMA).unwrap();
        match schema {
            Schema::ParamSchema(s) => {
                assert_eq!(s.title.as_deref(), Some("postgres"));
                assert!(s.properties.contains_key("replicas"));
            }
            _ => panic!("expected simplified schema"),
        }
    }

    #[test]
    fn test_conversion_collects_required() {
        let schema = Schema::from_param_schema(POSTGRES_SCHEMA).unwrap();
        let json = schema.to_json_schema();

        let required = json.get("required").unwrap().as_array().unwrap();
        assert_eq!(required, &vec![JsonValue::String("database".into())]);
        assert_eq!(json["properties"]["replicas"]["maximum"], JsonValue::from(5.0));
    }

    #[test]
    fn test_defaults_include_nested() {
        let schema = Schema::from_param_schema(POSTGRES_SCHEMA).unwrap();
        let defaults = schema.defaults();

        assert_eq!(defaults.get("replicas").unwrap(), 1);
        assert_eq!(defaults.get("storage.size").unwrap(), "10Gi");
        assert!(defaults.get("database").is_none());
    }

    #[test]
    fn test_apply_merges_defaults_and_validates() {
        let schema = Schema::from_param_schema(POSTGRES_SCHEMA).unwrap();
        let validator = SchemaValidator::new(&schema).unwrap();

        let values = validator
            .apply(Values(serde_json::json!({"database": "app"})))
            .unwrap();
        assert_eq!(values.get("replicas").unwrap(), 1);
        assert_eq!(values.get("database").unwrap(), "app");
    }

    #[test]
    fn test_apply_names_offending_field() {
        let schema = Schema::from_param_schema(POSTGRES_SCHEMA).unwrap();
        let validator = SchemaValidator::new(&schema).unwrap();

        let errors = validator
            .apply(Values(serde_json::json!({"database": "app", "replicas": 9})))
            .unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].path, "/replicas");
    }

    #[test]
    fn test_missing_required_field() {
        let schema = Schema::from_param_schema(POSTGRES_SCHEMA).unwrap();
        let validator = SchemaValidator::new(&schema).unwrap();

        let errors = validator.apply(Values::new()).unwrap_err();
        assert!(errors.iter().any(|e| e.message.contains("database")));
    }

    #[test]
    fn test_json_schema_detection() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nyl-schema.yaml");
        std::fs::write(
            &path,
            "type: object\nproperties:\n  name:\n    type: string\n    default: web\n",
        )
        .unwrap();

        let schema = Schema::from_file(&path).unwrap();
        assert!(matches!(schema, Schema::JsonSchema(_)));
        assert_eq!(schema.defaults().get("name").unwrap(), "web");
    }
}
