//! Lookup identities and results
//!
//! Templates may reference values that only exist in the live cluster
//! (`ref()`) or in a secret store (`secret()`). Every such lookup resolves to
//! a [`LookupResult`]: a value, a deferral naming the missing dependency, or
//! an error. Deferral is not an error; the caller decides how to surface it.

use base64::Engine as _;
use serde_json::Value as JsonValue;
use std::fmt;

/// Identity of a live cluster object: `Kind[.group]`, namespace, name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    /// Kind, optionally qualified with its API group (`Certificate.cert-manager.io`)
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(
        kind: impl Into<String>,
        namespace: Option<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            kind: kind.into(),
            namespace,
            name: name.into(),
        }
    }

    /// Bare kind without group qualification
    pub fn kind_name(&self) -> &str {
        self.kind.split_once('.').map(|(k, _)| k).unwrap_or(&self.kind)
    }

    /// API group if the kind is qualified
    pub fn group(&self) -> Option<&str> {
        self.kind.split_once('.').map(|(_, g)| g)
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}:{}/{}", self.kind, ns, self.name),
            None => write!(f, "{}:{}", self.kind, self.name),
        }
    }
}

/// A `ref()` call: an object plus a field path within it
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Reference {
    pub key: ObjectKey,
    pub field: String,
}

impl Reference {
    /// Build from the structured call form.
    ///
    /// `name` may carry the namespace as `ns/name`; an explicit `namespace`
    /// argument wins. Without either, `default_namespace` applies.
    pub fn from_parts(
        kind: &str,
        name: &str,
        field: &str,
        namespace: Option<&str>,
        default_namespace: &str,
    ) -> Result<Self, String> {
        if kind.is_empty() {
            return Err("reference kind must not be empty".to_string());
        }
        if field.is_empty() {
            return Err(format!("reference to {kind} '{name}' has no field"));
        }

        let (embedded_ns, name) = match name.split_once('/') {
            Some((ns, name)) => (Some(ns), name),
            None => (None, name),
        };
        if name.is_empty() {
            return Err(format!("reference to {kind} has no name"));
        }

        let namespace = namespace.or(embedded_ns).unwrap_or(default_namespace);

        Ok(Self {
            key: ObjectKey::new(kind, Some(namespace.to_string()), name),
            field: field.to_string(),
        })
    }

    /// Parse the shorthand `Kind:[ns/]name.field`
    pub fn parse_shorthand(spec: &str, default_namespace: &str) -> Result<Self, String> {
        let (kind, rest) = spec
            .split_once(':')
            .ok_or_else(|| format!("invalid reference '{spec}': expected 'Kind:name.field'"))?;
        let (target, field) = rest
            .split_once('.')
            .ok_or_else(|| format!("invalid reference '{spec}': missing '.field'"))?;

        Self::from_parts(kind, target, field, None, default_namespace)
            .map_err(|e| format!("invalid reference '{spec}': {e}"))
    }

    /// Extract the referenced field from a fetched object.
    ///
    /// `Secret` values under `data` are decoded from base64. A bare field on
    /// a `Secret` or `ConfigMap` means `data.<field>`; a dotted field is taken
    /// as a `data` key when one by that exact name exists (`tls.crt`), and as
    /// a path into the object otherwise.
    pub fn extract(&self, object: &JsonValue) -> FieldLookup {
        let kind = self.key.kind_name();
        let is_data_kind = matches!(kind, "Secret" | "ConfigMap") && self.key.group().is_none();
        let has_data_key = |key: &str| {
            let in_section = |section: &str| object.get(section).and_then(|d| d.get(key)).is_some();
            in_section("data") || (kind == "Secret" && in_section("stringData"))
        };

        let data_key = if is_data_kind {
            let field = self.field.as_str();
            match field.strip_prefix("data.") {
                Some(key) => Some(key),
                None if field == "data" => None,
                None if !field.contains('.') || has_data_key(field) => Some(field),
                None => None,
            }
        } else {
            None
        };

        if let Some(key) = data_key {
            if kind == "Secret" {
                if let Some(v) = object.get("stringData").and_then(|d| d.get(key)) {
                    return FieldLookup::Found(v.clone());
                }
            }
            let Some(raw) = object.get("data").and_then(|d| d.get(key)) else {
                return FieldLookup::Missing;
            };
            if kind == "Secret" {
                return match raw.as_str().map(decode_secret_value) {
                    Some(Ok(decoded)) => FieldLookup::Found(JsonValue::String(decoded)),
                    Some(Err(e)) => FieldLookup::Invalid(format!(
                        "{}: key '{}' is not valid base64: {}",
                        self.key, key, e
                    )),
                    None => {
                        FieldLookup::Invalid(format!("{}: key '{}' is not a string", self.key, key))
                    }
                };
            }
            return FieldLookup::Found(raw.clone());
        }

        match get_path(object, &self.field) {
            Some(v) => FieldLookup::Found(v.clone()),
            None => FieldLookup::Missing,
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.key, self.field)
    }
}

fn decode_secret_value(raw: &str) -> Result<String, String> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(raw.trim())
        .map_err(|e| e.to_string())?;
    String::from_utf8(bytes).map_err(|e| e.to_string())
}

/// Dotted path lookup; numeric segments index arrays
pub fn get_path<'a>(value: &'a JsonValue, path: &str) -> Option<&'a JsonValue> {
    path.split('.').try_fold(value, |current, segment| match current {
        JsonValue::Object(map) => map.get(segment),
        JsonValue::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Outcome of extracting a field from an object that exists
#[derive(Debug, Clone, PartialEq)]
pub enum FieldLookup {
    Found(JsonValue),
    Missing,
    Invalid(String),
}

/// A `secret()` call
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SecretRef {
    pub store: String,
    pub key: String,
    pub optional: bool,
}

impl fmt::Display for SecretRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "secret {}:{}", self.store, self.key)
    }
}

/// Any lookup a template can perform
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Lookup {
    Ref(Reference),
    Secret(SecretRef),
}

impl fmt::Display for Lookup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lookup::Ref(r) => write!(f, "{r}"),
            Lookup::Secret(s) => write!(f, "{s}"),
        }
    }
}

/// Why a lookup could not be satisfied yet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeferReason {
    /// Target object does not exist
    NotFound,
    /// Object exists but the field is not set (yet)
    FieldMissing,
    /// Read failed or timed out
    ClusterUnavailable(String),
    /// Not in the snapshot yet; the resolver fetches and retries
    NotYetFetched,
    /// Still unfetched after the last evaluation pass
    TooDeep,
}

impl fmt::Display for DeferReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeferReason::NotFound => write!(f, "not found"),
            DeferReason::FieldMissing => write!(f, "field not set"),
            DeferReason::ClusterUnavailable(reason) => write!(f, "cluster unavailable: {reason}"),
            DeferReason::NotYetFetched => write!(f, "not fetched"),
            DeferReason::TooDeep => write!(f, "lookup chain too deep"),
        }
    }
}

/// The dependency a deferred lookup is waiting on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingDependency {
    pub lookup: Lookup,
    pub reason: DeferReason,
}

impl fmt::Display for MissingDependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.lookup, self.reason)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupErrorKind {
    SecretNotFound,
    SecretStoreNotFound,
    SecretStoreFailed,
    InvalidReference,
}

impl fmt::Display for LookupErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LookupErrorKind::SecretNotFound => "SecretNotFoundError",
            LookupErrorKind::SecretStoreNotFound => "SecretStoreNotFoundError",
            LookupErrorKind::SecretStoreFailed => "SecretStoreError",
            LookupErrorKind::InvalidReference => "InvalidReferenceError",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupError {
    pub kind: LookupErrorKind,
    pub detail: String,
}

impl LookupError {
    pub fn new(kind: LookupErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for LookupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.detail)
    }
}

/// Tagged result of a single lookup
#[derive(Debug, Clone, PartialEq)]
pub enum LookupResult {
    Resolved(JsonValue),
    Deferred(MissingDependency),
    Error(LookupError),
}

impl LookupResult {
    pub fn deferred(lookup: Lookup, reason: DeferReason) -> Self {
        LookupResult::Deferred(MissingDependency { lookup, reason })
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, LookupResult::Resolved(_))
    }
}
