//! Resource classification
//!
//! Expanded YAML documents are either Nyl resources (`apiVersion: nyl.io/v1`)
//! or passthrough Kubernetes manifests. Nyl resources are deserialized into
//! typed structs here; passthrough manifests stay as raw JSON values.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{CoreError, Result};
use crate::values::Values;

pub const NYL_API_VERSION: &str = "nyl.io/v1";
pub const NYL_GROUP: &str = "nyl.io";

/// Annotation naming the owning Application on every emitted resource
pub const APPLICATION_ANNOTATION: &str = "nyl.io/application";

/// Kinds that are never namespaced, and so never receive a default namespace
pub const CLUSTER_SCOPED_KINDS: &[&str] = &[
    "APIService",
    "Application",
    "CSIDriver",
    "ClusterIssuer",
    "ClusterRole",
    "ClusterRoleBinding",
    "CustomResourceDefinition",
    "IngressClass",
    "MutatingWebhookConfiguration",
    "Namespace",
    "Node",
    "PersistentVolume",
    "PriorityClass",
    "RuntimeClass",
    "StorageClass",
    "ValidatingWebhookConfiguration",
];

pub fn is_cluster_scoped(kind: &str) -> bool {
    CLUSTER_SCOPED_KINDS.contains(&kind)
}

/// Canonical `Kind.group` name (`Deployment.apps`, or `Service` for the core group)
pub fn canonical_group_kind(api_version: &str, kind: &str) -> String {
    match api_version.split_once('/') {
        Some((group, _)) if !group.is_empty() => format!("{kind}.{group}"),
        _ => kind.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NylKind {
    Application,
    Package,
    HelmChart,
    StatefulSecret,
}

impl NylKind {
    pub const ALL: [NylKind; 4] = [
        NylKind::Application,
        NylKind::Package,
        NylKind::HelmChart,
        NylKind::StatefulSecret,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NylKind::Application => "Application",
            NylKind::Package => "Package",
            NylKind::HelmChart => "HelmChart",
            NylKind::StatefulSecret => "StatefulSecret",
        }
    }

    pub fn parse(kind: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == kind)
    }
}

impl fmt::Display for NylKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a resource in the render output
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId {
    pub api_version: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl ResourceId {
    pub fn from_manifest(manifest: &JsonValue) -> Result<Self> {
        let text = |field: &str| manifest.get(field).and_then(|v| v.as_str());
        let meta = |field: &str| {
            manifest
                .get("metadata")
                .and_then(|m| m.get(field))
                .and_then(|v| v.as_str())
        };

        let kind = text("kind").ok_or(CoreError::MissingField {
            field: "kind".to_string(),
        })?;
        let api_version = text("apiVersion").ok_or_else(|| {
            CoreError::invalid_resource(kind, "missing field 'apiVersion'")
        })?;
        let name = meta("name")
            .or_else(|| meta("generateName"))
            .ok_or_else(|| CoreError::invalid_resource(kind, "missing field 'metadata.name'"))?;

        Ok(Self {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            namespace: meta("namespace").map(str::to_string),
            name: name.to_string(),
        })
    }

    pub fn group_kind(&self) -> String {
        canonical_group_kind(&self.api_version, &self.kind)
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.kind, ns, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ObjectMeta {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// `kind: Application`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationResource {
    pub metadata: ObjectMeta,

    /// Package path, relative to the declaring package
    pub package: String,

    /// Default namespace for owned resources and references
    #[serde(default)]
    pub namespace: Option<String>,

    #[serde(default)]
    pub values: Values,

    /// Visible secret stores; `None` means all deployment stores
    #[serde(default)]
    pub secret_stores: Option<Vec<String>>,
}

/// `kind: Package`
#[derive(Debug, Clone, Deserialize)]
pub struct PackageResource {
    pub metadata: ObjectMeta,

    pub package: String,

    #[serde(default, alias = "parameters")]
    pub values: Values,
}

/// Chart coordinates of a `HelmChart`
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct ChartRef {
    #[serde(default)]
    pub repository: Option<String>,
    /// Git repository URL, optionally with `?ref=`
    #[serde(default)]
    pub git: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    /// Chart directory; relative to the checkout when `git` is set
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct ReleaseMetadata {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
}

/// `kind: HelmChart`
#[derive(Debug, Clone, Deserialize)]
pub struct HelmChartResource {
    pub metadata: ObjectMeta,

    pub chart: ChartRef,

    #[serde(default)]
    pub release: ReleaseMetadata,

    #[serde(default)]
    pub values: Values,
}

impl HelmChartResource {
    pub fn release_name(&self) -> &str {
        self.release.name.as_deref().unwrap_or(&self.metadata.name)
    }
}

/// `kind: StatefulSecret`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatefulSecretResource {
    pub metadata: ObjectMeta,

    #[serde(default, rename = "type")]
    pub secret_type: Option<String>,

    /// Desired keys; scalar values are stringified
    #[serde(default)]
    pub string_data: BTreeMap<String, JsonValue>,
}

impl StatefulSecretResource {
    pub fn desired(&self) -> Result<BTreeMap<String, String>> {
        self.string_data
            .iter()
            .map(|(key, value)| {
                let text = match value {
                    JsonValue::String(s) => s.clone(),
                    JsonValue::Number(n) => n.to_string(),
                    JsonValue::Bool(b) => b.to_string(),
                    _ => {
                        return Err(CoreError::invalid_resource(
                            format!("StatefulSecret/{}", self.metadata.name),
                            format!("stringData.{key} must be a scalar"),
                        ));
                    }
                };
                Ok((key.clone(), text))
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
pub enum NylResource {
    Application(ApplicationResource),
    Package(PackageResource),
    HelmChart(HelmChartResource),
    StatefulSecret(StatefulSecretResource),
}

impl NylResource {
    pub fn kind(&self) -> NylKind {
        match self {
            NylResource::Application(_) => NylKind::Application,
            NylResource::Package(_) => NylKind::Package,
            NylResource::HelmChart(_) => NylKind::HelmChart,
            NylResource::StatefulSecret(_) => NylKind::StatefulSecret,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            NylResource::Application(r) => &r.metadata.name,
            NylResource::Package(r) => &r.metadata.name,
            NylResource::HelmChart(r) => &r.metadata.name,
            NylResource::StatefulSecret(r) => &r.metadata.name,
        }
    }
}

/// Classification of one expanded document
#[derive(Debug, Clone)]
pub enum Classified {
    Nyl(NylResource),
    /// `nyl.io/v1` with a kind Nyl does not know
    UnknownNyl(String),
    Passthrough,
}

/// Classify a parsed document, deserializing Nyl kinds
pub fn classify(doc: &JsonValue) -> Result<Classified> {
    let api_version = doc.get("apiVersion").and_then(|v| v.as_str()).unwrap_or("");
    let kind = doc.get("kind").and_then(|v| v.as_str()).unwrap_or("");

    if let Some(version) = api_version.strip_prefix("nyl.io/") {
        if version != "v1" {
            return Err(CoreError::invalid_resource(
                kind,
                format!("unsupported apiVersion '{api_version}', expected '{NYL_API_VERSION}'"),
            ));
        }
    } else {
        return Ok(Classified::Passthrough);
    }

    let Some(nyl_kind) = NylKind::parse(kind) else {
        return Ok(Classified::UnknownNyl(kind.to_string()));
    };

    let typed = |e: serde_json::Error| CoreError::invalid_resource(nyl_kind, e.to_string());
    let resource = match nyl_kind {
        NylKind::Application => {
            NylResource::Application(serde_json::from_value(doc.clone()).map_err(typed)?)
        }
        NylKind::Package => {
            NylResource::Package(serde_json::from_value(doc.clone()).map_err(typed)?)
        }
        NylKind::HelmChart => {
            NylResource::HelmChart(serde_json::from_value(doc.clone()).map_err(typed)?)
        }
        NylKind::StatefulSecret => {
            NylResource::StatefulSecret(serde_json::from_value(doc.clone()).map_err(typed)?)
        }
    };

    Ok(Classified::Nyl(resource))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_passthrough() {
        let doc = json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "a"}});
        assert!(matches!(classify(&doc).unwrap(), Classified::Passthrough));
    }

    #[test]
    fn test_package_parameters_alias() {
        let doc = json!({
            "apiVersion": "nyl.io/v1",
            "kind": "Package",
            "metadata": {"name": "db"},
            "package": "./postgres",
            "parameters": {"replicas": 2},
        });
        match classify(&doc).unwrap() {
            Classified::Nyl(NylResource::Package(p)) => {
                assert_eq!(p.package, "./postgres");
                assert_eq!(p.values.get("replicas").unwrap(), 2);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_unknown_nyl_kind() {
        let doc = json!({
            "apiVersion": "nyl.io/v1",
            "kind": "HelmChrat",
            "metadata": {"name": "x"},
        });
        assert!(matches!(classify(&doc).unwrap(), Classified::UnknownNyl(k) if k == "HelmChrat"));
    }

    #[test]
    fn test_unsupported_nyl_version() {
        let doc = json!({"apiVersion": "nyl.io/v2", "kind": "Package", "metadata": {"name": "x"}});
        assert!(classify(&doc).is_err());
    }

    #[test]
    fn test_stateful_secret_stringifies_scalars() {
        let doc = json!({
            "apiVersion": "nyl.io/v1",
            "kind": "StatefulSecret",
            "metadata": {"name": "creds"},
            "stringData": {"port": 5432, "user": "admin"},
        });
        let Classified::Nyl(NylResource::StatefulSecret(s)) = classify(&doc).unwrap() else {
            panic!("expected StatefulSecret");
        };
        let desired = s.desired().unwrap();
        assert_eq!(desired["port"], "5432");
        assert_eq!(desired["user"], "admin");
    }

    #[test]
    fn test_canonical_group_kind() {
        assert_eq!(canonical_group_kind("apps/v1", "Deployment"), "Deployment.apps");
        assert_eq!(canonical_group_kind("v1", "Service"), "Service");
    }

    #[test]
    fn test_resource_id_display() {
        let id = ResourceId::from_manifest(&json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": {"name": "web", "namespace": "apps"},
        }))
        .unwrap();
        assert_eq!(id.to_string(), "Service/apps/web");
        assert_eq!(id.group_kind(), "Service");
    }
}
