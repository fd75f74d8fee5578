//! Template rendering context

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::package::Package;
use crate::values::Values;

/// Context available to the templates of one package instance.
///
/// Only the instance's own values are visible; nothing from the parent
/// instance's context leaks in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateContext {
    pub values: JsonValue,

    /// Owning application, if any
    pub application: Option<ApplicationInfo>,

    pub package: PackageInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationInfo {
    pub name: String,
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageInfo {
    pub name: String,
    pub path: String,
}

impl From<&Package> for PackageInfo {
    fn from(package: &Package) -> Self {
        Self {
            name: package.name.clone(),
            path: package.path.display().to_string(),
        }
    }
}

impl TemplateContext {
    pub fn new(values: &Values, package: &Package, application: Option<ApplicationInfo>) -> Self {
        let values = match values.inner() {
            JsonValue::Null => JsonValue::Object(serde_json::Map::new()),
            other => other.clone(),
        };

        Self {
            values,
            application,
            package: PackageInfo::from(package),
        }
    }

    /// Namespace references default to when none is given
    pub fn default_namespace(&self) -> &str {
        self.application
            .as_ref()
            .and_then(|a| a.namespace.as_deref())
            .unwrap_or("default")
    }

    /// Convert to a minijinja-compatible JSON object
    pub fn to_json(&self) -> JsonValue {
        serde_json::to_value(self).unwrap_or(JsonValue::Null)
    }
}
