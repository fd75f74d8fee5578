//! Output Emitter
//!
//! The result of one render: emitted manifests in depth-first package order,
//! notes about deferred resources, and fatal failures.

use base64::Engine as _;
use nyl_core::resource::{NYL_API_VERSION, NYL_GROUP};
use nyl_core::{MissingDependency, ResourceId};
use serde_json::{Value as JsonValue, json};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;

use crate::graph::SourceLocation;

pub const APPLYSET_ID_LABEL: &str = "applyset.kubernetes.io/id";
pub const APPLYSET_TOOLING_ANNOTATION: &str = "applyset.kubernetes.io/tooling";
pub const APPLYSET_CONTAINS_ANNOTATION: &str = "applyset.kubernetes.io/contains-group-kinds";

/// A fully resolved manifest
#[derive(Debug, Clone, PartialEq)]
pub struct EmittedManifest {
    pub resource: ResourceId,
    /// Owning application; `None` only for Application manifests themselves
    pub application: Option<String>,
    pub manifest: JsonValue,
}

/// A resource withheld from output until its dependencies exist
#[derive(Debug, Clone, PartialEq)]
pub struct DeferredNote {
    /// `None` when the template did not expand far enough to tell
    pub resource: Option<ResourceId>,
    pub location: Option<SourceLocation>,
    pub waiting_on: Vec<MissingDependency>,
}

impl fmt::Display for DeferredNote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.resource, &self.location) {
            (Some(resource), _) => write!(f, "{resource}")?,
            (None, Some(location)) => write!(f, "{location}")?,
            (None, None) => f.write_str("<unknown>")?,
        }
        let waiting: Vec<String> = self.waiting_on.iter().map(|m| m.to_string()).collect();
        write!(f, " waiting on {}", waiting.join(", "))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    TemplateSyntax,
    YamlParse,
    SchemaValidation,
    CycleDetected,
    PackageLoad,
    SecretNotFound,
    SecretStore,
    InvalidReference,
    HelmRender,
    InvalidResource,
    NestedApplication,
    UnattributedResource,
}

impl FailureKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::TemplateSyntax => "TemplateSyntaxError",
            Self::YamlParse => "YamlParseError",
            Self::SchemaValidation => "SchemaValidationError",
            Self::CycleDetected => "CycleDetectedError",
            Self::PackageLoad => "PackageLoadError",
            Self::SecretNotFound => "SecretNotFoundError",
            Self::SecretStore => "SecretStoreError",
            Self::InvalidReference => "InvalidReferenceError",
            Self::HelmRender => "HelmRenderError",
            Self::InvalidResource => "InvalidResourceError",
            Self::NestedApplication => "NestedApplicationError",
            Self::UnattributedResource => "UnattributedResourceError",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A fatal failure, scoped to a resource or a package instance
#[derive(Debug, Clone)]
pub struct RenderFailure {
    /// Resource identity or package path the failure aborted
    pub scope: String,
    pub kind: FailureKind,
    pub message: String,
    pub location: Option<SourceLocation>,
    /// Template diagnostic, for syntax errors
    pub diagnostic: Option<crate::error::TemplateError>,
}

impl RenderFailure {
    pub fn new(scope: impl Into<String>, kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            kind,
            message: message.into(),
            location: None,
            diagnostic: None,
        }
    }

    pub fn at(mut self, location: SourceLocation) -> Self {
        self.location = Some(location);
        self
    }

    pub fn with_diagnostic(mut self, diagnostic: crate::error::TemplateError) -> Self {
        self.diagnostic = Some(diagnostic);
        self
    }
}

impl fmt::Display for RenderFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} in {}: {}", self.kind, self.scope, self.message)?;
        if let Some(location) = &self.location {
            write!(f, " ({location})")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct RenderResult {
    pub manifests: Vec<EmittedManifest>,
    pub deferred: Vec<DeferredNote>,
    pub errors: Vec<RenderFailure>,
}

impl RenderResult {
    pub fn has_fatal(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Everything rendered and nothing is waiting
    pub fn is_complete(&self) -> bool {
        self.errors.is_empty() && self.deferred.is_empty()
    }

    /// `---` separated YAML stream with sorted mapping keys
    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        let mut out = String::new();
        for emitted in &self.manifests {
            out.push_str("---\n");
            out.push_str(&serde_yaml::to_string(&sorted(&emitted.manifest))?);
        }
        Ok(out)
    }
}

/// Rebuild a value with every mapping in key order
fn sorted(value: &JsonValue) -> JsonValue {
    match value {
        JsonValue::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            JsonValue::Object(
                keys.into_iter()
                    .map(|k| (k.clone(), sorted(&map[k])))
                    .collect(),
            )
        }
        JsonValue::Array(items) => JsonValue::Array(items.iter().map(sorted).collect()),
        other => other.clone(),
    }
}

/// ApplySet id of a cluster-scoped `nyl.io` Application
pub fn applyset_id(name: &str) -> String {
    let digest = Sha256::digest(format!("{name}..Application.{NYL_GROUP}").as_bytes());
    let uid = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest);
    format!("applyset-{uid}-v1")
}

/// The Application manifest acting as ApplySet parent for `owned`
pub fn application_manifest<'a>(
    name: &str,
    owned: impl IntoIterator<Item = &'a EmittedManifest>,
) -> JsonValue {
    let group_kinds: BTreeSet<String> = owned
        .into_iter()
        .map(|m| m.resource.group_kind())
        .collect();
    let group_kinds: Vec<String> = group_kinds.into_iter().collect();

    json!({
        "apiVersion": NYL_API_VERSION,
        "kind": "Application",
        "metadata": {
            "name": name,
            "labels": {
                APPLYSET_ID_LABEL: applyset_id(name),
            },
            "annotations": {
                APPLYSET_TOOLING_ANNOTATION: format!("nyl/{}", env!("CARGO_PKG_VERSION")),
                APPLYSET_CONTAINS_ANNOTATION: group_kinds.join(","),
            },
        },
    })
}
