//! Nyl Core - data model for the Nyl rendering engine
//!
//! - `Package`: a directory (or file) of templated Kubernetes resources
//! - `Values`: parameter values with deep merge support
//! - `Schema`: parameter schema validation
//! - `resource`: classification of Nyl kinds versus passthrough manifests
//! - `lookup`: `ref()` and `secret()` identities and their tagged results
//! - `random`: lazily forced random values
//! - `DeploymentConfig`: secret stores, search path and cluster settings

pub mod context;
pub mod deployment;
pub mod error;
pub mod lookup;
pub mod package;
pub mod random;
pub mod resource;
pub mod schema;
pub mod values;

pub use context::{ApplicationInfo, PackageInfo, TemplateContext};
pub use deployment::{ClusterConfig, DeploymentConfig, SecretStoreConfig};
pub use error::{CoreError, Result, ValidationErrorInfo};
pub use lookup::{
    DeferReason, FieldLookup, Lookup, LookupError, LookupErrorKind, LookupResult,
    MissingDependency, ObjectKey, Reference, SecretRef,
};
pub use package::{Package, TemplateFile};
pub use random::{RandomThunk, SecretCharset, ThunkForcer};
pub use resource::{
    ApplicationResource, ChartRef, Classified, HelmChartResource, NylKind, NylResource,
    ObjectMeta, PackageResource, ReleaseMetadata, ResourceId, StatefulSecretResource, classify,
};
pub use schema::{ParamProperty, ParamSchema, ParamType, Schema, SchemaValidator, ValidationResult};
pub use values::{Values, parse_set_values};
