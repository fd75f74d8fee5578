//! Package Loader
//!
//! Instantiations form a tree stored as an arena: every [`PackageInstance`]
//! holds the index of its parent instead of a reference to it. Loading a
//! child checks the chain of ancestors for the same package path, which
//! makes the tree acyclic.

use nyl_core::{
    ApplicationInfo, CoreError, Package, ResourceId, SchemaValidator, TemplateContext,
    ValidationErrorInfo, Values,
};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

pub type InstanceId = usize;
pub type ApplicationId = usize;

/// An Application owning every resource below it
#[derive(Debug, Clone, PartialEq)]
pub struct ApplicationBinding {
    pub name: String,
    pub namespace: Option<String>,
    /// Secret stores visible to the application; `None` means all
    pub secret_stores: Option<Vec<String>>,
}

impl ApplicationBinding {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: None,
            secret_stores: None,
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn info(&self) -> ApplicationInfo {
        ApplicationInfo {
            name: self.name.clone(),
            namespace: self.namespace.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PackageInstance {
    pub parent: Option<InstanceId>,
    pub package: Arc<Package>,
    /// Validated values with schema defaults applied
    pub values: Values,
    pub application: Option<ApplicationId>,
    /// The application this instance is the root of
    pub root_of: Option<ApplicationId>,
    /// The `Package` or `Application` resource that created this instance
    pub origin: Option<ResourceId>,
    pub aborted: bool,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error(transparent)]
    Package(#[from] CoreError),

    #[error(
        "values for package '{package}' do not match its schema: {}",
        format_violations(.errors)
    )]
    Schema {
        package: String,
        errors: Vec<ValidationErrorInfo>,
    },

    #[error("package instantiation cycle: {}", format_cycle(.path))]
    Cycle {
        path: Vec<PathBuf>,
        members: Vec<InstanceId>,
    },
}

fn format_violations(errors: &[ValidationErrorInfo]) -> String {
    errors
        .iter()
        .map(|e| format!("{}: {}", e.path, e.message))
        .collect::<Vec<_>>()
        .join("; ")
}

fn format_cycle(path: &[PathBuf]) -> String {
    path.iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Arena of package instances for one render
#[derive(Debug, Default)]
pub struct InstanceTree {
    instances: Vec<PackageInstance>,
    applications: Vec<ApplicationBinding>,
    /// Loaded packages by canonical path; loading is the same for every instance
    packages: HashMap<PathBuf, Arc<Package>>,
}

impl InstanceTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: InstanceId) -> &PackageInstance {
        &self.instances[id]
    }

    pub fn application(&self, id: ApplicationId) -> &ApplicationBinding {
        &self.applications[id]
    }

    pub fn application_of(&self, id: InstanceId) -> Option<&ApplicationBinding> {
        self.instances[id].application.map(|app| &self.applications[app])
    }

    pub fn add_application(&mut self, binding: ApplicationBinding) -> ApplicationId {
        self.applications.push(binding);
        self.applications.len() - 1
    }

    /// Instantiate the root package, optionally as an application
    pub fn add_root(
        &mut self,
        path: &Path,
        values: Values,
        application: Option<ApplicationBinding>,
    ) -> Result<InstanceId, LoadError> {
        let package = self.load(path)?;
        let values = validate(&package, values)?;
        let application = application.map(|binding| self.add_application(binding));

        Ok(self.push(PackageInstance {
            parent: None,
            package,
            values,
            application,
            root_of: application,
            origin: None,
            aborted: false,
        }))
    }

    /// Instantiate `reference` (relative to the parent's package) below `parent`
    pub fn add_child(
        &mut self,
        parent: InstanceId,
        reference: &str,
        values: Values,
        application: ChildApplication,
        origin: ResourceId,
    ) -> Result<InstanceId, LoadError> {
        let target = self.instances[parent].package.resolve_relative(reference);
        let package = self.load(&target)?;

        if let Some(members) = self.cycle(parent, &package.path) {
            let mut path: Vec<PathBuf> = members
                .iter()
                .map(|id| self.instances[*id].package.path.clone())
                .collect();
            path.push(package.path.clone());
            for id in &members {
                self.instances[*id].aborted = true;
            }
            return Err(LoadError::Cycle { path, members });
        }

        let values = validate(&package, values)?;
        let (application, root_of) = match application {
            ChildApplication::Inherit => (self.instances[parent].application, None),
            ChildApplication::New(binding) => {
                let app = self.add_application(binding);
                (Some(app), Some(app))
            }
        };

        tracing::debug!(
            parent = %self.instances[parent].package.name,
            package = %package.name,
            "instantiating package"
        );

        Ok(self.push(PackageInstance {
            parent: Some(parent),
            package,
            values,
            application,
            root_of,
            origin: Some(origin),
            aborted: false,
        }))
    }

    /// Template context of an instance: its own values and owning application only
    pub fn context(&self, id: InstanceId) -> TemplateContext {
        let instance = &self.instances[id];
        TemplateContext::new(
            &instance.values,
            &instance.package,
            self.application_of(id).map(ApplicationBinding::info),
        )
    }

    /// Ancestors from the parent up to the root
    pub fn ancestors(&self, id: InstanceId) -> impl Iterator<Item = InstanceId> + '_ {
        std::iter::successors(self.instances[id].parent, |current| {
            self.instances[*current].parent
        })
    }

    /// The instance or one of its ancestors was aborted
    pub fn is_discarded(&self, id: InstanceId) -> bool {
        self.instances[id].aborted || self.ancestors(id).any(|a| self.instances[a].aborted)
    }

    pub fn abort(&mut self, id: InstanceId) {
        self.instances[id].aborted = true;
    }

    /// Instances from the one expanding `path` down to `from`, if `path` is under expansion
    fn cycle(&self, from: InstanceId, path: &Path) -> Option<Vec<InstanceId>> {
        let chain: Vec<InstanceId> = std::iter::once(from).chain(self.ancestors(from)).collect();
        let start = chain
            .iter()
            .position(|id| self.instances[*id].package.path == path)?;
        let mut members: Vec<InstanceId> = chain[..=start].to_vec();
        members.reverse();
        Some(members)
    }

    fn push(&mut self, instance: PackageInstance) -> InstanceId {
        self.instances.push(instance);
        self.instances.len() - 1
    }

    fn load(&mut self, path: &Path) -> Result<Arc<Package>, LoadError> {
        let canonical = path.canonicalize().map_err(|_| CoreError::PackageNotFound {
            path: path.display().to_string(),
        })?;
        if let Some(package) = self.packages.get(&canonical) {
            return Ok(Arc::clone(package));
        }

        let package = Arc::new(Package::load(&canonical)?);
        tracing::info!(package = %package.name, path = %canonical.display(), "loaded package");
        self.packages.insert(canonical, Arc::clone(&package));
        Ok(package)
    }
}

/// Ownership of a child instance
#[derive(Debug, Clone)]
pub enum ChildApplication {
    /// `kind: Package`, owned by the parent's application
    Inherit,
    /// `kind: Application`
    New(ApplicationBinding),
}

fn validate(package: &Package, values: Values) -> Result<Values, LoadError> {
    let Some(schema) = &package.schema else {
        return Ok(values);
    };
    let validator = SchemaValidator::new(schema)?;
    validator.apply(values).map_err(|errors| LoadError::Schema {
        package: package.name.clone(),
        errors,
    })
}

impl fmt::Display for ApplicationBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} (namespace {})", self.name, ns),
            None => f.write_str(&self.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn origin(kind: &str, name: &str) -> ResourceId {
        ResourceId {
            api_version: "nyl.io/v1".into(),
            kind: kind.into(),
            namespace: None,
            name: name.into(),
        }
    }

    fn add_package(
        tree: &mut InstanceTree,
        parent: InstanceId,
        path: &str,
        values: Values,
        name: &str,
    ) -> Result<InstanceId, LoadError> {
        tree.add_child(parent, path, values, ChildApplication::Inherit, origin("Package", name))
    }

    fn package(root: &Path, name: &str, template: &str) -> PathBuf {
        let dir = root.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("main.yaml"), template).unwrap();
        dir
    }

    #[test]
    fn test_child_resolves_relative_and_inherits_application() {
        let tmp = TempDir::new().unwrap();
        let root = package(tmp.path(), "root", "");
        package(&root, "db", "");

        let mut tree = InstanceTree::new();
        let shop = ApplicationBinding::new("shop").with_namespace("shop");
        let r = tree.add_root(&root, Values::new(), Some(shop)).unwrap();
        let db = add_package(&mut tree, r, "./db", Values(json!({"size": 1})), "db").unwrap();

        assert_eq!(tree.get(db).parent, Some(r));
        assert_eq!(tree.application_of(db).unwrap().name, "shop");
        assert_eq!(tree.get(db).root_of, None);
        assert_eq!(tree.context(db).values, json!({"size": 1}));
        assert_eq!(tree.context(db).default_namespace(), "shop");
    }

    #[test]
    fn test_cycle_aborts_every_member() {
        let tmp = TempDir::new().unwrap();
        let a = package(tmp.path(), "a", "");
        package(tmp.path(), "b", "");

        let mut tree = InstanceTree::new();
        let root = tree.add_root(&a, Values::new(), None).unwrap();
        let b = add_package(&mut tree, root, "../b", Values::new(), "b").unwrap();

        match add_package(&mut tree, b, "../a", Values::new(), "a") {
            Err(LoadError::Cycle { path, members }) => {
                assert_eq!(members, vec![root, b]);
                assert_eq!(path.len(), 3);
                assert_eq!(path[0], path[2]);
            }
            other => panic!("expected cycle, got {other:?}"),
        }
        assert!(tree.get(root).aborted);
        assert!(tree.is_discarded(b));
    }

    #[test]
    fn test_same_package_in_siblings_is_not_a_cycle() {
        let tmp = TempDir::new().unwrap();
        let root = package(tmp.path(), "root", "");
        package(&root, "db", "");

        let mut tree = InstanceTree::new();
        let r = tree.add_root(&root, Values::new(), None).unwrap();
        let one = add_package(&mut tree, r, "./db", Values::new(), "one").unwrap();
        let two = add_package(&mut tree, r, "./db", Values::new(), "two").unwrap();

        assert_ne!(one, two);
        assert!(Arc::ptr_eq(&tree.get(one).package, &tree.get(two).package));
        assert_eq!(tree.get(two).origin.as_ref().unwrap().name, "two");
    }

    #[test]
    fn test_schema_violation_names_field() {
        let tmp = TempDir::new().unwrap();
        let root = package(tmp.path(), "root", "");
        let db = package(&root, "db", "");
        std::fs::write(
            db.join("nyl-schema.yaml"),
            "schemaVersion: nyl/v1\nproperties:\n  replicas:\n    type: integer\n    default: 1\n",
        )
        .unwrap();

        let mut tree = InstanceTree::new();
        let r = tree.add_root(&root, Values::new(), None).unwrap();

        let err = add_package(&mut tree, r, "./db", Values(json!({"replicas": "three"})), "db")
            .unwrap_err();
        match err {
            LoadError::Schema { errors, .. } => assert_eq!(errors[0].path, "/replicas"),
            other => panic!("expected schema error, got {other:?}"),
        }

        let ok = add_package(&mut tree, r, "./db", Values::new(), "db").unwrap();
        assert_eq!(tree.get(ok).values.get("replicas").unwrap(), 1);
    }

    #[test]
    fn test_missing_package() {
        let tmp = TempDir::new().unwrap();
        let root = package(tmp.path(), "root", "");
        let mut tree = InstanceTree::new();
        let r = tree.add_root(&root, Values::new(), None).unwrap();
        let err = add_package(&mut tree, r, "./nope", Values::new(), "x").unwrap_err();
        assert!(matches!(err, LoadError::Package(CoreError::PackageNotFound { .. })));
    }
}
