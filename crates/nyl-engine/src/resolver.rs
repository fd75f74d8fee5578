//! Dependency Resolver
//!
//! Drives one render: walks the package instance tree depth-first, expands
//! every template against the per-render [`ClusterSnapshot`] and the secret
//! stores, and routes each resulting document by kind. Deferred documents are
//! withheld whole; failures abort the smallest enclosing unit.

use nyl_core::lookup::{DeferReason, LookupErrorKind};
use nyl_core::resource::{APPLICATION_ANNOTATION, is_cluster_scoped};
use nyl_core::{
    Classified, DeploymentConfig, HelmChartResource, Lookup, LookupResult, MissingDependency,
    NylResource, ObjectKey, Reference, ResourceId, SecretRef, StatefulSecretResource,
    TemplateContext, TemplateFile, ThunkForcer, Values, classify,
};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::evaluator::{EvalFailure, Evaluator, Expansion, pending_keys};
use crate::functions::LookupHandler;
use crate::graph::{self, DocFailure, DocStatus, ResourceSpec, SourceLocation};
use crate::helm::{ChartLocation, DEFAULT_KUBE_VERSION, HelmRenderer, HelmRequest};
use crate::loader::{ApplicationBinding, ChildApplication, InstanceId, InstanceTree, LoadError};
use crate::merge;
use crate::output::{
    DeferredNote, EmittedManifest, FailureKind, RenderFailure, RenderResult, application_manifest,
};
use crate::snapshot::{ClusterReader, ClusterSnapshot, SnapshotEntry};
use crate::stores::SecretStores;
use crate::suggestions::suggest_nyl_kind;

/// Evaluation passes per template; each pass may reveal new objects to fetch
pub const MAX_PASSES: usize = 8;

#[derive(Debug, Clone)]
pub struct RenderOptions {
    /// Bound on every cluster read
    pub read_timeout: Duration,
    /// Passed to Helm; defaults to the server version
    pub kube_version: Option<String>,
    /// Directories searched for bare chart paths
    pub search_path: Vec<PathBuf>,
    /// Seed for random values; `None` draws from the OS
    pub seed: Option<u64>,
    pub max_passes: usize,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(10),
            kube_version: None,
            search_path: Vec::new(),
            seed: None,
            max_passes: MAX_PASSES,
        }
    }
}

impl RenderOptions {
    pub fn from_deployment(config: &DeploymentConfig) -> Self {
        Self {
            read_timeout: config.cluster.read_timeout,
            kube_version: config.kube_version.clone(),
            search_path: config.search_path.clone(),
            ..Self::default()
        }
    }
}

/// What to render
#[derive(Debug, Clone)]
pub struct RenderRequest {
    pub package: PathBuf,
    pub values: Values,
    /// Bind the root package to an application
    pub application: Option<ApplicationBinding>,
}

impl RenderRequest {
    pub fn new(package: impl Into<PathBuf>) -> Self {
        Self {
            package: package.into(),
            values: Values::new(),
            application: None,
        }
    }

    pub fn with_values(mut self, values: Values) -> Self {
        self.values = values;
        self
    }

    pub fn with_application(mut self, application: ApplicationBinding) -> Self {
        self.application = Some(application);
        self
    }
}

/// Renders package trees; holds no state between renders
pub struct Renderer {
    reader: Arc<dyn ClusterReader>,
    helm: Arc<dyn HelmRenderer>,
    stores: SecretStores,
    options: RenderOptions,
    evaluator: Evaluator,
}

impl Renderer {
    pub fn new(reader: Arc<dyn ClusterReader>, helm: Arc<dyn HelmRenderer>) -> Self {
        Self {
            reader,
            helm,
            stores: SecretStores::new(),
            options: RenderOptions::default(),
            evaluator: Evaluator::new(),
        }
    }

    pub fn with_stores(mut self, stores: SecretStores) -> Self {
        self.stores = stores;
        self
    }

    pub fn with_options(mut self, options: RenderOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &RenderOptions {
        &self.options
    }

    pub async fn render(&self, request: &RenderRequest) -> RenderResult {
        self.stores.load().await;
        let mut pass = RenderPass::new(self);

        let root = match pass.tree.add_root(
            &request.package,
            request.values.clone(),
            request.application.clone(),
        ) {
            Ok(root) => root,
            Err(e) => {
                pass.load_failure(request.package.display().to_string(), e, None);
                return pass.finish(None);
            }
        };

        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            if pass.tree.is_discarded(id) {
                continue;
            }
            let children = pass.process(id).await;
            stack.extend(children.into_iter().rev());
        }

        tracing::info!(
            fetches = pass.snapshot.fetches(),
            random_values = pass.forcer.forced(),
            "render finished"
        );
        pass.finish(Some(root))
    }
}

/// Snapshot plus the application's secret stores
struct ResolverHandler {
    snapshot: Arc<ClusterSnapshot>,
    stores: SecretStores,
}

impl LookupHandler for ResolverHandler {
    fn resolve_ref(&self, reference: &Reference) -> LookupResult {
        self.snapshot.resolve(reference)
    }

    fn resolve_secret(&self, secret: &SecretRef) -> LookupResult {
        self.stores.lookup(secret)
    }
}

enum Emission {
    Manifest(EmittedManifest),
    Deferred(DeferredNote),
    Child(InstanceId),
}

enum Handled {
    Done,
    Child(InstanceId),
    /// The current instance was aborted
    Abort,
}

/// Mutable state of one render
struct RenderPass<'r> {
    renderer: &'r Renderer,
    snapshot: Arc<ClusterSnapshot>,
    tree: InstanceTree,
    forcer: ThunkForcer,
    emissions: HashMap<InstanceId, Vec<Emission>>,
    errors: Vec<RenderFailure>,
    kube_version: Option<String>,
}

impl<'r> RenderPass<'r> {
    fn new(renderer: &'r Renderer) -> Self {
        Self {
            renderer,
            snapshot: Arc::new(ClusterSnapshot::new()),
            tree: InstanceTree::new(),
            forcer: renderer
                .options
                .seed
                .map(ThunkForcer::seeded)
                .unwrap_or_default(),
            emissions: HashMap::new(),
            errors: Vec::new(),
            kube_version: None,
        }
    }

    fn emit(&mut self, id: InstanceId, emission: Emission) {
        self.emissions.entry(id).or_default().push(emission);
    }

    fn fail(&mut self, failure: RenderFailure) {
        tracing::error!(scope = %failure.scope, kind = %failure.kind, "{}", failure.message);
        self.errors.push(failure);
    }

    fn fail_at(
        &mut self,
        scope: impl Into<String>,
        kind: FailureKind,
        message: impl Into<String>,
        location: SourceLocation,
    ) {
        self.fail(RenderFailure::new(scope, kind, message).at(location));
    }

    fn defer(&mut self, id: InstanceId, note: DeferredNote) {
        tracing::warn!("{}", note);
        self.emit(id, Emission::Deferred(note));
    }

    fn load_failure(&mut self, scope: String, error: LoadError, location: Option<SourceLocation>) {
        let kind = match &error {
            LoadError::Package(_) => FailureKind::PackageLoad,
            LoadError::Schema { .. } => FailureKind::SchemaValidation,
            LoadError::Cycle { .. } => FailureKind::CycleDetected,
        };
        let mut failure = RenderFailure::new(scope, kind, error.to_string());
        failure.location = location;
        self.fail(failure);
    }

    /// Expand and route every template of an instance; returns the children it created
    async fn process(&mut self, id: InstanceId) -> Vec<InstanceId> {
        let package = Arc::clone(&self.tree.get(id).package);
        let context = self.tree.context(id);
        let stores = match self.tree.application_of(id) {
            Some(binding) => self.renderer.stores.scoped(binding.secret_stores.as_deref()),
            None => self.renderer.stores.clone(),
        };
        let handler: Arc<dyn LookupHandler> = Arc::new(ResolverHandler {
            snapshot: Arc::clone(&self.snapshot),
            stores,
        });

        tracing::info!(
            package = %package.name,
            templates = package.templates.len(),
            application = ?context.application.as_ref().map(|a| &a.name),
            "rendering package"
        );

        let mut children = Vec::new();
        for (index, file) in package.templates.iter().enumerate() {
            let scope = format!("{id}.{index}");
            let expansion = match self.expand(file, &context, &handler, &scope).await {
                Ok(expansion) => expansion,
                Err(failure) => {
                    let location = SourceLocation {
                        file: file.path.display().to_string(),
                        document: 0,
                        line: failure.error.line.unwrap_or(1),
                    };
                    let waiting_on = failure.deferred();
                    if !waiting_on.is_empty() {
                        self.defer(
                            id,
                            DeferredNote {
                                resource: None,
                                location: Some(location),
                                waiting_on: settle(waiting_on),
                            },
                        );
                        continue;
                    }

                    let scope = match &self.tree.get(id).origin {
                        Some(origin) => origin.to_string(),
                        None => package.path.display().to_string(),
                    };
                    self.fail(
                        RenderFailure::new(
                            scope,
                            FailureKind::TemplateSyntax,
                            failure.error.message.clone(),
                        )
                        .at(location)
                        .with_diagnostic(failure.error),
                    );
                    self.tree.abort(id);
                    return Vec::new();
                }
            };

            for spec in graph::build(&file.path.display().to_string(), &expansion) {
                match self.handle(id, spec).await {
                    Handled::Done => {}
                    Handled::Child(child) => children.push(child),
                    Handled::Abort => return Vec::new(),
                }
            }
        }
        children
    }

    /// Evaluate, fetch what the lookups asked for, and evaluate again
    async fn expand(
        &self,
        file: &TemplateFile,
        context: &TemplateContext,
        handler: &Arc<dyn LookupHandler>,
        scope: &str,
    ) -> Result<Expansion, EvalFailure> {
        let options = &self.renderer.options;
        let mut pass = 1;
        loop {
            let outcome = self.renderer.evaluator.evaluate(
                &file.name,
                &file.content,
                context,
                Arc::clone(handler),
                scope,
            );
            let pending = match &outcome {
                Ok(expansion) => pending_keys(&expansion.lookups),
                Err(failure) if failure.on_pending => pending_keys(&failure.lookups),
                Err(_) => return outcome,
            };
            if pending.is_empty() || pass >= options.max_passes {
                return outcome;
            }

            tracing::debug!(
                file = %file.name,
                pass,
                pending = pending.len(),
                "fetching referenced objects"
            );
            self.snapshot
                .fill(self.renderer.reader.as_ref(), &pending, options.read_timeout)
                .await;
            pass += 1;
        }
    }

    async fn handle(&mut self, id: InstanceId, spec: ResourceSpec) -> Handled {
        let resource = spec.id();
        let location = spec.location.clone();
        let scope = resource
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| location.to_string());

        match spec.status {
            DocStatus::Deferred { waiting_on, .. } => {
                self.defer(
                    id,
                    DeferredNote {
                        resource,
                        location: Some(location),
                        waiting_on: settle(waiting_on),
                    },
                );
                Handled::Done
            }
            DocStatus::Failed { failure, .. } => {
                let (kind, diagnostic) = match &failure {
                    DocFailure::Lookup(errors) => (lookup_failure_kind(errors[0].kind), None),
                    DocFailure::Yaml(e) => (FailureKind::YamlParse, Some(e.clone())),
                    DocFailure::NotAMapping => (FailureKind::InvalidResource, None),
                };
                let mut failure = RenderFailure::new(scope, kind, failure.to_string()).at(location);
                failure.diagnostic = diagnostic;
                self.fail(failure);
                Handled::Done
            }
            DocStatus::Ready(body) => self.handle_ready(id, body, scope, location).await,
        }
    }

    async fn handle_ready(
        &mut self,
        id: InstanceId,
        body: JsonValue,
        scope: String,
        location: SourceLocation,
    ) -> Handled {
        let classified = match classify(&body) {
            Ok(classified) => classified,
            Err(e) => {
                self.fail_at(scope, FailureKind::InvalidResource, e.to_string(), location);
                return Handled::Done;
            }
        };

        match classified {
            Classified::UnknownNyl(kind) => {
                self.fail(
                    RenderFailure::new(
                        scope,
                        FailureKind::InvalidResource,
                        format!("unknown kind '{kind}' in nyl.io/v1. {}", suggest_nyl_kind(&kind)),
                    )
                    .at(location),
                );
                Handled::Done
            }
            Classified::Passthrough => {
                if let Some(app) = self.owner(id, &scope, &location) {
                    self.passthrough(id, &app, body, scope, location);
                }
                Handled::Done
            }
            Classified::Nyl(NylResource::StatefulSecret(secret)) => {
                if let Some(app) = self.owner(id, &scope, &location) {
                    self.stateful_secret(id, &app, secret, scope, location).await;
                }
                Handled::Done
            }
            Classified::Nyl(NylResource::HelmChart(chart)) => {
                if let Some(app) = self.owner(id, &scope, &location) {
                    self.helm_chart(id, &app, chart, scope, location).await;
                }
                Handled::Done
            }
            Classified::Nyl(NylResource::Package(package)) => self.instantiate(
                id,
                &body,
                &package.package,
                package.values,
                ChildApplication::Inherit,
                location,
            ),
            Classified::Nyl(NylResource::Application(app)) => {
                if let Some(outer) = self.tree.application_of(id) {
                    let message = format!(
                        "Application '{}' cannot be declared inside Application '{}'",
                        app.metadata.name, outer.name
                    );
                    self.fail_at(scope, FailureKind::NestedApplication, message, location);
                    return Handled::Done;
                }

                let binding = ApplicationBinding {
                    name: app.metadata.name.clone(),
                    namespace: app.namespace.clone(),
                    secret_stores: app.secret_stores.clone(),
                };
                self.instantiate(
                    id,
                    &body,
                    &app.package,
                    app.values,
                    ChildApplication::New(binding),
                    location,
                )
            }
        }
    }

    /// The owning application, or an unattributed-resource failure
    fn owner(
        &mut self,
        id: InstanceId,
        scope: &str,
        location: &SourceLocation,
    ) -> Option<ApplicationBinding> {
        if let Some(binding) = self.tree.application_of(id) {
            return Some(binding.clone());
        }
        self.fail_at(
            scope,
            FailureKind::UnattributedResource,
            "resource is not owned by an Application; \
             instantiate its package from an Application",
            location.clone(),
        );
        None
    }

    fn instantiate(
        &mut self,
        id: InstanceId,
        body: &JsonValue,
        reference: &str,
        values: Values,
        application: ChildApplication,
        location: SourceLocation,
    ) -> Handled {
        let origin = match ResourceId::from_manifest(body) {
            Ok(origin) => origin,
            Err(e) => {
                let scope = location.to_string();
                self.fail_at(scope, FailureKind::InvalidResource, e.to_string(), location);
                return Handled::Done;
            }
        };
        let scope = origin.to_string();

        match self.tree.add_child(id, reference, values, application, origin) {
            Ok(child) => {
                self.emit(id, Emission::Child(child));
                Handled::Child(child)
            }
            Err(error @ LoadError::Cycle { .. }) => {
                self.load_failure(scope, error, Some(location));
                Handled::Abort
            }
            Err(error) => {
                self.load_failure(scope, error, Some(location));
                Handled::Done
            }
        }
    }

    fn passthrough(
        &mut self,
        id: InstanceId,
        app: &ApplicationBinding,
        body: JsonValue,
        scope: String,
        location: SourceLocation,
    ) {
        let mut manifest = self.forcer.force_value(&body);
        attribute(&mut manifest, app);

        match ResourceId::from_manifest(&manifest) {
            Ok(resource) => self.emit(
                id,
                Emission::Manifest(EmittedManifest {
                    resource,
                    application: Some(app.name.clone()),
                    manifest,
                }),
            ),
            Err(e) => self.fail_at(scope, FailureKind::InvalidResource, e.to_string(), location),
        }
    }

    async fn stateful_secret(
        &mut self,
        id: InstanceId,
        app: &ApplicationBinding,
        secret: StatefulSecretResource,
        scope: String,
        location: SourceLocation,
    ) {
        let desired = match secret.desired() {
            Ok(desired) => desired,
            Err(e) => {
                self.fail_at(scope, FailureKind::InvalidResource, e.to_string(), location);
                return;
            }
        };

        let namespace = secret
            .metadata
            .namespace
            .clone()
            .or_else(|| app.namespace.clone())
            .unwrap_or_else(|| "default".to_string());
        let key = ObjectKey::new("Secret", Some(namespace.clone()), secret.metadata.name.clone());
        let options = &self.renderer.options;
        self.snapshot
            .fill(self.renderer.reader.as_ref(), std::slice::from_ref(&key), options.read_timeout)
            .await;

        let existing = match self.snapshot.peek(&key) {
            Some(SnapshotEntry::Found(object)) => Some(object),
            Some(SnapshotEntry::NotFound) => None,
            entry => {
                let reason = match entry {
                    Some(SnapshotEntry::Unavailable(reason)) => {
                        DeferReason::ClusterUnavailable(reason)
                    }
                    _ => DeferReason::NotYetFetched,
                };
                let resource = ResourceId {
                    api_version: "v1".to_string(),
                    kind: "Secret".to_string(),
                    namespace: Some(namespace),
                    name: secret.metadata.name.clone(),
                };
                self.defer(
                    id,
                    DeferredNote {
                        resource: Some(resource),
                        location: Some(location),
                        waiting_on: vec![MissingDependency {
                            lookup: Lookup::Ref(Reference {
                                key,
                                field: "data".to_string(),
                            }),
                            reason,
                        }],
                    },
                );
                return;
            }
        };

        let outcome = merge::merge(&desired, existing.as_deref(), &mut self.forcer);
        tracing::debug!(
            secret = %key,
            added = ?outcome.added,
            preserved = outcome.preserved.len(),
            dropped = ?outcome.dropped,
            "merged stateful secret"
        );

        let mut manifest = merge::secret_manifest(&secret, Some(&namespace), &outcome);
        attribute(&mut manifest, app);
        match ResourceId::from_manifest(&manifest) {
            Ok(resource) => self.emit(
                id,
                Emission::Manifest(EmittedManifest {
                    resource,
                    application: Some(app.name.clone()),
                    manifest,
                }),
            ),
            Err(e) => self.fail_at(scope, FailureKind::InvalidResource, e.to_string(), location),
        }
    }

    async fn helm_chart(
        &mut self,
        id: InstanceId,
        app: &ApplicationBinding,
        chart: HelmChartResource,
        scope: String,
        location: SourceLocation,
    ) {
        let base_dir = self.tree.get(id).package.base_dir.clone();
        let search_path = &self.renderer.options.search_path;
        let chart_location = match ChartLocation::resolve(&chart.chart, &base_dir, search_path) {
            Ok(chart_location) => chart_location,
            Err(message) => {
                self.fail_at(scope, FailureKind::InvalidResource, message, location);
                return;
            }
        };

        let values = match chart.values.inner() {
            JsonValue::Null => JsonValue::Object(serde_json::Map::new()),
            values => self.forcer.force_value(values),
        };
        let request = HelmRequest {
            chart: chart_location,
            version: chart.chart.version.clone(),
            release_name: chart.release_name().to_string(),
            namespace: chart.release.namespace.clone().or_else(|| app.namespace.clone()),
            values,
            kube_version: self.kube_version().await,
        };

        let documents = match self.renderer.helm.render(&request).await {
            Ok(documents) => documents,
            Err(e) => {
                self.fail_at(scope, FailureKind::HelmRender, e.to_string(), location);
                return;
            }
        };

        tracing::debug!(chart = %scope, documents = documents.len(), "helm chart rendered");
        for manifest in documents {
            match ResourceId::from_manifest(&manifest) {
                Ok(resource) => self.emit(
                    id,
                    Emission::Manifest(EmittedManifest {
                        resource,
                        application: Some(app.name.clone()),
                        manifest,
                    }),
                ),
                Err(e) => self.fail_at(
                    scope.clone(),
                    FailureKind::HelmRender,
                    format!("invalid chart output: {e}"),
                    location.clone(),
                ),
            }
        }
    }

    async fn kube_version(&mut self) -> String {
        if let Some(version) = &self.kube_version {
            return version.clone();
        }
        let version = match &self.renderer.options.kube_version {
            Some(version) => version.clone(),
            None => self
                .renderer
                .reader
                .server_version()
                .await
                .unwrap_or_else(|| DEFAULT_KUBE_VERSION.to_string()),
        };
        self.kube_version = Some(version.clone());
        version
    }

    fn finish(mut self, root: Option<InstanceId>) -> RenderResult {
        let mut result = RenderResult {
            errors: std::mem::take(&mut self.errors),
            ..RenderResult::default()
        };
        if let Some(root) = root {
            self.collect(root, &mut result);
        }
        result
    }

    /// Depth-first assembly; discarded subtrees contribute nothing
    fn collect(&mut self, id: InstanceId, result: &mut RenderResult) {
        if self.tree.get(id).aborted {
            return;
        }

        let start = result.manifests.len();
        for emission in self.emissions.remove(&id).unwrap_or_default() {
            match emission {
                Emission::Manifest(manifest) => result.manifests.push(manifest),
                Emission::Deferred(note) => result.deferred.push(note),
                Emission::Child(child) => self.collect(child, result),
            }
        }

        if let Some(app) = self.tree.get(id).root_of {
            let name = self.tree.application(app).name.clone();
            let manifest = application_manifest(&name, &result.manifests[start..]);
            if let Ok(resource) = ResourceId::from_manifest(&manifest) {
                result.manifests.insert(
                    start,
                    EmittedManifest {
                        resource,
                        application: None,
                        manifest,
                    },
                );
            }
        }
    }
}

/// Annotate with the owning application and default the namespace
fn attribute(manifest: &mut JsonValue, app: &ApplicationBinding) {
    let cluster_scoped = manifest
        .get("kind")
        .and_then(|k| k.as_str())
        .is_some_and(is_cluster_scoped);
    let Some(metadata) = manifest.get_mut("metadata").and_then(|m| m.as_object_mut()) else {
        return;
    };

    if !cluster_scoped && !metadata.contains_key("namespace") {
        if let Some(namespace) = &app.namespace {
            metadata.insert("namespace".into(), JsonValue::String(namespace.clone()));
        }
    }

    let annotations = metadata
        .entry("annotations")
        .or_insert_with(|| JsonValue::Object(serde_json::Map::new()));
    if let Some(annotations) = annotations.as_object_mut() {
        annotations.insert(APPLICATION_ANNOTATION.into(), JsonValue::String(app.name.clone()));
    }
}

/// Lookups still unfetched after the last pass will not be fetched in this render
fn settle(waiting_on: Vec<MissingDependency>) -> Vec<MissingDependency> {
    waiting_on
        .into_iter()
        .map(|mut missing| {
            if missing.reason == DeferReason::NotYetFetched {
                missing.reason = DeferReason::TooDeep;
            }
            missing
        })
        .collect()
}

fn lookup_failure_kind(kind: LookupErrorKind) -> FailureKind {
    match kind {
        LookupErrorKind::SecretNotFound => FailureKind::SecretNotFound,
        LookupErrorKind::SecretStoreNotFound | LookupErrorKind::SecretStoreFailed => {
            FailureKind::SecretStore
        }
        LookupErrorKind::InvalidReference => FailureKind::InvalidReference,
    }
}
