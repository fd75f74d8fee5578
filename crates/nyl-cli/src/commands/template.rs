//! Template command - render a package tree into a manifest stream

use nyl_core::{DeploymentConfig, Values, parse_set_values};
use nyl_engine::{
    ApplicationBinding, ClusterReader, HelmCli, OfflineCluster, RenderOptions, RenderRequest,
    Renderer, RepoCache, SecretStores,
};
use nyl_kube::KubeClusterReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::display;
use crate::error::{CliError, Result};

pub struct TemplateArgs {
    pub package: PathBuf,
    pub values: Vec<PathBuf>,
    pub set: Vec<String>,
    pub deployment: Option<PathBuf>,
    pub application: Option<String>,
    pub namespace: Option<String>,
    pub output: Option<PathBuf>,
    pub offline: bool,
    pub helm_binary: PathBuf,
}

pub async fn run(args: TemplateArgs) -> Result<()> {
    let values = load_values(&args.values, &args.set)?;
    let deployment = load_deployment(args.deployment.as_deref())?;

    let reader: Arc<dyn ClusterReader> = if args.offline {
        tracing::info!("offline mode, cluster lookups will be deferred");
        Arc::new(OfflineCluster)
    } else {
        match KubeClusterReader::try_default().await {
            Ok(reader) => Arc::new(reader),
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    "no cluster connection, cluster lookups will be deferred"
                );
                Arc::new(OfflineCluster)
            }
        }
    };

    let repo_cache = state_dir(args.deployment.as_deref()).join("repo-cache");
    tracing::debug!(dir = %repo_cache.display(), "git chart cache");
    let helm = HelmCli::new(&args.helm_binary).with_repo_cache(RepoCache::new(repo_cache));

    let renderer = Renderer::new(reader, Arc::new(helm))
        .with_stores(SecretStores::from_config(&deployment))
        .with_options(RenderOptions::from_deployment(&deployment));

    let mut request = RenderRequest::new(&args.package).with_values(values);
    if let Some(name) = &args.application {
        let mut binding = ApplicationBinding::new(name);
        if let Some(namespace) = &args.namespace {
            binding = binding.with_namespace(namespace);
        }
        request = request.with_application(binding);
    }

    let result = renderer.render(&request).await;

    let yaml = result
        .to_yaml()
        .map_err(|e| CliError::internal(format!("failed to serialize manifests: {e}")))?;
    match &args.output {
        Some(path) => std::fs::write(path, yaml)?,
        None => print!("{yaml}"),
    }

    display::print_report(&result);

    if result.has_fatal() {
        return Err(CliError::render(&result.errors));
    }
    Ok(())
}

/// `-f` files in order, then `--set` overrides
fn load_values(files: &[PathBuf], set: &[String]) -> Result<Values> {
    let mut values = Values::new();
    for file in files {
        if !file.is_file() {
            return Err(CliError::Io {
                message: format!("values file not found: {}", file.display()),
            });
        }
        let file_values = Values::from_file(file).map_err(|e| {
            CliError::validation_with_help(
                format!("{}: {e}", file.display()),
                "values files must contain a YAML mapping",
            )
        })?;
        values.merge(&file_values);
    }
    if !set.is_empty() {
        let overrides = parse_set_values(set).map_err(|e| CliError::usage(e.to_string()))?;
        values.merge(&overrides);
    }
    Ok(values)
}

/// `.nyl` next to the deployment document, else in the working directory
fn state_dir(deployment: Option<&Path>) -> PathBuf {
    deployment
        .and_then(Path::parent)
        .unwrap_or(Path::new(""))
        .join(".nyl")
}

/// Explicit document, else `./nyl-deployment.yaml` when present, else defaults
fn load_deployment(path: Option<&Path>) -> Result<DeploymentConfig> {
    let help = "see `secretStores`, `searchPath`, `cluster` and `kubeVersion`";
    match path {
        Some(path) => {
            if !path.is_file() {
                return Err(CliError::Io {
                    message: format!("deployment file not found: {}", path.display()),
                });
            }
            DeploymentConfig::load(path)
                .map_err(|e| CliError::validation_with_help(e.to_string(), help))
        }
        None => {
            let found = DeploymentConfig::discover(Path::new("."))
                .map_err(|e| CliError::validation_with_help(e.to_string(), help))?;
            Ok(found.unwrap_or_default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_dir_follows_deployment_file() {
        assert_eq!(
            state_dir(Some(Path::new("/srv/gitops/nyl-deployment.yaml"))),
            PathBuf::from("/srv/gitops/.nyl")
        );
        assert_eq!(state_dir(Some(Path::new("nyl-deployment.yaml"))), PathBuf::from(".nyl"));
        assert_eq!(state_dir(None), PathBuf::from(".nyl"));
    }
}
