//! Helm Adapter
//!
//! Hands fully resolved values to `helm template` and folds its output back
//! in as opaque documents. No reference resolution happens on Helm output.

use async_trait::async_trait;
use nyl_core::ChartRef;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{EngineError, Result};
use crate::git::{GitSource, RepoCache};

/// Kubernetes version passed to Helm when neither the deployment nor the
/// cluster provides one
pub const DEFAULT_KUBE_VERSION: &str = "1.31";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChartLocation {
    /// Classic chart repository, passed with `--repo`
    Repository {
        repository: String,
        name: String,
    },
    /// `oci://` reference, or a chart directory
    Reference(String),
    /// Chart inside a Git repository, checked out before rendering
    Git {
        source: GitSource,
        /// Chart directory within the checkout
        subpath: Option<String>,
    },
}

impl ChartLocation {
    /// Resolve chart coordinates.
    ///
    /// Explicit paths (`./`, `../`, absolute) resolve against `package_dir`;
    /// bare paths are looked up in `search_path`.
    pub fn resolve(
        chart: &ChartRef,
        package_dir: &Path,
        search_path: &[PathBuf],
    ) -> std::result::Result<Self, String> {
        if let Some(repository) = &chart.repository {
            if chart.path.is_some() {
                return Err("cannot specify both `chart.repository` and `chart.path`".into());
            }
            if chart.git.is_some() {
                return Err("cannot specify both `chart.repository` and `chart.git`".into());
            }
            let name = chart
                .name
                .clone()
                .ok_or("`chart.name` must be set when `chart.repository` is set")?;
            return if repository.starts_with("oci://") {
                Ok(Self::Reference(format!(
                    "{}/{}",
                    repository.trim_end_matches('/'),
                    name
                )))
            } else {
                Ok(Self::Repository {
                    repository: repository.clone(),
                    name,
                })
            };
        }

        if let Some(git) = &chart.git {
            if chart.name.is_some() {
                return Err(
                    "cannot specify both `chart.git` and `chart.name`, did you mean `chart.path`?"
                        .into(),
                );
            }
            return Ok(Self::Git {
                source: GitSource::parse(git),
                subpath: chart.path.clone(),
            });
        }

        let Some(path) = &chart.path else {
            return Err(
                "either `chart.repository`, `chart.git` or `chart.path` must be set".into(),
            );
        };
        let is_explicit =
            path.starts_with("./") || path.starts_with("../") || Path::new(path).is_absolute();
        let resolved = if is_explicit {
            let candidate = package_dir.join(path);
            if !candidate.exists() {
                return Err(format!("chart path '{}' not found", path));
            }
            candidate
        } else {
            search_path
                .iter()
                .map(|dir| dir.join(path))
                .find(|candidate| candidate.exists())
                .ok_or_else(|| {
                    format!("chart '{}' not found in search path {:?}", path, search_path)
                })?
        };
        Ok(Self::Reference(resolved.display().to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct HelmRequest {
    pub chart: ChartLocation,
    pub version: Option<String>,
    pub release_name: String,
    pub namespace: Option<String>,
    pub values: JsonValue,
    pub kube_version: String,
}

impl HelmRequest {
    /// Arguments to `helm`, given the path of the written values file
    pub fn template_args(&self, values_file: &Path) -> Vec<String> {
        let mut args: Vec<String> = [
            "template",
            "--skip-tests",
            "--include-crds",
            "--kube-version",
            &self.kube_version,
            "--is-upgrade",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        let chart = match &self.chart {
            ChartLocation::Repository { repository, name } => {
                args.push("--repo".into());
                args.push(repository.clone());
                name.clone()
            }
            ChartLocation::Reference(reference) => reference.clone(),
            ChartLocation::Git { source, subpath } => match subpath {
                Some(subpath) => format!("{}//{}", source.url, subpath),
                None => source.url.clone(),
            },
        };
        if let Some(version) = &self.version {
            args.extend(["--version".into(), version.clone(), "--devel".into()]);
        }
        args.push("--values".into());
        args.push(values_file.display().to_string());
        if let Some(namespace) = &self.namespace {
            args.push("--namespace".into());
            args.push(namespace.clone());
        }
        args.push(self.release_name.clone());
        args.push(chart);
        args
    }

    pub fn chart_display(&self) -> String {
        match &self.chart {
            ChartLocation::Repository { repository, name } => format!("{repository}/{name}"),
            ChartLocation::Reference(reference) => reference.clone(),
            ChartLocation::Git { source, subpath } => {
                let mut display = source.url.clone();
                if let Some(subpath) = subpath {
                    display.push_str("//");
                    display.push_str(subpath);
                }
                if let Some(reference) = &source.reference {
                    display.push('@');
                    display.push_str(reference);
                }
                display
            }
        }
    }

    /// The same request against a chart directory on disk
    pub fn with_local_chart(&self, dir: &Path) -> Self {
        Self {
            chart: ChartLocation::Reference(dir.display().to_string()),
            ..self.clone()
        }
    }
}

#[async_trait]
pub trait HelmRenderer: Send + Sync {
    async fn render(&self, request: &HelmRequest) -> Result<Vec<JsonValue>>;
}

/// Parse a multi-document YAML stream, skipping empty documents
pub fn parse_documents(stream: &str) -> Result<Vec<JsonValue>> {
    let mut docs = Vec::new();
    for document in serde_yaml::Deserializer::from_str(stream) {
        let value = JsonValue::deserialize(document)?;
        if !value.is_null() {
            docs.push(value);
        }
    }
    Ok(docs)
}

/// Default clone cache, relative to the working directory
pub const DEFAULT_REPO_CACHE: &str = ".nyl/repo-cache";

/// `helm template` via the Helm binary
#[derive(Debug, Clone)]
pub struct HelmCli {
    binary: PathBuf,
    repos: Arc<RepoCache>,
}

impl Default for HelmCli {
    fn default() -> Self {
        Self::new("helm")
    }
}

impl HelmCli {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            repos: Arc::new(RepoCache::new(DEFAULT_REPO_CACHE)),
        }
    }

    /// Where `chart.git` repositories are cloned
    pub fn with_repo_cache(mut self, repos: RepoCache) -> Self {
        self.repos = Arc::new(repos);
        self
    }
}

#[async_trait]
impl HelmRenderer for HelmCli {
    async fn render(&self, request: &HelmRequest) -> Result<Vec<JsonValue>> {
        let ChartLocation::Git { source, subpath } = &request.chart else {
            return self.run(request).await;
        };

        let (checkout, _guard) = self.repos.checkout(source).await?;
        let chart_dir = match subpath {
            Some(subpath) => checkout.join(subpath),
            None => checkout,
        };
        if !chart_dir.is_dir() {
            return Err(EngineError::Helm {
                chart: request.chart_display(),
                message: format!(
                    "chart directory '{}' not found in repository",
                    chart_dir.display()
                ),
            });
        }
        self.run(&request.with_local_chart(&chart_dir)).await
    }
}

impl HelmCli {
    async fn run(&self, request: &HelmRequest) -> Result<Vec<JsonValue>> {
        let helm_error = |message: String| EngineError::Helm {
            chart: request.chart_display(),
            message,
        };

        let mut values_file = tempfile::Builder::new()
            .prefix("nyl-values-")
            .suffix(".yaml")
            .tempfile()?;
        values_file.write_all(serde_yaml::to_string(&request.values)?.as_bytes())?;
        values_file.flush()?;

        let args = request.template_args(values_file.path());
        tracing::info!(
            chart = %request.chart_display(),
            release = %request.release_name,
            "rendering helm chart"
        );
        tracing::debug!(binary = %self.binary.display(), args = ?args, "invoking helm");

        let output = tokio::process::Command::new(&self.binary)
            .args(&args)
            .output()
            .await
            .map_err(|e| helm_error(format!("failed to run '{}': {}", self.binary.display(), e)))?;

        if !output.status.success() {
            return Err(helm_error(format!(
                "helm exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_documents(&stdout).map_err(|e| helm_error(format!("invalid helm output: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn chart(repository: Option<&str>, name: Option<&str>, path: Option<&str>) -> ChartRef {
        ChartRef {
            repository: repository.map(String::from),
            git: None,
            name: name.map(String::from),
            version: None,
            path: path.map(String::from),
        }
    }

    fn git_chart(git: &str, name: Option<&str>, path: Option<&str>) -> ChartRef {
        ChartRef {
            git: Some(git.into()),
            ..chart(None, name, path)
        }
    }

    #[test]
    fn test_resolve_repository_and_oci() {
        let dir = Path::new("/tmp");
        let classic = chart(Some("https://charts.example"), Some("web"), None);
        assert_eq!(
            ChartLocation::resolve(&classic, dir, &[]),
            Ok(ChartLocation::Repository {
                repository: "https://charts.example".into(),
                name: "web".into(),
            })
        );
        let oci = chart(Some("oci://ghcr.io/org/"), Some("web"), None);
        assert_eq!(
            ChartLocation::resolve(&oci, dir, &[]),
            Ok(ChartLocation::Reference("oci://ghcr.io/org/web".into()))
        );
    }

    #[test]
    fn test_resolve_rejects_ambiguous() {
        let dir = Path::new("/tmp");
        let both = chart(Some("r"), Some("n"), Some("./p"));
        assert!(ChartLocation::resolve(&both, dir, &[]).is_err());
        assert!(ChartLocation::resolve(&chart(None, None, None), dir, &[]).is_err());
        assert!(ChartLocation::resolve(&chart(Some("r"), None, None), dir, &[]).is_err());
    }

    #[test]
    fn test_resolve_git() {
        let dir = Path::new("/tmp");
        let located = ChartLocation::resolve(
            &git_chart("https://github.com/org/charts.git?ref=v2", None, Some("charts/web")),
            dir,
            &[],
        );
        assert_eq!(
            located,
            Ok(ChartLocation::Git {
                source: GitSource {
                    url: "https://github.com/org/charts.git".into(),
                    reference: Some("v2".into()),
                },
                subpath: Some("charts/web".into()),
            })
        );

        let with_name = git_chart("https://g/r.git", Some("web"), None);
        let err = ChartLocation::resolve(&with_name, dir, &[]).unwrap_err();
        assert!(err.contains("did you mean `chart.path`"));

        let with_repository = ChartRef {
            repository: Some("https://charts.example".into()),
            ..git_chart("https://g/r.git", Some("web"), None)
        };
        let err = ChartLocation::resolve(&with_repository, dir, &[]).unwrap_err();
        assert!(err.contains("`chart.repository` and `chart.git`"));

        let none = ChartLocation::resolve(&chart(None, None, None), dir, &[]).unwrap_err();
        assert!(none.contains("`chart.repository`, `chart.git` or `chart.path`"));
    }

    #[test]
    fn test_git_chart_display() {
        let request = HelmRequest {
            chart: ChartLocation::Git {
                source: GitSource::parse("https://g/r.git?ref=v1"),
                subpath: Some("web".into()),
            },
            version: None,
            release_name: "web".into(),
            namespace: None,
            values: serde_json::json!({}),
            kube_version: DEFAULT_KUBE_VERSION.into(),
        };
        assert_eq!(request.chart_display(), "https://g/r.git//web@v1");

        let local = request.with_local_chart(Path::new("/cache/abc-r.git/web"));
        assert_eq!(local.chart, ChartLocation::Reference("/cache/abc-r.git/web".into()));
        assert_eq!(local.release_name, "web");
    }

    #[test]
    fn test_resolve_paths() {
        let package = TempDir::new().unwrap();
        std::fs::create_dir(package.path().join("chart")).unwrap();
        let search = TempDir::new().unwrap();
        std::fs::create_dir(search.path().join("shared")).unwrap();
        let search_path = vec![search.path().to_path_buf()];
        let resolve = |path: &str| {
            ChartLocation::resolve(&chart(None, None, Some(path)), package.path(), &search_path)
        };

        assert_eq!(
            resolve("./chart").unwrap(),
            ChartLocation::Reference(package.path().join("./chart").display().to_string())
        );
        assert_eq!(
            resolve("shared").unwrap(),
            ChartLocation::Reference(search.path().join("shared").display().to_string())
        );
        assert!(resolve("missing").is_err());
    }

    #[test]
    fn test_template_args() {
        let request = HelmRequest {
            chart: ChartLocation::Repository {
                repository: "https://kubernetes.github.io/ingress-nginx".into(),
                name: "ingress-nginx".into(),
            },
            version: Some("4.11.0".into()),
            release_name: "ingress".into(),
            namespace: Some("ingress".into()),
            values: serde_json::json!({}),
            kube_version: "1.31".into(),
        };

        let args = request.template_args(Path::new("/tmp/values.yaml"));
        assert_eq!(
            args,
            vec![
                "template",
                "--skip-tests",
                "--include-crds",
                "--kube-version",
                "1.31",
                "--is-upgrade",
                "--repo",
                "https://kubernetes.github.io/ingress-nginx",
                "--version",
                "4.11.0",
                "--devel",
                "--values",
                "/tmp/values.yaml",
                "--namespace",
                "ingress",
                "ingress",
                "ingress-nginx",
            ]
        );
    }

    #[test]
    fn test_parse_documents_skips_empty() {
        let docs = parse_documents("---\n# Source: x\n---\nkind: A\n---\nkind: B\n").unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[1]["kind"], "B");
    }

    #[tokio::test]
    async fn test_missing_binary_is_helm_error() {
        let request = HelmRequest {
            chart: ChartLocation::Reference("./chart".into()),
            version: None,
            release_name: "r".into(),
            namespace: None,
            values: serde_json::json!({"a": 1}),
            kube_version: DEFAULT_KUBE_VERSION.into(),
        };
        let result = HelmCli::new("/nonexistent/helm").render(&request).await;
        assert!(matches!(result, Err(EngineError::Helm { .. })));
    }
}
