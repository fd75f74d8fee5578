//! Git chart sources
//!
//! `chart.git` points at a repository, optionally pinned with `?ref=` (or
//! `?rev=`). Repositories are cloned once into a cache directory and fetched
//! on later renders; `chart.path` then selects the chart inside the checkout.

use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use crate::error::{EngineError, Result};

/// A repository URL with the checkout it asks for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitSource {
    /// Clone URL without the query string
    pub url: String,
    pub reference: Option<String>,
}

impl GitSource {
    pub fn parse(spec: &str) -> Self {
        let (url, query) = spec.split_once('?').unwrap_or((spec, ""));
        let reference = url::form_urlencoded::parse(query.as_bytes())
            .find(|(key, _)| key == "ref" || key == "rev")
            .map(|(_, value)| value.into_owned());
        Self {
            url: url.to_string(),
            reference,
        }
    }

    /// `<digest>-<repository name>`, stable per URL regardless of the ref
    pub fn cache_name(&self) -> String {
        let digest = Sha256::digest(self.url.as_bytes());
        let hash: String = digest[..8].iter().map(|b| format!("{b:02x}")).collect();
        let name = self
            .url
            .trim_end_matches('/')
            .rsplit(['/', ':'])
            .next()
            .filter(|name| !name.is_empty())
            .unwrap_or("repo");
        format!("{hash}-{name}")
    }
}

/// Local clones of chart repositories
#[derive(Debug)]
pub struct RepoCache {
    dir: PathBuf,
    binary: PathBuf,
    /// Checkouts mutate the shared clone; one at a time
    lock: Mutex<()>,
}

impl RepoCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            binary: PathBuf::from("git"),
            lock: Mutex::new(()),
        }
    }

    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Clone or update the repository and check out the requested ref.
    ///
    /// The returned guard keeps other checkouts out until the caller is done
    /// reading the working tree.
    pub async fn checkout(
        &self,
        source: &GitSource,
    ) -> Result<(PathBuf, tokio::sync::MutexGuard<'_, ()>)> {
        let guard = self.lock.lock().await;
        let clone_dir = self.dir.join(source.cache_name());

        if clone_dir.exists() {
            tracing::debug!(url = %source.url, dir = %clone_dir.display(), "using cached clone");
            self.git(source, Some(&clone_dir), &["fetch", "--tags"]).await?;
        } else {
            tokio::fs::create_dir_all(&self.dir).await?;
            tracing::info!(
                url = %source.url,
                dir = %clone_dir.display(),
                "cloning chart repository"
            );
            let target = clone_dir.display().to_string();
            self.git(source, None, &["clone", &source.url, &target]).await?;
        }

        if let Some(reference) = &source.reference {
            tracing::debug!(url = %source.url, reference = %reference, "checking out");
            self.git(source, Some(&clone_dir), &["checkout", reference]).await?;
        }
        Ok((clone_dir, guard))
    }

    async fn git(&self, source: &GitSource, cwd: Option<&Path>, args: &[&str]) -> Result<()> {
        let mut command = tokio::process::Command::new(&self.binary);
        command.args(args);
        if let Some(cwd) = cwd {
            command.current_dir(cwd);
        }
        let output = command.output().await.map_err(|e| EngineError::Git {
            url: source.url.clone(),
            message: format!("failed to run '{}': {}", self.binary.display(), e),
        })?;
        if !output.status.success() {
            return Err(EngineError::Git {
                url: source.url.clone(),
                message: format!(
                    "git {} exited with {}: {}",
                    args.first().copied().unwrap_or_default(),
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use tempfile::TempDir;

    #[test]
    fn test_parse_ref_query() {
        let source = GitSource::parse("https://github.com/org/charts.git?ref=v1.2.0");
        assert_eq!(source.url, "https://github.com/org/charts.git");
        assert_eq!(source.reference.as_deref(), Some("v1.2.0"));

        let source = GitSource::parse("git@github.com:org/charts.git?rev=abc123");
        assert_eq!(source.url, "git@github.com:org/charts.git");
        assert_eq!(source.reference.as_deref(), Some("abc123"));

        assert_eq!(GitSource::parse("https://example.com/repo").reference, None);
    }

    #[test]
    fn test_cache_name_ignores_ref() {
        let a = GitSource::parse("https://github.com/org/charts.git?ref=v1");
        let b = GitSource::parse("https://github.com/org/charts.git?ref=v2");
        assert_eq!(a.cache_name(), b.cache_name());
        assert!(a.cache_name().ends_with("-charts.git"));
        assert_ne!(
            a.cache_name(),
            GitSource::parse("https://github.com/other/charts.git").cache_name()
        );
    }

    #[tokio::test]
    async fn test_missing_binary_is_git_error() {
        let cache = TempDir::new().unwrap();
        let repos = RepoCache::new(cache.path()).with_binary("/nonexistent/git");
        let result = repos.checkout(&GitSource::parse("https://example.com/r.git")).await;
        assert!(matches!(result, Err(EngineError::Git { .. })));
    }

    fn git(dir: &Path, args: &[&str]) -> bool {
        Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    #[tokio::test]
    async fn test_clone_then_reuse_cached_clone() {
        let upstream = TempDir::new().unwrap();
        let ok = git(upstream.path(), &["init", "-q"])
            && git(upstream.path(), &["config", "user.email", "ci@example.com"])
            && git(upstream.path(), &["config", "user.name", "ci"]);
        if !ok {
            // git is not installed
            return;
        }
        std::fs::create_dir(upstream.path().join("chart")).unwrap();
        std::fs::write(upstream.path().join("chart/Chart.yaml"), "name: demo\n").unwrap();
        assert!(git(upstream.path(), &["add", "."]));
        assert!(git(upstream.path(), &["commit", "-q", "-m", "init"]));
        assert!(git(upstream.path(), &["tag", "v1"]));

        let cache = TempDir::new().unwrap();
        let repos = RepoCache::new(cache.path().join("repo-cache"));
        let spec = format!("{}?ref=v1", upstream.path().display());
        let source = GitSource::parse(&spec);

        let (first, guard) = repos.checkout(&source).await.unwrap();
        assert!(first.join("chart/Chart.yaml").is_file());
        drop(guard);

        let (second, _guard) = repos.checkout(&source).await.unwrap();
        assert_eq!(first, second);
    }
}
