//! Deployment document (`nyl-deployment.yaml`)
//!
//! Binds named secret stores, the Helm chart search path and cluster read
//! settings for every application rendered with it.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{CoreError, Result};

pub const DEPLOYMENT_FILE: &str = "nyl-deployment.yaml";

/// Secret store configuration, discriminated by `provider`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "provider", rename_all = "lowercase")]
pub enum SecretStoreConfig {
    /// SOPS encrypted file, decrypted with the `sops` binary
    Sops {
        path: PathBuf,

        /// Age key passed to `sops` as `SOPS_AGE_KEY`; intended for tests
        #[serde(default, rename = "ageKey", skip_serializing_if = "Option::is_none")]
        age_key: Option<String>,
    },

    /// Inline data
    Static {
        #[serde(default)]
        data: JsonValue,
    },

    /// A store without keys
    Null,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfig {
    /// Upper bound for a single batch of cluster reads
    #[serde(default = "default_read_timeout", with = "humantime_serde")]
    pub read_timeout: Duration,
}

fn default_read_timeout() -> Duration {
    Duration::from_secs(10)
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            read_timeout: default_read_timeout(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentConfig {
    /// Directories bare Helm chart paths are looked up in
    #[serde(default)]
    pub search_path: Vec<PathBuf>,

    #[serde(default)]
    pub secret_stores: IndexMap<String, SecretStoreConfig>,

    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Overrides the server version passed to Helm
    #[serde(default)]
    pub kube_version: Option<String>,
}

impl DeploymentConfig {
    /// Load from a file; relative paths are resolved against its directory
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| CoreError::InvalidDeployment {
            message: format!("{}: {}", path.display(), e),
        })?;

        let mut config: DeploymentConfig =
            serde_yaml::from_str(&content).map_err(|e| CoreError::InvalidDeployment {
                message: format!("{}: {}", path.display(), e),
            })?;

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        config.resolve_paths(base);

        tracing::debug!(
            deployment = %path.display(),
            stores = config.secret_stores.len(),
            "loaded deployment"
        );
        Ok(config)
    }

    /// Look for `nyl-deployment.yaml` in `dir`
    pub fn discover(dir: &Path) -> Result<Option<Self>> {
        let candidate = dir.join(DEPLOYMENT_FILE);
        if candidate.is_file() {
            Self::load(candidate).map(Some)
        } else {
            Ok(None)
        }
    }

    fn resolve_paths(&mut self, base: &Path) {
        for entry in &mut self.search_path {
            if entry.is_relative() {
                *entry = base.join(&*entry);
            }
        }
        for store in self.secret_stores.values_mut() {
            if let SecretStoreConfig::Sops { path, .. } = store {
                if path.is_relative() {
                    *path = base.join(&*path);
                }
            }
        }
    }
}
