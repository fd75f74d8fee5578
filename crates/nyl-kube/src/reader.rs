//! Discovery-backed cluster reader

use async_trait::async_trait;
use kube::api::{Api, DynamicObject};
use kube::discovery::{ApiCapabilities, ApiResource, Discovery, Scope};
use nyl_core::ObjectKey;
use nyl_engine::{ClusterReadError, ClusterReader};
use serde_json::Value as JsonValue;
use tokio::sync::OnceCell;

use crate::error::{KubeError, Result};

/// Reads live objects from the API server the client points at
pub struct KubeClusterReader {
    client: kube::Client,
    discovery: OnceCell<Discovery>,
}

impl KubeClusterReader {
    pub fn new(client: kube::Client) -> Self {
        Self {
            client,
            discovery: OnceCell::new(),
        }
    }

    /// Connect using the ambient kubeconfig or in-cluster service account
    pub async fn try_default() -> Result<Self> {
        let client = kube::Client::try_default().await?;
        Ok(Self::new(client))
    }

    pub fn kube_client(&self) -> &kube::Client {
        &self.client
    }

    /// Discovery runs once per reader, on the first lookup
    async fn discovery(&self) -> Result<&Discovery> {
        self.discovery
            .get_or_try_init(|| async {
                tracing::debug!("running API discovery");
                Discovery::new(self.client.clone())
                    .run()
                    .await
                    .map_err(|e| KubeError::Discovery(e.to_string()))
            })
            .await
    }

    async fn resolve_kind(
        &self,
        key: &ObjectKey,
    ) -> Result<Option<(ApiResource, ApiCapabilities)>> {
        let discovery = self.discovery().await?;
        let candidates = discovery
            .groups()
            .filter(|group| key.group().is_none_or(|g| group.name() == g))
            .flat_map(|group| group.recommended_resources());
        Ok(select_resource(candidates, key.kind_name(), key.group()))
    }

    /// Fetch one object as plain JSON
    pub async fn fetch(&self, key: &ObjectKey) -> Result<Option<JsonValue>> {
        let Some((resource, caps)) = self.resolve_kind(key).await? else {
            tracing::debug!(kind = %key.kind, "kind not served by the cluster");
            return Ok(None);
        };

        let api: Api<DynamicObject> = match (&caps.scope, key.namespace.as_deref()) {
            (Scope::Namespaced, Some(ns)) => {
                Api::namespaced_with(self.client.clone(), ns, &resource)
            }
            (Scope::Namespaced, None) => {
                Api::default_namespaced_with(self.client.clone(), &resource)
            }
            (Scope::Cluster, _) => Api::all_with(self.client.clone(), &resource),
        };

        let Some(object) = api.get_opt(&key.name).await? else {
            return Ok(None);
        };
        let mut value = serde_json::to_value(&object)?;
        // DynamicObject drops apiVersion/kind on some servers
        if let Some(map) = value.as_object_mut() {
            map.entry("apiVersion")
                .or_insert_with(|| JsonValue::String(resource.api_version.clone()));
            map.entry("kind")
                .or_insert_with(|| JsonValue::String(resource.kind.clone()));
        }
        Ok(Some(value))
    }
}

#[async_trait]
impl ClusterReader for KubeClusterReader {
    async fn get(
        &self,
        key: &ObjectKey,
    ) -> std::result::Result<Option<JsonValue>, ClusterReadError> {
        tracing::debug!(object = %key, "reading live object");
        match self.fetch(key).await {
            Ok(found) => Ok(found),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => {
                tracing::warn!(object = %key, error = %err, "cluster read failed");
                Err(ClusterReadError::Unavailable(err.to_string()))
            }
        }
    }

    async fn server_version(&self) -> Option<String> {
        match self.client.apiserver_version().await {
            Ok(info) => format_server_version(&info.major, &info.minor),
            Err(err) => {
                tracing::warn!(error = %err, "could not read server version");
                None
            }
        }
    }
}

/// Pick the resource serving `kind`, preferring the core group for unqualified kinds
fn select_resource(
    candidates: impl IntoIterator<Item = (ApiResource, ApiCapabilities)>,
    kind: &str,
    group: Option<&str>,
) -> Option<(ApiResource, ApiCapabilities)> {
    let mut fallback = None;
    for (resource, caps) in candidates {
        if resource.kind != kind {
            continue;
        }
        match group {
            Some(g) if resource.group == g => return Some((resource, caps)),
            Some(_) => {}
            None if resource.group.is_empty() => return Some((resource, caps)),
            None => {
                if fallback.is_none() {
                    fallback = Some((resource, caps));
                }
            }
        }
    }
    fallback
}

/// `1.31` from the version info; managed clusters report minors like `31+`
fn format_server_version(major: &str, minor: &str) -> Option<String> {
    let major: String = major.chars().take_while(|c| c.is_ascii_digit()).collect();
    let minor: String = minor.chars().take_while(|c| c.is_ascii_digit()).collect();
    if major.is_empty() || minor.is_empty() {
        return None;
    }
    Some(format!("{major}.{minor}"))
}
