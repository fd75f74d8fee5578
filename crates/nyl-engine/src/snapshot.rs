//! Cluster Snapshot
//!
//! A per-render, read-through cache over a [`ClusterReader`]. Every object
//! key is read at most once per render; all templates referencing the same
//! object observe the same result.

use async_trait::async_trait;
use futures::future::join_all;
use nyl_core::lookup::{DeferReason, FieldLookup, LookupError, LookupErrorKind};
use nyl_core::{Lookup, LookupResult, ObjectKey, Reference};
use serde_json::Value as JsonValue;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ClusterReadError {
    #[error("read timed out after {0:?}")]
    Timeout(Duration),

    #[error("{0}")]
    Unavailable(String),
}

/// Read-only access to live cluster objects
#[async_trait]
pub trait ClusterReader: Send + Sync {
    /// The object, or `None` if it does not exist
    async fn get(&self, key: &ObjectKey) -> Result<Option<JsonValue>, ClusterReadError>;

    /// Server version (`1.31` style), if known
    async fn server_version(&self) -> Option<String> {
        None
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SnapshotEntry {
    Found(Arc<JsonValue>),
    NotFound,
    Unavailable(String),
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Default)]
pub struct ClusterSnapshot {
    entries: RwLock<HashMap<ObjectKey, SnapshotEntry>>,
    fetches: AtomicUsize,
}

impl ClusterSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn peek(&self, key: &ObjectKey) -> Option<SnapshotEntry> {
        read(&self.entries).get(key).cloned()
    }

    /// Number of reads issued against the reader
    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Fetch every key not cached yet, concurrently, bounded by `timeout`
    pub async fn fill(&self, reader: &dyn ClusterReader, keys: &[ObjectKey], timeout: Duration) {
        let missing: Vec<&ObjectKey> = {
            let entries = read(&self.entries);
            let mut seen = HashSet::new();
            keys.iter()
                .filter(|k| !entries.contains_key(*k) && seen.insert(*k))
                .collect()
        };
        if missing.is_empty() {
            return;
        }

        self.fetches.fetch_add(missing.len(), Ordering::SeqCst);
        tracing::debug!(count = missing.len(), "fetching cluster objects");

        let results = join_all(missing.into_iter().map(|key| async move {
            let result = match tokio::time::timeout(timeout, reader.get(key)).await {
                Ok(result) => result,
                Err(_) => Err(ClusterReadError::Timeout(timeout)),
            };
            (key.clone(), result)
        }))
        .await;

        let mut entries = write(&self.entries);
        for (key, result) in results {
            let entry = match result {
                Ok(Some(object)) => SnapshotEntry::Found(Arc::new(object)),
                Ok(None) => SnapshotEntry::NotFound,
                Err(e) => {
                    tracing::warn!(object = %key, error = %e, "cluster read unavailable");
                    SnapshotEntry::Unavailable(e.to_string())
                }
            };
            entries.entry(key).or_insert(entry);
        }
    }

    /// Resolve a reference against cached state only
    pub fn resolve(&self, reference: &Reference) -> LookupResult {
        let deferred = |reason| LookupResult::deferred(Lookup::Ref(reference.clone()), reason);

        match self.peek(&reference.key) {
            None => deferred(DeferReason::NotYetFetched),
            Some(SnapshotEntry::NotFound) => deferred(DeferReason::NotFound),
            Some(SnapshotEntry::Unavailable(reason)) => {
                deferred(DeferReason::ClusterUnavailable(reason))
            }
            Some(SnapshotEntry::Found(object)) => match reference.extract(&object) {
                FieldLookup::Found(value) => LookupResult::Resolved(value),
                FieldLookup::Missing => deferred(DeferReason::FieldMissing),
                FieldLookup::Invalid(detail) => {
                    LookupResult::Error(LookupError::new(LookupErrorKind::InvalidReference, detail))
                }
            },
        }
    }
}

/// Operation counts for test assertions
#[derive(Debug, Default, Clone)]
pub struct ReadCounts {
    pub gets: usize,
    pub per_key: HashMap<ObjectKey, usize>,
}

/// In-memory cluster for tests
#[derive(Clone, Default)]
pub struct StaticCluster {
    objects: Arc<RwLock<Vec<JsonValue>>>,
    unavailable: Arc<RwLock<HashMap<ObjectKey, String>>>,
    version: Option<String>,
    delay: Option<Duration>,
    reads: Arc<RwLock<ReadCounts>>,
}

impl StaticCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_objects(objects: Vec<JsonValue>) -> Self {
        let cluster = Self::new();
        for object in objects {
            cluster.insert(object);
        }
        cluster
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Delay every read, to exercise read timeouts
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Add or replace an object, keyed by its kind, namespace and name
    pub fn insert(&self, object: JsonValue) {
        let mut objects = write(&self.objects);
        let identity = identity_of(&object);
        objects.retain(|existing| identity_of(existing) != identity);
        objects.push(object);
    }

    /// Reads of `key` fail as unavailable
    pub fn fail(&self, key: ObjectKey, reason: impl Into<String>) {
        write(&self.unavailable).insert(key, reason.into());
    }

    pub fn read_counts(&self) -> ReadCounts {
        read(&self.reads).clone()
    }

    fn find(&self, key: &ObjectKey) -> Option<JsonValue> {
        read(&self.objects)
            .iter()
            .find(|object| matches_key(object, key))
            .cloned()
    }
}

fn identity_of(object: &JsonValue) -> (Option<&str>, Option<&str>, Option<&str>, Option<&str>) {
    let meta = object.get("metadata");
    (
        object.get("apiVersion").and_then(|v| v.as_str()),
        object.get("kind").and_then(|v| v.as_str()),
        meta.and_then(|m| m.get("namespace")).and_then(|v| v.as_str()),
        meta.and_then(|m| m.get("name")).and_then(|v| v.as_str()),
    )
}

fn matches_key(object: &JsonValue, key: &ObjectKey) -> bool {
    let (api_version, kind, namespace, name) = identity_of(object);
    let group_matches = match key.group() {
        Some(group) => api_version.is_some_and(|v| v.starts_with(&format!("{group}/"))),
        None => true,
    };
    kind == Some(key.kind_name())
        && group_matches
        && name == Some(key.name.as_str())
        && (namespace.is_none() || namespace == key.namespace.as_deref())
}

#[async_trait]
impl ClusterReader for StaticCluster {
    async fn get(&self, key: &ObjectKey) -> Result<Option<JsonValue>, ClusterReadError> {
        {
            let mut reads = write(&self.reads);
            reads.gets += 1;
            *reads.per_key.entry(key.clone()).or_default() += 1;
        }

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(reason) = read(&self.unavailable).get(key) {
            return Err(ClusterReadError::Unavailable(reason.clone()));
        }
        Ok(self.find(key))
    }

    async fn server_version(&self) -> Option<String> {
        self.version.clone()
    }
}

/// Reader for renders without cluster access; every read is unavailable
#[derive(Debug, Clone, Default)]
pub struct OfflineCluster;

#[async_trait]
impl ClusterReader for OfflineCluster {
    async fn get(&self, _key: &ObjectKey) -> Result<Option<JsonValue>, ClusterReadError> {
        Err(ClusterReadError::Unavailable("offline mode".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn secret_key() -> ObjectKey {
        ObjectKey::new("Secret", Some("db".into()), "creds")
    }

    fn cluster() -> StaticCluster {
        StaticCluster::with_objects(vec![json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": {"name": "creds", "namespace": "db"},
            "data": {"password": "aHVudGVyMg=="},
        })])
    }

    #[tokio::test]
    async fn test_fill_reads_each_key_once() {
        let cluster = cluster();
        let snapshot = ClusterSnapshot::new();
        let timeout = Duration::from_secs(1);

        snapshot.fill(&cluster, &[secret_key(), secret_key()], timeout).await;
        snapshot.fill(&cluster, &[secret_key()], timeout).await;

        assert_eq!(cluster.read_counts().per_key[&secret_key()], 1);
        assert_eq!(snapshot.fetches(), 1);
        assert!(matches!(snapshot.peek(&secret_key()), Some(SnapshotEntry::Found(_))));
    }

    #[tokio::test]
    async fn test_resolve_states() {
        let cluster = cluster();
        let snapshot = ClusterSnapshot::new();
        let reference = Reference::parse_shorthand("Secret:db/creds.password", "default").unwrap();
        let missing = Reference::parse_shorthand("Secret:db/other.password", "default").unwrap();

        assert!(matches!(
            snapshot.resolve(&reference),
            LookupResult::Deferred(m) if m.reason == DeferReason::NotYetFetched
        ));

        snapshot
            .fill(&cluster, &[reference.key.clone(), missing.key.clone()], Duration::from_secs(1))
            .await;

        assert_eq!(snapshot.resolve(&reference), LookupResult::Resolved(json!("hunter2")));
        assert!(matches!(
            snapshot.resolve(&missing),
            LookupResult::Deferred(m) if m.reason == DeferReason::NotFound
        ));
    }

    #[tokio::test]
    async fn test_unavailable_and_timeout_defer() {
        let cluster = cluster();
        cluster.fail(secret_key(), "connection refused");
        let snapshot = ClusterSnapshot::new();
        snapshot.fill(&cluster, &[secret_key()], Duration::from_secs(1)).await;
        assert_eq!(
            snapshot.peek(&secret_key()),
            Some(SnapshotEntry::Unavailable("connection refused".into()))
        );

        let slow = StaticCluster::new().with_delay(Duration::from_millis(200));
        let snapshot = ClusterSnapshot::new();
        snapshot.fill(&slow, &[secret_key()], Duration::from_millis(10)).await;
        assert!(matches!(snapshot.peek(&secret_key()), Some(SnapshotEntry::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_qualified_kind_lookup() {
        let cluster = StaticCluster::with_objects(vec![json!({
            "apiVersion": "cert-manager.io/v1",
            "kind": "Certificate",
            "metadata": {"name": "tls", "namespace": "web"},
            "status": {"ready": true},
        })]);
        let key = ObjectKey::new("Certificate.cert-manager.io", Some("web".into()), "tls");
        assert!(cluster.get(&key).await.unwrap().is_some());

        let wrong_group = ObjectKey::new("Certificate.example.com", Some("web".into()), "tls");
        assert!(cluster.get(&wrong_group).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_offline_cluster() {
        let result = OfflineCluster.get(&secret_key()).await;
        assert!(matches!(result, Err(ClusterReadError::Unavailable(_))));
    }
}
