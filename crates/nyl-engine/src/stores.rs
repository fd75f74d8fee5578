//! Secret stores
//!
//! Named, read-only key/value providers configured in the deployment
//! document. Keys are dotted paths into the store's nested data. Stores
//! backed by an external program do that work in [`SecretStore::load`],
//! before any template is evaluated; lookups only read memory.

use async_trait::async_trait;
use indexmap::IndexMap;
use nyl_core::lookup::{LookupError, LookupErrorKind};
use nyl_core::{DeploymentConfig, LookupResult, SecretRef, SecretStoreConfig};
use once_cell::sync::OnceCell;
use serde_json::Value as JsonValue;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::process::Command;

use crate::error::{EngineError, Result};
use crate::suggestions::suggest_store;

#[async_trait]
pub trait SecretStore: Send + Sync + std::fmt::Debug {
    /// Fetch or decrypt the store's data; called before every render
    async fn load(&self) -> Result<()> {
        Ok(())
    }

    /// Value at a dotted key path, or `None` if absent
    fn get(&self, key: &str) -> Result<Option<JsonValue>>;

    /// Every key path in the store, sorted
    fn keys(&self) -> Result<Vec<String>>;
}

fn get_path(data: &JsonValue, key: &str) -> Option<JsonValue> {
    nyl_core::lookup::get_path(data, key)
        .filter(|v| !v.is_null())
        .cloned()
}

/// All prefix paths of nested mappings (`a`, `a.b`, `a.b.c`), sorted
fn key_paths(data: &JsonValue) -> Vec<String> {
    fn walk(value: &JsonValue, prefix: &str, out: &mut Vec<String>) {
        if let JsonValue::Object(map) = value {
            for (key, child) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                walk(child, &path, out);
                out.push(path);
            }
        }
    }

    let mut out = Vec::new();
    walk(data, "", &mut out);
    out.sort();
    out
}

/// A store without keys
#[derive(Debug, Default)]
pub struct NullStore;

#[async_trait]
impl SecretStore for NullStore {
    fn get(&self, _key: &str) -> Result<Option<JsonValue>> {
        Ok(None)
    }

    fn keys(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

/// Inline data
#[derive(Debug, Default)]
pub struct StaticStore {
    data: JsonValue,
}

impl StaticStore {
    pub fn new(data: JsonValue) -> Self {
        Self { data }
    }
}

#[async_trait]
impl SecretStore for StaticStore {
    fn get(&self, key: &str) -> Result<Option<JsonValue>> {
        Ok(get_path(&self.data, key))
    }

    fn keys(&self) -> Result<Vec<String>> {
        Ok(key_paths(&self.data))
    }
}

/// SOPS-encrypted file, decrypted once with the `sops` binary
#[derive(Debug)]
pub struct SopsStore {
    name: String,
    path: PathBuf,
    age_key: Option<String>,
    binary: String,
    /// Decrypted data, or why decryption failed
    cache: OnceCell<std::result::Result<JsonValue, String>>,
}

impl SopsStore {
    pub fn new(name: impl Into<String>, path: PathBuf, age_key: Option<String>) -> Self {
        Self {
            name: name.into(),
            path,
            age_key,
            binary: "sops".to_string(),
            cache: OnceCell::new(),
        }
    }

    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    fn store_error(&self, message: impl Into<String>) -> EngineError {
        EngineError::SecretStore {
            store: self.name.clone(),
            message: message.into(),
        }
    }

    async fn decrypt(&self) -> std::result::Result<JsonValue, String> {
        tracing::debug!(store = %self.name, path = %self.path.display(), "decrypting sops file");

        let mut cmd = Command::new(&self.binary);
        cmd.arg("--output-type")
            .arg("json")
            .arg("--decrypt")
            .arg(&self.path);
        if let Some(key) = &self.age_key {
            cmd.env("SOPS_AGE_KEY", key);
        }

        let output = cmd
            .output()
            .await
            .map_err(|e| format!("failed to run '{}': {}", self.binary, e))?;
        if !output.status.success() {
            return Err(String::from_utf8_lossy(&output.stderr).trim().to_string());
        }
        serde_json::from_slice(&output.stdout).map_err(|e| format!("invalid sops output: {e}"))
    }

    fn data(&self) -> Result<&JsonValue> {
        match self.cache.get() {
            Some(Ok(data)) => Ok(data),
            Some(Err(message)) => Err(self.store_error(message.as_str())),
            None => Err(self.store_error("store was not loaded before use")),
        }
    }
}

#[async_trait]
impl SecretStore for SopsStore {
    async fn load(&self) -> Result<()> {
        if self.cache.get().is_none() {
            let decrypted = self.decrypt().await;
            // A concurrent render may have won; either result is equivalent
            let _ = self.cache.set(decrypted);
        }
        self.data().map(|_| ())
    }

    fn get(&self, key: &str) -> Result<Option<JsonValue>> {
        Ok(get_path(self.data()?, key))
    }

    fn keys(&self) -> Result<Vec<String>> {
        Ok(key_paths(self.data()?))
    }
}

/// Named stores visible to a render
#[derive(Debug, Clone, Default)]
pub struct SecretStores {
    stores: IndexMap<String, Arc<dyn SecretStore>>,
}

impl SecretStores {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &DeploymentConfig) -> Self {
        let mut stores = Self::new();
        for (name, store) in &config.secret_stores {
            let store: Arc<dyn SecretStore> = match store {
                SecretStoreConfig::Sops { path, age_key } => {
                    Arc::new(SopsStore::new(name.clone(), path.clone(), age_key.clone()))
                }
                SecretStoreConfig::Static { data } => Arc::new(StaticStore::new(data.clone())),
                SecretStoreConfig::Null => Arc::new(NullStore),
            };
            stores.insert(name.clone(), store);
        }
        stores
    }

    pub fn insert(&mut self, name: impl Into<String>, store: Arc<dyn SecretStore>) {
        self.stores.insert(name.into(), store);
    }

    pub fn names(&self) -> Vec<&str> {
        self.stores.keys().map(String::as_str).collect()
    }

    /// Load every store. A store that fails to load stays registered; its
    /// lookups report the failure.
    pub async fn load(&self) {
        let loads = self.stores.iter().map(|(name, store)| async move {
            if let Err(e) = store.load().await {
                tracing::warn!(store = %name, error = %e, "secret store failed to load");
            }
        });
        futures::future::join_all(loads).await;
    }

    /// Restrict to the stores an application binds; `None` keeps all
    pub fn scoped(&self, allowed: Option<&[String]>) -> Self {
        let Some(allowed) = allowed else {
            return self.clone();
        };
        Self {
            stores: self
                .stores
                .iter()
                .filter(|(name, _)| allowed.contains(name))
                .map(|(name, store)| (name.clone(), Arc::clone(store)))
                .collect(),
        }
    }

    pub fn lookup(&self, secret: &SecretRef) -> LookupResult {
        let Some(store) = self.stores.get(&secret.store) else {
            return LookupResult::Error(LookupError::new(
                LookupErrorKind::SecretStoreNotFound,
                format!(
                    "unknown secret store '{}'. {}",
                    secret.store,
                    suggest_store(&secret.store, &self.names())
                ),
            ));
        };

        match store.get(&secret.key) {
            Ok(Some(value)) => LookupResult::Resolved(value),
            Ok(None) if secret.optional => LookupResult::Resolved(JsonValue::Null),
            Ok(None) => LookupResult::Error(LookupError::new(
                LookupErrorKind::SecretNotFound,
                format!("key '{}' not found in secret store '{}'", secret.key, secret.store),
            )),
            Err(e) => LookupResult::Error(LookupError::new(
                LookupErrorKind::SecretStoreFailed,
                e.to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn stores() -> SecretStores {
        let mut stores = SecretStores::new();
        stores.insert(
            "main",
            Arc::new(StaticStore::new(json!({"db": {"password": "s3cret", "user": "app"}}))),
        );
        stores.insert("empty", Arc::new(NullStore));
        stores
    }

    fn secret(store: &str, key: &str, optional: bool) -> SecretRef {
        SecretRef {
            store: store.into(),
            key: key.into(),
            optional,
        }
    }

    #[test]
    fn test_static_get_and_keys() {
        let store = StaticStore::new(json!({"db": {"password": "s3cret"}, "token": "t"}));
        assert_eq!(store.get("db.password").unwrap(), Some(json!("s3cret")));
        assert_eq!(store.get("db.missing").unwrap(), None);
        assert_eq!(store.keys().unwrap(), vec!["db", "db.password", "token"]);
    }

    #[test]
    fn test_lookup_resolves() {
        let result = stores().lookup(&secret("main", "db.user", false));
        assert_eq!(result, LookupResult::Resolved(json!("app")));
    }

    #[test]
    fn test_missing_key_is_error_unless_optional() {
        let stores = stores();
        match stores.lookup(&secret("empty", "x", false)) {
            LookupResult::Error(e) => assert_eq!(e.kind, LookupErrorKind::SecretNotFound),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            stores.lookup(&secret("empty", "x", true)),
            LookupResult::Resolved(JsonValue::Null)
        );
    }

    #[test]
    fn test_unknown_store_suggests() {
        match stores().lookup(&secret("mian", "db.user", true)) {
            LookupResult::Error(e) => {
                assert_eq!(e.kind, LookupErrorKind::SecretStoreNotFound);
                assert!(e.detail.contains("`main`"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_scoped_hides_unbound_stores() {
        let scoped = stores().scoped(Some(&["empty".to_string()]));
        assert_eq!(scoped.names(), vec!["empty"]);
        assert!(matches!(
            scoped.lookup(&secret("main", "db.user", false)),
            LookupResult::Error(_)
        ));
    }

    #[tokio::test]
    async fn test_sops_missing_binary_is_store_error() {
        let store = SopsStore::new("enc", PathBuf::from("secrets.yaml"), None)
            .with_binary("/nonexistent/sops-binary");
        assert!(matches!(store.load().await, Err(EngineError::SecretStore { .. })));

        let message = store.get("a").unwrap_err().to_string();
        assert!(message.contains("failed to run"));
    }

    #[test]
    fn test_sops_unloaded_store_does_not_decrypt() {
        let store = SopsStore::new("enc", PathBuf::from("secrets.yaml"), None)
            .with_binary("/nonexistent/sops-binary");
        let message = store.get("a").unwrap_err().to_string();
        assert!(message.contains("not loaded"));
    }

    #[tokio::test]
    async fn test_sops_decrypts_through_binary() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-sops");
        let output = r#"{"db": {"password": "s3cret"}}"#;
        std::fs::write(&script, format!("#!/bin/sh\necho '{output}'\n")).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let store = SopsStore::new("enc", dir.path().join("secrets.yaml"), None)
            .with_binary(script.display().to_string());
        let mut stores = SecretStores::new();
        stores.insert("enc", Arc::new(store));
        stores.load().await;

        assert_eq!(
            stores.lookup(&secret("enc", "db.password", false)),
            LookupResult::Resolved(json!("s3cret"))
        );
    }

    #[test]
    fn test_from_config() {
        let config: DeploymentConfig = serde_yaml::from_str(
            "secretStores:\n  inline:\n    provider: static\n    data: {a: 1}\n\
             \x20 none:\n    provider: 'null'\n",
        )
        .unwrap();
        let stores = SecretStores::from_config(&config);
        assert_eq!(stores.names(), vec!["inline", "none"]);
        assert_eq!(
            stores.lookup(&secret("inline", "a", false)),
            LookupResult::Resolved(json!(1))
        );
    }
}
