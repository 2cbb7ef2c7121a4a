use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::warn;

use super::db::DbHandle;
use super::models::Quality;

/// Deterministic SHA-256 hex digest of a canonical request string.
pub fn fingerprint(canonical: &str) -> String {
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

/// Canonical text for a generation request. The version tag invalidates old
/// entries whenever prompt policy changes.
pub fn generation_canonical(provider: &str, model: &str, request_json: &str) -> String {
    format!("gen:v3:{provider}:{model}:{request_json}")
}

pub fn render_canonical(quality: Quality, code: &str) -> String {
    format!("render:v2:{}:{}", quality.as_str(), code)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheNamespace {
    /// fingerprint → generated code
    Generation,
    /// fingerprint → job id that produced a usable video
    Render,
}

impl CacheNamespace {
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Generation => "cache:generate",
            Self::Render => "cache:render",
        }
    }

    pub fn key(&self, fingerprint: &str) -> String {
        format!("{}:{}", self.prefix(), fingerprint)
    }
}

/// Minimal string key-value backend behind the result cache.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn put(&self, key: &str, value: &str) -> Result<()>;

    fn backend_name(&self) -> &'static str;
}

#[derive(Default)]
pub struct MemoryKeyValueStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.lock().map_err(|e| anyhow!("cache lock poisoned: {}", e))?;
        Ok(entries.get(key).cloned())
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self.entries.lock().map_err(|e| anyhow!("cache lock poisoned: {}", e))?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

pub struct SqliteKeyValueStore {
    db: DbHandle,
}

impl SqliteKeyValueStore {
    pub fn new(db: DbHandle) -> Self {
        Self { db }
    }
}

#[async_trait]
impl KeyValueStore for SqliteKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let key = key.to_string();
        self.db.call(move |db| db.cache_get(&key)).await
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        let (key, value) = (key.to_string(), value.to_string());
        self.db.call(move |db| db.cache_put(&key, &value)).await
    }

    fn backend_name(&self) -> &'static str {
        "sqlite"
    }
}

/// Namespaced cache over a `KeyValueStore`. Backend failures degrade to
/// misses and dropped writes; they never fail the caller.
#[derive(Clone)]
pub struct ResultCache {
    backend: Arc<dyn KeyValueStore>,
}

impl ResultCache {
    pub fn new(backend: Arc<dyn KeyValueStore>) -> Self {
        Self { backend }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryKeyValueStore::new()))
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.backend_name()
    }

    pub async fn get(&self, namespace: CacheNamespace, fingerprint: &str) -> Option<String> {
        let key = namespace.key(fingerprint);
        match self.backend.get(&key).await {
            Ok(value) => value,
            Err(e) => {
                warn!(key = %key, error = %e, "cache read failed; treating as miss");
                None
            }
        }
    }

    pub async fn put(&self, namespace: CacheNamespace, fingerprint: &str, value: &str) {
        let key = namespace.key(fingerprint);
        if let Err(e) = self.backend.put(&key, value).await {
            warn!(key = %key, error = %e, "cache write failed");
        }
    }
}
