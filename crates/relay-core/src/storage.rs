//! Persisted mirror of the relay's stores, permissions, and settings.
//!
//! Keys are short names (`gazeData`, `userPermissions`, ...). Backends
//! namespace them with a prefix so several relays can share one location.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{RelayError, RelayResult};

pub const PERMISSIONS_KEY: &str = "userPermissions";
pub const SETTINGS_KEY: &str = "settings";

#[async_trait]
pub trait StorageBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn get(&self, key: &str) -> RelayResult<Option<Value>>;

    async fn set(&self, key: &str, value: &Value) -> RelayResult<()>;

    async fn remove(&self, key: &str) -> RelayResult<()>;
}

/// In-memory backend with an optional byte quota.
pub struct MemoryStorage {
    prefix: String,
    quota_bytes: Option<usize>,
    entries: Mutex<HashMap<String, Value>>,
}

impl MemoryStorage {
    pub fn new<S: Into<String>>(prefix: S) -> Self {
        Self { prefix: prefix.into(), quota_bytes: None, entries: Mutex::new(HashMap::new()) }
    }

    /// Reject writes that would push the serialized total over `bytes`.
    pub fn with_quota(mut self, bytes: usize) -> Self {
        self.quota_bytes = Some(bytes);
        self
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.entries.lock().keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl StorageBackend for MemoryStorage {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, key: &str) -> RelayResult<Option<Value>> {
        Ok(self.entries.lock().get(&self.full_key(key)).cloned())
    }

    async fn set(&self, key: &str, value: &Value) -> RelayResult<()> {
        let full_key = self.full_key(key);
        let mut entries = self.entries.lock();
        if let Some(quota) = self.quota_bytes {
            let others: usize = entries
                .iter()
                .filter(|(k, _)| **k != full_key)
                .map(|(_, v)| v.to_string().len())
                .sum();
            let total = others + value.to_string().len();
            if total > quota {
                return Err(RelayError::PersistenceFailure(format!(
                    "quota exceeded writing {}: {} > {} bytes",
                    key, total, quota
                )));
            }
        }
        entries.insert(full_key, value.clone());
        Ok(())
    }

    async fn remove(&self, key: &str) -> RelayResult<()> {
        self.entries.lock().remove(&self.full_key(key));
        Ok(())
    }
}

/// One JSON file per key under a directory.
pub struct FileStorage {
    dir: PathBuf,
    prefix: String,
}

impl FileStorage {
    pub fn new<P: Into<PathBuf>, S: Into<String>>(dir: P, prefix: S) -> Self {
        Self { dir: dir.into(), prefix: prefix.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}{}.json", self.prefix, key))
    }
}

fn io_failure(what: &str, path: &Path, err: std::io::Error) -> RelayError {
    RelayError::PersistenceFailure(format!("{} {}: {}", what, path.display(), err))
}

#[async_trait]
impl StorageBackend for FileStorage {
    fn name(&self) -> &str {
        "file"
    }

    async fn get(&self, key: &str) -> RelayResult<Option<Value>> {
        let path = self.path_for(key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| RelayError::PersistenceFailure(format!("corrupt {}: {}", path.display(), e))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_failure("read", &path, e)),
        }
    }

    async fn set(&self, key: &str, value: &Value) -> RelayResult<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| io_failure("create", &self.dir, e))?;
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec(value)?;
        tokio::fs::write(&tmp, bytes).await.map_err(|e| io_failure("write", &tmp, e))?;
        tokio::fs::rename(&tmp, &path).await.map_err(|e| io_failure("rename", &path, e))
    }

    async fn remove(&self, key: &str) -> RelayResult<()> {
        let path = self.path_for(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_failure("remove", &path, e)),
        }
    }
}

/// Writes fan out to every backend; reads return the first hit.
#[derive(Clone, Default)]
pub struct StorageMirror {
    backends: Vec<Arc<dyn StorageBackend>>,
}

impl StorageMirror {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_backend(mut self, backend: Arc<dyn StorageBackend>) -> Self {
        self.backends.push(backend);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Fails only when every backend failed.
    pub async fn set(&self, key: &str, value: &Value) -> RelayResult<()> {
        let mut last_err = None;
        let mut ok = 0;
        for backend in &self.backends {
            match backend.set(key, value).await {
                Ok(()) => ok += 1,
                Err(e) => {
                    warn!(backend = backend.name(), key, error = %e, "mirror write failed");
                    last_err = Some(e);
                }
            }
        }
        match last_err {
            Some(e) if ok == 0 => Err(e),
            _ => Ok(()),
        }
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        for backend in &self.backends {
            match backend.get(key).await {
                Ok(Some(value)) => return Some(value),
                Ok(None) => {}
                Err(e) => warn!(backend = backend.name(), key, error = %e, "mirror read failed"),
            }
        }
        None
    }

    pub async fn remove(&self, key: &str) {
        for backend in &self.backends {
            if let Err(e) = backend.remove(key).await {
                warn!(backend = backend.name(), key, error = %e, "mirror remove failed");
            } else {
                debug!(backend = backend.name(), key, "mirror entry removed");
            }
        }
    }
}
