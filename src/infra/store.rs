//! Page cache store seam.
//!
//! The durable key-value store holding rendered pages and derived images.
//! Production deployments back this with an external store; the in-memory
//! implementation serves embedding and tests.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;

use super::error::StoreError;

/// Durable key-value store for rendered page/image bytes.
#[async_trait]
pub trait PageCacheStore: Send + Sync {
    /// List stored keys starting with `prefix`. An empty prefix lists all.
    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Remove one key. Removing an absent key succeeds (idempotent).
    async fn remove(&self, key: &str) -> Result<(), StoreError>;

    /// Remove every stored key.
    async fn clear(&self) -> Result<(), StoreError>;

    async fn put(&self, key: &str, value: Bytes) -> Result<(), StoreError>;

    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError>;
}

/// In-memory page cache store.
#[derive(Default)]
pub struct MemoryPageCacheStore {
    entries: DashMap<String, Bytes>,
}

impl MemoryPageCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl PageCacheStore for MemoryPageCacheStore {
    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .entries
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|key| key.starts_with(prefix))
            .collect())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.entries.clear();
        Ok(())
    }

    async fn put(&self, key: &str, value: Bytes) -> Result<(), StoreError> {
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }
}
