//! Page timestamp row store seam.
//!
//! Durable rows carrying the per-page invalidation timestamp for
//! timestamp-varied pages, with an optimistic-concurrency version counter.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::cache::lock::{rw_read, rw_write};

use super::error::StoreError;

const SOURCE: &str = "infra::timestamp_store";

/// One durable page timestamp row.
///
/// `id` is `"{page_type}"` for whole-page-type rows or
/// `"{page_type}_{page_id}"` for per-instance rows. `timestamp` never
/// decreases; `version` is bumped on every successful write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageTimestampRow {
    pub id: String,
    pub timestamp: i64,
    pub version: u64,
}

/// Relational row store for [`PageTimestampRow`].
///
/// Bulk conditional updates are deliberately absent: the backing store does
/// not support multi-row optimistic updates safely, so callers update
/// existing rows individually.
#[async_trait]
pub trait PageTimestampStore: Send + Sync {
    async fn find(&self, id: &str) -> Result<Option<PageTimestampRow>, StoreError>;

    /// Fetch the subset of `ids` that exist.
    async fn find_many(&self, ids: &[String]) -> Result<Vec<PageTimestampRow>, StoreError>;

    /// Insert new rows. Fails with [`StoreError::VersionConflict`] if any id
    /// already exists (a concurrent creator won).
    async fn insert_many(&self, rows: Vec<PageTimestampRow>) -> Result<(), StoreError>;

    /// Optimistic single-row update: writes `timestamp` and bumps the
    /// version, but only when the stored version equals `expected_version`.
    async fn update(
        &self,
        id: &str,
        timestamp: i64,
        expected_version: u64,
    ) -> Result<PageTimestampRow, StoreError>;

    /// Bump every row's timestamp to at least `timestamp`. Returns the
    /// number of rows touched.
    async fn touch_all(&self, timestamp: i64) -> Result<usize, StoreError>;

    async fn all(&self) -> Result<Vec<PageTimestampRow>, StoreError>;
}

/// In-memory timestamp row store.
#[derive(Default)]
pub struct MemoryTimestampStore {
    rows: RwLock<HashMap<String, PageTimestampRow>>,
}

impl MemoryTimestampStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PageTimestampStore for MemoryTimestampStore {
    async fn find(&self, id: &str) -> Result<Option<PageTimestampRow>, StoreError> {
        Ok(rw_read(&self.rows, SOURCE, "find").get(id).cloned())
    }

    async fn find_many(&self, ids: &[String]) -> Result<Vec<PageTimestampRow>, StoreError> {
        let rows = rw_read(&self.rows, SOURCE, "find_many");
        Ok(ids.iter().filter_map(|id| rows.get(id).cloned()).collect())
    }

    async fn insert_many(&self, new_rows: Vec<PageTimestampRow>) -> Result<(), StoreError> {
        let mut rows = rw_write(&self.rows, SOURCE, "insert_many");
        for row in &new_rows {
            if rows.contains_key(&row.id) {
                return Err(StoreError::version_conflict(row.id.clone()));
            }
        }
        for row in new_rows {
            rows.insert(row.id.clone(), row);
        }
        Ok(())
    }

    async fn update(
        &self,
        id: &str,
        timestamp: i64,
        expected_version: u64,
    ) -> Result<PageTimestampRow, StoreError> {
        let mut rows = rw_write(&self.rows, SOURCE, "update");
        let row = rows
            .get_mut(id)
            .ok_or_else(|| StoreError::RowNotFound(id.to_string()))?;
        if row.version != expected_version {
            return Err(StoreError::version_conflict(id));
        }
        row.timestamp = timestamp;
        row.version += 1;
        Ok(row.clone())
    }

    async fn touch_all(&self, timestamp: i64) -> Result<usize, StoreError> {
        let mut rows = rw_write(&self.rows, SOURCE, "touch_all");
        for row in rows.values_mut() {
            row.timestamp = row.timestamp.max(timestamp);
            row.version += 1;
        }
        Ok(rows.len())
    }

    async fn all(&self) -> Result<Vec<PageTimestampRow>, StoreError> {
        Ok(rw_read(&self.rows, SOURCE, "all").values().cloned().collect())
    }
}
