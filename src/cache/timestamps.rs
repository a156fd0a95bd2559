//! Timestamp-versioned invalidation: row ids, single-row bumps, and the
//! batched update pass.

use std::collections::HashMap;

use tracing::warn;

use crate::domain::pages::PageType;
use crate::infra::error::StoreError;
use crate::infra::timestamp_store::{PageTimestampRow, PageTimestampStore};

use super::error::CacheError;

/// Sentinel for "no timestamp has ever been assigned".
pub const UNINITIALIZED_TIMESTAMP: i64 = 0;

/// Bounded retries for optimistic version conflicts.
const VERSION_RETRY_ATTEMPTS: u32 = 3;

/// Durable row id for a page instance, or for the whole page type when
/// `page_id` is absent.
pub fn row_id(page_type: PageType, page_id: Option<&str>) -> String {
    match page_id {
        Some(id) => format!("{page_type}_{id}"),
        None => page_type.to_string(),
    }
}

/// Counts from one batched timestamp pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchOutcome {
    pub inserted: usize,
    pub updated: usize,
    pub failed: usize,
}

/// Advance one row to at least `timestamp`, creating it when absent.
///
/// The stored timestamp never decreases; concurrent writers are resolved by
/// re-reading on version conflict.
pub(crate) async fn bump_row(
    store: &dyn PageTimestampStore,
    id: &str,
    timestamp: i64,
) -> Result<PageTimestampRow, StoreError> {
    for _ in 0..VERSION_RETRY_ATTEMPTS {
        match store.find(id).await? {
            None => {
                let row = PageTimestampRow {
                    id: id.to_string(),
                    timestamp,
                    version: 1,
                };
                match store.insert_many(vec![row.clone()]).await {
                    Ok(()) => return Ok(row),
                    // Raced with another creator; re-read and update instead.
                    Err(StoreError::VersionConflict { .. }) => continue,
                    Err(err) => return Err(err),
                }
            }
            Some(existing) => {
                let next = existing.timestamp.max(timestamp);
                match store.update(id, next, existing.version).await {
                    Ok(row) => return Ok(row),
                    Err(StoreError::VersionConflict { .. }) => continue,
                    Err(err) => return Err(err),
                }
            }
        }
    }
    Err(StoreError::version_conflict(id))
}

/// Apply `(row_id, timestamp)` updates in fixed-size chunks.
///
/// Per chunk: query which rows exist, bulk-insert the missing ones, update
/// existing ones individually. A failing chunk is logged and skipped unless
/// `throw_on_error`.
pub(crate) async fn write_batched(
    store: &dyn PageTimestampStore,
    updates: Vec<(String, i64)>,
    batch_size: usize,
    throw_on_error: bool,
) -> Result<BatchOutcome, CacheError> {
    let mut outcome = BatchOutcome::default();
    let size = batch_size.max(1);

    for chunk in updates.chunks(size) {
        match write_chunk(store, chunk, throw_on_error, &mut outcome).await {
            Ok(()) => {}
            Err(err) if throw_on_error => return Err(err),
            Err(err) => {
                outcome.failed += chunk.len();
                warn!(
                    chunk_size = chunk.len(),
                    error = %err,
                    "timestamp batch chunk failed; continuing with remaining chunks"
                );
            }
        }
    }
    Ok(outcome)
}

async fn write_chunk(
    store: &dyn PageTimestampStore,
    chunk: &[(String, i64)],
    throw_on_error: bool,
    outcome: &mut BatchOutcome,
) -> Result<(), CacheError> {
    let ids: Vec<String> = chunk.iter().map(|(id, _)| id.clone()).collect();
    let existing: HashMap<String, PageTimestampRow> = store
        .find_many(&ids)
        .await?
        .into_iter()
        .map(|row| (row.id.clone(), row))
        .collect();

    let missing: Vec<PageTimestampRow> = chunk
        .iter()
        .filter(|(id, _)| !existing.contains_key(id))
        .map(|(id, timestamp)| PageTimestampRow {
            id: id.clone(),
            timestamp: *timestamp,
            version: 1,
        })
        .collect();
    if !missing.is_empty() {
        let count = missing.len();
        store.insert_many(missing).await?;
        outcome.inserted += count;
    }

    for (id, timestamp) in chunk {
        let Some(row) = existing.get(id) else {
            continue;
        };
        let next = row.timestamp.max(*timestamp);
        match store.update(id, next, row.version).await {
            Ok(_) => outcome.updated += 1,
            Err(err) if throw_on_error => return Err(err.into()),
            Err(err) => {
                outcome.failed += 1;
                warn!(row_id = %id, error = %err, "timestamp row update failed");
            }
        }
    }
    Ok(())
}
