//! Page invalidation engine.
//!
//! Maps entity changes to affected cached pages and invalidates them, either
//! by deleting stored keys or by advancing a page's stored timestamp. Falls
//! back to a full purge whenever precise invalidation would be more
//! expensive than re-rendering everything.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use metrics::{counter, histogram};
use tokio::time::sleep;
use tracing::{debug, info, instrument, warn};

use crate::domain::entities::{ChangeBatch, EntityChange, EntityRef, group_by_entity_type};
use crate::domain::pages::{PageMetadata, PageMetadataCatalog, PageType, VaryMode};
use crate::domain::tracker::ChangeDependencyTracker;
use crate::infra::store::PageCacheStore;
use crate::infra::timestamp_store::PageTimestampStore;
use crate::util::clock::now_millis;

use super::config::{CleanerConfig, CleanerConfigError};
use super::dispatcher::NotificationDispatcher;
use super::error::CacheError;
use super::items::{ScheduledInvalidationItem, ScheduledQueue, dedupe_items};
use super::keys::{all_page_keys, instance_prefix, type_prefix};
use super::status::SweepGate;
use super::subscription::{
    ChangeSubscriber, Notification, SubscribeOptions, SubscriberId, SubscriptionTarget,
};
use super::timestamps::{UNINITIALIZED_TIMESTAMP, bump_row, row_id, write_batched};

const METRIC_CLEANUP_MS: &str = "scirocco_cleanup_ms";
const METRIC_PURGE_TOTAL: &str = "scirocco_purge_total";
const METRIC_KEYS_REMOVED: &str = "scirocco_keys_removed_total";

/// How urgently an invalidation must take effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidationMode {
    /// Queue the page for the next cleanup pass.
    Scheduled,
    /// Invalidate before returning; failures surface to the caller.
    Immediate,
}

/// What the renderer embeds in a page's cache key or generated links.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageVersion {
    /// The page is keyed by its vary mode; no stored timestamp exists.
    Vary(VaryMode),
    /// Current stored timestamp for a timestamp-varied page, unix millis.
    /// `0` when the row has never been initialized.
    Timestamp(i64),
}

/// Entity-change driven invalidation of the rendered-page cache.
///
/// One cleanup pass runs at a time; concurrent callers join the in-flight
/// pass instead of stacking behind it. The change-revision watermark
/// advances only after a pass completes, so failures are retried on the
/// next pass.
pub struct PageInvalidationEngine {
    config: CleanerConfig,
    catalog: Arc<dyn PageMetadataCatalog>,
    tracker: Arc<dyn ChangeDependencyTracker>,
    cache_store: Arc<dyn PageCacheStore>,
    timestamp_store: Arc<dyn PageTimestampStore>,
    queue: ScheduledQueue,
    gate: SweepGate,
    last_changed_pages_revision: AtomicI64,
}

impl PageInvalidationEngine {
    pub fn new(
        config: CleanerConfig,
        catalog: Arc<dyn PageMetadataCatalog>,
        tracker: Arc<dyn ChangeDependencyTracker>,
        cache_store: Arc<dyn PageCacheStore>,
        timestamp_store: Arc<dyn PageTimestampStore>,
    ) -> Result<Self, CleanerConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            catalog,
            tracker,
            cache_store,
            timestamp_store,
            queue: ScheduledQueue::new(),
            gate: SweepGate::new(),
            last_changed_pages_revision: AtomicI64::new(0),
        })
    }

    /// Subscribe this engine to a dispatcher's change notifications.
    pub fn register(
        self: &Arc<Self>,
        dispatcher: &NotificationDispatcher,
        order: i32,
    ) -> Result<SubscriberId, CacheError> {
        dispatcher.subscribe(
            SubscribeOptions {
                target: SubscriptionTarget::All,
                order,
            },
            Arc::clone(self) as Arc<dyn ChangeSubscriber>,
        )
    }

    pub fn scheduled_backlog(&self) -> usize {
        self.queue.len()
    }

    /// Watermark of the last completed cleanup pass, unix millis.
    pub fn last_changed_pages_revision(&self) -> i64 {
        self.last_changed_pages_revision.load(Ordering::Acquire)
    }

    /// Invalidate one page instance, or every instance of the page type when
    /// `page_id` is absent. A no-op while page caching is disabled.
    #[instrument(skip(self), fields(page_type = %page_type))]
    pub async fn invalidate_page(
        &self,
        mode: InvalidationMode,
        page_type: PageType,
        page_id: Option<&str>,
    ) -> Result<(), CacheError> {
        if !self.config.is_enabled() {
            return Ok(());
        }
        let meta = self.metadata(page_type)?;
        let timestamp = now_millis();

        match mode {
            InvalidationMode::Scheduled => {
                self.queue.push(ScheduledInvalidationItem {
                    page_type,
                    page_id: page_id.map(str::to_string),
                    timestamp,
                });
                debug!(page_id, "page invalidation scheduled");
                Ok(())
            }
            InvalidationMode::Immediate => {
                if meta.vary == VaryMode::EntityChangeTimestamp {
                    bump_row(
                        self.timestamp_store.as_ref(),
                        &row_id(page_type, page_id),
                        timestamp,
                    )
                    .await?;
                }
                let listing = self.cache_store.keys(&type_prefix(page_type)).await?;
                self.remove_matching(&listing, &meta, page_id, true).await
            }
        }
    }

    /// Run one cleanup pass now, or join the in-flight one.
    ///
    /// Returns `true` when this call performed the pass. When another pass
    /// is already running, waits for it to finish (bounded by the configured
    /// join timeout) and returns `false` without running another.
    pub async fn perform_cleanup(&self) -> Result<bool, CacheError> {
        if !self.config.is_enabled() {
            return Ok(false);
        }
        let Some(_permit) = self.gate.try_begin() else {
            if !self.gate.join(self.config.cleanup_join_timeout()).await {
                warn!(
                    timeout_ms = self.config.cleanup_join_timeout_ms,
                    "gave up waiting for in-flight cleanup pass"
                );
            }
            return Ok(false);
        };
        self.cleanup_pass().await?;
        Ok(true)
    }

    /// Core of one cleanup pass; caller holds the gate permit.
    async fn cleanup_pass(&self) -> Result<(), CacheError> {
        let started_at = Instant::now();
        let cleanup_started = now_millis();
        let since = self.last_changed_pages_revision();

        let batch = self
            .tracker
            .changed_since(since, self.config.purge_change_cap())
            .await?;

        match batch {
            ChangeBatch::TooMuch => self.purge().await?,
            ChangeBatch::Changes(changes) => {
                self.invalidate_changed(&changes, false).await?;
            }
        }

        self.last_changed_pages_revision
            .fetch_max(cleanup_started, Ordering::AcqRel);
        histogram!(METRIC_CLEANUP_MS).record(started_at.elapsed().as_secs_f64() * 1000.0);
        Ok(())
    }

    /// Invalidate every page affected by `changed`, plus the scheduled
    /// backlog. Falls back to a purge when the combined set is too large to
    /// invalidate precisely.
    async fn invalidate_changed(
        &self,
        changed: &[EntityChange],
        throw_on_error: bool,
    ) -> Result<(), CacheError> {
        let roots: Vec<EntityRef> = changed.iter().map(EntityChange::entity_ref).collect();
        let chain = if roots.is_empty() {
            Vec::new()
        } else {
            self.tracker.dependency_chain(&roots).await?
        };

        let affected = self.affected_pages(&chain);
        let scheduled = self.queue.drain();

        match self
            .apply_affected(affected, scheduled.clone(), changed.len(), throw_on_error)
            .await
        {
            Ok(()) => Ok(()),
            Err(err) => {
                // The watermark retry only re-covers tracker-recorded
                // changes; drained requests must go back on the queue.
                for item in scheduled {
                    self.queue.push(item);
                }
                Err(err)
            }
        }
    }

    async fn apply_affected(
        &self,
        affected: Option<Vec<ScheduledInvalidationItem>>,
        scheduled: Vec<ScheduledInvalidationItem>,
        changes: usize,
        throw_on_error: bool,
    ) -> Result<(), CacheError> {
        let Some(mut items) = affected else {
            // Too many affected pages to enumerate.
            return self.purge().await;
        };
        items.extend(scheduled);
        let items = dedupe_items(items);
        if items.len() > self.config.max_changed_pages_for_purge {
            return self.purge().await;
        }
        if items.is_empty() {
            return Ok(());
        }

        debug!(pages = items.len(), changes, "invalidating affected pages");
        self.apply_items(items, throw_on_error).await
    }

    /// Compute the pages affected by an expanded dependency chain.
    ///
    /// A change to a page's identity entity invalidates only that instance;
    /// a change to an associated entity invalidates the whole page type.
    /// `None` when the distinct page count exceeds the purge threshold.
    fn affected_pages(&self, chain: &[EntityChange]) -> Option<Vec<ScheduledInvalidationItem>> {
        let grouped = group_by_entity_type(chain);
        let mut latest: HashMap<(PageType, Option<String>), i64> = HashMap::new();

        for page_type in self.catalog.page_types() {
            let Some(meta) = self.catalog.metadata(page_type) else {
                continue;
            };
            if let Some(identity) = meta.identity {
                for change in grouped.get(&identity).map(Vec::as_slice).unwrap_or(&[]) {
                    let slot = latest
                        .entry((page_type, Some(change.entity_id.clone())))
                        .or_insert(change.modified_utc);
                    *slot = (*slot).max(change.modified_utc);
                }
            }
            for associated in &meta.associated_with {
                for change in grouped.get(associated).map(Vec::as_slice).unwrap_or(&[]) {
                    let slot = latest
                        .entry((page_type, None))
                        .or_insert(change.modified_utc);
                    *slot = (*slot).max(change.modified_utc);
                }
            }
            if latest.len() > self.config.max_changed_pages_for_purge {
                return None;
            }
        }

        Some(
            latest
                .into_iter()
                .map(|((page_type, page_id), timestamp)| ScheduledInvalidationItem {
                    page_type,
                    page_id,
                    timestamp,
                })
                .collect(),
        )
    }

    /// Apply a deduplicated invalidation set: timestamp-varied pages go
    /// through the batched row update, everything else by key removal
    /// against a single store listing.
    async fn apply_items(
        &self,
        items: Vec<ScheduledInvalidationItem>,
        throw_on_error: bool,
    ) -> Result<(), CacheError> {
        let mut timestamp_updates: Vec<(String, i64)> = Vec::new();
        let mut keyed: Vec<(ScheduledInvalidationItem, PageMetadata)> = Vec::new();

        for item in items {
            let meta = self.metadata(item.page_type)?;
            if meta.vary == VaryMode::EntityChangeTimestamp {
                timestamp_updates.push((
                    row_id(item.page_type, item.page_id.as_deref()),
                    item.timestamp,
                ));
            } else {
                keyed.push((item, meta));
            }
        }

        if !timestamp_updates.is_empty() {
            let outcome = write_batched(
                self.timestamp_store.as_ref(),
                timestamp_updates,
                self.config.timestamp_batch_size,
                throw_on_error,
            )
            .await?;
            debug!(
                inserted = outcome.inserted,
                updated = outcome.updated,
                failed = outcome.failed,
                "timestamp rows advanced"
            );
        }

        if !keyed.is_empty() {
            // One listing serves every keyed item in this pass.
            let listing = self.cache_store.keys("page:").await?;
            for (item, meta) in &keyed {
                self.remove_matching(&listing, meta, item.page_id.as_deref(), throw_on_error)
                    .await?;
            }
        }
        Ok(())
    }

    /// Remove every listed key belonging to the page (or whole page type
    /// when a per-instance page is invalidated without an id).
    async fn remove_matching(
        &self,
        listing: &[String],
        meta: &PageMetadata,
        page_id: Option<&str>,
        throw_on_error: bool,
    ) -> Result<(), CacheError> {
        let matchers: Vec<String> = if meta.identity.is_some() && page_id.is_none() {
            vec![type_prefix(meta.page_type)]
        } else if meta.vary == VaryMode::EntityChangeTimestamp {
            vec![instance_prefix(meta.page_type, page_id)]
        } else {
            all_page_keys(meta, page_id, &self.config.supported_locales)
        };

        for key in listing {
            if matchers.iter().any(|matcher| key.contains(matcher)) {
                self.remove_with_retry(key, throw_on_error).await?;
            }
        }
        Ok(())
    }

    /// Remove one key with bounded retries and a fixed delay between
    /// attempts. On exhaustion, errors when `throw_on_error`, otherwise
    /// logs and moves on.
    async fn remove_with_retry(&self, key: &str, throw_on_error: bool) -> Result<(), CacheError> {
        let attempts = self.config.retry_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self.cache_store.remove(key).await {
                Ok(()) => {
                    counter!(METRIC_KEYS_REMOVED).increment(1);
                    return Ok(());
                }
                Err(err) => {
                    debug!(key, attempt, error = %err, "cache key removal attempt failed");
                    last_error = Some(err);
                    if attempt < attempts {
                        sleep(self.config.retry_delay()).await;
                    }
                }
            }
        }

        if throw_on_error {
            Err(CacheError::CacheKeyRemovalFailed {
                key: key.to_string(),
                attempts,
            })
        } else {
            warn!(
                key,
                attempts,
                error = ?last_error,
                "cache key removal failed; key left for the next pass"
            );
            Ok(())
        }
    }

    /// Drop every cached page and advance every timestamp row.
    ///
    /// Per-key failures are logged, never fatal; a purge must make as much
    /// progress as it can.
    pub async fn purge(&self) -> Result<(), CacheError> {
        let purge_started = now_millis();
        warn!("purging the entire page cache");
        counter!(METRIC_PURGE_TOTAL).increment(1);

        let listing = self.cache_store.keys("").await?;
        for key in &listing {
            self.remove_with_retry(key, false).await?;
        }
        let touched = self.timestamp_store.touch_all(purge_started).await?;
        info!(
            keys = listing.len(),
            timestamp_rows = touched,
            "page cache purge completed"
        );
        Ok(())
    }

    /// Current version for a page, as embedded by the renderer.
    ///
    /// For timestamp-varied pages with no stored row: returns the
    /// uninitialized sentinel unless `initialize`, in which case a baseline
    /// is derived from the page's entity dependencies and persisted.
    pub async fn page_timestamp(
        &self,
        page_type: PageType,
        page_id: Option<&str>,
        initialize: bool,
    ) -> Result<PageVersion, CacheError> {
        let meta = self.metadata(page_type)?;
        if meta.vary != VaryMode::EntityChangeTimestamp {
            return Ok(PageVersion::Vary(meta.vary));
        }

        let id = row_id(page_type, page_id);
        if let Some(row) = self.timestamp_store.find(&id).await? {
            return Ok(PageVersion::Timestamp(row.timestamp));
        }
        if !initialize {
            return Ok(PageVersion::Timestamp(UNINITIALIZED_TIMESTAMP));
        }

        let baseline = self.baseline_timestamp(&meta, page_id).await?;
        if baseline == UNINITIALIZED_TIMESTAMP {
            return Err(CacheError::PageTimestampUnresolvable {
                page_type,
                page_id: page_id.map(str::to_string),
            });
        }
        let row = bump_row(self.timestamp_store.as_ref(), &id, baseline).await?;
        Ok(PageVersion::Timestamp(row.timestamp))
    }

    /// Most recent modification across the page's entity dependencies.
    async fn baseline_timestamp(
        &self,
        meta: &PageMetadata,
        page_id: Option<&str>,
    ) -> Result<i64, CacheError> {
        let mut baseline = UNINITIALIZED_TIMESTAMP;
        if let (Some(identity), Some(id)) = (meta.identity, page_id) {
            baseline = baseline.max(self.tracker.modified_utc(identity, Some(id), true).await?);
        }
        for associated in &meta.associated_with {
            baseline = baseline.max(self.tracker.modified_utc(*associated, None, true).await?);
        }
        Ok(baseline)
    }

    fn metadata(&self, page_type: PageType) -> Result<PageMetadata, CacheError> {
        self.catalog
            .metadata(page_type)
            .ok_or(CacheError::UnknownPageType(page_type))
    }
}

/// Change notifications drive the same invalidation path as a direct
/// cleanup call, behind the same gate.
#[async_trait]
impl ChangeSubscriber for PageInvalidationEngine {
    async fn on_entity_changes(
        &self,
        _subscriber_id: SubscriberId,
        notification: Notification,
    ) -> Result<(), CacheError> {
        if !self.config.is_enabled() {
            return Ok(());
        }
        match notification {
            Notification::TooMuch => {
                // Purging is idempotent; no need to serialize behind the gate.
                self.purge().await
            }
            Notification::Changes(grouped) => {
                let changes: Vec<EntityChange> = grouped.into_values().flatten().collect();
                loop {
                    if let Some(_permit) = self.gate.try_begin() {
                        return self.invalidate_changed(&changes, false).await;
                    }
                    if !self.gate.join(self.config.cleanup_join_timeout()).await {
                        warn!("change notification dropped: cleanup gate stayed busy");
                        return Ok(());
                    }
                }
            }
        }
    }
}
