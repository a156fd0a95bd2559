//! End-to-end invalidation tests for the page cache cleaner.
//!
//! These exercise the public surface only: a dispatcher wired to an engine,
//! backed by in-memory stores and a scripted change tracker.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;

use scirocco::cache::{
    CleanerConfig, InvalidationMode, NotificationDispatcher, PageInvalidationEngine, keys, row_id,
};
use scirocco::domain::entities::{ChangeBatch, EntityChange, EntityRef, EntityType};
use scirocco::domain::pages::{PageMetadataCatalog, PageType, QueryVariant, TravelPageCatalog};
use scirocco::domain::tracker::{ChangeDependencyTracker, TrackerError};
use scirocco::infra::store::{MemoryPageCacheStore, PageCacheStore};
use scirocco::infra::timestamp_store::{MemoryTimestampStore, PageTimestampStore};

/// Tracker returning pre-scripted change batches, with a pass-through
/// dependency chain.
struct ScriptedTracker {
    batches: Mutex<Vec<ChangeBatch>>,
    calls: AtomicUsize,
    delay: Option<Duration>,
}

impl ScriptedTracker {
    fn new(batches: Vec<ChangeBatch>) -> Self {
        Self {
            batches: Mutex::new(batches),
            calls: AtomicUsize::new(0),
            delay: None,
        }
    }

    fn slow(batches: Vec<ChangeBatch>, delay: Duration) -> Self {
        Self {
            batches: Mutex::new(batches),
            calls: AtomicUsize::new(0),
            delay: Some(delay),
        }
    }
}

#[async_trait]
impl ChangeDependencyTracker for ScriptedTracker {
    async fn changed_since(
        &self,
        _since: i64,
        _max_count: usize,
    ) -> Result<ChangeBatch, TrackerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let mut batches = self.batches.lock().unwrap();
        if batches.is_empty() {
            Ok(ChangeBatch::Changes(Vec::new()))
        } else {
            Ok(batches.remove(0))
        }
    }

    async fn dependency_chain(
        &self,
        roots: &[EntityRef],
    ) -> Result<Vec<EntityChange>, TrackerError> {
        Ok(roots
            .iter()
            .map(|root| EntityChange::new(root.entity_type, root.entity_id.clone(), 100))
            .collect())
    }

    async fn modified_utc(
        &self,
        _entity_type: EntityType,
        _entity_id: Option<&str>,
        _allow_cached: bool,
    ) -> Result<i64, TrackerError> {
        Ok(0)
    }
}

/// Cache store that counts removals and can be told to fail them.
#[derive(Default)]
struct CountingCacheStore {
    entries: DashMap<String, Bytes>,
    remove_calls: AtomicUsize,
    fail_removes: bool,
}

#[async_trait]
impl PageCacheStore for CountingCacheStore {
    async fn keys(&self, prefix: &str) -> Result<Vec<String>, scirocco::infra::error::StoreError> {
        Ok(self
            .entries
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|key| key.starts_with(prefix))
            .collect())
    }

    async fn remove(&self, key: &str) -> Result<(), scirocco::infra::error::StoreError> {
        self.remove_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_removes {
            return Err(scirocco::infra::error::StoreError::unavailable("remove refused"));
        }
        self.entries.remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<(), scirocco::infra::error::StoreError> {
        self.entries.clear();
        Ok(())
    }

    async fn put(&self, key: &str, value: Bytes) -> Result<(), scirocco::infra::error::StoreError> {
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, scirocco::infra::error::StoreError> {
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }
}

fn fast_config() -> CleanerConfig {
    CleanerConfig {
        retry_delay_ms: 0,
        ..Default::default()
    }
}

fn engine_with(
    config: CleanerConfig,
    tracker: Arc<dyn ChangeDependencyTracker>,
    cache_store: Arc<dyn PageCacheStore>,
) -> (Arc<PageInvalidationEngine>, Arc<MemoryTimestampStore>) {
    let timestamp_store = Arc::new(MemoryTimestampStore::new());
    let engine = Arc::new(
        PageInvalidationEngine::new(
            config,
            Arc::new(TravelPageCatalog::new()),
            tracker,
            cache_store,
            timestamp_store.clone(),
        )
        .expect("valid config"),
    );
    (engine, timestamp_store)
}

fn city_key(id: &str) -> String {
    let meta = TravelPageCatalog::new()
        .metadata(PageType::CityGuide)
        .unwrap();
    keys::page_key(&meta, Some(id), "en", &QueryVariant::default())
}

#[tokio::test]
async fn sweep_drives_engine_invalidation() {
    let changes = vec![
        EntityChange::new(EntityType::City, "rome", 100),
        EntityChange::new(EntityType::Stay, "abc", 100),
    ];
    let tracker = Arc::new(ScriptedTracker::new(vec![ChangeBatch::Changes(changes)]));
    let cache_store = Arc::new(MemoryPageCacheStore::new());
    let (engine, timestamps) = engine_with(fast_config(), tracker.clone(), cache_store.clone());

    let dispatcher = Arc::new(
        NotificationDispatcher::new(fast_config(), tracker).expect("valid config"),
    );
    engine.register(&dispatcher, 100).expect("unique order");

    cache_store
        .put(&city_key("rome"), Bytes::from("<html>"))
        .await
        .unwrap();
    cache_store
        .put(&city_key("paris"), Bytes::from("<html>"))
        .await
        .unwrap();

    assert!(dispatcher.sweep().await);

    // The changed city's page is gone, the untouched one stays
    assert!(cache_store.get(&city_key("rome")).await.unwrap().is_none());
    assert!(cache_store.get(&city_key("paris")).await.unwrap().is_some());

    // The stay's detail page was invalidated by timestamp, not deletion
    let row = timestamps
        .find(&row_id(PageType::StayDetails, Some("abc")))
        .await
        .unwrap()
        .expect("row created");
    assert_eq!(row.timestamp, 100);
}

#[tokio::test]
async fn too_much_sweep_purges_everything() {
    let tracker = Arc::new(ScriptedTracker::new(vec![ChangeBatch::TooMuch]));
    let cache_store = Arc::new(MemoryPageCacheStore::new());
    let (engine, timestamps) = engine_with(fast_config(), tracker.clone(), cache_store.clone());

    let dispatcher = Arc::new(
        NotificationDispatcher::new(fast_config(), tracker).expect("valid config"),
    );
    engine.register(&dispatcher, 100).expect("unique order");

    cache_store
        .put(&city_key("rome"), Bytes::new())
        .await
        .unwrap();
    timestamps
        .insert_many(vec![scirocco::infra::timestamp_store::PageTimestampRow {
            id: row_id(PageType::StayDetails, Some("abc")),
            timestamp: 10,
            version: 1,
        }])
        .await
        .unwrap();

    dispatcher.sweep().await;

    assert!(cache_store.is_empty());
    let row = timestamps
        .find(&row_id(PageType::StayDetails, Some("abc")))
        .await
        .unwrap()
        .unwrap();
    assert!(row.timestamp > 10, "purge advances every timestamp row");
}

#[tokio::test]
async fn immediate_invalidation_surfaces_retry_exhaustion() {
    let tracker = Arc::new(ScriptedTracker::new(Vec::new()));
    let cache_store = Arc::new(CountingCacheStore {
        fail_removes: true,
        ..Default::default()
    });
    let (engine, _) = engine_with(fast_config(), tracker, cache_store.clone());

    cache_store
        .put(&city_key("rome"), Bytes::new())
        .await
        .unwrap();

    let result = engine
        .invalidate_page(InvalidationMode::Immediate, PageType::CityGuide, Some("rome"))
        .await;

    assert!(result.is_err());
    // retry_attempts is 3 by default: exactly three attempts, no more
    assert_eq!(cache_store.remove_calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn scheduled_invalidation_swallows_removal_failures() {
    let tracker = Arc::new(ScriptedTracker::new(Vec::new()));
    let cache_store = Arc::new(CountingCacheStore {
        fail_removes: true,
        ..Default::default()
    });
    let (engine, _) = engine_with(fast_config(), tracker, cache_store.clone());

    cache_store
        .put(&city_key("rome"), Bytes::new())
        .await
        .unwrap();

    engine
        .invalidate_page(InvalidationMode::Scheduled, PageType::CityGuide, Some("rome"))
        .await
        .unwrap();
    // Background path: removal fails after retries but the pass succeeds
    assert!(engine.perform_cleanup().await.unwrap());
    assert_eq!(cache_store.remove_calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn duplicate_scheduled_items_are_applied_once() {
    let tracker = Arc::new(ScriptedTracker::new(Vec::new()));
    let cache_store = Arc::new(CountingCacheStore::default());
    let (engine, _) = engine_with(fast_config(), tracker, cache_store.clone());

    cache_store
        .put(&city_key("rome"), Bytes::new())
        .await
        .unwrap();

    for _ in 0..3 {
        engine
            .invalidate_page(InvalidationMode::Scheduled, PageType::CityGuide, Some("rome"))
            .await
            .unwrap();
    }
    assert_eq!(engine.scheduled_backlog(), 3);

    engine.perform_cleanup().await.unwrap();
    assert_eq!(engine.scheduled_backlog(), 0);
    assert_eq!(cache_store.remove_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn concurrent_cleanups_share_one_pass() {
    let tracker = Arc::new(ScriptedTracker::slow(
        vec![ChangeBatch::Changes(Vec::new())],
        Duration::from_millis(50),
    ));
    let cache_store = Arc::new(MemoryPageCacheStore::new());
    let (engine, _) = engine_with(fast_config(), tracker.clone(), cache_store);

    let (first, second) = tokio::join!(engine.perform_cleanup(), engine.perform_cleanup());

    // One caller ran the pass, the other joined it; the tracker was hit once
    let ran = [first.unwrap(), second.unwrap()];
    assert_eq!(ran.iter().filter(|ran| **ran).count(), 1);
    assert_eq!(tracker.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn cleanup_watermark_only_moves_forward() {
    let tracker = Arc::new(ScriptedTracker::new(vec![
        ChangeBatch::Changes(Vec::new()),
        ChangeBatch::Changes(Vec::new()),
    ]));
    let cache_store = Arc::new(MemoryPageCacheStore::new());
    let (engine, _) = engine_with(fast_config(), tracker, cache_store);

    engine.perform_cleanup().await.unwrap();
    let first = engine.last_changed_pages_revision();
    assert!(first > 0);

    engine.perform_cleanup().await.unwrap();
    assert!(engine.last_changed_pages_revision() >= first);
}
