//! Scheduled invalidation items and the in-memory queue feeding cleanup
//! passes.

use std::collections::HashMap;
use std::sync::Mutex;

use metrics::gauge;

use crate::domain::pages::PageType;

use super::lock::mutex_lock;

const SOURCE: &str = "cache::items";
const METRIC_QUEUE_LEN: &str = "scirocco_scheduled_queue_len";

/// "This page instance (or every instance of this page type, when `page_id`
/// is absent) is stale as of `timestamp`."
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledInvalidationItem {
    pub page_type: PageType,
    pub page_id: Option<String>,
    pub timestamp: i64,
}

/// Queue of scheduled invalidations, drained by the next cleanup pass.
///
/// Appends interleave freely with a running cleanup; draining splices the
/// whole backlog out atomically with respect to appenders.
pub(crate) struct ScheduledQueue {
    items: Mutex<Vec<ScheduledInvalidationItem>>,
}

impl ScheduledQueue {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, item: ScheduledInvalidationItem) {
        let mut items = mutex_lock(&self.items, SOURCE, "push");
        items.push(item);
        gauge!(METRIC_QUEUE_LEN).set(items.len() as f64);
    }

    pub fn drain(&self) -> Vec<ScheduledInvalidationItem> {
        let drained = std::mem::take(&mut *mutex_lock(&self.items, SOURCE, "drain"));
        gauge!(METRIC_QUEUE_LEN).set(0.0);
        drained
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.items, SOURCE, "len").len()
    }
}

/// Deduplicate by `(page_type, page_id)`, keeping the maximum timestamp.
pub(crate) fn dedupe_items(
    items: Vec<ScheduledInvalidationItem>,
) -> Vec<ScheduledInvalidationItem> {
    let mut latest: HashMap<(PageType, Option<String>), i64> = HashMap::new();
    for item in items {
        let slot = latest
            .entry((item.page_type, item.page_id))
            .or_insert(item.timestamp);
        *slot = (*slot).max(item.timestamp);
    }
    latest
        .into_iter()
        .map(|((page_type, page_id), timestamp)| ScheduledInvalidationItem {
            page_type,
            page_id,
            timestamp,
        })
        .collect()
}
