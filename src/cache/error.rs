//! Cache layer error taxonomy.

use thiserror::Error;

use crate::domain::pages::PageType;
use crate::domain::tracker::TrackerError;
use crate::infra::error::StoreError;

#[derive(Debug, Error)]
pub enum CacheError {
    /// Registering a subscription whose order is already taken is a
    /// programming error and fails fast.
    #[error("subscription order {0} is already registered")]
    DuplicateSubscriptionOrder(i32),

    /// A cacheable page must always be assignable a baseline version.
    #[error("no baseline timestamp could be resolved for page `{page_type}` (id: {page_id:?})")]
    PageTimestampUnresolvable {
        page_type: PageType,
        page_id: Option<String>,
    },

    /// Removal retries exhausted. Surfaced only on immediate invalidation;
    /// scheduled/background paths log and continue.
    #[error("failed to remove cache key `{key}` after {attempts} attempts")]
    CacheKeyRemovalFailed { key: String, attempts: u32 },

    #[error("page type `{0}` has no metadata in the catalog")]
    UnknownPageType(PageType),

    #[error(transparent)]
    Tracker(#[from] TrackerError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
