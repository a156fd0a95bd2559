//! Change dependency tracker seam.
//!
//! The tracker owns the relational change log and the entity dependency
//! graph. Its recursive chain expansion is deliberately behind this trait;
//! the cache layer never reimplements that traversal.

use async_trait::async_trait;
use thiserror::Error;

use super::entities::{ChangeBatch, EntityChange, EntityRef, EntityType};

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("change tracker unavailable: {0}")]
    Unavailable(String),
}

impl TrackerError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable(message.into())
    }
}

/// Answers "what changed since T" and "what else does a change affect".
#[async_trait]
pub trait ChangeDependencyTracker: Send + Sync {
    /// Changes recorded after `since` (unix millis). Returns
    /// [`ChangeBatch::TooMuch`] instead of a list when the true count
    /// exceeds `max_count`.
    async fn changed_since(&self, since: i64, max_count: usize)
    -> Result<ChangeBatch, TrackerError>;

    /// Expand the given entities into every entity whose displayed data
    /// transitively derives from them, each with its own modification time.
    async fn dependency_chain(
        &self,
        roots: &[EntityRef],
    ) -> Result<Vec<EntityChange>, TrackerError>;

    /// Modification time of one entity, or of the most recently modified
    /// entity of the type when `entity_id` is `None`. Returns `0` when
    /// nothing is known.
    async fn modified_utc(
        &self,
        entity_type: EntityType,
        entity_id: Option<&str>,
        allow_cached: bool,
    ) -> Result<i64, TrackerError>;
}
