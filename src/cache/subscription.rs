//! Change subscriptions: targets, notification payloads, and the
//! subscriber seam.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::entities::{EntityChange, EntityType};

use super::error::CacheError;

/// Opaque handle for a live subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(Uuid);

impl SubscriberId {
    pub(crate) fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Which ids of one entity type a subscription listens to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdSelector {
    All,
    Ids(HashSet<String>),
}

#[derive(Debug, Clone)]
pub struct EntityTarget {
    pub entity_type: EntityType,
    pub ids: IdSelector,
}

impl EntityTarget {
    pub fn all_of(entity_type: EntityType) -> Self {
        Self {
            entity_type,
            ids: IdSelector::All,
        }
    }

    pub fn ids<I, S>(entity_type: EntityType, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            entity_type,
            ids: IdSelector::Ids(ids.into_iter().map(Into::into).collect()),
        }
    }
}

#[derive(Debug, Clone)]
pub enum SubscriptionTarget {
    /// Receive every change batch.
    All,
    /// Receive only changes matching the listed entity targets.
    Entities(Vec<EntityTarget>),
}

/// Options for registering a subscription.
#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    pub target: SubscriptionTarget,
    /// Total priority order. Must be unique across live subscriptions;
    /// subscribers are notified in ascending order.
    pub order: i32,
}

/// Payload delivered to a subscriber on each sweep.
#[derive(Debug, Clone)]
pub enum Notification {
    /// The change volume exceeded the purge cap. The subscriber must assume
    /// everything changed.
    TooMuch,
    /// Changed entities grouped by type, filtered to the subscription target.
    Changes(HashMap<EntityType, Vec<EntityChange>>),
}

/// Consumer of change notifications.
#[async_trait]
pub trait ChangeSubscriber: Send + Sync {
    async fn on_entity_changes(
        &self,
        subscriber_id: SubscriberId,
        notification: Notification,
    ) -> Result<(), CacheError>;
}

#[derive(Clone)]
pub(crate) struct Subscription {
    pub id: SubscriberId,
    pub target: SubscriptionTarget,
    pub order: i32,
    pub subscriber: Arc<dyn ChangeSubscriber>,
}

impl SubscriptionTarget {
    /// Intersect grouped changes with this target. `None` when nothing
    /// matches (the subscriber is not called).
    pub(crate) fn select(
        &self,
        grouped: &HashMap<EntityType, Vec<EntityChange>>,
    ) -> Option<HashMap<EntityType, Vec<EntityChange>>> {
        match self {
            SubscriptionTarget::All => {
                if grouped.is_empty() {
                    None
                } else {
                    Some(grouped.clone())
                }
            }
            SubscriptionTarget::Entities(targets) => {
                let mut selected: HashMap<EntityType, Vec<EntityChange>> = HashMap::new();
                for target in targets {
                    let Some(changes) = grouped.get(&target.entity_type) else {
                        continue;
                    };
                    let matched: Vec<EntityChange> = match &target.ids {
                        IdSelector::All => changes.clone(),
                        IdSelector::Ids(ids) => changes
                            .iter()
                            .filter(|change| ids.contains(&change.entity_id))
                            .cloned()
                            .collect(),
                    };
                    if !matched.is_empty() {
                        selected
                            .entry(target.entity_type)
                            .or_default()
                            .extend(matched);
                    }
                }
                if selected.is_empty() { None } else { Some(selected) }
            }
        }
    }
}
