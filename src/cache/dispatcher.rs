//! Entity-change notification dispatcher.
//!
//! Discovers which domain entities changed since the last sweep and fans
//! the batch out to subscribers in priority order, isolating per-subscriber
//! failures.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use metrics::histogram;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

use crate::domain::entities::{ChangeBatch, EntityChange, EntityType, group_by_entity_type};
use crate::domain::tracker::ChangeDependencyTracker;
use crate::util::clock::now_millis;

use super::config::{CleanerConfig, CleanerConfigError};
use super::error::CacheError;
use super::lock::{rw_read, rw_write};
use super::status::SweepGate;
use super::subscription::{
    ChangeSubscriber, Notification, SubscribeOptions, SubscriberId, Subscription,
};

const SOURCE: &str = "cache::dispatcher";
const METRIC_SWEEP_MS: &str = "scirocco_sweep_ms";

/// Periodic publish/subscribe dispatcher for entity changes.
///
/// One sweep may be in flight at a time; overlapping timer ticks are
/// skipped, never queued. The change-revision watermark advances only after
/// a sweep completes, so a failed pass re-examines the same window
/// (at-least-once delivery).
pub struct NotificationDispatcher {
    config: CleanerConfig,
    tracker: Arc<dyn ChangeDependencyTracker>,
    subscriptions: RwLock<HashMap<SubscriberId, Subscription>>,
    gate: SweepGate,
    last_changed_revision: AtomicI64,
}

impl NotificationDispatcher {
    /// Fails fast when the configured sweep interval exceeds the timer
    /// delay bound.
    pub fn new(
        config: CleanerConfig,
        tracker: Arc<dyn ChangeDependencyTracker>,
    ) -> Result<Self, CleanerConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            tracker,
            subscriptions: RwLock::new(HashMap::new()),
            gate: SweepGate::new(),
            last_changed_revision: AtomicI64::new(0),
        })
    }

    /// Register a subscription. The order key must be unique across live
    /// subscriptions.
    pub fn subscribe(
        &self,
        options: SubscribeOptions,
        subscriber: Arc<dyn ChangeSubscriber>,
    ) -> Result<SubscriberId, CacheError> {
        let mut subscriptions = rw_write(&self.subscriptions, SOURCE, "subscribe");
        if subscriptions
            .values()
            .any(|subscription| subscription.order == options.order)
        {
            return Err(CacheError::DuplicateSubscriptionOrder(options.order));
        }
        let id = SubscriberId::generate();
        info!(subscriber_id = %id, order = options.order, "change subscription registered");
        subscriptions.insert(
            id,
            Subscription {
                id,
                target: options.target,
                order: options.order,
                subscriber,
            },
        );
        Ok(id)
    }

    /// Remove a subscription. Unsubscribing twice is tolerated with a
    /// warning.
    pub fn unsubscribe(&self, subscriber_id: SubscriberId) {
        let removed =
            rw_write(&self.subscriptions, SOURCE, "unsubscribe").remove(&subscriber_id);
        match removed {
            Some(subscription) => {
                info!(subscriber_id = %subscriber_id, order = subscription.order, "change subscription removed");
            }
            None => {
                warn!(subscriber_id = %subscriber_id, "unsubscribe for unknown subscriber id");
            }
        }
    }

    pub fn subscription_count(&self) -> usize {
        rw_read(&self.subscriptions, SOURCE, "subscription_count").len()
    }

    /// Watermark of the last completed sweep, unix millis.
    pub fn last_changed_revision(&self) -> i64 {
        self.last_changed_revision.load(Ordering::Acquire)
    }

    /// Run one sweep. Returns `false` when a sweep was already in flight
    /// and this tick was skipped.
    #[instrument(skip(self))]
    pub async fn sweep(&self) -> bool {
        let Some(_permit) = self.gate.try_begin() else {
            debug!("sweep tick skipped: previous pass still in progress");
            return false;
        };

        let started_at = Instant::now();
        let sweep_started = now_millis();
        let since = self.last_changed_revision();

        let batch = match self
            .tracker
            .changed_since(since, self.config.purge_change_cap())
            .await
        {
            Ok(batch) => batch,
            Err(err) => {
                warn!(
                    since,
                    error = %err,
                    "change tracker unavailable; sweep aborted and revision kept"
                );
                // Aborted sweeps must show up in the latency metric too.
                histogram!(METRIC_SWEEP_MS).record(started_at.elapsed().as_secs_f64() * 1000.0);
                return true;
            }
        };

        let ordered = self.ordered_subscriptions();
        match batch {
            ChangeBatch::TooMuch => {
                warn!(
                    cap = self.config.purge_change_cap(),
                    subscribers = ordered.len(),
                    "change volume exceeded cap; delivering TooMuch to every subscriber"
                );
                for subscription in &ordered {
                    self.notify_one(subscription, Notification::TooMuch).await;
                }
            }
            ChangeBatch::Changes(changes) => {
                if !changes.is_empty() {
                    let grouped = group_by_entity_type(&changes);
                    debug!(
                        changes = changes.len(),
                        entity_types = grouped.len(),
                        subscribers = ordered.len(),
                        "delivering change batch"
                    );
                    self.deliver(&ordered, &grouped).await;
                }
            }
        }

        self.advance_revision(sweep_started);

        let elapsed = started_at.elapsed();
        histogram!(METRIC_SWEEP_MS).record(elapsed.as_secs_f64() * 1000.0);
        if elapsed > self.config.slow_sweep_threshold() {
            warn!(
                elapsed_ms = elapsed.as_millis() as u64,
                threshold_ms = self.config.slow_sweep_warn_ms,
                "change sweep exceeded slow threshold"
            );
        }
        true
    }

    /// Spawn the periodic sweep loop. Returns `None` when caching is
    /// disabled (interval 0).
    pub fn spawn(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if !self.config.is_enabled() {
            info!("page caching disabled; periodic sweep not started");
            return None;
        }
        let dispatcher = Arc::clone(self);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(dispatcher.config.sweep_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                dispatcher.sweep().await;
            }
        }))
    }

    async fn deliver(
        &self,
        ordered: &[Subscription],
        grouped: &HashMap<EntityType, Vec<EntityChange>>,
    ) {
        for subscription in ordered {
            if let Some(selected) = subscription.target.select(grouped) {
                self.notify_one(subscription, Notification::Changes(selected))
                    .await;
            }
        }
    }

    /// A failing subscriber never prevents the remaining ones from being
    /// called, and never fails the sweep.
    async fn notify_one(&self, subscription: &Subscription, notification: Notification) {
        if let Err(err) = subscription
            .subscriber
            .on_entity_changes(subscription.id, notification)
            .await
        {
            warn!(
                subscriber_id = %subscription.id,
                order = subscription.order,
                error = %err,
                "subscriber callback failed; continuing with remaining subscribers"
            );
        }
    }

    fn ordered_subscriptions(&self) -> Vec<Subscription> {
        let mut ordered: Vec<Subscription> =
            rw_read(&self.subscriptions, SOURCE, "ordered_subscriptions")
                .values()
                .cloned()
                .collect();
        ordered.sort_by_key(|subscription| subscription.order);
        ordered
    }

    fn advance_revision(&self, revision: i64) {
        self.last_changed_revision
            .fetch_max(revision, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::cache::subscription::{EntityTarget, SubscriptionTarget};
    use crate::domain::entities::EntityRef;
    use crate::domain::tracker::TrackerError;

    use super::*;

    struct ScriptedTracker {
        batches: Mutex<Vec<Result<ChangeBatch, TrackerError>>>,
        calls: Mutex<Vec<(i64, usize)>>,
    }

    impl ScriptedTracker {
        fn new(batches: Vec<Result<ChangeBatch, TrackerError>>) -> Self {
            Self {
                batches: Mutex::new(batches),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ChangeDependencyTracker for ScriptedTracker {
        async fn changed_since(
            &self,
            since: i64,
            max_count: usize,
        ) -> Result<ChangeBatch, TrackerError> {
            self.calls.lock().unwrap().push((since, max_count));
            let mut batches = self.batches.lock().unwrap();
            if batches.is_empty() {
                Ok(ChangeBatch::Changes(Vec::new()))
            } else {
                batches.remove(0)
            }
        }

        async fn dependency_chain(
            &self,
            _roots: &[EntityRef],
        ) -> Result<Vec<EntityChange>, TrackerError> {
            Ok(Vec::new())
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

    struct RecordingSubscriber {
        label: &'static str,
        log: Arc<Mutex<Vec<(&'static str, Notification)>>>,
    }

    #[async_trait]
    impl ChangeSubscriber for RecordingSubscriber {
        async fn on_entity_changes(
            &self,
            _subscriber_id: SubscriberId,
            notification: Notification,
        ) -> Result<(), CacheError> {
            self.log.lock().unwrap().push((self.label, notification));
            Ok(())
        }
    }

    struct FailingSubscriber;

    #[async_trait]
    impl ChangeSubscriber for FailingSubscriber {
        async fn on_entity_changes(
            &self,
            _subscriber_id: SubscriberId,
            _notification: Notification,
        ) -> Result<(), CacheError> {
            Err(CacheError::UnknownPageType(
                crate::domain::pages::PageType::Home,
            ))
        }
    }

    fn dispatcher(
        batches: Vec<Result<ChangeBatch, TrackerError>>,
    ) -> (Arc<NotificationDispatcher>, Arc<ScriptedTracker>) {
        let tracker = Arc::new(ScriptedTracker::new(batches));
        let dispatcher = Arc::new(
            NotificationDispatcher::new(CleanerConfig::default(), tracker.clone()).unwrap(),
        );
        (dispatcher, tracker)
    }

    fn recorder(
        label: &'static str,
        log: &Arc<Mutex<Vec<(&'static str, Notification)>>>,
    ) -> Arc<dyn ChangeSubscriber> {
        Arc::new(RecordingSubscriber {
            label,
            log: Arc::clone(log),
        })
    }

    #[test]
    fn duplicate_order_fails_fast() {
        let (dispatcher, _) = dispatcher(Vec::new());
        let log = Arc::new(Mutex::new(Vec::new()));

        dispatcher
            .subscribe(
                SubscribeOptions {
                    target: SubscriptionTarget::All,
                    order: 10,
                },
                recorder("a", &log),
            )
            .unwrap();

        let err = dispatcher
            .subscribe(
                SubscribeOptions {
                    target: SubscriptionTarget::All,
                    order: 10,
                },
                recorder("b", &log),
            )
            .unwrap_err();
        assert!(matches!(err, CacheError::DuplicateSubscriptionOrder(10)));
        assert_eq!(dispatcher.subscription_count(), 1);
    }

    #[test]
    fn unsubscribe_twice_is_tolerated() {
        let (dispatcher, _) = dispatcher(Vec::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        let id = dispatcher
            .subscribe(
                SubscribeOptions {
                    target: SubscriptionTarget::All,
                    order: 1,
                },
                recorder("a", &log),
            )
            .unwrap();

        dispatcher.unsubscribe(id);
        assert_eq!(dispatcher.subscription_count(), 0);
        dispatcher.unsubscribe(id); // warns, does not panic
    }

    #[tokio::test]
    async fn sweep_notifies_in_ascending_order() {
        let changes = vec![EntityChange::new(EntityType::City, "paris", 10)];
        let (dispatcher, _) = dispatcher(vec![Ok(ChangeBatch::Changes(changes))]);
        let log = Arc::new(Mutex::new(Vec::new()));

        // Registered out of order on purpose
        dispatcher
            .subscribe(
                SubscribeOptions {
                    target: SubscriptionTarget::All,
                    order: 20,
                },
                recorder("second", &log),
            )
            .unwrap();
        dispatcher
            .subscribe(
                SubscribeOptions {
                    target: SubscriptionTarget::All,
                    order: 10,
                },
                recorder("first", &log),
            )
            .unwrap();

        assert!(dispatcher.sweep().await);

        let log = log.lock().unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].0, "first");
        assert_eq!(log[1].0, "second");
    }

    #[tokio::test]
    async fn sweep_intersects_explicit_targets() {
        let changes = vec![
            EntityChange::new(EntityType::City, "paris", 10),
            EntityChange::new(EntityType::Stay, "abc", 20),
        ];
        let (dispatcher, _) = dispatcher(vec![Ok(ChangeBatch::Changes(changes))]);
        let log = Arc::new(Mutex::new(Vec::new()));

        dispatcher
            .subscribe(
                SubscribeOptions {
                    target: SubscriptionTarget::Entities(vec![EntityTarget::all_of(
                        EntityType::Stay,
                    )]),
                    order: 1,
                },
                recorder("stays", &log),
            )
            .unwrap();
        dispatcher
            .subscribe(
                SubscribeOptions {
                    target: SubscriptionTarget::Entities(vec![EntityTarget::all_of(
                        EntityType::Booking,
                    )]),
                    order: 2,
                },
                recorder("bookings", &log),
            )
            .unwrap();

        dispatcher.sweep().await;

        let log = log.lock().unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].0, "stays");
        let Notification::Changes(grouped) = &log[0].1 else {
            panic!("expected a change notification");
        };
        assert_eq!(grouped.len(), 1);
        assert_eq!(grouped[&EntityType::Stay][0].entity_id, "abc");
    }

    #[tokio::test]
    async fn too_much_reaches_every_subscriber() {
        let (dispatcher, _) = dispatcher(vec![Ok(ChangeBatch::TooMuch)]);
        let log = Arc::new(Mutex::new(Vec::new()));

        dispatcher
            .subscribe(
                SubscribeOptions {
                    target: SubscriptionTarget::Entities(vec![EntityTarget::all_of(
                        EntityType::Booking,
                    )]),
                    order: 1,
                },
                recorder("narrow", &log),
            )
            .unwrap();
        dispatcher
            .subscribe(
                SubscribeOptions {
                    target: SubscriptionTarget::All,
                    order: 2,
                },
                recorder("broad", &log),
            )
            .unwrap();

        dispatcher.sweep().await;

        let log = log.lock().unwrap();
        assert_eq!(log.len(), 2);
        assert!(matches!(log[0].1, Notification::TooMuch));
        assert!(matches!(log[1].1, Notification::TooMuch));
    }

    #[tokio::test]
    async fn failing_subscriber_does_not_stop_the_rest() {
        let changes = vec![EntityChange::new(EntityType::City, "paris", 10)];
        let (dispatcher, _) = dispatcher(vec![Ok(ChangeBatch::Changes(changes))]);
        let log = Arc::new(Mutex::new(Vec::new()));

        dispatcher
            .subscribe(
                SubscribeOptions {
                    target: SubscriptionTarget::All,
                    order: 1,
                },
                Arc::new(FailingSubscriber),
            )
            .unwrap();
        dispatcher
            .subscribe(
                SubscribeOptions {
                    target: SubscriptionTarget::All,
                    order: 2,
                },
                recorder("survivor", &log),
            )
            .unwrap();

        assert!(dispatcher.sweep().await);
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn tracker_failure_keeps_the_revision() {
        let changes = vec![EntityChange::new(EntityType::City, "paris", 10)];
        let (dispatcher, tracker) = dispatcher(vec![
            Err(TrackerError::unavailable("db down")),
            Ok(ChangeBatch::Changes(changes)),
        ]);
        let log = Arc::new(Mutex::new(Vec::new()));
        dispatcher
            .subscribe(
                SubscribeOptions {
                    target: SubscriptionTarget::All,
                    order: 1,
                },
                recorder("a", &log),
            )
            .unwrap();

        dispatcher.sweep().await;
        assert_eq!(dispatcher.last_changed_revision(), 0);
        assert!(log.lock().unwrap().is_empty());

        // Next sweep re-examines the same window and succeeds.
        dispatcher.sweep().await;
        assert!(dispatcher.last_changed_revision() > 0);
        assert_eq!(log.lock().unwrap().len(), 1);

        let calls = tracker.calls.lock().unwrap();
        assert_eq!(calls[0].0, 0);
        assert_eq!(calls[1].0, 0);
    }

    #[tokio::test]
    async fn cap_is_pages_times_fanout() {
        let config = CleanerConfig {
            max_changed_pages_for_purge: 50,
            average_entity_types_per_page: 10,
            ..Default::default()
        };
        let tracker = Arc::new(ScriptedTracker::new(vec![Ok(ChangeBatch::Changes(
            Vec::new(),
        ))]));
        let dispatcher = NotificationDispatcher::new(config, tracker.clone()).unwrap();

        dispatcher.sweep().await;
        assert_eq!(tracker.calls.lock().unwrap()[0].1, 500);
    }

    #[test]
    fn oversized_interval_rejected_at_construction() {
        let config = CleanerConfig {
            sweep_interval_secs: super::super::config::MAX_SWEEP_INTERVAL_SECS + 1,
            ..Default::default()
        };
        let tracker = Arc::new(ScriptedTracker::new(Vec::new()));
        assert!(NotificationDispatcher::new(config, tracker).is_err());
    }
}
