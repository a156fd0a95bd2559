//! Scirocco page-cache maintenance
//!
//! Keeps the rendered-page cache consistent with the content database:
//!
//! - **Notification dispatcher**: periodically discovers entity changes and
//!   fans them out to subscribers in priority order
//! - **Invalidation engine**: maps changed entities to affected cached pages
//!   and removes their keys or advances their stored timestamps
//!
//! ## Configuration
//!
//! Cleaner behavior is controlled via `scirocco.toml`:
//!
//! ```toml
//! [cleaner]
//! sweep_interval_secs = 60
//! max_changed_pages_for_purge = 50
//! retry_attempts = 3
//! # ... see config.rs for all options
//! ```

mod config;
mod dispatcher;
mod engine;
mod error;
mod items;
pub mod keys;
pub(crate) mod lock;
mod status;
mod subscription;
mod timestamps;

pub use config::{CleanerConfig, CleanerConfigError, MAX_SWEEP_INTERVAL_SECS};
pub use dispatcher::NotificationDispatcher;
pub use engine::{InvalidationMode, PageInvalidationEngine, PageVersion};
pub use error::CacheError;
pub use items::ScheduledInvalidationItem;
pub use subscription::{
    ChangeSubscriber, EntityTarget, IdSelector, Notification, SubscribeOptions, SubscriberId,
    SubscriptionTarget,
};
pub use timestamps::{UNINITIALIZED_TIMESTAMP, row_id};
