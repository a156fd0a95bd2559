//! Scirocco: entity-change notification and page-cache invalidation for a
//! content-managed travel site.
//!
//! The embedding site wires its change tracker, page catalog, and cache
//! stores into a [`cache::NotificationDispatcher`] and a
//! [`cache::PageInvalidationEngine`]; the dispatcher's periodic sweep then
//! keeps cached pages consistent with the content database.

pub mod cache;
pub mod config;
pub mod domain;
pub mod infra;
pub mod util;
