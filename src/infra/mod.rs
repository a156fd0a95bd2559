//! Infrastructure: cache/timestamp store seams with in-memory
//! implementations, telemetry bootstrap, and infra error types.

pub mod error;
pub mod store;
pub mod telemetry;
pub mod timestamp_store;
