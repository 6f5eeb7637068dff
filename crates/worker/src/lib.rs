//! Relay worker: the consume-side binary wiring.
//!
//! Builds the handler registry, connects the dispatcher to the Postgres
//! transport, and runs the consume loop plus a periodic maintenance timer
//! that enqueues the worker's own housekeeping jobs.

pub mod config;
pub mod handlers;

pub use config::{ConfigError, WorkerConfig};
