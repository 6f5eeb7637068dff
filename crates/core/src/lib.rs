//! Pure domain logic for the relay job dispatch platform.
//!
//! This crate has zero internal dependencies and no I/O. It holds the
//! shared ID/timestamp aliases, the core error taxonomy, job descriptor
//! construction and validation, idempotency-key derivation, and the
//! retry/backoff policy as pure functions.

pub mod descriptor;
pub mod error;
pub mod hashing;
pub mod retry;
pub mod types;

pub use descriptor::JobDescriptor;
pub use error::CoreError;
pub use retry::RetryPolicy;
