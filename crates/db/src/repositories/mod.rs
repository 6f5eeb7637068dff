//! Repository layer.
//!
//! Each repository is a zero-sized struct providing async CRUD methods
//! that accept `&PgPool` as the first argument.

pub mod dead_letter_repo;
pub mod idempotency_repo;
pub mod queue_repo;

pub use dead_letter_repo::DeadLetterRepo;
pub use idempotency_repo::IdempotencyRepo;
pub use queue_repo::QueueRepo;
