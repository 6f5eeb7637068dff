//! Domain model structs and DTOs.
//!
//! Each submodule contains:
//! - A `FromRow` + `Serialize` entity struct matching the database row
//! - A `Deserialize` create DTO for inserts
//! - Status enums mapping SMALLINT lookup values where applicable

pub mod dead_letter;
pub mod idempotency;
pub mod job;
pub mod status;

pub use dead_letter::{DeadLetter, DeadLetterListQuery, NewDeadLetter};
pub use idempotency::IdempotencyRecord;
pub use job::{Job, NewJob};
pub use status::{IdempotencyStatus, JobStatus, StatusId};
