//! Job entity model and DTOs for the durable dispatch queue.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use relay_core::types::{DbId, Timestamp};

use super::status::StatusId;

/// A row from the `jobs` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Job {
    pub id: DbId,
    /// Opaque delivery token handed back to the enqueueing caller.
    pub token: Uuid,
    pub job_name: String,
    pub arguments: serde_json::Value,
    pub idempotency_key: String,
    pub status_id: StatusId,
    /// Number of delivery attempts so far (0 until first claim).
    pub attempt: i32,
    pub max_attempts: i32,
    /// Lease for the in-flight claim; rotated on every claim so stale
    /// consumers cannot clobber a newer attempt.
    pub lease_id: Option<Uuid>,
    /// Earliest time the job may be (re)delivered.
    pub next_run_at: Timestamp,
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub submitted_at: Timestamp,
    pub claimed_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    pub created_at: Timestamp,
}

/// DTO for inserting a new pending job.
#[derive(Debug, Clone, Deserialize)]
pub struct NewJob {
    pub job_name: String,
    /// JSON array of ordered arguments.
    pub arguments: serde_json::Value,
    pub idempotency_key: String,
    pub max_attempts: i32,
}
