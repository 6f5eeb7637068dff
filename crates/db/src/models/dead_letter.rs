//! Dead letter entity model and DTOs.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use relay_core::types::{DbId, Timestamp};

/// A row from the `dead_letters` table: a job that exhausted its retry
/// budget, retained with its original descriptor for manual inspection.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct DeadLetter {
    pub id: DbId,
    /// Token of the job this letter was created from.
    pub job_token: Uuid,
    pub job_name: String,
    pub arguments: serde_json::Value,
    pub idempotency_key: String,
    pub attempts: i32,
    pub failure_reason: String,
    pub dead_lettered_at: Timestamp,
}

/// DTO for inserting a dead letter.
#[derive(Debug, Clone)]
pub struct NewDeadLetter {
    pub job_token: Uuid,
    pub job_name: String,
    pub arguments: serde_json::Value,
    pub idempotency_key: String,
    pub attempts: i32,
    pub failure_reason: String,
}

/// Query parameters for listing dead letters.
#[derive(Debug, Default, Deserialize)]
pub struct DeadLetterListQuery {
    /// Maximum number of results. Defaults to 50, capped at 100.
    pub limit: Option<i64>,
    /// Number of results to skip. Defaults to 0.
    pub offset: Option<i64>,
}
