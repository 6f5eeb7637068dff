//! Idempotency record entity model.

use serde::Serialize;
use sqlx::FromRow;

use relay_core::types::Timestamp;

use super::status::StatusId;

/// A row from the `idempotency_records` table.
///
/// Owned exclusively by the dispatcher. One row per idempotency key;
/// created on first delivery, promoted to completed after a successful
/// handler run, swept after the retention window.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct IdempotencyRecord {
    pub key: String,
    pub status_id: StatusId,
    /// While pending, the delivery that acquired the key holds it until
    /// this deadline; other concurrent deliveries must back off.
    pub locked_until: Option<Timestamp>,
    pub first_seen_at: Timestamp,
    pub completed_at: Option<Timestamp>,
}
