//! Maintenance job handlers and registry wiring.
//!
//! Application handlers are registered by the embedding service; this
//! module contributes the housekeeping jobs the worker enqueues for
//! itself on a timer.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;

use relay_core::CoreError;
use relay_dispatch::{
    HandlerError, HandlerRegistry, IdempotencyStore, JobContext, JobHandler, QueueTransport,
};

/// Job name under which expired idempotency records are swept.
pub const SWEEP_IDEMPOTENCY_RECORDS: &str = "relay.sweep_idempotency_records";

/// Job name under which old dead letters are purged.
pub const PURGE_DEAD_LETTERS: &str = "relay.purge_dead_letters";

/// Feature category for the worker's own housekeeping jobs.
const MAINTENANCE_CATEGORY: &str = "maintenance";

// ---------------------------------------------------------------------------
// SweepIdempotencyRecords
// ---------------------------------------------------------------------------

/// Drops idempotency records older than the retention window. Keeping
/// them forever would grow the guard table without bound; dropping them
/// bounds the dedupe horizon to the retention window, which must exceed
/// any plausible redelivery delay.
pub struct SweepIdempotencyRecords {
    store: Arc<dyn IdempotencyStore>,
    retention_hours: f64,
}

impl SweepIdempotencyRecords {
    pub fn new(store: Arc<dyn IdempotencyStore>, retention_hours: f64) -> Self {
        Self {
            store,
            retention_hours,
        }
    }
}

#[async_trait]
impl JobHandler for SweepIdempotencyRecords {
    async fn perform(
        &self,
        _ctx: &JobContext,
        _arguments: &[serde_json::Value],
    ) -> Result<serde_json::Value, HandlerError> {
        let removed = self
            .store
            .sweep_expired(self.retention_hours)
            .await
            .map_err(HandlerError::transient)?;
        tracing::info!(removed, "Swept expired idempotency records");
        Ok(json!({ "removed": removed }))
    }
}

// ---------------------------------------------------------------------------
// PurgeDeadLetters
// ---------------------------------------------------------------------------

/// Purges dead letters past the operator-inspection retention window.
pub struct PurgeDeadLetters {
    transport: Arc<dyn QueueTransport>,
    retention_days: i64,
}

impl PurgeDeadLetters {
    pub fn new(transport: Arc<dyn QueueTransport>, retention_days: i64) -> Self {
        Self {
            transport,
            retention_days,
        }
    }
}

#[async_trait]
impl JobHandler for PurgeDeadLetters {
    async fn perform(
        &self,
        _ctx: &JobContext,
        _arguments: &[serde_json::Value],
    ) -> Result<serde_json::Value, HandlerError> {
        let cutoff = Utc::now() - ChronoDuration::days(self.retention_days);
        let removed = self
            .transport
            .purge_dead_letters(cutoff)
            .await
            .map_err(HandlerError::transient)?;
        tracing::info!(removed, "Purged old dead letters");
        Ok(json!({ "removed": removed }))
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

/// Register the worker's maintenance handlers.
///
/// Neither job is marked idempotent: sweeping twice is harmless and the
/// guard records would otherwise pin the very table being swept.
pub fn register_maintenance_handlers(
    registry: &mut HandlerRegistry,
    transport: Arc<dyn QueueTransport>,
    store: Arc<dyn IdempotencyStore>,
    idempotency_retention_hours: f64,
    dead_letter_retention_days: i64,
) -> Result<(), CoreError> {
    registry.register(
        SWEEP_IDEMPOTENCY_RECORDS,
        MAINTENANCE_CATEGORY,
        false,
        Arc::new(SweepIdempotencyRecords::new(
            store,
            idempotency_retention_hours,
        )),
    )?;
    registry.register(
        PURGE_DEAD_LETTERS,
        MAINTENANCE_CATEGORY,
        false,
        Arc::new(PurgeDeadLetters::new(transport, dead_letter_retention_days)),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_dispatch::memory::{MemoryIdempotencyStore, MemoryQueue};

    #[test]
    fn maintenance_handlers_register_cleanly() {
        let mut registry = HandlerRegistry::new();
        register_maintenance_handlers(
            &mut registry,
            Arc::new(MemoryQueue::new()),
            Arc::new(MemoryIdempotencyStore::new()),
            72.0,
            30,
        )
        .unwrap();

        assert!(registry.contains(SWEEP_IDEMPOTENCY_RECORDS));
        assert!(registry.contains(PURGE_DEAD_LETTERS));
        assert!(!registry.get(SWEEP_IDEMPOTENCY_RECORDS).unwrap().idempotent);
    }

    #[tokio::test]
    async fn sweep_reports_removed_count() {
        let store: Arc<MemoryIdempotencyStore> = Arc::new(MemoryIdempotencyStore::new());
        let handler = SweepIdempotencyRecords::new(store, 72.0);
        let ctx = JobContext {
            job_name: SWEEP_IDEMPOTENCY_RECORDS.into(),
            token: uuid::Uuid::now_v7(),
            attempt: 1,
            feature_category: MAINTENANCE_CATEGORY.into(),
        };

        let result = handler.perform(&ctx, &[]).await.unwrap();
        assert_eq!(result, json!({ "removed": 0 }));
    }
}
