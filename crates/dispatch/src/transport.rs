//! Queue transport and idempotency store abstractions.
//!
//! The dispatch engine never talks to a queue technology directly; it
//! works against these traits. The contract is at-least-once: a delivery
//! is leased to at most one concurrent consumer, but the same logical job
//! may be redelivered after a consumer crash or lease timeout.

use async_trait::async_trait;
use uuid::Uuid;

use relay_core::types::{DbId, Timestamp};
use relay_core::JobDescriptor;
use relay_db::models::DeadLetter;

use crate::error::TransportError;

/// Opaque handle identifying an enqueued job descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeliveryToken(pub Uuid);

impl std::fmt::Display for DeliveryToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// One leased delivery of a job to this consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Queue-internal job id.
    pub job_id: DbId,
    /// Token handed back to the enqueueing caller.
    pub token: DeliveryToken,
    /// Lease for this claim; transport mutations are guarded on it.
    pub lease_id: Uuid,
    /// 1-indexed attempt count including this delivery.
    pub attempt: u32,
    /// Total attempts allowed before dead-lettering.
    pub max_attempts: u32,
    /// The original descriptor, arguments intact.
    pub descriptor: JobDescriptor,
}

/// Durable at-least-once job queue.
#[async_trait]
pub trait QueueTransport: Send + Sync {
    /// Persist a descriptor as a pending job due immediately.
    async fn enqueue(
        &self,
        descriptor: &JobDescriptor,
        max_attempts: u32,
    ) -> Result<DeliveryToken, TransportError>;

    /// Atomically claim the next due job under a fresh lease, or `None`
    /// when the queue has nothing due.
    async fn claim_next(&self) -> Result<Option<Delivery>, TransportError>;

    /// Acknowledge a successful delivery with the handler's result.
    async fn complete(
        &self,
        delivery: &Delivery,
        result: &serde_json::Value,
    ) -> Result<(), TransportError>;

    /// Return a failed delivery to the queue, due again after `delay`.
    async fn schedule_retry(
        &self,
        delivery: &Delivery,
        error: &str,
        delay: std::time::Duration,
    ) -> Result<(), TransportError>;

    /// Acknowledge a delivery without outcome (non-retryable failure that
    /// must not be dead-lettered).
    async fn discard(&self, delivery: &Delivery, reason: &str) -> Result<(), TransportError>;

    /// Move a delivery's descriptor to the dead-letter store and remove
    /// the job from the active queue.
    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), TransportError>;

    /// Cancel by omission: drop the job iff still pending and unclaimed.
    /// Returns `false` when a consumer already claimed it.
    async fn cancel(&self, token: DeliveryToken) -> Result<bool, TransportError>;

    /// List dead letters, newest first.
    async fn dead_letters(
        &self,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<DeadLetter>, TransportError>;

    /// Requeue one dead letter as a fresh pending job with the original
    /// descriptor, removing it from the dead-letter store.
    async fn requeue_dead_letter(
        &self,
        id: DbId,
        max_attempts: u32,
    ) -> Result<DeliveryToken, TransportError>;

    /// Purge dead letters older than the cutoff. Returns rows removed.
    async fn purge_dead_letters(&self, cutoff: Timestamp) -> Result<u64, TransportError>;
}

/// Result of trying to acquire an idempotency key for one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdempotencyClaim {
    /// This delivery holds the key and must run the handler.
    Acquired,
    /// Another in-flight delivery holds the key; back off and let the
    /// queue redeliver.
    InProgress,
    /// A previous delivery already completed; skip without invoking.
    Completed,
}

/// Duplicate-execution guard keyed by idempotency key.
///
/// Acquisition is a single atomic compare-style step, never a separate
/// read followed by a write, so two concurrent deliveries of one key can
/// never both pass the "not completed" check: exactly one observes
/// [`IdempotencyClaim::Acquired`].
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Try to acquire `key` for this delivery, creating the record in
    /// `Pending` if absent. A pending key whose lock expired (consumer
    /// presumed crashed) is re-acquired.
    async fn begin(
        &self,
        key: &str,
        lock_ttl: std::time::Duration,
    ) -> Result<IdempotencyClaim, TransportError>;

    /// Release a held pending key after a failed handler run, so the
    /// redelivery does not have to wait out the lock TTL.
    async fn release(&self, key: &str) -> Result<(), TransportError>;

    /// Conditionally promote `Pending` to `Completed`. Returns whether
    /// this call performed the promotion.
    async fn mark_completed(&self, key: &str) -> Result<bool, TransportError>;

    /// Drop records older than the retention window, returning the
    /// number removed.
    async fn sweep_expired(&self, retention_hours: f64) -> Result<u64, TransportError>;
}
