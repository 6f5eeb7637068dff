//! Error taxonomy for the dispatch engine.
//!
//! Enqueue-time errors surface synchronously to the caller. Consume-time
//! errors never leave the dispatcher: handler failures are classified as
//! retryable or not, and storage failures are retried by the consume loop.

use relay_core::types::DbId;

/// Failure raised to the caller of `Dispatcher::enqueue`.
#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    /// No handler is registered under the requested job name. Fatal to
    /// the caller; no queue write is performed.
    #[error("No handler registered for job kind \"{0}\"")]
    UnknownJobKind(String),

    /// The arguments could not be encoded to the JSON wire form.
    #[error("Job arguments could not be serialized: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The descriptor failed validation (name or argument shape).
    #[error(transparent)]
    Invalid(#[from] relay_core::CoreError),

    /// The durable queue rejected the write.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Failure returned by a [`JobHandler`](crate::registry::JobHandler).
///
/// The dispatcher classifies by variant, not by inspecting messages:
/// `EntityNotFound` is non-retryable by policy (the referenced entity is
/// permanently gone, retrying cannot help); everything else is transient
/// and retried until the budget runs out.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("Entity not found: {entity} with id {id}")]
    EntityNotFound { entity: &'static str, id: DbId },

    #[error("Transient failure: {0}")]
    Transient(String),
}

impl HandlerError {
    /// Wrap any displayable error as a retryable failure.
    pub fn transient(err: impl std::fmt::Display) -> Self {
        Self::Transient(err.to_string())
    }
}

impl From<sqlx::Error> for HandlerError {
    fn from(err: sqlx::Error) -> Self {
        Self::Transient(err.to_string())
    }
}

/// Failure in the queue transport or idempotency store.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The delivery's lease no longer matches the job row: the claim was
    /// superseded (consumer presumed crashed, job redelivered elsewhere).
    #[error("Stale lease for job {job_id}")]
    StaleLease { job_id: DbId },

    #[error("Dead letter {0} not found")]
    DeadLetterNotFound(DbId),

    #[error("Transport failure: {0}")]
    Backend(String),
}
