//! Postgres-backed queue transport and idempotency store.
//!
//! Thin adapters over the `relay-db` repositories. Claiming relies on
//! `FOR UPDATE SKIP LOCKED`, so any number of worker processes can share
//! one queue; every claim rotates the job's lease and all mutations are
//! lease-guarded.

use async_trait::async_trait;
use uuid::Uuid;

use relay_core::types::{DbId, Timestamp};
use relay_core::JobDescriptor;
use relay_db::models::{DeadLetter, DeadLetterListQuery, IdempotencyStatus, Job, NewDeadLetter, NewJob};
use relay_db::repositories::{DeadLetterRepo, IdempotencyRepo, QueueRepo};
use relay_db::DbPool;

use crate::error::TransportError;
use crate::transport::{Delivery, DeliveryToken, IdempotencyClaim, IdempotencyStore, QueueTransport};

/// Durable queue over the `jobs` / `dead_letters` tables.
#[derive(Clone)]
pub struct PgQueueTransport {
    pool: DbPool,
}

impl PgQueueTransport {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

/// Convert a claimed job row into a delivery envelope.
fn delivery_from_row(job: Job) -> Result<Delivery, TransportError> {
    let arguments = match job.arguments {
        serde_json::Value::Array(items) => items,
        other => {
            return Err(TransportError::Backend(format!(
                "job {} has non-sequence arguments: {other}",
                job.id
            )))
        }
    };
    let lease_id = job.lease_id.ok_or_else(|| {
        TransportError::Backend(format!("claimed job {} is missing its lease", job.id))
    })?;
    Ok(Delivery {
        job_id: job.id,
        token: DeliveryToken(job.token),
        lease_id,
        attempt: job.attempt.max(0) as u32,
        max_attempts: job.max_attempts.max(0) as u32,
        descriptor: JobDescriptor {
            name: job.job_name,
            arguments,
            idempotency_key: job.idempotency_key,
        },
    })
}

#[async_trait]
impl QueueTransport for PgQueueTransport {
    async fn enqueue(
        &self,
        descriptor: &JobDescriptor,
        max_attempts: u32,
    ) -> Result<DeliveryToken, TransportError> {
        let job = QueueRepo::submit(
            &self.pool,
            &NewJob {
                job_name: descriptor.name.clone(),
                arguments: serde_json::Value::Array(descriptor.arguments.clone()),
                idempotency_key: descriptor.idempotency_key.clone(),
                max_attempts: max_attempts as i32,
            },
        )
        .await?;
        Ok(DeliveryToken(job.token))
    }

    async fn claim_next(&self) -> Result<Option<Delivery>, TransportError> {
        let claimed = QueueRepo::claim_next(&self.pool, Uuid::now_v7()).await?;
        claimed.map(delivery_from_row).transpose()
    }

    async fn complete(
        &self,
        delivery: &Delivery,
        result: &serde_json::Value,
    ) -> Result<(), TransportError> {
        let applied =
            QueueRepo::complete(&self.pool, delivery.job_id, delivery.lease_id, result).await?;
        if !applied {
            return Err(TransportError::StaleLease {
                job_id: delivery.job_id,
            });
        }
        Ok(())
    }

    async fn schedule_retry(
        &self,
        delivery: &Delivery,
        error: &str,
        delay: std::time::Duration,
    ) -> Result<(), TransportError> {
        let applied = QueueRepo::schedule_retry(
            &self.pool,
            delivery.job_id,
            delivery.lease_id,
            error,
            delay.as_secs_f64(),
        )
        .await?;
        if !applied {
            return Err(TransportError::StaleLease {
                job_id: delivery.job_id,
            });
        }
        Ok(())
    }

    async fn discard(&self, delivery: &Delivery, reason: &str) -> Result<(), TransportError> {
        let applied =
            QueueRepo::discard(&self.pool, delivery.job_id, delivery.lease_id, reason).await?;
        if !applied {
            return Err(TransportError::StaleLease {
                job_id: delivery.job_id,
            });
        }
        Ok(())
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), TransportError> {
        // Lease-guarded status flip first: if this claim is stale, another
        // consumer owns the job now and no letter must be written.
        let applied = QueueRepo::mark_dead_lettered(
            &self.pool,
            delivery.job_id,
            delivery.lease_id,
            reason,
        )
        .await?;
        if !applied {
            return Err(TransportError::StaleLease {
                job_id: delivery.job_id,
            });
        }

        DeadLetterRepo::insert(
            &self.pool,
            &NewDeadLetter {
                job_token: delivery.token.0,
                job_name: delivery.descriptor.name.clone(),
                arguments: serde_json::Value::Array(delivery.descriptor.arguments.clone()),
                idempotency_key: delivery.descriptor.idempotency_key.clone(),
                attempts: delivery.attempt as i32,
                failure_reason: reason.to_string(),
            },
        )
        .await?;
        Ok(())
    }

    async fn cancel(&self, token: DeliveryToken) -> Result<bool, TransportError> {
        Ok(QueueRepo::cancel_unclaimed(&self.pool, token.0).await?)
    }

    async fn dead_letters(
        &self,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<DeadLetter>, TransportError> {
        Ok(DeadLetterRepo::list(
            &self.pool,
            &DeadLetterListQuery {
                limit: Some(limit),
                offset: Some(offset),
            },
        )
        .await?)
    }

    async fn requeue_dead_letter(
        &self,
        id: DbId,
        max_attempts: u32,
    ) -> Result<DeliveryToken, TransportError> {
        let letter = DeadLetterRepo::find_by_id(&self.pool, id)
            .await?
            .ok_or(TransportError::DeadLetterNotFound(id))?;

        let job = QueueRepo::submit(
            &self.pool,
            &NewJob {
                job_name: letter.job_name,
                arguments: letter.arguments,
                idempotency_key: letter.idempotency_key,
                max_attempts: max_attempts as i32,
            },
        )
        .await?;
        DeadLetterRepo::delete(&self.pool, id).await?;
        Ok(DeliveryToken(job.token))
    }

    async fn purge_dead_letters(&self, cutoff: Timestamp) -> Result<u64, TransportError> {
        Ok(DeadLetterRepo::purge_older_than(&self.pool, cutoff).await?)
    }
}

/// Idempotency guard over the `idempotency_records` table.
#[derive(Clone)]
pub struct PgIdempotencyStore {
    pool: DbPool,
}

impl PgIdempotencyStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IdempotencyStore for PgIdempotencyStore {
    async fn begin(
        &self,
        key: &str,
        lock_ttl: std::time::Duration,
    ) -> Result<IdempotencyClaim, TransportError> {
        if IdempotencyRepo::try_acquire(&self.pool, key, lock_ttl.as_secs_f64()).await? {
            return Ok(IdempotencyClaim::Acquired);
        }
        // Not acquired: either completed, or held by an in-flight
        // delivery. A record swept between the two statements counts as
        // in-progress; the redelivery will acquire it cleanly.
        let record = IdempotencyRepo::find(&self.pool, key).await?;
        match record {
            Some(r) if r.status_id == IdempotencyStatus::Completed.id() => {
                Ok(IdempotencyClaim::Completed)
            }
            _ => Ok(IdempotencyClaim::InProgress),
        }
    }

    async fn release(&self, key: &str) -> Result<(), TransportError> {
        Ok(IdempotencyRepo::release(&self.pool, key).await?)
    }

    async fn mark_completed(&self, key: &str) -> Result<bool, TransportError> {
        Ok(IdempotencyRepo::mark_completed(&self.pool, key).await?)
    }

    async fn sweep_expired(&self, retention_hours: f64) -> Result<u64, TransportError> {
        Ok(IdempotencyRepo::delete_expired(&self.pool, retention_hours).await?)
    }
}
