//! In-memory queue transport and idempotency store.
//!
//! Used by the engine's test suite and for local development without a
//! Postgres instance. Honors the same contract as the Postgres backend:
//! leased claims, lease-guarded mutations, scheduled redelivery, and a
//! dead-letter store. All state sits behind a single mutex that is never
//! held across an await point.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use relay_core::types::{DbId, Timestamp};
use relay_core::JobDescriptor;
use relay_db::models::{DeadLetter, IdempotencyStatus, JobStatus};

use crate::error::TransportError;
use crate::transport::{Delivery, DeliveryToken, IdempotencyClaim, IdempotencyStore, QueueTransport};

// ---------------------------------------------------------------------------
// MemoryQueue
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct StoredJob {
    id: DbId,
    token: Uuid,
    descriptor: JobDescriptor,
    status: JobStatus,
    attempt: u32,
    max_attempts: u32,
    lease_id: Option<Uuid>,
    next_run_at: Timestamp,
    result: Option<serde_json::Value>,
    error_message: Option<String>,
    submitted_at: Timestamp,
}

#[derive(Debug, Default)]
struct QueueState {
    next_job_id: DbId,
    next_dead_letter_id: DbId,
    jobs: Vec<StoredJob>,
    dead_letters: Vec<DeadLetter>,
}

/// In-process durable-queue stand-in.
#[derive(Default)]
pub struct MemoryQueue {
    state: Mutex<QueueState>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        // A poisoned lock only happens after a panic inside this module.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current status of a job, by token. Test support.
    pub fn job_status(&self, token: DeliveryToken) -> Option<JobStatus> {
        self.lock()
            .jobs
            .iter()
            .find(|j| j.token == token.0)
            .map(|j| j.status)
    }

    /// Stored result of a job, by token. Test support.
    pub fn job_result(&self, token: DeliveryToken) -> Option<serde_json::Value> {
        self.lock()
            .jobs
            .iter()
            .find(|j| j.token == token.0)
            .and_then(|j| j.result.clone())
    }

    /// Number of jobs ever enqueued (any status).
    pub fn job_count(&self) -> usize {
        self.lock().jobs.len()
    }

    /// Number of retained dead letters.
    pub fn dead_letter_count(&self) -> usize {
        self.lock().dead_letters.len()
    }

    fn guarded_job<'a>(
        state: &'a mut QueueState,
        delivery: &Delivery,
    ) -> Result<&'a mut StoredJob, TransportError> {
        let job = state
            .jobs
            .iter_mut()
            .find(|j| j.id == delivery.job_id)
            .ok_or_else(|| TransportError::Backend(format!("unknown job {}", delivery.job_id)))?;
        if job.lease_id != Some(delivery.lease_id) {
            return Err(TransportError::StaleLease {
                job_id: delivery.job_id,
            });
        }
        Ok(job)
    }
}

#[async_trait]
impl QueueTransport for MemoryQueue {
    async fn enqueue(
        &self,
        descriptor: &JobDescriptor,
        max_attempts: u32,
    ) -> Result<DeliveryToken, TransportError> {
        let mut state = self.lock();
        state.next_job_id += 1;
        let token = Uuid::now_v7();
        let now = Utc::now();
        let id = state.next_job_id;
        state.jobs.push(StoredJob {
            id,
            token,
            descriptor: descriptor.clone(),
            status: JobStatus::Pending,
            attempt: 0,
            max_attempts,
            lease_id: None,
            next_run_at: now,
            result: None,
            error_message: None,
            submitted_at: now,
        });
        Ok(DeliveryToken(token))
    }

    async fn claim_next(&self) -> Result<Option<Delivery>, TransportError> {
        let mut state = self.lock();
        let now = Utc::now();

        let due = state
            .jobs
            .iter_mut()
            .filter(|j| j.status == JobStatus::Pending && j.next_run_at <= now)
            .min_by_key(|j| (j.next_run_at, j.submitted_at, j.id));

        let Some(job) = due else {
            return Ok(None);
        };

        let lease_id = Uuid::now_v7();
        job.status = JobStatus::Running;
        job.lease_id = Some(lease_id);
        job.attempt += 1;

        Ok(Some(Delivery {
            job_id: job.id,
            token: DeliveryToken(job.token),
            lease_id,
            attempt: job.attempt,
            max_attempts: job.max_attempts,
            descriptor: job.descriptor.clone(),
        }))
    }

    async fn complete(
        &self,
        delivery: &Delivery,
        result: &serde_json::Value,
    ) -> Result<(), TransportError> {
        let mut state = self.lock();
        let job = Self::guarded_job(&mut state, delivery)?;
        job.status = JobStatus::Completed;
        job.lease_id = None;
        job.result = Some(result.clone());
        Ok(())
    }

    async fn schedule_retry(
        &self,
        delivery: &Delivery,
        error: &str,
        delay: std::time::Duration,
    ) -> Result<(), TransportError> {
        let mut state = self.lock();
        let job = Self::guarded_job(&mut state, delivery)?;
        job.status = JobStatus::Pending;
        job.lease_id = None;
        job.error_message = Some(error.to_string());
        job.next_run_at = Utc::now()
            + chrono::Duration::from_std(delay)
                .unwrap_or_else(|_| chrono::Duration::seconds(i64::MAX / 1000));
        Ok(())
    }

    async fn discard(&self, delivery: &Delivery, reason: &str) -> Result<(), TransportError> {
        let mut state = self.lock();
        let job = Self::guarded_job(&mut state, delivery)?;
        job.status = JobStatus::Discarded;
        job.lease_id = None;
        job.error_message = Some(reason.to_string());
        Ok(())
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), TransportError> {
        let mut state = self.lock();
        {
            let job = Self::guarded_job(&mut state, delivery)?;
            job.status = JobStatus::DeadLettered;
            job.lease_id = None;
            job.error_message = Some(reason.to_string());
        }
        state.next_dead_letter_id += 1;
        let id = state.next_dead_letter_id;
        state.dead_letters.push(DeadLetter {
            id,
            job_token: delivery.token.0,
            job_name: delivery.descriptor.name.clone(),
            arguments: serde_json::Value::Array(delivery.descriptor.arguments.clone()),
            idempotency_key: delivery.descriptor.idempotency_key.clone(),
            attempts: delivery.attempt as i32,
            failure_reason: reason.to_string(),
            dead_lettered_at: Utc::now(),
        });
        Ok(())
    }

    async fn cancel(&self, token: DeliveryToken) -> Result<bool, TransportError> {
        let mut state = self.lock();
        let Some(job) = state.jobs.iter_mut().find(|j| j.token == token.0) else {
            return Ok(false);
        };
        if job.status != JobStatus::Pending || job.lease_id.is_some() {
            return Ok(false);
        }
        job.status = JobStatus::Cancelled;
        Ok(true)
    }

    async fn dead_letters(
        &self,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<DeadLetter>, TransportError> {
        let state = self.lock();
        let mut letters = state.dead_letters.clone();
        letters.sort_by(|a, b| b.dead_lettered_at.cmp(&a.dead_lettered_at));
        Ok(letters
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn requeue_dead_letter(
        &self,
        id: DbId,
        max_attempts: u32,
    ) -> Result<DeliveryToken, TransportError> {
        let letter = {
            let mut state = self.lock();
            let pos = state
                .dead_letters
                .iter()
                .position(|l| l.id == id)
                .ok_or(TransportError::DeadLetterNotFound(id))?;
            state.dead_letters.remove(pos)
        };

        let arguments = match letter.arguments {
            serde_json::Value::Array(items) => items,
            other => vec![other],
        };
        self.enqueue(
            &JobDescriptor {
                name: letter.job_name,
                arguments,
                idempotency_key: letter.idempotency_key,
            },
            max_attempts,
        )
        .await
    }

    async fn purge_dead_letters(&self, cutoff: Timestamp) -> Result<u64, TransportError> {
        let mut state = self.lock();
        let before = state.dead_letters.len();
        state.dead_letters.retain(|l| l.dead_lettered_at >= cutoff);
        Ok((before - state.dead_letters.len()) as u64)
    }
}

// ---------------------------------------------------------------------------
// MemoryIdempotencyStore
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct MemoryRecord {
    status: IdempotencyStatus,
    locked_until: Option<Timestamp>,
    first_seen_at: Timestamp,
    completed_at: Option<Timestamp>,
}

/// In-process idempotency guard. The mutex makes each operation atomic,
/// mirroring the single-statement semantics of the Postgres store.
#[derive(Default)]
pub struct MemoryIdempotencyStore {
    records: Mutex<HashMap<String, MemoryRecord>>,
}

impl MemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current status of a key. Test support.
    pub fn status(&self, key: &str) -> Option<IdempotencyStatus> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .map(|r| r.status)
    }

    /// Number of records held. Test support.
    pub fn record_count(&self) -> usize {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Shift a record's timestamps into the past. Test support.
    pub fn age_record(&self, key: &str, by: chrono::Duration) {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(record) = records.get_mut(key) {
            record.first_seen_at = record.first_seen_at - by;
            record.completed_at = record.completed_at.map(|t| t - by);
        }
    }
}

#[async_trait]
impl IdempotencyStore for MemoryIdempotencyStore {
    async fn begin(
        &self,
        key: &str,
        lock_ttl: std::time::Duration,
    ) -> Result<IdempotencyClaim, TransportError> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let now = Utc::now();
        let deadline = now
            + chrono::Duration::from_std(lock_ttl).unwrap_or_else(|_| chrono::Duration::hours(1));

        match records.get_mut(key) {
            None => {
                records.insert(
                    key.to_string(),
                    MemoryRecord {
                        status: IdempotencyStatus::Pending,
                        locked_until: Some(deadline),
                        first_seen_at: now,
                        completed_at: None,
                    },
                );
                Ok(IdempotencyClaim::Acquired)
            }
            Some(record) if record.status == IdempotencyStatus::Completed => {
                Ok(IdempotencyClaim::Completed)
            }
            Some(record) => {
                if record.locked_until.is_none_or(|t| t <= now) {
                    record.locked_until = Some(deadline);
                    Ok(IdempotencyClaim::Acquired)
                } else {
                    Ok(IdempotencyClaim::InProgress)
                }
            }
        }
    }

    async fn release(&self, key: &str) -> Result<(), TransportError> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(record) = records.get_mut(key) {
            if record.status == IdempotencyStatus::Pending {
                record.locked_until = None;
            }
        }
        Ok(())
    }

    async fn mark_completed(&self, key: &str) -> Result<bool, TransportError> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        match records.get_mut(key) {
            Some(record) if record.status == IdempotencyStatus::Pending => {
                record.status = IdempotencyStatus::Completed;
                record.locked_until = None;
                record.completed_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn sweep_expired(&self, retention_hours: f64) -> Result<u64, TransportError> {
        let cutoff = Utc::now()
            - chrono::Duration::milliseconds((retention_hours * 3_600_000.0) as i64);
        let now = Utc::now();
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let before = records.len();
        records.retain(|_, r| match r.status {
            IdempotencyStatus::Completed => r.completed_at.is_none_or(|t| t >= cutoff),
            IdempotencyStatus::Pending => {
                r.first_seen_at >= cutoff || r.locked_until.is_some_and(|t| t > now)
            }
        });
        Ok((before - records.len()) as u64)
    }
}
