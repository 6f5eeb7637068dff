//! Repository for the `jobs` table — the durable delivery queue.
//!
//! Uses `JobStatus` from `models::status` for all status transitions.
//! Every in-flight mutation is guarded on the claim's `lease_id` so a
//! stale consumer (crashed or timed out, with the job since redelivered)
//! cannot clobber a newer attempt.

use sqlx::PgPool;
use uuid::Uuid;

use relay_core::types::DbId;

use crate::models::job::{Job, NewJob};
use crate::models::status::JobStatus;

/// Column list for `jobs` queries.
const COLUMNS: &str = "\
    id, token, job_name, arguments, idempotency_key, status_id, \
    attempt, max_attempts, lease_id, next_run_at, \
    result, error_message, \
    submitted_at, claimed_at, completed_at, created_at";

/// Provides queue operations for background jobs.
pub struct QueueRepo;

impl QueueRepo {
    /// Insert a new pending job, due immediately. Returns the stored row.
    pub async fn submit(pool: &PgPool, input: &NewJob) -> Result<Job, sqlx::Error> {
        let query = format!(
            "INSERT INTO jobs \
                 (token, job_name, arguments, idempotency_key, status_id, max_attempts) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Job>(&query)
            .bind(Uuid::now_v7())
            .bind(&input.job_name)
            .bind(&input.arguments)
            .bind(&input.idempotency_key)
            .bind(JobStatus::Pending.id())
            .bind(input.max_attempts)
            .fetch_one(pool)
            .await
    }

    /// Atomically claim the next due pending job under a fresh lease.
    ///
    /// Uses `SELECT FOR UPDATE SKIP LOCKED` so concurrent consumers never
    /// receive the same delivery. Increments the attempt counter as part
    /// of the claim.
    pub async fn claim_next(pool: &PgPool, lease_id: Uuid) -> Result<Option<Job>, sqlx::Error> {
        let query = format!(
            "UPDATE jobs \
             SET status_id = $1, lease_id = $2, claimed_at = NOW(), attempt = attempt + 1 \
             WHERE id = ( \
                 SELECT id FROM jobs \
                 WHERE status_id = $3 AND next_run_at <= NOW() \
                 ORDER BY next_run_at ASC, submitted_at ASC \
                 LIMIT 1 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Job>(&query)
            .bind(JobStatus::Running.id())
            .bind(lease_id)
            .bind(JobStatus::Pending.id())
            .fetch_optional(pool)
            .await
    }

    /// Mark a claimed job completed with its result payload.
    ///
    /// Returns `false` when the lease no longer matches (stale consumer).
    pub async fn complete(
        pool: &PgPool,
        job_id: DbId,
        lease_id: Uuid,
        result: &serde_json::Value,
    ) -> Result<bool, sqlx::Error> {
        let res = sqlx::query(
            "UPDATE jobs \
             SET status_id = $3, result = $4, lease_id = NULL, completed_at = NOW() \
             WHERE id = $1 AND lease_id = $2",
        )
        .bind(job_id)
        .bind(lease_id)
        .bind(JobStatus::Completed.id())
        .bind(result)
        .execute(pool)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    /// Return a claimed job to the queue, due again after `delay_secs`.
    ///
    /// Records the failure message; the attempt counter stays as set by
    /// the claim. Returns `false` when the lease no longer matches.
    pub async fn schedule_retry(
        pool: &PgPool,
        job_id: DbId,
        lease_id: Uuid,
        error: &str,
        delay_secs: f64,
    ) -> Result<bool, sqlx::Error> {
        let res = sqlx::query(
            "UPDATE jobs \
             SET status_id = $3, lease_id = NULL, error_message = $4, \
                 next_run_at = NOW() + make_interval(secs => $5) \
             WHERE id = $1 AND lease_id = $2",
        )
        .bind(job_id)
        .bind(lease_id)
        .bind(JobStatus::Pending.id())
        .bind(error)
        .bind(delay_secs)
        .execute(pool)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    /// Acknowledge a claimed job without execution outcome.
    ///
    /// Used for the non-retryable entity-not-found path: the delivery is
    /// removed from the active queue and never dead-lettered.
    pub async fn discard(
        pool: &PgPool,
        job_id: DbId,
        lease_id: Uuid,
        reason: &str,
    ) -> Result<bool, sqlx::Error> {
        let res = sqlx::query(
            "UPDATE jobs \
             SET status_id = $3, lease_id = NULL, error_message = $4, completed_at = NOW() \
             WHERE id = $1 AND lease_id = $2",
        )
        .bind(job_id)
        .bind(lease_id)
        .bind(JobStatus::Discarded.id())
        .bind(reason)
        .execute(pool)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    /// Mark a claimed job dead-lettered after its budget is exhausted.
    ///
    /// The caller inserts the corresponding `dead_letters` row.
    pub async fn mark_dead_lettered(
        pool: &PgPool,
        job_id: DbId,
        lease_id: Uuid,
        reason: &str,
    ) -> Result<bool, sqlx::Error> {
        let res = sqlx::query(
            "UPDATE jobs \
             SET status_id = $3, lease_id = NULL, error_message = $4, completed_at = NOW() \
             WHERE id = $1 AND lease_id = $2",
        )
        .bind(job_id)
        .bind(lease_id)
        .bind(JobStatus::DeadLettered.id())
        .bind(reason)
        .execute(pool)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    /// Cancel a job by omission: only while still pending and unclaimed.
    ///
    /// Returns `true` if the job was cancelled, `false` if a consumer had
    /// already claimed it (it then runs to completion or failure).
    pub async fn cancel_unclaimed(pool: &PgPool, token: Uuid) -> Result<bool, sqlx::Error> {
        let res = sqlx::query(
            "UPDATE jobs \
             SET status_id = $2, completed_at = NOW() \
             WHERE token = $1 AND status_id = $3 AND lease_id IS NULL",
        )
        .bind(token)
        .bind(JobStatus::Cancelled.id())
        .bind(JobStatus::Pending.id())
        .execute(pool)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    /// Find a job by its delivery token.
    pub async fn find_by_token(pool: &PgPool, token: Uuid) -> Result<Option<Job>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM jobs WHERE token = $1");
        sqlx::query_as::<_, Job>(&query)
            .bind(token)
            .fetch_optional(pool)
            .await
    }
}
