//! Repository for the `idempotency_records` table.
//!
//! The check-then-act on a key is collapsed into single statements so two
//! concurrent deliveries of the same key can never both pass the guard:
//! `try_acquire` is one upsert that takes a time-boxed lock on the key,
//! and `mark_completed` is a conditional pending-to-completed update.

use sqlx::PgPool;

use crate::models::idempotency::IdempotencyRecord;
use crate::models::status::IdempotencyStatus;

/// Column list for `idempotency_records` queries.
const COLUMNS: &str = "key, status_id, locked_until, first_seen_at, completed_at";

/// Provides atomic operations on idempotency records.
pub struct IdempotencyRepo;

impl IdempotencyRepo {
    /// Atomically try to acquire `key` for one delivery attempt.
    ///
    /// Succeeds (returns `true`) when the record is absent, or pending
    /// with an expired lock — in both cases the lock is set to
    /// `NOW() + lock_ttl_secs`. Returns `false` when the key is completed
    /// or currently held by another in-flight delivery; `find` tells the
    /// two cases apart.
    pub async fn try_acquire(
        pool: &PgPool,
        key: &str,
        lock_ttl_secs: f64,
    ) -> Result<bool, sqlx::Error> {
        // ON CONFLICT DO UPDATE ... WHERE returns no row when the guard
        // fails, which keeps insert-or-lock a single atomic step.
        let acquired: Option<i16> = sqlx::query_scalar(
            "INSERT INTO idempotency_records (key, status_id, locked_until) \
             VALUES ($1, $2, NOW() + make_interval(secs => $3)) \
             ON CONFLICT (key) DO UPDATE \
                 SET locked_until = NOW() + make_interval(secs => $3) \
                 WHERE idempotency_records.status_id = $2 \
                   AND (idempotency_records.locked_until IS NULL \
                        OR idempotency_records.locked_until <= NOW()) \
             RETURNING status_id",
        )
        .bind(key)
        .bind(IdempotencyStatus::Pending.id())
        .bind(lock_ttl_secs)
        .fetch_optional(pool)
        .await?;
        Ok(acquired.is_some())
    }

    /// Release a held pending lock after a failed handler run, so the
    /// redelivery does not have to wait out the TTL.
    pub async fn release(pool: &PgPool, key: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE idempotency_records \
             SET locked_until = NULL \
             WHERE key = $1 AND status_id = $2",
        )
        .bind(key)
        .bind(IdempotencyStatus::Pending.id())
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Conditionally promote a record from `Pending` to `Completed`.
    ///
    /// Returns `true` if this call performed the promotion, `false` if the
    /// record was already completed (or missing).
    pub async fn mark_completed(pool: &PgPool, key: &str) -> Result<bool, sqlx::Error> {
        let res = sqlx::query(
            "UPDATE idempotency_records \
             SET status_id = $2, locked_until = NULL, completed_at = NOW() \
             WHERE key = $1 AND status_id = $3",
        )
        .bind(key)
        .bind(IdempotencyStatus::Completed.id())
        .bind(IdempotencyStatus::Pending.id())
        .execute(pool)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    /// Delete records older than the retention window.
    ///
    /// Removes completed records by completion time and orphaned pending
    /// records (job discarded or descriptor lost) by first-seen time.
    /// Returns the number of rows removed.
    pub async fn delete_expired(pool: &PgPool, retention_hours: f64) -> Result<u64, sqlx::Error> {
        let res = sqlx::query(
            "DELETE FROM idempotency_records \
             WHERE (status_id = $1 AND completed_at < NOW() - make_interval(secs => $3)) \
                OR (status_id = $2 AND first_seen_at < NOW() - make_interval(secs => $3) \
                    AND (locked_until IS NULL OR locked_until <= NOW()))",
        )
        .bind(IdempotencyStatus::Completed.id())
        .bind(IdempotencyStatus::Pending.id())
        .bind(retention_hours * 3600.0)
        .execute(pool)
        .await?;
        Ok(res.rows_affected())
    }

    /// Find a record by key.
    pub async fn find(pool: &PgPool, key: &str) -> Result<Option<IdempotencyRecord>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM idempotency_records WHERE key = $1");
        sqlx::query_as::<_, IdempotencyRecord>(&query)
            .bind(key)
            .fetch_optional(pool)
            .await
    }
}
