//! Repository for the `dead_letters` table.

use sqlx::PgPool;

use relay_core::types::{DbId, Timestamp};

use crate::models::dead_letter::{DeadLetter, DeadLetterListQuery, NewDeadLetter};

/// Column list for `dead_letters` queries.
const COLUMNS: &str = "\
    id, job_token, job_name, arguments, idempotency_key, \
    attempts, failure_reason, dead_lettered_at";

/// Maximum page size for dead letter listing.
const MAX_LIMIT: i64 = 100;

/// Default page size for dead letter listing.
const DEFAULT_LIMIT: i64 = 50;

/// Provides CRUD operations for dead-lettered jobs.
pub struct DeadLetterRepo;

impl DeadLetterRepo {
    /// Insert a dead letter carrying the job's original descriptor.
    pub async fn insert(pool: &PgPool, input: &NewDeadLetter) -> Result<DeadLetter, sqlx::Error> {
        let query = format!(
            "INSERT INTO dead_letters \
                 (job_token, job_name, arguments, idempotency_key, attempts, failure_reason) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, DeadLetter>(&query)
            .bind(input.job_token)
            .bind(&input.job_name)
            .bind(&input.arguments)
            .bind(&input.idempotency_key)
            .bind(input.attempts)
            .bind(&input.failure_reason)
            .fetch_one(pool)
            .await
    }

    /// Find a dead letter by its ID.
    pub async fn find_by_id(pool: &PgPool, id: DbId) -> Result<Option<DeadLetter>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM dead_letters WHERE id = $1");
        sqlx::query_as::<_, DeadLetter>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// List dead letters, newest first, with pagination.
    pub async fn list(
        pool: &PgPool,
        params: &DeadLetterListQuery,
    ) -> Result<Vec<DeadLetter>, sqlx::Error> {
        let limit = params.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);
        let offset = params.offset.unwrap_or(0);

        let query = format!(
            "SELECT {COLUMNS} FROM dead_letters \
             ORDER BY dead_lettered_at DESC \
             LIMIT $1 OFFSET $2"
        );
        sqlx::query_as::<_, DeadLetter>(&query)
            .bind(limit)
            .bind(offset)
            .fetch_all(pool)
            .await
    }

    /// Delete one dead letter (after a successful requeue).
    pub async fn delete(pool: &PgPool, id: DbId) -> Result<bool, sqlx::Error> {
        let res = sqlx::query("DELETE FROM dead_letters WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    /// Purge dead letters older than the cutoff. Returns rows removed.
    pub async fn purge_older_than(pool: &PgPool, cutoff: Timestamp) -> Result<u64, sqlx::Error> {
        let res = sqlx::query("DELETE FROM dead_letters WHERE dead_lettered_at < $1")
            .bind(cutoff)
            .execute(pool)
            .await?;
        Ok(res.rows_affected())
    }

    /// Total number of dead letters retained.
    pub async fn count(pool: &PgPool) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar("SELECT COUNT(*) FROM dead_letters")
            .fetch_one(pool)
            .await
    }
}
