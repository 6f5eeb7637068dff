//! Worker configuration, read once from the environment at startup.
//!
//! | Variable                      | Default | Meaning                                       |
//! |-------------------------------|---------|-----------------------------------------------|
//! | `DATABASE_URL`                | —       | Postgres connection string (required)         |
//! | `POLL_INTERVAL_MS`            | `500`   | Sleep between claim attempts when queue empty |
//! | `MAX_ATTEMPTS`                | `5`     | Delivery attempts before dead-lettering       |
//! | `RETRY_BASE_DELAY_SECS`       | `10`    | Delay before the first retry                  |
//! | `RETRY_MAX_DELAY_SECS`        | `3600`  | Ceiling on a single retry delay               |
//! | `IDEMPOTENCY_LOCK_TTL_SECS`   | `60`    | In-flight hold time on an idempotency key     |
//! | `IDEMPOTENCY_RETENTION_HOURS` | `72`    | Age at which idempotency records are swept    |
//! | `DEAD_LETTER_RETENTION_DAYS`  | `30`    | Age at which dead letters are purged          |
//! | `MAINTENANCE_INTERVAL_SECS`   | `3600`  | Period between maintenance job enqueues       |

use std::time::Duration;

use relay_core::RetryPolicy;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{0} is not a valid number: {1}")]
    Invalid(&'static str, String),
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub database_url: String,
    pub poll_interval: Duration,
    pub max_attempts: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub idempotency_lock_ttl: Duration,
    pub idempotency_retention_hours: f64,
    pub dead_letter_retention_days: i64,
    pub maintenance_interval: Duration,
}

fn var_or<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| ConfigError::Invalid(name, raw.clone())),
        Err(_) => Ok(default),
    }
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url =
            std::env::var("DATABASE_URL").map_err(|_| ConfigError::Missing("DATABASE_URL"))?;

        Ok(Self {
            database_url,
            poll_interval: Duration::from_millis(var_or("POLL_INTERVAL_MS", 500u64)?),
            max_attempts: var_or("MAX_ATTEMPTS", relay_core::retry::DEFAULT_MAX_ATTEMPTS)?,
            retry_base_delay: Duration::from_secs(var_or(
                "RETRY_BASE_DELAY_SECS",
                relay_core::retry::DEFAULT_BASE_DELAY_SECS,
            )?),
            retry_max_delay: Duration::from_secs(var_or(
                "RETRY_MAX_DELAY_SECS",
                relay_core::retry::DEFAULT_MAX_DELAY_SECS,
            )?),
            idempotency_lock_ttl: Duration::from_secs(var_or(
                "IDEMPOTENCY_LOCK_TTL_SECS",
                60u64,
            )?),
            idempotency_retention_hours: var_or("IDEMPOTENCY_RETENTION_HOURS", 72.0f64)?,
            dead_letter_retention_days: var_or("DEAD_LETTER_RETENTION_DAYS", 30i64)?,
            maintenance_interval: Duration::from_secs(var_or("MAINTENANCE_INTERVAL_SECS", 3600u64)?),
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: self.retry_base_delay,
            max_delay: self.retry_max_delay,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_policy_carries_configured_bounds() {
        let config = WorkerConfig {
            database_url: "postgres://localhost/relay".into(),
            poll_interval: Duration::from_millis(500),
            max_attempts: 3,
            retry_base_delay: Duration::from_secs(5),
            retry_max_delay: Duration::from_secs(60),
            idempotency_lock_ttl: Duration::from_secs(60),
            idempotency_retention_hours: 72.0,
            dead_letter_retention_days: 30,
            maintenance_interval: Duration::from_secs(3600),
        };

        let policy = config.retry_policy();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.backoff(1), Duration::from_secs(5));
        assert_eq!(policy.backoff(10), Duration::from_secs(60));
    }
}
