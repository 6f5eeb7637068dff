use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use relay_dispatch::postgres::{PgIdempotencyStore, PgQueueTransport};
use relay_dispatch::{Dispatcher, HandlerRegistry, IdempotencyStore, QueueTransport};
use relay_worker::handlers::{
    register_maintenance_handlers, PURGE_DEAD_LETTERS, SWEEP_IDEMPOTENCY_RECORDS,
};
use relay_worker::WorkerConfig;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relay_worker=debug,relay_dispatch=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = WorkerConfig::from_env().expect("Invalid worker configuration");

    let pool = relay_db::create_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");
    tracing::info!("Database connection pool created");

    relay_db::MIGRATOR
        .run(&pool)
        .await
        .expect("Failed to run database migrations");
    tracing::info!("Database migrations applied");

    let transport: Arc<dyn QueueTransport> = Arc::new(PgQueueTransport::new(pool.clone()));
    let idempotency: Arc<dyn IdempotencyStore> = Arc::new(PgIdempotencyStore::new(pool));

    let mut registry = HandlerRegistry::new();
    register_maintenance_handlers(
        &mut registry,
        Arc::clone(&transport),
        Arc::clone(&idempotency),
        config.idempotency_retention_hours,
        config.dead_letter_retention_days,
    )
    .expect("Failed to register maintenance handlers");
    tracing::info!(handlers = registry.len(), "Handler registry built");

    let dispatcher = Arc::new(
        Dispatcher::new(
            Arc::new(registry),
            transport,
            idempotency,
            config.retry_policy(),
        )
        .with_poll_interval(config.poll_interval)
        .with_idempotency_lock_ttl(config.idempotency_lock_ttl),
    );

    let shutdown = CancellationToken::new();

    // Periodically enqueue the housekeeping jobs. They flow through the
    // same queue as application jobs, so retries and dead-lettering apply
    // to maintenance failures too.
    let maintenance = {
        let dispatcher = Arc::clone(&dispatcher);
        let shutdown = shutdown.clone();
        let interval = config.maintenance_interval;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                for job in [SWEEP_IDEMPOTENCY_RECORDS, PURGE_DEAD_LETTERS] {
                    if let Err(e) = dispatcher.enqueue_args(job, [(); 0]).await {
                        tracing::error!(job, error = %e, "Failed to enqueue maintenance job");
                    }
                }
            }
        })
    };

    let consume = {
        let dispatcher = Arc::clone(&dispatcher);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { dispatcher.run(shutdown).await })
    };

    tokio::signal::ctrl_c()
        .await
        .expect("Failed to listen for shutdown signal");
    tracing::info!("Shutdown signal received");
    shutdown.cancel();

    let _ = tokio::join!(consume, maintenance);
    tracing::info!("Worker stopped");
}
