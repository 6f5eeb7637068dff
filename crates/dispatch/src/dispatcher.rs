//! The dispatcher: enqueue API and at-least-once consume loop.
//!
//! Enqueue validates against the registry and persists the descriptor;
//! consume claims leased deliveries, runs the idempotency guard for
//! registrations that demand it, invokes the handler inside a tracing
//! span, and classifies failures into retry, discard, or dead-letter.
//! Handler errors never cross the dispatcher boundary.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use relay_core::{JobDescriptor, RetryPolicy};

use crate::error::{EnqueueError, HandlerError, TransportError};
use crate::events::{JobEvent, JobEventBus, JobEventKind};
use crate::registry::{HandlerRegistry, JobContext};
use crate::transport::{
    Delivery, DeliveryToken, IdempotencyClaim, IdempotencyStore, QueueTransport,
};

/// Default sleep between claim attempts when the queue is empty.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Default time an in-flight delivery may hold an idempotency key before
/// a redelivery is allowed to re-acquire it.
const DEFAULT_IDEMPOTENCY_LOCK_TTL: Duration = Duration::from_secs(60);

/// Outcome of processing one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Handler succeeded; job acknowledged with its result.
    Completed,
    /// Idempotency record was already completed; delivery acknowledged
    /// without invoking the handler.
    DuplicateSkipped,
    /// Another in-flight delivery holds the idempotency key; redelivery
    /// scheduled without touching the retry budget's failure semantics.
    Deferred,
    /// Transient failure with budget left; redelivery scheduled.
    Retried,
    /// Non-retryable failure; acknowledged, not dead-lettered.
    Discarded,
    /// Retry budget exhausted (or no handler in this process); descriptor
    /// moved to the dead-letter store.
    DeadLettered,
}

/// Durable job dispatcher.
///
/// Shared via `Arc`; holds no locks of its own, so any number of consume
/// loops may run concurrently against the same transport.
pub struct Dispatcher {
    registry: Arc<HandlerRegistry>,
    transport: Arc<dyn QueueTransport>,
    idempotency: Arc<dyn IdempotencyStore>,
    policy: RetryPolicy,
    events: Arc<JobEventBus>,
    poll_interval: Duration,
    idempotency_lock_ttl: Duration,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<HandlerRegistry>,
        transport: Arc<dyn QueueTransport>,
        idempotency: Arc<dyn IdempotencyStore>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            registry,
            transport,
            idempotency,
            policy,
            events: Arc::new(JobEventBus::default()),
            poll_interval: DEFAULT_POLL_INTERVAL,
            idempotency_lock_ttl: DEFAULT_IDEMPOTENCY_LOCK_TTL,
        }
    }

    /// Override the empty-queue poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Override the idempotency key lock TTL.
    pub fn with_idempotency_lock_ttl(mut self, ttl: Duration) -> Self {
        self.idempotency_lock_ttl = ttl;
        self
    }

    /// Lifecycle event bus for this dispatcher.
    pub fn events(&self) -> &JobEventBus {
        &self.events
    }

    // -----------------------------------------------------------------------
    // Enqueue
    // -----------------------------------------------------------------------

    /// Persist a descriptor on the durable queue.
    ///
    /// Fails with [`EnqueueError::UnknownJobKind`] when no handler is
    /// registered for the name — checked before any queue write.
    pub async fn enqueue(&self, descriptor: JobDescriptor) -> Result<DeliveryToken, EnqueueError> {
        if !self.registry.contains(&descriptor.name) {
            return Err(EnqueueError::UnknownJobKind(descriptor.name));
        }

        let token = self
            .transport
            .enqueue(&descriptor, self.policy.max_attempts)
            .await?;

        tracing::debug!(job = %descriptor.name, %token, "Job enqueued");
        self.events.publish(JobEvent::new(
            JobEventKind::Enqueued,
            descriptor.name,
            token.0,
            0,
        ));
        Ok(token)
    }

    /// Convenience enqueue: serialize `arguments` to the JSON wire form.
    ///
    /// A sequence (tuple, slice, `Vec`) becomes the argument list; any
    /// other shape becomes a single-argument list. Serialization failures
    /// surface synchronously as [`EnqueueError::Serialization`].
    pub async fn enqueue_args<A: Serialize>(
        &self,
        name: &str,
        arguments: A,
    ) -> Result<DeliveryToken, EnqueueError> {
        let encoded = serde_json::to_value(&arguments)?;
        let arguments = match encoded {
            serde_json::Value::Array(items) => items,
            other => vec![other],
        };
        let descriptor = JobDescriptor::new(name, arguments)?;
        self.enqueue(descriptor).await
    }

    /// Cancellation by omission: drop the job iff no consumer claimed it
    /// yet. Once claimed, a job runs to completion or failure.
    pub async fn cancel(&self, token: DeliveryToken) -> Result<bool, TransportError> {
        self.transport.cancel(token).await
    }

    // -----------------------------------------------------------------------
    // Consume
    // -----------------------------------------------------------------------

    /// Long-lived consume loop: claim, process, repeat.
    ///
    /// Sleeps for the poll interval when the queue is empty and exits when
    /// `shutdown` is cancelled. Multiple loops (tasks or processes) may
    /// run against the same queue; claims are leased, never shared.
    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::info!("Dispatcher consume loop starting");
        loop {
            if shutdown.is_cancelled() {
                break;
            }

            match self.transport.claim_next().await {
                Ok(Some(delivery)) => {
                    if let Err(e) = self.process_delivery(delivery).await {
                        tracing::error!(error = %e, "Delivery processing hit a transport error");
                    }
                }
                Ok(None) => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to claim next job");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                }
            }
        }
        tracing::info!("Dispatcher consume loop shutting down");
    }

    /// Process one claimed delivery to a terminal per-delivery outcome.
    ///
    /// The returned error covers transport/storage failures only; handler
    /// failures are classified internally and always yield an outcome.
    pub async fn process_delivery(
        &self,
        delivery: Delivery,
    ) -> Result<DeliveryOutcome, TransportError> {
        let descriptor = &delivery.descriptor;

        let Some(registration) = self.registry.get(&descriptor.name) else {
            // Registry drift across processes: this process can never run
            // the job, and that will not change without a restart.
            tracing::error!(
                job = %descriptor.name,
                token = %delivery.token,
                "No handler registered for delivered job; dead-lettering"
            );
            self.transport
                .dead_letter(&delivery, "no handler registered")
                .await?;
            self.publish(JobEventKind::DeadLettered, &delivery, None);
            return Ok(DeliveryOutcome::DeadLettered);
        };

        let category = registration.feature_category.clone();

        // Idempotency guard, mandatory for registrations that declare it.
        // Exactly one concurrent delivery of a key acquires it; the rest
        // are skipped or deferred.
        if registration.idempotent {
            match self
                .idempotency
                .begin(&descriptor.idempotency_key, self.idempotency_lock_ttl)
                .await?
            {
                IdempotencyClaim::Acquired => {}
                IdempotencyClaim::Completed => {
                    tracing::info!(
                        job = %descriptor.name,
                        token = %delivery.token,
                        idempotency_key = %descriptor.idempotency_key,
                        "Duplicate delivery of completed job; skipping"
                    );
                    self.transport
                        .complete(&delivery, &serde_json::Value::Null)
                        .await?;
                    self.publish(JobEventKind::DuplicateSkipped, &delivery, Some(&category));
                    return Ok(DeliveryOutcome::DuplicateSkipped);
                }
                IdempotencyClaim::InProgress => {
                    tracing::debug!(
                        job = %descriptor.name,
                        token = %delivery.token,
                        idempotency_key = %descriptor.idempotency_key,
                        "Idempotency key held by another delivery; deferring"
                    );
                    self.transport
                        .schedule_retry(
                            &delivery,
                            "idempotency key held by another in-flight delivery",
                            self.policy.base_delay,
                        )
                        .await?;
                    self.publish(JobEventKind::Retried, &delivery, Some(&category));
                    return Ok(DeliveryOutcome::Deferred);
                }
            }
        }

        let ctx = JobContext {
            job_name: descriptor.name.clone(),
            token: delivery.token.0,
            attempt: delivery.attempt,
            feature_category: category.clone(),
        };

        let span = tracing::info_span!(
            "job",
            name = %ctx.job_name,
            token = %ctx.token,
            attempt = ctx.attempt,
            category = %ctx.feature_category,
        );

        self.publish(JobEventKind::Started, &delivery, Some(&category));

        let handler = registration.handler();
        let result = handler
            .perform(&ctx, &descriptor.arguments)
            .instrument(span)
            .await;

        match result {
            Ok(value) => {
                if registration.idempotent {
                    self.idempotency
                        .mark_completed(&descriptor.idempotency_key)
                        .await?;
                }
                self.transport.complete(&delivery, &value).await?;
                tracing::info!(job = %descriptor.name, token = %delivery.token, "Job completed");
                self.publish(JobEventKind::Completed, &delivery, Some(&category));
                Ok(DeliveryOutcome::Completed)
            }
            Err(HandlerError::EntityNotFound { entity, id }) => {
                // Non-retryable by policy: the referenced entity is gone
                // and no number of retries brings it back. Acknowledge,
                // never dead-letter.
                if registration.idempotent {
                    self.idempotency
                        .release(&descriptor.idempotency_key)
                        .await?;
                }
                let reason = format!("entity not found: {entity} with id {id}");
                tracing::warn!(
                    job = %descriptor.name,
                    token = %delivery.token,
                    %reason,
                    "Job discarded"
                );
                self.transport.discard(&delivery, &reason).await?;
                self.publish(JobEventKind::Discarded, &delivery, Some(&category));
                Ok(DeliveryOutcome::Discarded)
            }
            Err(HandlerError::Transient(reason)) => {
                if registration.idempotent {
                    self.idempotency
                        .release(&descriptor.idempotency_key)
                        .await?;
                }
                if self.policy.allows_retry(delivery.attempt) {
                    let delay = self.policy.backoff(delivery.attempt);
                    tracing::warn!(
                        job = %descriptor.name,
                        token = %delivery.token,
                        attempt = delivery.attempt,
                        delay_secs = delay.as_secs(),
                        error = %reason,
                        "Job failed; retry scheduled"
                    );
                    self.transport
                        .schedule_retry(&delivery, &reason, delay)
                        .await?;
                    self.publish(JobEventKind::Retried, &delivery, Some(&category));
                    Ok(DeliveryOutcome::Retried)
                } else {
                    tracing::error!(
                        job = %descriptor.name,
                        token = %delivery.token,
                        attempts = delivery.attempt,
                        error = %reason,
                        "Retry budget exhausted; dead-lettering"
                    );
                    self.transport.dead_letter(&delivery, &reason).await?;
                    self.publish(JobEventKind::DeadLettered, &delivery, Some(&category));
                    Ok(DeliveryOutcome::DeadLettered)
                }
            }
        }
    }

    fn publish(&self, kind: JobEventKind, delivery: &Delivery, category: Option<&str>) {
        let mut event = JobEvent::new(
            kind,
            delivery.descriptor.name.clone(),
            delivery.token.0,
            delivery.attempt,
        );
        if let Some(category) = category {
            event = event.with_category(category);
        }
        self.events.publish(event);
    }
}
