//! End-to-end tests for the dispatch engine over the in-memory backend.
//!
//! The memory transport honors the same at-least-once, leased-delivery
//! contract as the Postgres backend, so these tests exercise the full
//! enqueue / claim / guard / classify path without a database.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use serde_json::json;

use relay_core::{JobDescriptor, RetryPolicy};
use relay_db::models::{IdempotencyStatus, JobStatus};
use relay_dispatch::memory::{MemoryIdempotencyStore, MemoryQueue};
use relay_dispatch::{
    DeliveryOutcome, Dispatcher, EnqueueError, FnHandler, HandlerError, HandlerRegistry,
    JobHandler, TransportError,
};

/// Retry immediately and give up quickly; tests drive the clock.
fn test_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_delay: Duration::ZERO,
        max_delay: Duration::ZERO,
    }
}

struct Harness {
    dispatcher: Dispatcher,
    queue: Arc<MemoryQueue>,
    store: Arc<MemoryIdempotencyStore>,
}

fn harness(registry: HandlerRegistry, policy: RetryPolicy) -> Harness {
    let queue = Arc::new(MemoryQueue::new());
    let store = Arc::new(MemoryIdempotencyStore::new());
    let dispatcher = Dispatcher::new(
        Arc::new(registry),
        queue.clone(),
        store.clone(),
        policy,
    );
    Harness {
        dispatcher,
        queue,
        store,
    }
}

/// Handler that counts invocations of its side effect.
fn counting_handler(counter: Arc<AtomicUsize>) -> Arc<dyn JobHandler> {
    Arc::new(FnHandler::new(move |_ctx, _args| {
        let counter = counter.clone();
        Box::pin(async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(json!({"ok": true}))
        })
    }))
}

/// Drive the consume side until the queue has nothing due.
async fn drain(h: &Harness) -> Vec<DeliveryOutcome> {
    let mut outcomes = Vec::new();
    use relay_dispatch::QueueTransport;
    while let Some(delivery) = h.queue.claim_next().await.unwrap() {
        outcomes.push(h.dispatcher.process_delivery(delivery).await.unwrap());
    }
    outcomes
}

// ---------------------------------------------------------------------------
// Enqueue
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unknown_job_kind_is_rejected_without_queue_write() {
    let h = harness(HandlerRegistry::new(), test_policy(3));

    let descriptor = JobDescriptor::new("not_registered", vec![json!(1)]).unwrap();
    let err = h.dispatcher.enqueue(descriptor).await.unwrap_err();

    assert_matches!(err, EnqueueError::UnknownJobKind(name) if name == "not_registered");
    assert_eq!(h.queue.job_count(), 0);
}

#[tokio::test]
async fn unserializable_arguments_are_rejected() {
    let mut registry = HandlerRegistry::new();
    registry
        .register(
            "export_csv",
            "importers",
            false,
            counting_handler(Arc::new(AtomicUsize::new(0))),
        )
        .unwrap();
    let h = harness(registry, test_policy(3));

    // Maps with non-string keys have no JSON encoding.
    let bad: std::collections::HashMap<(i32, i32), i32> =
        [((1, 2), 3)].into_iter().collect();
    let err = h.dispatcher.enqueue_args("export_csv", bad).await.unwrap_err();

    assert_matches!(err, EnqueueError::Serialization(_));
    assert_eq!(h.queue.job_count(), 0);
}

#[tokio::test]
async fn enqueue_args_wraps_scalar_into_sequence() {
    let counter = Arc::new(AtomicUsize::new(0));
    let mut registry = HandlerRegistry::new();
    registry
        .register("approve_blocked_users", "authentication_and_authorization", true, {
            let counter = counter.clone();
            Arc::new(FnHandler::new(move |_ctx, args| {
                let counter = counter.clone();
                Box::pin(async move {
                    assert_eq!(args, vec![json!(42)]);
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(json!(null))
                })
            }))
        })
        .unwrap();
    let h = harness(registry, test_policy(3));

    h.dispatcher
        .enqueue_args("approve_blocked_users", 42)
        .await
        .unwrap();
    let outcomes = drain(&h).await;

    assert_eq!(outcomes, vec![DeliveryOutcome::Completed]);
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

// ---------------------------------------------------------------------------
// Idempotence
// ---------------------------------------------------------------------------

#[tokio::test]
async fn duplicate_delivery_executes_side_effect_at_most_once() {
    let counter = Arc::new(AtomicUsize::new(0));
    let mut registry = HandlerRegistry::new();
    registry
        .register("create_snapshot", "devops_reports", true, counting_handler(counter.clone()))
        .unwrap();
    let h = harness(registry, test_policy(3));

    // The same logical job enqueued twice derives the same key.
    let first = JobDescriptor::new("create_snapshot", vec![json!({"segment_id": 7})]).unwrap();
    let second = first.clone();
    assert_eq!(first.idempotency_key, second.idempotency_key);

    h.dispatcher.enqueue(first).await.unwrap();
    h.dispatcher.enqueue(second).await.unwrap();

    let outcomes = drain(&h).await;
    assert_eq!(
        outcomes,
        vec![DeliveryOutcome::Completed, DeliveryOutcome::DuplicateSkipped]
    );
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn concurrent_deliveries_of_same_key_execute_once() {
    let counter = Arc::new(AtomicUsize::new(0));
    let mut registry = HandlerRegistry::new();
    registry
        .register("create_snapshot", "devops_reports", true, {
            let counter = counter.clone();
            Arc::new(FnHandler::new(move |_ctx, _args| {
                let counter = counter.clone();
                Box::pin(async move {
                    // Hold the key long enough for the sibling delivery
                    // to hit the guard while this one is in flight.
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(json!(null))
                })
            }))
        })
        .unwrap();
    let h = harness(registry, test_policy(5));

    let descriptor = JobDescriptor::new("create_snapshot", vec![json!({"segment_id": 7})]).unwrap();
    h.dispatcher.enqueue(descriptor.clone()).await.unwrap();
    h.dispatcher.enqueue(descriptor).await.unwrap();

    use relay_dispatch::QueueTransport;
    let a = h.queue.claim_next().await.unwrap().unwrap();
    let b = h.queue.claim_next().await.unwrap().unwrap();

    let (ra, rb) = tokio::join!(
        h.dispatcher.process_delivery(a),
        h.dispatcher.process_delivery(b),
    );
    let mut outcomes = vec![ra.unwrap(), rb.unwrap()];
    outcomes.sort_by_key(|o| format!("{o:?}"));

    assert_eq!(outcomes, vec![DeliveryOutcome::Completed, DeliveryOutcome::Deferred]);
    assert_eq!(counter.load(Ordering::SeqCst), 1);

    // The deferred delivery comes back and is skipped as a duplicate.
    let outcomes = drain(&h).await;
    assert_eq!(outcomes, vec![DeliveryOutcome::DuplicateSkipped]);
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn noop_handler_run_still_marks_record_completed() {
    // Mirrors approving user 42 when the user is not pending approval:
    // the handler changes nothing but completes successfully.
    let mut registry = HandlerRegistry::new();
    registry
        .register(
            "approve_blocked_users",
            "authentication_and_authorization",
            true,
            Arc::new(FnHandler::new(|_ctx, _args| {
                Box::pin(async { Ok(json!({"approved": 0})) })
            })),
        )
        .unwrap();
    let h = harness(registry, test_policy(3));

    let descriptor = JobDescriptor::new("approve_blocked_users", vec![json!(42)]).unwrap();
    let key = descriptor.idempotency_key.clone();
    let token = h.dispatcher.enqueue(descriptor).await.unwrap();

    let outcomes = drain(&h).await;
    assert_eq!(outcomes, vec![DeliveryOutcome::Completed]);
    assert_eq!(h.store.status(&key), Some(IdempotencyStatus::Completed));
    assert_eq!(h.queue.job_result(token), Some(json!({"approved": 0})));
}

// ---------------------------------------------------------------------------
// Failure classification
// ---------------------------------------------------------------------------

#[tokio::test]
async fn transient_failure_is_retried_then_dead_lettered_exactly_once() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let mut registry = HandlerRegistry::new();
    registry
        .register("create_snapshot", "devops_reports", false, {
            let attempts = attempts.clone();
            Arc::new(FnHandler::new(move |_ctx, _args| {
                let attempts = attempts.clone();
                Box::pin(async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err(HandlerError::transient("upstream unavailable"))
                })
            }))
        })
        .unwrap();
    let h = harness(registry, test_policy(3));

    let token = h
        .dispatcher
        .enqueue_args("create_snapshot", (json!({"segment_id": 7}),))
        .await
        .unwrap();

    let outcomes = drain(&h).await;
    assert_eq!(
        outcomes,
        vec![
            DeliveryOutcome::Retried,
            DeliveryOutcome::Retried,
            DeliveryOutcome::DeadLettered,
        ]
    );
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(h.queue.job_status(token), Some(JobStatus::DeadLettered));

    // Exactly one letter, original arguments intact.
    use relay_dispatch::QueueTransport;
    let letters = h.queue.dead_letters(10, 0).await.unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].job_name, "create_snapshot");
    assert_eq!(letters[0].arguments, json!([{"segment_id": 7}]));
    assert_eq!(letters[0].attempts, 3);
    assert_eq!(letters[0].failure_reason, "upstream unavailable");
}

#[tokio::test]
async fn entity_not_found_is_acknowledged_without_dead_letter() {
    let mut registry = HandlerRegistry::new();
    registry
        .register(
            "approve_blocked_users",
            "authentication_and_authorization",
            true,
            Arc::new(FnHandler::new(|_ctx, _args| {
                Box::pin(async {
                    Err(HandlerError::EntityNotFound {
                        entity: "user",
                        id: 42,
                    })
                })
            })),
        )
        .unwrap();
    let h = harness(registry, test_policy(3));

    let token = h
        .dispatcher
        .enqueue_args("approve_blocked_users", 42)
        .await
        .unwrap();

    let outcomes = drain(&h).await;
    assert_eq!(outcomes, vec![DeliveryOutcome::Discarded]);
    assert_eq!(h.queue.job_status(token), Some(JobStatus::Discarded));
    assert_eq!(h.queue.dead_letter_count(), 0);
}

#[tokio::test]
async fn failed_idempotent_job_can_execute_on_redelivery() {
    // First attempt fails transiently; the key must be released so the
    // retry can acquire it and run the handler again.
    let attempts = Arc::new(AtomicUsize::new(0));
    let mut registry = HandlerRegistry::new();
    registry
        .register("export_csv", "importers", true, {
            let attempts = attempts.clone();
            Arc::new(FnHandler::new(move |_ctx, _args| {
                let attempts = attempts.clone();
                Box::pin(async move {
                    if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(HandlerError::transient("flaky storage"))
                    } else {
                        Ok(json!("written"))
                    }
                })
            }))
        })
        .unwrap();
    let h = harness(registry, test_policy(3));

    let token = h.dispatcher.enqueue_args("export_csv", (17,)).await.unwrap();

    let outcomes = drain(&h).await;
    assert_eq!(outcomes, vec![DeliveryOutcome::Retried, DeliveryOutcome::Completed]);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_eq!(h.queue.job_status(token), Some(JobStatus::Completed));
}

// ---------------------------------------------------------------------------
// Cancellation and dead-letter administration
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancel_only_applies_to_unclaimed_jobs() {
    let mut registry = HandlerRegistry::new();
    registry
        .register(
            "export_csv",
            "importers",
            false,
            counting_handler(Arc::new(AtomicUsize::new(0))),
        )
        .unwrap();
    let h = harness(registry, test_policy(3));

    let token = h.dispatcher.enqueue_args("export_csv", (1,)).await.unwrap();
    assert!(h.dispatcher.cancel(token).await.unwrap());
    assert_eq!(h.queue.job_status(token), Some(JobStatus::Cancelled));

    // A claimed job can no longer be cancelled.
    let token = h.dispatcher.enqueue_args("export_csv", (2,)).await.unwrap();
    use relay_dispatch::QueueTransport;
    let delivery = h.queue.claim_next().await.unwrap().unwrap();
    assert!(!h.dispatcher.cancel(token).await.unwrap());
    h.dispatcher.process_delivery(delivery).await.unwrap();
    assert_eq!(h.queue.job_status(token), Some(JobStatus::Completed));
}

#[tokio::test]
async fn dead_letter_can_be_requeued_with_original_descriptor() {
    let succeed = Arc::new(AtomicUsize::new(0));
    let mut registry = HandlerRegistry::new();
    registry
        .register("create_snapshot", "devops_reports", false, {
            let succeed = succeed.clone();
            Arc::new(FnHandler::new(move |_ctx, args| {
                let succeed = succeed.clone();
                Box::pin(async move {
                    if succeed.load(Ordering::SeqCst) == 0 {
                        Err(HandlerError::transient("still broken"))
                    } else {
                        Ok(json!({"snapshot_for": args[0].clone()}))
                    }
                })
            }))
        })
        .unwrap();
    let h = harness(registry, test_policy(1));

    h.dispatcher
        .enqueue_args("create_snapshot", (7,))
        .await
        .unwrap();
    let outcomes = drain(&h).await;
    assert_eq!(outcomes, vec![DeliveryOutcome::DeadLettered]);

    use relay_dispatch::QueueTransport;
    let letters = h.queue.dead_letters(10, 0).await.unwrap();
    assert_eq!(letters.len(), 1);

    // Operator fixes the underlying issue and requeues.
    succeed.store(1, Ordering::SeqCst);
    let token = h.queue.requeue_dead_letter(letters[0].id, 3).await.unwrap();
    assert_eq!(h.queue.dead_letter_count(), 0);

    let outcomes = drain(&h).await;
    assert_eq!(outcomes, vec![DeliveryOutcome::Completed]);
    assert_eq!(h.queue.job_result(token), Some(json!({"snapshot_for": 7})));
}

// ---------------------------------------------------------------------------
// Lease guarding and retention
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stale_lease_cannot_clobber_a_redelivered_job() {
    use relay_dispatch::QueueTransport;

    let queue = MemoryQueue::new();
    let descriptor = JobDescriptor::new("export_csv", vec![json!(1)]).unwrap();
    let token = queue.enqueue(&descriptor, 3).await.unwrap();

    // First consumer claims the job, then fails and hands it back; the
    // redelivery rotates the lease.
    let first = queue.claim_next().await.unwrap().unwrap();
    queue
        .schedule_retry(&first, "consumer presumed dead", Duration::ZERO)
        .await
        .unwrap();
    let second = queue.claim_next().await.unwrap().unwrap();
    assert_ne!(first.lease_id, second.lease_id);

    // The original consumer wakes up and tries to acknowledge with its
    // stale lease; every mutation is rejected and the row is untouched.
    assert_matches!(
        queue.complete(&first, &json!("stale")).await,
        Err(TransportError::StaleLease { .. })
    );
    assert_matches!(
        queue.dead_letter(&first, "stale").await,
        Err(TransportError::StaleLease { .. })
    );
    assert_eq!(queue.dead_letter_count(), 0);
    assert_eq!(queue.job_status(token), Some(JobStatus::Running));

    // The live claim still acknowledges cleanly.
    queue.complete(&second, &json!("fresh")).await.unwrap();
    assert_eq!(queue.job_status(token), Some(JobStatus::Completed));
    assert_eq!(queue.job_result(token), Some(json!("fresh")));
}

#[tokio::test]
async fn sweep_removes_only_records_past_retention() {
    use relay_dispatch::IdempotencyStore;

    let store = MemoryIdempotencyStore::new();
    store.begin("done", Duration::from_secs(60)).await.unwrap();
    store.mark_completed("done").await.unwrap();
    store.begin("live", Duration::from_secs(60)).await.unwrap();

    // Push the completed record past the 72h retention window.
    store.age_record("done", chrono::Duration::hours(100));

    let removed = store.sweep_expired(72.0).await.unwrap();
    assert_eq!(removed, 1);
    assert_eq!(store.status("done"), None);
    assert_eq!(store.status("live"), Some(IdempotencyStatus::Pending));
    assert_eq!(store.record_count(), 1);
}

// ---------------------------------------------------------------------------
// Lifecycle events
// ---------------------------------------------------------------------------

#[tokio::test]
async fn lifecycle_events_are_published_in_order() {
    use relay_dispatch::JobEventKind;

    let mut registry = HandlerRegistry::new();
    registry
        .register(
            "create_snapshot",
            "devops_reports",
            true,
            counting_handler(Arc::new(AtomicUsize::new(0))),
        )
        .unwrap();
    let h = harness(registry, test_policy(3));
    let mut rx = h.dispatcher.events().subscribe();

    h.dispatcher
        .enqueue_args("create_snapshot", (7,))
        .await
        .unwrap();
    drain(&h).await;

    let kinds: Vec<JobEventKind> = [rx.recv().await, rx.recv().await, rx.recv().await]
        .into_iter()
        .map(|e| e.unwrap().kind)
        .collect();
    assert_eq!(
        kinds,
        vec![
            JobEventKind::Enqueued,
            JobEventKind::Started,
            JobEventKind::Completed,
        ]
    );
}
