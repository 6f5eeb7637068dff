//! In-process job lifecycle event bus backed by `tokio::sync::broadcast`.
//!
//! [`JobEventBus`] is the observability hub for the dispatch engine: every
//! enqueue and every delivery outcome is published as a [`JobEvent`].
//! Designed to be shared via `Arc<JobEventBus>`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// JobEvent
// ---------------------------------------------------------------------------

/// Lifecycle transition of a dispatched job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobEventKind {
    Enqueued,
    Started,
    Completed,
    Retried,
    Discarded,
    DeadLettered,
    DuplicateSkipped,
}

impl JobEventKind {
    /// Wire name of the event kind, e.g. for websocket fan-out.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Enqueued => "job_enqueued",
            Self::Started => "job_started",
            Self::Completed => "job_completed",
            Self::Retried => "job_retried",
            Self::Discarded => "job_discarded",
            Self::DeadLettered => "job_dead_lettered",
            Self::DuplicateSkipped => "job_duplicate_skipped",
        }
    }
}

/// A job lifecycle event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEvent {
    pub kind: JobEventKind,

    /// Name the job was enqueued under.
    pub job_name: String,

    /// Delivery token of the job.
    pub token: Uuid,

    /// Delivery attempt the event refers to (0 for enqueue).
    pub attempt: u32,

    /// Feature category of the handler registration, when resolved.
    pub feature_category: Option<String>,

    /// When the event was created (UTC).
    pub timestamp: DateTime<Utc>,
}

impl JobEvent {
    pub fn new(kind: JobEventKind, job_name: impl Into<String>, token: Uuid, attempt: u32) -> Self {
        Self {
            kind,
            job_name: job_name.into(),
            token,
            attempt,
            feature_category: None,
            timestamp: Utc::now(),
        }
    }

    /// Attach the handler's feature category.
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.feature_category = Some(category.into());
        self
    }
}

// ---------------------------------------------------------------------------
// JobEventBus
// ---------------------------------------------------------------------------

/// Default buffer capacity for the broadcast channel.
const DEFAULT_CAPACITY: usize = 1024;

/// In-process fan-out bus for [`JobEvent`]s.
pub struct JobEventBus {
    sender: broadcast::Sender<JobEvent>,
}

impl JobEventBus {
    /// Create a bus with a specific channel capacity.
    ///
    /// When the buffer is full, the oldest un-consumed messages are
    /// dropped and slow receivers observe a `RecvError::Lagged`.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all current subscribers.
    ///
    /// If there are no active subscribers the event is silently dropped;
    /// the durable record of the outcome lives on the job row itself.
    pub fn publish(&self, event: JobEvent) {
        // Ignore the SendError — it only means there are zero receivers.
        let _ = self.sender.send(event);
    }

    /// Subscribe to all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }
}

impl Default for JobEventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = JobEventBus::default();
        let mut rx = bus.subscribe();

        let token = Uuid::now_v7();
        bus.publish(
            JobEvent::new(JobEventKind::Enqueued, "create_snapshot", token, 0)
                .with_category("devops_reports"),
        );

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, JobEventKind::Enqueued);
        assert_eq!(event.kind.as_str(), "job_enqueued");
        assert_eq!(event.token, token);
        assert_eq!(event.feature_category.as_deref(), Some("devops_reports"));
    }

    #[test]
    fn publish_without_subscribers_is_a_noop() {
        let bus = JobEventBus::new(4);
        bus.publish(JobEvent::new(
            JobEventKind::Completed,
            "export_csv",
            Uuid::now_v7(),
            1,
        ));
    }
}
