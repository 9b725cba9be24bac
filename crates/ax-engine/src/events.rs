use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ax_core::types::{ExecutionRecord, ExecutionState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::collaborators::CollaboratorError;

pub const TOPIC_STATE_CHANGED: &str = "execution.state_changed";
pub const TOPIC_PROGRESS: &str = "execution.progress";
pub const TOPIC_COMPLETED: &str = "execution.completed";
pub const TOPIC_DELETED: &str = "execution.deleted";

// ---------------------------------------------------------------------------
// EventSink
// ---------------------------------------------------------------------------

/// Fire-and-forget transport for lifecycle notifications.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, topic: &str, payload: Value) -> Result<(), CollaboratorError>;
}

/// Envelope delivered to [`EventBus`] subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub topic: String,
    pub payload: Value,
    pub emitted_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// In-process broadcast sink built on flume channels.
///
/// Every subscriber receives all events published after it subscribed.
/// Subscribers whose receivers were dropped are pruned on the next publish.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<Vec<flume::Sender<LifecycleEvent>>>>,
}

impl EventBus {
    /// Create a new, empty event bus with no subscribers.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Register a new subscriber and return its receiving end.
    ///
    /// The channel is unbounded; events published before this call are not
    /// replayed.
    pub fn subscribe(&self) -> flume::Receiver<LifecycleEvent> {
        let (tx, rx) = flume::unbounded();
        let mut senders = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        senders.push(tx);
        rx
    }

    /// Send `event` to every live subscriber, dropping disconnected ones.
    pub fn broadcast(&self, event: LifecycleEvent) {
        let mut senders = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        senders.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Number of subscribers still registered. Dropped receivers are only
    /// counted until the next broadcast.
    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventSink for EventBus {
    async fn publish(&self, topic: &str, payload: Value) -> Result<(), CollaboratorError> {
        self.broadcast(LifecycleEvent {
            topic: topic.to_string(),
            payload,
            emitted_at: Utc::now(),
        });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// EventNotifier
// ---------------------------------------------------------------------------

/// Publishes lifecycle notifications. Delivery failures are logged and
/// swallowed; the store stays authoritative.
#[derive(Clone)]
pub struct EventNotifier {
    sink: Arc<dyn EventSink>,
}

impl EventNotifier {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self { sink }
    }

    pub async fn emit_state_changed(
        &self,
        record: &ExecutionRecord,
        previous: ExecutionState,
        reason: &str,
    ) {
        let payload = json!({
            "execution_id": record.id,
            "agent_id": record.agent_id,
            "task_id": record.task_id,
            "previous_state": previous,
            "new_state": record.state,
            "reason": reason,
            "progress_percentage": record.progress_percentage,
            "timestamp": record.updated_at,
        });
        self.send(TOPIC_STATE_CHANGED, payload).await;
    }

    pub async fn emit_progress_updated(&self, record: &ExecutionRecord) {
        let steps = record.step_progress();
        let payload = json!({
            "execution_id": record.id,
            "state": record.state,
            "progress_percentage": record.progress_percentage,
            "status_message": record.status_message,
            "completed_steps": steps.completed,
            "current_step": steps.current,
            "remaining_steps": steps.remaining,
            "timestamp": record.updated_at,
        });
        self.send(TOPIC_PROGRESS, payload).await;
    }

    /// No-op (with a warning) unless the record is terminal.
    pub async fn emit_completed(&self, record: &ExecutionRecord) {
        if !record.state.is_terminal() {
            tracing::warn!(
                execution_id = %record.id,
                state = %record.state,
                "completion event requested for non-terminal execution"
            );
            return;
        }
        let payload = json!({
            "execution_id": record.id,
            "agent_id": record.agent_id,
            "task_id": record.task_id,
            "state": record.state,
            "result": record.result,
            "error_message": record.error_message,
            "completed_at": record.completed_at,
        });
        self.send(TOPIC_COMPLETED, payload).await;
    }

    pub async fn emit_deleted(&self, snapshot: &ExecutionRecord) {
        let payload = json!({
            "execution_id": snapshot.id,
            "agent_id": snapshot.agent_id,
            "task_id": snapshot.task_id,
            "state": snapshot.state,
            "deleted_at": Utc::now(),
        });
        self.send(TOPIC_DELETED, payload).await;
    }

    async fn send(&self, topic: &str, payload: Value) {
        if let Err(e) = self.sink.publish(topic, payload).await {
            tracing::warn!(topic, error = %e, "failed to deliver lifecycle event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    struct BrokenSink;

    #[async_trait]
    impl EventSink for BrokenSink {
        async fn publish(&self, _topic: &str, _payload: Value) -> Result<(), CollaboratorError> {
            Err(CollaboratorError::Unavailable("sink down".into()))
        }
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let bus = EventBus::new();
        let rx1 = bus.subscribe();
        let rx2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        drop(rx2);
        bus.broadcast(LifecycleEvent {
            topic: TOPIC_PROGRESS.into(),
            payload: Value::Null,
            emitted_at: Utc::now(),
        });
        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(rx1.try_recv().unwrap().topic, TOPIC_PROGRESS);
    }

    #[tokio::test]
    async fn completed_is_skipped_for_non_terminal_records() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        let notifier = EventNotifier::new(Arc::new(bus));

        let mut record = ExecutionRecord::new(Uuid::new_v4(), "t");
        record.state = ExecutionState::Failed;
        notifier.emit_completed(&record).await;
        assert!(rx.try_recv().is_err());

        record.state = ExecutionState::Completed;
        notifier.emit_completed(&record).await;
        let event = rx.try_recv().unwrap();
        assert_eq!(event.topic, TOPIC_COMPLETED);
        assert_eq!(event.payload["state"], "completed");
    }

    #[tokio::test]
    async fn sink_failures_are_swallowed() {
        let notifier = EventNotifier::new(Arc::new(BrokenSink));
        let record = ExecutionRecord::new(Uuid::new_v4(), "t");
        notifier
            .emit_state_changed(&record, ExecutionState::Queued, "noop")
            .await;
        notifier.emit_deleted(&record).await;
    }
}
