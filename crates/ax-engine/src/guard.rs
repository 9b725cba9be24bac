use std::sync::Arc;

use ax_core::error::{ExecutionError, Result};
use ax_core::store::ExecutionStore;
use ax_core::types::{
    CommittedTransition, ExecutionRecord, ExecutionState, StateChange, TimestampPatch,
};
use chrono::Utc;
use uuid::Uuid;

use crate::events::EventNotifier;

/// Validates and commits lifecycle transitions.
///
/// Commits go through the store's compare-and-swap on the state column, so
/// of two callers that read the same state only one can win; the loser gets
/// [`ExecutionError::ConcurrentModification`]. The history row is written in
/// the same commit as the state.
#[derive(Clone)]
pub struct StateTransitionGuard {
    store: Arc<dyn ExecutionStore>,
    notifier: EventNotifier,
}

impl StateTransitionGuard {
    pub fn new(store: Arc<dyn ExecutionStore>, notifier: EventNotifier) -> Self {
        Self { store, notifier }
    }

    /// Move execution `id` to `target`.
    ///
    /// Requesting the current state returns the record unchanged without
    /// writing history or emitting events.
    pub async fn change_state(
        &self,
        id: Uuid,
        target: ExecutionState,
        reason: &str,
    ) -> Result<ExecutionRecord> {
        let current = self
            .store
            .get(id)
            .await?
            .ok_or(ExecutionError::NotFound(id))?;
        let from = current.state;

        if from == target {
            tracing::debug!(execution_id = %id, state = %from, "same-state transition ignored");
            return Ok(current);
        }
        if !from.can_transition_to(target) {
            return Err(ExecutionError::InvalidStateTransition {
                current: from,
                requested: target,
            });
        }

        let now = Utc::now();
        let timestamps = TimestampPatch {
            started_at: (target == ExecutionState::Running && current.started_at.is_none())
                .then_some(now),
            completed_at: target.is_terminal().then_some(now),
        };
        let change = StateChange::new(from, target, reason).with_timestamps(timestamps);

        let committed = self
            .store
            .update_state(id, change)
            .await?
            .ok_or(ExecutionError::ConcurrentModification { id, expected: from })?;
        Ok(self.announce(committed).await)
    }

    /// FAILED -> QUEUED for a retry, bumping `retry_count` in the same write.
    ///
    /// Of two concurrent retries only one commits; the other gets
    /// [`ExecutionError::ConcurrentModification`] and the count moves by one.
    pub async fn requeue_failed(&self, id: Uuid) -> Result<ExecutionRecord> {
        let current = self
            .store
            .get(id)
            .await?
            .ok_or(ExecutionError::NotFound(id))?;
        if current.state != ExecutionState::Failed {
            return Err(ExecutionError::InvalidStateTransition {
                current: current.state,
                requested: ExecutionState::Queued,
            });
        }

        let reason = format!("retry {}", current.retry_count + 1);
        let committed = self
            .store
            .requeue_failed(id, current.retry_count, &reason)
            .await?
            .ok_or(ExecutionError::ConcurrentModification {
                id,
                expected: ExecutionState::Failed,
            })?;
        Ok(self.announce(committed).await)
    }

    async fn announce(&self, committed: CommittedTransition) -> ExecutionRecord {
        let CommittedTransition { record, transition } = committed;
        let from = transition.previous_state.unwrap_or(transition.new_state);
        tracing::info!(
            execution_id = %record.id,
            from = %from,
            to = %transition.new_state,
            reason = %transition.reason,
            "state changed"
        );

        self.notifier
            .emit_state_changed(&record, from, &transition.reason)
            .await;
        if transition.new_state.is_terminal() {
            self.notifier.emit_completed(&record).await;
        }
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use ax_core::store::SqliteExecutionStore;

    async fn guard_with(state: ExecutionState) -> (StateTransitionGuard, Arc<dyn ExecutionStore>, Uuid) {
        let store: Arc<dyn ExecutionStore> =
            Arc::new(SqliteExecutionStore::new_in_memory().await.unwrap());
        let mut record = ExecutionRecord::new(Uuid::new_v4(), "t");
        record.state = state;
        store.insert(&record).await.unwrap();
        let guard = StateTransitionGuard::new(
            Arc::clone(&store),
            EventNotifier::new(Arc::new(EventBus::new())),
        );
        (guard, store, record.id)
    }

    #[tokio::test]
    async fn unknown_id_is_not_found() {
        let (guard, _, _) = guard_with(ExecutionState::Queued).await;
        let err = guard
            .change_state(Uuid::new_v4(), ExecutionState::Preparing, "x")
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::NotFound(_)));
    }

    #[tokio::test]
    async fn same_state_is_a_silent_no_op() {
        let (guard, store, id) = guard_with(ExecutionState::Running).await;
        let record = guard
            .change_state(id, ExecutionState::Running, "again")
            .await
            .unwrap();
        assert_eq!(record.state, ExecutionState::Running);
        assert!(store.history(id, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn requeue_needs_failed_and_counts_once() {
        let (guard, store, id) = guard_with(ExecutionState::Running).await;
        let err = guard.requeue_failed(id).await.unwrap_err();
        assert!(matches!(
            err,
            ExecutionError::InvalidStateTransition {
                current: ExecutionState::Running,
                requested: ExecutionState::Queued,
            }
        ));

        guard.change_state(id, ExecutionState::Failed, "boom").await.unwrap();
        let record = guard.requeue_failed(id).await.unwrap();
        assert_eq!(record.state, ExecutionState::Queued);
        assert_eq!(record.retry_count, 1);
        assert_eq!(store.history(id, 1).await.unwrap()[0].reason, "retry 1");
    }

    #[tokio::test]
    async fn failed_does_not_stamp_completed() {
        let (guard, _, id) = guard_with(ExecutionState::Running).await;
        let record = guard
            .change_state(id, ExecutionState::Failed, "boom")
            .await
            .unwrap();
        assert!(record.completed_at.is_none());
    }
}
