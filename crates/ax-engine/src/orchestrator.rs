use std::sync::Arc;

use ax_core::config::RunnerConfig;
use ax_core::error::{ExecutionError, Result};
use ax_core::store::ExecutionStore;
use ax_core::types::{
    ExecutionFilter, ExecutionRecord, ExecutionState, ExecutionStateTransition, JsonMap,
    Pagination,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::collaborators::{AgentDirectory, ExecutionService, HumanInteraction};
use crate::events::{EventNotifier, EventSink};
use crate::guard::StateTransitionGuard;
use crate::progress::{ProgressTracker, ProgressUpdate};
use crate::supervisor::{BackgroundTaskSupervisor, SupervisorError};
use crate::task_runner::TaskRunner;

/// Reason recorded for executions found mid-flight at startup.
pub const RESTART_REASON: &str = "interrupted by orchestrator restart";

/// Outcome reported through [`ExecutionOrchestrator::submit_result`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStatus {
    Completed,
    Failed,
}

/// External services the orchestrator depends on.
pub struct Collaborators {
    pub events: Arc<dyn EventSink>,
    pub agents: Arc<dyn AgentDirectory>,
    pub executor: Arc<dyn ExecutionService>,
    /// `None` auto-approves every approval interjection.
    pub human: Option<Arc<dyn HumanInteraction>>,
}

// ---------------------------------------------------------------------------
// ExecutionOrchestrator
// ---------------------------------------------------------------------------

/// Public entry point of the execution lifecycle.
///
/// Owns one supervisor; every background activity it starts is torn down
/// by [`ExecutionOrchestrator::shutdown`].
pub struct ExecutionOrchestrator {
    store: Arc<dyn ExecutionStore>,
    guard: StateTransitionGuard,
    progress: ProgressTracker,
    notifier: EventNotifier,
    supervisor: Arc<BackgroundTaskSupervisor>,
    runner: Arc<TaskRunner>,
}

impl ExecutionOrchestrator {
    pub fn new(store: Arc<dyn ExecutionStore>, deps: Collaborators, settings: RunnerConfig) -> Self {
        let notifier = EventNotifier::new(deps.events);
        let guard = StateTransitionGuard::new(Arc::clone(&store), notifier.clone());
        let progress = ProgressTracker::new(Arc::clone(&store), notifier.clone());
        let supervisor = Arc::new(BackgroundTaskSupervisor::new(settings.cancel_grace()));

        let mut runner = TaskRunner::new(
            Arc::clone(&store),
            guard.clone(),
            progress.clone(),
            deps.agents,
            deps.executor,
            settings,
        );
        if let Some(human) = deps.human {
            runner = runner.with_human(human);
        }

        Self {
            store,
            guard,
            progress,
            notifier,
            supervisor,
            runner: Arc::new(runner),
        }
    }

    pub fn supervisor(&self) -> &BackgroundTaskSupervisor {
        &self.supervisor
    }

    /// Persist a new QUEUED execution.
    pub async fn enqueue(&self, record: ExecutionRecord) -> Result<ExecutionRecord> {
        if record.state != ExecutionState::Queued {
            return Err(ExecutionError::InvalidState {
                operation: "enqueue",
                current: record.state,
            });
        }
        self.store.insert(&record).await?;
        tracing::info!(execution_id = %record.id, agent_id = %record.agent_id, "execution queued");
        Ok(record)
    }

    /// QUEUED -> PREPARING, then launch the runner in the background.
    pub async fn start(&self, id: Uuid) -> Result<ExecutionRecord> {
        let current = self.get(id).await?;
        if current.state != ExecutionState::Queued {
            return Err(ExecutionError::InvalidStateTransition {
                current: current.state,
                requested: ExecutionState::Preparing,
            });
        }
        self.guard
            .change_state(id, ExecutionState::Preparing, "execution started")
            .await?;
        let record = self
            .progress
            .update_progress(id, ProgressUpdate::new(0.0).message("preparing execution"))
            .await?;

        let runner = Arc::clone(&self.runner);
        self.supervisor
            .start_task(id, move |token| async move { runner.run(id, token).await.map(|_| ()) })
            .await
            .map_err(|e| match e {
                SupervisorError::AlreadyRunning(id) => ExecutionError::ConcurrentModification {
                    id,
                    expected: ExecutionState::Preparing,
                },
            })?;
        Ok(record)
    }

    pub async fn pause(&self, id: Uuid, reason: &str) -> Result<ExecutionRecord> {
        self.guard.change_state(id, ExecutionState::Paused, reason).await
    }

    pub async fn resume(&self, id: Uuid) -> Result<ExecutionRecord> {
        self.guard
            .change_state(id, ExecutionState::Running, "execution resumed")
            .await
    }

    /// Stop background work, then move to CANCELLED. Cancelling a
    /// cancelled execution returns it unchanged.
    pub async fn cancel(&self, id: Uuid, reason: &str) -> Result<ExecutionRecord> {
        self.supervisor.cancel_task(id).await;
        self.guard.change_state(id, ExecutionState::Cancelled, reason).await
    }

    /// FAILED -> QUEUED with `retry_count + 1` in one write, then start again.
    pub async fn retry(&self, id: Uuid) -> Result<ExecutionRecord> {
        let current = self.get(id).await?;
        if current.state != ExecutionState::Failed {
            return Err(ExecutionError::InvalidStateTransition {
                current: current.state,
                requested: ExecutionState::Queued,
            });
        }
        // A failed run may still be unwinding.
        self.supervisor.cancel_task(id).await;

        let requeued = self.guard.requeue_failed(id).await?;
        tracing::info!(execution_id = %id, retry_count = requeued.retry_count, "retrying execution");
        self.start(id).await
    }

    /// Accept a result reported from outside the runner.
    pub async fn submit_result(
        &self,
        id: Uuid,
        status: SubmissionStatus,
        result: Option<JsonMap>,
        error_message: Option<String>,
        metadata: Option<JsonMap>,
    ) -> Result<ExecutionRecord> {
        let current = self.get(id).await?;
        if !matches!(current.state, ExecutionState::Running | ExecutionState::Paused) {
            return Err(ExecutionError::InvalidState {
                operation: "submit result",
                current: current.state,
            });
        }

        let error_message = match status {
            SubmissionStatus::Completed => error_message,
            SubmissionStatus::Failed => {
                Some(error_message.unwrap_or_else(|| "execution reported failure".into()))
            }
        };
        self.store
            .update_result(id, result, error_message.clone())
            .await?
            .ok_or(ExecutionError::NotFound(id))?;
        if let Some(metadata) = metadata {
            self.store
                .merge_context(id, metadata)
                .await?
                .ok_or(ExecutionError::NotFound(id))?;
        }

        match status {
            SubmissionStatus::Completed => {
                self.guard
                    .change_state(id, ExecutionState::Completed, "result submitted")
                    .await
            }
            SubmissionStatus::Failed => {
                let reason = error_message.unwrap_or_default();
                self.guard.change_state(id, ExecutionState::Failed, &reason).await
            }
        }
    }

    /// Cancel background work and remove the execution with its history.
    pub async fn delete(&self, id: Uuid) -> Result<bool> {
        self.supervisor.cancel_task(id).await;
        let Some(snapshot) = self.store.get(id).await? else {
            return Ok(false);
        };
        let removed = self.store.delete(id).await?;
        if removed {
            tracing::info!(execution_id = %id, "execution deleted");
            self.notifier.emit_deleted(&snapshot).await;
        }
        Ok(removed)
    }

    pub async fn get(&self, id: Uuid) -> Result<ExecutionRecord> {
        self.store.get(id).await?.ok_or(ExecutionError::NotFound(id))
    }

    pub async fn list(
        &self,
        filter: &ExecutionFilter,
        page: Pagination,
    ) -> Result<(Vec<ExecutionRecord>, u64)> {
        self.store.list(filter, page).await
    }

    pub async fn history(&self, id: Uuid, limit: usize) -> Result<Vec<ExecutionStateTransition>> {
        self.get(id).await?;
        self.store.history(id, limit).await
    }

    /// Fail executions left in flight by a previous process so they can be
    /// retried. Returns the ids that were moved to FAILED.
    pub async fn recover_interrupted(&self) -> Result<Vec<Uuid>> {
        let filter = ExecutionFilter::default().with_states([
            ExecutionState::Preparing,
            ExecutionState::Running,
            ExecutionState::Paused,
        ]);
        let mut recovered = Vec::new();
        loop {
            let (page, _) = self.store.list(&filter, Pagination::new(0, 100)).await?;
            let mut progressed = false;
            for record in page {
                if self.supervisor.is_tracked(record.id).await {
                    continue;
                }
                match self
                    .guard
                    .change_state(record.id, ExecutionState::Failed, RESTART_REASON)
                    .await
                {
                    Ok(_) => {
                        self.store
                            .update_result(record.id, None, Some(RESTART_REASON.into()))
                            .await?;
                        recovered.push(record.id);
                        progressed = true;
                    }
                    Err(ExecutionError::ConcurrentModification { .. }) => progressed = true,
                    Err(e) => return Err(e),
                }
            }
            if !progressed {
                break;
            }
        }
        if !recovered.is_empty() {
            tracing::warn!(count = recovered.len(), "recovered interrupted executions");
        }
        Ok(recovered)
    }

    /// Cancel every background activity this orchestrator started.
    pub async fn shutdown(&self) -> usize {
        let stopped = self.supervisor.cancel_all().await;
        tracing::info!(stopped, "orchestrator shut down");
        stopped
    }
}
