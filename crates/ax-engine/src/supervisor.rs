use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("background activity already running for execution {0}")]
    AlreadyRunning(Uuid),
}

pub type Result<T> = std::result::Result<T, SupervisorError>;

// ---------------------------------------------------------------------------
// TaskHandle
// ---------------------------------------------------------------------------

/// Caller-side view of a tracked background activity.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    pub execution_id: Uuid,
    pub generation: u64,
    token: CancellationToken,
}

impl TaskHandle {
    /// Whether cancellation was signalled to this activity.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

struct TrackedTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
    generation: u64,
}

// ---------------------------------------------------------------------------
// BackgroundTaskSupervisor
// ---------------------------------------------------------------------------

/// Owns the in-flight background activities, at most one per execution id.
///
/// Activities are cooperative: they receive a [`CancellationToken`] and are
/// expected to check it at their suspension points. A finished activity
/// removes its own entry; a later activity for the same id gets a new
/// generation so a late cleanup never evicts its successor.
pub struct BackgroundTaskSupervisor {
    tasks: Arc<Mutex<HashMap<Uuid, TrackedTask>>>,
    next_generation: AtomicU64,
    cancel_grace: Duration,
}

impl BackgroundTaskSupervisor {
    /// Create a supervisor that waits `cancel_grace` for an activity to
    /// acknowledge cancellation before aborting it.
    pub fn new(cancel_grace: Duration) -> Self {
        Self {
            tasks: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(1),
            cancel_grace,
        }
    }

    /// Spawn `activity` for execution `id`.
    ///
    /// Fails with [`SupervisorError::AlreadyRunning`] while an unfinished
    /// activity is tracked for `id`; a finished one is replaced. Errors from
    /// the activity are logged unless it was cancelled.
    pub async fn start_task<F, Fut, E>(&self, id: Uuid, activity: F) -> Result<TaskHandle>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = std::result::Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let mut tasks = self.tasks.lock().await;
        if let Some(existing) = tasks.get(&id) {
            if !existing.handle.is_finished() {
                return Err(SupervisorError::AlreadyRunning(id));
            }
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let fut = activity(token.clone());
        let registry = Arc::clone(&self.tasks);
        let observed = token.clone();

        let handle = tokio::spawn(async move {
            match fut.await {
                Ok(()) => tracing::debug!(execution_id = %id, "background activity finished"),
                Err(e) if observed.is_cancelled() => {
                    tracing::debug!(execution_id = %id, error = %e, "cancelled activity exited");
                }
                Err(e) => {
                    tracing::error!(execution_id = %id, error = %e, "background activity failed");
                }
            }
            let mut tasks = registry.lock().await;
            if tasks.get(&id).is_some_and(|t| t.generation == generation) {
                tasks.remove(&id);
            }
        });

        tasks.insert(
            id,
            TrackedTask {
                token: token.clone(),
                handle,
                generation,
            },
        );
        tracing::info!(execution_id = %id, generation, "background activity started");

        Ok(TaskHandle {
            execution_id: id,
            generation,
            token,
        })
    }

    /// Signal cancellation and wait for the activity to acknowledge it.
    ///
    /// Waits at most the configured grace period, then aborts. Returns
    /// `false` when nothing was tracked for `id`.
    pub async fn cancel_task(&self, id: Uuid) -> bool {
        let removed = self.tasks.lock().await.remove(&id);
        let Some(tracked) = removed else {
            return false;
        };
        self.stop(id, tracked).await;
        true
    }

    /// Handle of the activity tracked for `id`, finished or not.
    pub async fn get_task(&self, id: Uuid) -> Option<TaskHandle> {
        self.tasks.lock().await.get(&id).map(|t| TaskHandle {
            execution_id: id,
            generation: t.generation,
            token: t.token.clone(),
        })
    }

    /// Forget the activity for `id` without cancelling it.
    pub async fn clear_task(&self, id: Uuid) {
        self.tasks.lock().await.remove(&id);
    }

    /// Cancel every tracked activity. Returns how many were stopped.
    pub async fn cancel_all(&self) -> usize {
        let drained: Vec<(Uuid, TrackedTask)> = self.tasks.lock().await.drain().collect();
        let count = drained.len();
        for (_, tracked) in &drained {
            tracked.token.cancel();
        }
        for (id, tracked) in drained {
            self.stop(id, tracked).await;
        }
        if count > 0 {
            tracing::info!(count, "cancelled all background activities");
        }
        count
    }

    /// True while an unfinished activity is tracked for `id`.
    pub async fn is_tracked(&self, id: Uuid) -> bool {
        self.tasks
            .lock()
            .await
            .get(&id)
            .is_some_and(|t| !t.handle.is_finished())
    }

    /// Number of tracked activities that have not finished yet.
    pub async fn active_count(&self) -> usize {
        self.tasks
            .lock()
            .await
            .values()
            .filter(|t| !t.handle.is_finished())
            .count()
    }

    async fn stop(&self, id: Uuid, tracked: TrackedTask) {
        tracked.token.cancel();
        let mut handle = tracked.handle;
        match tokio::time::timeout(self.cancel_grace, &mut handle).await {
            Ok(Ok(())) => tracing::debug!(execution_id = %id, "activity acknowledged cancellation"),
            Ok(Err(e)) if e.is_cancelled() => {}
            Ok(Err(e)) => tracing::warn!(execution_id = %id, error = %e, "activity panicked"),
            Err(_) => {
                tracing::warn!(
                    execution_id = %id,
                    grace_secs = self.cancel_grace.as_secs(),
                    "activity ignored cancellation, aborting"
                );
                handle.abort();
            }
        }
    }
}

impl Default for BackgroundTaskSupervisor {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn finished_task_cleans_itself_up() {
        let supervisor = BackgroundTaskSupervisor::default();
        let id = Uuid::new_v4();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();

        supervisor
            .start_task(id, move |_token| async move {
                let _ = rx.await;
                Ok::<(), String>(())
            })
            .await
            .unwrap();
        assert!(supervisor.is_tracked(id).await);

        tx.send(()).unwrap();
        for _ in 0..100 {
            if supervisor.get_task(id).await.is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(supervisor.get_task(id).await.is_none());
    }

    #[tokio::test]
    async fn cancel_of_unknown_id_is_false() {
        let supervisor = BackgroundTaskSupervisor::default();
        assert!(!supervisor.cancel_task(Uuid::new_v4()).await);
    }
}
