use std::sync::Arc;

use ax_core::error::{ExecutionError, Result};
use ax_core::store::ExecutionStore;
use ax_core::types::{ExecutionRecord, ExecutionState, JsonMap, ProgressPatch, STEPS_CONTEXT_KEY};
use serde_json::Value;
use uuid::Uuid;

use crate::events::EventNotifier;

/// States in which progress writes are accepted.
pub const PROGRESS_STATES: [ExecutionState; 2] = [ExecutionState::Preparing, ExecutionState::Running];

// ---------------------------------------------------------------------------
// ProgressUpdate
// ---------------------------------------------------------------------------

/// A progress write. Step fields left as `None` are not touched.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub percentage: f64,
    pub message: Option<String>,
    pub completed_steps: Option<Vec<String>>,
    /// `Some(None)` clears the current step.
    pub current_step: Option<Option<String>>,
    pub remaining_steps: Option<Vec<String>>,
}

impl ProgressUpdate {
    pub fn new(percentage: f64) -> Self {
        Self {
            percentage,
            message: None,
            completed_steps: None,
            current_step: None,
            remaining_steps: None,
        }
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn completed_steps(mut self, steps: Vec<String>) -> Self {
        self.completed_steps = Some(steps);
        self
    }

    pub fn current_step(mut self, step: Option<String>) -> Self {
        self.current_step = Some(step);
        self
    }

    pub fn remaining_steps(mut self, steps: Vec<String>) -> Self {
        self.remaining_steps = Some(steps);
        self
    }

    fn steps_patch(&self) -> Option<JsonMap> {
        let mut steps = JsonMap::new();
        if let Some(completed) = &self.completed_steps {
            steps.insert("completed".into(), Value::from(completed.clone()));
        }
        if let Some(current) = &self.current_step {
            steps.insert(
                "current".into(),
                current.clone().map(Value::String).unwrap_or(Value::Null),
            );
        }
        if let Some(remaining) = &self.remaining_steps {
            steps.insert("remaining".into(), Value::from(remaining.clone()));
        }
        if steps.is_empty() {
            return None;
        }
        let mut patch = JsonMap::new();
        patch.insert(STEPS_CONTEXT_KEY.into(), Value::Object(steps));
        Some(patch)
    }
}

// ---------------------------------------------------------------------------
// ProgressTracker
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ProgressTracker {
    store: Arc<dyn ExecutionStore>,
    notifier: EventNotifier,
}

impl ProgressTracker {
    pub fn new(store: Arc<dyn ExecutionStore>, notifier: EventNotifier) -> Self {
        Self { store, notifier }
    }

    /// Record progress for an execution in PREPARING or RUNNING.
    ///
    /// The state check and the write are one store operation, so a
    /// concurrent pause or cancel is never overwritten by a stale write.
    pub async fn update_progress(&self, id: Uuid, update: ProgressUpdate) -> Result<ExecutionRecord> {
        if !(0.0..=100.0).contains(&update.percentage) {
            return Err(ExecutionError::InvalidProgress(update.percentage));
        }

        let patch = ProgressPatch {
            percentage: update.percentage,
            message: update.message.clone(),
            context_patch: update.steps_patch(),
        };

        match self.store.update_progress(id, patch, &PROGRESS_STATES).await? {
            Some(record) => {
                tracing::debug!(
                    execution_id = %id,
                    percentage = record.progress_percentage,
                    "progress updated"
                );
                self.notifier.emit_progress_updated(&record).await;
                Ok(record)
            }
            None => {
                let current = self
                    .store
                    .get(id)
                    .await?
                    .ok_or(ExecutionError::NotFound(id))?;
                Err(ExecutionError::InvalidState {
                    operation: "update progress",
                    current: current.state,
                })
            }
        }
    }

    /// Fold the current step into the completed list and set 100%.
    pub async fn mark_complete(&self, id: Uuid, message: impl Into<String>) -> Result<ExecutionRecord> {
        let record = self
            .store
            .get(id)
            .await?
            .ok_or(ExecutionError::NotFound(id))?;
        let mut steps = record.step_progress();
        if let Some(current) = steps.current.take() {
            steps.completed.push(current);
        }

        let update = ProgressUpdate::new(100.0)
            .message(message)
            .completed_steps(steps.completed)
            .current_step(None);
        self.update_progress(id, update).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steps_patch_only_carries_given_fields() {
        let patch = ProgressUpdate::new(10.0)
            .current_step(Some("fetch".into()))
            .steps_patch()
            .unwrap();
        let steps = patch[STEPS_CONTEXT_KEY].as_object().unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps["current"], "fetch");

        assert!(ProgressUpdate::new(5.0).message("x").steps_patch().is_none());
    }

    #[test]
    fn cleared_current_step_is_null() {
        let patch = ProgressUpdate::new(100.0).current_step(None).steps_patch().unwrap();
        assert!(patch[STEPS_CONTEXT_KEY]["current"].is_null());
    }
}
