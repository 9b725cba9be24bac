use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque JSON object used for parameters, context, and results.
pub type JsonMap = serde_json::Map<String, serde_json::Value>;

/// Context key under which step progress is recorded.
pub const STEPS_CONTEXT_KEY: &str = "progress_steps";

// ---------------------------------------------------------------------------
// ExecutionState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Queued,
    Preparing,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionState {
    pub const ALL: [ExecutionState; 7] = [
        ExecutionState::Queued,
        ExecutionState::Preparing,
        ExecutionState::Running,
        ExecutionState::Paused,
        ExecutionState::Completed,
        ExecutionState::Failed,
        ExecutionState::Cancelled,
    ];

    /// Returns `true` when a transition from `self` to `target` is a legal
    /// edge of the lifecycle. Same-state requests are handled by the caller.
    ///
    /// - Queued    -> Preparing | Cancelled
    /// - Preparing -> Running | Failed | Cancelled
    /// - Running   -> Paused | Completed | Failed | Cancelled
    /// - Paused    -> Running | Completed | Failed | Cancelled
    /// - Failed    -> Queued (retry)
    pub fn can_transition_to(&self, target: ExecutionState) -> bool {
        use ExecutionState::*;
        matches!(
            (self, target),
            (Queued, Preparing)
                | (Queued, Cancelled)
                | (Preparing, Running)
                | (Preparing, Failed)
                | (Preparing, Cancelled)
                | (Running, Paused)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Paused, Running)
                | (Paused, Completed)
                | (Paused, Failed)
                | (Paused, Cancelled)
                | (Failed, Queued)
        )
    }

    /// Terminal states have no outgoing edges.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionState::Completed | ExecutionState::Cancelled)
    }

    /// States in which no background work is expected to be making progress.
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            ExecutionState::Completed | ExecutionState::Failed | ExecutionState::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionState::Queued => "queued",
            ExecutionState::Preparing => "preparing",
            ExecutionState::Running => "running",
            ExecutionState::Paused => "paused",
            ExecutionState::Completed => "completed",
            ExecutionState::Failed => "failed",
            ExecutionState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_str().to_uppercase())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown execution state: {0}")]
pub struct ParseStateError(pub String);

impl FromStr for ExecutionState {
    type Err = ParseStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ExecutionState::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ParseStateError(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// StepProgress
// ---------------------------------------------------------------------------

/// Step lists carried inside an execution's context.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepProgress {
    #[serde(default)]
    pub completed: Vec<String>,
    #[serde(default)]
    pub current: Option<String>,
    #[serde(default)]
    pub remaining: Vec<String>,
}

// ---------------------------------------------------------------------------
// ExecutionRecord
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: Uuid,
    pub agent_id: Uuid,
    /// Caller-supplied correlation id.
    pub task_id: String,
    pub state: ExecutionState,
    pub progress_percentage: f64,
    pub status_message: Option<String>,
    pub input_parameters: JsonMap,
    pub context: JsonMap,
    pub result: Option<JsonMap>,
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExecutionRecord {
    /// Create a new QUEUED execution for `agent_id`.
    pub fn new(agent_id: Uuid, task_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            agent_id,
            task_id: task_id.into(),
            state: ExecutionState::Queued,
            progress_percentage: 0.0,
            status_message: None,
            input_parameters: JsonMap::new(),
            context: JsonMap::new(),
            result: None,
            error_message: None,
            retry_count: 0,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_parameters(mut self, parameters: JsonMap) -> Self {
        self.input_parameters = parameters;
        self
    }

    pub fn with_context(mut self, context: JsonMap) -> Self {
        self.context = context;
        self
    }

    /// Step lists recorded in the context, or empty lists when absent or
    /// malformed.
    pub fn step_progress(&self) -> StepProgress {
        self.context
            .get(STEPS_CONTEXT_KEY)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// ExecutionStateTransition
// ---------------------------------------------------------------------------

/// Append-only audit row written once per committed transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionStateTransition {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub previous_state: Option<ExecutionState>,
    pub new_state: ExecutionState,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Query and patch types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionFilter {
    pub agent_id: Option<Uuid>,
    pub task_id: Option<String>,
    /// Empty means any state.
    pub states: Vec<ExecutionState>,
}

impl ExecutionFilter {
    pub fn with_agent(mut self, agent_id: Uuid) -> Self {
        self.agent_id = Some(agent_id);
        self
    }

    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_states(mut self, states: impl IntoIterator<Item = ExecutionState>) -> Self {
        self.states = states.into_iter().collect();
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    pub offset: u64,
    pub limit: u64,
}

impl Pagination {
    pub fn new(offset: u64, limit: u64) -> Self {
        Self { offset, limit }
    }
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 50,
        }
    }
}

/// Set-once timestamps applied alongside a conditional state update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimestampPatch {
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A conditional state change together with the reason recorded in history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    /// The write only happens while the stored state still equals this.
    pub expected: ExecutionState,
    pub target: ExecutionState,
    pub timestamps: TimestampPatch,
    pub reason: String,
}

impl StateChange {
    pub fn new(expected: ExecutionState, target: ExecutionState, reason: impl Into<String>) -> Self {
        Self {
            expected,
            target,
            timestamps: TimestampPatch::default(),
            reason: reason.into(),
        }
    }

    pub fn with_timestamps(mut self, timestamps: TimestampPatch) -> Self {
        self.timestamps = timestamps;
        self
    }
}

/// Record and history row written by one committed state change.
#[derive(Debug, Clone)]
pub struct CommittedTransition {
    pub record: ExecutionRecord,
    pub transition: ExecutionStateTransition,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressPatch {
    pub percentage: f64,
    /// `None` keeps the current status message.
    pub message: Option<String>,
    /// Deep-merged into the stored context.
    pub context_patch: Option<JsonMap>,
}

/// Deep-merge `patch` into `target`: nested objects merge key by key, any
/// other value replaces what was there.
pub fn merge_json(target: &mut JsonMap, patch: JsonMap) {
    for (key, value) in patch {
        match (target.get_mut(&key), value) {
            (Some(serde_json::Value::Object(existing)), serde_json::Value::Object(incoming)) => {
                merge_json(existing, incoming);
            }
            (_, value) => {
                target.insert(key, value);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
