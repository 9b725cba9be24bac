use std::sync::Arc;

use ax_core::config::{RejectionPolicy, RunnerConfig};
use ax_core::error::ExecutionError;
use ax_core::store::ExecutionStore;
use ax_core::types::{ExecutionRecord, ExecutionState, JsonMap};
use chrono::Utc;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::approval::requires_approval;
use crate::collaborators::{
    AgentDirectory, AgentProfile, ApprovalDecision, ApprovalRequest, ExecutionService,
    HumanInteraction, RemoteExecutionRequest, RemoteExecutionResponse,
};
use crate::guard::StateTransitionGuard;
use crate::progress::{ProgressTracker, ProgressUpdate};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Typed outcome of a run that did not complete.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    /// The supervisor signalled cancellation.
    #[error("run cancelled")]
    Cancelled,

    /// Someone else settled the execution while the run was in flight.
    #[error("execution settled externally as {0}")]
    Interrupted(ExecutionState),

    #[error("agent not found: {0}")]
    AgentNotFound(Uuid),

    #[error("upstream failure: {0}")]
    Upstream(String),

    #[error("approval {decision}: {feedback}")]
    ApprovalRejected { decision: String, feedback: String },

    #[error(transparent)]
    Lifecycle(#[from] ExecutionError),
}

impl RunError {
    /// Outcomes that leave the record alone instead of failing it.
    fn is_quiet(&self) -> bool {
        matches!(self, RunError::Cancelled | RunError::Interrupted(_))
    }
}

pub type Result<T> = std::result::Result<T, RunError>;

// ---------------------------------------------------------------------------
// Step plan
// ---------------------------------------------------------------------------

const STEP_INITIALIZE: &str = "initialize";
const STEP_PREPARE: &str = "prepare_input";
const STEP_EXECUTE: &str = "execute";
const STEP_POST_PROCESS: &str = "post_process";
const STEP_APPROVAL: &str = "human_approval";
const STEP_FINALIZE: &str = "finalize";

/// Ordered step names of one run, used to fill the step lists.
struct StepPlan {
    steps: Vec<&'static str>,
}

impl StepPlan {
    fn new(with_approval: bool) -> Self {
        let mut steps = vec![STEP_INITIALIZE, STEP_PREPARE, STEP_EXECUTE, STEP_POST_PROCESS];
        if with_approval {
            steps.push(STEP_APPROVAL);
        }
        steps.push(STEP_FINALIZE);
        Self { steps }
    }

    fn update(&self, step: &str, percentage: f64, message: &str) -> ProgressUpdate {
        let idx = self.steps.iter().position(|s| *s == step).unwrap_or(0);
        let owned = |s: &[&str]| s.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        ProgressUpdate::new(percentage)
            .message(message)
            .completed_steps(owned(&self.steps[..idx]))
            .current_step(Some(step.to_string()))
            .remaining_steps(owned(&self.steps[idx + 1..]))
    }
}

// ---------------------------------------------------------------------------
// TaskRunner
// ---------------------------------------------------------------------------

/// Drives one execution from PREPARING to a settled state.
///
/// Progress checkpoints: 10 initialize, 25 input prepared, 50 remote call,
/// 75 post-processed, 85 awaiting approval (only when required), 95
/// finalizing, 100 done. Each checkpoint honours cancellation and waits
/// while the execution is externally paused.
pub struct TaskRunner {
    store: Arc<dyn ExecutionStore>,
    guard: StateTransitionGuard,
    progress: ProgressTracker,
    agents: Arc<dyn AgentDirectory>,
    executor: Arc<dyn ExecutionService>,
    human: Option<Arc<dyn HumanInteraction>>,
    settings: RunnerConfig,
}

impl TaskRunner {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        guard: StateTransitionGuard,
        progress: ProgressTracker,
        agents: Arc<dyn AgentDirectory>,
        executor: Arc<dyn ExecutionService>,
        settings: RunnerConfig,
    ) -> Self {
        Self {
            store,
            guard,
            progress,
            agents,
            executor,
            human: None,
            settings,
        }
    }

    pub fn with_human(mut self, human: Arc<dyn HumanInteraction>) -> Self {
        self.human = Some(human);
        self
    }

    /// Run execution `id` to completion.
    ///
    /// On failure the error is stored on the record and the execution moves
    /// to FAILED unless it already settled; the error is then returned so
    /// the supervisor can log it. Cancellation and external settlement
    /// return without touching the record.
    pub async fn run(&self, id: Uuid, cancel: CancellationToken) -> Result<ExecutionRecord> {
        match self.drive(id, &cancel).await {
            Ok(record) => Ok(record),
            Err(err) => {
                if err.is_quiet() {
                    tracing::info!(execution_id = %id, outcome = %err, "run stopped");
                } else {
                    self.record_failure(id, &err).await;
                }
                Err(err)
            }
        }
    }

    async fn drive(&self, id: Uuid, cancel: &CancellationToken) -> Result<ExecutionRecord> {
        if cancel.is_cancelled() {
            return Err(RunError::Cancelled);
        }
        let record = self
            .transition(id, ExecutionState::Running, "execution running", cancel)
            .await?;
        let plan = StepPlan::new(requires_approval(&record.input_parameters));

        // 1. initialize
        self.checkpoint(id, cancel, plan.update(STEP_INITIALIZE, 10.0, "initializing"))
            .await?;

        // 2. agent lookup
        let agent = self
            .agents
            .get_agent(record.agent_id)
            .await
            .map_err(|e| RunError::Upstream(e.to_string()))?
            .ok_or(RunError::AgentNotFound(record.agent_id))?;

        // 3. prepare input
        let input = prepare_input(&record, &agent);
        let record = self
            .checkpoint(id, cancel, plan.update(STEP_PREPARE, 25.0, "input prepared"))
            .await?;

        // 4. remote call
        self.checkpoint(
            id,
            cancel,
            plan.update(STEP_EXECUTE, 50.0, "executing on remote service"),
        )
        .await?;
        let request = RemoteExecutionRequest {
            execution_id: id,
            agent_id: record.agent_id,
            task_id: record.task_id.clone(),
            input,
        };
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(RunError::Cancelled),
            res = self.executor.execute(request) => res.map_err(|e| RunError::Upstream(e.to_string()))?,
        };

        // 5. post-process
        let mut result = post_process(response, &agent);
        let record = self
            .checkpoint(id, cancel, plan.update(STEP_POST_PROCESS, 75.0, "result processed"))
            .await?;

        // 6. approval interjection
        if requires_approval(&record.input_parameters) {
            self.checkpoint(
                id,
                cancel,
                plan.update(STEP_APPROVAL, 85.0, "awaiting human approval"),
            )
            .await?;
            self.transition(id, ExecutionState::Paused, "awaiting human approval", cancel)
                .await?;
            let decision = self.await_approval(&record, &result, cancel).await?;
            annotate_approval(&mut result, &decision);

            if !decision.approved && self.settings.approval_rejection == RejectionPolicy::Fail {
                self.store.update_result(id, Some(result), None).await?;
                return Err(RunError::ApprovalRejected {
                    decision: decision.decision,
                    feedback: decision
                        .feedback
                        .unwrap_or_else(|| "no feedback given".into()),
                });
            }
            let reason = if decision.approved {
                "human approval granted"
            } else {
                "human approval declined, continuing"
            };
            self.transition(id, ExecutionState::Running, reason, cancel)
                .await?;
        }

        // 7. finalize
        self.checkpoint(id, cancel, plan.update(STEP_FINALIZE, 95.0, "finalizing"))
            .await?;
        self.store
            .update_result(id, Some(result), None)
            .await?
            .ok_or(ExecutionError::NotFound(id))?;
        loop {
            self.wait_until_active(id, cancel).await?;
            match self.progress.mark_complete(id, "execution completed").await {
                Ok(_) => break,
                Err(ExecutionError::InvalidState {
                    current: ExecutionState::Paused,
                    ..
                }) => continue,
                Err(e) => return Err(interrupted_or(e)),
            }
        }
        let done = self
            .transition(id, ExecutionState::Completed, "execution completed", cancel)
            .await?;
        tracing::info!(execution_id = %id, "execution completed");
        Ok(done)
    }

    /// Record progress once the execution is active, waiting out pauses.
    async fn checkpoint(
        &self,
        id: Uuid,
        cancel: &CancellationToken,
        update: ProgressUpdate,
    ) -> Result<ExecutionRecord> {
        loop {
            self.wait_until_active(id, cancel).await?;
            match self.progress.update_progress(id, update.clone()).await {
                Ok(record) => return Ok(record),
                // Paused between the read and the write; wait again.
                Err(ExecutionError::InvalidState {
                    current: ExecutionState::Paused,
                    ..
                }) => continue,
                Err(e) => return Err(interrupted_or(e)),
            }
        }
    }

    /// Block while the execution is PAUSED. Fails with `Cancelled` on
    /// cancellation and `Interrupted` once the execution has settled.
    async fn wait_until_active(&self, id: Uuid, cancel: &CancellationToken) -> Result<ExecutionRecord> {
        loop {
            if cancel.is_cancelled() {
                return Err(RunError::Cancelled);
            }
            let record = self
                .store
                .get(id)
                .await?
                .ok_or(ExecutionError::NotFound(id))?;
            match record.state {
                ExecutionState::Paused => {
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(RunError::Cancelled),
                        _ = tokio::time::sleep(self.settings.pause_poll_interval()) => {}
                    }
                }
                state if state.is_settled() => return Err(RunError::Interrupted(state)),
                _ => return Ok(record),
            }
        }
    }

    async fn await_approval(
        &self,
        record: &ExecutionRecord,
        result: &JsonMap,
        cancel: &CancellationToken,
    ) -> Result<ApprovalDecision> {
        let Some(human) = &self.human else {
            tracing::warn!(
                execution_id = %record.id,
                "no human-interaction service configured, auto-approving"
            );
            return Ok(ApprovalDecision::auto_approved());
        };

        let timeout = self.settings.approval_timeout();
        let deadline = Utc::now()
            + chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::hours(1));
        let request = ApprovalRequest {
            execution_id: record.id,
            agent_id: record.agent_id,
            title: format!("Approve execution {}", record.task_id),
            description: "The agent finished its work and the output needs a human decision \
                          before the execution completes."
                .into(),
            options: vec!["approve".into(), "reject".into()],
            context: approval_context(record, result),
            deadline,
            priority: self.settings.approval_priority.clone(),
        };

        let ticket = tokio::select! {
            _ = cancel.cancelled() => return Err(RunError::Cancelled),
            res = human.request_approval(request) => res.map_err(|e| RunError::Upstream(e.to_string()))?,
        };
        tracing::info!(
            execution_id = %record.id,
            interaction_id = %ticket.interaction_id,
            "approval requested"
        );

        let waited = tokio::select! {
            _ = cancel.cancelled() => None,
            res = tokio::time::timeout(timeout, human.await_decision(ticket.interaction_id)) => Some(res),
        };
        let outcome = match waited {
            Some(Ok(Ok(decision))) => return Ok(decision),
            Some(Ok(Err(e))) => Err(RunError::Upstream(e.to_string())),
            Some(Err(_)) => {
                tracing::warn!(
                    execution_id = %record.id,
                    interaction_id = %ticket.interaction_id,
                    "approval deadline passed without a decision"
                );
                Ok(ApprovalDecision::timed_out())
            }
            None => Err(RunError::Cancelled),
        };

        // Nobody answered; close the request so it cannot be decided later.
        if let Err(e) = human.withdraw(ticket.interaction_id).await {
            tracing::warn!(
                execution_id = %record.id,
                interaction_id = %ticket.interaction_id,
                error = %e,
                "failed to withdraw approval request"
            );
        }
        outcome
    }


    /// Commit the run's own transition. A concurrent writer winning the
    /// swap is not a run failure: re-read and try again, waiting out an
    /// operator pause before completing.
    async fn transition(
        &self,
        id: Uuid,
        target: ExecutionState,
        reason: &str,
        cancel: &CancellationToken,
    ) -> Result<ExecutionRecord> {
        loop {
            match self.guard.change_state(id, target, reason).await {
                Ok(record) => return Ok(record),
                Err(ExecutionError::ConcurrentModification { expected, .. }) => {
                    tracing::debug!(
                        execution_id = %id,
                        expected = %expected,
                        target = %target,
                        "transition lost a race, re-reading"
                    );
                    if target == ExecutionState::Completed {
                        self.wait_until_active(id, cancel).await?;
                    } else if cancel.is_cancelled() {
                        return Err(RunError::Cancelled);
                    }
                }
                Err(e) => return Err(interrupted_or(e)),
            }
        }
    }

    async fn record_failure(&self, id: Uuid, err: &RunError) {
        let message = err.to_string();
        tracing::warn!(execution_id = %id, error = %message, "run failed");

        if let Err(e) = self.store.update_result(id, None, Some(message.clone())).await {
            tracing::error!(execution_id = %id, error = %e, "failed to store run error");
        }
        let current = match self.store.get(id).await {
            Ok(Some(record)) => record.state,
            Ok(None) => return,
            Err(e) => {
                tracing::error!(execution_id = %id, error = %e, "failed to reload execution");
                return;
            }
        };
        if current.is_settled() {
            tracing::info!(execution_id = %id, state = %current, "already settled, failure dropped");
            return;
        }
        if let Err(e) = self.guard.change_state(id, ExecutionState::Failed, &message).await {
            tracing::warn!(execution_id = %id, error = %e, "could not mark execution failed");
        }
    }
}

/// Map lifecycle errors raised because the execution settled underneath
/// the run to [`RunError::Interrupted`].
fn interrupted_or(err: ExecutionError) -> RunError {
    match err {
        ExecutionError::InvalidStateTransition { current, .. }
        | ExecutionError::InvalidState { current, .. }
            if current.is_settled() =>
        {
            RunError::Interrupted(current)
        }
        other => RunError::Lifecycle(other),
    }
}

// ---------------------------------------------------------------------------
// Payload shaping
// ---------------------------------------------------------------------------

fn prepare_input(record: &ExecutionRecord, agent: &AgentProfile) -> JsonMap {
    let mut input = JsonMap::new();
    input.insert("parameters".into(), Value::Object(record.input_parameters.clone()));
    input.insert("context".into(), Value::Object(record.context.clone()));
    input.insert("agent_type".into(), Value::String(agent.agent_type.clone()));
    input.insert("agent_configuration".into(), Value::Object(agent.configuration.clone()));
    input.insert("capabilities".into(), Value::from(agent.capabilities.clone()));
    input.insert("retry_count".into(), Value::from(record.retry_count));
    input
}

fn post_process(response: RemoteExecutionResponse, agent: &AgentProfile) -> JsonMap {
    let mut result = response.result;
    result.insert(
        "execution_metadata".into(),
        json!({
            "execution_time": response.execution_time,
            "model_used": response.model_used,
            "provider": response.provider,
            "agent_type": agent.agent_type,
        }),
    );
    result
}

fn annotate_approval(result: &mut JsonMap, decision: &ApprovalDecision) {
    result.insert("human_approval".into(), Value::Bool(decision.approved));
    result.insert("approval_decision".into(), Value::String(decision.decision.clone()));
    result.insert(
        "approval_feedback".into(),
        decision.feedback.clone().map(Value::String).unwrap_or(Value::Null),
    );
}

fn approval_context(record: &ExecutionRecord, result: &JsonMap) -> JsonMap {
    let mut context = JsonMap::new();
    context.insert("task_id".into(), Value::String(record.task_id.clone()));
    context.insert("input_parameters".into(), Value::Object(record.input_parameters.clone()));
    context.insert("result_preview".into(), Value::Object(result.clone()));
    context
}
