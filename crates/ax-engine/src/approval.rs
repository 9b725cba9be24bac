use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ax_core::types::JsonMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::collaborators::{
    ApprovalDecision, ApprovalRequest, CollaboratorError, HumanInteraction, InteractionTicket,
};

/// Whether the input parameters ask for a human approval step.
///
/// Triggers: `require_human_approval: true`, `risk_level` of `high` or
/// `critical`, or `requires_content_approval: true`.
pub fn requires_approval(parameters: &JsonMap) -> bool {
    let flag = |key: &str| parameters.get(key).and_then(Value::as_bool).unwrap_or(false);
    let risky = parameters
        .get("risk_level")
        .and_then(Value::as_str)
        .is_some_and(|level| {
            level.eq_ignore_ascii_case("high") || level.eq_ignore_ascii_case("critical")
        });
    flag("require_human_approval") || risky || flag("requires_content_approval")
}

// ---------------------------------------------------------------------------
// ApprovalStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    /// The deadline passed before anyone decided.
    Expired,
}

// ---------------------------------------------------------------------------
// PendingApproval
// ---------------------------------------------------------------------------

/// Public view of an approval request held by the desk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingApproval {
    pub interaction_id: Uuid,
    pub execution_id: Uuid,
    pub agent_id: Uuid,
    pub title: String,
    pub description: String,
    pub options: Vec<String>,
    pub priority: String,
    pub deadline: DateTime<Utc>,
    pub requested_at: DateTime<Utc>,
    pub status: ApprovalStatus,
    pub resolved_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ApprovalError {
    #[error("approval request not found: {0}")]
    NotFound(Uuid),
    #[error("approval request already resolved: {0}")]
    AlreadyResolved(Uuid),
    #[error("approval request expired: {0}")]
    Expired(Uuid),
}

pub type Result<T> = std::result::Result<T, ApprovalError>;

// ---------------------------------------------------------------------------
// ApprovalDesk
// ---------------------------------------------------------------------------

struct DeskEntry {
    view: PendingApproval,
    decide: Option<oneshot::Sender<ApprovalDecision>>,
    decided: Option<oneshot::Receiver<ApprovalDecision>>,
}

/// In-process human-interaction collaborator.
///
/// The runner registers requests through [`HumanInteraction`]; operators
/// resolve them with [`ApprovalDesk::approve`] / [`ApprovalDesk::reject`].
/// An entry leaves the desk once its waiter collected the decision or the
/// request was withdrawn. Cloning shares the same desk.
#[derive(Clone, Default)]
pub struct ApprovalDesk {
    entries: Arc<Mutex<HashMap<Uuid, DeskEntry>>>,
}

impl ApprovalDesk {
    pub fn new() -> Self {
        Self::default()
    }

    /// Approve a pending request and wake its waiter.
    pub fn approve(&self, interaction_id: Uuid, feedback: Option<String>) -> Result<ApprovalDecision> {
        self.resolve(interaction_id, ApprovalDecision::approve(feedback))
    }

    /// Reject a pending request and wake its waiter.
    pub fn reject(&self, interaction_id: Uuid, feedback: Option<String>) -> Result<ApprovalDecision> {
        self.resolve(interaction_id, ApprovalDecision::reject(feedback))
    }

    /// Open requests, oldest first. Requests past their deadline are marked
    /// expired and left out. Settled entries whose waiter already took its
    /// receiver are pruned.
    pub fn list_pending(&self) -> Vec<PendingApproval> {
        let now = Utc::now();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.retain(|_, entry| {
            entry.view.status == ApprovalStatus::Pending || entry.decided.is_some()
        });
        let mut pending: Vec<PendingApproval> = entries
            .values_mut()
            .filter_map(|entry| {
                if entry.view.status != ApprovalStatus::Pending {
                    return None;
                }
                if entry.view.deadline <= now {
                    entry.view.status = ApprovalStatus::Expired;
                    return None;
                }
                Some(entry.view.clone())
            })
            .collect();
        pending.sort_by_key(|p| p.requested_at);
        pending
    }

    /// Snapshot of a request still held by the desk.
    pub fn get(&self, interaction_id: Uuid) -> Option<PendingApproval> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.get(&interaction_id).map(|e| e.view.clone())
    }

    fn resolve(&self, interaction_id: Uuid, decision: ApprovalDecision) -> Result<ApprovalDecision> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let entry = entries
            .get_mut(&interaction_id)
            .ok_or(ApprovalError::NotFound(interaction_id))?;

        match entry.view.status {
            ApprovalStatus::Pending => {}
            ApprovalStatus::Expired => return Err(ApprovalError::Expired(interaction_id)),
            _ => return Err(ApprovalError::AlreadyResolved(interaction_id)),
        }
        let now = Utc::now();
        if entry.view.deadline <= now {
            entry.view.status = ApprovalStatus::Expired;
            return Err(ApprovalError::Expired(interaction_id));
        }

        entry.view.status = if decision.approved {
            ApprovalStatus::Approved
        } else {
            ApprovalStatus::Rejected
        };
        entry.view.resolved_at = Some(now);
        if let Some(tx) = entry.decide.take() {
            // The waiter may already have given up (timeout or cancellation).
            let _ = tx.send(decision.clone());
        }
        tracing::info!(
            %interaction_id,
            execution_id = %entry.view.execution_id,
            approved = decision.approved,
            "approval resolved"
        );
        Ok(decision)
    }
}

#[async_trait]
impl HumanInteraction for ApprovalDesk {
    async fn request_approval(
        &self,
        request: ApprovalRequest,
    ) -> std::result::Result<InteractionTicket, CollaboratorError> {
        let interaction_id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        let view = PendingApproval {
            interaction_id,
            execution_id: request.execution_id,
            agent_id: request.agent_id,
            title: request.title,
            description: request.description,
            options: request.options,
            priority: request.priority,
            deadline: request.deadline,
            requested_at: Utc::now(),
            status: ApprovalStatus::Pending,
            resolved_at: None,
        };
        tracing::info!(
            %interaction_id,
            execution_id = %view.execution_id,
            deadline = %view.deadline,
            "approval requested"
        );

        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(
            interaction_id,
            DeskEntry {
                view,
                decide: Some(tx),
                decided: Some(rx),
            },
        );
        Ok(InteractionTicket { interaction_id })
    }

    async fn await_decision(
        &self,
        interaction_id: Uuid,
    ) -> std::result::Result<ApprovalDecision, CollaboratorError> {
        let receiver = {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            entries
                .get_mut(&interaction_id)
                .and_then(|entry| entry.decided.take())
                .ok_or(CollaboratorError::InteractionNotFound(interaction_id))?
        };
        let decision = receiver
            .await
            .map_err(|_| CollaboratorError::Unavailable("approval request was withdrawn".into()))?;
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&interaction_id);
        Ok(decision)
    }

    async fn withdraw(&self, interaction_id: Uuid) -> std::result::Result<(), CollaboratorError> {
        let removed = self
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&interaction_id);
        if let Some(entry) = removed {
            tracing::info!(
                %interaction_id,
                execution_id = %entry.view.execution_id,
                status = ?entry.view.status,
                "approval request withdrawn"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn request(deadline: DateTime<Utc>) -> ApprovalRequest {
        ApprovalRequest {
            execution_id: Uuid::new_v4(),
            agent_id: Uuid::new_v4(),
            title: "Approve output".into(),
            description: "check it".into(),
            options: vec!["approve".into(), "reject".into()],
            context: JsonMap::new(),
            deadline,
            priority: "high".into(),
        }
    }

    #[test]
    fn approval_triggers() {
        let params = |v: Value| v.as_object().cloned().unwrap();
        assert!(requires_approval(&params(json!({"require_human_approval": true}))));
        assert!(requires_approval(&params(json!({"risk_level": "Critical"}))));
        assert!(requires_approval(&params(json!({"requires_content_approval": true}))));
        assert!(!requires_approval(&params(json!({"risk_level": "low"}))));
        assert!(!requires_approval(&params(json!({"require_human_approval": "yes"}))));
        assert!(!requires_approval(&JsonMap::new()));
    }

    #[tokio::test]
    async fn decision_reaches_waiter() {
        let desk = ApprovalDesk::new();
        let ticket = desk
            .request_approval(request(Utc::now() + Duration::minutes(5)))
            .await
            .unwrap();
        assert_eq!(desk.list_pending().len(), 1);

        desk.reject(ticket.interaction_id, Some("not good".into())).unwrap();
        let decision = desk.await_decision(ticket.interaction_id).await.unwrap();
        assert!(!decision.approved);
        assert_eq!(decision.feedback.as_deref(), Some("not good"));
        assert!(desk.list_pending().is_empty());
    }

    #[tokio::test]
    async fn resolving_twice_fails() {
        let desk = ApprovalDesk::new();
        let ticket = desk
            .request_approval(request(Utc::now() + Duration::minutes(5)))
            .await
            .unwrap();
        desk.approve(ticket.interaction_id, None).unwrap();
        let err = desk.reject(ticket.interaction_id, None).unwrap_err();
        assert!(matches!(err, ApprovalError::AlreadyResolved(_)));
    }

    #[tokio::test]
    async fn past_deadline_expires() {
        let desk = ApprovalDesk::new();
        let ticket = desk
            .request_approval(request(Utc::now() - Duration::seconds(1)))
            .await
            .unwrap();
        assert!(desk.list_pending().is_empty());
        let err = desk.approve(ticket.interaction_id, None).unwrap_err();
        assert!(matches!(err, ApprovalError::Expired(_)));
        assert_eq!(
            desk.get(ticket.interaction_id).unwrap().status,
            ApprovalStatus::Expired
        );
    }

    #[tokio::test]
    async fn collected_decision_leaves_the_desk() {
        let desk = ApprovalDesk::new();
        let ticket = desk
            .request_approval(request(Utc::now() + Duration::minutes(5)))
            .await
            .unwrap();
        desk.approve(ticket.interaction_id, None).unwrap();
        desk.await_decision(ticket.interaction_id).await.unwrap();

        assert!(desk.get(ticket.interaction_id).is_none());
        assert!(matches!(
            desk.reject(ticket.interaction_id, None),
            Err(ApprovalError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn withdrawn_request_cannot_be_decided() {
        let desk = ApprovalDesk::new();
        let ticket = desk
            .request_approval(request(Utc::now() + Duration::minutes(5)))
            .await
            .unwrap();
        let interaction_id = ticket.interaction_id;
        let waiter = {
            let desk = desk.clone();
            tokio::spawn(async move { desk.await_decision(interaction_id).await })
        };
        tokio::task::yield_now().await;

        desk.withdraw(ticket.interaction_id).await.unwrap();
        assert!(desk.list_pending().is_empty());
        assert!(matches!(
            desk.approve(ticket.interaction_id, None),
            Err(ApprovalError::NotFound(_))
        ));
        assert!(waiter.await.unwrap().is_err());

        // Idempotent.
        desk.withdraw(ticket.interaction_id).await.unwrap();
    }

    #[tokio::test]
    async fn expired_entries_are_pruned_once_their_waiter_left() {
        let desk = ApprovalDesk::new();
        let ticket = desk
            .request_approval(request(Utc::now() - Duration::seconds(1)))
            .await
            .unwrap();
        assert!(desk.list_pending().is_empty());
        assert!(desk.get(ticket.interaction_id).is_some());

        // A waiter takes the receiver, then gives up without withdrawing.
        let gave_up = tokio::time::timeout(
            std::time::Duration::from_millis(10),
            desk.await_decision(ticket.interaction_id),
        )
        .await;
        assert!(gave_up.is_err());
        assert!(desk.list_pending().is_empty());
        assert!(desk.get(ticket.interaction_id).is_none());
    }

    #[tokio::test]
    async fn unknown_interaction_is_reported() {
        let desk = ApprovalDesk::new();
        assert!(matches!(
            desk.approve(Uuid::new_v4(), None),
            Err(ApprovalError::NotFound(_))
        ));
        assert!(desk.await_decision(Uuid::new_v4()).await.is_err());
    }
}
