use std::collections::HashMap;

use async_trait::async_trait;
use ax_core::config::AgentEntry;
use ax_core::types::JsonMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Failure reported by an external collaborator.
#[derive(Debug, thiserror::Error)]
pub enum CollaboratorError {
    #[error("http error: {0}")]
    Http(String),

    #[error("api error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("service reported error: {0}")]
    Remote(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("interaction not found: {0}")]
    InteractionNotFound(Uuid),

    #[error("collaborator unavailable: {0}")]
    Unavailable(String),
}

impl From<reqwest::Error> for CollaboratorError {
    fn from(err: reqwest::Error) -> Self {
        CollaboratorError::Http(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Remote execution service
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteExecutionRequest {
    pub execution_id: Uuid,
    pub agent_id: Uuid,
    pub task_id: String,
    pub input: JsonMap,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteExecutionResponse {
    #[serde(default)]
    pub result: JsonMap,
    /// Seconds spent by the remote service.
    #[serde(default)]
    pub execution_time: f64,
    #[serde(default)]
    pub model_used: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
}

/// Runs the actual model/agent work for one execution.
#[async_trait]
pub trait ExecutionService: Send + Sync {
    async fn execute(
        &self,
        request: RemoteExecutionRequest,
    ) -> Result<RemoteExecutionResponse, CollaboratorError>;
}

// ---------------------------------------------------------------------------
// Human interaction
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub execution_id: Uuid,
    pub agent_id: Uuid,
    pub title: String,
    pub description: String,
    pub options: Vec<String>,
    pub context: JsonMap,
    pub deadline: DateTime<Utc>,
    pub priority: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InteractionTicket {
    pub interaction_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalDecision {
    pub approved: bool,
    pub decision: String,
    #[serde(default)]
    pub feedback: Option<String>,
}

impl ApprovalDecision {
    pub fn approve(feedback: Option<String>) -> Self {
        Self {
            approved: true,
            decision: "approved".into(),
            feedback,
        }
    }

    pub fn reject(feedback: Option<String>) -> Self {
        Self {
            approved: false,
            decision: "rejected".into(),
            feedback,
        }
    }

    /// Outcome recorded when the deadline passes without a decision.
    pub fn timed_out() -> Self {
        Self {
            approved: false,
            decision: "timeout".into(),
            feedback: None,
        }
    }

    /// Outcome recorded when no human-interaction collaborator is configured.
    pub fn auto_approved() -> Self {
        Self {
            approved: true,
            decision: "auto_approved".into(),
            feedback: None,
        }
    }
}

/// Asks a human to approve a paused execution.
///
/// `request_approval` returns as soon as the request is registered;
/// `await_decision` resolves once a decision is available. Callers bound the
/// wait themselves and `withdraw` requests they stop waiting for.
#[async_trait]
pub trait HumanInteraction: Send + Sync {
    async fn request_approval(
        &self,
        request: ApprovalRequest,
    ) -> Result<InteractionTicket, CollaboratorError>;

    async fn await_decision(&self, interaction_id: Uuid)
        -> Result<ApprovalDecision, CollaboratorError>;

    /// Close a request nobody is waiting on any more. Withdrawing an unknown
    /// or already closed request succeeds.
    async fn withdraw(&self, interaction_id: Uuid) -> Result<(), CollaboratorError>;
}

// ---------------------------------------------------------------------------
// Agent lookup
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentProfile {
    pub id: Uuid,
    pub agent_type: String,
    pub configuration: JsonMap,
    pub capabilities: Vec<String>,
}

impl From<AgentEntry> for AgentProfile {
    fn from(entry: AgentEntry) -> Self {
        Self {
            id: entry.id,
            agent_type: entry.agent_type,
            configuration: entry.configuration,
            capabilities: entry.capabilities,
        }
    }
}

#[async_trait]
pub trait AgentDirectory: Send + Sync {
    async fn get_agent(&self, agent_id: Uuid) -> Result<Option<AgentProfile>, CollaboratorError>;
}

/// Agent directory backed by the `[[agents]]` config entries.
#[derive(Debug, Clone, Default)]
pub struct StaticAgentDirectory {
    agents: HashMap<Uuid, AgentProfile>,
}

impl StaticAgentDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: impl IntoIterator<Item = AgentEntry>) -> Self {
        let agents = entries
            .into_iter()
            .map(|entry| (entry.id, AgentProfile::from(entry)))
            .collect();
        Self { agents }
    }

    pub fn with_agent(mut self, profile: AgentProfile) -> Self {
        self.agents.insert(profile.id, profile);
        self
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

#[async_trait]
impl AgentDirectory for StaticAgentDirectory {
    async fn get_agent(&self, agent_id: Uuid) -> Result<Option<AgentProfile>, CollaboratorError> {
        Ok(self.agents.get(&agent_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn static_directory_serves_config_entries() {
        let id = Uuid::new_v4();
        let entry = AgentEntry {
            id,
            agent_type: "summarizer".into(),
            configuration: json!({"model": "small"}).as_object().cloned().unwrap(),
            capabilities: vec!["text".into()],
        };
        let directory = StaticAgentDirectory::from_entries([entry]);

        let profile = directory.get_agent(id).await.unwrap().unwrap();
        assert_eq!(profile.agent_type, "summarizer");
        assert_eq!(profile.configuration["model"], "small");
        assert!(directory.get_agent(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[test]
    fn response_defaults_missing_fields() {
        let parsed: RemoteExecutionResponse =
            serde_json::from_value(json!({"result": {"text": "ok"}})).unwrap();
        assert_eq!(parsed.result["text"], "ok");
        assert_eq!(parsed.execution_time, 0.0);
        assert!(parsed.model_used.is_none());
    }
}
