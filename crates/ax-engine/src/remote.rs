use std::time::Duration;

use async_trait::async_trait;
use ax_core::config::RemoteConfig;
use serde_json::Value;

use crate::collaborators::{
    CollaboratorError, ExecutionService, RemoteExecutionRequest, RemoteExecutionResponse,
};

/// Remote execution service reached over HTTP.
///
/// Posts the request JSON to `{base_url}/v1/executions`. Non-success
/// statuses and `{"error": ...}` bodies become [`CollaboratorError`]s.
pub struct HttpExecutionService {
    client: reqwest::Client,
    base_url: String,
}

impl HttpExecutionService {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn from_config(config: &RemoteConfig) -> Self {
        Self::new(
            config.base_url.clone(),
            Duration::from_secs(config.request_timeout_secs),
        )
    }

    /// Replace the HTTP client (custom TLS, proxy or timeout settings).
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    pub fn endpoint(&self) -> String {
        format!("{}/v1/executions", self.base_url)
    }
}

fn error_payload(body: &Value) -> Option<String> {
    match body.get("error")? {
        Value::Null => None,
        Value::String(msg) => Some(msg.clone()),
        Value::Object(obj) => Some(
            obj.get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| Value::Object(obj.clone()).to_string()),
        ),
        other => Some(other.to_string()),
    }
}

#[async_trait]
impl ExecutionService for HttpExecutionService {
    async fn execute(
        &self,
        request: RemoteExecutionRequest,
    ) -> Result<RemoteExecutionResponse, CollaboratorError> {
        let url = self.endpoint();
        tracing::debug!(execution_id = %request.execution_id, %url, "calling remote execution service");

        let resp = self.client.post(&url).json(&request).send().await?;
        let status = resp.status().as_u16();

        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            let message = serde_json::from_str::<Value>(&text)
                .ok()
                .and_then(|body| error_payload(&body))
                .unwrap_or(text);
            return Err(CollaboratorError::Api { status, message });
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|e| CollaboratorError::Parse(e.to_string()))?;
        if let Some(message) = error_payload(&body) {
            return Err(CollaboratorError::Remote(message));
        }
        serde_json::from_value(body).map_err(|e| CollaboratorError::Parse(e.to_string()))
    }
}
