//! Delegated agent provider
//!
//! Hands work to a remote task service and reports on it by handle.
//!
//! - `POST {base}/tasks` with `{agent, prompt, params}` returns `{id}`
//! - `GET {base}/tasks/{id}` returns `{status, output?, error?}` where status
//!   is one of `queued`, `running`, `completed`, `failed`

use super::{classify_status, classify_transport};
use crate::completion::provider::{
    AgentHandle, AsyncAgentProvider, ProviderError, ProviderParams, ReadyState,
};
use crate::config::{resolve_optional_env_var, ConfigError, DelegatedAgentSection};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct DelegatedAgentConfig {
    pub base_url: String,
    pub token: Option<String>,
    pub timeout: Duration,
}

impl DelegatedAgentConfig {
    pub fn from_section(section: &DelegatedAgentSection) -> Result<Self, ConfigError> {
        Ok(Self {
            base_url: section.base_url.trim_end_matches('/').to_string(),
            token: resolve_optional_env_var(section.token_env.as_ref())?,
            timeout: Duration::from_secs(section.timeout_secs),
        })
    }
}

/// Provider for one agent hosted by the remote task service
pub struct DelegatedAgentProvider {
    agent: String,
    config: DelegatedAgentConfig,
    client: Client,
}

impl DelegatedAgentProvider {
    pub fn new(agent: impl Into<String>, config: DelegatedAgentConfig) -> Result<Self, ConfigError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ConfigError::InvalidConfig(format!("HTTP client: {e}")))?;

        Ok(Self {
            agent: agent.into(),
            config,
            client,
        })
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.config.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl AsyncAgentProvider for DelegatedAgentProvider {
    fn name(&self) -> &str {
        "delegated_agent"
    }

    async fn produce(
        &self,
        prompt: &str,
        params: &ProviderParams,
    ) -> Result<AgentHandle, ProviderError> {
        let body = DispatchRequest {
            agent: &self.agent,
            prompt,
            params,
        };

        let response = self
            .authorize(self.client.post(format!("{}/tasks", self.config.base_url)))
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_transport(e, self.config.timeout))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &error_text, "task service"));
        }

        let dispatched: DispatchResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Permanent(format!("invalid dispatch response: {e}")))?;

        debug!(agent = %self.agent, handle = %dispatched.id, "Dispatched delegated task");
        Ok(AgentHandle::new(dispatched.id))
    }

    async fn is_ready(&self, handle: &AgentHandle) -> Result<ReadyState, ProviderError> {
        let response = self
            .authorize(
                self.client
                    .get(format!("{}/tasks/{}", self.config.base_url, handle.as_str())),
            )
            .send()
            .await
            .map_err(|e| classify_transport(e, self.config.timeout))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(ProviderError::Permanent(format!("unknown task handle {handle}")));
        }
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &error_text, "task service"));
        }

        let task: TaskStatusResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Permanent(format!("invalid task status: {e}")))?;

        Ok(task.into_ready_state())
    }
}

#[derive(Debug, Serialize)]
struct DispatchRequest<'a> {
    agent: &'a str,
    prompt: &'a str,
    params: &'a ProviderParams,
}

#[derive(Debug, Deserialize)]
struct DispatchResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum TaskState {
    Queued,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Deserialize)]
struct TaskStatusResponse {
    status: TaskState,
    #[serde(default)]
    output: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

impl TaskStatusResponse {
    fn into_ready_state(self) -> ReadyState {
        match self.status {
            TaskState::Queued | TaskState::Running => ReadyState::NotReady,
            TaskState::Completed => ReadyState::Ready(self.output.unwrap_or_default()),
            TaskState::Failed => ReadyState::Failed(
                self.error
                    .unwrap_or_else(|| "delegated task failed".to_string()),
            ),
        }
    }
}
