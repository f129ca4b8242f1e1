//! Engine configuration loaded from TOML
//!
//! Covers polling cadence, provider retry behaviour, proposal expiry, the
//! work-item service endpoint, provider endpoints, and the per-project
//! pipeline definitions served by `StaticConfigStore`. Secrets are referenced
//! by environment variable name and resolved when a client is constructed.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Top-level engine configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct EngineConfig {
    #[serde(default)]
    pub polling: PollingSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub proposals: ProposalSection,
    /// REST endpoint of the work-item service (required by the binary only)
    pub work_items: Option<WorkItemsSection>,
    #[serde(default)]
    pub providers: ProvidersSection,
    #[serde(default)]
    pub pipelines: Vec<PipelineConfig>,
}

/// Polling scheduler settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollingSection {
    /// Seconds between scheduler ticks
    #[serde(default = "default_poll_interval")]
    pub interval_secs: u64,
    /// Consecutive transient poll failures before a step is failed
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    /// Maximum number of concurrent poll workers
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,
}

impl Default for PollingSection {
    fn default() -> Self {
        Self {
            interval_secs: default_poll_interval(),
            max_consecutive_failures: default_max_consecutive_failures(),
            worker_pool_size: default_worker_pool_size(),
        }
    }
}

impl PollingSection {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

fn default_poll_interval() -> u64 {
    30
}

fn default_max_consecutive_failures() -> u32 {
    5
}

fn default_worker_pool_size() -> usize {
    8
}

/// Retry settings applied to every synchronous provider
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrySection {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Per-attempt timeout for a synchronous provider call
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_backoff_ms: default_max_backoff_ms(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_request_timeout_secs() -> u64 {
    120
}

/// Proposal lifecycle settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProposalSection {
    /// Seconds before a pending proposal expires (default: 7 days)
    #[serde(default = "default_proposal_ttl")]
    pub ttl_secs: u64,
}

impl Default for ProposalSection {
    fn default() -> Self {
        Self {
            ttl_secs: default_proposal_ttl(),
        }
    }
}

fn default_proposal_ttl() -> u64 {
    7 * 24 * 60 * 60
}

/// Work-item service endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkItemsSection {
    pub base_url: String,
    /// Environment variable containing a bearer token
    pub token_env: Option<String>,
    #[serde(default = "default_client_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_client_timeout_secs() -> u64 {
    30
}

/// Built-in provider endpoints
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ProvidersSection {
    pub chat: Option<ChatProviderSection>,
    pub delegated_agent: Option<DelegatedAgentSection>,
}

/// Synchronous chat-completion provider
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatProviderSection {
    #[serde(default = "default_chat_base_url")]
    pub base_url: String,
    /// Environment variable containing the API key
    pub api_key_env: String,
    /// Default model, overridable per agent with the `model` parameter
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_api_version")]
    pub api_version: String,
}

fn default_chat_base_url() -> String {
    "https://api.anthropic.com/v1".to_string()
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_api_version() -> String {
    "2023-06-01".to_string()
}

/// Asynchronous delegated-agent service
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DelegatedAgentSection {
    pub base_url: String,
    /// Environment variable containing a bearer token
    pub token_env: Option<String>,
    /// Timeout for dispatch and status requests; status checks must stay cheap
    #[serde(default = "default_client_timeout_secs")]
    pub timeout_secs: u64,
}

/// Ordered pipeline definition for one project
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineConfig {
    pub project: String,
    /// Externally visible status proposed once every step has completed
    #[serde(default)]
    pub complete_status: Option<String>,
    pub agents: Vec<AgentDescriptor>,
}

/// One agent step in a pipeline
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentDescriptor {
    /// Agent name (must match [a-zA-Z0-9._-]+)
    pub name: String,
    /// Provider kind resolved by the provider factory
    pub provider: String,
    /// Number of times a failed step may be restarted
    #[serde(default)]
    pub retries: u32,
    /// Externally visible status proposed after this step completes
    #[serde(default)]
    pub status_on_complete: Option<String>,
    #[serde(default)]
    pub params: BTreeMap<String, serde_json::Value>,
}

impl AgentDescriptor {
    pub fn new(name: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            provider: provider.into(),
            retries: 0,
            status_on_complete: None,
            params: BTreeMap::new(),
        }
    }

    /// Builder method for the retry budget
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Builder method for the completion status proposal
    pub fn with_status_on_complete(mut self, status: impl Into<String>) -> Self {
        self.status_on_complete = Some(status.into());
        self
    }

    /// Builder method for a single parameter
    pub fn with_param(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    /// String parameter lookup
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(|v| v.as_str())
    }

    /// Instructions prepended to every prompt for this agent
    pub fn instructions(&self) -> Option<&str> {
        self.param_str("instructions")
    }
}

impl PipelineConfig {
    pub fn new(project: impl Into<String>, agents: Vec<AgentDescriptor>) -> Self {
        Self {
            project: project.into(),
            complete_status: None,
            agents,
        }
    }

    /// Descriptor for a 1-based step position
    pub fn descriptor(&self, position: u32) -> Option<&AgentDescriptor> {
        let index = usize::try_from(position).ok()?.checked_sub(1)?;
        self.agents.get(index)
    }

    /// Validate the pipeline definition
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.project.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "pipeline project identifier must not be empty".to_string(),
            ));
        }

        if self.agents.is_empty() {
            return Err(ConfigError::InvalidConfig(format!(
                "pipeline '{}' must define at least one agent",
                self.project
            )));
        }

        let mut seen = HashSet::new();
        for agent in &self.agents {
            validate_agent_id(&agent.name)?;
            if agent.provider.trim().is_empty() {
                return Err(ConfigError::InvalidConfig(format!(
                    "agent '{}' in pipeline '{}' has no provider",
                    agent.name, self.project
                )));
            }
            if !seen.insert(agent.name.as_str()) {
                return Err(ConfigError::InvalidConfig(format!(
                    "agent '{}' appears twice in pipeline '{}'",
                    agent.name, self.project
                )));
            }
        }

        Ok(())
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid agent name: {0}")]
    InvalidAgentId(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Unknown provider kind '{kind}' for agent '{agent}'")]
    UnknownProviderKind { agent: String, kind: String },
    #[error("Provider '{0}' is used but [providers.{0}] is not configured")]
    MissingProviderSection(String),
    #[error("No pipeline configured for project '{0}'")]
    UnknownProject(String),
}

impl EngineConfig {
    /// Load configuration from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate settings that would otherwise fail at runtime
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.polling.interval_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "polling.interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.polling.max_consecutive_failures == 0 {
            return Err(ConfigError::InvalidConfig(
                "polling.max_consecutive_failures must be greater than 0".to_string(),
            ));
        }
        if self.polling.worker_pool_size == 0 {
            return Err(ConfigError::InvalidConfig(
                "polling.worker_pool_size must be greater than 0".to_string(),
            ));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(ConfigError::InvalidConfig(
                "retry.backoff_multiplier must be at least 1.0".to_string(),
            ));
        }
        if self.retry.request_timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "retry.request_timeout_secs must be greater than 0".to_string(),
            ));
        }

        let mut projects = HashSet::new();
        for pipeline in &self.pipelines {
            pipeline.validate()?;
            if !projects.insert(pipeline.project.as_str()) {
                return Err(ConfigError::InvalidConfig(format!(
                    "project '{}' has more than one pipeline",
                    pipeline.project
                )));
            }
        }

        if let Some(work_items) = &self.work_items {
            url::Url::parse(&work_items.base_url).map_err(|e| {
                ConfigError::InvalidConfig(format!("work_items.base_url is not a valid URL: {e}"))
            })?;
        }

        Ok(())
    }

    /// Pipeline definition for a project
    pub fn pipeline(&self, project: &str) -> Option<&PipelineConfig> {
        self.pipelines.iter().find(|p| p.project == project)
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[polling]
interval_secs = 1
max_consecutive_failures = 5
worker_pool_size = 4

[[pipelines]]
project = "web"
complete_status = "Done"

[[pipelines.agents]]
name = "planner"
provider = "chat"

[[pipelines.agents]]
name = "coder"
provider = "delegated_agent"
retries = 1

[[pipelines.agents]]
name = "reviewer"
provider = "chat"
status_on_complete = "In Review"
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}

/// Resolve a required environment variable
pub fn resolve_env_var(env_var_name: &str) -> Result<String, ConfigError> {
    std::env::var(env_var_name).map_err(|_| ConfigError::EnvVarNotFound(env_var_name.to_string()))
}

/// Resolve an optional environment variable reference
pub fn resolve_optional_env_var(env_var_name: Option<&String>) -> Result<Option<String>, ConfigError> {
    env_var_name.map(|name| resolve_env_var(name)).transpose()
}

/// Validate agent name format
fn validate_agent_id(agent_id: &str) -> Result<(), ConfigError> {
    let valid_chars = agent_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');

    if agent_id.is_empty() || !valid_chars {
        return Err(ConfigError::InvalidAgentId(format!(
            "Agent name '{agent_id}' must match pattern [a-zA-Z0-9._-]+"
        )));
    }

    Ok(())
}
