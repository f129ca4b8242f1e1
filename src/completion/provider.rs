//! Completion provider abstraction
//!
//! Two execution models sit behind one closed enum: synchronous providers
//! that return text from a bounded call, and delegated agents that return a
//! handle and are observed by polling `is_ready`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Per-agent parameters passed through to the provider
pub type ProviderParams = BTreeMap<String, Value>;

/// Opaque reference to delegated work in progress
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentHandle(String);

impl AgentHandle {
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Progress of delegated work
#[derive(Debug, Clone, PartialEq)]
pub enum ReadyState {
    NotReady,
    Ready(String),
    Failed(String),
}

/// Provider errors
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProviderError {
    /// Worth retrying: rate limits, server errors, network trouble
    #[error("Transient provider failure: {0}")]
    Transient(String),
    /// Retrying will not help: bad request, auth, unknown handle
    #[error("Permanent provider failure: {0}")]
    Permanent(String),
    #[error("Provider call timed out after {0:?}")]
    Timeout(Duration),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout(_))
    }
}

/// Bounded text generation
#[async_trait]
pub trait SyncProvider: Send + Sync {
    /// Provider name for logs
    fn name(&self) -> &str;

    /// Produce text for a prompt
    async fn produce(&self, prompt: &str, params: &ProviderParams) -> Result<String, ProviderError>;
}

/// Long-running delegated agent
#[async_trait]
pub trait AsyncAgentProvider: Send + Sync {
    /// Provider name for logs
    fn name(&self) -> &str;

    /// Dispatch work and return immediately with a handle
    async fn produce(
        &self,
        prompt: &str,
        params: &ProviderParams,
    ) -> Result<AgentHandle, ProviderError>;

    /// Cheap status check; must not wait for the work to finish
    async fn is_ready(&self, handle: &AgentHandle) -> Result<ReadyState, ProviderError>;
}

/// A provider resolved for one pipeline step
#[derive(Clone)]
pub enum CompletionProvider {
    Sync(Arc<dyn SyncProvider>),
    Async(Arc<dyn AsyncAgentProvider>),
}

impl CompletionProvider {
    pub fn name(&self) -> &str {
        match self {
            CompletionProvider::Sync(provider) => provider.name(),
            CompletionProvider::Async(provider) => provider.name(),
        }
    }

    pub fn is_async(&self) -> bool {
        matches!(self, CompletionProvider::Async(_))
    }

    pub fn as_async(&self) -> Option<&Arc<dyn AsyncAgentProvider>> {
        match self {
            CompletionProvider::Async(provider) => Some(provider),
            CompletionProvider::Sync(_) => None,
        }
    }
}

impl fmt::Debug for CompletionProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompletionProvider::Sync(p) => f.debug_tuple("Sync").field(&p.name()).finish(),
            CompletionProvider::Async(p) => f.debug_tuple("Async").field(&p.name()).finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transience() {
        assert!(ProviderError::Transient("503".to_string()).is_transient());
        assert!(ProviderError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(!ProviderError::Permanent("400".to_string()).is_transient());
    }

    #[test]
    fn test_handle_serializes_as_string() {
        let handle = AgentHandle::new("task-1");
        assert_eq!(serde_json::to_string(&handle).unwrap(), "\"task-1\"");
        assert_eq!(handle.to_string(), "task-1");
    }

    #[test]
    fn test_error_display() {
        let errors = vec![
            ProviderError::Transient("test".to_string()),
            ProviderError::Permanent("test".to_string()),
            ProviderError::Timeout(Duration::from_millis(10)),
        ];

        for error in errors {
            assert!(!error.to_string().is_empty());
        }
    }
}
