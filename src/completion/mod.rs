//! Completion providers
//!
//! Agents produce work through either a synchronous provider or a delegated
//! agent that is polled for readiness. The factory resolves per-agent
//! descriptors to concrete providers.

pub mod factory;
pub mod provider;
pub mod providers;
pub mod retry;

pub use factory::{ProviderFactory, ResolvedPipeline, CHAT_KIND, DELEGATED_AGENT_KIND};
pub use provider::{
    AgentHandle, AsyncAgentProvider, CompletionProvider, ProviderError, ProviderParams,
    ReadyState, SyncProvider,
};
pub use retry::{RetryPolicy, RetryingProvider};
