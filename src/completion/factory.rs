//! Provider factory
//!
//! Maps provider kind strings to builders. Built-in kinds are `chat` and
//! `delegated_agent`; callers may register more. Every synchronous provider
//! comes back wrapped in [`RetryingProvider`].

use super::provider::{AsyncAgentProvider, CompletionProvider, SyncProvider};
use super::providers::{ChatConfig, ChatProvider, DelegatedAgentConfig, DelegatedAgentProvider};
use super::retry::{RetryPolicy, RetryingProvider};
use crate::config::{AgentDescriptor, ConfigError, EngineConfig, PipelineConfig};
use once_cell::sync::OnceCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub const CHAT_KIND: &str = "chat";
pub const DELEGATED_AGENT_KIND: &str = "delegated_agent";

/// Builds a provider for one agent descriptor
pub type ProviderBuilder =
    Arc<dyn Fn(&AgentDescriptor) -> Result<CompletionProvider, ConfigError> + Send + Sync>;

/// Resolves agent descriptors to providers by kind
pub struct ProviderFactory {
    builders: HashMap<String, ProviderBuilder>,
    retry: RetryPolicy,
}

impl ProviderFactory {
    /// Empty factory with no registered kinds
    pub fn new(retry: RetryPolicy) -> Self {
        Self {
            builders: HashMap::new(),
            retry,
        }
    }

    /// Factory with the built-in kinds configured from `config`
    ///
    /// Kinds whose `[providers.*]` section is absent stay registered and fail
    /// with [`ConfigError::MissingProviderSection`] when a pipeline uses them.
    pub fn from_config(config: &EngineConfig) -> Self {
        let mut factory = Self::new(RetryPolicy::from(&config.retry));

        let chat_section = config.providers.chat.clone();
        let request_timeout = Duration::from_secs(config.retry.request_timeout_secs);
        let shared_chat: OnceCell<Arc<ChatProvider>> = OnceCell::new();
        factory.register(CHAT_KIND, move |_descriptor| {
            let section = chat_section
                .as_ref()
                .ok_or_else(|| ConfigError::MissingProviderSection(CHAT_KIND.to_string()))?;
            let provider = shared_chat.get_or_try_init(|| {
                let chat_config = ChatConfig::from_section(section, request_timeout)?;
                ChatProvider::new(chat_config).map(Arc::new)
            })?;
            Ok(CompletionProvider::Sync(provider.clone()))
        });

        let delegated_section = config.providers.delegated_agent.clone();
        factory.register(DELEGATED_AGENT_KIND, move |descriptor| {
            let section = delegated_section.as_ref().ok_or_else(|| {
                ConfigError::MissingProviderSection(DELEGATED_AGENT_KIND.to_string())
            })?;
            let agent_name = descriptor
                .param_str("agent")
                .unwrap_or(&descriptor.name)
                .to_string();
            let provider =
                DelegatedAgentProvider::new(agent_name, DelegatedAgentConfig::from_section(section)?)?;
            Ok(CompletionProvider::Async(Arc::new(provider)))
        });

        factory
    }

    /// Register a builder for a provider kind, replacing any existing one
    pub fn register<F>(&mut self, kind: impl Into<String>, builder: F)
    where
        F: Fn(&AgentDescriptor) -> Result<CompletionProvider, ConfigError> + Send + Sync + 'static,
    {
        self.builders.insert(kind.into(), Arc::new(builder));
    }

    /// Register a single shared synchronous provider under `kind`
    pub fn register_sync(&mut self, kind: impl Into<String>, provider: Arc<dyn SyncProvider>) {
        self.register(kind, move |_| Ok(CompletionProvider::Sync(provider.clone())));
    }

    /// Register a single shared delegated agent provider under `kind`
    pub fn register_async(&mut self, kind: impl Into<String>, provider: Arc<dyn AsyncAgentProvider>) {
        self.register(kind, move |_| Ok(CompletionProvider::Async(provider.clone())));
    }

    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.builders.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Resolve the provider for one agent
    pub fn resolve(&self, descriptor: &AgentDescriptor) -> Result<CompletionProvider, ConfigError> {
        let builder =
            self.builders
                .get(&descriptor.provider)
                .ok_or_else(|| ConfigError::UnknownProviderKind {
                    agent: descriptor.name.clone(),
                    kind: descriptor.provider.clone(),
                })?;

        Ok(match builder(descriptor)? {
            CompletionProvider::Sync(inner) => CompletionProvider::Sync(Arc::new(
                RetryingProvider::new(inner, self.retry.clone()),
            )),
            provider @ CompletionProvider::Async(_) => provider,
        })
    }

    /// Validate a pipeline and resolve every stage
    pub fn resolve_pipeline(&self, config: PipelineConfig) -> Result<ResolvedPipeline, ConfigError> {
        config.validate()?;
        let providers = config
            .agents
            .iter()
            .map(|descriptor| self.resolve(descriptor))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ResolvedPipeline { config, providers })
    }
}

impl fmt::Debug for ProviderFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderFactory")
            .field("kinds", &self.kinds())
            .field("retry", &self.retry)
            .finish()
    }
}

/// A pipeline with a provider resolved for every stage
#[derive(Debug, Clone)]
pub struct ResolvedPipeline {
    config: PipelineConfig,
    providers: Vec<CompletionProvider>,
}

impl ResolvedPipeline {
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn project(&self) -> &str {
        &self.config.project
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Descriptor and provider for a 1-based position
    pub fn stage(&self, position: u32) -> Option<(&AgentDescriptor, &CompletionProvider)> {
        let descriptor = self.config.descriptor(position)?;
        let provider = self.providers.get(position as usize - 1)?;
        Some((descriptor, provider))
    }
}
