//! External services the engine consumes
//!
//! - [`WorkItemService`]: reads and writes work item bodies and metadata
//! - [`PipelineConfigStore`]: serves pipeline definitions by project
//! - [`ProposalSurface`]: the human-in-the-loop channel for proposals

pub mod config_store;
pub mod http;
pub mod proposal_surface;

pub use config_store::StaticConfigStore;
pub use http::HttpWorkItemService;
pub use proposal_surface::InMemoryProposalSurface;

use crate::config::{ConfigError, PipelineConfig};
use crate::orchestrator::Proposal;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Work item identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkItemId(String);

impl WorkItemId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkItemId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Externally visible metadata of a work item
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ItemMetadata {
    /// Project whose pipeline applies to this item
    pub project: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: WorkItemId,
    #[serde(default)]
    pub body: String,
    #[serde(flatten)]
    pub metadata: ItemMetadata,
}

/// A work item to be created by a confirmed proposal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemDraft {
    pub project: String,
    pub title: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ServiceError {
    #[error("Work item {0} not found")]
    NotFound(WorkItemId),
    #[error("Service returned {status}: {message}")]
    Http { status: u16, message: String },
    #[error("Service unreachable: {0}")]
    Transport(String),
    #[error("Invalid service response: {0}")]
    InvalidResponse(String),
}

impl ServiceError {
    /// Whether a later attempt may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            ServiceError::Transport(_) => true,
            ServiceError::Http { status, .. } => *status == 429 || *status >= 500,
            ServiceError::NotFound(_) | ServiceError::InvalidResponse(_) => false,
        }
    }
}

#[async_trait]
pub trait WorkItemService: Send + Sync {
    async fn get(&self, id: &WorkItemId) -> Result<WorkItem, ServiceError>;

    /// Replace the body and, when given, the visible status
    async fn update(
        &self,
        id: &WorkItemId,
        body: &str,
        status: Option<&str>,
    ) -> Result<(), ServiceError>;

    /// Store a step output next to the item and return a reference to it
    async fn attach_output(
        &self,
        id: &WorkItemId,
        agent: &str,
        text: &str,
    ) -> Result<String, ServiceError>;

    async fn create_item(&self, draft: &ItemDraft) -> Result<WorkItemId, ServiceError>;

    async fn list_items(&self) -> Result<Vec<WorkItemId>, ServiceError>;
}

#[async_trait]
pub trait PipelineConfigStore: Send + Sync {
    async fn get_config(&self, project: &str) -> Result<PipelineConfig, ConfigError>;
}

/// Invoked at most once with the decided proposal
pub type ProposalCallback = Box<dyn FnOnce(Proposal) + Send + Sync>;

#[async_trait]
pub trait ProposalSurface: Send + Sync {
    /// Publish a proposal for a human decision.
    ///
    /// Called again with the same proposal after a restart, so publishing an
    /// id the surface already holds must not create a second entry.
    async fn create_proposal(&self, proposal: &Proposal) -> Result<Uuid, ServiceError>;

    fn on_confirm(&self, id: Uuid, callback: ProposalCallback);

    fn on_reject(&self, id: Uuid, callback: ProposalCallback);

    /// Take an expired proposal off the surface
    fn withdraw(&self, _id: Uuid) {}
}
