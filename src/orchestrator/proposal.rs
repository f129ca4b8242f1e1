//! Proposals for irreversible external effects
//!
//! An effect is never applied directly. It becomes a [`Proposal`] that waits
//! for a human decision; only a confirmed proposal is applied.

use crate::services::WorkItemId;
use crate::tracking::PendingProposal;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalKind {
    TaskCreate,
    StatusChange,
    IssueRecommend,
}

impl ProposalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProposalKind::TaskCreate => "task_create",
            ProposalKind::StatusChange => "status_change",
            ProposalKind::IssueRecommend => "issue_recommend",
        }
    }
}

impl std::str::FromStr for ProposalKind {
    type Err = ProposalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "task_create" => Ok(ProposalKind::TaskCreate),
            "status_change" => Ok(ProposalKind::StatusChange),
            "issue_recommend" => Ok(ProposalKind::IssueRecommend),
            other => Err(ProposalError::UnknownKind(other.to_string())),
        }
    }
}

impl fmt::Display for ProposalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Proposal lifecycle; every transition leaves `Pending` and is final
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProposalState {
    #[default]
    Pending,
    Confirmed,
    Rejected,
    Expired,
}

impl fmt::Display for ProposalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProposalState::Pending => "pending",
            ProposalState::Confirmed => "confirmed",
            ProposalState::Rejected => "rejected",
            ProposalState::Expired => "expired",
        };
        f.write_str(name)
    }
}

/// A human decision on a proposal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Confirm,
    Reject,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProposalError {
    #[error("Proposal {0} not found")]
    NotFound(Uuid),
    #[error("Proposal {id} is already {state}")]
    AlreadyResolved { id: Uuid, state: ProposalState },
    #[error("Proposal {0} expired before it was confirmed")]
    Expired(Uuid),
    #[error("Unknown proposal kind '{0}'")]
    UnknownKind(String),
    #[error("Invalid {kind} payload: {message}")]
    InvalidPayload { kind: ProposalKind, message: String },
}

/// A pending irreversible effect awaiting human confirmation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub id: Uuid,
    pub work_item: WorkItemId,
    /// Step whose completion produced the proposal; none for pipeline completion
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_position: Option<u32>,
    pub kind: ProposalKind,
    pub payload: Value,
    #[serde(default)]
    pub state: ProposalState,
    pub created_at: DateTime<Utc>,
}

/// Typed view of a proposal payload
#[derive(Debug, Clone, PartialEq)]
pub enum ProposalEffect {
    StatusChange {
        status: String,
    },
    CreateItem {
        project: Option<String>,
        title: String,
        body: String,
    },
}

#[derive(Deserialize)]
struct StatusChangePayload {
    status: String,
}

#[derive(Deserialize)]
struct CreateItemPayload {
    #[serde(default)]
    project: Option<String>,
    title: String,
    #[serde(default)]
    body: String,
}

impl Proposal {
    pub fn new(
        work_item: WorkItemId,
        step_position: Option<u32>,
        kind: ProposalKind,
        payload: Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            work_item,
            step_position,
            kind,
            payload,
            state: ProposalState::Pending,
            created_at: now,
        }
    }

    pub fn status_change(
        work_item: WorkItemId,
        step_position: Option<u32>,
        status: &str,
        now: DateTime<Utc>,
    ) -> Self {
        Self::new(
            work_item,
            step_position,
            ProposalKind::StatusChange,
            serde_json::json!({ "status": status }),
            now,
        )
    }

    /// Rebuild a still-pending proposal from its tracking block entry
    pub fn from_pending(
        work_item: WorkItemId,
        pending: &PendingProposal,
    ) -> Result<Self, ProposalError> {
        Ok(Self {
            id: pending.id,
            work_item,
            step_position: pending.step_position,
            kind: pending.kind.parse()?,
            payload: pending.payload.clone(),
            state: ProposalState::Pending,
            created_at: pending.created_at,
        })
    }

    pub fn to_pending(&self) -> PendingProposal {
        PendingProposal {
            id: self.id,
            kind: self.kind.as_str().to_string(),
            step_position: self.step_position,
            payload: self.payload.clone(),
            created_at: self.created_at,
        }
    }

    pub fn is_expired(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        now - self.created_at >= ttl
    }

    /// Parse the payload for this proposal's kind
    pub fn effect(&self) -> Result<ProposalEffect, ProposalError> {
        let invalid = |e: serde_json::Error| ProposalError::InvalidPayload {
            kind: self.kind,
            message: e.to_string(),
        };

        match self.kind {
            ProposalKind::StatusChange => {
                let payload: StatusChangePayload =
                    serde_json::from_value(self.payload.clone()).map_err(invalid)?;
                Ok(ProposalEffect::StatusChange {
                    status: payload.status,
                })
            }
            ProposalKind::TaskCreate | ProposalKind::IssueRecommend => {
                let payload: CreateItemPayload =
                    serde_json::from_value(self.payload.clone()).map_err(invalid)?;
                Ok(ProposalEffect::CreateItem {
                    project: payload.project,
                    title: payload.title,
                    body: payload.body,
                })
            }
        }
    }

    /// One-line description for operators and the audit trail
    pub fn summary(&self) -> String {
        match self.effect() {
            Ok(ProposalEffect::StatusChange { status }) => format!("status -> {status}"),
            Ok(ProposalEffect::CreateItem { title, .. }) => format!("{}: {title}", self.kind),
            Err(_) => self.kind.to_string(),
        }
    }
}

/// In-memory registry of proposals this process has created
#[derive(Debug)]
pub struct ProposalBook {
    proposals: DashMap<Uuid, Proposal>,
    ttl: Duration,
}

impl ProposalBook {
    pub fn new(ttl: Duration) -> Self {
        Self {
            proposals: DashMap::new(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn insert(&self, proposal: Proposal) {
        self.proposals.insert(proposal.id, proposal);
    }

    /// Insert unless the id is already known; returns whether it was added
    pub fn restore(&self, proposal: Proposal) -> bool {
        match self.proposals.entry(proposal.id) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(proposal);
                true
            }
        }
    }

    pub fn get(&self, id: Uuid) -> Option<Proposal> {
        self.proposals.get(&id).map(|entry| entry.clone())
    }

    pub fn len(&self) -> usize {
        self.proposals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proposals.is_empty()
    }

    /// Pending proposals for one item, oldest first
    pub fn pending_for(&self, work_item: &WorkItemId) -> Vec<Proposal> {
        let mut pending: Vec<Proposal> = self
            .proposals
            .iter()
            .filter(|entry| {
                entry.state == ProposalState::Pending && &entry.work_item == work_item
            })
            .map(|entry| entry.clone())
            .collect();
        pending.sort_by_key(|p| p.created_at);
        pending
    }

    /// Apply a decision to a known pending proposal.
    ///
    /// A confirm arriving after the TTL marks the proposal expired instead.
    pub fn resolve(
        &self,
        id: Uuid,
        decision: Decision,
        now: DateTime<Utc>,
    ) -> Result<Proposal, ProposalError> {
        let mut entry = self
            .proposals
            .get_mut(&id)
            .ok_or(ProposalError::NotFound(id))?;

        if entry.state != ProposalState::Pending {
            return Err(ProposalError::AlreadyResolved {
                id,
                state: entry.state,
            });
        }

        if decision == Decision::Confirm && entry.is_expired(self.ttl, now) {
            entry.state = ProposalState::Expired;
            return Err(ProposalError::Expired(id));
        }

        entry.state = match decision {
            Decision::Confirm => ProposalState::Confirmed,
            Decision::Reject => ProposalState::Rejected,
        };
        Ok(entry.clone())
    }

    /// Expire pending proposals older than the TTL and forget every entry
    /// past the TTL. Returns the proposals that expired undecided.
    ///
    /// A confirm for a forgotten proposal is still refused by its own
    /// `created_at`, so dropping resolved entries loses nothing.
    pub fn expire_stale(&self, now: DateTime<Utc>) -> Vec<Proposal> {
        let mut expired = Vec::new();
        self.proposals.retain(|_, proposal| {
            if !proposal.is_expired(self.ttl, now) {
                return true;
            }
            if proposal.state == ProposalState::Pending {
                proposal.state = ProposalState::Expired;
                expired.push(proposal.clone());
            }
            false
        });
        expired
    }
}
