//! In-process proposal surface
//!
//! Holds published proposals with their callbacks until an operator decides.
//! The binary's console and the tests drive it through `confirm` / `reject`.

use super::{ProposalCallback, ProposalSurface, ServiceError};
use crate::orchestrator::{Proposal, ProposalError};
use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, info};
use uuid::Uuid;

struct Entry {
    proposal: Proposal,
    on_confirm: Option<ProposalCallback>,
    on_reject: Option<ProposalCallback>,
}

#[derive(Default)]
pub struct InMemoryProposalSurface {
    entries: DashMap<Uuid, Entry>,
}

impl InMemoryProposalSurface {
    pub fn new() -> Self {
        Self::default()
    }

    /// Proposals awaiting a decision, oldest first
    pub fn pending(&self) -> Vec<Proposal> {
        let mut pending: Vec<Proposal> = self
            .entries
            .iter()
            .map(|entry| entry.proposal.clone())
            .collect();
        pending.sort_by_key(|p| p.created_at);
        pending
    }

    pub fn get(&self, id: Uuid) -> Option<Proposal> {
        self.entries.get(&id).map(|entry| entry.proposal.clone())
    }

    pub fn confirm(&self, id: Uuid) -> Result<(), ProposalError> {
        let (_, entry) = self.entries.remove(&id).ok_or(ProposalError::NotFound(id))?;
        info!(proposal_id = %id, "Proposal confirmed by operator");
        if let Some(callback) = entry.on_confirm {
            callback(entry.proposal);
        }
        Ok(())
    }

    pub fn reject(&self, id: Uuid) -> Result<(), ProposalError> {
        let (_, entry) = self.entries.remove(&id).ok_or(ProposalError::NotFound(id))?;
        info!(proposal_id = %id, "Proposal rejected by operator");
        if let Some(callback) = entry.on_reject {
            callback(entry.proposal);
        }
        Ok(())
    }
}

#[async_trait]
impl ProposalSurface for InMemoryProposalSurface {
    async fn create_proposal(&self, proposal: &Proposal) -> Result<Uuid, ServiceError> {
        debug!(proposal_id = %proposal.id, kind = %proposal.kind, "Publishing proposal");
        self.entries.insert(
            proposal.id,
            Entry {
                proposal: proposal.clone(),
                on_confirm: None,
                on_reject: None,
            },
        );
        Ok(proposal.id)
    }

    fn on_confirm(&self, id: Uuid, callback: ProposalCallback) {
        if let Some(mut entry) = self.entries.get_mut(&id) {
            entry.on_confirm = Some(callback);
        }
    }

    fn on_reject(&self, id: Uuid, callback: ProposalCallback) {
        if let Some(mut entry) = self.entries.get_mut(&id) {
            entry.on_reject = Some(callback);
        }
    }

    fn withdraw(&self, id: Uuid) {
        self.entries.remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::WorkItemId;
    use chrono::Utc;
    use std::sync::{Arc, Mutex};

    fn proposal() -> Proposal {
        Proposal::status_change(WorkItemId::new("item-1"), Some(1), "Done", Utc::now())
    }

    #[tokio::test]
    async fn test_confirm_fires_confirm_callback_once() {
        let surface = InMemoryProposalSurface::new();
        let proposal = proposal();
        let id = surface.create_proposal(&proposal).await.unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let confirmed = seen.clone();
        surface.on_confirm(id, Box::new(move |p| confirmed.lock().unwrap().push(("confirm", p.id))));
        let rejected = seen.clone();
        surface.on_reject(id, Box::new(move |p| rejected.lock().unwrap().push(("reject", p.id))));

        assert_eq!(surface.pending().len(), 1);
        surface.confirm(id).unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![("confirm", id)]);
        assert!(surface.pending().is_empty());
        assert_eq!(surface.reject(id), Err(ProposalError::NotFound(id)));
    }

    #[tokio::test]
    async fn test_reject_fires_reject_callback() {
        let surface = InMemoryProposalSurface::new();
        let id = surface.create_proposal(&proposal()).await.unwrap();

        let fired = Arc::new(Mutex::new(false));
        let flag = fired.clone();
        surface.on_reject(id, Box::new(move |_| *flag.lock().unwrap() = true));

        surface.reject(id).unwrap();
        assert!(*fired.lock().unwrap());
    }

    #[tokio::test]
    async fn test_withdraw_removes_proposal() {
        let surface = InMemoryProposalSurface::new();
        let id = surface.create_proposal(&proposal()).await.unwrap();

        surface.withdraw(id);
        assert!(surface.get(id).is_none());
        assert_eq!(surface.confirm(id), Err(ProposalError::NotFound(id)));
    }
}
