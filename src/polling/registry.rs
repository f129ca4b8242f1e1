//! Registry of delegated steps awaiting readiness

use crate::completion::AgentHandle;
use crate::observability::metrics::metrics;
use crate::services::WorkItemId;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

/// A running asynchronous step the scheduler checks every tick
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PollTarget {
    pub work_item: WorkItemId,
    /// Project whose pipeline defines the step
    pub project: String,
    pub step_position: u32,
    pub agent: String,
    pub handle: AgentHandle,
    pub last_polled_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

impl PollTarget {
    pub fn new(
        work_item: WorkItemId,
        project: impl Into<String>,
        step_position: u32,
        agent: impl Into<String>,
        handle: AgentHandle,
    ) -> Self {
        Self {
            work_item,
            project: project.into(),
            step_position,
            agent: agent.into(),
            handle,
            last_polled_at: None,
            consecutive_failures: 0,
        }
    }

    /// Whether this target describes the given step and handle
    pub fn matches(&self, step_position: u32, handle: Option<&AgentHandle>) -> bool {
        self.step_position == step_position && handle.map_or(true, |h| h == &self.handle)
    }
}

/// Poll targets keyed by work item; at most one per item
#[derive(Debug, Default)]
pub struct PollRegistry {
    targets: DashMap<WorkItemId, PollTarget>,
}

impl PollRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the target for its work item
    pub fn register(&self, target: PollTarget) -> Option<PollTarget> {
        let previous = self.targets.insert(target.work_item.clone(), target);
        metrics().set_active_poll_targets(self.targets.len());
        previous
    }

    pub fn remove(&self, work_item: &WorkItemId) -> Option<PollTarget> {
        let removed = self.targets.remove(work_item).map(|(_, target)| target);
        metrics().set_active_poll_targets(self.targets.len());
        removed
    }

    /// Remove the item's target only if it still describes the given step
    pub fn remove_matching(
        &self,
        work_item: &WorkItemId,
        step_position: u32,
        handle: Option<&AgentHandle>,
    ) -> Option<PollTarget> {
        let removed = self
            .targets
            .remove_if(work_item, |_, target| target.matches(step_position, handle))
            .map(|(_, target)| target);
        metrics().set_active_poll_targets(self.targets.len());
        removed
    }

    pub fn get(&self, work_item: &WorkItemId) -> Option<PollTarget> {
        self.targets.get(work_item).map(|entry| entry.clone())
    }

    pub fn contains(&self, work_item: &WorkItemId) -> bool {
        self.targets.contains_key(work_item)
    }

    /// Point-in-time copy of every target, ordered by work item
    pub fn snapshot(&self) -> Vec<PollTarget> {
        let mut targets: Vec<PollTarget> = self.targets.iter().map(|e| e.value().clone()).collect();
        targets.sort_by(|a, b| a.work_item.cmp(&b.work_item));
        targets
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Record a readiness check that reached the provider
    pub fn record_success(&self, work_item: &WorkItemId, now: DateTime<Utc>) {
        if let Some(mut target) = self.targets.get_mut(work_item) {
            target.last_polled_at = Some(now);
            target.consecutive_failures = 0;
        }
    }

    /// Record a transient check failure and return the new consecutive count
    pub fn record_failure(&self, work_item: &WorkItemId, now: DateTime<Utc>) -> u32 {
        match self.targets.get_mut(work_item) {
            Some(mut target) => {
                target.last_polled_at = Some(now);
                target.consecutive_failures += 1;
                target.consecutive_failures
            }
            None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(item: &str, position: u32, handle: &str) -> PollTarget {
        PollTarget::new(
            WorkItemId::new(item),
            "web",
            position,
            "coder",
            AgentHandle::new(handle),
        )
    }

    #[test]
    fn test_one_target_per_item() {
        let registry = PollRegistry::new();
        assert!(registry.register(target("a", 2, "h1")).is_none());
        let previous = registry.register(target("a", 2, "h2")).unwrap();

        assert_eq!(previous.handle, AgentHandle::new("h1"));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(&WorkItemId::new("a")).unwrap().handle, AgentHandle::new("h2"));
    }

    #[test]
    fn test_failure_counting_resets_on_success() {
        let registry = PollRegistry::new();
        let item = WorkItemId::new("a");
        registry.register(target("a", 2, "h1"));

        assert_eq!(registry.record_failure(&item, Utc::now()), 1);
        assert_eq!(registry.record_failure(&item, Utc::now()), 2);
        registry.record_success(&item, Utc::now());

        let current = registry.get(&item).unwrap();
        assert_eq!(current.consecutive_failures, 0);
        assert!(current.last_polled_at.is_some());
        assert_eq!(registry.record_failure(&WorkItemId::new("missing"), Utc::now()), 0);
    }

    #[test]
    fn test_remove_matching_ignores_stale_step() {
        let registry = PollRegistry::new();
        let item = WorkItemId::new("a");
        registry.register(target("a", 3, "h3"));

        assert!(registry.remove_matching(&item, 2, None).is_none());
        assert!(registry
            .remove_matching(&item, 3, Some(&AgentHandle::new("old")))
            .is_none());
        assert!(registry
            .remove_matching(&item, 3, Some(&AgentHandle::new("h3")))
            .is_some());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_snapshot_is_ordered() {
        let registry = PollRegistry::new();
        registry.register(target("c", 1, "h"));
        registry.register(target("a", 1, "h"));
        registry.register(target("b", 1, "h"));

        let items: Vec<String> = registry
            .snapshot()
            .into_iter()
            .map(|t| t.work_item.to_string())
            .collect();
        assert_eq!(items, vec!["a", "b", "c"]);
    }
}
