//! Per-work-item exclusive locks
//!
//! Lock entries are created on first use and dropped by `release_idle` once
//! nobody holds or waits on them. Different items never contend.

use crate::services::WorkItemId;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Held for the whole decode, decide, apply, encode sequence of one item
pub type ItemGuard = OwnedMutexGuard<()>;

#[derive(Debug, Default)]
pub struct ItemLocks {
    locks: DashMap<WorkItemId, Arc<Mutex<()>>>,
}

impl ItemLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, work_item: &WorkItemId) -> Arc<Mutex<()>> {
        self.locks.entry(work_item.clone()).or_default().clone()
    }

    /// Wait for the item's lock
    pub async fn acquire(&self, work_item: &WorkItemId) -> ItemGuard {
        self.entry(work_item).lock_owned().await
    }

    /// Take the item's lock only if it is free right now
    pub fn try_acquire(&self, work_item: &WorkItemId) -> Option<ItemGuard> {
        self.entry(work_item).try_lock_owned().ok()
    }

    /// Drop entries that no task holds or waits on; returns how many
    pub fn release_idle(&self) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        before.saturating_sub(self.locks.len())
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
