//! Mock implementations for testing
//!
//! Provides in-memory work item storage and scripted completion providers so
//! pipelines can be exercised without a tracker or model endpoint.

use crate::completion::{
    AgentHandle, AsyncAgentProvider, ProviderError, ProviderParams, ReadyState, SyncProvider,
};
use crate::services::{
    ItemDraft, ItemMetadata, ServiceError, WorkItem, WorkItemId, WorkItemService,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// An output attached to a work item
#[derive(Debug, Clone, PartialEq)]
pub struct AttachedOutput {
    pub work_item: WorkItemId,
    pub agent: String,
    pub text: String,
    pub output_ref: String,
}

/// In-memory work item service
#[derive(Debug, Default)]
pub struct MockWorkItemService {
    pub items: Arc<Mutex<BTreeMap<WorkItemId, WorkItem>>>,
    pub outputs: Arc<Mutex<Vec<AttachedOutput>>>,
    pub created: Arc<Mutex<Vec<ItemDraft>>>,
    pub update_count: AtomicUsize,
    pub fail_updates: AtomicBool,
    pub fail_outputs: AtomicBool,
}

impl MockWorkItemService {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_item(&self, id: &str, project: &str, body: &str) -> WorkItemId {
        let id = WorkItemId::new(id);
        let item = WorkItem {
            id: id.clone(),
            body: body.to_string(),
            metadata: ItemMetadata {
                project: project.to_string(),
                ..Default::default()
            },
        };
        self.items.lock().await.insert(id.clone(), item);
        id
    }

    pub async fn body(&self, id: &WorkItemId) -> Option<String> {
        self.items.lock().await.get(id).map(|item| item.body.clone())
    }

    pub async fn set_body(&self, id: &WorkItemId, body: &str) {
        if let Some(item) = self.items.lock().await.get_mut(id) {
            item.body = body.to_string();
        }
    }

    pub async fn status(&self, id: &WorkItemId) -> Option<String> {
        self.items
            .lock()
            .await
            .get(id)
            .and_then(|item| item.metadata.status.clone())
    }

    pub async fn get_outputs(&self) -> Vec<AttachedOutput> {
        self.outputs.lock().await.clone()
    }

    pub async fn get_created(&self) -> Vec<ItemDraft> {
        self.created.lock().await.clone()
    }

    pub fn updates(&self) -> usize {
        self.update_count.load(Ordering::SeqCst)
    }

    pub fn set_fail_updates(&self, fail: bool) {
        self.fail_updates.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_outputs(&self, fail: bool) {
        self.fail_outputs.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl WorkItemService for MockWorkItemService {
    async fn get(&self, id: &WorkItemId) -> Result<WorkItem, ServiceError> {
        self.items
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| ServiceError::NotFound(id.clone()))
    }

    async fn update(
        &self,
        id: &WorkItemId,
        body: &str,
        status: Option<&str>,
    ) -> Result<(), ServiceError> {
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(ServiceError::Transport("mock update failure".to_string()));
        }

        let mut items = self.items.lock().await;
        let item = items
            .get_mut(id)
            .ok_or_else(|| ServiceError::NotFound(id.clone()))?;
        item.body = body.to_string();
        if let Some(status) = status {
            item.metadata.status = Some(status.to_string());
        }
        self.update_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn attach_output(
        &self,
        id: &WorkItemId,
        agent: &str,
        text: &str,
    ) -> Result<String, ServiceError> {
        if self.fail_outputs.load(Ordering::SeqCst) {
            return Err(ServiceError::Transport("mock output failure".to_string()));
        }

        let mut outputs = self.outputs.lock().await;
        let output_ref = format!("output-{}", outputs.len() + 1);
        outputs.push(AttachedOutput {
            work_item: id.clone(),
            agent: agent.to_string(),
            text: text.to_string(),
            output_ref: output_ref.clone(),
        });
        Ok(output_ref)
    }

    async fn create_item(&self, draft: &ItemDraft) -> Result<WorkItemId, ServiceError> {
        let mut created = self.created.lock().await;
        created.push(draft.clone());
        let id = WorkItemId::new(format!("created-{}", created.len()));

        self.items.lock().await.insert(
            id.clone(),
            WorkItem {
                id: id.clone(),
                body: draft.body.clone(),
                metadata: ItemMetadata {
                    project: draft.project.clone(),
                    status: draft.status.clone(),
                    title: Some(draft.title.clone()),
                    ..Default::default()
                },
            },
        );
        Ok(id)
    }

    async fn list_items(&self) -> Result<Vec<WorkItemId>, ServiceError> {
        Ok(self.items.lock().await.keys().cloned().collect())
    }
}

/// Synchronous provider that replays scripted results
#[derive(Debug, Default)]
pub struct MockSyncProvider {
    pub script: Arc<Mutex<VecDeque<Result<String, ProviderError>>>>,
    pub prompts: Arc<Mutex<Vec<String>>>,
    /// Returned once the script runs out
    pub fallback: String,
    pub delay: Option<Duration>,
    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl MockSyncProvider {
    pub fn new(script: Vec<Result<String, ProviderError>>) -> Self {
        Self {
            script: Arc::new(Mutex::new(script.into())),
            fallback: "Mock output".to_string(),
            ..Default::default()
        }
    }

    pub fn always(output: impl Into<String>) -> Self {
        Self {
            fallback: output.into(),
            ..Default::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub async fn get_prompts(&self) -> Vec<String> {
        self.prompts.lock().await.clone()
    }

    pub async fn calls(&self) -> usize {
        self.prompts.lock().await.len()
    }

    /// Highest number of overlapping calls observed
    pub fn peak_concurrency(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SyncProvider for MockSyncProvider {
    fn name(&self) -> &str {
        "mock_sync"
    }

    async fn produce(&self, prompt: &str, _params: &ProviderParams) -> Result<String, ProviderError> {
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);
        self.prompts.lock().await.push(prompt.to_string());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let next = self.script.lock().await.pop_front();
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        next.unwrap_or_else(|| Ok(self.fallback.clone()))
    }
}

/// Delegated agent whose readiness is set by the test
#[derive(Debug, Default)]
pub struct MockAsyncProvider {
    pub dispatched: Arc<Mutex<Vec<(AgentHandle, String)>>>,
    pub states: Arc<Mutex<HashMap<AgentHandle, ReadyState>>>,
    pub dispatch_errors: Arc<Mutex<VecDeque<ProviderError>>>,
    pub check_error: Arc<Mutex<Option<ProviderError>>>,
    pub check_count: AtomicUsize,
}

impl MockAsyncProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handles issued so far, in dispatch order
    pub async fn handles(&self) -> Vec<AgentHandle> {
        self.dispatched
            .lock()
            .await
            .iter()
            .map(|(handle, _)| handle.clone())
            .collect()
    }

    pub async fn get_dispatched(&self) -> Vec<(AgentHandle, String)> {
        self.dispatched.lock().await.clone()
    }

    pub async fn set_ready(&self, handle: &AgentHandle, output: impl Into<String>) {
        self.states
            .lock()
            .await
            .insert(handle.clone(), ReadyState::Ready(output.into()));
    }

    pub async fn set_failed(&self, handle: &AgentHandle, reason: impl Into<String>) {
        self.states
            .lock()
            .await
            .insert(handle.clone(), ReadyState::Failed(reason.into()));
    }

    /// Fail the next dispatches with these errors, in order
    pub async fn fail_dispatch(&self, errors: Vec<ProviderError>) {
        self.dispatch_errors.lock().await.extend(errors);
    }

    /// Make every readiness check fail until cleared with `None`
    pub async fn set_check_error(&self, error: Option<ProviderError>) {
        *self.check_error.lock().await = error;
    }

    pub fn checks(&self) -> usize {
        self.check_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AsyncAgentProvider for MockAsyncProvider {
    fn name(&self) -> &str {
        "mock_async"
    }

    async fn produce(
        &self,
        prompt: &str,
        _params: &ProviderParams,
    ) -> Result<AgentHandle, ProviderError> {
        if let Some(error) = self.dispatch_errors.lock().await.pop_front() {
            return Err(error);
        }

        let mut dispatched = self.dispatched.lock().await;
        let handle = AgentHandle::new(format!("handle-{}", dispatched.len() + 1));
        dispatched.push((handle.clone(), prompt.to_string()));
        Ok(handle)
    }

    async fn is_ready(&self, handle: &AgentHandle) -> Result<ReadyState, ProviderError> {
        self.check_count.fetch_add(1, Ordering::SeqCst);

        if let Some(error) = self.check_error.lock().await.clone() {
            return Err(error);
        }

        match self.states.lock().await.get(handle) {
            Some(state) => Ok(state.clone()),
            None if self.dispatched.lock().await.iter().any(|(h, _)| h == handle) => {
                Ok(ReadyState::NotReady)
            }
            None => Err(ProviderError::Permanent(format!("unknown handle {handle}"))),
        }
    }
}
