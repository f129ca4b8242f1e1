//! Workflow orchestrator
//!
//! Every trigger for an item runs the same sequence under that item's lock:
//! read the item, decode its tracking block, ask the engine what to do,
//! execute, and write the body back if anything changed.
//!
//! Synchronous steps run to completion inside the trigger. Delegated steps
//! are dispatched, registered with the polling scheduler, and finished later
//! by a poll outcome trigger. Irreversible effects become proposals and are
//! only applied by a confirm decision.

use super::proposal::{
    Decision, Proposal, ProposalBook, ProposalEffect, ProposalError, ProposalKind,
};
use super::trigger::Trigger;
use crate::completion::{AsyncAgentProvider, CompletionProvider, ProviderFactory, ResolvedPipeline};
use crate::config::{AgentDescriptor, EngineConfig};
use crate::engine::{determine_next_action, get_current_step, validate_block, NextAction};
use crate::error::{sanitize_error_message, PipelineError, PipelineResult};
use crate::observability::metrics::metrics;
use crate::polling::{
    ItemGuard, ItemLocks, PollDriver, PollOutcome, PollRegistry, PollTarget, PollingScheduler,
    SchedulerSettings,
};
use crate::services::{
    ItemDraft, PipelineConfigStore, ProposalCallback, ProposalSurface, StaticConfigStore,
    WorkItemId, WorkItemService,
};
use crate::tracking::{
    decode_or_empty, render_into, strip_section, AppliedEffect, PipelineStatus, TrackingBlock,
};
use crate::{step_span, trigger_span};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

/// Failure reason for a step found running with no live call behind it
pub const INTERRUPTED_REASON: &str = "interrupted before completion";

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub proposal_ttl: chrono::Duration,
    pub scheduler: SchedulerSettings,
}

impl From<&EngineConfig> for OrchestratorSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            proposal_ttl: chrono::Duration::seconds(
                i64::try_from(config.proposals.ttl_secs).unwrap_or(i64::MAX / 1000),
            ),
            scheduler: SchedulerSettings::from(&config.polling),
        }
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

/// Outcome of a recovery scan
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub scanned: usize,
    /// Delegated steps put back under polling
    pub registered: usize,
    /// Items re-entered because a synchronous step was left running
    pub resubmitted: usize,
    /// Undecided proposals published again
    pub proposals: usize,
}

struct Inner {
    work_items: Arc<dyn WorkItemService>,
    config_store: Arc<dyn PipelineConfigStore>,
    surface: Arc<dyn ProposalSurface>,
    factory: ProviderFactory,
    pipelines: DashMap<String, Arc<ResolvedPipeline>>,
    registry: Arc<PollRegistry>,
    locks: Arc<ItemLocks>,
    proposals: ProposalBook,
    scheduler: PollingScheduler,
}

/// Drives work items through their agent pipelines
#[derive(Clone)]
pub struct WorkflowOrchestrator {
    inner: Arc<Inner>,
}

/// Mutable state of one trigger application
struct ItemRun<'a> {
    item: &'a WorkItemId,
    project: String,
    pipeline: Arc<ResolvedPipeline>,
    block: TrackingBlock,
    /// Body as last read from or written to the service
    body: String,
    status_update: Option<String>,
    last_output: Option<String>,
}

#[derive(Deserialize)]
struct OutputProposals {
    proposals: Vec<ProposedEffect>,
}

#[derive(Deserialize)]
struct ProposedEffect {
    kind: ProposalKind,
    #[serde(default)]
    payload: Value,
}

impl WorkflowOrchestrator {
    pub fn new(
        work_items: Arc<dyn WorkItemService>,
        config_store: Arc<dyn PipelineConfigStore>,
        surface: Arc<dyn ProposalSurface>,
        factory: ProviderFactory,
        settings: OrchestratorSettings,
    ) -> Self {
        let registry = Arc::new(PollRegistry::new());
        let locks = Arc::new(ItemLocks::new());

        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| Inner {
            work_items,
            config_store,
            surface,
            factory,
            pipelines: DashMap::new(),
            registry: registry.clone(),
            locks: locks.clone(),
            proposals: ProposalBook::new(settings.proposal_ttl),
            scheduler: PollingScheduler::new(
                Arc::new(OrchestratorDriver {
                    inner: weak.clone(),
                }),
                registry.clone(),
                locks.clone(),
                settings.scheduler.clone(),
            ),
        });

        Self { inner }
    }

    /// Orchestrator over the configured pipelines and built-in providers.
    ///
    /// Every configured pipeline is resolved here, so an unknown provider
    /// kind or a missing provider section fails construction.
    pub fn from_config(
        config: &EngineConfig,
        work_items: Arc<dyn WorkItemService>,
        surface: Arc<dyn ProposalSurface>,
    ) -> PipelineResult<Self> {
        let factory = ProviderFactory::from_config(config);
        let resolved = config
            .pipelines
            .iter()
            .map(|pipeline| factory.resolve_pipeline(pipeline.clone()))
            .collect::<Result<Vec<_>, _>>()?;

        let orchestrator = Self::new(
            work_items,
            Arc::new(StaticConfigStore::from_config(config)),
            surface,
            factory,
            OrchestratorSettings::from(config),
        );
        for pipeline in resolved {
            info!(project = %pipeline.project(), steps = pipeline.len(), "Pipeline loaded");
            orchestrator
                .inner
                .pipelines
                .insert(pipeline.project().to_string(), Arc::new(pipeline));
        }
        Ok(orchestrator)
    }

    /// Resolve and cache a project's pipeline; fails on unknown provider kinds
    pub async fn load_pipeline(&self, project: &str) -> PipelineResult<Arc<ResolvedPipeline>> {
        if let Some(pipeline) = self.inner.pipelines.get(project) {
            return Ok(pipeline.clone());
        }

        let config = self.inner.config_store.get_config(project).await?;
        let resolved = Arc::new(self.inner.factory.resolve_pipeline(config)?);
        info!(project = %project, steps = resolved.len(), "Pipeline loaded");
        self.inner
            .pipelines
            .insert(project.to_string(), resolved.clone());
        Ok(resolved)
    }

    /// Apply a trigger, waiting for the item's lock if another trigger holds it
    pub async fn submit_trigger(
        &self,
        item: &WorkItemId,
        trigger: Trigger,
    ) -> PipelineResult<TrackingBlock> {
        let guard = self.inner.locks.acquire(item).await;
        self.apply_locked(item, trigger, guard).await
    }

    /// Apply a trigger only if the item is idle right now
    pub async fn try_submit_trigger(
        &self,
        item: &WorkItemId,
        trigger: Trigger,
    ) -> PipelineResult<TrackingBlock> {
        let Some(guard) = self.inner.locks.try_acquire(item) else {
            metrics().trigger_busy();
            return Err(PipelineError::concurrency_conflict(item.as_str()));
        };
        self.apply_locked(item, trigger, guard).await
    }

    /// Apply a trigger given as a kind name and JSON payload
    pub async fn submit(
        &self,
        item: &WorkItemId,
        kind: &str,
        payload: Value,
    ) -> PipelineResult<TrackingBlock> {
        let trigger = Trigger::from_parts(kind, payload)?;
        self.submit_trigger(item, trigger).await
    }

    /// Current tracking block of an item
    pub async fn get_pipeline_status(&self, item: &WorkItemId) -> PipelineResult<TrackingBlock> {
        let work_item = self.inner.work_items.get(item).await?;
        Ok(decode_or_empty(&work_item.body))
    }

    pub fn proposal(&self, id: Uuid) -> Option<Proposal> {
        self.inner.proposals.get(id)
    }

    pub fn pending_proposals(&self, item: &WorkItemId) -> Vec<Proposal> {
        self.inner.proposals.pending_for(item)
    }

    pub fn poll_targets(&self) -> Vec<PollTarget> {
        self.inner.registry.snapshot()
    }

    pub fn default_poll_interval(&self) -> Duration {
        self.inner.scheduler.default_interval()
    }

    /// Start the polling loop; returns false if it was already running
    pub async fn start_polling(&self, interval: Duration) -> bool {
        self.inner.scheduler.start(interval).await
    }

    /// Stop polling after in-flight readiness checks finish
    pub async fn stop_polling(&self) {
        self.inner.scheduler.stop().await;
    }

    /// Run one polling tick immediately
    pub async fn poll_now(&self) {
        self.inner.scheduler.tick().await;
    }

    /// Rebuild poll targets from the bodies of all work items
    pub async fn recover(&self) -> PipelineResult<RecoveryReport> {
        let mut report = RecoveryReport::default();
        let mut orphaned = Vec::new();

        for id in self.inner.work_items.list_items().await? {
            report.scanned += 1;

            let work_item = match self.inner.work_items.get(&id).await {
                Ok(work_item) => work_item,
                Err(e) => {
                    warn!(work_item = %id, error = %e, "Skipping item during recovery");
                    continue;
                }
            };

            let block = decode_or_empty(&work_item.body);
            report.proposals += self.restore_proposals(&id, &block).await;

            let Some(step) = get_current_step(&block) else {
                continue;
            };

            let pipeline = match self.load_pipeline(&work_item.metadata.project).await {
                Ok(pipeline) => pipeline,
                Err(e) => {
                    warn!(work_item = %id, error = %e, "No pipeline for item during recovery");
                    continue;
                }
            };

            match (pipeline.stage(step.position), step.handle.as_ref()) {
                (Some((_, CompletionProvider::Async(_))), Some(handle)) => {
                    self.inner.registry.register(PollTarget::new(
                        id.clone(),
                        work_item.metadata.project.clone(),
                        step.position,
                        step.agent.clone(),
                        crate::completion::AgentHandle::new(handle.clone()),
                    ));
                    report.registered += 1;
                }
                _ => orphaned.push(id),
            }
        }

        for id in orphaned {
            match self.submit_trigger(&id, Trigger::Enter).await {
                Ok(_) => report.resubmitted += 1,
                Err(e) => warn!(work_item = %id, error = %e, "Failed to re-enter orphaned item"),
            }
        }

        info!(
            scanned = report.scanned,
            registered = report.registered,
            resubmitted = report.resubmitted,
            proposals = report.proposals,
            "Recovery complete"
        );
        Ok(report)
    }

    /// Expire proposals older than the TTL, withdraw them from the surface
    /// and drop them from their items' tracking blocks.
    ///
    /// A busy item keeps its expired entries until its next trigger, which
    /// drops them before doing anything else.
    pub async fn expire_stale_proposals(&self) -> Vec<Proposal> {
        let expired = self.inner.proposals.expire_stale(Utc::now());
        let mut items = HashSet::new();

        for proposal in &expired {
            self.inner.surface.withdraw(proposal.id);
            metrics().proposal_expired();
            info!(
                proposal_id = %proposal.id,
                work_item = %proposal.work_item,
                "Proposal expired without a decision"
            );
            items.insert(proposal.work_item.clone());
        }

        for item in items {
            let Some(guard) = self.inner.locks.try_acquire(&item) else {
                continue;
            };
            if let Err(e) = self.drop_expired_proposals(&item, guard).await {
                warn!(work_item = %item, error = %e, "Failed to drop expired proposals");
            }
        }
        expired
    }

    /// Put an item's undecided proposals back in the book and republish them
    async fn restore_proposals(&self, item: &WorkItemId, block: &TrackingBlock) -> usize {
        let now = Utc::now();
        let ttl = self.inner.proposals.ttl();
        let mut restored = 0;
        let mut has_expired = false;

        for pending in &block.pending_proposals {
            let proposal = match Proposal::from_pending(item.clone(), pending) {
                Ok(proposal) => proposal,
                Err(e) => {
                    warn!(work_item = %item, proposal_id = %pending.id, error = %e, "Unreadable pending proposal");
                    continue;
                }
            };
            if proposal.is_expired(ttl, now) {
                has_expired = true;
                continue;
            }
            if self.inner.proposals.restore(proposal.clone()) {
                self.publish(&proposal).await;
                restored += 1;
            }
        }

        if has_expired {
            let guard = self.inner.locks.acquire(item).await;
            if let Err(e) = self.drop_expired_proposals(item, guard).await {
                warn!(work_item = %item, error = %e, "Failed to drop expired proposals");
            }
        }
        restored
    }

    async fn drop_expired_proposals(
        &self,
        item: &WorkItemId,
        _guard: ItemGuard,
    ) -> PipelineResult<()> {
        let work_item = self.inner.work_items.get(item).await?;
        let mut block = decode_or_empty(&work_item.body);
        let cutoff = Utc::now() - self.inner.proposals.ttl();

        let dropped = block.drop_pending_before(cutoff);
        if dropped.is_empty() {
            return Ok(());
        }
        for pending in &dropped {
            self.inner.surface.withdraw(pending.id);
        }

        let rendered = render_into(&work_item.body, &block);
        self.inner.work_items.update(item, &rendered, None).await?;
        debug!(work_item = %item, dropped = dropped.len(), "Expired proposals dropped");
        Ok(())
    }

    async fn apply_locked(
        &self,
        item: &WorkItemId,
        trigger: Trigger,
        _guard: ItemGuard,
    ) -> PipelineResult<TrackingBlock> {
        metrics().trigger_received();
        let span = trigger_span!(work_item = %item, kind = trigger.kind());

        let result = self.apply(item, trigger).instrument(span).await;
        match &result {
            Ok(_) => metrics().trigger_applied(),
            Err(e) => {
                metrics().trigger_failed();
                warn!(work_item = %item, error = %e, "Trigger not applied");
            }
        }
        result
    }

    async fn apply(&self, item: &WorkItemId, trigger: Trigger) -> PipelineResult<TrackingBlock> {
        let work_item = self.inner.work_items.get(item).await?;
        let project = work_item.metadata.project.clone();
        let pipeline = self.load_pipeline(&project).await?;

        let block = decode_or_empty(&work_item.body);
        if let Err(violation) = validate_block(&block) {
            warn!(work_item = %item, %violation, "Tracking block violates ordering invariants");
        }

        let mut run = ItemRun {
            item,
            project,
            pipeline,
            block,
            body: work_item.body,
            status_update: None,
            last_output: None,
        };

        let cutoff = Utc::now() - self.inner.proposals.ttl();
        for expired in run.block.drop_pending_before(cutoff) {
            debug!(work_item = %item, proposal_id = %expired.id, "Dropping expired proposal");
            self.inner.surface.withdraw(expired.id);
        }

        match trigger {
            Trigger::Enter => {
                if run.block.is_empty() {
                    run.block = TrackingBlock::for_pipeline(run.pipeline.config());
                    info!(work_item = %item, project = %run.project, "Item entered pipeline");
                }
                self.advance(&mut run).await?;
            }
            Trigger::PollOutcome {
                position,
                handle,
                outcome,
            } => {
                if self
                    .apply_poll_outcome(&mut run, position, handle.as_ref(), outcome)
                    .await?
                {
                    self.advance(&mut run).await?;
                }
            }
            Trigger::Decision { proposal, decision } => {
                // A refused decision may still have cleared the proposal's entry
                let decided = self.apply_decision(&mut run, proposal, decision).await;
                self.persist(&mut run).await?;
                return decided.map(|()| run.block);
            }
        }

        self.persist(&mut run).await?;
        Ok(run.block)
    }

    /// Execute engine decisions until the pipeline waits or terminates
    async fn advance(&self, run: &mut ItemRun<'_>) -> PipelineResult<()> {
        if run.block.is_empty() {
            return Ok(());
        }

        loop {
            match determine_next_action(&run.block, run.pipeline.config()) {
                NextAction::AwaitCurrent(step) => {
                    if !self.resume_current(run, step.position, step.handle.clone())? {
                        return Ok(());
                    }
                }
                NextAction::StartStep(step) => {
                    if !self.start_step(run, step.position).await? {
                        return Ok(());
                    }
                }
                NextAction::PipelineComplete => {
                    self.complete_pipeline(run).await;
                    return Ok(());
                }
                NextAction::PipelineFailed { step, reason } => {
                    if run.block.status != PipelineStatus::Failed {
                        run.block.finish(PipelineStatus::Failed, Utc::now());
                        metrics().pipeline_failed();
                        error!(
                            work_item = %run.item,
                            position = step.position,
                            agent = %step.agent,
                            reason = %reason,
                            "Pipeline failed"
                        );
                    }
                    self.inner.registry.remove(run.item);
                    return Ok(());
                }
            }
        }
    }

    /// Reattach to a running step. Returns true if the step had to be failed
    /// and the engine should decide again.
    fn resume_current(
        &self,
        run: &mut ItemRun<'_>,
        position: u32,
        handle: Option<String>,
    ) -> PipelineResult<bool> {
        let is_async = matches!(
            run.pipeline.stage(position),
            Some((_, CompletionProvider::Async(_)))
        );

        match (is_async, handle) {
            (true, Some(handle)) => {
                let handle = crate::completion::AgentHandle::new(handle);
                let tracked = self
                    .inner
                    .registry
                    .get(run.item)
                    .is_some_and(|target| target.matches(position, Some(&handle)));
                if !tracked {
                    let agent = run
                        .block
                        .step(position)
                        .map(|step| step.agent.clone())
                        .unwrap_or_default();
                    self.inner.registry.register(PollTarget::new(
                        run.item.clone(),
                        run.project.clone(),
                        position,
                        agent,
                        handle,
                    ));
                    info!(work_item = %run.item, position, "Poll target re-registered");
                }
                Ok(false)
            }
            _ => {
                warn!(
                    work_item = %run.item,
                    position,
                    "Step was left in progress with no live call"
                );
                self.fail_step(run, position, INTERRUPTED_REASON)?;
                Ok(true)
            }
        }
    }

    /// Start a step. Returns true if it already finished (synchronously or by
    /// failing to dispatch) and the engine should decide again.
    async fn start_step(&self, run: &mut ItemRun<'_>, position: u32) -> PipelineResult<bool> {
        let now = Utc::now();
        let pipeline = run.pipeline.clone();

        let Some((descriptor, provider)) = pipeline.stage(position) else {
            run.block.start_step(position, now)?;
            self.fail_step(run, position, &format!("no agent configured at position {position}"))?;
            return Ok(true);
        };

        let prompt = build_prompt(descriptor, &strip_section(&run.body), run.last_output.as_deref());
        run.block.start_step(position, now)?;
        metrics().step_started();
        info!(
            work_item = %run.item,
            position,
            agent = %descriptor.name,
            provider = %provider.name(),
            attempt = run.block.step(position).map(|s| s.attempts).unwrap_or(1),
            "Step started"
        );

        let span = step_span!(work_item = %run.item, position, agent = %descriptor.name);

        match provider {
            CompletionProvider::Sync(provider) => {
                // Record in_progress before the call so a crash mid-call is detectable
                self.persist(run).await?;

                match provider
                    .produce(&prompt, &descriptor.params)
                    .instrument(span)
                    .await
                {
                    Ok(output) => self.complete_step(run, descriptor, position, output).await?,
                    Err(e) => self.fail_step(run, position, &e.to_string())?,
                }
                Ok(true)
            }
            CompletionProvider::Async(provider) => {
                let dispatched = self
                    .inner
                    .factory
                    .retry_policy()
                    .execute(provider.name(), || provider.produce(&prompt, &descriptor.params))
                    .instrument(span)
                    .await;

                match dispatched {
                    Ok(handle) => {
                        run.block.set_handle(position, handle.as_str())?;
                        info!(
                            work_item = %run.item,
                            position,
                            handle = %handle,
                            "Delegated step dispatched"
                        );
                        self.inner.registry.register(PollTarget::new(
                            run.item.clone(),
                            run.project.clone(),
                            position,
                            descriptor.name.clone(),
                            handle,
                        ));
                        Ok(false)
                    }
                    Err(e) => {
                        self.fail_step(run, position, &e.to_string())?;
                        Ok(true)
                    }
                }
            }
        }
    }

    async fn apply_poll_outcome(
        &self,
        run: &mut ItemRun<'_>,
        position: u32,
        handle: Option<&crate::completion::AgentHandle>,
        outcome: PollOutcome,
    ) -> PipelineResult<bool> {
        let current = get_current_step(&run.block).cloned();
        let is_current = current.as_ref().is_some_and(|step| {
            step.position == position
                && handle.map_or(true, |h| step.handle.as_deref() == Some(h.as_str()))
        });

        if !is_current {
            debug!(work_item = %run.item, position, "Ignoring stale poll outcome");
            self.inner
                .registry
                .remove_matching(run.item, position, handle);
            return Ok(false);
        }

        match outcome {
            PollOutcome::Ready { output } => {
                let pipeline = run.pipeline.clone();
                let fallback;
                let descriptor = match pipeline.config().descriptor(position) {
                    Some(descriptor) => descriptor,
                    None => {
                        let agent = current.map(|step| step.agent).unwrap_or_default();
                        fallback = AgentDescriptor::new(agent, "");
                        &fallback
                    }
                };
                self.complete_step(run, descriptor, position, output).await?;
            }
            PollOutcome::Failed { reason } => self.fail_step(run, position, &reason)?,
        }

        self.inner
            .registry
            .remove_matching(run.item, position, handle);
        Ok(true)
    }

    async fn complete_step(
        &self,
        run: &mut ItemRun<'_>,
        descriptor: &AgentDescriptor,
        position: u32,
        output: String,
    ) -> PipelineResult<()> {
        let output_ref = self
            .inner
            .work_items
            .attach_output(run.item, &descriptor.name, &output)
            .await?;

        let now = Utc::now();
        let elapsed = step_elapsed(&run.block, position, now);
        run.block.complete_step(position, Some(output_ref), now)?;
        metrics().step_completed(elapsed);
        info!(
            work_item = %run.item,
            position,
            agent = %descriptor.name,
            elapsed_ms = elapsed.as_millis() as u64,
            "Step complete"
        );

        for proposed in proposals_in_output(&output) {
            self.propose(run, Some(position), proposed.kind, proposed.payload)
                .await;
        }
        if let Some(status) = &descriptor.status_on_complete {
            self.propose(
                run,
                Some(position),
                ProposalKind::StatusChange,
                serde_json::json!({ "status": status }),
            )
            .await;
        }

        run.last_output = Some(output);
        Ok(())
    }

    fn fail_step(&self, run: &mut ItemRun<'_>, position: u32, reason: &str) -> PipelineResult<()> {
        let reason = sanitize_error_message(reason);
        let now = Utc::now();
        let elapsed = step_elapsed(&run.block, position, now);
        run.block.fail_step(position, reason.clone(), now)?;
        metrics().step_failed(elapsed);
        warn!(work_item = %run.item, position, reason = %reason, "Step failed");
        Ok(())
    }

    async fn complete_pipeline(&self, run: &mut ItemRun<'_>) {
        if run.block.status == PipelineStatus::Complete {
            return;
        }

        run.block.finish(PipelineStatus::Complete, Utc::now());
        metrics().pipeline_completed();
        info!(work_item = %run.item, "Pipeline complete");

        if let Some(status) = run.pipeline.config().complete_status.clone() {
            self.propose(
                run,
                None,
                ProposalKind::StatusChange,
                serde_json::json!({ "status": status }),
            )
            .await;
        }
    }

    async fn apply_decision(
        &self,
        run: &mut ItemRun<'_>,
        proposal: Proposal,
        decision: Decision,
    ) -> PipelineResult<()> {
        if &proposal.work_item != run.item {
            return Err(PipelineError::InvalidTrigger(format!(
                "proposal {} belongs to work item {}",
                proposal.id, proposal.work_item
            )));
        }

        let now = Utc::now();
        let book = &self.inner.proposals;

        if decision == Decision::Reject {
            match book.resolve(proposal.id, Decision::Reject, now) {
                Ok(_) | Err(ProposalError::NotFound(_)) => {
                    run.block.remove_pending_proposal(proposal.id);
                    metrics().proposal_rejected();
                    info!(proposal_id = %proposal.id, kind = %proposal.kind, "Proposal rejected");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
        }

        if run.block.has_effect(proposal.id) {
            debug!(proposal_id = %proposal.id, "Proposal already applied");
            return Ok(());
        }

        match book.resolve(proposal.id, Decision::Confirm, now) {
            Ok(_) => {}
            // Confirmed earlier but the effect never landed
            Err(ProposalError::AlreadyResolved {
                state: super::proposal::ProposalState::Confirmed,
                ..
            }) => {}
            // Created before a restart; the trigger carries the full proposal
            Err(ProposalError::NotFound(id)) => {
                if proposal.is_expired(book.ttl(), now) {
                    run.block.remove_pending_proposal(id);
                    metrics().proposal_expired();
                    return Err(ProposalError::Expired(id).into());
                }
            }
            Err(ProposalError::Expired(id)) => {
                run.block.remove_pending_proposal(id);
                metrics().proposal_expired();
                self.inner.surface.withdraw(id);
                return Err(ProposalError::Expired(id).into());
            }
            Err(e) => return Err(e.into()),
        }

        let summary = match proposal.effect()? {
            ProposalEffect::StatusChange { status } => {
                let summary = format!("status -> {status}");
                run.status_update = Some(status);
                summary
            }
            ProposalEffect::CreateItem {
                project,
                title,
                body,
            } => {
                let draft = ItemDraft {
                    project: project.unwrap_or_else(|| run.project.clone()),
                    title: title.clone(),
                    body,
                    status: None,
                };
                let created = self.inner.work_items.create_item(&draft).await?;
                format!("{}: {title} ({created})", proposal.kind)
            }
        };

        run.block.record_effect(AppliedEffect {
            proposal_id: proposal.id,
            kind: proposal.kind.as_str().to_string(),
            applied_at: now,
            summary,
        });
        metrics().proposal_confirmed();
        info!(proposal_id = %proposal.id, kind = %proposal.kind, "Proposal confirmed and applied");
        Ok(())
    }

    /// Record a proposal in the book and the block, then publish it for a
    /// human decision
    async fn propose(
        &self,
        run: &mut ItemRun<'_>,
        position: Option<u32>,
        kind: ProposalKind,
        payload: Value,
    ) {
        let proposal = Proposal::new(run.item.clone(), position, kind, payload, Utc::now());
        self.inner.proposals.insert(proposal.clone());
        run.block.add_pending_proposal(proposal.to_pending());
        metrics().proposal_created();
        self.publish(&proposal).await;
    }

    async fn publish(&self, proposal: &Proposal) {
        match self.inner.surface.create_proposal(proposal).await {
            Ok(id) => {
                self.register_decision_callbacks(id);
                info!(
                    work_item = %proposal.work_item,
                    proposal_id = %id,
                    kind = %proposal.kind,
                    summary = %proposal.summary(),
                    "Proposal awaiting confirmation"
                );
            }
            Err(e) => {
                error!(
                    work_item = %proposal.work_item,
                    proposal_id = %proposal.id,
                    error = %e,
                    "Failed to publish proposal"
                );
            }
        }
    }

    fn register_decision_callbacks(&self, id: Uuid) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };

        for decision in [Decision::Confirm, Decision::Reject] {
            let weak = Arc::downgrade(&self.inner);
            let runtime = runtime.clone();
            let callback: ProposalCallback = Box::new(move |proposal: Proposal| {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let orchestrator = WorkflowOrchestrator { inner };
                runtime.spawn(async move {
                    let item = proposal.work_item.clone();
                    let trigger = Trigger::Decision { proposal, decision };
                    if let Err(e) = orchestrator.submit_trigger(&item, trigger).await {
                        warn!(work_item = %item, error = %e, "Decision could not be applied");
                    }
                });
            });

            match decision {
                Decision::Confirm => self.inner.surface.on_confirm(id, callback),
                Decision::Reject => self.inner.surface.on_reject(id, callback),
            }
        }
    }

    /// Write the body back if the rendered block or the status changed
    async fn persist(&self, run: &mut ItemRun<'_>) -> PipelineResult<()> {
        let rendered = if run.block.is_empty()
            && run.block.effects.is_empty()
            && run.block.pending_proposals.is_empty()
        {
            run.body.clone()
        } else {
            render_into(&run.body, &run.block)
        };

        if rendered == run.body && run.status_update.is_none() {
            return Ok(());
        }

        self.inner
            .work_items
            .update(run.item, &rendered, run.status_update.as_deref())
            .await?;
        debug!(work_item = %run.item, status = ?run.status_update, "Work item updated");
        run.body = rendered;
        run.status_update = None;
        Ok(())
    }
}

/// Scheduler callbacks; holds the orchestrator weakly
struct OrchestratorDriver {
    inner: Weak<Inner>,
}

impl OrchestratorDriver {
    fn orchestrator(&self) -> Option<WorkflowOrchestrator> {
        self.inner
            .upgrade()
            .map(|inner| WorkflowOrchestrator { inner })
    }
}

#[async_trait]
impl PollDriver for OrchestratorDriver {
    async fn provider_for(&self, target: &PollTarget) -> Option<Arc<dyn AsyncAgentProvider>> {
        let orchestrator = self.orchestrator()?;
        let pipeline = orchestrator.load_pipeline(&target.project).await.ok()?;
        let (_, provider) = pipeline.stage(target.step_position)?;
        provider.as_async().cloned()
    }

    async fn apply_outcome(&self, target: PollTarget, outcome: PollOutcome, guard: ItemGuard) {
        let Some(orchestrator) = self.orchestrator() else {
            return;
        };

        let trigger = Trigger::PollOutcome {
            position: target.step_position,
            handle: Some(target.handle.clone()),
            outcome,
        };

        if let Err(PipelineError::Service(crate::services::ServiceError::NotFound(_))) = orchestrator
            .apply_locked(&target.work_item, trigger, guard)
            .await
        {
            orchestrator.inner.registry.remove(&target.work_item);
        }
    }

    async fn on_tick(&self) {
        if let Some(orchestrator) = self.orchestrator() {
            orchestrator.expire_stale_proposals().await;
        }
    }
}

/// Instructions, the item's own text, then the previous step's output
fn build_prompt(descriptor: &AgentDescriptor, task: &str, previous_output: Option<&str>) -> String {
    let mut sections = Vec::new();
    if let Some(instructions) = descriptor.instructions() {
        sections.push(instructions.trim().to_string());
    }
    if !task.trim().is_empty() {
        sections.push(task.trim().to_string());
    }
    if let Some(previous) = previous_output {
        sections.push(format!("Previous step output:\n{}", previous.trim()));
    }
    sections.join("\n\n")
}

fn proposals_in_output(output: &str) -> Vec<ProposedEffect> {
    serde_json::from_str::<OutputProposals>(output.trim())
        .map(|parsed| parsed.proposals)
        .unwrap_or_default()
}

fn step_elapsed(block: &TrackingBlock, position: u32, now: DateTime<Utc>) -> Duration {
    block
        .step(position)
        .and_then(|step| step.started_at)
        .and_then(|started| (now - started).to_std().ok())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_prompt_sections() {
        let descriptor = AgentDescriptor::new("reviewer", "chat")
            .with_param("instructions", json!("Review the change"));

        let prompt = build_prompt(&descriptor, "Fix login\n", Some("patch applied"));
        assert_eq!(
            prompt,
            "Review the change\n\nFix login\n\nPrevious step output:\npatch applied"
        );
    }

    #[test]
    fn test_prompt_without_extras() {
        let descriptor = AgentDescriptor::new("planner", "chat");
        assert_eq!(build_prompt(&descriptor, "Fix login", None), "Fix login");
    }

    #[test]
    fn test_proposals_in_output() {
        let output = r#"{"proposals": [
            {"kind": "task_create", "payload": {"title": "Add tests"}},
            {"kind": "issue_recommend", "payload": {"title": "Flaky CI"}}
        ]}"#;
        let proposals = proposals_in_output(output);
        assert_eq!(proposals.len(), 2);
        assert_eq!(proposals[0].kind, ProposalKind::TaskCreate);
        assert_eq!(proposals[1].payload["title"], "Flaky CI");
    }

    #[test]
    fn test_plain_output_has_no_proposals() {
        assert!(proposals_in_output("Here is the plan").is_empty());
        assert!(proposals_in_output(r#"{"summary": "ok"}"#).is_empty());
    }

    #[test]
    fn test_settings_from_config() {
        let settings = OrchestratorSettings::from(&EngineConfig::test_config());
        assert_eq!(settings.proposal_ttl, chrono::Duration::days(7));
        assert_eq!(settings.scheduler.interval, Duration::from_secs(1));
        assert_eq!(settings.scheduler.worker_pool_size, 4);
    }
}
