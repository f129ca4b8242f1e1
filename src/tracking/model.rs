//! Tracking block data model
//!
//! A `TrackingBlock` is the only durable record of pipeline progress. It is
//! rendered into the work item body by the codec and mutated only through the
//! transition methods below, which enforce the ordering invariants.

use crate::config::PipelineConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Current tracking format version
pub const FORMAT_VERSION: u32 = 1;

/// Status of a single pipeline step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Complete,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::InProgress => "in_progress",
            StepStatus::Complete => "complete",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        }
    }

    /// Complete and skipped steps no longer hold up later steps
    pub fn is_done(&self) -> bool {
        matches!(self, StepStatus::Complete | StepStatus::Skipped)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Overall pipeline status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    #[default]
    Pending,
    Running,
    Complete,
    Failed,
}

impl PipelineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStatus::Pending => "pending",
            PipelineStatus::Running => "running",
            PipelineStatus::Complete => "complete",
            PipelineStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineStatus::Complete | PipelineStatus::Failed)
    }
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One agent step of a pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineStep {
    /// 1-based position; authoritative ordering
    pub position: u32,
    pub agent: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_ref: Option<String>,
    /// Async agent handle while the step is running
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<String>,
    /// Number of times this step has been started
    #[serde(default, skip_serializing_if = "is_zero")]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    /// Fields written by newer versions, preserved verbatim
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

fn is_zero(value: &u32) -> bool {
    *value == 0
}

impl PipelineStep {
    pub fn pending(position: u32, agent: impl Into<String>) -> Self {
        Self {
            position,
            agent: agent.into(),
            status: StepStatus::Pending,
            started_at: None,
            completed_at: None,
            output_ref: None,
            handle: None,
            attempts: 0,
            failure_reason: None,
            extra: BTreeMap::new(),
        }
    }

    /// Whether a failed step may be restarted under the given retry budget
    pub fn has_retry_budget(&self, retries: u32) -> bool {
        self.attempts <= retries
    }
}

/// Audit record of a confirmed irreversible effect
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedEffect {
    pub proposal_id: Uuid,
    pub kind: String,
    pub applied_at: DateTime<Utc>,
    pub summary: String,
}

/// Proposal awaiting a human decision.
///
/// Kept in the block so an undecided proposal can be republished after a
/// restart. Removed once it is confirmed, rejected or expired.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingProposal {
    pub id: Uuid,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_position: Option<u32>,
    #[serde(default)]
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

/// Pipeline state embedded in a work item body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingBlock {
    pub version: u32,
    #[serde(default)]
    pub status: PipelineStatus,
    #[serde(default)]
    pub steps: Vec<PipelineStep>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub effects: Vec<AppliedEffect>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending_proposals: Vec<PendingProposal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    /// Fields written by newer versions, preserved verbatim
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Default for TrackingBlock {
    fn default() -> Self {
        Self::empty()
    }
}

/// Rejected tracking transitions
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TrackingError {
    #[error("Step {0} does not exist")]
    UnknownStep(u32),
    #[error("Step {position} cannot move from {from} to {to}")]
    InvalidTransition {
        position: u32,
        from: StepStatus,
        to: StepStatus,
    },
    #[error("Step {position} cannot start while step {blocking} is {status}")]
    OutOfOrder {
        position: u32,
        blocking: u32,
        status: StepStatus,
    },
}

impl TrackingBlock {
    /// Block with no steps; what a missing or unreadable section decodes to
    pub fn empty() -> Self {
        Self {
            version: FORMAT_VERSION,
            status: PipelineStatus::Pending,
            steps: Vec::new(),
            effects: Vec::new(),
            pending_proposals: Vec::new(),
            updated_at: None,
            extra: BTreeMap::new(),
        }
    }

    /// Seed a pending block from a pipeline definition
    pub fn for_pipeline(config: &PipelineConfig) -> Self {
        let steps = config
            .agents
            .iter()
            .enumerate()
            .map(|(index, agent)| PipelineStep::pending(index as u32 + 1, agent.name.clone()))
            .collect();

        Self {
            steps,
            ..Self::empty()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn step(&self, position: u32) -> Option<&PipelineStep> {
        self.steps.iter().find(|s| s.position == position)
    }

    fn step_mut(&mut self, position: u32) -> Result<&mut PipelineStep, TrackingError> {
        self.steps
            .iter_mut()
            .find(|s| s.position == position)
            .ok_or(TrackingError::UnknownStep(position))
    }

    pub fn in_progress_count(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::InProgress)
            .count()
    }

    pub fn has_effect(&self, proposal_id: Uuid) -> bool {
        self.effects.iter().any(|e| e.proposal_id == proposal_id)
    }

    /// Move a pending (or retryable failed) step to in_progress.
    ///
    /// Refuses to start while another step is running or while any earlier
    /// step is neither complete nor skipped.
    pub fn start_step(&mut self, position: u32, now: DateTime<Utc>) -> Result<(), TrackingError> {
        let current = self.step(position).ok_or(TrackingError::UnknownStep(position))?;
        if !matches!(current.status, StepStatus::Pending | StepStatus::Failed) {
            return Err(TrackingError::InvalidTransition {
                position,
                from: current.status,
                to: StepStatus::InProgress,
            });
        }

        if let Some(blocking) = self
            .steps
            .iter()
            .find(|s| s.position != position && s.status == StepStatus::InProgress)
        {
            return Err(TrackingError::OutOfOrder {
                position,
                blocking: blocking.position,
                status: blocking.status,
            });
        }

        if let Some(blocking) = self
            .steps
            .iter()
            .find(|s| s.position < position && !s.status.is_done())
        {
            return Err(TrackingError::OutOfOrder {
                position,
                blocking: blocking.position,
                status: blocking.status,
            });
        }

        let step = self.step_mut(position)?;
        step.status = StepStatus::InProgress;
        step.started_at = Some(now);
        step.completed_at = None;
        step.handle = None;
        step.failure_reason = None;
        step.attempts += 1;

        self.status = PipelineStatus::Running;
        self.updated_at = Some(now);
        Ok(())
    }

    /// Record the async handle of a running step
    pub fn set_handle(&mut self, position: u32, handle: impl Into<String>) -> Result<(), TrackingError> {
        let step = self.step_mut(position)?;
        if step.status != StepStatus::InProgress {
            return Err(TrackingError::InvalidTransition {
                position,
                from: step.status,
                to: StepStatus::InProgress,
            });
        }
        step.handle = Some(handle.into());
        Ok(())
    }

    pub fn complete_step(
        &mut self,
        position: u32,
        output_ref: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), TrackingError> {
        let step = self.step_mut(position)?;
        if step.status != StepStatus::InProgress {
            return Err(TrackingError::InvalidTransition {
                position,
                from: step.status,
                to: StepStatus::Complete,
            });
        }
        step.status = StepStatus::Complete;
        step.completed_at = Some(now);
        step.output_ref = output_ref;
        step.handle = None;
        step.failure_reason = None;
        self.updated_at = Some(now);
        Ok(())
    }

    pub fn fail_step(
        &mut self,
        position: u32,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), TrackingError> {
        let step = self.step_mut(position)?;
        if step.status != StepStatus::InProgress {
            return Err(TrackingError::InvalidTransition {
                position,
                from: step.status,
                to: StepStatus::Failed,
            });
        }
        step.status = StepStatus::Failed;
        step.completed_at = Some(now);
        step.handle = None;
        step.failure_reason = Some(reason.into());
        self.updated_at = Some(now);
        Ok(())
    }

    /// Explicitly skip a pending step so later steps may start
    pub fn skip_step(&mut self, position: u32, now: DateTime<Utc>) -> Result<(), TrackingError> {
        let step = self.step_mut(position)?;
        if step.status != StepStatus::Pending {
            return Err(TrackingError::InvalidTransition {
                position,
                from: step.status,
                to: StepStatus::Skipped,
            });
        }
        step.status = StepStatus::Skipped;
        step.completed_at = Some(now);
        self.updated_at = Some(now);
        Ok(())
    }

    /// Record a terminal pipeline status
    pub fn finish(&mut self, status: PipelineStatus, now: DateTime<Utc>) {
        if self.status != status {
            self.status = status;
            self.updated_at = Some(now);
        }
    }

    pub fn record_effect(&mut self, effect: AppliedEffect) {
        self.updated_at = Some(effect.applied_at);
        self.pending_proposals.retain(|p| p.id != effect.proposal_id);
        self.effects.push(effect);
    }

    pub fn add_pending_proposal(&mut self, proposal: PendingProposal) {
        if !self.pending_proposals.iter().any(|p| p.id == proposal.id) {
            self.pending_proposals.push(proposal);
        }
    }

    /// Drop a pending proposal; returns whether it was present
    pub fn remove_pending_proposal(&mut self, id: Uuid) -> bool {
        let before = self.pending_proposals.len();
        self.pending_proposals.retain(|p| p.id != id);
        self.pending_proposals.len() != before
    }

    /// Drop pending proposals created at or before `cutoff`
    pub fn drop_pending_before(&mut self, cutoff: DateTime<Utc>) -> Vec<PendingProposal> {
        let (expired, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending_proposals)
            .into_iter()
            .partition(|p| p.created_at <= cutoff);
        self.pending_proposals = kept;
        expired
    }
}
