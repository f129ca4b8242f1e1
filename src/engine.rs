//! Agent tracking engine
//!
//! Pure decisions over a tracking block and its pipeline definition. Nothing
//! here performs I/O; the orchestrator executes whatever action comes back.

use crate::config::PipelineConfig;
use crate::tracking::{PipelineStep, StepStatus, TrackingBlock};
use thiserror::Error;

/// What the orchestrator should do next for an item
#[derive(Debug, Clone, PartialEq)]
pub enum NextAction {
    /// Start (or restart) this step
    StartStep(PipelineStep),
    /// A step is running; wait for its outcome
    AwaitCurrent(PipelineStep),
    PipelineComplete,
    PipelineFailed { step: PipelineStep, reason: String },
}

/// Structural violations of a tracking block
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BlockViolation {
    #[error("{0} steps are in progress; at most one is allowed")]
    MultipleInProgress(usize),
    #[error("Step {position} is {status} while earlier step {earlier} is {earlier_status}")]
    SkippedAhead {
        position: u32,
        status: StepStatus,
        earlier: u32,
        earlier_status: StepStatus,
    },
}

/// The single in-progress step, if any
pub fn get_current_step(block: &TrackingBlock) -> Option<&PipelineStep> {
    block
        .steps
        .iter()
        .find(|step| step.status == StepStatus::InProgress)
}

/// First pending step in position order
pub fn get_next_pending<'a>(
    block: &'a TrackingBlock,
    _config: &PipelineConfig,
) -> Option<&'a PipelineStep> {
    block
        .steps
        .iter()
        .find(|step| step.status == StepStatus::Pending)
}

/// Decide the next action.
///
/// A running step is awaited. Otherwise the first step that is neither
/// complete nor skipped decides: pending starts, failed restarts while its
/// retry budget lasts and fails the pipeline once it is spent. Failed steps
/// therefore block every later step.
pub fn determine_next_action(block: &TrackingBlock, config: &PipelineConfig) -> NextAction {
    if let Some(current) = get_current_step(block) {
        return NextAction::AwaitCurrent(current.clone());
    }

    let Some(step) = block.steps.iter().find(|step| !step.status.is_done()) else {
        return NextAction::PipelineComplete;
    };

    match step.status {
        StepStatus::Failed => {
            let retries = config
                .descriptor(step.position)
                .map(|descriptor| descriptor.retries)
                .unwrap_or(0);

            if step.has_retry_budget(retries) {
                NextAction::StartStep(step.clone())
            } else {
                NextAction::PipelineFailed {
                    step: step.clone(),
                    reason: step
                        .failure_reason
                        .clone()
                        .unwrap_or_else(|| format!("step {} failed", step.position)),
                }
            }
        }
        _ => NextAction::StartStep(step.clone()),
    }
}

/// Check the single-in-progress and no-skip-ahead invariants
pub fn validate_block(block: &TrackingBlock) -> Result<(), BlockViolation> {
    let in_progress = block.in_progress_count();
    if in_progress > 1 {
        return Err(BlockViolation::MultipleInProgress(in_progress));
    }

    let mut first_unfinished: Option<&PipelineStep> = None;
    for step in &block.steps {
        let started = matches!(
            step.status,
            StepStatus::InProgress | StepStatus::Complete | StepStatus::Failed
        );

        if let (true, Some(earlier)) = (started, first_unfinished) {
            return Err(BlockViolation::SkippedAhead {
                position: step.position,
                status: step.status,
                earlier: earlier.position,
                earlier_status: earlier.status,
            });
        }

        if first_unfinished.is_none() && !step.status.is_done() {
            first_unfinished = Some(step);
        }
    }

    Ok(())
}
