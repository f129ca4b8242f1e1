//! Workflow orchestration
//!
//! Triggers arrive per work item, are serialized by the item's lock, and
//! drive the tracking engine. Irreversible effects go through proposals.

pub mod proposal;
pub mod trigger;
pub mod workflow;

pub use proposal::{
    Decision, Proposal, ProposalBook, ProposalEffect, ProposalError, ProposalKind, ProposalState,
};
pub use trigger::Trigger;
pub use workflow::{OrchestratorSettings, RecoveryReport, WorkflowOrchestrator, INTERRUPTED_REASON};
