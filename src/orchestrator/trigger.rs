//! Triggers that drive the per-item state machine

use super::proposal::{Decision, Proposal};
use crate::completion::AgentHandle;
use crate::error::{PipelineError, PipelineResult};
use crate::polling::PollOutcome;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An event that moves one work item's pipeline forward
///
/// Wire form: `{"kind": "...", "payload": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum Trigger {
    /// The item entered its pipeline, or should be re-evaluated
    Enter,
    /// A delegated step reached a terminal state
    PollOutcome {
        position: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        handle: Option<AgentHandle>,
        outcome: PollOutcome,
    },
    /// A human decided on a proposal
    Decision {
        proposal: Proposal,
        decision: Decision,
    },
}

impl Trigger {
    /// Build a trigger from its kind name and JSON payload
    pub fn from_parts(kind: &str, payload: Value) -> PipelineResult<Self> {
        let wire = if payload.is_null() {
            serde_json::json!({ "kind": kind })
        } else {
            serde_json::json!({ "kind": kind, "payload": payload })
        };
        serde_json::from_value(wire).map_err(|e| PipelineError::InvalidTrigger(e.to_string()))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Trigger::Enter => "enter",
            Trigger::PollOutcome { .. } => "poll_outcome",
            Trigger::Decision { .. } => "decision",
        }
    }
}
