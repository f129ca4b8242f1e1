//! Pipeline state embedded in work item bodies
//!
//! `model` defines the tracking block and its guarded transitions; `codec`
//! moves it in and out of the body text.

pub mod codec;
pub mod model;

pub use codec::{decode, decode_or_empty, encode, render_into, strip_section, DecodeError};
pub use model::{
    AppliedEffect, PendingProposal, PipelineStatus, PipelineStep, StepStatus, TrackingBlock, TrackingError,
    FORMAT_VERSION,
};
