//! Agent pipeline orchestration
//!
//! Drives work items through ordered pipelines of AI agents. Each item's
//! progress lives in a tracking section embedded in the item's own body, so
//! the engine keeps no database and can rebuild its state after a restart.
//!
//! # Overview
//!
//! - [`tracking`]: the tracking block and its Markdown codec
//! - [`completion`]: synchronous and delegated completion providers
//! - [`engine`]: pure next-action decisions over a tracking block
//! - [`polling`]: readiness polling for delegated steps
//! - [`orchestrator`]: triggers, per-item serialization and proposals
//!
//! # Quick Start
//!
//! ```rust
//! use agent_pipeline::tracking::{decode, encode, TrackingBlock};
//! use agent_pipeline::config::{AgentDescriptor, PipelineConfig};
//!
//! let config = PipelineConfig::new(
//!     "web",
//!     vec![
//!         AgentDescriptor::new("planner", "chat"),
//!         AgentDescriptor::new("coder", "delegated_agent"),
//!     ],
//! );
//!
//! let block = TrackingBlock::for_pipeline(&config);
//! let section = encode(&block);
//! assert_eq!(decode(&section).unwrap(), block);
//! ```

pub mod completion;
pub mod config;
pub mod engine;
pub mod error;
pub mod observability;
pub mod orchestrator;
pub mod polling;
pub mod services;
pub mod testing;
pub mod tracking;

pub use config::{AgentDescriptor, ConfigError, EngineConfig, PipelineConfig};
pub use engine::{determine_next_action, NextAction};
pub use error::{PipelineError, PipelineResult};
pub use orchestrator::{Trigger, WorkflowOrchestrator};
pub use services::WorkItemId;
pub use tracking::{PipelineStatus, PipelineStep, StepStatus, TrackingBlock};
