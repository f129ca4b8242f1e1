//! Readiness polling for delegated agent steps

pub mod locks;
pub mod registry;
pub mod scheduler;

pub use locks::{ItemGuard, ItemLocks};
pub use registry::{PollRegistry, PollTarget};
pub use scheduler::{PollDriver, PollOutcome, PollingScheduler, SchedulerSettings};
