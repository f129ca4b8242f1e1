//! Testing utilities and mock implementations
//!
//! In-memory stand-ins for the work item service and both provider shapes,
//! used by unit and integration tests.

pub mod mocks;

pub use mocks::*;
