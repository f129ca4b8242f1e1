//! Error taxonomy for the agent pipeline engine
//!
//! Each layer owns a narrow error enum (`ConfigError`, `DecodeError`,
//! `ProviderError`, `ServiceError`, `ProposalError`). `PipelineError` is the
//! umbrella returned from orchestrator entry points. Provider failures never
//! reach it: they are retried or recorded as a failed step in tracking state.

use crate::config::ConfigError;
use crate::orchestrator::ProposalError;
use crate::services::ServiceError;
use crate::tracking::{DecodeError, TrackingError};
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Maximum length of a failure reason rendered into a work item body
pub const MAX_REASON_LEN: usize = 500;

/// Main error type for pipeline operations
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Tracking decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Invalid tracking transition: {0}")]
    Tracking(#[from] TrackingError),

    #[error("Invalid trigger: {0}")]
    InvalidTrigger(String),

    #[error("Work item {work_item} is already being processed")]
    ConcurrencyConflict { work_item: String },

    #[error("Work item service error: {0}")]
    Service(#[from] ServiceError),

    #[error("Proposal error: {0}")]
    Proposal(#[from] ProposalError),
}

impl PipelineError {
    /// Create concurrency conflict for a busy work item
    pub fn concurrency_conflict<S: Into<String>>(work_item: S) -> Self {
        Self::ConcurrencyConflict {
            work_item: work_item.into(),
        }
    }

    /// Benign errors are skipped silently by the scheduler
    pub fn is_benign(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict { .. })
    }

    /// Configuration errors are fatal at construction time
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }
}

static SECRET_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(password|token|key|secret)[=:]\s*\S+").expect("secret pattern is valid")
});

static SENSITIVE_PATH_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"/[a-zA-Z0-9._/-]+/(secrets?|\.ssh|\.aws|\.config)/[a-zA-Z0-9._/-]+")
        .expect("path pattern is valid")
});

/// Sanitize a failure reason before it is rendered into a work item body.
///
/// Bodies are visible to anyone who can read the work item, so provider
/// error text is scrubbed of credentials and sensitive paths and truncated
/// to [`MAX_REASON_LEN`] bytes on a character boundary.
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = SECRET_PATTERN.replace_all(message, "${1}=***").to_string();

    sanitized = SENSITIVE_PATH_PATTERN
        .replace_all(&sanitized, "/***REDACTED***/")
        .to_string();

    if sanitized.len() > MAX_REASON_LEN {
        let truncate_suffix = "...[truncated]";
        let mut cut = MAX_REASON_LEN - truncate_suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], truncate_suffix);
    }

    sanitized
}

/// Result type for pipeline operations
pub type PipelineResult<T> = Result<T, PipelineError>;
