//! Built-in provider implementations

pub mod chat;
pub mod delegated_agent;

pub use chat::{ChatConfig, ChatProvider};
pub use delegated_agent::{DelegatedAgentConfig, DelegatedAgentProvider};

use super::provider::ProviderError;
use reqwest::StatusCode;

/// Classify a non-success HTTP status
pub(crate) fn classify_status(status: StatusCode, body: &str, service: &str) -> ProviderError {
    let message = format!("{service} returned {status}: {body}");
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        ProviderError::Transient(message)
    } else {
        ProviderError::Permanent(message)
    }
}

/// Classify a transport-level failure
pub(crate) fn classify_transport(error: reqwest::Error, timeout: std::time::Duration) -> ProviderError {
    if error.is_timeout() {
        ProviderError::Timeout(timeout)
    } else if error.is_builder() {
        ProviderError::Permanent(error.to_string())
    } else {
        ProviderError::Transient(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, "", "svc").is_transient());
        assert!(classify_status(StatusCode::BAD_GATEWAY, "", "svc").is_transient());
        assert!(classify_status(StatusCode::REQUEST_TIMEOUT, "", "svc").is_transient());
        assert!(!classify_status(StatusCode::UNAUTHORIZED, "", "svc").is_transient());
        assert!(!classify_status(StatusCode::NOT_FOUND, "", "svc").is_transient());
    }
}
