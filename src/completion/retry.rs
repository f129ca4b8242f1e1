//! Timeout and exponential backoff for provider calls

use super::provider::{ProviderError, ProviderParams, SyncProvider};
use crate::config::RetrySection;
use crate::observability::metrics::metrics;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Retry policy for provider calls
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub multiplier: f64,
    pub max_backoff: Duration,
    /// Bound on a single attempt
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetrySection::default())
    }
}

impl From<&RetrySection> for RetryPolicy {
    fn from(section: &RetrySection) -> Self {
        Self {
            max_retries: section.max_retries,
            initial_backoff: Duration::from_millis(section.initial_backoff_ms),
            multiplier: section.backoff_multiplier,
            max_backoff: Duration::from_millis(section.max_backoff_ms),
            attempt_timeout: Duration::from_secs(section.request_timeout_secs),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based), capped at `max_backoff`
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let factor = self.multiplier.powi(retry.min(i32::MAX as u32) as i32);
        let millis = self.initial_backoff.as_millis() as f64 * factor;
        let capped = millis.min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// Run `operation` under the per-attempt timeout, retrying transient
    /// failures with backoff until the retry budget is spent
    pub async fn execute<T, F, Fut>(&self, name: &str, mut operation: F) -> Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut attempt = 0;

        loop {
            debug!(
                provider = %name,
                attempt = attempt + 1,
                max_attempts = self.max_retries + 1,
                "Calling provider"
            );

            let error = match tokio::time::timeout(self.attempt_timeout, operation()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => e,
                Err(_) => ProviderError::Timeout(self.attempt_timeout),
            };

            if !error.is_transient() || attempt >= self.max_retries {
                return Err(error);
            }

            let backoff = self.backoff_for(attempt);
            warn!(
                provider = %name,
                error = %error,
                attempt = attempt + 1,
                backoff_ms = backoff.as_millis() as u64,
                "Provider call failed, retrying"
            );
            metrics().provider_retry();
            tokio::time::sleep(backoff).await;
            attempt += 1;
        }
    }
}

/// Wraps a synchronous provider with a per-attempt timeout and retries on
/// transient failures
pub struct RetryingProvider {
    inner: Arc<dyn SyncProvider>,
    policy: RetryPolicy,
}

impl RetryingProvider {
    pub fn new(inner: Arc<dyn SyncProvider>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

#[async_trait]
impl SyncProvider for RetryingProvider {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn produce(&self, prompt: &str, params: &ProviderParams) -> Result<String, ProviderError> {
        self.policy
            .execute(self.inner.name(), || self.inner.produce(prompt, params))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails with the given error for the first `failures` calls
    struct FlakyProvider {
        failures: u32,
        error: ProviderError,
        calls: AtomicU32,
    }

    #[async_trait]
    impl SyncProvider for FlakyProvider {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn produce(&self, _prompt: &str, _params: &ProviderParams) -> Result<String, ProviderError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(self.error.clone())
            } else {
                Ok(format!("ok after {call}"))
            }
        }
    }

    struct SlowProvider;

    #[async_trait]
    impl SyncProvider for SlowProvider {
        fn name(&self) -> &str {
            "slow"
        }

        async fn produce(&self, _prompt: &str, _params: &ProviderParams) -> Result<String, ProviderError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok("too late".to_string())
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            multiplier: 2.0,
            max_backoff: Duration::from_millis(250),
            attempt_timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = policy();
        assert_eq!(policy.backoff_for(0), Duration::from_millis(100));
        assert_eq!(policy.backoff_for(1), Duration::from_millis(200));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(250));
        assert_eq!(policy.backoff_for(30), Duration::from_millis(250));
    }

    #[test]
    fn test_policy_from_section_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.initial_backoff, Duration::from_millis(500));
        assert_eq!(policy.attempt_timeout, Duration::from_secs(120));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let flaky = Arc::new(FlakyProvider {
            failures: 2,
            error: ProviderError::Transient("503".to_string()),
            calls: AtomicU32::new(0),
        });
        let provider = RetryingProvider::new(flaky.clone(), policy());

        let result = provider.produce("prompt", &ProviderParams::new()).await;
        assert_eq!(result.unwrap(), "ok after 2");
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_retries() {
        let flaky = Arc::new(FlakyProvider {
            failures: 10,
            error: ProviderError::Transient("503".to_string()),
            calls: AtomicU32::new(0),
        });
        let provider = RetryingProvider::new(flaky.clone(), policy());

        let result = provider.produce("prompt", &ProviderParams::new()).await;
        assert_eq!(result, Err(ProviderError::Transient("503".to_string())));
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_not_retried() {
        let flaky = Arc::new(FlakyProvider {
            failures: 10,
            error: ProviderError::Permanent("400".to_string()),
            calls: AtomicU32::new(0),
        });
        let provider = RetryingProvider::new(flaky.clone(), policy());

        let result = provider.produce("prompt", &ProviderParams::new()).await;
        assert!(matches!(result, Err(ProviderError::Permanent(_))));
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_is_transient() {
        let mut policy = policy();
        policy.max_retries = 1;
        let provider = RetryingProvider::new(Arc::new(SlowProvider), policy);

        let result = provider.produce("prompt", &ProviderParams::new()).await;
        assert_eq!(result, Err(ProviderError::Timeout(Duration::from_secs(5))));
    }
}
