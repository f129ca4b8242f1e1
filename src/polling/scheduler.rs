//! Polling scheduler
//!
//! One loop task ticks at a fixed interval. Each tick hands every registered
//! target whose item is free to a bounded pool of workers; a busy item is
//! skipped until the next tick. Workers check readiness and forward outcomes
//! to the [`PollDriver`] while still holding the item lock.

use super::locks::{ItemGuard, ItemLocks};
use super::registry::{PollRegistry, PollTarget};
use crate::completion::{AsyncAgentProvider, ReadyState};
use crate::config::PollingSection;
use crate::observability::metrics::metrics;
use crate::poll_span;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn, Instrument};

/// Terminal readiness of a delegated step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PollOutcome {
    Ready { output: String },
    Failed { reason: String },
}

/// Connects the scheduler to whatever owns pipeline state
#[async_trait]
pub trait PollDriver: Send + Sync + 'static {
    /// Provider responsible for the target's handle
    async fn provider_for(&self, target: &PollTarget) -> Option<Arc<dyn AsyncAgentProvider>>;

    /// Apply a terminal outcome; the item lock is held by `guard`
    async fn apply_outcome(&self, target: PollTarget, outcome: PollOutcome, guard: ItemGuard);

    /// Housekeeping run at the start of every tick
    async fn on_tick(&self) {}
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerSettings {
    pub interval: Duration,
    pub max_consecutive_failures: u32,
    pub worker_pool_size: usize,
}

impl From<&PollingSection> for SchedulerSettings {
    fn from(section: &PollingSection) -> Self {
        Self {
            interval: section.interval(),
            max_consecutive_failures: section.max_consecutive_failures,
            worker_pool_size: section.worker_pool_size,
        }
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self::from(&PollingSection::default())
    }
}

struct SchedulerContext {
    driver: Arc<dyn PollDriver>,
    registry: Arc<PollRegistry>,
    locks: Arc<ItemLocks>,
    pool: Arc<Semaphore>,
    max_consecutive_failures: u32,
}

struct RunningLoop {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct PollingScheduler {
    context: Arc<SchedulerContext>,
    default_interval: Duration,
    running: Mutex<Option<RunningLoop>>,
}

impl PollingScheduler {
    pub fn new(
        driver: Arc<dyn PollDriver>,
        registry: Arc<PollRegistry>,
        locks: Arc<ItemLocks>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            context: Arc::new(SchedulerContext {
                driver,
                registry,
                locks,
                pool: Arc::new(Semaphore::new(settings.worker_pool_size.max(1))),
                max_consecutive_failures: settings.max_consecutive_failures.max(1),
            }),
            default_interval: settings.interval,
            running: Mutex::new(None),
        }
    }

    pub fn default_interval(&self) -> Duration {
        self.default_interval
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Start the loop; returns false if it was already running
    pub async fn start(&self, interval: Duration) -> bool {
        let mut running = self.running.lock().await;
        if running.is_some() {
            debug!("Polling scheduler already running");
            return false;
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_loop(self.context.clone(), interval, shutdown_rx));
        *running = Some(RunningLoop { shutdown, task });

        metrics().set_scheduler_running(true);
        info!(interval_ms = interval.as_millis() as u64, "Polling scheduler started");
        true
    }

    /// Stop the loop and wait for in-flight checks to finish
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };

        let _ = running.shutdown.send(true);
        if let Err(e) = running.task.await {
            error!(error = %e, "Polling loop terminated abnormally");
        }

        metrics().set_scheduler_running(false);
        info!("Polling scheduler stopped");
    }

    /// Run a single tick and wait for its workers
    pub async fn tick(&self) {
        let mut workers = JoinSet::new();
        dispatch_tick(&self.context, &mut workers).await;
        drain(&mut workers).await;
    }
}

async fn run_loop(
    context: Arc<SchedulerContext>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut workers = JoinSet::new();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => dispatch_tick(&context, &mut workers).await,
            Some(result) = workers.join_next(), if !workers.is_empty() => {
                if let Err(e) = result {
                    error!(error = %e, "Poll worker panicked");
                }
            }
        }
    }

    debug!(in_flight = workers.len(), "Draining poll workers");
    drain(&mut workers).await;
}

async fn drain(workers: &mut JoinSet<()>) {
    while let Some(result) = workers.join_next().await {
        if let Err(e) = result {
            error!(error = %e, "Poll worker panicked");
        }
    }
}

async fn dispatch_tick(context: &Arc<SchedulerContext>, workers: &mut JoinSet<()>) {
    context.driver.on_tick().await;
    context.locks.release_idle();

    let targets = context.registry.snapshot();
    let total = targets.len();

    for (index, target) in targets.into_iter().enumerate() {
        let Some(guard) = context.locks.try_acquire(&target.work_item) else {
            debug!(work_item = %target.work_item, "Item busy, skipping this tick");
            metrics().poll_skipped();
            continue;
        };

        let Ok(permit) = context.pool.clone().try_acquire_owned() else {
            let deferred = total - index;
            debug!(deferred, "Worker pool exhausted, deferring remaining targets");
            metrics().poll_deferred(deferred);
            break;
        };

        let span = poll_span!(
            work_item = %target.work_item,
            position = target.step_position,
            agent = %target.agent
        );
        workers.spawn(check_target(context.clone(), target, guard, permit).instrument(span));
    }
}

async fn check_target(
    context: Arc<SchedulerContext>,
    target: PollTarget,
    guard: ItemGuard,
    _permit: OwnedSemaphorePermit,
) {
    // Registry may have changed between snapshot and lock
    match context.registry.get(&target.work_item) {
        Some(current) if current.matches(target.step_position, Some(&target.handle)) => {}
        _ => return,
    }

    let Some(provider) = context.driver.provider_for(&target).await else {
        warn!(handle = %target.handle, "No asynchronous provider for poll target");
        context
            .driver
            .apply_outcome(
                target,
                PollOutcome::Failed {
                    reason: "agent is no longer bound to an asynchronous provider".to_string(),
                },
                guard,
            )
            .await;
        return;
    };

    metrics().poll_performed();
    let now = Utc::now();

    let outcome = match provider.is_ready(&target.handle).await {
        Ok(ReadyState::NotReady) => {
            context.registry.record_success(&target.work_item, now);
            return;
        }
        Ok(ReadyState::Ready(output)) => PollOutcome::Ready { output },
        Ok(ReadyState::Failed(reason)) => PollOutcome::Failed { reason },
        Err(e) if e.is_transient() => {
            metrics().poll_failed();
            let failures = context.registry.record_failure(&target.work_item, now);
            if failures < context.max_consecutive_failures {
                warn!(
                    error = %e,
                    consecutive_failures = failures,
                    "Readiness check failed, retrying next tick"
                );
                return;
            }
            error!(
                error = %e,
                consecutive_failures = failures,
                "Readiness check failure threshold reached"
            );
            PollOutcome::Failed {
                reason: format!("readiness check failed {failures} consecutive times: {e}"),
            }
        }
        Err(e) => {
            metrics().poll_failed();
            PollOutcome::Failed {
                reason: e.to_string(),
            }
        }
    };

    context.driver.apply_outcome(target, outcome, guard).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::{AgentHandle, ProviderError, ProviderParams};
    use crate::services::WorkItemId;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    /// Returns scripted readiness results, NotReady once exhausted
    struct ScriptedReadiness {
        script: StdMutex<VecDeque<Result<ReadyState, ProviderError>>>,
    }

    #[async_trait]
    impl AsyncAgentProvider for ScriptedReadiness {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn produce(&self, _: &str, _: &ProviderParams) -> Result<AgentHandle, ProviderError> {
            Ok(AgentHandle::new("h"))
        }

        async fn is_ready(&self, _: &AgentHandle) -> Result<ReadyState, ProviderError> {
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(ReadyState::NotReady))
        }
    }

    struct RecordingDriver {
        provider: Arc<ScriptedReadiness>,
        registry: Arc<PollRegistry>,
        outcomes: StdMutex<Vec<(WorkItemId, PollOutcome)>>,
    }

    #[async_trait]
    impl PollDriver for RecordingDriver {
        async fn provider_for(&self, _: &PollTarget) -> Option<Arc<dyn AsyncAgentProvider>> {
            Some(self.provider.clone())
        }

        async fn apply_outcome(&self, target: PollTarget, outcome: PollOutcome, _guard: ItemGuard) {
            self.registry.remove(&target.work_item);
            self.outcomes
                .lock()
                .unwrap()
                .push((target.work_item, outcome));
        }
    }

    fn setup(
        script: Vec<Result<ReadyState, ProviderError>>,
        threshold: u32,
    ) -> (PollingScheduler, Arc<RecordingDriver>, Arc<PollRegistry>, Arc<ItemLocks>) {
        let registry = Arc::new(PollRegistry::new());
        let locks = Arc::new(ItemLocks::new());
        let driver = Arc::new(RecordingDriver {
            provider: Arc::new(ScriptedReadiness {
                script: StdMutex::new(script.into()),
            }),
            registry: registry.clone(),
            outcomes: StdMutex::new(Vec::new()),
        });
        let scheduler = PollingScheduler::new(
            driver.clone(),
            registry.clone(),
            locks.clone(),
            SchedulerSettings {
                interval: Duration::from_millis(10),
                max_consecutive_failures: threshold,
                worker_pool_size: 2,
            },
        );
        (scheduler, driver, registry, locks)
    }

    fn register(registry: &PollRegistry, item: &str) {
        registry.register(PollTarget::new(
            WorkItemId::new(item),
            "web",
            2,
            "coder",
            AgentHandle::new("h"),
        ));
    }

    #[tokio::test]
    async fn test_ready_outcome_forwarded() {
        let (scheduler, driver, registry, _) =
            setup(vec![Ok(ReadyState::Ready("done".to_string()))], 3);
        register(&registry, "a");

        scheduler.tick().await;

        let outcomes = driver.outcomes.lock().unwrap();
        assert_eq!(
            outcomes.as_slice(),
            &[(
                WorkItemId::new("a"),
                PollOutcome::Ready {
                    output: "done".to_string()
                }
            )]
        );
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_not_ready_keeps_target() {
        let (scheduler, driver, registry, _) = setup(vec![], 3);
        register(&registry, "a");

        scheduler.tick().await;

        assert!(driver.outcomes.lock().unwrap().is_empty());
        assert!(registry.get(&WorkItemId::new("a")).unwrap().last_polled_at.is_some());
    }

    #[tokio::test]
    async fn test_transient_failures_until_threshold() {
        let transient = || Err(ProviderError::Transient("503".to_string()));
        let (scheduler, driver, registry, _) =
            setup(vec![transient(), transient(), transient()], 3);
        register(&registry, "a");

        scheduler.tick().await;
        scheduler.tick().await;
        assert!(driver.outcomes.lock().unwrap().is_empty());
        assert_eq!(registry.get(&WorkItemId::new("a")).unwrap().consecutive_failures, 2);

        scheduler.tick().await;
        let outcomes = driver.outcomes.lock().unwrap();
        assert_eq!(outcomes.len(), 1);
        assert!(matches!(
            &outcomes[0].1,
            PollOutcome::Failed { reason } if reason.contains("3 consecutive")
        ));
    }

    #[tokio::test]
    async fn test_permanent_failure_fails_immediately() {
        let (scheduler, driver, registry, _) =
            setup(vec![Err(ProviderError::Permanent("unknown handle".to_string()))], 5);
        register(&registry, "a");

        scheduler.tick().await;
        assert_eq!(driver.outcomes.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_busy_item_is_skipped() {
        let (scheduler, driver, registry, locks) =
            setup(vec![Ok(ReadyState::Ready("done".to_string()))], 3);
        register(&registry, "a");

        let guard = locks.try_acquire(&WorkItemId::new("a")).unwrap();
        scheduler.tick().await;
        assert!(driver.outcomes.lock().unwrap().is_empty());
        assert!(registry.contains(&WorkItemId::new("a")));

        drop(guard);
        scheduler.tick().await;
        assert_eq!(driver.outcomes.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_full_pool_defers_remaining_targets() {
        let (scheduler, driver, registry, _) = setup(
            vec![
                Ok(ReadyState::Ready("one".to_string())),
                Ok(ReadyState::Ready("two".to_string())),
                Ok(ReadyState::Ready("three".to_string())),
            ],
            3,
        );
        for item in ["a", "b", "c"] {
            register(&registry, item);
        }
        let deferred_before = metrics().snapshot().polling.deferred;

        scheduler.tick().await;
        assert_eq!(driver.outcomes.lock().unwrap().len(), 2);
        assert_eq!(registry.len(), 1);
        assert!(metrics().snapshot().polling.deferred > deferred_before);

        scheduler.tick().await;
        assert_eq!(driver.outcomes.lock().unwrap().len(), 3);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_start_is_idempotent_and_stop_drains() {
        let (scheduler, driver, registry, _) =
            setup(vec![Ok(ReadyState::Ready("done".to_string()))], 3);
        register(&registry, "a");

        assert!(scheduler.start(Duration::from_millis(10)).await);
        assert!(!scheduler.start(Duration::from_millis(10)).await);
        assert!(scheduler.is_running().await);

        for _ in 0..50 {
            if !driver.outcomes.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        scheduler.stop().await;
        assert!(!scheduler.is_running().await);
        assert_eq!(driver.outcomes.lock().unwrap().len(), 1);

        // stopping twice is harmless
        scheduler.stop().await;
    }
}
