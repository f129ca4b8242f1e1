//! Thread-safe pipeline metrics
//!
//! Atomic counters for high-frequency events plus a bounded window of step
//! durations for percentile reporting.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Samples kept for duration percentiles
const MAX_DURATION_SAMPLES: usize = 1000;

/// Global metrics collector instance
pub static METRICS: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);

/// Get reference to global metrics collector
pub fn metrics() -> &'static MetricsCollector {
    &METRICS
}

#[derive(Default)]
struct Counter(AtomicU64);

impl Counter {
    fn incr(&self) {
        self.add(1);
    }

    fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    fn reset(&self) {
        self.0.store(0, Ordering::Relaxed);
    }
}

/// Pipeline metrics collector
#[derive(Default)]
pub struct MetricsCollector {
    triggers_received: Counter,
    triggers_applied: Counter,
    triggers_busy: Counter,
    triggers_failed: Counter,

    steps_started: Counter,
    steps_completed: Counter,
    steps_failed: Counter,
    step_durations: Mutex<Vec<u64>>,

    pipelines_completed: Counter,
    pipelines_failed: Counter,

    provider_retries: Counter,
    decode_errors: Counter,

    polls_performed: Counter,
    poll_failures: Counter,
    polls_skipped: Counter,
    polls_deferred: Counter,
    active_poll_targets: AtomicU64,
    scheduler_running: AtomicBool,

    proposals_created: Counter,
    proposals_confirmed: Counter,
    proposals_rejected: Counter,
    proposals_expired: Counter,

    started_at: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        let collector = Self::default();
        collector
            .started_at
            .store(current_timestamp(), Ordering::Relaxed);
        collector
    }

    // Triggers
    pub fn trigger_received(&self) {
        self.triggers_received.incr();
    }

    pub fn trigger_applied(&self) {
        self.triggers_applied.incr();
    }

    /// Trigger skipped because the item was locked
    pub fn trigger_busy(&self) {
        self.triggers_busy.incr();
    }

    pub fn trigger_failed(&self) {
        self.triggers_failed.incr();
    }

    // Steps
    pub fn step_started(&self) {
        self.steps_started.incr();
    }

    pub fn step_completed(&self, duration: Duration) {
        self.steps_completed.incr();
        self.record_step_duration(duration);
    }

    pub fn step_failed(&self, duration: Duration) {
        self.steps_failed.incr();
        self.record_step_duration(duration);
    }

    fn record_step_duration(&self, duration: Duration) {
        if let Ok(mut times) = self.step_durations.lock() {
            times.push(duration.as_millis() as u64);
            if times.len() > MAX_DURATION_SAMPLES {
                times.remove(0);
            }
        }
    }

    pub fn pipeline_completed(&self) {
        self.pipelines_completed.incr();
    }

    pub fn pipeline_failed(&self) {
        self.pipelines_failed.incr();
    }

    // Providers and codec
    pub fn provider_retry(&self) {
        self.provider_retries.incr();
    }

    pub fn decode_error(&self) {
        self.decode_errors.incr();
    }

    // Polling
    pub fn poll_performed(&self) {
        self.polls_performed.incr();
    }

    pub fn poll_failed(&self) {
        self.poll_failures.incr();
    }

    /// Poll target skipped because its item was busy
    pub fn poll_skipped(&self) {
        self.polls_skipped.incr();
    }

    /// Poll targets left for the next tick because the worker pool was full
    pub fn poll_deferred(&self, count: usize) {
        self.polls_deferred.add(count as u64);
    }

    pub fn set_active_poll_targets(&self, count: usize) {
        self.active_poll_targets
            .store(count as u64, Ordering::Relaxed);
    }

    pub fn set_scheduler_running(&self, running: bool) {
        self.scheduler_running.store(running, Ordering::Relaxed);
    }

    // Proposals
    pub fn proposal_created(&self) {
        self.proposals_created.incr();
    }

    pub fn proposal_confirmed(&self) {
        self.proposals_confirmed.incr();
    }

    pub fn proposal_rejected(&self) {
        self.proposals_rejected.incr();
    }

    pub fn proposal_expired(&self) {
        self.proposals_expired.incr();
    }

    /// Reset all metrics (useful for testing)
    pub fn reset(&self) {
        for counter in [
            &self.triggers_received,
            &self.triggers_applied,
            &self.triggers_busy,
            &self.triggers_failed,
            &self.steps_started,
            &self.steps_completed,
            &self.steps_failed,
            &self.pipelines_completed,
            &self.pipelines_failed,
            &self.provider_retries,
            &self.decode_errors,
            &self.polls_performed,
            &self.poll_failures,
            &self.polls_skipped,
            &self.polls_deferred,
            &self.proposals_created,
            &self.proposals_confirmed,
            &self.proposals_rejected,
            &self.proposals_expired,
        ] {
            counter.reset();
        }
        self.active_poll_targets.store(0, Ordering::Relaxed);
        self.scheduler_running.store(false, Ordering::Relaxed);
        if let Ok(mut times) = self.step_durations.lock() {
            times.clear();
        }
        self.started_at
            .store(current_timestamp(), Ordering::Relaxed);
    }

    fn step_duration_statistics(&self) -> (f64, f64, f64) {
        let Ok(times) = self.step_durations.lock() else {
            return (0.0, 0.0, 0.0);
        };
        if times.is_empty() {
            return (0.0, 0.0, 0.0);
        }

        let mut sorted = times.clone();
        sorted.sort_unstable();
        let avg = sorted.iter().sum::<u64>() as f64 / sorted.len() as f64;
        (avg, percentile(&sorted, 50.0), percentile(&sorted, 95.0))
    }

    /// Get complete metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        let now = current_timestamp();
        let (avg_step_ms, p50, p95) = self.step_duration_statistics();

        MetricsSnapshot {
            triggers: TriggerMetrics {
                received: self.triggers_received.get(),
                applied: self.triggers_applied.get(),
                busy: self.triggers_busy.get(),
                failed: self.triggers_failed.get(),
            },
            steps: StepMetrics {
                started: self.steps_started.get(),
                completed: self.steps_completed.get(),
                failed: self.steps_failed.get(),
                avg_duration_ms: avg_step_ms,
                duration_p50_ms: p50,
                duration_p95_ms: p95,
                pipelines_completed: self.pipelines_completed.get(),
                pipelines_failed: self.pipelines_failed.get(),
                provider_retries: self.provider_retries.get(),
                decode_errors: self.decode_errors.get(),
            },
            polling: PollingMetrics {
                running: self.scheduler_running.load(Ordering::Relaxed),
                active_targets: self.active_poll_targets.load(Ordering::Relaxed),
                polls: self.polls_performed.get(),
                failures: self.poll_failures.get(),
                skipped: self.polls_skipped.get(),
                deferred: self.polls_deferred.get(),
            },
            proposals: ProposalMetrics {
                created: self.proposals_created.get(),
                confirmed: self.proposals_confirmed.get(),
                rejected: self.proposals_rejected.get(),
                expired: self.proposals_expired.get(),
            },
            uptime_seconds: now.saturating_sub(self.started_at.load(Ordering::Relaxed)),
            timestamp: now,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub triggers: TriggerMetrics,
    pub steps: StepMetrics,
    pub polling: PollingMetrics,
    pub proposals: ProposalMetrics,
    pub uptime_seconds: u64,
    pub timestamp: u64,
}

#[derive(Debug, Serialize)]
pub struct TriggerMetrics {
    pub received: u64,
    pub applied: u64,
    pub busy: u64,
    pub failed: u64,
}

#[derive(Debug, Serialize)]
pub struct StepMetrics {
    pub started: u64,
    pub completed: u64,
    pub failed: u64,
    pub avg_duration_ms: f64,
    pub duration_p50_ms: f64,
    pub duration_p95_ms: f64,
    pub pipelines_completed: u64,
    pub pipelines_failed: u64,
    pub provider_retries: u64,
    pub decode_errors: u64,
}

#[derive(Debug, Serialize)]
pub struct PollingMetrics {
    pub running: bool,
    pub active_targets: u64,
    pub polls: u64,
    pub failures: u64,
    pub skipped: u64,
    pub deferred: u64,
}

#[derive(Debug, Serialize)]
pub struct ProposalMetrics {
    pub created: u64,
    pub confirmed: u64,
    pub rejected: u64,
    pub expired: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn percentile(sorted_data: &[u64], percentile: f64) -> f64 {
    if sorted_data.is_empty() {
        return 0.0;
    }

    let index = (percentile / 100.0) * (sorted_data.len() - 1) as f64;
    let lower = index.floor() as usize;
    let upper = index.ceil() as usize;

    if lower == upper {
        sorted_data[lower] as f64
    } else {
        let weight = index - lower as f64;
        sorted_data[lower] as f64 * (1.0 - weight) + sorted_data[upper] as f64 * weight
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let collector = MetricsCollector::new();

        collector.trigger_received();
        collector.trigger_received();
        collector.trigger_applied();
        collector.trigger_busy();
        collector.proposal_created();
        collector.proposal_rejected();

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.triggers.received, 2);
        assert_eq!(snapshot.triggers.applied, 1);
        assert_eq!(snapshot.triggers.busy, 1);
        assert_eq!(snapshot.proposals.created, 1);
        assert_eq!(snapshot.proposals.rejected, 1);
    }

    #[test]
    fn test_step_duration_statistics() {
        let collector = MetricsCollector::new();

        collector.step_completed(Duration::from_millis(100));
        collector.step_completed(Duration::from_millis(200));
        collector.step_failed(Duration::from_millis(300));

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.steps.completed, 2);
        assert_eq!(snapshot.steps.failed, 1);
        assert_eq!(snapshot.steps.avg_duration_ms, 200.0);
        assert_eq!(snapshot.steps.duration_p50_ms, 200.0);
    }

    #[test]
    fn test_duration_window_is_bounded() {
        let collector = MetricsCollector::new();
        for _ in 0..(MAX_DURATION_SAMPLES + 10) {
            collector.step_completed(Duration::from_millis(1));
        }
        assert_eq!(collector.step_durations.lock().unwrap().len(), MAX_DURATION_SAMPLES);
    }

    #[test]
    fn test_polling_gauges() {
        let collector = MetricsCollector::new();
        collector.set_scheduler_running(true);
        collector.set_active_poll_targets(3);
        collector.poll_performed();
        collector.poll_failed();

        let snapshot = collector.snapshot();
        assert!(snapshot.polling.running);
        assert_eq!(snapshot.polling.active_targets, 3);
        assert_eq!(snapshot.polling.polls, 1);
        assert_eq!(snapshot.polling.failures, 1);
    }

    #[test]
    fn test_reset() {
        let collector = MetricsCollector::new();
        collector.decode_error();
        collector.provider_retry();
        collector.set_scheduler_running(true);

        collector.reset();
        let snapshot = collector.snapshot();
        assert_eq!(snapshot.steps.decode_errors, 0);
        assert_eq!(snapshot.steps.provider_retries, 0);
        assert!(!snapshot.polling.running);
    }

    #[test]
    fn test_percentile() {
        let data = vec![10, 20, 30, 40, 50];
        assert_eq!(percentile(&data, 0.0), 10.0);
        assert_eq!(percentile(&data, 50.0), 30.0);
        assert_eq!(percentile(&data, 100.0), 50.0);
        assert_eq!(percentile(&[], 50.0), 0.0);
    }

    #[test]
    fn test_snapshot_serializes() {
        let snapshot = MetricsCollector::new().snapshot();
        let json = serde_json::to_value(&snapshot).unwrap();
        assert!(json["triggers"]["received"].is_u64());
        assert!(json["polling"]["running"].is_boolean());
    }
}
