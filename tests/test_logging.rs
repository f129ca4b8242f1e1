//! Tests for logging configuration and the metrics collector
//!
//! Covers the pure parsing helpers behind `LOG_FORMAT` and `LOG_LEVEL`, and the
//! counters the engine reports through `metrics`.

use agent_pipeline::observability::{parse_level, LogFormat, MetricsCollector};
use std::time::Duration;
use tracing::Level;

#[test]
fn test_log_format_parse_is_case_insensitive() {
    for input in ["json", "JSON", "Json"] {
        assert_eq!(LogFormat::parse(input), LogFormat::Json);
    }
    for input in ["pretty", "PRETTY", "Pretty"] {
        assert_eq!(LogFormat::parse(input), LogFormat::Pretty);
    }
    for input in ["compact", "COMPACT", "Compact"] {
        assert_eq!(LogFormat::parse(input), LogFormat::Compact);
    }
}

#[test]
fn test_log_format_unknown_defaults_to_json() {
    for input in ["invalid", "", "xml", "123", "  pretty  "] {
        assert_eq!(LogFormat::parse(input), LogFormat::Json, "input: {input:?}");
    }
}

#[test]
fn test_log_level_unknown_defaults_to_info() {
    assert_eq!(parse_level("error"), Level::ERROR);
    assert_eq!(parse_level("Trace"), Level::TRACE);
    assert_eq!(parse_level("verbose"), Level::INFO);
    assert_eq!(parse_level(""), Level::INFO);
}

#[test]
fn test_metrics_snapshot_counts_engine_events() {
    let collector = MetricsCollector::new();

    collector.trigger_received();
    collector.trigger_received();
    collector.trigger_applied();
    collector.trigger_busy();
    collector.step_started();
    collector.step_completed(Duration::from_millis(100));
    collector.step_failed(Duration::from_millis(300));
    collector.pipeline_failed();
    collector.decode_error();
    collector.set_active_poll_targets(4);
    collector.set_scheduler_running(true);
    collector.proposal_created();
    collector.proposal_confirmed();

    let snapshot = collector.snapshot();
    assert_eq!(snapshot.triggers.received, 2);
    assert_eq!(snapshot.triggers.applied, 1);
    assert_eq!(snapshot.triggers.busy, 1);
    assert_eq!(snapshot.steps.started, 1);
    assert_eq!(snapshot.steps.completed, 1);
    assert_eq!(snapshot.steps.failed, 1);
    assert_eq!(snapshot.steps.pipelines_failed, 1);
    assert_eq!(snapshot.steps.decode_errors, 1);
    assert!((snapshot.steps.avg_duration_ms - 200.0).abs() < 1.0);
    assert!(snapshot.polling.running);
    assert_eq!(snapshot.polling.active_targets, 4);

    collector.reset();
    let snapshot = collector.snapshot();
    assert_eq!(snapshot.triggers.received, 0);
    assert_eq!(snapshot.steps.started, 0);
}

#[test]
fn test_metrics_snapshot_serializes() {
    let collector = MetricsCollector::new();
    collector.poll_performed();
    collector.poll_failed();
    collector.poll_skipped();
    collector.poll_deferred(3);

    let json = serde_json::to_value(collector.snapshot()).unwrap();
    assert_eq!(json["polling"]["polls"], 1);
    assert_eq!(json["polling"]["skipped"], 1);
    assert_eq!(json["polling"]["deferred"], 3);
    assert!(json["uptime_seconds"].is_u64());
}
