//! Restart recovery tests
//!
//! A fresh engine over the same work items must rebuild its poll targets from
//! the tracking sections alone.


use agent_pipeline::orchestrator::{Proposal, Trigger, INTERRUPTED_REASON};
use agent_pipeline::polling::SchedulerSettings;
use agent_pipeline::testing::MockSyncProvider;
use agent_pipeline::services::WorkItemId;
use agent_pipeline::tracking::{render_into, PipelineStatus, StepStatus, TrackingBlock};
use chrono::Utc;
use test_helpers::{three_step_pipeline, Harness};

fn restarted(harness: &Harness) -> Harness {
    Harness::with_service(
        three_step_pipeline(),
        MockSyncProvider::always("plan"),
        MockSyncProvider::always("review"),
        SchedulerSettings::default(),
        harness.service.clone(),
    )
}

#[tokio::test]
async fn test_recover_reregisters_delegated_steps() {
    let before = Harness::new();
    let item = before.add_item("item-1", "task").await;
    before
        .orchestrator
        .submit_trigger(&item, Trigger::Enter)
        .await
        .unwrap();
    let handle = before.coder.handles().await[0].clone();

    let after = restarted(&before);
    assert!(after.orchestrator.poll_targets().is_empty());

    let report = after.orchestrator.recover().await.unwrap();
    assert_eq!(report.scanned, 1);
    assert_eq!(report.registered, 1);
    assert_eq!(report.resubmitted, 0);

    let targets = after.orchestrator.poll_targets();
    assert_eq!(targets.len(), 1);
    assert_eq!(targets[0].handle, handle);
    assert_eq!(targets[0].step_position, 2);

    after.coder.set_ready(&handle, "patch").await;
    after.orchestrator.poll_now().await;

    let block = after.block(&item).await;
    assert_eq!(block.status, PipelineStatus::Complete);
    // The delegated step was never dispatched a second time
    assert!(after.coder.handles().await.is_empty());
}

#[tokio::test]
async fn test_recover_retries_interrupted_sync_step() {
    let mut pipeline = three_step_pipeline();
    pipeline.agents[0].retries = 1;

    let mut block = TrackingBlock::for_pipeline(&pipeline);
    block.start_step(1, Utc::now()).unwrap();
    let harness = Harness::with_providers(
        pipeline,
        MockSyncProvider::always("plan"),
        MockSyncProvider::always("review"),
        SchedulerSettings::default(),
    );
    let item = harness
        .add_item("item-1", &render_into("task", &block))
        .await;

    let report = harness.orchestrator.recover().await.unwrap();
    assert_eq!(report.resubmitted, 1);

    let block = harness.block(&item).await;
    assert_eq!(block.steps[0].status, StepStatus::Complete);
    assert_eq!(block.steps[0].attempts, 2);
    assert_eq!(block.steps[1].status, StepStatus::InProgress);
    assert_eq!(harness.orchestrator.poll_targets().len(), 1);
}

#[tokio::test]
async fn test_interrupted_step_without_budget_fails_pipeline() {
    let pipeline = three_step_pipeline();
    let mut block = TrackingBlock::for_pipeline(&pipeline);
    block.start_step(1, Utc::now()).unwrap();

    let harness = Harness::new();
    let item = harness
        .add_item("item-1", &render_into("task", &block))
        .await;

    harness.orchestrator.recover().await.unwrap();

    let block = harness.block(&item).await;
    assert_eq!(block.status, PipelineStatus::Failed);
    assert_eq!(block.steps[0].failure_reason.as_deref(), Some(INTERRUPTED_REASON));
    assert_eq!(harness.planner.calls().await, 0);
}

#[tokio::test]
async fn test_recover_skips_idle_and_finished_items() {
    let harness = Harness::new();
    harness.add_item("plain", "no pipeline yet").await;

    let mut finished = TrackingBlock::for_pipeline(&three_step_pipeline());
    for position in 1..=3 {
        finished.start_step(position, Utc::now()).unwrap();
        finished
            .complete_step(position, Some(format!("out-{position}")), Utc::now())
            .unwrap();
    }
    finished.finish(PipelineStatus::Complete, Utc::now());
    let done = harness
        .add_item("done", &render_into("shipped", &finished))
        .await;

    let report = harness.orchestrator.recover().await.unwrap();
    assert_eq!(report.scanned, 2);
    assert_eq!(report.registered, 0);
    assert_eq!(report.resubmitted, 0);
    assert!(harness.orchestrator.poll_targets().is_empty());
    assert_eq!(harness.service.updates(), 0);
    assert_eq!(harness.block(&done).await, finished);
}

#[tokio::test]
async fn test_recover_republishes_undecided_proposals() {
    let before = Harness::new();
    let item = before.add_item("item-1", "task").await;
    before
        .orchestrator
        .submit_trigger(&item, Trigger::Enter)
        .await
        .unwrap();
    before.finish_delegated("patch").await;
    let done = before
        .surface
        .pending()
        .into_iter()
        .find(|p| p.summary() == "status -> Done")
        .unwrap();

    let after = restarted(&before);
    assert!(after.surface.pending().is_empty());
    assert!(after.orchestrator.pending_proposals(&item).is_empty());

    let report = after.orchestrator.recover().await.unwrap();
    assert_eq!(report.proposals, 2);
    assert_eq!(report.registered, 0);
    assert_eq!(after.surface.pending().len(), 2);
    assert_eq!(after.orchestrator.pending_proposals(&item).len(), 2);

    after.surface.confirm(done.id).unwrap();
    after.settle().await;

    assert_eq!(after.service.status(&item).await.as_deref(), Some("Done"));
    let block = after.block(&item).await;
    assert!(block.has_effect(done.id));
    assert_eq!(block.pending_proposals.len(), 1);

    // A second scan finds nothing new to publish
    let again = after.orchestrator.recover().await.unwrap();
    assert_eq!(again.proposals, 0);
    assert_eq!(after.surface.pending().len(), 1);
}

#[tokio::test]
async fn test_recover_drops_expired_proposals() {
    let mut block = TrackingBlock::for_pipeline(&three_step_pipeline());
    block.finish(PipelineStatus::Complete, Utc::now());
    let stale = Proposal::status_change(
        WorkItemId::new("item-1"),
        None,
        "Done",
        Utc::now() - chrono::Duration::days(8),
    );
    block.add_pending_proposal(stale.to_pending());

    let harness = Harness::new();
    let item = harness
        .add_item("item-1", &render_into("task", &block))
        .await;

    let report = harness.orchestrator.recover().await.unwrap();
    assert_eq!(report.proposals, 0);
    assert!(harness.surface.pending().is_empty());
    assert!(harness.block(&item).await.pending_proposals.is_empty());
    assert_eq!(harness.service.updates(), 1);
}
