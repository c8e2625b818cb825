//! Integration tests for job lifecycle scenarios.

mod common;

use std::time::Duration;

use common::{fast_config, TestOrchestrator};
use sidereal_orchestrator::adapter::ScriptedStep;
use sidereal_orchestrator::{
    CancelOutcome, FailureKind, JobFilter, JobKind, JobRequest, JobState, OrchestratorError,
    TargetId,
};
use tokio::time::sleep;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn deploy_and_restart_on_same_target_never_overlap() {
    let test = TestOrchestrator::new();
    test.adapter.push_all(
        "app-1",
        [
            ScriptedStep::succeed().with_delay(Duration::from_millis(150)),
            ScriptedStep::succeed().with_delay(Duration::from_millis(50)),
        ],
    );

    let deploy = test
        .orchestrator
        .submit_request(JobRequest::new("app-1", JobKind::Deploy).with_source("app:v2"))
        .unwrap();
    test.wait_for(&deploy, |r| r.state == JobState::Running).await;

    let restart = test.orchestrator.submit("app-1", JobKind::Restart).unwrap();
    sleep(Duration::from_millis(20)).await;
    assert_eq!(
        test.orchestrator.get(&deploy).unwrap().state,
        JobState::Running
    );
    assert_eq!(
        test.orchestrator.get(&restart).unwrap().state,
        JobState::Queued
    );

    let deploy = test.wait_terminal(&deploy).await;
    let restart = test.wait_terminal(&restart).await;
    assert_eq!(deploy.state, JobState::Succeeded);
    assert_eq!(restart.state, JobState::Succeeded);

    assert_eq!(test.adapter.peak_concurrency(&TargetId::new("app-1")), 1);
    assert!(deploy.finished_at.unwrap() <= restart.started_at.unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn worker_pool_bounds_parallel_calls() {
    let test = TestOrchestrator::with_workers(2);
    let ids: Vec<_> = (0..6)
        .map(|i| {
            let target = format!("app-{i}");
            test.adapter.push(
                target.as_str(),
                ScriptedStep::succeed().with_delay(Duration::from_millis(30)),
            );
            test.orchestrator.submit(target, JobKind::Restart).unwrap()
        })
        .collect();

    for id in &ids {
        assert_eq!(test.wait_terminal(id).await.state, JobState::Succeeded);
    }
    assert!(test.adapter.peak_total_concurrency() <= 2);
    assert_eq!(test.adapter.calls().len(), 6);
}

#[tokio::test]
async fn transient_failures_are_retried_until_success() {
    let test = TestOrchestrator::new();
    test.adapter.push_all(
        "app-1",
        [
            ScriptedStep::transient("connection reset"),
            ScriptedStep::transient("rate limited"),
        ],
    );

    let id = test.orchestrator.submit("app-1", JobKind::Restart).unwrap();
    let record = test.wait_terminal(&id).await;

    assert_eq!(record.state, JobState::Succeeded);
    assert_eq!(record.attempt, 3);
    assert_eq!(test.adapter.calls_for(&TargetId::new("app-1")).len(), 3);
}

#[tokio::test]
async fn retries_stop_at_the_attempt_limit() {
    let test = TestOrchestrator::new();
    test.adapter.push_all(
        "app-1",
        [
            ScriptedStep::transient("timeout"),
            ScriptedStep::transient("timeout"),
            ScriptedStep::transient("still timing out"),
        ],
    );

    let id = test.orchestrator.submit("app-1", JobKind::Stop).unwrap();
    let record = test.wait_terminal(&id).await;

    assert_eq!(record.state, JobState::Failed);
    let failure = record.failure().unwrap();
    assert_eq!(failure.kind, FailureKind::RetriesExhausted);
    assert_eq!(failure.attempt, 3);
    assert_eq!(failure.message, "still timing out");
}

#[tokio::test]
async fn permanent_failure_is_not_retried() {
    let test = TestOrchestrator::new();
    test.adapter
        .push("app-1", ScriptedStep::permanent("app not found").with_lines(["looking up app-1"]));

    let id = test.orchestrator.submit("app-1", JobKind::Delete).unwrap();
    let record = test.wait_terminal(&id).await;

    assert_eq!(record.state, JobState::Failed);
    assert_eq!(record.attempt, 1);
    let failure = record.failure().unwrap();
    assert_eq!(failure.kind, FailureKind::Permanent);
    assert_eq!(failure.message, "app not found");
    assert_eq!(record.logs.to_vec(), vec!["looking up app-1"]);
    assert_eq!(test.adapter.calls().len(), 1);
}

#[tokio::test]
async fn cancel_while_queued_is_immediate_and_never_runs() {
    let test = TestOrchestrator::with_workers(1);
    test.adapter.push(
        "app-1",
        ScriptedStep::succeed().with_delay(Duration::from_millis(200)),
    );

    let blocker = test.orchestrator.submit("app-1", JobKind::Restart).unwrap();
    test.wait_for(&blocker, |r| r.state == JobState::Running).await;

    let queued = test.orchestrator.submit("app-2", JobKind::Deploy).unwrap();
    assert_eq!(
        test.orchestrator.cancel(&queued).unwrap(),
        CancelOutcome::Cancelled
    );

    let record = test.orchestrator.get(&queued).unwrap();
    assert_eq!(record.state, JobState::Cancelled);
    assert!(record.started_at.is_none());
    assert_eq!(test.orchestrator.pending_count(), 0);

    test.wait_terminal(&blocker).await;
    sleep(Duration::from_millis(50)).await;
    assert!(test.adapter.calls_for(&TargetId::new("app-2")).is_empty());
}

#[tokio::test]
async fn cancel_during_adapter_call_is_too_late() {
    let test = TestOrchestrator::new();
    test.adapter.push(
        "app-1",
        ScriptedStep::succeed().with_delay(Duration::from_millis(150)),
    );

    let id = test.orchestrator.submit("app-1", JobKind::Deploy).unwrap();
    test.wait_for(&id, |r| r.state == JobState::Running).await;

    assert_eq!(test.orchestrator.cancel(&id).unwrap(), CancelOutcome::TooLate);

    let record = test.wait_terminal(&id).await;
    assert_eq!(record.state, JobState::Succeeded);
    assert_eq!(
        test.orchestrator.cancel(&id).unwrap(),
        CancelOutcome::AlreadyFinished {
            state: JobState::Succeeded
        }
    );
}

#[tokio::test]
async fn cancel_during_retry_backoff_stops_the_job() {
    let mut config = fast_config();
    config.retry.initial_backoff_ms = 2_000;
    config.retry.max_backoff_ms = 2_000;
    let test = TestOrchestrator::with_config(config);
    test.adapter
        .push("app-1", ScriptedStep::transient("connection reset"));

    let id = test.orchestrator.submit("app-1", JobKind::Restart).unwrap();
    test.wait_for(&id, |r| r.attempt == 1).await;

    let mut outcome = CancelOutcome::TooLate;
    for _ in 0..100 {
        outcome = test.orchestrator.cancel(&id).unwrap();
        if outcome != CancelOutcome::TooLate {
            break;
        }
        sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(outcome, CancelOutcome::Cancelled);

    let record = test.orchestrator.get(&id).unwrap();
    assert_eq!(record.state, JobState::Cancelled);
    assert_eq!(record.attempt, 1);

    // The worker wakes, sees the cancellation and frees the target.
    let next = test.orchestrator.submit("app-1", JobKind::Restart).unwrap();
    assert_eq!(test.wait_terminal(&next).await.state, JobState::Succeeded);
    assert_eq!(test.adapter.calls_for(&TargetId::new("app-1")).len(), 2);
}

#[tokio::test]
async fn full_queue_rejects_submissions() {
    let mut config = fast_config();
    config.queue.capacity = 2;
    config.worker.count = 1;
    let test = TestOrchestrator::with_config(config);
    test.adapter.push(
        "app-1",
        ScriptedStep::succeed().with_delay(Duration::from_millis(300)),
    );

    let running = test.orchestrator.submit("app-1", JobKind::Restart).unwrap();
    test.wait_for(&running, |r| r.state == JobState::Running).await;

    test.orchestrator.submit("app-2", JobKind::Restart).unwrap();
    test.orchestrator.submit("app-3", JobKind::Restart).unwrap();
    let rejected = test.orchestrator.submit("app-4", JobKind::Restart);

    assert!(matches!(rejected, Err(OrchestratorError::QueueFull)));
    assert_eq!(test.orchestrator.pending_count(), 2);
    assert!(test
        .orchestrator
        .list(&JobFilter::new().with_target("app-4"))
        .is_empty());
}

#[tokio::test]
async fn terminal_snapshots_are_stable() {
    let test = TestOrchestrator::new();
    test.adapter
        .push("app-1", ScriptedStep::succeed().with_lines(["release v3 live"]));

    let id = test.orchestrator.submit("app-1", JobKind::Deploy).unwrap();
    let first = test.wait_terminal(&id).await;
    sleep(Duration::from_millis(20)).await;
    let second = test.orchestrator.get(&id).unwrap();

    assert_eq!(first, second);
}

#[tokio::test]
async fn deploy_source_reaches_the_adapter() {
    let test = TestOrchestrator::new();
    let id = test
        .orchestrator
        .submit_request(
            JobRequest::new("app-1", JobKind::Deploy).with_source("registry.example/app:v7"),
        )
        .unwrap();
    let record = test.wait_terminal(&id).await;

    assert_eq!(record.source.as_deref(), Some("registry.example/app:v7"));
    assert_eq!(
        test.adapter.calls()[0].source.as_deref(),
        Some("registry.example/app:v7")
    );
}

#[tokio::test]
async fn invalid_requests_are_rejected() {
    let test = TestOrchestrator::new();

    let empty = test.orchestrator.submit("", JobKind::Restart);
    assert!(matches!(empty, Err(OrchestratorError::InvalidRequest(_))));

    let sourced_restart = test
        .orchestrator
        .submit_request(JobRequest::new("app-1", JobKind::Restart).with_source("app:v1"));
    assert!(matches!(
        sourced_restart,
        Err(OrchestratorError::InvalidRequest(_))
    ));
    assert!(test.orchestrator.list(&JobFilter::new()).is_empty());
}

#[tokio::test]
async fn failed_job_can_be_resubmitted() {
    let test = TestOrchestrator::new();
    test.adapter
        .push("app-1", ScriptedStep::permanent("bad credentials"));

    let failed = test.orchestrator.submit("app-1", JobKind::Restart).unwrap();
    assert_eq!(test.wait_terminal(&failed).await.state, JobState::Failed);

    let retried = test.orchestrator.resubmit(&failed).unwrap();
    assert_ne!(retried, failed);
    let record = test.wait_terminal(&retried).await;
    assert_eq!(record.state, JobState::Succeeded);
    assert_eq!(record.attempt, 1);

    let again = test.orchestrator.resubmit(&retried);
    assert!(matches!(
        again,
        Err(OrchestratorError::NotResubmittable {
            state: JobState::Succeeded,
            ..
        })
    ));
}

#[tokio::test]
async fn acknowledge_evicts_terminal_jobs_only() {
    let test = TestOrchestrator::new();
    test.adapter.push(
        "app-1",
        ScriptedStep::succeed().with_delay(Duration::from_millis(100)),
    );

    let id = test.orchestrator.submit("app-1", JobKind::Stop).unwrap();
    test.wait_for(&id, |r| r.state == JobState::Running).await;
    assert!(matches!(
        test.orchestrator.acknowledge(&id),
        Err(OrchestratorError::JobNotTerminal { .. })
    ));

    test.wait_terminal(&id).await;
    let record = test.orchestrator.acknowledge(&id).unwrap();
    assert_eq!(record.state, JobState::Succeeded);

    assert!(matches!(
        test.orchestrator.get(&id),
        Err(OrchestratorError::JobNotFound(_))
    ));
    assert!(test.store.get(&id).is_none());
}

#[tokio::test]
async fn adapter_panic_fails_job_and_keeps_worker_alive() {
    let test = TestOrchestrator::with_workers(1);
    test.adapter
        .push("app-1", ScriptedStep::panic("control plane client crashed"));

    let id = test.orchestrator.submit("app-1", JobKind::Deploy).unwrap();
    let record = test.wait_terminal(&id).await;

    assert_eq!(record.state, JobState::Failed);
    let failure = record.failure().unwrap();
    assert_eq!(failure.kind, FailureKind::Orphaned);
    assert!(failure.message.contains("control plane client crashed"));

    let next = test.orchestrator.submit("app-1", JobKind::Restart).unwrap();
    assert_eq!(test.wait_terminal(&next).await.state, JobState::Succeeded);
}

#[tokio::test]
async fn list_filters_by_target_and_state() {
    let test = TestOrchestrator::new();
    test.adapter
        .push("app-2", ScriptedStep::permanent("quota exceeded"));

    let first = test.orchestrator.submit("app-1", JobKind::Restart).unwrap();
    let second = test.orchestrator.submit("app-2", JobKind::Restart).unwrap();
    test.wait_terminal(&first).await;
    test.wait_terminal(&second).await;

    let all = test.orchestrator.list(&JobFilter::new());
    assert_eq!(all.len(), 2);

    let failed = test
        .orchestrator
        .list(&JobFilter::new().with_state(JobState::Failed));
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].id, second);

    let app1 = test
        .orchestrator
        .list(&JobFilter::new().with_target("app-1"));
    assert_eq!(app1.len(), 1);
    assert_eq!(app1[0].id, first);
}

#[tokio::test]
async fn target_logs_are_fetched_through_the_adapter() {
    let test = TestOrchestrator::new();
    test.adapter.push(
        "app-1",
        ScriptedStep::succeed().with_lines(["booting", "listening on :8080"]),
    );

    let id = test.orchestrator.submit("app-1", JobKind::Deploy).unwrap();
    test.wait_terminal(&id).await;

    let lines = test
        .orchestrator
        .fetch_target_logs(&TargetId::new("app-1"), 1)
        .await
        .unwrap();
    assert_eq!(lines, vec!["listening on :8080"]);
}
