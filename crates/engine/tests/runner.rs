//! Regression runner tests against an instrumented fake driver

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use common::{suite, Change, FakeDriver, Harness, ReadOnlyBaselines};
use visreg_common::{
    BaselineReason, BlobStore, ComparisonFailure, DriverError, Error, MemoryBlobStore,
    PairOutcome, TargetKey, ViewportClass,
};
use visreg_engine::report::{EntryStatus, Report};
use visreg_engine::runner::{RegressionRunner, RunFilter, RunOptions, REPORT_FILE};
use visreg_engine::RunContext;

fn key(page: &str, viewport: ViewportClass) -> TargetKey {
    TargetKey::new(page, viewport)
}

#[tokio::test]
async fn first_run_creates_baselines_then_passes() {
    let harness = Harness::new(FakeDriver::new());
    let runner = harness.runner(suite(&["home", "chat"], 2));

    let first = runner.run(&RunContext::new(), &RunOptions::default()).await.unwrap();
    assert_eq!(first.counts.total, 4);
    assert_eq!(first.counts.baseline_created, 4);
    assert_eq!(first.counts.passed, 0);
    assert_eq!(first.counts.failed, 0);
    assert!(first.is_clean());
    for pair in &first.results {
        assert!(matches!(
            pair.outcome,
            PairOutcome::BaselineCreated { version: 1, reason: BaselineReason::Missing }
        ));
    }

    let second = runner.run(&RunContext::new(), &RunOptions::default()).await.unwrap();
    assert_eq!(second.counts.passed, 4);
    assert!(second.is_clean());
    let home = second.get(&key("home", ViewportClass::Desktop)).unwrap();
    let comparison = home.outcome.comparison().unwrap();
    assert_eq!(comparison.similarity, 1.0);
    assert_eq!(comparison.baseline_version, Some(1));
    assert!(comparison.diff_image.is_none());
}

#[tokio::test]
async fn repeated_runs_yield_identical_verdicts() {
    let harness = Harness::new(FakeDriver::new());
    let runner = harness.runner(suite(&["home", "chat"], 2));
    runner.run(&RunContext::new(), &RunOptions::default()).await.unwrap();
    harness.driver.change("/chat", Change::Band);

    let a = runner.run(&RunContext::new(), &RunOptions::default()).await.unwrap();
    let b = runner.run(&RunContext::new(), &RunOptions::default()).await.unwrap();
    assert_eq!(a.results.len(), b.results.len());
    for (x, y) in a.results.iter().zip(&b.results) {
        assert_eq!(x.key, y.key);
        assert_eq!(x.outcome.is_pass(), y.outcome.is_pass());
        let (cx, cy) = (x.outcome.comparison().unwrap(), y.outcome.comparison().unwrap());
        assert!((cx.similarity - cy.similarity).abs() < 1e-9);
    }
    assert_eq!(a.counts, b.counts);
    assert_eq!(a.counts.failed, 2);
}

#[tokio::test]
async fn results_follow_configuration_order() {
    let harness = Harness::new(FakeDriver::with_delay(Duration::from_millis(5)));
    let runner = harness.runner(suite(&["a", "b", "c"], 3));
    let run = runner.run(&RunContext::new(), &RunOptions::default()).await.unwrap();
    let keys: Vec<String> = run.results.iter().map(|r| r.key.to_string()).collect();
    assert_eq!(
        keys,
        vec!["a@desktop", "a@mobile", "b@desktop", "b@mobile", "c@desktop", "c@mobile"]
    );
}

#[tokio::test]
async fn visual_change_fails_with_diff_image() {
    let harness = Harness::new(FakeDriver::new());
    let runner = harness.runner(suite(&["home", "chat"], 2));
    runner.run(&RunContext::new(), &RunOptions::default()).await.unwrap();

    harness.driver.change("/chat", Change::Band);
    let ctx = RunContext::new();
    let run = runner.run(&ctx, &RunOptions::default()).await.unwrap();
    assert!(!run.is_clean());
    assert_eq!(run.counts.failed, 2);
    assert_eq!(run.counts.passed, 2);

    let chat = run.get(&key("chat", ViewportClass::Desktop)).unwrap();
    let comparison = chat.outcome.comparison().unwrap();
    assert!(!comparison.passed);
    assert!(matches!(comparison.failure, Some(ComparisonFailure::BelowThreshold { .. })));
    // 64x48: top 9 rows changed
    assert!((comparison.similarity - (1.0 - 9.0 / 48.0)).abs() < 1e-9);
    let bbox = comparison.metadata.largest_cluster.unwrap();
    assert_eq!((bbox.x, bbox.y, bbox.width, bbox.height), (0, 0, 64, 9));

    let diff = comparison.diff_image.as_ref().unwrap();
    assert_eq!(diff.namespace, ctx.namespace());
    assert_eq!(diff.key, "diffs/chat/desktop.png");
    assert!(harness.blobs.get(&diff.namespace, &diff.key).await.unwrap().is_some());
}

#[tokio::test]
async fn dimension_change_is_distinct_failure() {
    let harness = Harness::new(FakeDriver::new());
    let runner = harness.runner(suite(&["home"], 1));
    runner.run(&RunContext::new(), &RunOptions::default()).await.unwrap();

    harness.driver.change("/home", Change::Taller);
    let run = runner.run(&RunContext::new(), &RunOptions::default()).await.unwrap();
    let pair = run.get(&key("home", ViewportClass::Mobile)).unwrap();
    let comparison = pair.outcome.comparison().unwrap();
    assert!(comparison.is_dimension_mismatch());
    assert!(comparison.diff_image.is_none());

    let report = Report::generate(&run);
    assert!(report
        .entries
        .iter()
        .all(|e| e.status == EntryStatus::DimensionMismatch));
}

#[tokio::test]
async fn update_baselines_forces_new_versions() {
    let harness = Harness::new(FakeDriver::new());
    let runner = harness.runner(suite(&["home"], 1));
    runner.run(&RunContext::new(), &RunOptions::default()).await.unwrap();

    harness.driver.change("/home", Change::Band);
    let options = RunOptions { update_baselines: true, ..Default::default() };
    let run = runner.run(&RunContext::new(), &options).await.unwrap();
    assert_eq!(run.counts.baseline_created, 2);
    assert!(run.results.iter().all(|r| matches!(
        r.outcome,
        PairOutcome::BaselineCreated { version: 2, reason: BaselineReason::Forced }
    )));

    let history = harness.baselines.history(&key("home", ViewportClass::Desktop)).await.unwrap();
    assert_eq!(history.active, Some(2));
    assert_eq!(history.versions.len(), 2);

    // The changed render is now the reference
    let run = runner.run(&RunContext::new(), &RunOptions::default()).await.unwrap();
    assert_eq!(run.counts.passed, 2);
}

#[tokio::test]
async fn concurrency_limit_is_never_exceeded() {
    let harness = Harness::new(FakeDriver::with_delay(Duration::from_millis(20)));
    let runner = harness.runner(suite(&["a", "b", "c", "d", "e", "f"], 3));
    let run = runner.run(&RunContext::new(), &RunOptions::default()).await.unwrap();

    assert_eq!(run.counts.total, 12);
    assert_eq!(harness.driver.calls(), 12);
    assert!(harness.driver.max_in_flight() <= 3);
    assert!(harness.driver.max_in_flight() >= 1);
}

#[tokio::test]
async fn serial_suite_runs_one_capture_at_a_time() {
    let harness = Harness::new(FakeDriver::with_delay(Duration::from_millis(5)));
    let runner = harness.runner(suite(&["a", "b"], 1));
    runner.run(&RunContext::new(), &RunOptions::default()).await.unwrap();
    assert_eq!(harness.driver.max_in_flight(), 1);
}

#[tokio::test]
async fn unreachable_target_is_isolated() {
    let harness = Harness::new(FakeDriver::new());
    harness.driver.fail(
        "/offline",
        DriverError::Navigation("net::ERR_CONNECTION_REFUSED".to_string()),
    );
    let mut config = suite(&["offline", "a", "b", "c"], 2);
    config.targets[0].viewports = Some(vec![common::viewports()[0]]);
    let runner = harness.runner(config);

    let run = runner.run(&RunContext::new(), &RunOptions::default()).await.unwrap();
    assert_eq!(run.counts.total, 7);
    assert_eq!(run.counts.capture_failed, 1);
    assert_eq!(run.counts.baseline_created, 6);
    assert!(!run.is_clean());

    let failed = run.get(&key("offline", ViewportClass::Desktop)).unwrap();
    match &failed.outcome {
        PairOutcome::CaptureFailed { reason, attempts } => {
            assert!(reason.contains("ERR_CONNECTION_REFUSED"));
            assert_eq!(*attempts, 2);
        }
        other => panic!("expected capture failure, got {:?}", other),
    }

    let report = Report::generate(&run);
    assert_eq!(report.unmeasured().count(), 1);
    assert_eq!(report.visual_failures().count(), 0);
}

#[tokio::test]
async fn truncated_capture_never_becomes_baseline() {
    let harness = Harness::new(FakeDriver::new());
    harness.driver.truncate("/home");
    let runner = harness.runner(suite(&["home"], 2));

    let first = runner.run(&RunContext::new(), &RunOptions::default()).await.unwrap();
    assert_eq!(first.counts.capture_failed, 2);
    assert_eq!(first.counts.baseline_created, 0);
    assert!(!first.is_clean());
    for pair in &first.results {
        match &pair.outcome {
            PairOutcome::CaptureFailed { reason, attempts } => {
                assert!(reason.contains("undecodable"), "{}", reason);
                assert_eq!(*attempts, 1);
            }
            other => panic!("expected capture failure, got {:?}", other),
        }
    }
    assert!(harness
        .baselines
        .get(&key("home", ViewportClass::Desktop))
        .await
        .unwrap()
        .is_none());

    harness.driver.restore("/home");
    let second = runner.run(&RunContext::new(), &RunOptions::default()).await.unwrap();
    assert_eq!(second.counts.baseline_created, 2);
    assert!(second.is_clean());
}

#[tokio::test]
async fn truncated_capture_is_not_blamed_on_baseline() {
    let harness = Harness::new(FakeDriver::new());
    let runner = harness.runner(suite(&["home"], 2));
    runner.run(&RunContext::new(), &RunOptions::default()).await.unwrap();

    harness.driver.truncate("/home");
    let run = runner.run(&RunContext::new(), &RunOptions::default()).await.unwrap();
    assert_eq!(run.counts.capture_failed, 2);
    assert_eq!(run.counts.baseline_errors, 0);

    harness.driver.restore("/home");
    let run = runner.run(&RunContext::new(), &RunOptions::default()).await.unwrap();
    assert_eq!(run.counts.passed, 2);
}

#[tokio::test]
async fn transient_errors_retried_once() {
    let harness = Harness::new(FakeDriver::new());
    harness.driver.flaky("/home", 1);
    harness.driver.flaky("/chat", 2);
    let mut config = suite(&["home", "chat"], 1);
    for target in &mut config.targets {
        target.viewports = Some(vec![common::viewports()[1]]);
    }
    let runner = harness.runner(config);

    let run = runner.run(&RunContext::new(), &RunOptions::default()).await.unwrap();
    let home = run.get(&key("home", ViewportClass::Mobile)).unwrap();
    assert_eq!(home.capture_attempts, 2);
    assert!(matches!(home.outcome, PairOutcome::BaselineCreated { .. }));

    let chat = run.get(&key("chat", ViewportClass::Mobile)).unwrap();
    assert_eq!(chat.capture_attempts, 2);
    assert!(matches!(chat.outcome, PairOutcome::CaptureFailed { attempts: 2, .. }));
    assert_eq!(harness.driver.calls(), 4);
}

#[tokio::test(start_paused = true)]
async fn hung_capture_times_out() {
    let harness = Harness::new(FakeDriver::new());
    harness.driver.hang("/stuck");
    let runner = harness.runner(suite(&["stuck", "home"], 2));

    let run = runner.run(&RunContext::new(), &RunOptions::default()).await.unwrap();
    let stuck = run.get(&key("stuck", ViewportClass::Desktop)).unwrap();
    match &stuck.outcome {
        PairOutcome::CaptureFailed { reason, attempts } => {
            assert!(reason.contains("timed out"), "{}", reason);
            assert_eq!(*attempts, 2);
        }
        other => panic!("expected timeout, got {:?}", other),
    }
    assert_eq!(run.counts.capture_failed, 2);
    assert_eq!(run.counts.baseline_created, 2);
}

#[tokio::test]
async fn cancellation_returns_partial_result() {
    let token = CancellationToken::new();
    let harness = Harness::new(FakeDriver::with_delay(Duration::from_millis(10)));
    harness.driver.cancel_on_call(1, token.clone());
    let runner = harness.runner(suite(&["a", "b", "c"], 1));

    let ctx = RunContext::with_cancel(token);
    let run = runner.run(&ctx, &RunOptions::default()).await.unwrap();
    assert!(run.cancelled);
    assert!(!run.is_clean());
    assert_eq!(run.results.len(), 1);
    assert_eq!(harness.driver.calls(), 1);
    assert_eq!(run.results[0].key, key("a", ViewportClass::Desktop));
}

#[tokio::test]
async fn narrowed_run_by_page_and_viewport() {
    let harness = Harness::new(FakeDriver::new());
    let runner = harness.runner(suite(&["home", "chat", "profile"], 2));

    let options = RunOptions {
        update_baselines: false,
        filter: RunFilter {
            page: Some("chat".to_string()),
            viewports: vec![ViewportClass::Mobile],
        },
    };
    let run = runner.run(&RunContext::new(), &options).await.unwrap();
    assert_eq!(run.results.len(), 1);
    assert_eq!(run.results[0].key, key("chat", ViewportClass::Mobile));
    assert_eq!(harness.driver.calls(), 1);

    let options = RunOptions {
        update_baselines: false,
        filter: RunFilter { page: None, viewports: vec![ViewportClass::Desktop] },
    };
    let run = runner.run(&RunContext::new(), &options).await.unwrap();
    assert_eq!(run.results.len(), 3);
    assert!(run.results.iter().all(|r| r.viewport.class == ViewportClass::Desktop));
}

#[tokio::test]
async fn configuration_errors_rejected_before_capture() {
    let harness = Harness::new(FakeDriver::new());

    let empty = RegressionRunner::new(
        suite(&[], 2),
        harness.driver.clone(),
        harness.blobs.clone(),
        harness.baselines.clone(),
    );
    assert!(matches!(empty, Err(Error::InvalidConfig(_))));

    let mut bad_threshold = suite(&["home"], 2);
    bad_threshold.threshold = 1.5;
    let result = RegressionRunner::new(
        bad_threshold,
        harness.driver.clone(),
        harness.blobs.clone(),
        harness.baselines.clone(),
    );
    assert!(matches!(result, Err(Error::InvalidConfig(_))));

    let runner = harness.runner(suite(&["home"], 2));
    let options = RunOptions {
        update_baselines: false,
        filter: RunFilter { page: Some("missing".to_string()), viewports: vec![] },
    };
    let err = runner.run(&RunContext::new(), &options).await.unwrap_err();
    assert!(matches!(err, Error::InvalidConfig(_)));

    let options = RunOptions {
        update_baselines: false,
        filter: RunFilter { page: None, viewports: vec![ViewportClass::Tablet] },
    };
    assert!(runner.run(&RunContext::new(), &options).await.is_err());
    assert_eq!(harness.driver.calls(), 0);
}

#[tokio::test]
async fn unavailable_driver_is_fatal() {
    let harness = Harness::new(FakeDriver::new());
    harness.driver.set_unavailable();
    let runner = harness.runner(suite(&["home"], 2));

    let err = runner.run(&RunContext::new(), &RunOptions::default()).await.unwrap_err();
    assert!(matches!(err, Error::DriverUnavailable(ref msg) if msg.contains("chromium")));
    assert_eq!(harness.driver.calls(), 0);
}

#[tokio::test]
async fn baseline_write_failure_is_not_a_visual_failure() {
    let blobs = Arc::new(ReadOnlyBaselines { inner: MemoryBlobStore::new() });
    let harness = Harness::with_blobs(FakeDriver::new(), blobs);
    let runner = harness.runner(suite(&["home"], 1));

    let run = runner.run(&RunContext::new(), &RunOptions::default()).await.unwrap();
    assert_eq!(run.counts.baseline_errors, 2);
    assert_eq!(run.counts.failed, 0);
    assert!(!run.is_clean());
    assert!(run.results.iter().all(|r| r.outcome.is_unmeasured()));
}

#[tokio::test]
async fn run_artifacts_persisted_in_run_namespace() {
    let harness = Harness::new(FakeDriver::new());
    let runner = harness.runner(suite(&["home"], 1));
    let ctx = RunContext::new();
    let run = runner.run(&ctx, &RunOptions::default()).await.unwrap();

    let keys = harness.blobs.list(&ctx.namespace(), "").await.unwrap();
    assert_eq!(
        keys,
        vec![
            "captures/home/desktop.png".to_string(),
            "captures/home/mobile.png".to_string(),
            REPORT_FILE.to_string(),
        ]
    );

    let json = harness.blobs.get(&ctx.namespace(), REPORT_FILE).await.unwrap().unwrap();
    let report = Report::from_json(std::str::from_utf8(&json).unwrap()).unwrap();
    assert_eq!(report.run_id, run.run_id);
    assert!(report.clean);
    assert!(report.entries.iter().all(|e| e.capture.is_some()));
}

#[tokio::test]
async fn concurrent_runs_do_not_share_state() {
    let harness = Harness::new(FakeDriver::with_delay(Duration::from_millis(5)));
    let runner = Arc::new(harness.runner(suite(&["home", "chat"], 2)));
    runner.run(&RunContext::new(), &RunOptions::default()).await.unwrap();

    let (ctx_a, ctx_b) = (RunContext::new(), RunContext::new());
    let (opts_a, opts_b) = (RunOptions::default(), RunOptions::default());
    let (a, b) = tokio::join!(
        runner.run(&ctx_a, &opts_a),
        runner.run(&ctx_b, &opts_b)
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_ne!(a.run_id, b.run_id);
    assert_eq!(a.counts.passed, 4);
    assert_eq!(b.counts.passed, 4);
    for pair in a.results.iter().chain(&b.results) {
        assert!(pair.capture.is_some());
    }
    assert!(a.results[0].capture.as_ref().unwrap().namespace.ends_with(&a.run_id));
    assert!(b.results[0].capture.as_ref().unwrap().namespace.ends_with(&b.run_id));
}
