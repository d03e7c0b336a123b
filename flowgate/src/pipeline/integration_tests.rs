//! End-to-end tests of pipeline execution over in-memory backends.

use crate::collaborators::{Credential, MockNotifier, MockSecretProvider, Severity};
use crate::core::{RunState, RunStatus, TriggerType};
use crate::errors::{ErrorKind, FlowgateError};
use crate::events;
use crate::pipeline::{PipelineDefinition, StepDefinition, TriggerRequest, PARTITIONED_QUERY};
use crate::quota::{LimitKind, QuotaLimits};
use crate::testing::{
    assert_rows_tagged, assert_run_finished, assert_step_statuses, test_config, SlowEngine,
    TestHarness,
};
use crate::warehouse::{TableRef, WarehouseOp};
use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn pipeline(id: &str, steps: Vec<StepDefinition>) -> PipelineDefinition {
    PipelineDefinition::new(id, steps)
}

#[tokio::test]
async fn test_failing_middle_step_stops_pipeline() {
    let harness = TestHarness::new();
    harness.define(&pipeline(
        "three",
        vec![
            StepDefinition::new("step1", "count"),
            StepDefinition::new("step2", "fail"),
            StepDefinition::new("step3", "count"),
        ],
    ));

    let summary = harness
        .app
        .executor
        .trigger(TriggerRequest::new("acme", "three"))
        .await
        .unwrap();

    assert_eq!(summary.status, RunStatus::Failed);
    assert_eq!(summary.failed_step().unwrap().step_id, "step2");
    assert!(summary.error_message.as_deref().unwrap().contains("step exploded"));

    let runs = harness.pipeline_runs("acme").await;
    assert_eq!(runs.len(), 1);
    assert_run_finished(&runs[0], RunStatus::Failed);
    let steps = harness.step_runs(&runs[0]).await;
    assert_step_statuses(&steps, &[("step1", RunStatus::Completed), ("step2", RunStatus::Failed)]);
    assert_eq!(harness.counter.call_count(), 1);
}

#[tokio::test]
async fn test_successful_run_records_and_events() {
    let harness = TestHarness::new();
    harness.define(&pipeline("one", vec![StepDefinition::new("only", "count")]));

    let summary = harness
        .app
        .executor
        .trigger(TriggerRequest::new("acme", "one").with_trigger_by("ops@acme"))
        .await
        .unwrap();

    assert!(summary.is_success());
    assert_eq!(summary.rows_processed(), 10);
    let run = &harness.pipeline_runs("acme").await[0];
    assert_run_finished(run, RunStatus::Completed);
    assert_eq!(run.trigger_type, TriggerType::Api);
    assert_eq!(run.trigger_by.as_deref(), Some("ops@acme"));

    assert_eq!(
        harness.events.event_types(),
        vec![
            events::RUN_STARTED,
            events::STEP_STARTED,
            events::STEP_COMPLETED,
            events::RUN_COMPLETED,
        ]
    );
    let sent = harness.notifier.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].severity, Severity::Info);
    assert_eq!(sent[0].event, events::RUN_COMPLETED);
}

#[tokio::test]
async fn test_dedup_rerun_replaces_generation() {
    let harness = TestHarness::new();
    let mut definition = pipeline(
        "ingest",
        vec![StepDefinition::new("load", "write")
            .with_config("target", "mart.events")
            .with_config("rows", "${rows}")
            .with_config("mode", "dedup")
            .with_config("credential_id", "cred-1")],
    );
    definition.parameters.insert("rows".to_string(), json!(0));
    harness.define(&definition);
    let run_date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();

    let first = harness
        .app
        .executor
        .trigger(
            TriggerRequest::new("acme", "ingest")
                .with_parameter("rows", 100)
                .with_run_date(run_date),
        )
        .await
        .unwrap();
    assert_eq!(first.rows_processed(), 100);

    let second = harness
        .app
        .executor
        .trigger(
            TriggerRequest::new("acme", "ingest")
                .with_parameter("rows", 80)
                .with_run_date(run_date),
        )
        .await
        .unwrap();
    assert!(second.is_success());

    let rows = harness.warehouse.rows(&TableRef::new("mart", "events").unwrap());
    assert_eq!(rows.len(), 80);
    assert_rows_tagged(&rows, &second.pipeline_run_id.to_string());
}

#[tokio::test]
async fn test_merge_rerun_is_idempotent() {
    let harness = TestHarness::new();
    harness.define(&pipeline(
        "upsert",
        vec![StepDefinition::new("load", "write")
            .with_config("target", "mart.accounts")
            .with_config("rows", 25)],
    ));

    for _ in 0..2 {
        let summary = harness
            .app
            .executor
            .trigger(TriggerRequest::new("acme", "upsert"))
            .await
            .unwrap();
        assert!(summary.is_success());
    }

    assert_eq!(harness.warehouse.rows(&TableRef::new("mart", "accounts").unwrap()).len(), 25);
}

#[tokio::test]
async fn test_quota_released_on_every_path() {
    let harness = TestHarness::new();
    harness.define(&pipeline("ok", vec![StepDefinition::new("a", "count")]));
    harness.define(&pipeline("bad", vec![StepDefinition::new("a", "fail")]));
    harness.define(&pipeline("boom", vec![StepDefinition::new("a", "panic")]));

    for id in ["ok", "bad", "boom"] {
        harness
            .app
            .executor
            .trigger(TriggerRequest::new("acme", id))
            .await
            .unwrap();
        assert_eq!(harness.concurrent_usage("acme").await, 0, "slot leaked by '{id}'");
    }

    let usage = harness
        .app
        .quota
        .usage("acme", Utc::now().date_naive())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(usage.daily_count, 3);
}

#[tokio::test]
async fn test_admission_denied_has_no_side_effects() {
    let harness = TestHarness::new();
    harness.set_limits("acme", QuotaLimits { daily: 1, monthly: 10, concurrent: 5 });
    harness.define(&pipeline("p", vec![StepDefinition::new("a", "count")]));

    harness.app.executor.trigger(TriggerRequest::new("acme", "p")).await.unwrap();
    let err = harness
        .app
        .executor
        .trigger(TriggerRequest::new("acme", "p"))
        .await
        .unwrap_err();

    match err {
        FlowgateError::AdmissionDenied { limit, current, limit_value, .. } => {
            assert_eq!(limit, LimitKind::Daily);
            assert_eq!((current, limit_value), (1, 1));
        }
        other => panic!("expected admission denial, got {other:?}"),
    }
    assert_eq!(harness.pipeline_runs("acme").await.len(), 1);
    assert_eq!(harness.counter.call_count(), 1);
    assert_eq!(harness.events.events_of_type(events::RUN_DENIED).len(), 1);
}

#[tokio::test]
async fn test_unknown_step_type_fails_before_side_effects() {
    let harness = TestHarness::new();
    harness.define(&pipeline("p", vec![StepDefinition::new("a", "reflective_loader")]));

    let err = harness
        .app
        .executor
        .trigger(TriggerRequest::new("acme", "p"))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Config);
    assert!(err.to_string().contains("reflective_loader"));
    assert!(harness.pipeline_runs("acme").await.is_empty());
    assert!(harness
        .app
        .quota
        .usage("acme", Utc::now().date_naive())
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_optional_step_failure_continues() {
    let harness = TestHarness::new();
    harness.define(&pipeline(
        "p",
        vec![
            StepDefinition::new("enrich", "fail").optional(),
            StepDefinition::new("load", "count"),
        ],
    ));

    let summary = harness
        .app
        .executor
        .trigger(TriggerRequest::new("acme", "p"))
        .await
        .unwrap();

    assert!(summary.is_success());
    assert!(summary.failed_step().is_none());
    assert_eq!(summary.rows_processed(), 10);
    let run = &harness.pipeline_runs("acme").await[0];
    let steps = harness.step_runs(run).await;
    assert_step_statuses(&steps, &[("enrich", RunStatus::Failed), ("load", RunStatus::Completed)]);
}

#[tokio::test]
async fn test_panicking_step_is_recorded_as_failed() {
    let harness = TestHarness::new();
    harness.define(&pipeline(
        "p",
        vec![StepDefinition::new("a", "count"), StepDefinition::new("b", "panic")],
    ));

    let summary = harness
        .app
        .executor
        .trigger(TriggerRequest::new("acme", "p"))
        .await
        .unwrap();

    assert_eq!(summary.status, RunStatus::Failed);
    let run = &harness.pipeline_runs("acme").await[0];
    assert_run_finished(run, RunStatus::Failed);
    let steps = harness.step_runs(run).await;
    assert_step_statuses(&steps, &[("a", RunStatus::Completed), ("b", RunStatus::Failed)]);
    assert!(steps[1].error_message.as_deref().unwrap().contains("panicked: engine bug"));
}

#[tokio::test]
async fn test_step_timeout_fails_step() {
    let harness = TestHarness::new();
    harness
        .app
        .register_engine("sleepy", Arc::new(SlowEngine::new(Duration::from_secs(30))));
    harness.define(&pipeline(
        "p",
        vec![StepDefinition::new("wait", "sleepy").with_timeout_secs(1)],
    ));

    let summary = harness
        .app
        .executor
        .trigger(TriggerRequest::new("acme", "p"))
        .await
        .unwrap();

    assert_eq!(summary.status, RunStatus::Failed);
    let step = &summary.steps[0];
    assert!(step.error.as_deref().unwrap().contains("timed out"), "{:?}", step.error);
    assert_eq!(harness.concurrent_usage("acme").await, 0);
}

#[tokio::test]
async fn test_cancel_run_skips_remaining_steps() {
    let harness = TestHarness::new();
    harness
        .app
        .register_engine("sleepy", Arc::new(SlowEngine::new(Duration::from_millis(200))));
    harness.define(&pipeline(
        "p",
        vec![StepDefinition::new("wait", "sleepy"), StepDefinition::new("after", "count")],
    ));

    let executor = harness.app.executor.clone();
    let handle = tokio::spawn(async move { executor.trigger(TriggerRequest::new("acme", "p")).await });

    let mut cancelled = false;
    for _ in 0..100 {
        if let Some(id) = harness.app.executor.active_runs().first() {
            cancelled = harness.app.executor.cancel_run(*id, "operator abort");
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(cancelled);

    let summary = handle.await.unwrap().unwrap();
    assert_eq!(summary.status, RunStatus::Failed);
    assert!(summary.error_message.as_deref().unwrap().contains("operator abort"));
    assert_eq!(summary.steps.len(), 1);
    assert_eq!(harness.counter.call_count(), 0);
    assert!(harness.app.executor.active_runs().is_empty());
}

#[tokio::test]
async fn test_cancel_abandons_step_that_ignores_token_after_grace() {
    let mut config = test_config();
    config.timeouts.grace_period_secs = 0;
    let harness = TestHarness::with_config(config, |_| {});
    harness
        .app
        .register_engine("stubborn", Arc::new(SlowEngine::new(Duration::from_secs(30))));
    harness.define(&pipeline(
        "p",
        vec![StepDefinition::new("wait", "stubborn"), StepDefinition::new("after", "count")],
    ));

    let executor = harness.app.executor.clone();
    let handle = tokio::spawn(async move { executor.trigger(TriggerRequest::new("acme", "p")).await });

    let mut cancelled = false;
    for _ in 0..100 {
        if let Some(id) = harness.app.executor.active_runs().first() {
            cancelled = harness.app.executor.cancel_run(*id, "operator abort");
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(cancelled);

    let summary = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("run ends within the grace period")
        .unwrap()
        .unwrap();
    assert_eq!(summary.status, RunStatus::Failed);
    assert_eq!(summary.steps.len(), 1);
    assert_eq!(summary.steps[0].status, RunStatus::Failed);
    assert!(summary.steps[0].error.as_deref().unwrap().contains("timed out"));
    assert_eq!(harness.counter.call_count(), 0);
    assert!(harness.app.executor.active_runs().is_empty());
}

#[tokio::test]
async fn test_dropped_invocation_still_finalizes_records() {
    let harness = TestHarness::new();
    harness
        .app
        .register_engine("sleepy", Arc::new(SlowEngine::new(Duration::from_secs(30))));
    harness.define(&pipeline("p", vec![StepDefinition::new("wait", "sleepy")]));

    let result = tokio::time::timeout(
        Duration::from_millis(100),
        harness.app.executor.trigger(TriggerRequest::new("acme", "p")),
    )
    .await;
    assert!(result.is_err());
    tokio::time::sleep(Duration::from_millis(100)).await;

    let run = &harness.pipeline_runs("acme").await[0];
    assert_run_finished(run, RunStatus::Failed);
    let steps = harness.step_runs(run).await;
    assert_step_statuses(&steps, &[("wait", RunStatus::Failed)]);
    assert_eq!(harness.concurrent_usage("acme").await, 0);
}

#[tokio::test]
async fn test_credential_leased_and_cleared() {
    let mut secrets = MockSecretProvider::new();
    secrets
        .expect_fetch()
        .withf(|tenant: &str, provider: &str| tenant == "acme" && provider == "vault")
        .times(1)
        .returning(|_, provider| Ok(Credential::new(provider, "s3cr3t", Duration::from_secs(60))));
    let harness = TestHarness::with_config(test_config(), |backends| {
        backends.secrets = Arc::new(secrets);
    });
    harness.define(&pipeline(
        "p",
        vec![StepDefinition::new("read", "record").with_credential("vault")],
    ));

    let summary = harness
        .app
        .executor
        .trigger(TriggerRequest::new("acme", "p"))
        .await
        .unwrap();

    assert!(summary.is_success());
    let seen = harness.recorder.seen();
    assert_eq!(seen[0].secret.as_deref(), Some("s3cr3t"));
    let handle = seen[0].credential.as_ref().unwrap();
    assert!(handle.is_cleared());
    assert!(handle.secret().is_err());
}

#[tokio::test]
async fn test_missing_credential_fails_step() {
    let harness = TestHarness::new();
    harness.define(&pipeline(
        "p",
        vec![StepDefinition::new("read", "record").with_credential("vault")],
    ));

    let summary = harness
        .app
        .executor
        .trigger(TriggerRequest::new("acme", "p"))
        .await
        .unwrap();

    assert_eq!(summary.status, RunStatus::Failed);
    assert!(summary.steps[0].error.as_deref().unwrap().contains("vault"));
    assert!(harness.recorder.seen().is_empty());
}

#[tokio::test]
async fn test_notifier_failure_is_swallowed() {
    let mut notifier = MockNotifier::new();
    notifier
        .expect_notify()
        .times(1)
        .returning(|_, _, _, _| Err(FlowgateError::Internal("smtp down".to_string())));
    let harness = TestHarness::with_config(test_config(), |backends| {
        backends.notifier = Arc::new(notifier);
    });
    harness.define(&pipeline("p", vec![StepDefinition::new("a", "count")]));

    let summary = harness
        .app
        .executor
        .trigger(TriggerRequest::new("acme", "p"))
        .await
        .unwrap();

    assert!(summary.is_success());
}

#[tokio::test]
async fn test_transient_run_log_failure_is_retried() {
    let harness = TestHarness::new();
    harness.define(&pipeline("p", vec![StepDefinition::new("a", "count")]));
    harness.run_log.inject_transient_failures(2);

    let summary = harness
        .app
        .executor
        .trigger(TriggerRequest::new("acme", "p"))
        .await
        .unwrap();

    assert!(summary.is_success());
    assert_eq!(harness.pipeline_runs("acme").await.len(), 1);
}

#[tokio::test]
async fn test_templates_and_parameters_reach_engine() {
    let harness = TestHarness::new();
    let mut definition = pipeline(
        "p",
        vec![StepDefinition::new("read", "record")
            .with_config("table", "${dataset}.orders")
            .with_config("owner", "${tenant_id}")],
    );
    definition.variables.insert("dataset".to_string(), json!("raw"));
    harness.define(&definition);

    harness
        .app
        .executor
        .trigger(TriggerRequest::new("acme", "p").with_parameter("dataset", "staging"))
        .await
        .unwrap();

    let seen = harness.recorder.seen();
    assert_eq!(seen[0].config["table"], "staging.orders");
    assert_eq!(seen[0].config["owner"], "acme");
    assert_eq!(seen[0].parameters["dataset"], "staging");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_partitioned_step_copies_source() {
    let harness = TestHarness::new();
    let source = TableRef::new("raw", "usage").unwrap();
    let rows = (0..12)
        .map(|i| json!({"day": format!("2024-01-{:02}", i % 4 + 1), "cost": i}).as_object().cloned().unwrap())
        .collect();
    harness.warehouse.seed(&source, rows);
    harness.define(&pipeline(
        "copy",
        vec![StepDefinition::new("fanout", PARTITIONED_QUERY)
            .with_config("source", "raw.usage")
            .with_config("destination", "mart.usage")
            .with_partition("day", Some(3))],
    ));

    let summary = harness
        .app
        .executor
        .trigger(TriggerRequest::new("acme", "copy"))
        .await
        .unwrap();

    assert!(summary.is_success(), "{:?}", summary.error_message);
    assert_eq!(summary.rows_processed(), 12);
    assert_eq!(harness.warehouse.rows(&TableRef::new("mart", "usage").unwrap()).len(), 12);
    assert_eq!(harness.warehouse.call_count(WarehouseOp::QueryInto), 4);
}

#[tokio::test]
async fn test_run_scheduled_lifecycle() {
    let harness = TestHarness::new();
    harness.define(&pipeline("nightly", vec![StepDefinition::new("a", "count")]));
    let scheduled_time = Utc::now() - ChronoDuration::seconds(1);
    let run_id = harness
        .app
        .state
        .create_scheduled_run("acme", "nightly", scheduled_time)
        .await
        .unwrap();

    let summary = harness.app.executor.run_scheduled(&run_id).await.unwrap();

    assert!(summary.is_success());
    let run = harness.app.state.get_run(&run_id).await.unwrap().unwrap();
    assert_eq!(run.state, RunState::Completed);
    assert_eq!(run.metadata["pipeline_run_id"], json!(summary.pipeline_run_id));
    assert_eq!(run.metadata["rows_processed"], 10);

    let record = &harness.pipeline_runs("acme").await[0];
    assert_eq!(record.trigger_type, TriggerType::Scheduled);
    assert_eq!(record.scheduled_run_id.as_deref(), Some(run_id.as_str()));

    let err = harness.app.executor.run_scheduled(&run_id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StateConflict);
}

#[tokio::test]
async fn test_run_scheduled_denied_stays_pending() {
    let harness = TestHarness::new();
    harness.set_limits("acme", QuotaLimits { daily: 10, monthly: 10, concurrent: 0 });
    harness.define(&pipeline("nightly", vec![StepDefinition::new("a", "count")]));
    let run_id = harness
        .app
        .state
        .create_scheduled_run("acme", "nightly", Utc::now() - ChronoDuration::seconds(1))
        .await
        .unwrap();

    let err = harness.app.executor.run_scheduled(&run_id).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::AdmissionDenied);
    let run = harness.app.state.get_run(&run_id).await.unwrap().unwrap();
    assert_eq!(run.state, RunState::Pending);
    assert_eq!(run.retry_count, 0);
    assert!(harness.pipeline_runs("acme").await.is_empty());
}

#[tokio::test]
async fn test_run_scheduled_unloadable_fails_terminally() {
    let harness = TestHarness::new();
    let run_id = harness
        .app
        .state
        .create_scheduled_run("acme", "missing", Utc::now() - ChronoDuration::seconds(1))
        .await
        .unwrap();

    assert!(harness.app.executor.run_scheduled(&run_id).await.is_err());

    let run = harness.app.state.get_run(&run_id).await.unwrap().unwrap();
    assert_eq!(run.state, RunState::Failed);
    assert!(run.error_message.is_some());
}

#[tokio::test]
async fn test_run_scheduled_failure_exhausts_retries() {
    let mut config = test_config();
    config.state.max_retries = 1;
    let harness = TestHarness::with_config(config, |_| {});
    harness.define(&pipeline("nightly", vec![StepDefinition::new("a", "fail")]));
    let run_id = harness
        .app
        .state
        .create_scheduled_run("acme", "nightly", Utc::now() - ChronoDuration::seconds(1))
        .await
        .unwrap();

    harness.app.executor.run_scheduled(&run_id).await.unwrap();
    let run = harness.app.state.get_run(&run_id).await.unwrap().unwrap();
    assert_eq!((run.state, run.retry_count), (RunState::Pending, 1));

    harness.app.executor.run_scheduled(&run_id).await.unwrap();
    let run = harness.app.state.get_run(&run_id).await.unwrap().unwrap();
    assert_eq!((run.state, run.retry_count), (RunState::Failed, 2));
    assert_eq!(harness.pipeline_runs("acme").await.len(), 2);
}
