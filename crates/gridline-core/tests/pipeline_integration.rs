//! Integration tests for routed pipelines against the scripted engine.

use async_trait::async_trait;
use gridline_core::fakes::ScriptedEngine;
use gridline_core::status::{CHECK_CONCLUSION, CHECK_NAME, CHECK_PAYLOAD, CHECK_SUMMARY, CHECK_TEXT};
use gridline_core::{
    build_router, names, Conclusion, Event, ExecutionEngine, ExecutionError, GridlineConfig,
    GridlineError, Job, JobResult, JobTemplate, PipelineConfig, PipelineDispatcher,
    PipelineState, Project,
};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// Holds the build job until the analyze pipeline has posted its end report.
#[derive(Default)]
struct GatedEngine {
    release: Notify,
    submitted: Mutex<Vec<String>>,
}

impl GatedEngine {
    fn position(&self, id: &str) -> Option<usize> {
        self.submitted.lock().unwrap().iter().position(|s| s == id)
    }
}

#[async_trait]
impl ExecutionEngine for GatedEngine {
    async fn submit(&self, job: &Job) -> Result<JobResult, ExecutionError> {
        self.submitted.lock().unwrap().push(job.id.clone());
        match job.id.as_str() {
            "go-build-test" => self.release.notified().await,
            "analyze-end" => self.release.notify_one(),
            _ => {}
        }
        Ok(JobResult::new(job.id.as_str()))
    }

    fn name(&self) -> &str {
        "gated"
    }
}

fn project() -> Arc<Project> {
    Arc::new(Project::new("brigade-123", "acme/widgets"))
}

fn check_suite_event() -> Arc<Event> {
    Arc::new(Event::new(
        names::CHECK_SUITE_REQUESTED,
        br#"{"action":"requested"}"#.to_vec(),
    ))
}

fn dispatcher(engine: Arc<ScriptedEngine>, config: &GridlineConfig) -> PipelineDispatcher {
    dispatcher_with(engine, config)
}

fn dispatcher_with(
    engine: Arc<dyn ExecutionEngine>,
    config: &GridlineConfig,
) -> PipelineDispatcher {
    PipelineDispatcher::from_config(engine, config)
}

/// Test: build succeeds, end job reports success with the job output
#[tokio::test]
async fn test_build_success_reports_output() {
    let engine = Arc::new(ScriptedEngine::new().succeed("go-build-test", "ok"));
    let config = GridlineConfig {
        pipelines: vec![PipelineConfig::go_build()],
        ..GridlineConfig::default()
    };
    let dispatcher = dispatcher(engine.clone(), &config);

    assert_eq!(dispatcher.dispatch(check_suite_event(), project()), 1);
    let outcomes = dispatcher.drain().await;
    assert_eq!(outcomes.len(), 1);
    let outcome = outcomes[0].1.as_ref().expect("pipeline reported");
    assert_eq!(outcome.conclusion, Conclusion::Success);

    let end = engine.last_job("build-end").expect("end job submitted");
    assert_eq!(end.env[CHECK_CONCLUSION], "success");
    assert_eq!(end.env[CHECK_TEXT], "ok");
    assert_eq!(end.env[CHECK_PAYLOAD], r#"{"action":"requested"}"#);
    assert_eq!(
        engine.submitted_ids(),
        vec!["build-start", "go-build-test", "build-end"]
    );
}

/// Test: build fails, end job reports failure with the error text
#[tokio::test]
async fn test_build_failure_reports_error() {
    let engine = Arc::new(ScriptedEngine::new().fail("go-build-test", "exit 1"));
    let config = GridlineConfig {
        pipelines: vec![PipelineConfig::go_build()],
        ..GridlineConfig::default()
    };
    let dispatcher = dispatcher(engine.clone(), &config);

    dispatcher.dispatch(check_suite_event(), project());
    let outcomes = dispatcher.drain().await;
    let outcome = outcomes[0].1.as_ref().expect("pipeline reported");
    assert_eq!(outcome.conclusion, Conclusion::Failure);

    let end = engine.last_job("build-end").expect("end job submitted");
    assert_eq!(end.env[CHECK_CONCLUSION], "failure");
    assert_eq!(end.env[CHECK_TEXT], "Error: exit 1");
    assert_eq!(end.env[CHECK_SUMMARY], "Build or tests failed");
}

/// Test: analyze failures are advisory
#[tokio::test]
async fn test_analyze_failure_is_neutral() {
    let engine = Arc::new(ScriptedEngine::new().fail("go-lint", "3 issues found"));
    let dispatcher = dispatcher(engine.clone(), &GridlineConfig::default());

    dispatcher.dispatch(check_suite_event(), project());
    let outcomes = dispatcher.drain().await;

    let analyze = outcomes
        .iter()
        .find(|(name, _)| name == "analyze")
        .and_then(|(_, r)| r.as_ref().ok())
        .expect("analyze reported");
    assert_eq!(analyze.conclusion, Conclusion::Neutral);

    let end = engine.last_job("analyze-end").expect("end job submitted");
    assert_eq!(end.env[CHECK_CONCLUSION], "neutral");
    assert_ne!(end.env[CHECK_CONCLUSION], "failure");
}

/// Test: build and analyze report independently of each other
#[tokio::test]
async fn test_pipelines_are_independent() {
    let engine = Arc::new(
        ScriptedEngine::new()
            .fail("go-build-test", "compile error")
            .succeed("go-lint", "clean"),
    );
    let dispatcher = dispatcher(engine.clone(), &GridlineConfig::default());

    assert_eq!(dispatcher.dispatch(check_suite_event(), project()), 2);
    let outcomes: BTreeMap<String, _> = dispatcher.drain().await.into_iter().collect();

    let build = outcomes["build"].as_ref().expect("build reported");
    let analyze = outcomes["analyze"].as_ref().expect("analyze reported");
    assert_eq!(build.conclusion, Conclusion::Failure);
    assert_eq!(analyze.conclusion, Conclusion::Success);

    // exactly one terminal report per check
    let ids = engine.submitted_ids();
    assert_eq!(ids.iter().filter(|id| *id == "build-end").count(), 1);
    assert_eq!(ids.iter().filter(|id| *id == "analyze-end").count(), 1);
    assert_eq!(
        engine.last_job("analyze-end").expect("analyze end").env[CHECK_NAME],
        "analyze"
    );
}

/// Test: analyze completes while build is still blocked on its job
#[tokio::test]
async fn test_pipelines_run_concurrently() {
    let engine = Arc::new(GatedEngine::default());
    let dispatcher = dispatcher_with(engine.clone(), &GridlineConfig::default());

    assert_eq!(dispatcher.dispatch(check_suite_event(), project()), 2);
    let outcomes = tokio::time::timeout(Duration::from_secs(5), dispatcher.drain())
        .await
        .expect("build waits on analyze, so pipelines must interleave");

    assert_eq!(outcomes.len(), 2);
    assert!(outcomes.iter().all(|(_, outcome)| outcome.is_ok()));
    let analyze_end = engine.position("analyze-end").expect("analyze reported");
    let build_job = engine.position("go-build-test").expect("build job submitted");
    let build_end = engine.position("build-end").expect("build reported");
    assert!(build_job < analyze_end);
    assert!(analyze_end < build_end);
}

/// Test: a failing job short-circuits later jobs, the end job still runs
#[tokio::test]
async fn test_failed_job_skips_rest_but_still_reports() {
    let mut build = PipelineConfig::go_build();
    build.jobs.push(JobTemplate {
        id: "publish".to_string(),
        image: "alpine".to_string(),
        tasks: vec!["echo publish {repo}".to_string()],
        env: BTreeMap::new(),
        force_pull: false,
    });
    let config = GridlineConfig {
        pipelines: vec![build],
        ..GridlineConfig::default()
    };
    let engine = Arc::new(ScriptedEngine::new().fail("go-build-test", "exit 2"));
    let dispatcher = dispatcher(engine.clone(), &config);

    dispatcher.dispatch(check_suite_event(), project());
    let outcomes = dispatcher.drain().await;
    let outcome = outcomes[0].1.as_ref().expect("pipeline reported");

    assert!(engine.last_job("publish").is_none());
    assert_eq!(
        engine.submitted_ids(),
        vec!["build-start", "go-build-test", "build-end"]
    );
    assert_eq!(
        outcome.states,
        vec![
            PipelineState::NotStarted,
            PipelineState::ReportingStart,
            PipelineState::RunningJobs,
            PipelineState::ReportingEnd(Conclusion::Failure),
            PipelineState::Done,
        ]
    );
}

/// Test: a broken reporting channel surfaces as a reporting error
#[tokio::test]
async fn test_reporting_failure_propagates() {
    let engine = Arc::new(ScriptedEngine::new().fail("build-end", "checks api down"));
    let config = GridlineConfig {
        pipelines: vec![PipelineConfig::go_build()],
        ..GridlineConfig::default()
    };
    let dispatcher = dispatcher(engine.clone(), &config);

    dispatcher.dispatch(check_suite_event(), project());
    let outcomes = dispatcher.drain().await;
    assert!(matches!(
        outcomes[0].1,
        Err(GridlineError::Reporting { .. })
    ));
    // the end job is not retried
    assert_eq!(
        engine
            .submitted_ids()
            .iter()
            .filter(|id| *id == "build-end")
            .count(),
        1
    );
}

/// Test: routed trigger event spawns the configured pipelines
#[tokio::test]
async fn test_router_dispatches_trigger_to_pipelines() {
    let engine = Arc::new(ScriptedEngine::new().succeed("go-build-test", "ok"));
    let gateway = build_router(&GridlineConfig::default(), engine.clone()).expect("router");

    let report = gateway
        .router
        .dispatch_shared(check_suite_event(), project())
        .await;
    assert_eq!(report.invoked, 1);
    assert!(report.is_clean());

    let outcomes = gateway.dispatcher.drain().await;
    assert_eq!(outcomes.len(), 2);
    assert!(outcomes.iter().all(|(_, r)| r.is_ok()));

    let build = engine.last_job("go-build-test").expect("build job");
    assert_eq!(build.tasks[0], "cd /src/acme/widgets");
}

/// Test: storage events are only logged
#[tokio::test]
async fn test_log_events_do_not_start_pipelines() {
    let engine = Arc::new(ScriptedEngine::new());
    let gateway = build_router(&GridlineConfig::default(), engine.clone()).expect("router");

    let report = gateway
        .router
        .dispatch(
            Event::new(names::BLOB_DELETED, br#"{"url":"x"}"#.to_vec()),
            Project::new("p", "acme/widgets"),
        )
        .await;

    assert_eq!(report.invoked, 1);
    assert!(gateway.dispatcher.drain().await.is_empty());
    assert!(engine.submitted().is_empty());
}

/// Test: a throwing BlobCreated handler does not stop its sibling
#[tokio::test]
async fn test_throwing_blob_handler_does_not_block_sibling() {
    let engine = Arc::new(ScriptedEngine::new());
    let mut gateway = build_router(&GridlineConfig::default(), engine).expect("router");

    let calls: Arc<Mutex<Vec<String>>> = Arc::default();
    gateway
        .router
        .on(names::BLOB_CREATED, "thrower", |_, _| async {
            anyhow::bail!("cannot index blob")
        });
    let seen = Arc::clone(&calls);
    gateway
        .router
        .on(names::BLOB_CREATED, "indexer", move |event, _| {
            let seen = Arc::clone(&seen);
            async move {
                seen.lock().unwrap().push(event.name.clone());
                Ok(())
            }
        });

    let report = gateway
        .router
        .dispatch(
            Event::new(names::BLOB_CREATED, b"{}".to_vec()),
            Project::new("p", "acme/widgets"),
        )
        .await;

    assert_eq!(report.invoked, 3);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].handler, "thrower");
    assert_eq!(*calls.lock().unwrap(), vec![names::BLOB_CREATED.to_string()]);
}
