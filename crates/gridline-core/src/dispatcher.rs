//! Pipeline dispatch: the composition root for trigger events.
//!
//! Each configured pipeline is spawned as its own task with its own jobs,
//! env maps and check run. Dispatch does not wait for them; the handles are
//! kept so a host can [`PipelineDispatcher::drain`] before exiting.

use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, Instrument};
use uuid::Uuid;

use crate::config::{GridlineConfig, JobTemplate, PipelineConfig};
use crate::error::{GridlineError, Result};
use crate::event::{Event, Project};
use crate::job::{ExecutionEngine, Job};
use crate::router::EventHandler;
use crate::runner::JobRunner;
use crate::status::{CheckReport, CheckSpec, ReportOutcome, ReportPolicy, StatusReporter};

/// Maps a project to the directory its jobs use as source checkout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceLayout {
    root: PathBuf,
}

impl WorkspaceLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>/<repo name segments>`. Empty, `.` and `..` segments are
    /// dropped so the path never leaves the root.
    pub fn path_for(&self, project: &Project) -> PathBuf {
        let mut path = self.root.clone();
        for segment in project.repo_name.split('/') {
            let mut components = Path::new(segment).components();
            if let (Some(Component::Normal(part)), None) = (components.next(), components.next()) {
                path.push(part);
            }
        }
        path
    }
}

/// Inputs shared by every pipeline spawned for one event.
#[derive(Debug, Clone)]
pub struct PipelineContext {
    pub event: Arc<Event>,
    pub project: Arc<Project>,
    pub workspace: PathBuf,
}

/// A reported sequence of jobs.
pub trait Pipeline: Send + Sync {
    fn name(&self) -> &str;

    /// Check run this pipeline owns, with its summaries and policy.
    fn report(&self, ctx: &PipelineContext) -> CheckReport;

    /// Append this pipeline's jobs to `runner`.
    fn plan(&self, ctx: &PipelineContext, runner: JobRunner) -> JobRunner;
}

/// Pipeline built from a [`PipelineConfig`].
#[derive(Debug, Clone)]
pub struct ConfiguredPipeline {
    config: PipelineConfig,
}

impl ConfiguredPipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self { config }
    }

    fn render_job(template: &JobTemplate, ctx: &PipelineContext) -> Job {
        let render = |s: &str| {
            s.replace("{workspace}", &ctx.workspace.to_string_lossy())
                .replace("{repo}", &ctx.project.repo_name)
        };
        let mut job = Job::new(&template.id, &template.image)
            .tasks(template.tasks.iter().map(|t| render(t.as_str())))
            .force_pull(template.force_pull);
        for (key, value) in &template.env {
            job = job.env(key, render(value.as_str()));
        }
        job
    }
}

impl Pipeline for ConfiguredPipeline {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn report(&self, ctx: &PipelineContext) -> CheckReport {
        CheckReport {
            check: CheckSpec::new(&self.config.name, &self.config.title),
            payload: ctx.event.payload_str().into_owned(),
            start_summary: self.config.start_summary.clone(),
            success_summary: self.config.success_summary.clone(),
            failure_summary: self.config.failure_summary.clone(),
            policy: if self.config.advisory {
                ReportPolicy::advisory()
            } else {
                ReportPolicy::blocking()
            },
        }
    }

    fn plan(&self, ctx: &PipelineContext, runner: JobRunner) -> JobRunner {
        self.config
            .jobs
            .iter()
            .fold(runner, |runner, template| runner.job(Self::render_job(template, ctx)))
    }
}

/// A spawned pipeline task.
pub struct PipelineHandle {
    pub name: String,
    handle: JoinHandle<Result<ReportOutcome>>,
}

impl PipelineHandle {
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the pipeline to reach `Done` or fail to report.
    pub async fn outcome(self) -> Result<ReportOutcome> {
        match self.handle.await {
            Ok(result) => result,
            Err(e) => Err(GridlineError::PipelineAborted {
                pipeline: self.name,
                reason: e.to_string(),
            }),
        }
    }
}

/// Spawns every pipeline for a trigger event.
pub struct PipelineDispatcher {
    engine: Arc<dyn ExecutionEngine>,
    reporter: Arc<StatusReporter>,
    layout: WorkspaceLayout,
    pipelines: Vec<Arc<dyn Pipeline>>,
    in_flight: Mutex<Vec<PipelineHandle>>,
}

impl PipelineDispatcher {
    pub fn new(
        engine: Arc<dyn ExecutionEngine>,
        reporter: StatusReporter,
        layout: WorkspaceLayout,
    ) -> Self {
        Self {
            engine,
            reporter: Arc::new(reporter),
            layout,
            pipelines: Vec::new(),
            in_flight: Mutex::new(Vec::new()),
        }
    }

    /// Dispatcher with the reporter, layout and pipelines from `config`.
    pub fn from_config(engine: Arc<dyn ExecutionEngine>, config: &GridlineConfig) -> Self {
        let reporter = StatusReporter::new(Arc::clone(&engine), &config.reporter);
        let layout = WorkspaceLayout::new(config.workspace_root.clone());
        config.pipelines.iter().fold(
            Self::new(engine, reporter, layout),
            |dispatcher, pipeline| {
                dispatcher.with_pipeline(Arc::new(ConfiguredPipeline::new(pipeline.clone())))
            },
        )
    }

    pub fn with_pipeline(mut self, pipeline: Arc<dyn Pipeline>) -> Self {
        self.pipelines.push(pipeline);
        self
    }

    pub fn pipeline_names(&self) -> Vec<&str> {
        self.pipelines.iter().map(|p| p.name()).collect()
    }

    pub fn context(&self, event: Arc<Event>, project: Arc<Project>) -> PipelineContext {
        let workspace = self.layout.path_for(&project);
        PipelineContext {
            event,
            project,
            workspace,
        }
    }

    /// Run one pipeline to completion on the current task.
    pub async fn run_pipeline(
        engine: Arc<dyn ExecutionEngine>,
        reporter: Arc<StatusReporter>,
        pipeline: Arc<dyn Pipeline>,
        ctx: PipelineContext,
    ) -> Result<ReportOutcome> {
        let report = pipeline.report(&ctx);
        let runner = pipeline.plan(&ctx, JobRunner::new(engine));
        reporter.wrap(&report, || runner.run_sequential()).await
    }

    /// Spawn every pipeline for the event and return their handles.
    pub fn spawn_all(&self, event: Arc<Event>, project: Arc<Project>) -> Vec<PipelineHandle> {
        let ctx = self.context(event, project);
        let dispatch_id = Uuid::new_v4();
        self.pipelines
            .iter()
            .map(|pipeline| {
                let name = pipeline.name().to_string();
                let span = info_span!(
                    "pipeline",
                    pipeline = %name,
                    event_name = %ctx.event.name,
                    dispatch_id = %dispatch_id
                );
                let task = {
                    let name = name.clone();
                    let engine = Arc::clone(&self.engine);
                    let reporter = Arc::clone(&self.reporter);
                    let pipeline = Arc::clone(pipeline);
                    let ctx = ctx.clone();
                    async move {
                        info!(event = "pipeline.started", workspace = %ctx.workspace.display());
                        let result = Self::run_pipeline(engine, reporter, pipeline, ctx).await;
                        match &result {
                            Ok(outcome) => {
                                info!(event = "pipeline.finished", conclusion = %outcome.conclusion)
                            }
                            Err(e) => {
                                error!(pipeline = %name, error = %e, "Pipeline could not report")
                            }
                        }
                        result
                    }
                };
                PipelineHandle {
                    name,
                    handle: tokio::spawn(task.instrument(span)),
                }
            })
            .collect()
    }

    /// Spawn the pipelines without waiting for them. Returns how many were
    /// started.
    ///
    /// Handles of pipelines that already finished are dropped here; their
    /// outcome has been logged by the pipeline task.
    pub fn dispatch(&self, event: Arc<Event>, project: Arc<Project>) -> usize {
        let handles = self.spawn_all(event, project);
        let spawned = handles.len();
        let mut in_flight = self
            .in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = in_flight.len();
        in_flight.retain(|handle| !handle.is_finished());
        debug!(pruned = before - in_flight.len(), "Dropped finished pipeline handles");
        in_flight.extend(handles);
        spawned
    }

    /// Pipelines tracked for [`drain`](Self::drain).
    pub fn in_flight_count(&self) -> usize {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Wait for every pipeline still tracked since the last dispatch.
    pub async fn drain(&self) -> Vec<(String, Result<ReportOutcome>)> {
        let handles = std::mem::take(
            &mut *self
                .in_flight
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        let mut outcomes = Vec::with_capacity(handles.len());
        for handle in handles {
            let name = handle.name.clone();
            outcomes.push((name, handle.outcome().await));
        }
        outcomes
    }
}

#[async_trait]
impl EventHandler for PipelineDispatcher {
    async fn handle(&self, event: Arc<Event>, project: Arc<Project>) -> anyhow::Result<()> {
        let spawned = self.dispatch(event, project);
        info!(spawned, "Pipelines dispatched");
        Ok(())
    }

    fn name(&self) -> &str {
        "pipeline-dispatcher"
    }
}
