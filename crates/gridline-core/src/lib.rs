//! Gridline Core - event-driven CI pipeline orchestration
//!
//! Provides the orchestration layer between incoming events and an external
//! job execution engine:
//! - Routes named events to registered handlers with per-handler isolation
//! - Sequences dependent jobs, short-circuiting on the first failure
//! - Wraps work in start/end check-run reporting jobs
//! - Spawns independent build/analyze pipelines per trigger event

pub mod app;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod event;
pub mod fakes;
pub mod job;
pub mod router;
pub mod runner;
pub mod status;
pub mod telemetry;

// Re-export key types
pub use app::{build_router, Gateway};
pub use config::{GridlineConfig, JobTemplate, PipelineConfig, ReporterConfig};
pub use dispatcher::{
    ConfiguredPipeline, Pipeline, PipelineContext, PipelineDispatcher, PipelineHandle,
    WorkspaceLayout,
};
pub use engine::{DryRunEngine, ProcessEngine};
pub use error::{GridlineError, Result};
pub use event::{names, Event, Project, Revision};
pub use job::{ExecutionEngine, ExecutionError, Job, JobResult};
pub use router::{
    DispatchReport, EventHandler, EventRouter, FnHandler, HandlerFailure, LogEventHandler,
};
pub use runner::JobRunner;
pub use status::{
    CheckReport, CheckSpec, Conclusion, PipelineState, PipelineTracker, ReportOutcome,
    ReportPolicy, StatusReporter,
};
pub use telemetry::init_tracing;

/// Gridline version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
