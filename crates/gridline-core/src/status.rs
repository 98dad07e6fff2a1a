//! Check-run status reporting around a unit of work.
//!
//! The reporter opens a check run with a start job ("pending"), awaits the
//! work, then closes it with exactly one end job carrying the conclusion.
//! Both reporting jobs run on a dedicated image and are parameterized only
//! through their env map.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::config::ReporterConfig;
use crate::error::{GridlineError, Result};
use crate::job::{is_valid_job_id, ExecutionEngine, ExecutionError, Job, JobResult, MAX_JOB_ID_LEN};

pub const CHECK_PAYLOAD: &str = "CHECK_PAYLOAD";
pub const CHECK_NAME: &str = "CHECK_NAME";
pub const CHECK_TITLE: &str = "CHECK_TITLE";
pub const CHECK_SUMMARY: &str = "CHECK_SUMMARY";
pub const CHECK_TEXT: &str = "CHECK_TEXT";
pub const CHECK_CONCLUSION: &str = "CHECK_CONCLUSION";

/// Terminal state of a check run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Conclusion {
    Success,
    Failure,
    /// Non-blocking result, used by advisory checks.
    Neutral,
}

impl Conclusion {
    pub fn as_str(&self) -> &'static str {
        match self {
            Conclusion::Success => "success",
            Conclusion::Failure => "failure",
            Conclusion::Neutral => "neutral",
        }
    }
}

impl fmt::Display for Conclusion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which conclusion to post for each outcome of the work.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReportPolicy {
    pub on_success: Conclusion,
    pub on_failure: Conclusion,
}

impl ReportPolicy {
    /// Failures block the merge.
    pub fn blocking() -> Self {
        Self {
            on_success: Conclusion::Success,
            on_failure: Conclusion::Failure,
        }
    }

    /// Failures are reported as neutral.
    pub fn advisory() -> Self {
        Self {
            on_success: Conclusion::Success,
            on_failure: Conclusion::Neutral,
        }
    }
}

impl Default for ReportPolicy {
    fn default() -> Self {
        Self::blocking()
    }
}

/// Key of an external check run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct CheckSpec {
    /// Internal identifier.
    pub name: String,
    /// Display title.
    pub title: String,
}

impl CheckSpec {
    pub fn new(name: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            title: title.into(),
        }
    }
}

/// Everything the reporter needs to open and close one check run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckReport {
    pub check: CheckSpec,

    /// Raw event payload, passed through to the reporting image.
    pub payload: String,

    pub start_summary: String,
    pub success_summary: String,
    pub failure_summary: String,
    pub policy: ReportPolicy,
}

// ============================================================================
// PIPELINE STATE MACHINE
// ============================================================================

/// Lifecycle of one reported pipeline invocation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    NotStarted,
    ReportingStart,
    RunningJobs,
    ReportingEnd(Conclusion),
    Done,
}

impl PipelineState {
    /// Whether `next` directly follows this state.
    pub fn can_advance_to(&self, next: PipelineState) -> bool {
        matches!(
            (self, next),
            (PipelineState::NotStarted, PipelineState::ReportingStart)
                | (PipelineState::ReportingStart, PipelineState::RunningJobs)
                | (PipelineState::RunningJobs, PipelineState::ReportingEnd(_))
                | (PipelineState::ReportingEnd(_), PipelineState::Done)
        )
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineState::NotStarted => f.write_str("not_started"),
            PipelineState::ReportingStart => f.write_str("reporting_start"),
            PipelineState::RunningJobs => f.write_str("running_jobs"),
            PipelineState::ReportingEnd(c) => write!(f, "reporting_end({c})"),
            PipelineState::Done => f.write_str("done"),
        }
    }
}

/// Records state transitions, rejecting any that skip a state.
#[derive(Debug, Clone)]
pub struct PipelineTracker {
    history: Vec<PipelineState>,
}

impl PipelineTracker {
    pub fn new() -> Self {
        Self {
            history: vec![PipelineState::NotStarted],
        }
    }

    pub fn state(&self) -> PipelineState {
        // history is never empty
        self.history[self.history.len() - 1]
    }

    pub fn advance(&mut self, next: PipelineState) -> Result<()> {
        let current = self.state();
        if !current.can_advance_to(next) {
            return Err(GridlineError::InvalidStateTransition {
                current: current.to_string(),
                requested: next.to_string(),
            });
        }
        self.history.push(next);
        Ok(())
    }

    pub fn history(&self) -> &[PipelineState] {
        &self.history
    }
}

impl Default for PipelineTracker {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// REPORTER
// ============================================================================

/// Result of a wrapped pipeline invocation that reached `Done`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportOutcome {
    pub check: String,
    pub conclusion: Conclusion,

    /// Outcome of the wrapped work.
    pub work: std::result::Result<JobResult, ExecutionError>,

    pub states: Vec<PipelineState>,
}

/// Publishes check-run lifecycle through start/end jobs.
pub struct StatusReporter {
    engine: Arc<dyn ExecutionEngine>,
    image: String,
    force_pull: bool,
    max_text_len: usize,
}

impl StatusReporter {
    pub fn new(engine: Arc<dyn ExecutionEngine>, config: &ReporterConfig) -> Self {
        Self {
            engine,
            image: config.image.clone(),
            force_pull: config.force_pull,
            max_text_len: config.max_text_len,
        }
    }

    /// Job that marks the check run as in progress.
    pub fn start_job(&self, report: &CheckReport) -> Job {
        Job::new(reporter_job_id(&report.check.name, "start"), &self.image)
            .force_pull(self.force_pull)
            .env(CHECK_PAYLOAD, &report.payload)
            .env(CHECK_NAME, &report.check.name)
            .env(CHECK_TITLE, &report.check.title)
            .env(CHECK_SUMMARY, &report.start_summary)
    }

    /// Job that posts the terminal conclusion.
    pub fn end_job(
        &self,
        report: &CheckReport,
        conclusion: Conclusion,
        summary: &str,
        text: &str,
    ) -> Job {
        Job::new(reporter_job_id(&report.check.name, "end"), &self.image)
            .force_pull(self.force_pull)
            .env(CHECK_PAYLOAD, &report.payload)
            .env(CHECK_NAME, &report.check.name)
            .env(CHECK_TITLE, &report.check.title)
            .env(CHECK_SUMMARY, summary)
            .env(CHECK_TEXT, truncate_tail(text, self.max_text_len))
            .env(CHECK_CONCLUSION, conclusion.as_str())
    }

    /// Run the start job, the work, then exactly one end job.
    ///
    /// A failing work future is converted into the policy's failure
    /// conclusion. A failing start or end job is returned as
    /// [`GridlineError::Reporting`]; when the start job fails the work is
    /// never started.
    pub async fn wrap<F, Fut>(&self, report: &CheckReport, work: F) -> Result<ReportOutcome>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<JobResult, ExecutionError>>,
    {
        let check = report.check.name.as_str();
        let mut tracker = PipelineTracker::new();

        tracker.advance(PipelineState::ReportingStart)?;
        info!(event = "check.started", check = %check, "Reporting check start");
        self.start_job(report)
            .run(self.engine.as_ref())
            .await
            .map_err(|source| reporting_error(check, source))?;

        tracker.advance(PipelineState::RunningJobs)?;
        let outcome = work().await;

        let (conclusion, summary, text) = match &outcome {
            Ok(result) => (
                report.policy.on_success,
                report.success_summary.as_str(),
                result.to_string(),
            ),
            Err(e) => (
                report.policy.on_failure,
                report.failure_summary.as_str(),
                format!("Error: {e}"),
            ),
        };

        tracker.advance(PipelineState::ReportingEnd(conclusion))?;
        info!(
            event = "check.finishing",
            check = %check,
            conclusion = %conclusion,
            "Reporting check end"
        );
        self.end_job(report, conclusion, summary, &text)
            .run(self.engine.as_ref())
            .await
            .map_err(|source| reporting_error(check, source))?;

        tracker.advance(PipelineState::Done)?;

        Ok(ReportOutcome {
            check: check.to_string(),
            conclusion,
            work: outcome,
            states: tracker.history().to_vec(),
        })
    }
}

fn reporting_error(check: &str, source: ExecutionError) -> GridlineError {
    error!(check = %check, error = %source, "Status report failed");
    GridlineError::Reporting {
        check: check.to_string(),
        source,
    }
}

/// Derive a valid job id such as `build-start` from a check name.
fn reporter_job_id(check_name: &str, suffix: &str) -> String {
    let mut slug: String = check_name
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_lowercase() || c.is_ascii_digit() {
                c
            } else {
                '-'
            }
        })
        .collect();
    let keep = MAX_JOB_ID_LEN - suffix.len() - 1;
    slug.truncate(keep);
    let slug = slug.trim_matches('-');
    let id = if slug.is_empty() {
        format!("check-{suffix}")
    } else {
        format!("{slug}-{suffix}")
    };
    debug_assert!(is_valid_job_id(&id));
    id
}

/// Keep at most `max` bytes from the end of `text`, cut on a char boundary.
fn truncate_tail(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}
