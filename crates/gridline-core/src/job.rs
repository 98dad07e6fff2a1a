//! Jobs: units of containerized work submitted to an execution engine.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use tracing::{debug, warn};

/// Longest job id accepted by engines (DNS label length).
pub const MAX_JOB_ID_LEN: usize = 63;

/// Failure reported by the execution engine for a submitted job.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("{message}")]
pub struct ExecutionError {
    pub message: String,
}

impl ExecutionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Successful outcome of a job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    /// Captured output of the job's tasks.
    pub output: String,
}

impl JobResult {
    pub fn new(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
        }
    }
}

impl fmt::Display for JobResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.output)
    }
}

/// Description of one unit of containerized work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub image: String,

    /// Shell tasks, run in order inside the container.
    pub tasks: Vec<String>,

    pub env: BTreeMap<String, String>,

    /// Pull the image even if present on the node.
    pub force_pull: bool,
}

impl Job {
    pub fn new(id: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            image: image.into(),
            tasks: Vec::new(),
            env: BTreeMap::new(),
            force_pull: false,
        }
    }

    pub fn task(mut self, task: impl Into<String>) -> Self {
        self.tasks.push(task.into());
        self
    }

    pub fn tasks<I, S>(mut self, tasks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tasks.extend(tasks.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn force_pull(mut self, force_pull: bool) -> Self {
        self.force_pull = force_pull;
        self
    }

    /// Check the fields an engine requires before accepting the job.
    pub fn validate(&self) -> Result<(), ExecutionError> {
        if !is_valid_job_id(&self.id) {
            return Err(ExecutionError::new(format!(
                "invalid job id `{}`: expected 1-{} lowercase alphanumerics or '-'",
                self.id, MAX_JOB_ID_LEN
            )));
        }
        if self.image.trim().is_empty() {
            return Err(ExecutionError::new(format!("job `{}` has no image", self.id)));
        }
        Ok(())
    }

    /// Submit the job and wait for the engine to report completion.
    ///
    /// Consumes the job: it cannot be changed once submitted. No timeout is
    /// applied here; that is the engine's concern.
    pub async fn run(self, engine: &dyn ExecutionEngine) -> Result<JobResult, ExecutionError> {
        self.validate()?;
        debug!(job = %self.id, image = %self.image, engine = engine.name(), "Submitting job");

        let result = engine.submit(&self).await;
        if let Err(e) = &result {
            warn!(job = %self.id, error = %e, "Job failed");
        }
        result
    }
}

/// Whether `id` is a lowercase DNS label.
pub fn is_valid_job_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_JOB_ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
        && !id.starts_with('-')
        && !id.ends_with('-')
}

/// External service that actually runs jobs.
///
/// Implementations (container scheduler, local process, test fakes) must
/// conform to this.
#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    /// Run the job to completion.
    async fn submit(&self, job: &Job) -> Result<JobResult, ExecutionError>;

    /// Engine name, for logs.
    fn name(&self) -> &str;
}
