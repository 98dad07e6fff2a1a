//! Local execution engines.
//!
//! Container scheduling is an external service; these engines stand in for
//! it on a developer machine or in a dry run.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::job::{ExecutionEngine, ExecutionError, Job, JobResult};

/// Bytes of stderr kept in an execution error.
const STDERR_TAIL: usize = 2048;

/// Runs a job's tasks as one `sh -c` script on the local host.
///
/// The job image is logged but not used. Tasks run under `set -e`, so the
/// first failing task ends the job.
#[derive(Debug, Clone, Default)]
pub struct ProcessEngine {
    /// Working directory for every job.
    pub work_dir: Option<PathBuf>,

    pub timeout: Option<Duration>,
}

impl ProcessEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(dir.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn script(job: &Job) -> String {
        let mut script = String::from("set -e\n");
        for task in &job.tasks {
            script.push_str(task);
            script.push('\n');
        }
        script
    }
}

#[async_trait]
impl ExecutionEngine for ProcessEngine {
    async fn submit(&self, job: &Job) -> Result<JobResult, ExecutionError> {
        let start = Instant::now();
        debug!(job = %job.id, image = %job.image, "Running job as local process");

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(Self::script(job))
            .envs(&job.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.work_dir {
            cmd.current_dir(dir);
        }

        let child = cmd
            .spawn()
            .map_err(|e| ExecutionError::new(format!("job `{}` failed to start: {e}", job.id)))?;

        let output = match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, child.wait_with_output())
                .await
                .map_err(|_| {
                    ExecutionError::new(format!(
                        "job `{}` timed out after {} seconds",
                        job.id,
                        timeout.as_secs()
                    ))
                })?,
            None => child.wait_with_output().await,
        }
        .map_err(|e| ExecutionError::new(format!("job `{}` failed: {e}", job.id)))?;

        let duration_ms = start.elapsed().as_millis() as u64;
        let exit_code = output.status.code().unwrap_or(-1);
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();

        info!(job = %job.id, exit_code, duration_ms, "Local job completed");

        if output.status.success() {
            Ok(JobResult::new(stdout))
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stderr = stderr.trim();
            let mut tail_start = stderr.len().saturating_sub(STDERR_TAIL);
            while !stderr.is_char_boundary(tail_start) {
                tail_start += 1;
            }
            Err(ExecutionError::new(format!(
                "job `{}` exited with code {exit_code}: {}",
                job.id,
                &stderr[tail_start..]
            )))
        }
    }

    fn name(&self) -> &str {
        "process"
    }
}

/// Logs submissions and reports success without running anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct DryRunEngine;

#[async_trait]
impl ExecutionEngine for DryRunEngine {
    async fn submit(&self, job: &Job) -> Result<JobResult, ExecutionError> {
        info!(
            job = %job.id,
            image = %job.image,
            force_pull = job.force_pull,
            tasks = ?job.tasks,
            env = ?job.env,
            "Dry run: job not executed"
        );
        Ok(JobResult::default())
    }

    fn name(&self) -> &str {
        "dry-run"
    }
}
