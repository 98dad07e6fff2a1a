//! Sequential job execution.

use std::sync::Arc;
use std::time::Instant;

use tracing::{info, warn};

use crate::job::{ExecutionEngine, ExecutionError, Job, JobResult};

/// Builds the next job from the previous step's result (`None` for the
/// first step).
pub type Step = Box<dyn FnOnce(Option<&JobResult>) -> Job + Send>;

/// Runs an ordered list of job-producing steps one at a time.
///
/// Step i+1 is only constructed and submitted after step i succeeded. The
/// runner never parallelizes; pipelines that want concurrency launch
/// independent runners.
pub struct JobRunner {
    engine: Arc<dyn ExecutionEngine>,
    steps: Vec<Step>,
}

impl JobRunner {
    pub fn new(engine: Arc<dyn ExecutionEngine>) -> Self {
        Self {
            engine,
            steps: Vec::new(),
        }
    }

    /// Append a fixed job.
    pub fn job(self, job: Job) -> Self {
        self.then(move |_| job)
    }

    /// Append a step that depends on the prior step's result.
    pub fn then<F>(mut self, step: F) -> Self
    where
        F: FnOnce(Option<&JobResult>) -> Job + Send + 'static,
    {
        self.steps.push(Box::new(step));
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Execute the steps in order, halting on the first failure.
    ///
    /// Returns the last job's result, or an empty result when there are no
    /// steps.
    pub async fn run_sequential(self) -> Result<JobResult, ExecutionError> {
        let total = self.steps.len();
        let mut previous: Option<JobResult> = None;

        for (index, step) in self.steps.into_iter().enumerate() {
            let job = step(previous.as_ref());
            let job_id = job.id.clone();
            let start = Instant::now();

            info!(job = %job_id, step = index + 1, total, "Executing job");

            match job.run(self.engine.as_ref()).await {
                Ok(result) => {
                    info!(
                        job = %job_id,
                        duration_ms = start.elapsed().as_millis() as u64,
                        "Job completed"
                    );
                    previous = Some(result);
                }
                Err(e) => {
                    warn!(
                        job = %job_id,
                        skipped = total - index - 1,
                        "Job failed, skipping remaining steps"
                    );
                    return Err(e);
                }
            }
        }

        Ok(previous.unwrap_or_default())
    }
}
