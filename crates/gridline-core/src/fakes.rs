//! In-memory fakes for the execution boundary (testing only)
//!
//! `ScriptedEngine` records every submitted job and answers with a scripted
//! outcome per job id, so pipelines can be exercised without a scheduler.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::job::{ExecutionEngine, ExecutionError, Job, JobResult};

// ---------------------------------------------------------------------------
// ScriptedEngine
// ---------------------------------------------------------------------------

/// Engine that returns pre-programmed outcomes.
///
/// Jobs with no scripted outcome succeed with empty output.
#[derive(Debug, Default)]
pub struct ScriptedEngine {
    outcomes: Mutex<HashMap<String, Result<JobResult, ExecutionError>>>,
    submitted: Mutex<Vec<Job>>,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script job `id` to succeed with `output`.
    pub fn succeed(self, id: &str, output: &str) -> Self {
        self.outcomes
            .lock()
            .unwrap()
            .insert(id.to_string(), Ok(JobResult::new(output)));
        self
    }

    /// Script job `id` to fail with `message`.
    pub fn fail(self, id: &str, message: &str) -> Self {
        self.outcomes
            .lock()
            .unwrap()
            .insert(id.to_string(), Err(ExecutionError::new(message)));
        self
    }

    /// Every job submitted so far, in submission order.
    pub fn submitted(&self) -> Vec<Job> {
        self.submitted.lock().unwrap().clone()
    }

    pub fn submitted_ids(&self) -> Vec<String> {
        self.submitted
            .lock()
            .unwrap()
            .iter()
            .map(|j| j.id.clone())
            .collect()
    }

    /// Most recent submission with the given id.
    pub fn last_job(&self, id: &str) -> Option<Job> {
        self.submitted
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|j| j.id == id)
            .cloned()
    }
}

#[async_trait]
impl ExecutionEngine for ScriptedEngine {
    async fn submit(&self, job: &Job) -> Result<JobResult, ExecutionError> {
        self.submitted.lock().unwrap().push(job.clone());
        // Yield so concurrently spawned pipelines interleave like they
        // would against a real engine.
        tokio::task::yield_now().await;
        self.outcomes
            .lock()
            .unwrap()
            .get(&job.id)
            .cloned()
            .unwrap_or_else(|| Ok(JobResult::default()))
    }

    fn name(&self) -> &str {
        "scripted"
    }
}
