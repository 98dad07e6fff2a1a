//! Gateway configuration: reporter image, trigger events and pipeline
//! definitions.
//!
//! Every field has a default, so an empty JSON object is a valid config.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{GridlineError, Result};
use crate::event::names;
use crate::job::is_valid_job_id;

/// Image that publishes check runs.
pub const DEFAULT_REPORTER_IMAGE: &str = "brigadecore/brigade-github-check-run:latest";

/// Maximum check-run text accepted by the checks API.
pub const DEFAULT_MAX_TEXT_LEN: usize = 65_535;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReporterConfig {
    pub image: String,
    pub force_pull: bool,

    /// Longer `CHECK_TEXT` values keep only their tail.
    pub max_text_len: usize,
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self {
            image: DEFAULT_REPORTER_IMAGE.to_string(),
            force_pull: false,
            max_text_len: DEFAULT_MAX_TEXT_LEN,
        }
    }
}

/// A job inside a configured pipeline.
///
/// `{workspace}` and `{repo}` in tasks and env values are replaced per
/// invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobTemplate {
    pub id: String,
    pub image: String,

    #[serde(default)]
    pub tasks: Vec<String>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,

    #[serde(default)]
    pub force_pull: bool,
}

/// One independently reported pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Check-run name; must be unique across pipelines.
    pub name: String,
    pub title: String,

    /// Report failures as neutral instead of failure.
    #[serde(default)]
    pub advisory: bool,

    pub start_summary: String,
    pub success_summary: String,
    pub failure_summary: String,

    pub jobs: Vec<JobTemplate>,
}

impl PipelineConfig {
    /// Go build and test; failures block.
    pub fn go_build() -> Self {
        Self {
            name: "build".to_string(),
            title: "Build and Test".to_string(),
            advisory: false,
            start_summary: "Building and testing".to_string(),
            success_summary: "Build and tests passed".to_string(),
            failure_summary: "Build or tests failed".to_string(),
            jobs: vec![JobTemplate {
                id: "go-build-test".to_string(),
                image: "golang:1.11".to_string(),
                tasks: vec![
                    "cd {workspace}".to_string(),
                    "go build ./...".to_string(),
                    "go test ./...".to_string(),
                ],
                env: BTreeMap::from([("GOPATH".to_string(), "/go".to_string())]),
                force_pull: false,
            }],
        }
    }

    /// Go linting; failures are advisory.
    pub fn go_analyze() -> Self {
        Self {
            name: "analyze".to_string(),
            title: "Static Analysis".to_string(),
            advisory: true,
            start_summary: "Running linters".to_string(),
            success_summary: "No lint findings".to_string(),
            failure_summary: "Lint findings reported".to_string(),
            jobs: vec![JobTemplate {
                id: "go-lint".to_string(),
                image: "golangci/golangci-lint:latest".to_string(),
                tasks: vec![
                    "cd {workspace}".to_string(),
                    "golangci-lint run ./...".to_string(),
                ],
                env: BTreeMap::from([("GOPATH".to_string(), "/go".to_string())]),
                force_pull: false,
            }],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GridlineConfig {
    pub reporter: ReporterConfig,

    /// Source checkouts live under `<workspace_root>/<repo name>`.
    pub workspace_root: PathBuf,

    /// Event names that start the pipelines.
    pub triggers: Vec<String>,

    /// Event names that are only logged.
    pub log_events: Vec<String>,

    pub pipelines: Vec<PipelineConfig>,
}

impl Default for GridlineConfig {
    fn default() -> Self {
        Self {
            reporter: ReporterConfig::default(),
            workspace_root: PathBuf::from("/src"),
            triggers: vec![
                names::EXEC.to_string(),
                names::CHECK_SUITE_REQUESTED.to_string(),
                names::CHECK_SUITE_REREQUESTED.to_string(),
                names::CHECK_RUN_REREQUESTED.to_string(),
            ],
            log_events: vec![
                names::BLOB_CREATED.to_string(),
                names::BLOB_DELETED.to_string(),
                names::SUBSCRIPTION_VALIDATION.to_string(),
            ],
            pipelines: vec![PipelineConfig::go_build(), PipelineConfig::go_analyze()],
        }
    }
}

impl GridlineConfig {
    /// Load and validate a JSON config file.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: GridlineConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.reporter.image.trim().is_empty() {
            return Err(GridlineError::Config("reporter image must not be empty".into()));
        }
        if self.reporter.max_text_len == 0 {
            return Err(GridlineError::Config("reporter max_text_len must be positive".into()));
        }

        // One pipeline per check-run name: only one writer per check run.
        let mut seen = HashSet::new();
        for pipeline in &self.pipelines {
            if !seen.insert(pipeline.name.as_str()) {
                return Err(GridlineError::Config(format!(
                    "duplicate pipeline name `{}`",
                    pipeline.name
                )));
            }
            if pipeline.jobs.is_empty() {
                return Err(GridlineError::Config(format!(
                    "pipeline `{}` has no jobs",
                    pipeline.name
                )));
            }
            for job in &pipeline.jobs {
                if !is_valid_job_id(&job.id) {
                    return Err(GridlineError::Config(format!(
                        "pipeline `{}`: invalid job id `{}`",
                        pipeline.name, job.id
                    )));
                }
            }
        }
        Ok(())
    }
}
