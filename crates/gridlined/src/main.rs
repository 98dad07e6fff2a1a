//! Gridline dispatcher
//!
//! The `gridlined` command decodes one delivered event, routes it to the
//! configured handlers and waits for the pipelines it started.
//!
//! ## Commands
//!
//! - `dispatch`: ingest an event and run its pipelines
//! - `print-config`: show the effective configuration

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use gridline_core::{
    build_router, Conclusion, DryRunEngine, Event, ExecutionEngine, GridlineConfig,
    HandlerFailure, ProcessEngine, Project,
};
use gridline_ingest::{
    cloudevents, ingest_cloudevents, ingest_eventgrid, verify_token, Ingested, ValidationResponse,
};
use serde::Serialize;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};

#[derive(Parser)]
#[command(name = "gridlined")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Event-driven CI pipeline dispatcher", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Decode an event, route it and wait for the pipelines it starts
    Dispatch {
        /// Event body file, or `-` for stdin
        #[arg(short, long, default_value = "-")]
        event: String,

        /// Delivery format of the body
        #[arg(short, long, value_enum, default_value_t = Format::Eventgrid)]
        format: Format,

        /// Event name (required for raw bodies)
        #[arg(long)]
        name: Option<String>,

        /// Request header as `Name: value` (CloudEvents binary mode)
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,

        /// Project id
        #[arg(long, env = "GRIDLINE_PROJECT")]
        project: String,

        /// Repository name, e.g. `acme/widgets`
        #[arg(long, env = "GRIDLINE_REPO")]
        repo: String,

        /// Clone URL recorded on the project
        #[arg(long)]
        clone_url: Option<String>,

        /// Token the project requires on deliveries
        #[arg(long, env = "GRIDLINE_PROJECT_TOKEN", hide_env_values = true)]
        project_token: Option<String>,

        /// Token presented with this delivery
        #[arg(long)]
        token: Option<String>,

        /// Execution engine for jobs
        #[arg(
            long,
            value_enum,
            default_value_t = EngineKind::DryRun,
            env = "GRIDLINE_ENGINE"
        )]
        engine: EngineKind,

        /// Working directory for the process engine
        #[arg(long)]
        work_dir: Option<PathBuf>,

        /// Per-job timeout for the process engine, in seconds
        #[arg(long)]
        timeout_secs: Option<u64>,

        #[command(flatten)]
        config: ConfigArgs,
    },

    /// Print the effective configuration as JSON
    PrintConfig {
        #[command(flatten)]
        config: ConfigArgs,
    },
}

#[derive(Args)]
struct ConfigArgs {
    /// Configuration file (JSON)
    #[arg(short, long, env = "GRIDLINE_CONFIG")]
    config: Option<PathBuf>,

    /// Root under which project checkouts live
    #[arg(long, env = "GRIDLINE_WORKSPACE_ROOT")]
    workspace_root: Option<PathBuf>,

    /// Image of the check-run reporter job
    #[arg(long, env = "GRIDLINE_REPORTER_IMAGE")]
    reporter_image: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Format {
    Eventgrid,
    Cloudevents,
    Raw,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum EngineKind {
    Process,
    DryRun,
}

/// Result of routing one event, printed on stdout.
#[derive(Debug, Serialize)]
struct DispatchSummary {
    event: String,
    digest: String,
    handlers_invoked: usize,
    handler_failures: Vec<HandlerFailure>,
    pipelines: Vec<PipelineSummary>,
}

#[derive(Debug, Serialize)]
struct PipelineSummary {
    name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    conclusion: Option<Conclusion>,

    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// One delivered body with its transport metadata.
struct Delivery<'a> {
    format: Format,
    name: Option<&'a str>,
    headers: &'a [String],
    body: Vec<u8>,

    /// Token the project requires, if any.
    project_token: Option<&'a str>,

    /// Token presented with the delivery.
    token: Option<&'a str>,
}

#[derive(Debug)]
enum DeliveryOutcome {
    Validation(ValidationResponse),
    Dispatched(DispatchSummary),
}

impl DispatchSummary {
    fn failures(&self) -> usize {
        self.handler_failures.len() + self.pipelines.iter().filter(|p| p.error.is_some()).count()
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    gridline_core::init_tracing(cli.json, level);

    match cli.command {
        Commands::Dispatch {
            event,
            format,
            name,
            headers,
            project,
            repo,
            clone_url,
            project_token,
            token,
            engine,
            work_dir,
            timeout_secs,
            config,
        } => {
            let config = load_config(&config)?;
            let body = read_body(&event)?;

            let mut project = Project::new(project, repo);
            project.clone_url = clone_url;

            let delivery = Delivery {
                format,
                name: name.as_deref(),
                headers: &headers,
                body,
                project_token: project_token.as_deref(),
                token: token.as_deref(),
            };
            let engine = build_engine(engine, work_dir, timeout_secs);

            match cmd_deliver(&config, engine, delivery, project).await? {
                DeliveryOutcome::Validation(response) => {
                    println!("{}", serde_json::to_string(&response)?);
                    Ok(())
                }
                DeliveryOutcome::Dispatched(summary) => {
                    println!("{}", serde_json::to_string_pretty(&summary)?);
                    let failures = summary.failures();
                    if failures > 0 {
                        bail!(
                            "dispatch of `{}` finished with {failures} failure(s)",
                            summary.event
                        );
                    }
                    Ok(())
                }
            }
        }
        Commands::PrintConfig { config } => {
            let config = load_config(&config)?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

/// Decode one delivery and either answer the handshake or route the event.
///
/// The validation handshake is answered before the token check: Event Grid
/// cannot present a project token while validating a subscription.
async fn cmd_deliver(
    config: &GridlineConfig,
    engine: Arc<dyn ExecutionEngine>,
    delivery: Delivery<'_>,
    project: Project,
) -> Result<DeliveryOutcome> {
    let event = match ingest(delivery.format, delivery.name, delivery.headers, delivery.body)? {
        Ingested::Validation(response) => {
            info!(
                event = "validation.answered",
                project = %project.id,
                "Answering subscription validation"
            );
            return Ok(DeliveryOutcome::Validation(response));
        }
        Ingested::Event(event) => event,
    };

    verify_token(delivery.project_token, delivery.token)?;

    let summary = cmd_dispatch(config, engine, event, project).await?;
    Ok(DeliveryOutcome::Dispatched(summary))
}

/// Route the event and wait for every pipeline it started.
async fn cmd_dispatch(
    config: &GridlineConfig,
    engine: Arc<dyn ExecutionEngine>,
    event: Event,
    project: Project,
) -> Result<DispatchSummary> {
    let gateway = build_router(config, engine).context("Invalid configuration")?;
    let digest = event.short_digest();

    let report = gateway.router.dispatch(event, project).await;
    if report.invoked == 0 {
        warn!(event_name = %report.event, "No handler registered for event");
    }

    let pipelines = gateway
        .dispatcher
        .drain()
        .await
        .into_iter()
        .map(|(name, outcome)| match outcome {
            Ok(outcome) => PipelineSummary {
                name,
                conclusion: Some(outcome.conclusion),
                error: None,
            },
            Err(e) => PipelineSummary {
                name,
                conclusion: None,
                error: Some(e.to_string()),
            },
        })
        .collect();

    Ok(DispatchSummary {
        event: report.event,
        digest,
        handlers_invoked: report.invoked,
        handler_failures: report.failures,
        pipelines,
    })
}

/// Load the configuration file, if any, and apply command-line overrides.
fn load_config(args: &ConfigArgs) -> Result<GridlineConfig> {
    let mut config = match &args.config {
        Some(path) => GridlineConfig::from_json_file(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => GridlineConfig::default(),
    };
    if let Some(root) = &args.workspace_root {
        config.workspace_root = root.clone();
    }
    if let Some(image) = &args.reporter_image {
        config.reporter.image = image.clone();
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn read_body(source: &str) -> Result<Vec<u8>> {
    if source == "-" {
        let mut body = Vec::new();
        std::io::stdin()
            .read_to_end(&mut body)
            .context("Failed to read event from stdin")?;
        Ok(body)
    } else {
        std::fs::read(source).with_context(|| format!("Failed to read event file: {source}"))
    }
}

fn ingest(
    format: Format,
    name: Option<&str>,
    headers: &[String],
    body: Vec<u8>,
) -> Result<Ingested> {
    match format {
        Format::Eventgrid => Ok(ingest_eventgrid(&body)?),
        Format::Cloudevents => {
            let mut pairs = headers
                .iter()
                .map(|h| parse_header(h))
                .collect::<Result<Vec<_>>>()?;
            // a bare envelope file is structured mode
            if !pairs.iter().any(|(n, _)| n.eq_ignore_ascii_case("content-type")) {
                pairs.push(("content-type", cloudevents::CONTENT_TYPE));
            }
            Ok(ingest_cloudevents(pairs.iter().copied(), &body)?)
        }
        Format::Raw => {
            let Some(name) = name else {
                bail!("--name is required for raw events");
            };
            Ok(Ingested::Event(Event::new(name, body)))
        }
    }
}

fn parse_header(header: &str) -> Result<(&str, &str)> {
    let (name, value) = header
        .split_once(':')
        .with_context(|| format!("Header must look like `Name: value`: {header}"))?;
    Ok((name.trim(), value.trim()))
}

fn build_engine(
    kind: EngineKind,
    work_dir: Option<PathBuf>,
    timeout_secs: Option<u64>,
) -> Arc<dyn ExecutionEngine> {
    match kind {
        EngineKind::DryRun => Arc::new(DryRunEngine),
        EngineKind::Process => {
            let mut engine = ProcessEngine::new();
            if let Some(dir) = work_dir {
                engine = engine.with_work_dir(dir);
            }
            if let Some(secs) = timeout_secs {
                engine = engine.with_timeout(Duration::from_secs(secs));
            }
            Arc::new(engine)
        }
    }
}
