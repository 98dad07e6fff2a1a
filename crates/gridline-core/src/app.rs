//! Wiring of the default handlers from configuration.

use std::sync::Arc;

use tracing::info;

use crate::config::GridlineConfig;
use crate::dispatcher::PipelineDispatcher;
use crate::error::Result;
use crate::job::ExecutionEngine;
use crate::router::{EventRouter, LogEventHandler};

/// A router plus the dispatcher registered on it.
pub struct Gateway {
    pub router: EventRouter,

    /// Shared with the router; kept here so the host can drain spawned
    /// pipelines.
    pub dispatcher: Arc<PipelineDispatcher>,
}

/// Build the router: log events get the logging handler, trigger events get
/// the pipeline dispatcher.
pub fn build_router(config: &GridlineConfig, engine: Arc<dyn ExecutionEngine>) -> Result<Gateway> {
    config.validate()?;

    let dispatcher = Arc::new(PipelineDispatcher::from_config(engine, config));
    let logger = Arc::new(LogEventHandler);
    let mut router = EventRouter::new();

    for name in &config.log_events {
        router.register(name.as_str(), logger.clone());
    }
    for name in &config.triggers {
        router.register(name.as_str(), dispatcher.clone());
    }

    info!(
        log_events = config.log_events.len(),
        triggers = config.triggers.len(),
        pipelines = config.pipelines.len(),
        "Router configured"
    );

    Ok(Gateway { router, dispatcher })
}
