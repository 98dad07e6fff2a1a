//! Event routing with per-handler failure isolation.
//!
//! An [`EventRouter`] owns the mapping from event name to handlers. It is an
//! ordinary value, built and injected by the host, so unrelated handlers (a
//! storage-event logger and a CI trigger) can share a process without
//! affecting one another.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use futures::FutureExt;
use serde::Serialize;
use tracing::{debug, error, info, instrument};

use crate::event::{Event, Project};

/// Callback invoked for a routed event.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle the event. Errors are logged by the router and never reach
    /// other handlers.
    async fn handle(&self, event: Arc<Event>, project: Arc<Project>) -> anyhow::Result<()>;

    /// Handler name, for logs and dispatch reports.
    fn name(&self) -> &str {
        "anonymous"
    }
}

/// Adapts an async closure into an [`EventHandler`].
pub struct FnHandler<F> {
    name: String,
    f: F,
}

impl<F> FnHandler<F> {
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Arc<Event>, Arc<Project>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, event: Arc<Event>, project: Arc<Project>) -> anyhow::Result<()> {
        (self.f)(event, project).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Logs every event it receives.
pub struct LogEventHandler;

#[async_trait]
impl EventHandler for LogEventHandler {
    async fn handle(&self, event: Arc<Event>, project: Arc<Project>) -> anyhow::Result<()> {
        info!(
            event_name = %event.name,
            project = %project.id,
            provider = event.provider.as_deref().unwrap_or("unknown"),
            digest = %event.short_digest(),
            payload = %event.payload_str(),
            "Received event"
        );
        Ok(())
    }

    fn name(&self) -> &str {
        "log-event"
    }
}

/// A handler that returned an error or panicked.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct HandlerFailure {
    pub handler: String,
    pub message: String,
    pub panicked: bool,
}

/// What happened during one dispatch.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DispatchReport {
    pub event: String,

    /// Number of handlers invoked.
    pub invoked: usize,

    pub failures: Vec<HandlerFailure>,
}

impl DispatchReport {
    /// No handler failed.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Maps event names to handlers.
#[derive(Default)]
pub struct EventRouter {
    handlers: HashMap<String, Vec<Arc<dyn EventHandler>>>,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handler for `event_name`. Several handlers may share a name;
    /// all of them run on dispatch.
    pub fn register(
        &mut self,
        event_name: impl Into<String>,
        handler: Arc<dyn EventHandler>,
    ) -> &mut Self {
        let event_name = event_name.into();
        debug!(event_name = %event_name, handler = handler.name(), "Registering handler");
        self.handlers.entry(event_name).or_default().push(handler);
        self
    }

    /// Register an async closure.
    pub fn on<F, Fut>(
        &mut self,
        event_name: impl Into<String>,
        handler_name: impl Into<String>,
        f: F,
    ) -> &mut Self
    where
        F: Fn(Arc<Event>, Arc<Project>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.register(event_name, Arc::new(FnHandler::new(handler_name, f)))
    }

    pub fn handler_count(&self, event_name: &str) -> usize {
        self.handlers.get(event_name).map_or(0, Vec::len)
    }

    /// Registered event names, sorted.
    pub fn event_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub async fn dispatch(&self, event: Event, project: Project) -> DispatchReport {
        self.dispatch_shared(Arc::new(event), Arc::new(project)).await
    }

    /// Invoke every handler registered for `event.name`.
    ///
    /// Handlers run interleaved with no ordering between them. An unknown
    /// event name is a no-op.
    #[instrument(skip_all, fields(event_name = %event.name, digest = %event.short_digest()))]
    pub async fn dispatch_shared(
        &self,
        event: Arc<Event>,
        project: Arc<Project>,
    ) -> DispatchReport {
        let Some(handlers) = self.handlers.get(&event.name) else {
            debug!("No handlers registered");
            return DispatchReport {
                event: event.name.clone(),
                invoked: 0,
                failures: Vec::new(),
            };
        };

        let runs = handlers.iter().map(|handler| {
            let handler = Arc::clone(handler);
            let event = Arc::clone(&event);
            let project = Arc::clone(&project);
            async move {
                let outcome = AssertUnwindSafe(handler.handle(event, project))
                    .catch_unwind()
                    .await;
                let failure = match outcome {
                    Ok(Ok(())) => None,
                    Ok(Err(e)) => Some(HandlerFailure {
                        handler: handler.name().to_string(),
                        message: format!("{e:#}"),
                        panicked: false,
                    }),
                    Err(panic) => Some(HandlerFailure {
                        handler: handler.name().to_string(),
                        message: panic_message(panic.as_ref()),
                        panicked: true,
                    }),
                };
                if let Some(f) = &failure {
                    error!(
                        handler = %f.handler,
                        panicked = f.panicked,
                        error = %f.message,
                        "Handler failed"
                    );
                }
                failure
            }
        });

        let failures: Vec<HandlerFailure> = join_all(runs).await.into_iter().flatten().collect();

        info!(invoked = handlers.len(), failed = failures.len(), "Event dispatched");

        DispatchReport {
            event: event.name.clone(),
            invoked: handlers.len(),
            failures,
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::names;
    use std::sync::Mutex;

    fn project() -> Project {
        Project::new("proj-1", "acme/service")
    }

    #[tokio::test]
    async fn test_unknown_event_is_noop() {
        let router = EventRouter::new();
        let report = router
            .dispatch(Event::new("nobody.listens", Vec::new()), project())
            .await;
        assert_eq!(report.invoked, 0);
        assert!(report.is_clean());
    }

    #[tokio::test]
    async fn test_all_handlers_invoked_once_with_same_args() {
        let seen: Arc<Mutex<Vec<(String, String, String)>>> = Arc::default();
        let mut router = EventRouter::new();
        for name in ["first", "second", "third"] {
            let seen = Arc::clone(&seen);
            router.on(names::BLOB_DELETED, name, move |event, project| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.lock().unwrap().push((
                        name.to_string(),
                        event.payload_str().into_owned(),
                        project.repo_name.clone(),
                    ));
                    Ok(())
                }
            });
        }

        let report = router
            .dispatch(Event::new(names::BLOB_DELETED, b"blob".to_vec()), project())
            .await;

        assert_eq!(report.invoked, 3);
        assert!(report.is_clean());
        let mut seen = seen.lock().unwrap().clone();
        seen.sort();
        let handlers: Vec<&str> = seen.iter().map(|(name, _, _)| name.as_str()).collect();
        assert_eq!(handlers, ["first", "second", "third"]);
        assert!(seen
            .iter()
            .all(|(_, payload, repo)| payload == "blob" && repo == "acme/service"));
    }

    #[tokio::test]
    async fn test_failing_handler_is_isolated() {
        let ran: Arc<Mutex<u32>> = Arc::default();
        let mut router = EventRouter::new();
        router.on(names::BLOB_CREATED, "broken", |_, _| async {
            anyhow::bail!("storage account unreachable")
        });
        let counter = Arc::clone(&ran);
        router.on(names::BLOB_CREATED, "healthy", move |_, _| {
            let counter = Arc::clone(&counter);
            async move {
                *counter.lock().unwrap() += 1;
                Ok(())
            }
        });

        let report = router
            .dispatch(Event::new(names::BLOB_CREATED, Vec::new()), project())
            .await;

        assert_eq!(*ran.lock().unwrap(), 1);
        assert_eq!(report.invoked, 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].handler, "broken");
        assert!(report.failures[0].message.contains("unreachable"));
        assert!(!report.failures[0].panicked);
    }

    #[tokio::test]
    async fn test_panicking_handler_is_isolated() {
        let ran: Arc<Mutex<u32>> = Arc::default();
        let mut router = EventRouter::new();
        router.on(names::BLOB_CREATED, "panics", |_, _| async {
            let missing: Option<()> = None;
            missing.expect("handler bug");
            Ok(())
        });
        let counter = Arc::clone(&ran);
        router.on(names::BLOB_CREATED, "healthy", move |_, _| {
            let counter = Arc::clone(&counter);
            async move {
                *counter.lock().unwrap() += 1;
                Ok(())
            }
        });

        let report = router
            .dispatch(Event::new(names::BLOB_CREATED, Vec::new()), project())
            .await;

        assert_eq!(*ran.lock().unwrap(), 1);
        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].panicked);
        assert!(report.failures[0].message.contains("handler bug"));
    }

    #[tokio::test]
    async fn test_handlers_for_other_events_not_invoked() {
        let ran: Arc<Mutex<u32>> = Arc::default();
        let counter = Arc::clone(&ran);
        let mut router = EventRouter::new();
        router.on(names::BLOB_DELETED, "deleted", move |_, _| {
            let counter = Arc::clone(&counter);
            async move {
                *counter.lock().unwrap() += 1;
                Ok(())
            }
        });

        router
            .dispatch(Event::new(names::BLOB_CREATED, Vec::new()), project())
            .await;
        assert_eq!(*ran.lock().unwrap(), 0);
    }

    #[test]
    fn test_registration_bookkeeping() {
        let mut router = EventRouter::new();
        router
            .register(names::BLOB_CREATED, Arc::new(LogEventHandler))
            .register(names::BLOB_DELETED, Arc::new(LogEventHandler))
            .register(names::BLOB_CREATED, Arc::new(LogEventHandler));

        assert_eq!(router.handler_count(names::BLOB_CREATED), 2);
        assert_eq!(router.handler_count(names::EXEC), 0);
        assert_eq!(
            router.event_names(),
            vec![names::BLOB_CREATED, names::BLOB_DELETED]
        );
    }

    #[tokio::test]
    async fn test_log_handler_succeeds() {
        let result = LogEventHandler
            .handle(
                Arc::new(Event::new(names::SUBSCRIPTION_VALIDATION, b"{}".to_vec())),
                Arc::new(project()),
            )
            .await;
        assert!(result.is_ok());
    }
}
