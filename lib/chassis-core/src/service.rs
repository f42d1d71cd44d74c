//! Long-running services supervised by the runtime.

use std::{future::Future, sync::Mutex};

use async_trait::async_trait;
use chassis_error::{generic_error, GenericError};
use futures::future::BoxFuture;

use crate::shutdown::ShutdownSignal;

/// Context handed to a service for the duration of its run.
#[derive(Clone)]
pub struct ServiceContext {
    shutdown: ShutdownSignal,
}

impl ServiceContext {
    /// Creates a new `ServiceContext`.
    ///
    /// Normally created by the runtime when it starts a service. Constructing one directly is
    /// only useful for driving a service by hand, such as in tests.
    pub fn new(shutdown: ShutdownSignal) -> Self {
        Self { shutdown }
    }

    /// Returns a signal that resolves once the runtime has begun shutting down.
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }
}

/// A long-running unit of work owned by the runtime.
///
/// Services are started concurrently, in no particular order, and stopped during shutdown in
/// registration order. A service's run loop is expected to watch the shutdown signal in its
/// [`ServiceContext`] and return promptly once it fires.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    /// Returns the name of this service.
    fn name(&self) -> &str;

    /// Runs the service until it fails or shutdown is triggered.
    ///
    /// Called exactly once, and blocks for the lifetime of the service.
    ///
    /// # Errors
    ///
    /// Returning an error before shutdown has been triggered is treated as fatal: the runtime
    /// shuts every other service down and surfaces the error. Errors returned after shutdown has
    /// been triggered are logged and otherwise ignored.
    async fn start(&self, context: ServiceContext) -> Result<(), GenericError>;

    /// Gracefully stops the service.
    ///
    /// Called at most once, during the runtime's shutdown phase, at this service's position in
    /// the overall teardown order.
    ///
    /// # Errors
    ///
    /// If the service could not be stopped cleanly, an error is returned. The error is logged by
    /// the runtime and teardown continues.
    async fn close(&self) -> Result<(), GenericError>;
}

type WorkerTask = Box<dyn FnOnce(ShutdownSignal) -> BoxFuture<'static, Result<(), GenericError>> + Send>;

/// A named background worker driven by an async closure.
///
/// The closure receives the runtime's shutdown signal and is expected to return once it fires.
/// Workers have no teardown of their own; stopping is entirely signal-driven.
pub struct WorkerService {
    name: String,
    task: Mutex<Option<WorkerTask>>,
}

impl WorkerService {
    /// Creates a new `WorkerService` from the given closure.
    pub fn new<N, F, Fut>(name: N, task: F) -> Self
    where
        N: Into<String>,
        F: FnOnce(ShutdownSignal) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), GenericError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            task: Mutex::new(Some(Box::new(move |shutdown| Box::pin(task(shutdown))))),
        }
    }
}

#[async_trait]
impl Service for WorkerService {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self, context: ServiceContext) -> Result<(), GenericError> {
        let task = self.task.lock().unwrap().take();
        match task {
            Some(task) => task(context.shutdown_signal()).await,
            None => Err(generic_error!("Worker '{}' was already started.", self.name)),
        }
    }

    async fn close(&self) -> Result<(), GenericError> {
        Ok(())
    }
}
