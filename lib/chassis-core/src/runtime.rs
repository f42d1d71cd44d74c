//! Concurrent service startup, supervision, and bounded graceful shutdown.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use chassis_error::{generic_error, GenericError};
use chassis_health::HealthRegistry;
use tokio::{
    pin, select,
    task::{Id, JoinError, JoinSet},
    time::{interval, sleep, Instant},
};
use tracing::{debug, error, info, info_span, warn, Instrument as _};

use crate::{
    closer::Closer,
    service::{Service, ServiceContext},
    shutdown::ShutdownCoordinator,
};

const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);
const SHUTDOWN_PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

/// Builder for [`Runtime`].
pub struct RuntimeBuilder {
    name: String,
    shutdown_timeout: Duration,
    health: Option<HealthRegistry>,
    signals_enabled: bool,
}

impl RuntimeBuilder {
    fn new(name: String) -> Self {
        Self {
            name,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            health: None,
            signals_enabled: true,
        }
    }

    /// Sets the upper bound on the shutdown phase.
    ///
    /// Once shutdown begins, closers that have not finished within this window are abandoned.
    ///
    /// Defaults to 30 seconds.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Uses the given health registry instead of creating a fresh one.
    pub fn with_health_registry(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    /// Disables handling of OS interrupt signals.
    ///
    /// Without signals, the runtime only stops when a service fails or when
    /// [`RuntimeShutdownHandle::shutdown`] is called. Intended for tests and for embedding the
    /// runtime in a larger program that owns signal handling itself.
    pub fn without_signals(mut self) -> Self {
        self.signals_enabled = false;
        self
    }

    /// Builds the runtime.
    pub fn build(self) -> Runtime {
        Runtime {
            name: self.name,
            services: Vec::new(),
            closers: Vec::new(),
            health: self.health.unwrap_or_default(),
            coordinator: ShutdownCoordinator::default(),
            shutdown_timeout: self.shutdown_timeout,
            signals_enabled: self.signals_enabled,
        }
    }
}

/// Triggers a runtime shutdown from outside the runtime.
///
/// The programmatic equivalent of an interrupt signal. Cheap to clone.
#[derive(Clone)]
pub struct RuntimeShutdownHandle {
    coordinator: ShutdownCoordinator,
}

impl RuntimeShutdownHandle {
    /// Triggers shutdown. Idempotent.
    pub fn shutdown(&self) {
        self.coordinator.shutdown();
    }
}

/// Starts, supervises, and gracefully tears down a set of services.
///
/// Services are started concurrently and supervised until one of them fails, an interrupt
/// arrives, or shutdown is triggered programmatically. A service failing before shutdown is
/// fatal: every other service observes the shutdown signal, teardown runs, and the error is
/// surfaced from [`run`][Self::run]. During teardown, registered closers run strictly
/// sequentially in registration order under a single deadline, and individual failures never
/// stop the remainder.
pub struct Runtime {
    name: String,
    services: Vec<Arc<dyn Service>>,
    closers: Vec<Closer>,
    health: HealthRegistry,
    coordinator: ShutdownCoordinator,
    shutdown_timeout: Duration,
    signals_enabled: bool,
}

impl Runtime {
    /// Creates a builder for a runtime with the given name.
    pub fn builder<N: Into<String>>(name: N) -> RuntimeBuilder {
        RuntimeBuilder::new(name.into())
    }

    /// Registers a service.
    ///
    /// The service's graceful stop is registered as a closer at this position, so services and
    /// plain closers tear down in one overall registration order. Registering the same service
    /// (by identity) twice is a no-op.
    pub fn add_service(&mut self, service: Arc<dyn Service>) {
        if self.services.iter().any(|existing| Arc::ptr_eq(existing, &service)) {
            debug!(service_name = service.name(), "Service already registered. Ignoring.");
            return;
        }

        let close_target = Arc::clone(&service);
        self.closers.push(Closer::fallible_contextual(service.name().to_string(), move || async move {
            close_target.close().await
        }));
        self.services.push(service);
    }

    /// Registers a closer.
    ///
    /// Closers run during shutdown, strictly sequentially, in registration order.
    pub fn add_closer(&mut self, closer: Closer) {
        self.closers.push(closer);
    }

    /// Returns the runtime's health registry.
    pub fn health(&self) -> &HealthRegistry {
        &self.health
    }

    /// Returns a handle that can trigger shutdown from outside the runtime.
    pub fn shutdown_handle(&self) -> RuntimeShutdownHandle {
        RuntimeShutdownHandle {
            coordinator: self.coordinator.clone(),
        }
    }

    /// Runs the runtime until a service fails or shutdown is triggered, then tears down.
    ///
    /// Blocks for the lifetime of the program. Teardown runs under the configured shutdown
    /// timeout regardless of how the run phase ended.
    ///
    /// # Errors
    ///
    /// If a service failed before shutdown was triggered, that error is returned once teardown
    /// has finished. If teardown itself exceeded the shutdown timeout, an error is returned.
    pub async fn run(mut self) -> Result<(), GenericError> {
        let services = std::mem::take(&mut self.services);
        let closers = std::mem::take(&mut self.closers);

        info!(
            runtime_name = %self.name,
            services = services.len(),
            closers = closers.len(),
            "Runtime starting."
        );

        let mut service_tasks: JoinSet<Result<(), GenericError>> = JoinSet::new();
        let mut service_task_map: HashMap<Id, String> = HashMap::new();

        for service in services {
            let service_name = service.name().to_string();
            let context = ServiceContext::new(self.coordinator.register());
            let span = info_span!("service", service_name = %service_name);
            let task_id = service_tasks
                .spawn(
                    async move {
                        debug!("Service starting.");
                        service.start(context).await
                    }
                    .instrument(span),
                )
                .id();
            service_task_map.insert(task_id, service_name);
        }

        let signals_enabled = self.signals_enabled;
        let interrupt = async move {
            if signals_enabled {
                wait_for_process_interrupt().await;
            } else {
                futures::future::pending::<()>().await;
            }
        };
        pin!(interrupt);

        let mut root_signal = self.coordinator.register();
        let mut startup_error = None;

        loop {
            select! {
                // Disabled for the round once the set is empty, leaving the runtime waiting on a
                // shutdown trigger.
                Some(task_result) = service_tasks.join_next_with_id() => {
                    if let Some(e) = handle_service_result(&mut service_task_map, task_result, false) {
                        startup_error = Some(e);
                        break;
                    }
                },
                _ = root_signal.wait() => {
                    info!("Shutdown requested. Stopping services.");
                    break;
                },
                _ = &mut interrupt => {
                    info!("Interrupt received. Stopping services.");
                    break;
                },
            }
        }

        // Every service observes the shutdown signal before the first closer runs.
        self.coordinator.shutdown();

        let finished_cleanly =
            run_shutdown_phase(service_tasks, service_task_map, closers, self.shutdown_timeout).await;

        info!(runtime_name = %self.name, "Runtime stopped.");

        match startup_error {
            Some(e) => Err(e),
            None if !finished_cleanly => {
                Err(generic_error!("Runtime failed to stop within the shutdown grace period."))
            }
            None => Ok(()),
        }
    }
}

/// Runs the teardown sequence: all closers in registration order, then draining any service
/// tasks that are still finishing, all under a single fresh deadline.
///
/// Returns `false` if the deadline elapsed before teardown finished.
async fn run_shutdown_phase(
    mut service_tasks: JoinSet<Result<(), GenericError>>, mut service_task_map: HashMap<Id, String>,
    closers: Vec<Closer>, timeout: Duration,
) -> bool {
    let shutdown_deadline = Instant::now() + timeout;

    let shutdown_timeout = sleep(timeout);
    pin!(shutdown_timeout);

    let mut progress_interval = interval(SHUTDOWN_PROGRESS_INTERVAL);
    progress_interval.tick().await;

    let mut remaining_closers = VecDeque::from(closers);
    let mut timed_out = false;

    'closers: while let Some(closer) = remaining_closers.pop_front() {
        let closer_name = closer.name().to_string();
        debug!(closer_name = %closer_name, closer_kind = closer.kind(), "Running closer.");

        let close_result = closer.close();
        let mut close_result = std::pin::pin!(close_result);

        loop {
            select! {
                result = &mut close_result => {
                    match result {
                        Ok(()) => debug!(closer_name = %closer_name, "Closer finished."),
                        Err(e) => error!(closer_name = %closer_name, error = %e, "Closer failed. Continuing teardown."),
                    }
                    break;
                },
                _ = progress_interval.tick() => {
                    let remaining_time = shutdown_deadline.saturating_duration_since(Instant::now());
                    info!(
                        "Still waiting for closer '{}' to finish. {} closer(s) queued. {} seconds remaining.",
                        closer_name,
                        remaining_closers.len(),
                        remaining_time.as_secs_f64().round() as u64,
                    );
                },
                _ = &mut shutdown_timeout => {
                    let mut abandoned = vec![closer_name.clone()];
                    abandoned.extend(remaining_closers.iter().map(|c| c.name().to_string()));
                    warn!(
                        "Forcefully stopping runtime after shutdown grace period. Abandoned closer(s): {}.",
                        abandoned.join(", ")
                    );
                    timed_out = true;
                    break 'closers;
                },
            }
        }
    }

    if !timed_out {
        loop {
            select! {
                maybe_result = service_tasks.join_next_with_id() => match maybe_result {
                    None => {
                        info!("All services stopped.");
                        break;
                    }
                    Some(task_result) => {
                        let _ = handle_service_result(&mut service_task_map, task_result, true);
                    }
                },
                _ = progress_interval.tick() => {
                    let mut remaining_services = service_task_map.values().cloned().collect::<Vec<_>>();
                    remaining_services.sort();
                    let remaining_time = shutdown_deadline.saturating_duration_since(Instant::now());
                    info!(
                        "Waiting for the remaining service(s) to stop: {}. {} seconds remaining.",
                        remaining_services.join(", "),
                        remaining_time.as_secs_f64().round() as u64,
                    );
                },
                _ = &mut shutdown_timeout => {
                    let mut remaining_services = service_task_map.values().cloned().collect::<Vec<_>>();
                    remaining_services.sort();
                    warn!(
                        "Forcefully stopping runtime after shutdown grace period. Abandoned service(s): {}.",
                        remaining_services.join(", ")
                    );
                    timed_out = true;
                    break;
                },
            }
        }
    }

    // Dropping the join set aborts any service task that is still running.
    !timed_out
}

/// Handles a finished service task, logging the outcome and removing it from the running map.
///
/// Returns `Some(error)` when the outcome is fatal, which only happens before shutdown has been
/// triggered. Everything that finishes during shutdown is benign.
fn handle_service_result(
    service_task_map: &mut HashMap<Id, String>, task_result: Result<(Id, Result<(), GenericError>), JoinError>,
    during_shutdown: bool,
) -> Option<GenericError> {
    match task_result {
        Ok((task_id, service_result)) => {
            let service_name = service_task_map
                .remove(&task_id)
                .unwrap_or_else(|| "unknown".to_string());
            match service_result {
                Ok(()) => {
                    if during_shutdown {
                        debug!(service_name = %service_name, "Service stopped.");
                    } else {
                        warn!(service_name = %service_name, "Service unexpectedly finished.");
                    }
                    None
                }
                Err(e) => {
                    if during_shutdown {
                        debug!(service_name = %service_name, error = %e, "Service finished with error during shutdown.");
                        None
                    } else {
                        error!(service_name = %service_name, error = %e, "Service failed. Stopping remaining services.");
                        Some(e)
                    }
                }
            }
        }
        Err(e) => {
            let service_name = service_task_map
                .remove(&e.id())
                .unwrap_or_else(|| "unknown".to_string());
            error!(service_name = %service_name, error = %e, "Service task failed unexpectedly.");
            if during_shutdown {
                None
            } else {
                Some(generic_error!("Service '{}' task failed: {}", service_name, e))
            }
        }
    }
}

/// Waits for the process to be interrupted by the OS.
async fn wait_for_process_interrupt() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(terminate) => terminate,
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler. Handling SIGINT only.");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

        select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = terminate.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
