//! Target probing.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::Bytes;
use chassis_core::service::WorkerService;
use chassis_error::{ErrorContext as _, GenericError};
use chassis_health::{HealthRegistry, ProbeCheck, ProbeClass};
use chassis_http::{
    client::{Breaker, HttpClient, LoggerTripware, RequestIdTripware, Retry},
    middleware::RequestId,
};
use http::{Request, Uri};
use tokio::{select, time::interval};
use tracing::{debug, info, warn};

use crate::config::{TargetConfiguration, UptimedConfiguration};

/// How long an opened breaker waits before letting a trial request through.
const BREAKER_OPEN_TIMEOUT: Duration = Duration::from_secs(30);

struct Target {
    name: String,
    uri: Uri,
    client: HttpClient,
    healthy: Arc<AtomicBool>,
}

/// Builds the worker that probes every configured target on a fixed interval.
///
/// Each target is probed through its own client, with retries and a circuit breaker, and gets a
/// readiness probe in `health` reflecting the result of its most recent round. Targets report
/// unhealthy until the first round has reached them.
pub fn build_prober(
    configuration: &UptimedConfiguration, health: &HealthRegistry,
) -> Result<WorkerService, GenericError> {
    let mut targets = Vec::with_capacity(configuration.targets.len());
    for target in &configuration.targets {
        targets.push(build_target(target, health)?);
    }

    let probe_interval = configuration.probe_interval();
    Ok(WorkerService::new("uptime-prober", move |mut shutdown| async move {
        let mut ticker = interval(probe_interval);
        loop {
            select! {
                _ = ticker.tick() => run_probe_round(&targets).await,
                _ = shutdown.wait() => {
                    debug!("Probe loop stopping.");
                    return Ok(());
                },
            }
        }
    }))
}

fn build_target(target: &TargetConfiguration, health: &HealthRegistry) -> Result<Target, GenericError> {
    let uri = target
        .url
        .parse::<Uri>()
        .with_error_context(|| format!("Invalid probe URL '{}'.", target.url))?;

    // One client per target, so a target that keeps failing only opens its own breaker. The
    // breaker sits outside the retry hop and judges the outcome of the whole retried sequence;
    // once open, probes fail immediately without burning retry attempts.
    let client = HttpClient::builder()
        .with_round_tripware(LoggerTripware::new())
        .with_round_tripware(RequestIdTripware::new())
        .with_round_tripware(
            Breaker::builder(target.name.clone())
                .with_open_timeout(BREAKER_OPEN_TIMEOUT)
                .build(),
        )
        .with_round_tripware(Retry::new().with_jitter())
        .build()?;

    let healthy = Arc::new(AtomicBool::new(false));
    let probe_state = Arc::clone(&healthy);
    health.add_probe(
        ProbeClass::Readiness,
        target.name.clone(),
        ProbeCheck::flag(move || probe_state.load(Ordering::Relaxed)),
    );

    Ok(Target {
        name: target.name.clone(),
        uri,
        client,
        healthy,
    })
}

async fn run_probe_round(targets: &[Target]) {
    for target in targets {
        let was_healthy = target.healthy.load(Ordering::Relaxed);
        let is_healthy = probe_target(target).await;
        target.healthy.store(is_healthy, Ordering::Relaxed);

        if is_healthy != was_healthy {
            if is_healthy {
                info!(target = %target.name, "Target is healthy.");
            } else {
                warn!(target = %target.name, "Target is unhealthy.");
            }
        }
    }
}

async fn probe_target(target: &Target) -> bool {
    let mut request = Request::new(Bytes::new());
    *request.uri_mut() = target.uri.clone();
    request.extensions_mut().insert(RequestId::generate());

    match target.client.send(request).await {
        Ok(response) => response.status().is_success(),
        Err(e) => {
            debug!(target = %target.name, error = %e, "Probe request failed.");
            false
        }
    }
}
