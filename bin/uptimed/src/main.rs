//! A small availability monitor.
//!
//! `uptimed` probes a set of HTTP targets on a fixed interval and reflects the result of each
//! target's most recent probe as a readiness probe on its health endpoints, so an unreachable
//! target shows up as `uptimed` itself reporting not ready.

#![deny(warnings)]
#![deny(missing_docs)]

use std::sync::Arc;

use chassis_app::prelude::*;
use chassis_config::ConfigurationLoader;
use chassis_core::runtime::Runtime;
use chassis_error::GenericError;
use chassis_http::server::HttpService;
use tracing::{error, info, warn};

mod config;
use self::config::UptimedConfiguration;

mod probe;
use self::probe::build_prober;

#[tokio::main]
async fn main() {
    if let Err(e) = initialize_logging(None) {
        fatal_and_exit(format!("failed to initialize logging: {}", e));
    }

    match run().await {
        Ok(()) => info!("uptimed stopped."),
        Err(e) => {
            error!("{:?}", e);
            std::process::exit(1);
        }
    }
}

async fn run() -> Result<(), GenericError> {
    let configuration: UptimedConfiguration = ConfigurationLoader::default()
        .try_from_yaml("./uptimed.yaml")
        .from_environment("UPTIMED")?
        .into_typed()?;

    if configuration.targets.is_empty() {
        warn!("No targets configured. Serving health endpoints only.");
    }

    let mut runtime = Runtime::builder("uptimed")
        .with_shutdown_timeout(configuration.shutdown_timeout())
        .build();

    let prober = build_prober(&configuration, runtime.health())?;
    runtime.add_service(Arc::new(prober));

    let healthz = HttpService::healthz(configuration.healthz.clone(), runtime.health()).await?;
    info!("Serving health endpoints on {}.", healthz.local_addr());
    runtime.add_service(Arc::new(healthz));

    runtime.run().await
}
