//! Configuration.

use std::time::Duration;

use chassis_http::server::HealthzConfig;
use serde::Deserialize;

/// Top-level configuration for `uptimed`.
///
/// Loaded from `uptimed.yaml` in the working directory, then overlaid with `UPTIMED_`-prefixed
/// environment variables.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct UptimedConfiguration {
    /// Health endpoint server configuration.
    pub healthz: HealthzConfig,

    /// Targets to probe.
    pub targets: Vec<TargetConfiguration>,

    /// Seconds between probe rounds.
    pub probe_interval_secs: u64,

    /// Upper bound, in seconds, on the shutdown phase.
    pub shutdown_timeout_secs: u64,
}

impl UptimedConfiguration {
    /// Returns the interval between probe rounds.
    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    /// Returns the upper bound on the shutdown phase.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

impl Default for UptimedConfiguration {
    fn default() -> Self {
        Self {
            healthz: HealthzConfig::default(),
            targets: Vec::new(),
            probe_interval_secs: 30,
            shutdown_timeout_secs: 30,
        }
    }
}

/// A single target to probe.
#[derive(Clone, Debug, Deserialize)]
pub struct TargetConfiguration {
    /// Name of the target, used in logs and as its readiness probe name.
    pub name: String,

    /// URL probed with a GET request.
    pub url: String,
}
