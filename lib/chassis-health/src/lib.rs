//! Health probes, probe classes, and aggregation.

use std::{
    collections::HashMap,
    fmt,
    future::Future,
    sync::{Arc, Mutex},
};

use chassis_error::GenericError;
use futures::future::BoxFuture;
use metrics::{gauge, Gauge};
use tracing::debug;

mod api;
pub use self::api::HealthApiHandler;

/// The class a health probe is evaluated under.
///
/// Classes map onto the Kubernetes probe model: `Startup` gates initial traffic, `Liveness`
/// decides restarts, `Readiness` decides load balancer membership. `Always` probes are folded
/// into the evaluation of every class, so a single fatal condition can fail all of them at once.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ProbeClass {
    /// Evaluated as part of every class.
    Always,
    /// Evaluated for startup checks only.
    Startup,
    /// Evaluated for liveness checks only.
    Liveness,
    /// Evaluated for readiness checks only.
    Readiness,
}

impl ProbeClass {
    /// Returns the name of this class.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Always => "always",
            Self::Startup => "startup",
            Self::Liveness => "liveness",
            Self::Readiness => "readiness",
        }
    }
}

impl fmt::Display for ProbeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The shape of check carried by a registered probe.
///
/// Four shapes cover the check signatures that occur in practice: synchronous or asynchronous,
/// boolean or fallible. Fallible shapes carry an error describing the failure; boolean shapes
/// only report that the probe is down.
pub enum ProbeCheck {
    /// Synchronous, boolean.
    Bool(Box<dyn Fn() -> bool + Send + Sync>),

    /// Synchronous, fallible.
    Fallible(Box<dyn Fn() -> Result<(), GenericError> + Send + Sync>),

    /// Asynchronous, boolean.
    ContextualBool(Box<dyn Fn() -> BoxFuture<'static, bool> + Send + Sync>),

    /// Asynchronous, fallible.
    Contextual(Box<dyn Fn() -> BoxFuture<'static, Result<(), GenericError>> + Send + Sync>),
}

impl ProbeCheck {
    /// Creates a check from a synchronous function returning `true` when healthy.
    pub fn flag<F>(f: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        Self::Bool(Box::new(f))
    }

    /// Creates a check from a synchronous, fallible function.
    pub fn fallible<F>(f: F) -> Self
    where
        F: Fn() -> Result<(), GenericError> + Send + Sync + 'static,
    {
        Self::Fallible(Box::new(f))
    }

    /// Creates a check from an asynchronous function returning `true` when healthy.
    pub fn contextual_flag<F, Fut>(f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        Self::ContextualBool(Box::new(move || Box::pin(f())))
    }

    /// Creates a check from an asynchronous, fallible function.
    pub fn contextual<F, Fut>(f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), GenericError>> + Send + 'static,
    {
        Self::Contextual(Box::new(move || Box::pin(f())))
    }

    /// Returns the name of this check's shape, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::Fallible(_) => "fallible",
            Self::ContextualBool(_) => "contextual_bool",
            Self::Contextual(_) => "contextual",
        }
    }
}

/// A failed probe evaluation.
#[derive(Debug)]
pub struct ProbeFailure {
    /// Name of the failing probe.
    pub probe: String,

    /// Class the probe was registered under.
    pub class: ProbeClass,

    /// Underlying error, for fallible checks. Boolean checks report no detail beyond being down.
    pub source: Option<GenericError>,
}

impl fmt::Display for ProbeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(source) => write!(f, "Probe '{}' ({}) failed: {}", self.probe, self.class, source),
            None => write!(f, "Probe '{}' ({}) failed.", self.probe, self.class),
        }
    }
}

impl std::error::Error for ProbeFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

struct RegisteredProbe {
    name: String,
    check: ProbeCheck,
    up: Gauge,
}

#[derive(Default)]
struct Inner {
    probes: HashMap<ProbeClass, Vec<Arc<RegisteredProbe>>>,
}

/// A registry of named health probes, grouped by class.
///
/// Probes are evaluated sequentially, in registration order within their class, and evaluation
/// of a class short-circuits on the first failure. `Always` probes are evaluated ahead of every
/// class, so one of them failing fails all classes.
///
/// # Telemetry
///
/// Each evaluation sets a `health.probe.up` gauge (`1` passing, `0` failing) tagged with the
/// probe's name and class.
///
/// Cheap to clone; all clones share the same probe set.
#[derive(Clone)]
pub struct HealthRegistry {
    inner: Arc<Mutex<Inner>>,
}

impl HealthRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    /// Registers a probe under the given class.
    ///
    /// Probes registered under the same class are evaluated in registration order. Registering
    /// the same logical probe under several classes means registering it once per class.
    pub fn add_probe<N: Into<String>>(&self, class: ProbeClass, name: N, check: ProbeCheck) {
        let name = name.into();
        let up = gauge!("health.probe.up", "probe" => name.clone(), "class" => class.as_str());

        debug!(probe = %name, probe_class = %class, check_kind = check.kind(), "Registered health probe.");

        let mut inner = self.inner.lock().unwrap();
        inner
            .probes
            .entry(class)
            .or_default()
            .push(Arc::new(RegisteredProbe { name, check, up }));
    }

    /// Evaluates the given class.
    ///
    /// `Always` probes are evaluated first, then the probes of `class`, in registration order,
    /// stopping at the first failure.
    ///
    /// # Errors
    ///
    /// If any evaluated probe fails, the failure is returned and later probes are not evaluated.
    pub async fn check(&self, class: ProbeClass) -> Result<(), ProbeFailure> {
        self.run_probes(ProbeClass::Always).await?;
        if class != ProbeClass::Always {
            self.run_probes(class).await?;
        }
        Ok(())
    }

    /// Evaluates every class except `Startup`.
    ///
    /// `Always` probes are evaluated once, then `Liveness`, then `Readiness`, short-circuiting
    /// across the whole sequence.
    ///
    /// # Errors
    ///
    /// If any evaluated probe fails, the failure is returned and later probes are not evaluated.
    pub async fn check_overall(&self) -> Result<(), ProbeFailure> {
        self.run_probes(ProbeClass::Always).await?;
        self.run_probes(ProbeClass::Liveness).await?;
        self.run_probes(ProbeClass::Readiness).await?;
        Ok(())
    }

    /// Gets an API handler exposing these probes over HTTP.
    pub fn api_handler(&self) -> HealthApiHandler {
        HealthApiHandler::from_registry(self.clone())
    }

    async fn run_probes(&self, class: ProbeClass) -> Result<(), ProbeFailure> {
        for probe in self.snapshot(class) {
            evaluate_probe(&probe, class).await?;
        }
        Ok(())
    }

    fn snapshot(&self, class: ProbeClass) -> Vec<Arc<RegisteredProbe>> {
        let inner = self.inner.lock().unwrap();
        inner.probes.get(&class).cloned().unwrap_or_default()
    }
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

async fn evaluate_probe(probe: &RegisteredProbe, class: ProbeClass) -> Result<(), ProbeFailure> {
    let outcome = match &probe.check {
        ProbeCheck::Bool(f) => {
            if f() {
                Ok(())
            } else {
                Err(None)
            }
        }
        ProbeCheck::Fallible(f) => f().map_err(Some),
        ProbeCheck::ContextualBool(f) => {
            if f().await {
                Ok(())
            } else {
                Err(None)
            }
        }
        ProbeCheck::Contextual(f) => f().await.map_err(Some),
    };

    match outcome {
        Ok(()) => {
            probe.up.set(1.0);
            Ok(())
        }
        Err(source) => {
            probe.up.set(0.0);
            Err(ProbeFailure {
                probe: probe.name.clone(),
                class,
                source,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use chassis_error::generic_error;

    use super::*;

    #[tokio::test]
    async fn classes_are_isolated() {
        let registry = HealthRegistry::new();
        registry.add_probe(ProbeClass::Readiness, "cache-warm", ProbeCheck::flag(|| false));

        assert!(registry.check(ProbeClass::Liveness).await.is_ok());
        assert!(registry.check(ProbeClass::Startup).await.is_ok());

        let failure = registry.check(ProbeClass::Readiness).await.unwrap_err();
        assert_eq!(failure.probe, "cache-warm");
        assert_eq!(failure.class, ProbeClass::Readiness);
    }

    #[tokio::test]
    async fn always_probe_fails_every_class() {
        let registry = HealthRegistry::new();
        registry.add_probe(
            ProbeClass::Always,
            "disk",
            ProbeCheck::fallible(|| Err(generic_error!("disk full"))),
        );

        for class in [
            ProbeClass::Always,
            ProbeClass::Startup,
            ProbeClass::Liveness,
            ProbeClass::Readiness,
        ] {
            let failure = registry.check(class).await.unwrap_err();
            assert_eq!(failure.probe, "disk");
            assert_eq!(failure.class, ProbeClass::Always);
        }

        let failure = registry.check_overall().await.unwrap_err();
        assert_eq!(failure.class, ProbeClass::Always);
    }

    #[tokio::test]
    async fn evaluation_short_circuits_in_registration_order() {
        let reached = Arc::new(AtomicBool::new(false));

        let registry = HealthRegistry::new();
        registry.add_probe(ProbeClass::Readiness, "first", ProbeCheck::flag(|| false));
        let flag = Arc::clone(&reached);
        registry.add_probe(
            ProbeClass::Readiness,
            "second",
            ProbeCheck::flag(move || {
                flag.store(true, Ordering::SeqCst);
                true
            }),
        );

        let failure = registry.check(ProbeClass::Readiness).await.unwrap_err();
        assert_eq!(failure.probe, "first");
        assert!(!reached.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn overall_skips_startup() {
        let registry = HealthRegistry::new();
        registry.add_probe(ProbeClass::Startup, "migrations", ProbeCheck::flag(|| false));
        registry.add_probe(ProbeClass::Liveness, "loop", ProbeCheck::flag(|| true));

        assert!(registry.check_overall().await.is_ok());
        assert!(registry.check(ProbeClass::Startup).await.is_err());
    }

    #[tokio::test]
    async fn contextual_checks_are_awaited() {
        let registry = HealthRegistry::new();
        registry.add_probe(
            ProbeClass::Liveness,
            "async-flag",
            ProbeCheck::contextual_flag(|| async {
                tokio::task::yield_now().await;
                true
            }),
        );
        registry.add_probe(
            ProbeClass::Liveness,
            "async-check",
            ProbeCheck::contextual(|| async { Err(generic_error!("backend unreachable")) }),
        );

        let failure = registry.check(ProbeClass::Liveness).await.unwrap_err();
        assert_eq!(failure.probe, "async-check");
        assert!(failure.source.is_some());
    }
}
