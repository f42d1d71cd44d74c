use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Router};
use tracing::warn;

use crate::{HealthRegistry, ProbeClass, ProbeFailure};

/// An API handler exposing Kubernetes-style health endpoints.
///
/// Four routes are exposed, meant to be mounted under a prefix such as `/healthz`:
///
/// - `/`: evaluates every class except startup
/// - `/startup`: evaluates startup probes
/// - `/liveness`: evaluates liveness probes
/// - `/readiness`: evaluates readiness probes
///
/// Each route answers `200 OK` with a body of `OK` when the evaluation passes, and
/// `503 Service Unavailable` otherwise. Failure detail goes to the log, not the response body.
pub struct HealthApiHandler {
    registry: HealthRegistry,
}

impl HealthApiHandler {
    pub(crate) fn from_registry(registry: HealthRegistry) -> Self {
        Self { registry }
    }

    /// Returns the router serving the health endpoints.
    pub fn routes(&self) -> Router {
        Router::new()
            .route("/", get(overall_handler))
            .route("/startup", get(startup_handler))
            .route("/liveness", get(liveness_handler))
            .route("/readiness", get(readiness_handler))
            .with_state(self.registry.clone())
    }
}

async fn overall_handler(State(registry): State<HealthRegistry>) -> impl IntoResponse {
    to_response(registry.check_overall().await)
}

async fn startup_handler(State(registry): State<HealthRegistry>) -> impl IntoResponse {
    to_response(registry.check(ProbeClass::Startup).await)
}

async fn liveness_handler(State(registry): State<HealthRegistry>) -> impl IntoResponse {
    to_response(registry.check(ProbeClass::Liveness).await)
}

async fn readiness_handler(State(registry): State<HealthRegistry>) -> impl IntoResponse {
    to_response(registry.check(ProbeClass::Readiness).await)
}

fn to_response(result: Result<(), ProbeFailure>) -> (StatusCode, &'static str) {
    match result {
        Ok(()) => (StatusCode::OK, "OK"),
        Err(failure) => {
            warn!(error = %failure, "Health check failed.");
            (StatusCode::SERVICE_UNAVAILABLE, "Service Unavailable")
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt as _;
    use tower::ServiceExt as _;

    use crate::ProbeCheck;

    use super::*;

    async fn get_route(router: Router, path: &str) -> (StatusCode, String) {
        let response = router
            .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
            .await
            .unwrap();

        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn passing_probes_answer_ok() {
        let registry = HealthRegistry::new();
        registry.add_probe(ProbeClass::Liveness, "loop", ProbeCheck::flag(|| true));

        let routes = registry.api_handler().routes();

        let (status, body) = get_route(routes.clone(), "/").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "OK");

        let (status, body) = get_route(routes, "/liveness").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "OK");
    }

    #[tokio::test]
    async fn failing_class_answers_unavailable() {
        let registry = HealthRegistry::new();
        registry.add_probe(ProbeClass::Readiness, "warmup", ProbeCheck::flag(|| false));

        let routes = registry.api_handler().routes();

        let (status, _) = get_route(routes.clone(), "/readiness").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        // Liveness is unaffected by the failing readiness probe.
        let (status, _) = get_route(routes.clone(), "/liveness").await;
        assert_eq!(status, StatusCode::OK);

        // The umbrella route folds readiness in.
        let (status, _) = get_route(routes, "/").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn startup_route_is_separate_from_umbrella() {
        let registry = HealthRegistry::new();
        registry.add_probe(ProbeClass::Startup, "migrations", ProbeCheck::flag(|| false));

        let routes = registry.api_handler().routes();

        let (status, _) = get_route(routes.clone(), "/startup").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        let (status, _) = get_route(routes, "/").await;
        assert_eq!(status, StatusCode::OK);
    }
}
