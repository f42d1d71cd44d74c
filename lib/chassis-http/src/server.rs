//! HTTP server glue between a [`Pipeline`] and the runtime.

use std::net::SocketAddr;
use std::sync::Mutex;

use async_trait::async_trait;
use axum::Router;
use chassis_core::service::{Service, ServiceContext};
use chassis_core::shutdown::ShutdownCoordinator;
use chassis_core::task::JoinSetExt as _;
use chassis_error::{generic_error, ErrorContext as _, GenericError};
use chassis_health::HealthRegistry;
use futures::future::BoxFuture;
use http::{Request, Response};
use http_body_util::{BodyExt as _, Full};
use hyper::body::Incoming;
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto,
};
use serde::Deserialize;
use tokio::{net::TcpListener, select, sync::oneshot, task::JoinSet};
use tower::ServiceExt as _;
use tracing::{debug, error, info};

use crate::middleware::{HttpHandler, HttpRequest, HttpResponse, Pipeline};

/// Adapts a [`Pipeline`] to hyper's service contract.
///
/// Request bodies are collected up front so links and handlers see a fully buffered request.
#[derive(Clone)]
struct PipelineService {
    pipeline: Pipeline,
}

impl hyper::service::Service<Request<Incoming>> for PipelineService {
    type Error = GenericError;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;
    type Response = HttpResponse;

    fn call(&self, request: Request<Incoming>) -> Self::Future {
        let pipeline = self.pipeline.clone();
        Box::pin(async move {
            let (parts, body) = request.into_parts();
            let body = body
                .collect()
                .await
                .error_context("Failed to read request body.")?
                .to_bytes();
            pipeline.handle(Request::from_parts(parts, body)).await
        })
    }
}

/// Adapts an axum [`Router`] into an [`HttpHandler`], so router-based endpoints can sit at the
/// center of a [`Pipeline`].
pub struct RouterHandler {
    router: Router,
}

impl RouterHandler {
    /// Creates a `RouterHandler` serving the given router.
    pub fn new(router: Router) -> Self {
        Self { router }
    }
}

#[async_trait]
impl HttpHandler for RouterHandler {
    async fn handle(&self, request: HttpRequest) -> Result<HttpResponse, GenericError> {
        let (parts, body) = request.into_parts();
        let request = Request::from_parts(parts, axum::body::Body::from(body));

        let response = match self.router.clone().oneshot(request).await {
            Ok(response) => response,
            Err(never) => match never {},
        };

        let (parts, body) = response.into_parts();
        let body = body
            .collect()
            .await
            .error_context("Failed to buffer response body.")?
            .to_bytes();
        Ok(Response::from_parts(parts, Full::new(body)))
    }
}

/// Configuration for the health endpoint server.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct HealthzConfig {
    /// Address the health endpoints are served on.
    pub listen_addr: SocketAddr,
    /// Path prefix the health routes are nested under.
    pub path_prefix: String,
}

impl Default for HealthzConfig {
    fn default() -> Self {
        Self {
            listen_addr: ([0, 0, 0, 0], 9400).into(),
            path_prefix: "/healthz".to_string(),
        }
    }
}

/// An HTTP server running a [`Pipeline`], supervised as a runtime [`Service`].
///
/// The listener is bound eagerly in [`bind`][Self::bind], so unusable addresses surface as
/// errors during composition instead of after the runtime has started. Shutdown is graceful:
/// in-flight connections are told to finish and the server waits for them before reporting
/// itself stopped.
pub struct HttpService {
    name: String,
    listener: TcpListener,
    local_addr: SocketAddr,
    service: PipelineService,
    conn_builder: auto::Builder<TokioExecutor>,
    shutdown: ShutdownCoordinator,
    drain_tx: Mutex<Option<oneshot::Sender<()>>>,
    drain_rx: Mutex<Option<oneshot::Receiver<()>>>,
}

impl HttpService {
    /// Binds `listen_addr` and creates an `HttpService` serving `pipeline`.
    ///
    /// # Errors
    ///
    /// If the address cannot be bound, an error is returned.
    pub async fn bind<N>(name: N, listen_addr: SocketAddr, pipeline: Pipeline) -> Result<Self, GenericError>
    where
        N: Into<String>,
    {
        let listener = TcpListener::bind(listen_addr)
            .await
            .with_error_context(|| format!("Failed to bind {}.", listen_addr))?;
        let local_addr = listener
            .local_addr()
            .error_context("Failed to read local listen address.")?;

        let (drain_tx, drain_rx) = oneshot::channel();

        Ok(Self {
            name: name.into(),
            listener,
            local_addr,
            service: PipelineService { pipeline },
            conn_builder: auto::Builder::new(TokioExecutor::new()),
            shutdown: ShutdownCoordinator::default(),
            drain_tx: Mutex::new(Some(drain_tx)),
            drain_rx: Mutex::new(Some(drain_rx)),
        })
    }

    /// Creates an `HttpService` serving Kubernetes-style health endpoints from `registry`.
    ///
    /// # Errors
    ///
    /// If the configured address cannot be bound, an error is returned.
    pub async fn healthz(config: HealthzConfig, registry: &HealthRegistry) -> Result<Self, GenericError> {
        let routes = registry.api_handler().routes();
        let prefix = config.path_prefix.trim_end_matches('/');
        let router = if prefix.is_empty() {
            routes
        } else if prefix.starts_with('/') {
            Router::new().nest(prefix, routes)
        } else {
            Router::new().nest(&format!("/{prefix}"), routes)
        };

        let pipeline = Pipeline::new("healthz", RouterHandler::new(router), Vec::new());
        Self::bind("healthz", config.listen_addr, pipeline).await
    }

    /// Returns the address the server is actually listening on.
    ///
    /// Useful when binding port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

#[async_trait]
impl Service for HttpService {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self, context: ServiceContext) -> Result<(), GenericError> {
        let drain_tx = match self.drain_tx.lock().unwrap().take() {
            Some(drain_tx) => drain_tx,
            None => return Err(generic_error!("HTTP server '{}' was already started.", self.name)),
        };

        let mut external_shutdown = context.shutdown_signal();
        let mut close_requested = self.shutdown.register();
        let conn_shutdown = self.shutdown.register();
        let listen_addr = self.local_addr;

        let mut connections = JoinSet::new();
        let mut accept_error = None;

        info!(%listen_addr, "HTTP server started.");

        loop {
            select! {
                result = self.listener.accept() => match result {
                    Ok((stream, _)) => {
                        let service = self.service.clone();
                        let conn_builder = self.conn_builder.clone();
                        let mut conn_shutdown = conn_shutdown.clone();

                        connections.spawn_traced(async move {
                            let conn = conn_builder.serve_connection(TokioIo::new(stream), service);
                            tokio::pin!(conn);

                            select! {
                                result = conn.as_mut() => {
                                    if let Err(e) = result {
                                        error!(%listen_addr, error = %e, "Failed to serve HTTP connection.");
                                    }
                                },
                                _ = conn_shutdown.wait() => {
                                    conn.as_mut().graceful_shutdown();
                                    if let Err(e) = conn.as_mut().await {
                                        error!(%listen_addr, error = %e, "Failed to serve HTTP connection.");
                                    }
                                },
                            }
                        });
                    },
                    Err(e) => {
                        error!(%listen_addr, error = %e, "Failed to accept connection.");
                        accept_error = Some(GenericError::from(e));
                        break;
                    }
                },

                Some(finished) = connections.join_next() => {
                    if let Err(e) = finished {
                        error!(%listen_addr, error = %e, "HTTP connection task failed.");
                    }
                },

                _ = external_shutdown.wait() => {
                    debug!(%listen_addr, "Received shutdown signal.");
                    break;
                },

                _ = close_requested.wait() => {
                    debug!(%listen_addr, "Received close request.");
                    break;
                },
            }
        }

        // Nudge in-flight connections and wait for them to wind down.
        self.shutdown.shutdown();
        while let Some(finished) = connections.join_next().await {
            if let Err(e) = finished {
                error!(%listen_addr, error = %e, "HTTP connection task failed.");
            }
        }

        let _ = drain_tx.send(());
        info!(%listen_addr, "HTTP server stopped.");

        match accept_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn close(&self) -> Result<(), GenericError> {
        // Never started, nothing to wind down.
        if self.drain_tx.lock().unwrap().is_some() {
            return Ok(());
        }

        self.shutdown.shutdown();

        let drain_rx = self.drain_rx.lock().unwrap().take();
        if let Some(drain_rx) = drain_rx {
            let _ = drain_rx.await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;
    use chassis_health::{ProbeCheck, ProbeClass};
    use http::StatusCode;
    use http_body_util::BodyExt as _;
    use hyper_util::client::legacy::Client;
    use tokio::task::JoinHandle;

    use crate::middleware::{handler_fn, text_response};

    use super::*;

    fn echo_pipeline() -> Pipeline {
        let handler = handler_fn(|request: HttpRequest| async move {
            Ok(text_response(StatusCode::OK, request.uri().path().to_string()))
        });
        Pipeline::new("echo", handler, Vec::new())
    }

    struct Started {
        service: Arc<HttpService>,
        local_addr: SocketAddr,
        coordinator: ShutdownCoordinator,
        task: JoinHandle<Result<(), GenericError>>,
    }

    async fn start_service(service: HttpService) -> Started {
        let local_addr = service.local_addr();
        let service = Arc::new(service);
        let coordinator = ShutdownCoordinator::default();
        let context = ServiceContext::new(coordinator.register());

        let task = tokio::spawn({
            let service = Arc::clone(&service);
            async move { service.start(context).await }
        });

        Started {
            service,
            local_addr,
            coordinator,
            task,
        }
    }

    async fn get(addr: SocketAddr, path: &str) -> (StatusCode, String) {
        let client = Client::builder(TokioExecutor::new()).build_http::<Full<Bytes>>();
        let request = Request::builder()
            .uri(format!("http://{}{}", addr, path))
            .body(Full::new(Bytes::new()))
            .unwrap();

        let response = client.request(request).await.unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    async fn bound(pipeline: Pipeline) -> HttpService {
        HttpService::bind("test", "127.0.0.1:0".parse().unwrap(), pipeline)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn serves_requests_through_the_pipeline() {
        let started = start_service(bound(echo_pipeline()).await).await;

        let (status, body) = get(started.local_addr, "/hello").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "/hello");

        started.coordinator.shutdown();
        started.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn close_stops_the_server_and_waits_for_drain() {
        let started = start_service(bound(echo_pipeline()).await).await;

        let (status, _) = get(started.local_addr, "/warmup").await;
        assert_eq!(status, StatusCode::OK);

        started.service.close().await.unwrap();
        started.task.await.unwrap().unwrap();

        // The listener is gone once close returns.
        let client = Client::builder(TokioExecutor::new()).build_http::<Full<Bytes>>();
        let request = Request::builder()
            .uri(format!("http://{}/after", started.local_addr))
            .body(Full::new(Bytes::new()))
            .unwrap();
        assert!(client.request(request).await.is_err());
    }

    #[tokio::test]
    async fn external_shutdown_stops_the_server() {
        let started = start_service(bound(echo_pipeline()).await).await;

        started.coordinator.shutdown();
        started.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn starting_twice_fails() {
        let started = start_service(bound(echo_pipeline()).await).await;

        let context = ServiceContext::new(started.coordinator.register());
        let second = started.service.start(context).await;
        assert!(second.is_err());

        started.coordinator.shutdown();
        started.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn close_before_start_returns_immediately() {
        let service = bound(echo_pipeline()).await;
        service.close().await.unwrap();
    }

    #[tokio::test]
    async fn healthz_serves_probe_routes() {
        let registry = HealthRegistry::new();
        registry.add_probe(ProbeClass::Liveness, "loop", ProbeCheck::flag(|| true));
        registry.add_probe(ProbeClass::Readiness, "warmup", ProbeCheck::flag(|| false));

        let config = HealthzConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            ..Default::default()
        };
        let started = start_service(HttpService::healthz(config, &registry).await.unwrap()).await;

        let (status, body) = get(started.local_addr, "/healthz/liveness").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "OK");

        let (status, _) = get(started.local_addr, "/healthz/readiness").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        let (status, _) = get(started.local_addr, "/healthz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        started.coordinator.shutdown();
        started.task.await.unwrap().unwrap();
    }
}
