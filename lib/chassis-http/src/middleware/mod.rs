//! Composable server-side middleware.
//!
//! A [`Pipeline`] wraps a terminal [`HttpHandler`] in an ordered chain of [`Middleware`] links.
//! The first link in the chain is the outermost wrapper: it runs first on the way in and last on
//! the way out. Ordering between links is load-bearing, and the conventional arrangement is an
//! [`ErrorBoundary`] outermost, identity links such as [`SetRequestId`] next, and logging after
//! the identity links so the logged fields are populated.
//!
//! Links close over their configuration when they are constructed, and a pipeline is immutable
//! once built, so a composed chain can be served from any number of connections concurrently.

use std::{future::Future, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use chassis_error::GenericError;
use http::{header, HeaderValue, StatusCode};
use http_body_util::Full;
use tracing::{info_span, Instrument as _};

mod cors;
mod error_boundary;
mod logger;
mod request_id;
mod session_id;
mod skip;
mod token_auth;

pub use self::cors::Cors;
pub use self::error_boundary::{AbortRequest, ErrorBoundary};
pub use self::logger::RequestLogger;
pub use self::request_id::{RequestId, SetRequestId};
pub use self::session_id::{DomainPolicy, SessionId, SetSessionId};
pub use self::skip::Skip;
pub use self::token_auth::{TokenAuth, TokenValidator};

/// An inbound request with its body fully collected.
pub type HttpRequest = http::Request<Bytes>;

/// An outbound response carrying a fully buffered body.
pub type HttpResponse = http::Response<Full<Bytes>>;

/// Terminal handler at the center of a [`Pipeline`].
#[async_trait]
pub trait HttpHandler: Send + Sync + 'static {
    /// Handles a request.
    ///
    /// # Errors
    ///
    /// If the request could not be handled, an error is returned. Errors travel back out through
    /// the middleware chain, and an [`ErrorBoundary`] at the outermost position converts them
    /// into a `500 Internal Server Error` response.
    async fn handle(&self, request: HttpRequest) -> Result<HttpResponse, GenericError>;
}

/// Adapts an async closure into an [`HttpHandler`].
pub struct HandlerFn<F> {
    f: F,
}

/// Creates an [`HttpHandler`] from an async closure.
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(HttpRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<HttpResponse, GenericError>> + Send + 'static,
{
    HandlerFn { f }
}

#[async_trait]
impl<F, Fut> HttpHandler for HandlerFn<F>
where
    F: Fn(HttpRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<HttpResponse, GenericError>> + Send + 'static,
{
    async fn handle(&self, request: HttpRequest) -> Result<HttpResponse, GenericError> {
        (self.f)(request).await
    }
}

/// A single link in a middleware chain.
///
/// A link can rewrite the request, short-circuit with its own response, run logic around the
/// rest of the chain via [`Next`], or rewrite the response on the way out.
#[async_trait]
pub trait Middleware: Send + Sync + 'static {
    /// Returns the name of this link, for logs.
    fn name(&self) -> &str;

    /// Handles a request, delegating to the rest of the chain through `next`.
    async fn handle(&self, request: HttpRequest, next: Next<'_>) -> Result<HttpResponse, GenericError>;
}

/// The remainder of a middleware chain, from the perspective of one link.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    handler: &'a dyn HttpHandler,
    links: &'a [Box<dyn Middleware>],
}

impl<'a> Next<'a> {
    /// Runs the rest of the chain: the remaining links in order, then the terminal handler.
    pub async fn run(self, request: HttpRequest) -> Result<HttpResponse, GenericError> {
        match self.links.split_first() {
            Some((link, rest)) => {
                let next = Next {
                    handler: self.handler,
                    links: rest,
                };
                link.handle(request, next).await
            }
            None => self.handler.handle(request).await,
        }
    }
}

struct PipelineInner {
    service_name: String,
    handler: Box<dyn HttpHandler>,
    links: Vec<Box<dyn Middleware>>,
}

/// A composed middleware chain around a terminal handler.
///
/// Cheap to clone. The first link passed to [`new`][Self::new] is the outermost wrapper.
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<PipelineInner>,
}

impl Pipeline {
    /// Composes `links` around `handler`, in order, outermost first.
    pub fn new<N, H>(service_name: N, handler: H, links: Vec<Box<dyn Middleware>>) -> Self
    where
        N: Into<String>,
        H: HttpHandler,
    {
        Self {
            inner: Arc::new(PipelineInner {
                service_name: service_name.into(),
                handler: Box::new(handler),
                links,
            }),
        }
    }

    /// Returns the name this pipeline was composed under.
    pub fn service_name(&self) -> &str {
        &self.inner.service_name
    }

    /// Runs a request through the chain.
    ///
    /// Every request runs inside a `tracing` span carrying the pipeline's service name, so log
    /// events emitted by links and the handler can be attributed without threading the name
    /// through by hand.
    pub async fn handle(&self, request: HttpRequest) -> Result<HttpResponse, GenericError> {
        let span = info_span!("request", service_name = %self.inner.service_name);
        let next = Next {
            handler: self.inner.handler.as_ref(),
            links: &self.inner.links,
        };
        next.run(request).instrument(span).await
    }
}

/// Builds a plain text response with the given status.
pub fn text_response<S: Into<String>>(status: StatusCode, body: S) -> HttpResponse {
    let body = body.into();
    let has_body = !body.is_empty();
    let mut response = http::Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    if has_body {
        response
            .headers_mut()
            .insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    }
    response
}

/// Strips a trailing `:port` from a host, if present.
pub(crate) fn strip_port(host: &str) -> &str {
    match host.rsplit_once(':') {
        Some((bare, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => bare,
        _ => host,
    }
}

/// Compares a lowercased host against a `*.suffix` wildcard, label by label in reverse.
///
/// The wildcard requires at least one extra label: `*.chassis.dev` matches `www.chassis.dev` but not
/// the bare `chassis.dev`.
pub(crate) fn host_matches_wildcard(host: &str, suffix: &str) -> bool {
    let mut host_labels = host.rsplit('.');
    let mut suffix_labels = suffix.rsplit('.');

    loop {
        match (suffix_labels.next(), host_labels.next()) {
            (Some(expected), Some(actual)) if expected == actual => continue,
            (None, Some(_)) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    struct Recorder {
        label: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Middleware for Recorder {
        fn name(&self) -> &str {
            self.label
        }

        async fn handle(&self, request: HttpRequest, next: Next<'_>) -> Result<HttpResponse, GenericError> {
            self.log.lock().unwrap().push(format!("{}-in", self.label));
            let response = next.run(request).await;
            self.log.lock().unwrap().push(format!("{}-out", self.label));
            response
        }
    }

    fn empty_request() -> HttpRequest {
        http::Request::new(Bytes::new())
    }

    #[tokio::test]
    async fn links_compose_outermost_first() {
        let log = Arc::new(Mutex::new(Vec::new()));

        let handler_log = Arc::clone(&log);
        let handler = handler_fn(move |_request| {
            let handler_log = Arc::clone(&handler_log);
            async move {
                handler_log.lock().unwrap().push("handler".to_string());
                Ok(text_response(StatusCode::OK, "done"))
            }
        });

        let links: Vec<Box<dyn Middleware>> = vec![
            Box::new(Recorder {
                label: "a",
                log: Arc::clone(&log),
            }),
            Box::new(Recorder {
                label: "b",
                log: Arc::clone(&log),
            }),
            Box::new(Recorder {
                label: "c",
                log: Arc::clone(&log),
            }),
        ];
        let pipeline = Pipeline::new("test", handler, links);

        let response = pipeline.handle(empty_request()).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["a-in", "b-in", "c-in", "handler", "c-out", "b-out", "a-out"]
        );
    }

    #[tokio::test]
    async fn empty_chain_runs_the_handler_directly() {
        let handler = handler_fn(|_request| async { Ok(text_response(StatusCode::NO_CONTENT, "")) });
        let pipeline = Pipeline::new("test", handler, Vec::new());

        let response = pipeline.handle(empty_request()).await.unwrap();

        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[test]
    fn wildcard_host_matching_requires_an_extra_label() {
        assert!(host_matches_wildcard("www.chassis.dev", "chassis.dev"));
        assert!(host_matches_wildcard("a.b.chassis.dev", "chassis.dev"));
        assert!(!host_matches_wildcard("chassis.dev", "chassis.dev"));
        assert!(!host_matches_wildcard("www.chassis.org", "chassis.dev"));
        assert!(!host_matches_wildcard("dev", "chassis.dev"));
    }

    #[test]
    fn port_is_stripped_from_hosts() {
        assert_eq!(strip_port("chassis.dev:8443"), "chassis.dev");
        assert_eq!(strip_port("chassis.dev"), "chassis.dev");
        assert_eq!(strip_port("127.0.0.1:80"), "127.0.0.1");
    }
}
