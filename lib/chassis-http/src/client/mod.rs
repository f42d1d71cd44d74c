//! HTTP client with a composable round-trip chain.
//!
//! An [`HttpClient`] wraps a [`Transport`], the thing that actually performs a network round
//! trip, in zero or more [`RoundTripware`] hops. Hops compose like server middleware: the first
//! hop added is the outermost, each hop sees the request on the way in and the response on the
//! way out, and a hop may short-circuit or re-run the remainder of the chain.

use std::{future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use chassis_error::{ErrorContext as _, GenericError};
use http::{Request, Response};
use http_body_util::{combinators::UnsyncBoxBody, BodyExt as _, Full};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::{TokioExecutor, TokioTimer},
};
use tokio::time::timeout;

mod breaker;
mod logger;
mod request_id;
mod retry;

pub use self::breaker::{Breaker, BreakerBuilder, BreakerError, BreakerObservation, BreakerState, Counts};
pub use self::logger::LoggerTripware;
pub use self::request_id::RequestIdTripware;
pub use self::retry::Retry;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

/// An outbound request carrying a fully buffered body.
pub type ClientRequest = Request<Bytes>;

/// The body of a client response.
///
/// Responses stream by default. Hops that need the payload buffer it explicitly and rebuild the
/// response with [`buffered_body`].
pub type ClientBody = UnsyncBoxBody<Bytes, GenericError>;

/// An inbound response.
pub type ClientResponse = Response<ClientBody>;

/// Wraps fully buffered bytes into a [`ClientBody`].
pub fn buffered_body(bytes: Bytes) -> ClientBody {
    Full::new(bytes).map_err(|never| match never {}).boxed_unsync()
}

/// The terminal hop of a client: performs the actual network round trip.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Sends the request and returns the response.
    ///
    /// # Errors
    ///
    /// If the request could not be sent or no response arrived, an error is returned.
    async fn round_trip(&self, request: ClientRequest) -> Result<ClientResponse, GenericError>;
}

/// Adapts an async closure into a [`Transport`].
pub struct TransportFn<F> {
    f: F,
}

/// Creates a [`Transport`] from an async closure.
///
/// Mostly useful for exercising hop chains without a network.
pub fn transport_fn<F, Fut>(f: F) -> TransportFn<F>
where
    F: Fn(ClientRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ClientResponse, GenericError>> + Send + 'static,
{
    TransportFn { f }
}

#[async_trait]
impl<F, Fut> Transport for TransportFn<F>
where
    F: Fn(ClientRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ClientResponse, GenericError>> + Send + 'static,
{
    async fn round_trip(&self, request: ClientRequest) -> Result<ClientResponse, GenericError> {
        (self.f)(request).await
    }
}

/// A [`Transport`] backed by a pooled hyper client.
///
/// Connections are reused across requests, HTTPS is handled through the platform's native root
/// certificates, and both the connect phase and the overall request are bounded by timeouts.
pub struct HyperTransport {
    client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
    request_timeout: Duration,
}

impl HyperTransport {
    /// Creates a `HyperTransport` with default timeouts.
    ///
    /// # Errors
    ///
    /// If the native root certificates cannot be loaded, an error is returned.
    pub fn new() -> Result<Self, GenericError> {
        Self::with_request_timeout(DEFAULT_REQUEST_TIMEOUT)
    }

    /// Creates a `HyperTransport` with the given overall request timeout.
    ///
    /// # Errors
    ///
    /// If the native root certificates cannot be loaded, an error is returned.
    pub fn with_request_timeout(request_timeout: Duration) -> Result<Self, GenericError> {
        let mut http_connector = HttpConnector::new();
        http_connector.enforce_http(false);
        http_connector.set_connect_timeout(Some(DEFAULT_CONNECT_TIMEOUT));

        let https_connector = HttpsConnectorBuilder::new()
            .with_native_roots()
            .error_context("Failed to load native root certificates.")?
            .https_or_http()
            .enable_all_versions()
            .wrap_connector(http_connector);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(5)
            .pool_idle_timeout(Some(Duration::from_secs(45)))
            .pool_timer(TokioTimer::new())
            .build(https_connector);

        Ok(Self {
            client,
            request_timeout,
        })
    }
}

#[async_trait]
impl Transport for HyperTransport {
    async fn round_trip(&self, request: ClientRequest) -> Result<ClientResponse, GenericError> {
        let (parts, body) = request.into_parts();
        let request = Request::from_parts(parts, Full::new(body));

        let response = timeout(self.request_timeout, self.client.request(request))
            .await
            .error_context("Request timed out.")?
            .error_context("Failed to send request.")?;

        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.map_err(GenericError::from).boxed_unsync()))
    }
}

/// A single hop wrapped around the transport of an [`HttpClient`].
#[async_trait]
pub trait RoundTripware: Send + Sync + 'static {
    /// Returns the name of this hop, for logs.
    fn name(&self) -> &str;

    /// Handles a request, delegating onward through `next`.
    async fn round_trip(&self, request: ClientRequest, next: TransportNext<'_>)
        -> Result<ClientResponse, GenericError>;
}

/// The remainder of a hop chain, from the perspective of one hop.
#[derive(Clone, Copy)]
pub struct TransportNext<'a> {
    transport: &'a dyn Transport,
    hops: &'a [Box<dyn RoundTripware>],
}

impl<'a> TransportNext<'a> {
    /// Runs the rest of the chain: the remaining hops in order, then the transport.
    ///
    /// `TransportNext` is `Copy`, so a hop may run the remainder more than once, as the retry
    /// hop does.
    pub async fn run(self, request: ClientRequest) -> Result<ClientResponse, GenericError> {
        match self.hops.split_first() {
            Some((hop, rest)) => {
                let next = TransportNext {
                    transport: self.transport,
                    hops: rest,
                };
                hop.round_trip(request, next).await
            }
            None => self.transport.round_trip(request).await,
        }
    }
}

struct ClientInner {
    transport: Box<dyn Transport>,
    hops: Vec<Box<dyn RoundTripware>>,
}

/// An HTTP client running every request through its hop chain.
///
/// Cheap to clone; clones share the transport, its connection pool and all hop state.
#[derive(Clone)]
pub struct HttpClient {
    inner: Arc<ClientInner>,
}

impl HttpClient {
    /// Creates a builder.
    pub fn builder() -> HttpClientBuilder {
        HttpClientBuilder::default()
    }

    /// Sends a request through the hop chain and the transport.
    ///
    /// # Errors
    ///
    /// If a hop rejects the request or the transport fails, an error is returned.
    pub async fn send(&self, request: ClientRequest) -> Result<ClientResponse, GenericError> {
        let next = TransportNext {
            transport: self.inner.transport.as_ref(),
            hops: &self.inner.hops,
        };
        next.run(request).await
    }
}

/// Builder for [`HttpClient`].
#[derive(Default)]
pub struct HttpClientBuilder {
    transport: Option<Box<dyn Transport>>,
    hops: Vec<Box<dyn RoundTripware>>,
}

impl HttpClientBuilder {
    /// Sets the transport.
    ///
    /// Defaults to [`HyperTransport`] with default timeouts.
    pub fn with_transport<T: Transport>(mut self, transport: T) -> Self {
        self.transport = Some(Box::new(transport));
        self
    }

    /// Adds a hop to the chain. The first hop added is the outermost.
    pub fn with_round_tripware<R: RoundTripware>(mut self, hop: R) -> Self {
        self.hops.push(Box::new(hop));
        self
    }

    /// Builds the client.
    ///
    /// # Errors
    ///
    /// If no transport was set and the default transport cannot be constructed, an error is
    /// returned.
    pub fn build(self) -> Result<HttpClient, GenericError> {
        let transport = match self.transport {
            Some(transport) => transport,
            None => Box::new(HyperTransport::new()?),
        };

        Ok(HttpClient {
            inner: Arc::new(ClientInner {
                transport,
                hops: self.hops,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use http::StatusCode;
    use http_body_util::BodyExt as _;

    use super::*;

    struct Recorder {
        label: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl RoundTripware for Recorder {
        fn name(&self) -> &str {
            self.label
        }

        async fn round_trip(
            &self, request: ClientRequest, next: TransportNext<'_>,
        ) -> Result<ClientResponse, GenericError> {
            self.log.lock().unwrap().push(format!("{}-in", self.label));
            let response = next.run(request).await;
            self.log.lock().unwrap().push(format!("{}-out", self.label));
            response
        }
    }

    fn ok_response() -> ClientResponse {
        Response::builder()
            .status(StatusCode::OK)
            .body(buffered_body(Bytes::from_static(b"done")))
            .unwrap()
    }

    #[tokio::test]
    async fn hops_compose_outermost_first() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let transport_log = Arc::clone(&log);

        let client = HttpClient::builder()
            .with_round_tripware(Recorder {
                label: "outer",
                log: Arc::clone(&log),
            })
            .with_round_tripware(Recorder {
                label: "inner",
                log: Arc::clone(&log),
            })
            .with_transport(transport_fn(move |_request| {
                let log = Arc::clone(&transport_log);
                async move {
                    log.lock().unwrap().push("transport".to_string());
                    Ok(ok_response())
                }
            }))
            .build()
            .unwrap();

        let response = client.send(Request::new(Bytes::new())).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let order = log.lock().unwrap().clone();
        assert_eq!(order, ["outer-in", "inner-in", "transport", "inner-out", "outer-out"]);
    }

    #[tokio::test]
    async fn bare_client_calls_the_transport_directly() {
        let client = HttpClient::builder()
            .with_transport(transport_fn(|request: ClientRequest| async move {
                assert_eq!(request.uri().path(), "/direct");
                Ok(ok_response())
            }))
            .build()
            .unwrap();

        let request = Request::builder().uri("/direct").body(Bytes::new()).unwrap();
        let response = client.send(request).await.unwrap();

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, Bytes::from_static(b"done"));
    }
}
