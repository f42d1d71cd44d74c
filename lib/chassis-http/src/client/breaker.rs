use std::{
    fmt,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use chassis_error::{ErrorContext as _, GenericError};
use http::{Response, StatusCode};
use http_body_util::BodyExt as _;
use metrics::{counter, Counter};
use tokio::time::Instant;
use tracing::{info, warn};

use super::{buffered_body, ClientRequest, ClientResponse, RoundTripware, TransportNext};

/// Request counts within one breaker generation.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Counts {
    /// Requests admitted in this generation.
    pub requests: u32,
    /// Completed round trips judged successful.
    pub total_successes: u32,
    /// Completed round trips judged failed.
    pub total_failures: u32,
    /// Current run of consecutive successes.
    pub consecutive_successes: u32,
    /// Current run of consecutive failures.
    pub consecutive_failures: u32,
}

impl Counts {
    fn on_request(&mut self) {
        self.requests += 1;
    }

    fn on_success(&mut self) {
        self.total_successes += 1;
        self.consecutive_successes += 1;
        self.consecutive_failures = 0;
    }

    fn on_failure(&mut self) {
        self.total_failures += 1;
        self.consecutive_failures += 1;
        self.consecutive_successes = 0;
    }
}

/// The state of a [`Breaker`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BreakerState {
    /// Requests flow through; results are counted.
    Closed,
    /// Requests are rejected without reaching the transport.
    Open,
    /// A bounded number of trial requests are admitted.
    HalfOpen,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Rejection reasons surfaced by a [`Breaker`].
///
/// Downcast errors returned by the client to tell breaker rejections apart from transport
/// failures.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BreakerError {
    /// The breaker is open.
    Open,
    /// The breaker is half-open and the trial quota is exhausted.
    TooManyRequests,
}

impl fmt::Display for BreakerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => write!(f, "circuit breaker is open"),
            Self::TooManyRequests => write!(f, "circuit breaker trial quota exhausted"),
        }
    }
}

impl std::error::Error for BreakerError {}

/// What the breaker observed about one completed round trip.
#[derive(Debug)]
pub struct BreakerObservation {
    status: Option<StatusCode>,
    request_body: Bytes,
    response_body: Option<Bytes>,
    response_buffered: bool,
}

impl BreakerObservation {
    /// Returns the response status, when a response arrived at all.
    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    /// Returns the request body.
    pub fn request_body(&self) -> &Bytes {
        &self.request_body
    }

    /// Returns the response body, when response buffering is enabled and a response arrived.
    ///
    /// Without [`BreakerBuilder::with_buffered_responses`], bodies stream past the breaker and
    /// this returns `None`.
    pub fn response_body(&self) -> Option<&Bytes> {
        if !self.response_buffered && self.status.is_some() {
            warn!("Success predicate inspected the response body without response buffering enabled.");
        }
        self.response_body.as_ref()
    }
}

type ReadyToTrip = Box<dyn Fn(&Counts) -> bool + Send + Sync>;
type SuccessPredicate = Box<dyn Fn(&BreakerObservation) -> bool + Send + Sync>;

struct BreakerCore {
    state: BreakerState,
    generation: u64,
    counts: Counts,
    expiry: Option<Instant>,
}

struct BreakerInner {
    name: String,
    max_requests: u32,
    interval: Duration,
    open_timeout: Duration,
    ready_to_trip: ReadyToTrip,
    is_success: SuccessPredicate,
    buffer_responses: bool,
    transitions: Counter,
    core: Mutex<BreakerCore>,
}

impl BreakerInner {
    /// Rolls the breaker forward to where it should be at `now`, without observing a request.
    fn advance_state(&self, core: &mut BreakerCore, now: Instant) {
        match core.state {
            BreakerState::Closed => {
                if core.expiry.is_some_and(|expiry| now >= expiry) {
                    // Interval rollover: fresh counts, same state.
                    self.new_generation(core, now);
                }
            }
            BreakerState::Open => {
                if core.expiry.is_some_and(|expiry| now >= expiry) {
                    self.transition(core, BreakerState::HalfOpen, now);
                }
            }
            BreakerState::HalfOpen => {}
        }
    }

    fn new_generation(&self, core: &mut BreakerCore, now: Instant) {
        core.generation = core.generation.wrapping_add(1);
        core.counts = Counts::default();
        core.expiry = match core.state {
            BreakerState::Closed => {
                if self.interval.is_zero() {
                    None
                } else {
                    Some(now + self.interval)
                }
            }
            BreakerState::Open => Some(now + self.open_timeout),
            BreakerState::HalfOpen => None,
        };
    }

    fn transition(&self, core: &mut BreakerCore, to: BreakerState, now: Instant) {
        if core.state == to {
            return;
        }
        let from = core.state;
        core.state = to;
        self.new_generation(core, now);
        self.transitions.increment(1);
        info!(breaker = %self.name, %from, %to, "Circuit breaker state changed.");
    }

    /// Admits or rejects a request, returning the generation it was admitted under.
    fn before_request(&self) -> Result<u64, BreakerError> {
        let mut core = self.core.lock().unwrap();
        self.advance_state(&mut core, Instant::now());

        match core.state {
            BreakerState::Open => Err(BreakerError::Open),
            BreakerState::HalfOpen if core.counts.requests >= self.max_requests => {
                Err(BreakerError::TooManyRequests)
            }
            _ => {
                core.counts.on_request();
                Ok(core.generation)
            }
        }
    }

    /// Records the outcome of a round trip admitted under `generation`.
    ///
    /// Outcomes from a stale generation are dropped, so slow responses cannot poison the state
    /// the breaker has since moved to.
    fn after_request(&self, generation: u64, success: bool) {
        let mut core = self.core.lock().unwrap();
        let now = Instant::now();
        self.advance_state(&mut core, now);
        if core.generation != generation {
            return;
        }

        if success {
            core.counts.on_success();
            if core.state == BreakerState::HalfOpen && core.counts.consecutive_successes >= self.max_requests {
                self.transition(&mut core, BreakerState::Closed, now);
            }
        } else {
            core.counts.on_failure();
            match core.state {
                BreakerState::Closed => {
                    if (self.ready_to_trip)(&core.counts) {
                        self.transition(&mut core, BreakerState::Open, now);
                    }
                }
                BreakerState::HalfOpen => self.transition(&mut core, BreakerState::Open, now),
                BreakerState::Open => {}
            }
        }
    }
}

/// Circuit breaking for outbound requests.
///
/// Follows the usual closed, open, half-open cycle: failures in the closed state are counted
/// until the trip condition fires, the open state rejects requests outright until the open
/// timeout passes, and the half-open state admits a bounded number of trials. Enough
/// consecutive trial successes close the breaker again; any trial failure reopens it.
///
/// Cheap to clone; clones share state, so one breaker can guard a downstream across many
/// callers. Rejections surface as [`BreakerError`] values inside the client error.
#[derive(Clone)]
pub struct Breaker {
    inner: Arc<BreakerInner>,
}

impl Breaker {
    /// Creates a builder for a breaker with the given name.
    ///
    /// The name identifies the guarded downstream in logs and metrics.
    pub fn builder<N: Into<String>>(name: N) -> BreakerBuilder {
        BreakerBuilder::new(name)
    }

    /// Returns the current state.
    pub fn state(&self) -> BreakerState {
        let mut core = self.inner.core.lock().unwrap();
        self.inner.advance_state(&mut core, Instant::now());
        core.state
    }

    /// Returns a snapshot of the counts in the current generation.
    pub fn counts(&self) -> Counts {
        let mut core = self.inner.core.lock().unwrap();
        self.inner.advance_state(&mut core, Instant::now());
        core.counts
    }

    async fn buffer_response(response: ClientResponse) -> Result<(ClientResponse, Bytes), GenericError> {
        let (parts, body) = response.into_parts();
        let bytes = body
            .collect()
            .await
            .error_context("Failed to buffer response body.")?
            .to_bytes();
        let response = Response::from_parts(parts, buffered_body(bytes.clone()));
        Ok((response, bytes))
    }
}

#[async_trait]
impl RoundTripware for Breaker {
    fn name(&self) -> &str {
        "breaker"
    }

    async fn round_trip(
        &self, request: ClientRequest, next: TransportNext<'_>,
    ) -> Result<ClientResponse, GenericError> {
        let generation = match self.inner.before_request() {
            Ok(generation) => generation,
            Err(rejection) => return Err(GenericError::from(rejection)),
        };

        let request_body = request.body().clone();
        match next.run(request).await {
            Ok(response) => {
                let (response, response_body) = if self.inner.buffer_responses {
                    match Self::buffer_response(response).await {
                        Ok((response, bytes)) => (response, Some(bytes)),
                        Err(e) => {
                            self.inner.after_request(generation, false);
                            return Err(e);
                        }
                    }
                } else {
                    (response, None)
                };

                let observation = BreakerObservation {
                    status: Some(response.status()),
                    request_body,
                    response_body,
                    response_buffered: self.inner.buffer_responses,
                };
                let success = (self.inner.is_success)(&observation);
                self.inner.after_request(generation, success);
                Ok(response)
            }
            Err(e) => {
                let observation = BreakerObservation {
                    status: None,
                    request_body,
                    response_body: None,
                    response_buffered: self.inner.buffer_responses,
                };
                let success = (self.inner.is_success)(&observation);
                self.inner.after_request(generation, success);
                Err(e)
            }
        }
    }
}

/// Builder for [`Breaker`].
pub struct BreakerBuilder {
    name: String,
    max_requests: u32,
    interval: Duration,
    open_timeout: Duration,
    ready_to_trip: ReadyToTrip,
    is_success: SuccessPredicate,
    buffer_responses: bool,
}

impl BreakerBuilder {
    fn new<N: Into<String>>(name: N) -> Self {
        Self {
            name: name.into(),
            max_requests: 1,
            interval: Duration::ZERO,
            open_timeout: Duration::from_secs(60),
            ready_to_trip: Box::new(|counts| counts.consecutive_failures >= 5),
            is_success: Box::new(|observation| {
                observation.status().is_some_and(|status| status.is_success())
            }),
            buffer_responses: false,
        }
    }

    /// Sets how many trial requests the half-open state admits, and how many consecutive
    /// successes are needed to close the breaker.
    ///
    /// Values below 1 are clamped to 1.
    pub fn with_max_requests(mut self, max_requests: u32) -> Self {
        self.max_requests = max_requests.max(1);
        self
    }

    /// Sets how often counts are reset while the breaker is closed.
    ///
    /// Zero, the default, never resets counts: a slow trickle of failures can still trip the
    /// breaker no matter how spread out it is.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Sets how long the breaker stays open before admitting trial requests.
    pub fn with_open_timeout(mut self, open_timeout: Duration) -> Self {
        self.open_timeout = open_timeout;
        self
    }

    /// Sets the trip condition evaluated after every failure in the closed state.
    ///
    /// Defaults to five consecutive failures.
    pub fn with_ready_to_trip<F>(mut self, ready_to_trip: F) -> Self
    where
        F: Fn(&Counts) -> bool + Send + Sync + 'static,
    {
        self.ready_to_trip = Box::new(ready_to_trip);
        self
    }

    /// Sets the predicate deciding whether a completed round trip counts as a success.
    ///
    /// Defaults to treating any 2xx response as success and everything else, including transport
    /// errors, as failure.
    pub fn with_success_predicate<F>(mut self, is_success: F) -> Self
    where
        F: Fn(&BreakerObservation) -> bool + Send + Sync + 'static,
    {
        self.is_success = Box::new(is_success);
        self
    }

    /// Buffers response bodies so the success predicate can inspect them.
    ///
    /// The response handed back to the caller is rebuilt from the buffered bytes.
    pub fn with_buffered_responses(mut self) -> Self {
        self.buffer_responses = true;
        self
    }

    /// Builds the breaker.
    pub fn build(self) -> Breaker {
        let expiry = if self.interval.is_zero() {
            None
        } else {
            Some(Instant::now() + self.interval)
        };
        let transitions = counter!(
            "http_client_circuit_breaker_transitions_total",
            "breaker" => self.name.clone()
        );

        Breaker {
            inner: Arc::new(BreakerInner {
                name: self.name,
                max_requests: self.max_requests,
                interval: self.interval,
                open_timeout: self.open_timeout,
                ready_to_trip: self.ready_to_trip,
                is_success: self.is_success,
                buffer_responses: self.buffer_responses,
                transitions,
                core: Mutex::new(BreakerCore {
                    state: BreakerState::Closed,
                    generation: 0,
                    counts: Counts::default(),
                    expiry,
                }),
            }),
        }
    }
}
