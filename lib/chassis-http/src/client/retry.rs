use std::time::Duration;

use async_trait::async_trait;
use chassis_error::GenericError;
use http::Request;
use rand::Rng as _;
use tokio::time::sleep;
use tracing::debug;

use super::{ClientRequest, ClientResponse, RoundTripware, TransportNext};

type RetryPredicate = Box<dyn Fn(&Result<ClientResponse, GenericError>) -> bool + Send + Sync>;

fn default_should_retry(outcome: &Result<ClientResponse, GenericError>) -> bool {
    match outcome {
        Ok(response) => !response.status().is_success(),
        Err(_) => true,
    }
}

/// Retrying for outbound requests, with exponential backoff.
///
/// Each attempt sends a copy of the original request, so the hop only fits requests with
/// buffered bodies, which is all a [`ClientRequest`] can carry. The final attempt's outcome is
/// returned as-is, success or not. Extensions are not carried onto the copies; hops that
/// translate extensions into headers belong before this one.
pub struct Retry {
    max_attempts: u32,
    delay: Duration,
    multiplier: f64,
    max_delay: Duration,
    jitter: bool,
    should_retry: RetryPredicate,
}

impl Retry {
    /// Creates a `Retry` hop with defaults: three attempts, 250ms initial delay, no backoff
    /// growth, no jitter, retrying on transport errors and non-2xx responses.
    pub fn new() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_millis(250),
            multiplier: 1.0,
            max_delay: Duration::from_secs(10),
            jitter: false,
            should_retry: Box::new(default_should_retry),
        }
    }

    /// Sets the total number of attempts, including the first.
    ///
    /// Values below 1 are clamped to 1.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Sets the delay before the first retry.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Sets the factor the delay grows by after each retry.
    ///
    /// Values below 1.0 are clamped to 1.0.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier.max(1.0);
        self
    }

    /// Caps the delay between attempts.
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Spreads each delay uniformly between half its value and its full value.
    pub fn with_jitter(mut self) -> Self {
        self.jitter = true;
        self
    }

    /// Sets the predicate deciding whether an outcome is retried.
    pub fn with_retry_predicate<F>(mut self, should_retry: F) -> Self
    where
        F: Fn(&Result<ClientResponse, GenericError>) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Box::new(should_retry);
        self
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter && !delay.is_zero() {
            rand::rng().random_range(delay.div_f64(2.0)..=delay)
        } else {
            delay
        }
    }

    fn next_delay(&self, delay: Duration) -> Duration {
        let scaled = (delay.as_secs_f64() * self.multiplier).min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(scaled)
    }
}

fn clone_request(request: &ClientRequest) -> ClientRequest {
    let mut cloned = Request::new(request.body().clone());
    *cloned.method_mut() = request.method().clone();
    *cloned.uri_mut() = request.uri().clone();
    *cloned.version_mut() = request.version();
    *cloned.headers_mut() = request.headers().clone();
    cloned
}

#[async_trait]
impl RoundTripware for Retry {
    fn name(&self) -> &str {
        "retry"
    }

    async fn round_trip(
        &self, request: ClientRequest, next: TransportNext<'_>,
    ) -> Result<ClientResponse, GenericError> {
        let mut delay = self.delay;
        let mut attempt = 1;

        loop {
            if attempt >= self.max_attempts {
                return next.run(request).await;
            }

            let outcome = next.run(clone_request(&request)).await;
            if !(self.should_retry)(&outcome) {
                return outcome;
            }

            debug!(attempt, delay_ms = delay.as_millis() as u64, "Round trip failed. Retrying.");
            sleep(self.jittered(delay)).await;
            delay = self.next_delay(delay);
            attempt += 1;
        }
    }
}
