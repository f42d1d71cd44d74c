use std::time::Instant;

use async_trait::async_trait;
use chassis_error::GenericError;
use tracing::{debug, warn};

use super::{ClientRequest, ClientResponse, RoundTripware, TransportNext};

/// Logs each outbound round trip with method, URI, status and duration.
///
/// Placed outside a [`Retry`][super::Retry] hop it logs once per request; placed inside, once
/// per attempt.
pub struct LoggerTripware;

impl LoggerTripware {
    /// Creates a `LoggerTripware` hop.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl RoundTripware for LoggerTripware {
    fn name(&self) -> &str {
        "logger"
    }

    async fn round_trip(
        &self, request: ClientRequest, next: TransportNext<'_>,
    ) -> Result<ClientResponse, GenericError> {
        let method = request.method().clone();
        let uri = request.uri().clone();

        let start = Instant::now();
        let result = next.run(request).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        match &result {
            Ok(response) => debug!(
                method = %method,
                uri = %uri,
                status = response.status().as_u16(),
                duration_ms,
                "Sent request."
            ),
            Err(e) => warn!(
                method = %method,
                uri = %uri,
                duration_ms,
                error = %e,
                "Request round trip failed."
            ),
        }

        result
    }
}
