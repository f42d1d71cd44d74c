use std::fmt;

use async_trait::async_trait;
use chassis_error::GenericError;
use http::StatusCode;
use tracing::error;

use super::{text_response, HttpRequest, HttpResponse, Middleware, Next};

/// Sentinel error instructing the transport to drop the connection without writing a response.
///
/// [`ErrorBoundary`] re-propagates this error instead of converting it, so a handler that has
/// decided the connection itself is beyond saving can abort it. Everything else a handler
/// returns becomes a `500`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct AbortRequest;

impl fmt::Display for AbortRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("request aborted")
    }
}

impl std::error::Error for AbortRequest {}

/// Converts errors from the rest of the chain into a `500 Internal Server Error` response.
///
/// Compose this outermost so that every inner link and the terminal handler are covered. The
/// failure detail goes to the log, never the response body.
pub struct ErrorBoundary;

#[async_trait]
impl Middleware for ErrorBoundary {
    fn name(&self) -> &str {
        "error_boundary"
    }

    async fn handle(&self, request: HttpRequest, next: Next<'_>) -> Result<HttpResponse, GenericError> {
        let method = request.method().clone();
        let path = request.uri().path().to_string();

        match next.run(request).await {
            Ok(response) => Ok(response),
            Err(e) if e.is::<AbortRequest>() => Err(e),
            Err(e) => {
                error!(%method, path, error = %e, "Request handler failed. Responding with internal server error.");
                Ok(text_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error"))
            }
        }
    }
}
