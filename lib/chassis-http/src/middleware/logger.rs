use std::time::Instant;

use async_trait::async_trait;
use chassis_error::GenericError;
use tracing::{info, warn};

use super::{HttpRequest, HttpResponse, Middleware, Next, RequestId};

/// Access logging.
///
/// Logs one line per handled request with method, path, status and duration. When a
/// [`RequestId`] has already been attached to the request, it is included, so this link
/// belongs after [`SetRequestId`](super::SetRequestId) in the chain. Failures are logged
/// with their elapsed time and propagated unchanged.
pub struct RequestLogger;

impl RequestLogger {
    /// Creates a `RequestLogger` link.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Middleware for RequestLogger {
    fn name(&self) -> &str {
        "logger"
    }

    async fn handle(&self, request: HttpRequest, next: Next<'_>) -> Result<HttpResponse, GenericError> {
        let method = request.method().clone();
        let path = request.uri().path().to_string();
        let request_id = request.extensions().get::<RequestId>().map(|id| id.to_string());

        let start = Instant::now();
        let result = next.run(request).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        match &result {
            Ok(response) => info!(
                method = %method,
                path = %path,
                status = response.status().as_u16(),
                duration_ms,
                request_id = request_id.as_deref(),
                "Handled request."
            ),
            Err(e) => warn!(
                method = %method,
                path = %path,
                duration_ms,
                request_id = request_id.as_deref(),
                error = %e,
                "Request failed."
            ),
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use chassis_error::generic_error;
    use http::StatusCode;

    use crate::middleware::{handler_fn, text_response, Pipeline};

    use super::*;

    #[tokio::test]
    async fn responses_pass_through_unchanged() {
        let handler = handler_fn(|_request| async { Ok(text_response(StatusCode::CREATED, "made")) });
        let pipeline = Pipeline::new("test", handler, vec![Box::new(RequestLogger::new())]);

        let response = pipeline.handle(http::Request::new(Bytes::new())).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        use http_body_util::BodyExt as _;
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(bytes, Bytes::from_static(b"made"));
    }

    #[tokio::test]
    async fn errors_propagate_unchanged() {
        let handler = handler_fn(|_request| async { Err(generic_error!("backend exploded")) });
        let pipeline = Pipeline::new("test", handler, vec![Box::new(RequestLogger::new())]);

        let error = pipeline.handle(http::Request::new(Bytes::new())).await.unwrap_err();

        assert!(error.to_string().contains("backend exploded"));
    }
}
