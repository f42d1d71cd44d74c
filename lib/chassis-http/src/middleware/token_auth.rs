use async_trait::async_trait;
use chassis_error::{generic_error, GenericError};
use http::{header, StatusCode};
use tracing::{debug, warn};

use super::{text_response, HttpRequest, HttpResponse, Middleware, Next};

/// Validates a bearer token, returning an error describing why it was rejected.
pub type TokenValidator = Box<dyn Fn(&str) -> Result<(), GenericError> + Send + Sync>;

/// Bearer token authentication.
///
/// Reads the `Authorization` header, strips a `Bearer ` prefix when present, and hands the
/// token to the validator. Requests without a token, or with a token the validator rejects,
/// are answered with `401 Unauthorized` without running the rest of the chain.
pub struct TokenAuth {
    validator: TokenValidator,
}

impl TokenAuth {
    /// Creates a `TokenAuth` link with a custom validator.
    pub fn new<F>(validator: F) -> Self
    where
        F: Fn(&str) -> Result<(), GenericError> + Send + Sync + 'static,
    {
        Self {
            validator: Box::new(validator),
        }
    }

    /// Creates a `TokenAuth` link that accepts a single static token.
    pub fn with_static_token<S: Into<String>>(token: S) -> Self {
        let expected = token.into();
        Self::new(move |token| {
            if token == expected {
                Ok(())
            } else {
                Err(generic_error!("token mismatch"))
            }
        })
    }
}

#[async_trait]
impl Middleware for TokenAuth {
    fn name(&self) -> &str {
        "token_auth"
    }

    async fn handle(&self, request: HttpRequest, next: Next<'_>) -> Result<HttpResponse, GenericError> {
        let raw = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok());

        let token = match raw {
            Some(raw) => raw.strip_prefix("Bearer ").unwrap_or(raw),
            None => {
                debug!(path = request.uri().path(), "Rejecting request without authorization token.");
                return Ok(text_response(StatusCode::UNAUTHORIZED, "Unauthorized"));
            }
        };

        if let Err(e) = (self.validator)(token) {
            warn!(path = request.uri().path(), error = %e, "Rejecting request with invalid authorization token.");
            return Ok(text_response(StatusCode::UNAUTHORIZED, "Unauthorized"));
        }

        next.run(request).await
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use crate::middleware::{handler_fn, Pipeline};

    use super::*;

    fn pipeline(auth: TokenAuth) -> Pipeline {
        let handler = handler_fn(|_request| async { Ok(text_response(StatusCode::OK, "granted")) });
        Pipeline::new("test", handler, vec![Box::new(auth)])
    }

    fn request_with_authorization(value: &str) -> HttpRequest {
        http::Request::builder()
            .header(header::AUTHORIZATION, value)
            .body(Bytes::new())
            .unwrap()
    }

    #[tokio::test]
    async fn missing_token_is_rejected() {
        let pipeline = pipeline(TokenAuth::with_static_token("sesame"));

        let response = pipeline.handle(http::Request::new(Bytes::new())).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        use http_body_util::BodyExt as _;
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(bytes, Bytes::from_static(b"Unauthorized"));
    }

    #[tokio::test]
    async fn wrong_token_is_rejected() {
        let pipeline = pipeline(TokenAuth::with_static_token("sesame"));

        let response = pipeline
            .handle(request_with_authorization("Bearer barley"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn valid_token_reaches_the_handler() {
        let pipeline = pipeline(TokenAuth::with_static_token("sesame"));

        let response = pipeline
            .handle(request_with_authorization("Bearer sesame"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        use http_body_util::BodyExt as _;
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(bytes, Bytes::from_static(b"granted"));
    }

    #[tokio::test]
    async fn raw_token_without_bearer_prefix_is_accepted() {
        let pipeline = pipeline(TokenAuth::with_static_token("sesame"));

        let response = pipeline.handle(request_with_authorization("sesame")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn custom_validators_see_the_stripped_token() {
        let pipeline = pipeline(TokenAuth::new(|token| {
            if token.starts_with("svc-") {
                Ok(())
            } else {
                Err(generic_error!("not a service token"))
            }
        }));

        let accepted = pipeline
            .handle(request_with_authorization("Bearer svc-uptime"))
            .await
            .unwrap();
        assert_eq!(accepted.status(), StatusCode::OK);

        let rejected = pipeline
            .handle(request_with_authorization("Bearer user-uptime"))
            .await
            .unwrap();
        assert_eq!(rejected.status(), StatusCode::UNAUTHORIZED);
    }
}
