use std::fmt;

use async_trait::async_trait;
use chassis_error::GenericError;
use http::{HeaderName, HeaderValue};
use uuid::Uuid;

use super::{HttpRequest, HttpResponse, Middleware, Next};

/// Identifier assigned to a request, stored in the request's extensions.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RequestId(String);

impl RequestId {
    /// Creates a `RequestId` from an existing identifier.
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self(id.into())
    }

    /// Generates a fresh random identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Ensures every request carries a request identifier.
///
/// The configured header names are tried in order; the first non-empty value wins, and a fresh
/// identifier is generated when none match. By default the identifier is only stored in the
/// request's extensions, where [`RequestLogger`][super::RequestLogger] and handlers can read it.
/// Mirroring onto the request headers (for in-process consumers downstream) and echoing on the
/// response are opt-in.
pub struct SetRequestId {
    header_names: Vec<HeaderName>,
    store_in_extensions: bool,
    mirror_on_request: bool,
    echo_on_response: bool,
}

impl SetRequestId {
    /// Creates a `SetRequestId` link with the default `X-Request-ID` header.
    pub fn new() -> Self {
        Self {
            header_names: vec![HeaderName::from_static("x-request-id")],
            store_in_extensions: true,
            mirror_on_request: false,
            echo_on_response: false,
        }
    }

    /// Sets the ordered list of inbound header names to consult.
    ///
    /// The first name doubles as the header written by mirroring and echoing. An empty list is
    /// ignored.
    pub fn with_header_names<I>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = HeaderName>,
    {
        let names = names.into_iter().collect::<Vec<_>>();
        if !names.is_empty() {
            self.header_names = names;
        }
        self
    }

    /// Disables storing the identifier in the request's extensions.
    pub fn without_extension(mut self) -> Self {
        self.store_in_extensions = false;
        self
    }

    /// Also writes the identifier onto the request's headers before running the chain.
    pub fn with_request_mirror(mut self) -> Self {
        self.mirror_on_request = true;
        self
    }

    /// Also writes the identifier onto the response.
    pub fn with_response_echo(mut self) -> Self {
        self.echo_on_response = true;
        self
    }

    fn lookup(&self, request: &HttpRequest) -> Option<RequestId> {
        self.header_names.iter().find_map(|name| {
            request
                .headers()
                .get(name)
                .and_then(|value| value.to_str().ok())
                .filter(|value| !value.is_empty())
                .map(RequestId::new)
        })
    }
}

#[async_trait]
impl Middleware for SetRequestId {
    fn name(&self) -> &str {
        "request_id"
    }

    async fn handle(&self, mut request: HttpRequest, next: Next<'_>) -> Result<HttpResponse, GenericError> {
        let id = self.lookup(&request).unwrap_or_else(RequestId::generate);

        if self.store_in_extensions {
            request.extensions_mut().insert(id.clone());
        }
        if self.mirror_on_request {
            if let (Some(name), Ok(value)) = (self.header_names.first(), HeaderValue::from_str(id.as_str())) {
                request.headers_mut().insert(name.clone(), value);
            }
        }

        let mut response = next.run(request).await?;

        if self.echo_on_response {
            if let (Some(name), Ok(value)) = (self.header_names.first(), HeaderValue::from_str(id.as_str())) {
                response.headers_mut().insert(name.clone(), value);
            }
        }

        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use http::StatusCode;

    use crate::middleware::{handler_fn, text_response, Pipeline};

    use super::*;

    fn pipeline_capturing_id(link: SetRequestId) -> Pipeline {
        let handler = handler_fn(|request: HttpRequest| async move {
            let id = request
                .extensions()
                .get::<RequestId>()
                .map(|id| id.as_str().to_string())
                .unwrap_or_default();
            Ok(text_response(StatusCode::OK, id))
        });
        Pipeline::new("test", handler, vec![Box::new(link)])
    }

    async fn body_string(response: HttpResponse) -> String {
        use http_body_util::BodyExt as _;

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn inbound_header_takes_precedence_over_generation() {
        let pipeline = pipeline_capturing_id(SetRequestId::new());

        let request = http::Request::builder()
            .header("X-Request-ID", "from-upstream")
            .body(Bytes::new())
            .unwrap();
        let response = pipeline.handle(request).await.unwrap();

        assert_eq!(body_string(response).await, "from-upstream");
    }

    #[tokio::test]
    async fn missing_header_generates_an_id() {
        let pipeline = pipeline_capturing_id(SetRequestId::new());

        let response = pipeline.handle(http::Request::new(Bytes::new())).await.unwrap();
        let id = body_string(response).await;

        assert!(!id.is_empty());
    }

    #[tokio::test]
    async fn header_names_are_consulted_in_order() {
        let link = SetRequestId::new().with_header_names([
            HeaderName::from_static("x-amzn-trace-id"),
            HeaderName::from_static("x-request-id"),
        ]);
        let pipeline = pipeline_capturing_id(link);

        let request = http::Request::builder()
            .header("X-Request-ID", "second-choice")
            .header("X-Amzn-Trace-Id", "first-choice")
            .body(Bytes::new())
            .unwrap();
        let response = pipeline.handle(request).await.unwrap();

        assert_eq!(body_string(response).await, "first-choice");
    }

    #[tokio::test]
    async fn response_echo_writes_the_primary_header() {
        let pipeline = pipeline_capturing_id(SetRequestId::new().with_response_echo());

        let request = http::Request::builder()
            .header("X-Request-ID", "echo-me")
            .body(Bytes::new())
            .unwrap();
        let response = pipeline.handle(request).await.unwrap();

        assert_eq!(response.headers().get("x-request-id").unwrap(), "echo-me");
    }

    #[tokio::test]
    async fn request_mirror_writes_the_header_for_downstream_links() {
        let handler = handler_fn(|request: HttpRequest| async move {
            let mirrored = request
                .headers()
                .get("x-request-id")
                .and_then(|value| value.to_str().ok())
                .unwrap_or_default()
                .to_string();
            Ok(text_response(StatusCode::OK, mirrored))
        });
        let pipeline = Pipeline::new(
            "test",
            handler,
            vec![Box::new(SetRequestId::new().with_request_mirror())],
        );

        let response = pipeline.handle(http::Request::new(Bytes::new())).await.unwrap();

        assert!(!body_string(response).await.is_empty());
    }
}
