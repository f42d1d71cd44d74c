use async_trait::async_trait;
use chassis_error::GenericError;
use http::{HeaderName, HeaderValue};
use tracing::debug;

use super::{ClientRequest, ClientResponse, RoundTripware, TransportNext};
use crate::middleware::RequestId;

/// Propagates a request id onto outbound requests.
///
/// When the header is already present it is left alone. Otherwise, if a [`RequestId`] extension
/// is attached to the request, such as one forwarded from an inbound request, its value is
/// written. Requests with neither pass through untouched.
///
/// Place this hop before a [`Retry`][super::Retry] hop, so the header lands on the original
/// request and every attempt carries it.
pub struct RequestIdTripware {
    header_name: HeaderName,
}

impl RequestIdTripware {
    /// Creates a `RequestIdTripware` writing the `X-Request-ID` header.
    pub fn new() -> Self {
        Self {
            header_name: HeaderName::from_static("x-request-id"),
        }
    }

    /// Sets the header the id is written to.
    pub fn with_header_name(mut self, header_name: HeaderName) -> Self {
        self.header_name = header_name;
        self
    }
}

#[async_trait]
impl RoundTripware for RequestIdTripware {
    fn name(&self) -> &str {
        "request_id"
    }

    async fn round_trip(
        &self, mut request: ClientRequest, next: TransportNext<'_>,
    ) -> Result<ClientResponse, GenericError> {
        if !request.headers().contains_key(&self.header_name) {
            if let Some(id) = request.extensions().get::<RequestId>() {
                match HeaderValue::from_str(id.as_str()) {
                    Ok(value) => {
                        request.headers_mut().insert(self.header_name.clone(), value);
                    }
                    Err(_) => debug!("Dropping request id that is not a valid header value."),
                }
            }
        }

        next.run(request).await
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use http::{Request, Response, StatusCode};

    use crate::client::{buffered_body, transport_fn, HttpClient};

    use super::*;

    fn client_capturing_header() -> HttpClient {
        HttpClient::builder()
            .with_round_tripware(RequestIdTripware::new())
            .with_transport(transport_fn(|request: ClientRequest| async move {
                let seen = request
                    .headers()
                    .get("x-request-id")
                    .map(|value| value.to_str().unwrap().to_string())
                    .unwrap_or_default();
                Ok(Response::builder()
                    .status(StatusCode::OK)
                    .body(buffered_body(Bytes::from(seen)))
                    .unwrap())
            }))
            .build()
            .unwrap()
    }

    async fn body_string(response: ClientResponse) -> String {
        use http_body_util::BodyExt as _;

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn an_attached_extension_becomes_the_header() {
        let client = client_capturing_header();

        let mut request = Request::new(Bytes::new());
        request.extensions_mut().insert(RequestId::new("req-42"));
        let response = client.send(request).await.unwrap();

        assert_eq!(body_string(response).await, "req-42");
    }

    #[tokio::test]
    async fn an_existing_header_wins_over_the_extension() {
        let client = client_capturing_header();

        let mut request = Request::builder()
            .header("x-request-id", "from-header")
            .body(Bytes::new())
            .unwrap();
        request.extensions_mut().insert(RequestId::new("from-extension"));
        let response = client.send(request).await.unwrap();

        assert_eq!(body_string(response).await, "from-header");
    }

    #[tokio::test]
    async fn requests_without_an_id_pass_through_untouched() {
        let client = client_capturing_header();

        let response = client.send(Request::new(Bytes::new())).await.unwrap();

        assert_eq!(body_string(response).await, "");
    }
}
