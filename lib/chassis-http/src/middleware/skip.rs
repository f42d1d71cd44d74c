use async_trait::async_trait;
use chassis_error::GenericError;

use super::{HttpRequest, HttpResponse, Middleware, Next};

/// Conditionally bypasses a wrapped link.
///
/// When the predicate matches a request, the wrapped link is not run at all and the request
/// goes straight to the remainder of the chain. Typical use is keeping health or metrics
/// endpoints out of access logs and authentication.
pub struct Skip<M> {
    name: String,
    link: M,
    predicate: Box<dyn Fn(&HttpRequest) -> bool + Send + Sync>,
}

impl<M: Middleware> Skip<M> {
    /// Wraps `link`, bypassing it whenever `predicate` returns `true`.
    pub fn new<F>(link: M, predicate: F) -> Self
    where
        F: Fn(&HttpRequest) -> bool + Send + Sync + 'static,
    {
        Self {
            name: format!("skip({})", link.name()),
            link,
            predicate: Box::new(predicate),
        }
    }

    /// Wraps `link`, bypassing it for requests whose path starts with any of the given prefixes.
    pub fn path_prefixes<I, S>(link: M, prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let prefixes = prefixes.into_iter().map(Into::into).collect::<Vec<_>>();
        Self::new(link, move |request| {
            prefixes.iter().any(|prefix| request.uri().path().starts_with(prefix))
        })
    }
}

#[async_trait]
impl<M: Middleware> Middleware for Skip<M> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, request: HttpRequest, next: Next<'_>) -> Result<HttpResponse, GenericError> {
        if (self.predicate)(&request) {
            next.run(request).await
        } else {
            self.link.handle(request, next).await
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use http::{HeaderValue, StatusCode};

    use crate::middleware::{handler_fn, text_response, Pipeline};

    use super::*;

    struct Tagger;

    #[async_trait]
    impl Middleware for Tagger {
        fn name(&self) -> &str {
            "tagger"
        }

        async fn handle(&self, request: HttpRequest, next: Next<'_>) -> Result<HttpResponse, GenericError> {
            let mut response = next.run(request).await?;
            response
                .headers_mut()
                .insert("x-tagged", HeaderValue::from_static("yes"));
            Ok(response)
        }
    }

    fn pipeline(skip: Skip<Tagger>) -> Pipeline {
        let handler = handler_fn(|_request| async { Ok(text_response(StatusCode::OK, "ok")) });
        Pipeline::new("test", handler, vec![Box::new(skip)])
    }

    fn get(path: &str) -> HttpRequest {
        http::Request::builder().uri(path).body(Bytes::new()).unwrap()
    }

    #[tokio::test]
    async fn matching_requests_bypass_the_wrapped_link() {
        let pipeline = pipeline(Skip::path_prefixes(Tagger, ["/healthz"]));

        let response = pipeline.handle(get("/healthz/ready")).await.unwrap();

        assert!(!response.headers().contains_key("x-tagged"));
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn non_matching_requests_run_the_wrapped_link() {
        let pipeline = pipeline(Skip::path_prefixes(Tagger, ["/healthz"]));

        let response = pipeline.handle(get("/api/things")).await.unwrap();

        assert_eq!(
            response.headers().get("x-tagged").map(|value| value.to_str().unwrap()),
            Some("yes")
        );
    }

    #[tokio::test]
    async fn the_name_reports_the_wrapped_link() {
        let skip = Skip::new(Tagger, |_request| false);

        assert_eq!(skip.name(), "skip(tagger)");
    }
}
