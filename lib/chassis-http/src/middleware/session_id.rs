use std::fmt;

use async_trait::async_trait;
use chassis_error::GenericError;
use headers::{Cookie, HeaderMapExt as _};
use http::{header, HeaderName, HeaderValue};
use uuid::Uuid;

use super::{host_matches_wildcard, strip_port, HttpRequest, HttpResponse, Middleware, Next};

/// Identifier tying requests to a browser session, stored in the request's extensions.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SessionId(String);

impl SessionId {
    /// Creates a `SessionId` from an existing identifier.
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

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Decides which `Domain` attribute, if any, an issued session cookie carries.
///
/// Resolution order for a request host: the explicit remapping table first, then exact domain
/// entries, then `*.suffix` wildcard entries compared label by label in reverse on the
/// lowercased host. An empty policy issues host-only cookies.
#[derive(Default)]
pub struct DomainPolicy {
    remap: Vec<(String, String)>,
    domains: Vec<String>,
}

impl DomainPolicy {
    /// Creates an empty policy.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds domain entries.
    ///
    /// Entries are either exact hosts (`app.chassis.dev`) or wildcards (`*.chassis.dev`). A wildcard
    /// resolves to its bare suffix so the cookie covers every matching subdomain.
    pub fn with_domains<I, S>(mut self, domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.domains
            .extend(domains.into_iter().map(|domain| domain.into().to_ascii_lowercase()));
        self
    }

    /// Adds a remapping consulted before any domain entry.
    pub fn with_remapping<S, T>(mut self, from: S, to: T) -> Self
    where
        S: Into<String>,
        T: Into<String>,
    {
        self.remap.push((from.into().to_ascii_lowercase(), to.into()));
        self
    }

    /// Resolves the cookie domain for a request host, or `None` for a host-only cookie.
    pub fn resolve(&self, host: &str) -> Option<String> {
        let host = strip_port(host).to_ascii_lowercase();

        for (from, to) in &self.remap {
            if *from == host {
                return Some(to.clone());
            }
        }

        for domain in &self.domains {
            if !domain.starts_with("*.") && *domain == host {
                return Some(domain.clone());
            }
        }

        for domain in &self.domains {
            if let Some(suffix) = domain.strip_prefix("*.") {
                if host_matches_wildcard(&host, suffix) {
                    return Some(suffix.to_string());
                }
            }
        }

        None
    }
}

/// Ensures requests carry a session identifier, issuing one through a cookie when absent.
///
/// Lookup order is header, then cookie, then generation. The identifier lands in the request's
/// extensions either way; a `Set-Cookie` header is only written when the identifier was freshly
/// generated, with the `Domain` attribute resolved by the configured [`DomainPolicy`].
pub struct SetSessionId {
    header_name: HeaderName,
    cookie_name: String,
    generate_missing: bool,
    set_cookie: bool,
    domain_policy: DomainPolicy,
}

impl SetSessionId {
    /// Creates a `SetSessionId` link with the default `X-Session-ID` header and `session-id`
    /// cookie.
    pub fn new() -> Self {
        Self {
            header_name: HeaderName::from_static("x-session-id"),
            cookie_name: "session-id".to_string(),
            generate_missing: true,
            set_cookie: true,
            domain_policy: DomainPolicy::new(),
        }
    }

    /// Sets the inbound header name to consult before the cookie.
    pub fn with_header_name(mut self, name: HeaderName) -> Self {
        self.header_name = name;
        self
    }

    /// Sets the cookie name used for lookup and issuance.
    pub fn with_cookie_name<S: Into<String>>(mut self, name: S) -> Self {
        self.cookie_name = name.into();
        self
    }

    /// Disables generating an identifier when the request carries none.
    pub fn without_generation(mut self) -> Self {
        self.generate_missing = false;
        self
    }

    /// Disables issuing a cookie for freshly generated identifiers.
    pub fn without_cookie(mut self) -> Self {
        self.set_cookie = false;
        self
    }

    /// Sets the policy deciding the issued cookie's `Domain` attribute.
    pub fn with_domain_policy(mut self, policy: DomainPolicy) -> Self {
        self.domain_policy = policy;
        self
    }

    fn lookup(&self, request: &HttpRequest) -> Option<SessionId> {
        let from_header = request
            .headers()
            .get(&self.header_name)
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.is_empty())
            .map(SessionId::new);

        from_header.or_else(|| {
            request
                .headers()
                .typed_get::<Cookie>()
                .and_then(|cookie| cookie.get(&self.cookie_name).map(SessionId::new))
        })
    }
}

#[async_trait]
impl Middleware for SetSessionId {
    fn name(&self) -> &str {
        "session_id"
    }

    async fn handle(&self, mut request: HttpRequest, next: Next<'_>) -> Result<HttpResponse, GenericError> {
        let (id, generated) = match self.lookup(&request) {
            Some(id) => (id, false),
            None if self.generate_missing => (SessionId::generate(), true),
            None => return next.run(request).await,
        };

        request.extensions_mut().insert(id.clone());

        let host = request
            .headers()
            .get(header::HOST)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.to_string());

        let mut response = next.run(request).await?;

        if generated && self.set_cookie {
            let mut cookie = format!("{}={}; Path=/; HttpOnly", self.cookie_name, id.as_str());
            if let Some(domain) = host.as_deref().and_then(|host| self.domain_policy.resolve(host)) {
                cookie.push_str("; Domain=");
                cookie.push_str(&domain);
            }
            if let Ok(value) = HeaderValue::from_str(&cookie) {
                response.headers_mut().append(header::SET_COOKIE, value);
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

    fn pipeline_capturing_id(link: SetSessionId) -> Pipeline {
        let handler = handler_fn(|request: HttpRequest| async move {
            let id = request
                .extensions()
                .get::<SessionId>()
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

    fn set_cookie_header(response: &HttpResponse) -> Option<String> {
        response
            .headers()
            .get(header::SET_COOKIE)
            .map(|value| value.to_str().unwrap().to_string())
    }

    #[tokio::test]
    async fn header_takes_precedence_over_cookie() {
        let pipeline = pipeline_capturing_id(SetSessionId::new());

        let request = http::Request::builder()
            .header("X-Session-ID", "from-header")
            .header("Cookie", "session-id=from-cookie")
            .body(Bytes::new())
            .unwrap();
        let response = pipeline.handle(request).await.unwrap();

        assert_eq!(body_string(response).await, "from-header");
    }

    #[tokio::test]
    async fn cookie_is_used_when_header_is_absent() {
        let pipeline = pipeline_capturing_id(SetSessionId::new());

        let request = http::Request::builder()
            .header("Cookie", "other=1; session-id=from-cookie")
            .body(Bytes::new())
            .unwrap();
        let response = pipeline.handle(request).await.unwrap();

        let body = body_string(response).await;
        assert_eq!(body, "from-cookie");
    }

    #[tokio::test]
    async fn generated_id_is_issued_as_a_cookie() {
        let pipeline = pipeline_capturing_id(SetSessionId::new());

        let response = pipeline.handle(http::Request::new(Bytes::new())).await.unwrap();

        let cookie = set_cookie_header(&response).unwrap();
        assert!(cookie.starts_with("session-id="));
        assert!(cookie.contains("Path=/"));
        assert!(cookie.contains("HttpOnly"));
    }

    #[tokio::test]
    async fn existing_id_does_not_reissue_the_cookie() {
        let pipeline = pipeline_capturing_id(SetSessionId::new());

        let request = http::Request::builder()
            .header("Cookie", "session-id=existing")
            .body(Bytes::new())
            .unwrap();
        let response = pipeline.handle(request).await.unwrap();

        assert!(set_cookie_header(&response).is_none());
    }

    #[tokio::test]
    async fn wildcard_domain_policy_sets_the_cookie_domain() {
        let policy = DomainPolicy::new().with_domains(["*.chassis.dev"]);
        let pipeline = pipeline_capturing_id(SetSessionId::new().with_domain_policy(policy));

        let request = http::Request::builder()
            .header("Host", "www.chassis.dev")
            .body(Bytes::new())
            .unwrap();
        let response = pipeline.handle(request).await.unwrap();

        let cookie = set_cookie_header(&response).unwrap();
        assert!(cookie.contains("Domain=chassis.dev"));
    }

    #[tokio::test]
    async fn without_generation_passes_anonymous_requests_through() {
        let pipeline = pipeline_capturing_id(SetSessionId::new().without_generation());

        let response = pipeline.handle(http::Request::new(Bytes::new())).await.unwrap();

        assert!(set_cookie_header(&response).is_none());
        assert_eq!(body_string(response).await, "");
    }

    #[test]
    fn remapping_is_consulted_before_domains() {
        let policy = DomainPolicy::new()
            .with_domains(["*.chassis.dev"])
            .with_remapping("www.chassis.dev", "override.example");

        assert_eq!(policy.resolve("www.chassis.dev").as_deref(), Some("override.example"));
        assert_eq!(policy.resolve("api.chassis.dev").as_deref(), Some("chassis.dev"));
    }

    #[test]
    fn exact_domains_win_over_wildcards() {
        let policy = DomainPolicy::new().with_domains(["app.chassis.dev", "*.chassis.dev"]);

        assert_eq!(policy.resolve("app.chassis.dev").as_deref(), Some("app.chassis.dev"));
        assert_eq!(policy.resolve("app.chassis.dev:8443").as_deref(), Some("app.chassis.dev"));
        assert_eq!(policy.resolve("FOO.chassis.dev").as_deref(), Some("chassis.dev"));
        assert_eq!(policy.resolve("unrelated.example"), None);
    }
}
