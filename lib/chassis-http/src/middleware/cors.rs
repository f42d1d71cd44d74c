use std::time::Duration;

use async_trait::async_trait;
use chassis_error::GenericError;
use http::{header, HeaderName, HeaderValue, Method, StatusCode};
use regex::Regex;
use tracing::warn;

use super::{host_matches_wildcard, strip_port, text_response, HttpRequest, HttpResponse, Middleware, Next};

/// One entry from the allow-origin list, parsed at construction time.
enum OriginPattern {
    /// `*`: any origin.
    Any,
    /// A full origin, compared lowercased.
    Exact(String),
    /// `[scheme://]*.domain`: any subdomain of `domain`, optionally pinned to a scheme.
    Subdomain { scheme: Option<String>, suffix: String },
    /// Any other pattern containing `*` or `?`, compiled to an anchored regex.
    Glob(Regex),
}

fn parse_origin_pattern(raw: &str) -> Option<OriginPattern> {
    let pattern = raw.trim().to_ascii_lowercase();
    if pattern.is_empty() {
        return None;
    }
    if pattern == "*" {
        return Some(OriginPattern::Any);
    }

    let (scheme, host) = match pattern.split_once("://") {
        Some((scheme, host)) => (Some(scheme), host),
        None => (None, pattern.as_str()),
    };
    if let Some(suffix) = host.strip_prefix("*.") {
        if !suffix.contains(['*', '?']) {
            return Some(OriginPattern::Subdomain {
                scheme: scheme.map(|scheme| scheme.to_string()),
                suffix: suffix.to_string(),
            });
        }
    }

    if pattern.contains(['*', '?']) {
        return match glob_to_regex(&pattern) {
            Some(regex) => Some(OriginPattern::Glob(regex)),
            None => {
                warn!(pattern = %raw, "Ignoring unparseable origin pattern.");
                None
            }
        };
    }

    Some(OriginPattern::Exact(pattern))
}

fn glob_to_regex(pattern: &str) -> Option<Regex> {
    let mut expr = String::with_capacity(pattern.len() + 2);
    expr.push('^');
    for c in pattern.chars() {
        match c {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            c => {
                let mut buf = [0; 4];
                expr.push_str(&regex::escape(c.encode_utf8(&mut buf)));
            }
        }
    }
    expr.push('$');
    Regex::new(&expr).ok()
}

/// The value to send back in `Access-Control-Allow-Origin`.
enum AllowOrigin {
    Star,
    Echo,
}

/// Cross-origin resource sharing.
///
/// The allow-origin value for a request is resolved in order: exact entries, `*`, subdomain
/// wildcards (`https://*.chassis.dev`, scheme checked when present, labels compared in reverse),
/// then general glob patterns. Preflight requests are answered directly without running the rest
/// of the chain; simple requests run the chain and are decorated on the way out. Every response
/// the link touches carries `Vary: Origin`.
pub struct Cors {
    patterns: Vec<OriginPattern>,
    allow_credentials: bool,
    methods_value: Option<HeaderValue>,
    headers_value: Option<HeaderValue>,
    expose_value: Option<HeaderValue>,
    max_age_value: Option<HeaderValue>,
}

impl Cors {
    /// Creates a `Cors` link from an allow-origin list.
    ///
    /// The default allowed methods are `GET`, `HEAD`, `POST`, `PUT`, `PATCH`, `DELETE` and
    /// `OPTIONS`; allowed headers default to echoing whatever the preflight asked for.
    pub fn new<I, S>(allowed_origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = allowed_origins
            .into_iter()
            .filter_map(|pattern| parse_origin_pattern(pattern.as_ref()))
            .collect();

        Self {
            patterns,
            allow_credentials: false,
            methods_value: join_to_header_value([
                Method::GET.as_str(),
                Method::HEAD.as_str(),
                Method::POST.as_str(),
                Method::PUT.as_str(),
                Method::PATCH.as_str(),
                Method::DELETE.as_str(),
                Method::OPTIONS.as_str(),
            ]),
            headers_value: None,
            expose_value: None,
            max_age_value: None,
        }
    }

    /// Sets the methods advertised on preflight responses.
    pub fn with_allowed_methods<I>(mut self, methods: I) -> Self
    where
        I: IntoIterator<Item = Method>,
    {
        let methods = methods.into_iter().collect::<Vec<_>>();
        self.methods_value = join_to_header_value(methods.iter().map(Method::as_str));
        self
    }

    /// Sets the headers advertised on preflight responses.
    ///
    /// Without this, preflight responses echo the headers the request asked for.
    pub fn with_allowed_headers<I>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = HeaderName>,
    {
        let headers = headers.into_iter().collect::<Vec<_>>();
        self.headers_value = join_to_header_value(headers.iter().map(HeaderName::as_str));
        self
    }

    /// Sets the headers exposed to cross-origin callers on simple responses.
    pub fn with_exposed_headers<I>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = HeaderName>,
    {
        let headers = headers.into_iter().collect::<Vec<_>>();
        self.expose_value = join_to_header_value(headers.iter().map(HeaderName::as_str));
        self
    }

    /// Allows credentialed requests.
    ///
    /// With credentials enabled, a `*` entry echoes the request origin instead of the literal
    /// wildcard, since browsers reject the combination.
    pub fn with_credentials(mut self) -> Self {
        self.allow_credentials = true;
        self
    }

    /// Sets how long browsers may cache preflight results.
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age_value = HeaderValue::from_str(&max_age.as_secs().to_string()).ok();
        self
    }

    fn resolve(&self, origin: &str) -> Option<AllowOrigin> {
        let origin_lower = origin.to_ascii_lowercase();
        let (origin_scheme, origin_host) = match origin_lower.split_once("://") {
            Some((scheme, host)) => (Some(scheme), host),
            None => (None, origin_lower.as_str()),
        };
        let origin_host = strip_port(origin_host);

        let exact_match = self.patterns.iter().any(|pattern| match pattern {
            OriginPattern::Exact(exact) => *exact == origin_lower,
            _ => false,
        });
        if exact_match {
            return Some(AllowOrigin::Echo);
        }

        if self.patterns.iter().any(|pattern| matches!(pattern, OriginPattern::Any)) {
            return Some(if self.allow_credentials {
                AllowOrigin::Echo
            } else {
                AllowOrigin::Star
            });
        }

        for pattern in &self.patterns {
            if let OriginPattern::Subdomain { scheme, suffix } = pattern {
                let scheme_matches = match scheme {
                    Some(scheme) => origin_scheme == Some(scheme.as_str()),
                    None => true,
                };
                if scheme_matches && host_matches_wildcard(origin_host, suffix) {
                    return Some(AllowOrigin::Echo);
                }
            }
        }

        for pattern in &self.patterns {
            if let OriginPattern::Glob(regex) = pattern {
                if regex.is_match(&origin_lower) {
                    return Some(AllowOrigin::Echo);
                }
            }
        }

        None
    }

    fn allow_origin_value(&self, allow: &AllowOrigin, origin: &str) -> Option<HeaderValue> {
        match allow {
            AllowOrigin::Star => Some(HeaderValue::from_static("*")),
            AllowOrigin::Echo => HeaderValue::from_str(origin).ok(),
        }
    }
}

#[async_trait]
impl Middleware for Cors {
    fn name(&self) -> &str {
        "cors"
    }

    async fn handle(&self, request: HttpRequest, next: Next<'_>) -> Result<HttpResponse, GenericError> {
        let origin = match request.headers().get(header::ORIGIN).and_then(|value| value.to_str().ok()) {
            Some(origin) => origin.to_string(),
            // Same-origin requests are none of our business.
            None => return next.run(request).await,
        };

        let allowed = self.resolve(&origin);

        let is_preflight = request.method() == Method::OPTIONS
            && request.headers().contains_key(header::ACCESS_CONTROL_REQUEST_METHOD);

        if is_preflight {
            let mut response = text_response(StatusCode::NO_CONTENT, "");
            if let Some(value) = allowed.as_ref().and_then(|allow| self.allow_origin_value(allow, &origin)) {
                let headers = response.headers_mut();
                headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, value);
                if self.allow_credentials {
                    headers.insert(header::ACCESS_CONTROL_ALLOW_CREDENTIALS, HeaderValue::from_static("true"));
                }
                if let Some(methods) = &self.methods_value {
                    headers.insert(header::ACCESS_CONTROL_ALLOW_METHODS, methods.clone());
                }
                let allow_headers = self
                    .headers_value
                    .clone()
                    .or_else(|| request.headers().get(header::ACCESS_CONTROL_REQUEST_HEADERS).cloned());
                if let Some(allow_headers) = allow_headers {
                    headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, allow_headers);
                }
                if let Some(max_age) = &self.max_age_value {
                    headers.insert(header::ACCESS_CONTROL_MAX_AGE, max_age.clone());
                }
            }
            response
                .headers_mut()
                .append(header::VARY, HeaderValue::from_static("Origin"));
            return Ok(response);
        }

        let mut response = next.run(request).await?;

        if let Some(value) = allowed.as_ref().and_then(|allow| self.allow_origin_value(allow, &origin)) {
            let headers = response.headers_mut();
            headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, value);
            if self.allow_credentials {
                headers.insert(header::ACCESS_CONTROL_ALLOW_CREDENTIALS, HeaderValue::from_static("true"));
            }
            if let Some(expose) = &self.expose_value {
                headers.insert(header::ACCESS_CONTROL_EXPOSE_HEADERS, expose.clone());
            }
        }
        response
            .headers_mut()
            .append(header::VARY, HeaderValue::from_static("Origin"));

        Ok(response)
    }
}

fn join_to_header_value<I, S>(items: I) -> Option<HeaderValue>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let joined = items
        .into_iter()
        .map(|item| item.as_ref().to_string())
        .collect::<Vec<_>>()
        .join(", ");
    if joined.is_empty() {
        None
    } else {
        HeaderValue::from_str(&joined).ok()
    }
}
