use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Url;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::InterceptError;
use crate::resilience::{send_with_retry, ResilienceProfile, RetryConfig};

/// HTTP method set understood by scopes and selectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
}

impl HttpMethod {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
            Self::Head => "HEAD",
            Self::Options => "OPTIONS",
        }
    }
}

impl Display for HttpMethod {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HttpMethod {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_uppercase().as_str() {
            "GET" => Ok(Self::Get),
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "PATCH" => Ok(Self::Patch),
            "DELETE" => Ok(Self::Delete),
            "HEAD" => Ok(Self::Head),
            "OPTIONS" => Ok(Self::Options),
            other => Err(format!("unsupported http method '{other}'")),
        }
    }
}

/// Structured URL form; rendered as `base_url + path + ?query`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UrlParts {
    pub base_url: String,
    pub path: String,
    pub query: Vec<(String, String)>,
}

impl UrlParts {
    pub fn render(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        let mut url = if self.path.is_empty() {
            String::from(base)
        } else if self.path.starts_with('/') {
            format!("{base}{}", self.path)
        } else {
            format!("{base}/{}", self.path)
        };

        if !self.query.is_empty() {
            let encoded = self
                .query
                .iter()
                .map(|(name, value)| {
                    format!("{}={}", urlencoding::encode(name), urlencoding::encode(value))
                })
                .collect::<Vec<_>>()
                .join("&");
            url.push('?');
            url.push_str(&encoded);
        }
        url
    }
}

/// Correlation identifiers propagated across a logical operation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Correlation {
    pub correlation_id: Option<String>,
    pub causation_id: Option<String>,
}

/// Caller identity attached to a request (agent name plus free-form attributes).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AgentContext {
    pub agent: Option<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

/// Outbound request shape shared with the host HTTP client.
///
/// Interceptors mutate `headers`, the query (through either URL form) and
/// `resilience` before the host sends it.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequestOptions {
    pub method: HttpMethod,
    pub url: Option<String>,
    pub url_parts: Option<UrlParts>,
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
    pub operation: Option<String>,
    pub correlation: Correlation,
    pub agent_context: AgentContext,
    pub extensions: BTreeMap<String, String>,
    pub resilience: Option<ResilienceProfile>,
}

impl HttpRequestOptions {
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: Some(url.into()),
            url_parts: None,
            headers: BTreeMap::new(),
            body: None,
            operation: None,
            correlation: Correlation::default(),
            agent_context: AgentContext::default(),
            extensions: BTreeMap::new(),
            resilience: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, url)
    }

    pub fn with_url_parts(method: HttpMethod, parts: UrlParts) -> Self {
        Self {
            url: None,
            url_parts: Some(parts),
            ..Self::new(method, String::new())
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.into().to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }

    pub fn with_extension(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extensions.insert(name.into(), value.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent_context.agent = Some(agent.into());
        self
    }

    pub fn with_query_param(mut self, name: &str, value: impl Into<String>) -> Self {
        let mut pairs = self.query_pairs();
        pairs.push((name.to_string(), value.into()));
        self.set_query_pairs(pairs);
        self
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get("content-type").map(String::as_str)
    }

    /// Full URL regardless of which form the request was built with.
    pub fn resolved_url(&self) -> Option<String> {
        match (&self.url, &self.url_parts) {
            (Some(url), _) if !url.is_empty() => Some(url.clone()),
            (_, Some(parts)) => Some(parts.render()),
            _ => None,
        }
    }

    /// Decoded query pairs in order, repeated names included.
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        if let Some(url) = self.url.as_deref().filter(|url| !url.is_empty()) {
            return Url::parse(url)
                .map(|parsed| {
                    parsed
                        .query_pairs()
                        .map(|(name, value)| (name.into_owned(), value.into_owned()))
                        .collect()
                })
                .unwrap_or_default();
        }

        self.url_parts
            .as_ref()
            .map(|parts| parts.query.clone())
            .unwrap_or_default()
    }

    /// Replaces the whole query on whichever URL form is in use.
    pub fn set_query_pairs(&mut self, pairs: Vec<(String, String)>) {
        if let Some(url) = self.url.as_deref().filter(|url| !url.is_empty()) {
            if let Ok(mut parsed) = Url::parse(url) {
                if pairs.is_empty() {
                    parsed.set_query(None);
                } else {
                    parsed.query_pairs_mut().clear().extend_pairs(pairs.iter());
                }
                self.url = Some(parsed.to_string());
            }
            return;
        }

        if let Some(parts) = self.url_parts.as_mut() {
            parts.query = pairs;
        }
    }

    /// Sets `name` to a single value, replacing every existing occurrence in place.
    pub fn set_query_param(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        let mut pairs = self.query_pairs();
        let mut replaced = false;
        pairs.retain_mut(|(key, current)| {
            if key != name {
                return true;
            }
            if replaced {
                return false;
            }
            *current = value.clone();
            replaced = true;
            true
        });
        if !replaced {
            pairs.push((name.to_string(), value));
        }
        self.set_query_pairs(pairs);
    }
}

/// Raw HTTP response returned by the host transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
            body: body.into(),
        }
    }

    pub fn ok_json(body: impl Into<String>) -> Self {
        Self::new(200, body)
    }

    pub const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, HttpError> {
        serde_json::from_str(&self.body).map_err(|error| {
            HttpError::with_kind(HttpErrorKind::Decode, format!("invalid json body: {error}"))
        })
    }
}

/// Failure classification for [`HttpError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpErrorKind {
    Transport,
    Timeout,
    Connect,
    Decode,
    Aborted,
    Rejected,
}

/// Transport-level HTTP error.
///
/// Errors produced by interceptors keep the typed rejection so callers can tell
/// a policy denial from a guardrail violation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpError {
    message: String,
    retryable: bool,
    kind: HttpErrorKind,
    rejection: Option<Box<InterceptError>>,
}

impl HttpError {
    pub fn new(message: impl Into<String>) -> Self {
        Self::with_kind(HttpErrorKind::Transport, message)
    }

    pub fn with_kind(kind: HttpErrorKind, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: matches!(
                kind,
                HttpErrorKind::Transport | HttpErrorKind::Timeout | HttpErrorKind::Connect
            ),
            kind,
            rejection: None,
        }
    }

    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self {
            retryable: false,
            ..Self::new(message)
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub const fn retryable(&self) -> bool {
        self.retryable
    }

    pub const fn kind(&self) -> HttpErrorKind {
        self.kind
    }

    pub fn rejection(&self) -> Option<&InterceptError> {
        self.rejection.as_deref()
    }
}

impl From<InterceptError> for HttpError {
    fn from(error: InterceptError) -> Self {
        let kind = match error {
            InterceptError::Aborted => HttpErrorKind::Aborted,
            _ => HttpErrorKind::Rejected,
        };
        Self {
            message: error.to_string(),
            retryable: false,
            kind,
            rejection: Some(Box::new(error)),
        }
    }
}

impl Display for HttpError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for HttpError {}

pub type HttpFuture<'a> =
    Pin<Box<dyn Future<Output = Result<HttpResponse, HttpError>> + Send + 'a>>;

/// Host transport contract. Tollgate never sends bytes itself.
pub trait HttpClient: Send + Sync {
    /// Name used as `client_name` in scopes.
    fn client_name(&self) -> &str;

    fn request_raw<'a>(&'a self, request: HttpRequestOptions) -> HttpFuture<'a>;
}

/// Typed convenience on top of [`HttpClient::request_raw`].
pub trait HttpClientExt: HttpClient {
    fn request_json<'a, T>(
        &'a self,
        request: HttpRequestOptions,
    ) -> Pin<Box<dyn Future<Output = Result<T, HttpError>> + Send + 'a>>
    where
        T: DeserializeOwned + Send + 'a,
    {
        Box::pin(async move {
            let response = self.request_raw(request).await?;
            if !response.is_success() {
                return Err(HttpError::non_retryable(format!(
                    "upstream returned status {}",
                    response.status
                )));
            }
            response.json()
        })
    }
}

impl<C: HttpClient + ?Sized> HttpClientExt for C {}

impl<C: HttpClient + ?Sized> HttpClient for Arc<C> {
    fn client_name(&self) -> &str {
        (**self).client_name()
    }

    fn request_raw<'a>(&'a self, request: HttpRequestOptions) -> HttpFuture<'a> {
        (**self).request_raw(request)
    }
}

/// Default no-op transport for deterministic offline tests.
#[derive(Debug, Default)]
pub struct NoopHttpClient;

impl HttpClient for NoopHttpClient {
    fn client_name(&self) -> &str {
        "noop"
    }

    fn request_raw<'a>(&'a self, request: HttpRequestOptions) -> HttpFuture<'a> {
        let _ = request;
        Box::pin(async move { Ok(HttpResponse::ok_json("{}")) })
    }
}

/// Production HTTP client using reqwest for real API calls.
///
/// Requests carrying a [`ResilienceProfile`] use its timeout and retry
/// settings; others use the client defaults, which never retry.
#[derive(Debug, Clone)]
pub struct ReqwestHttpClient {
    name: String,
    client: Arc<reqwest::Client>,
    default_timeout_ms: u64,
    default_retry: RetryConfig,
}

impl ReqwestHttpClient {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            client: Arc::new(
                reqwest::Client::builder()
                    .user_agent("tollgate/0.1.0")
                    .build()
                    .unwrap_or_else(|_| reqwest::Client::new()),
            ),
            default_timeout_ms: 10_000,
            default_retry: RetryConfig::no_retry(),
        }
    }

    pub fn with_client(name: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            client: Arc::new(client),
            ..Self::new(name)
        }
    }

    pub fn with_default_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.default_timeout_ms = timeout_ms;
        self
    }

    pub fn with_default_retry(mut self, retry: RetryConfig) -> Self {
        self.default_retry = retry;
        self
    }

    async fn send_once(
        &self,
        request: &HttpRequestOptions,
        url: &str,
        method: reqwest::Method,
        timeout: Duration,
    ) -> Result<HttpResponse, HttpError> {
        let mut builder = self.client.request(method, url).timeout(timeout);

        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                HttpError::with_kind(HttpErrorKind::Timeout, format!("request timeout: {e}"))
            } else if e.is_connect() {
                HttpError::with_kind(HttpErrorKind::Connect, format!("connection failed: {e}"))
            } else {
                HttpError::new(format!("request failed: {e}"))
            }
        })?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_ascii_lowercase(), value.to_string()))
            })
            .collect();
        let body = response
            .text()
            .await
            .map_err(|e| HttpError::new(format!("failed to read response body: {e}")))?;

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

impl HttpClient for ReqwestHttpClient {
    fn client_name(&self) -> &str {
        &self.name
    }

    fn request_raw<'a>(&'a self, request: HttpRequestOptions) -> HttpFuture<'a> {
        Box::pin(async move {
            let url = request
                .resolved_url()
                .ok_or_else(|| HttpError::non_retryable("request has no url"))?;
            let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes())
                .map_err(|e| HttpError::non_retryable(format!("invalid method: {e}")))?;

            let profile = request.resilience.as_ref();
            let timeout = Duration::from_millis(
                profile
                    .and_then(|profile| profile.timeout_ms)
                    .unwrap_or(self.default_timeout_ms),
            );
            let retry = profile.map_or(&self.default_retry, |profile| &profile.retry);

            let request = &request;
            let url = url.as_str();
            send_with_retry(retry, move |_| {
                self.send_once(request, url, method.clone(), timeout)
            })
            .await
        })
    }
}
