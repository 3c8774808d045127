//! Request execution for virtual users.
//!
//! [`RequestExecutor`] issues exactly one HTTP round trip per call, enforces a
//! timeout on every request and turns the result into a [`RequestOutcome`].
//! It never retries; a retry policy belongs to the scenario.
//!
//! The HTTP stack itself sits behind the [`Transport`] trait.
//! [`ReqwestTransport`] is the production implementation; tests plug in
//! in-memory transports.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http::Method;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::time::Instant;

use crate::loadtest::error::RequestError;
use crate::loadtest::metrics::RequestOutcome;

/// One HTTP request as described by a scenario.
#[derive(Debug, Clone)]
pub struct Request {
    /// HTTP method.
    pub method: Method,
    /// Absolute URL.
    pub url: String,
    /// Header name/value pairs, sent in order.
    pub headers: Vec<(String, String)>,
    /// Optional request body.
    pub body: Option<Vec<u8>>,
    /// Per-request timeout overriding the executor default.
    pub timeout: Option<Duration>,
    /// Tag used for per-endpoint metrics (e.g. `"auth"`).
    pub name: Option<String>,
}

impl Request {
    /// Creates a request with no headers, body or tag.
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: None,
            timeout: None,
            name: None,
        }
    }

    /// Shorthand for a `GET` request.
    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    /// Shorthand for a `POST` request.
    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::POST, url)
    }

    /// Appends a header.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Appends an `Authorization: Bearer <token>` header.
    pub fn bearer_auth(self, token: &str) -> Self {
        self.header("Authorization", format!("Bearer {token}"))
    }

    /// Sets a raw body.
    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Serializes `value` as the JSON body and sets `Content-Type`.
    pub fn json<T: Serialize + ?Sized>(self, value: &T) -> Result<Self, serde_json::Error> {
        let body = serde_json::to_vec(value)?;
        Ok(self.header("Content-Type", "application/json").body(body))
    }

    /// Overrides the executor's default timeout for this request.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Tags the request for per-endpoint metrics.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Status and body returned by a [`Transport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    /// HTTP status code.
    pub status: u16,
    /// Full response body.
    pub body: Vec<u8>,
}

/// The external HTTP client capability.
///
/// Implementations perform a single round trip and classify failures into
/// [`RequestError`]. Timeouts are enforced by [`RequestExecutor`], not here.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send `request` and read the full response body.
    async fn round_trip(&self, request: &Request) -> Result<RawResponse, RequestError>;
}

/// [`Transport`] backed by a shared [`reqwest::Client`].
///
/// The client is cheap to clone and pools connections across all VUs.
#[derive(Debug, Clone, Default)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Creates a transport with a default client.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps an existing client (custom TLS, proxies, connection limits).
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn round_trip(&self, request: &Request) -> Result<RawResponse, RequestError> {
        let mut builder = self
            .client
            .request(request.method.clone(), request.url.as_str());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| RequestError::classify_reqwest(&e))?;
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| RequestError::classify_reqwest(&e))?;

        Ok(RawResponse {
            status,
            body: body.to_vec(),
        })
    }
}

/// Response handed back to the scenario.
#[derive(Debug, Clone)]
pub struct Response {
    /// The metrics record for this request.
    pub outcome: RequestOutcome,
    body: Vec<u8>,
}

impl Response {
    /// HTTP status, or `None` if the request never got a response.
    pub fn status(&self) -> Option<u16> {
        self.outcome.status()
    }

    /// Returns `true` for a 2xx status.
    pub fn is_success(&self) -> bool {
        matches!(self.status(), Some(s) if (200..300).contains(&s))
    }

    /// Round-trip time including body download.
    pub fn duration(&self) -> Duration {
        self.outcome.duration
    }

    /// The transport error, if the request failed before a status arrived.
    pub fn error(&self) -> Option<&RequestError> {
        self.outcome.result.as_ref().err()
    }

    /// Raw body bytes (empty on error).
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Body decoded as UTF-8, lossily.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Body parsed as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

/// Issues requests through a [`Transport`] with a mandatory timeout.
#[derive(Clone)]
pub struct RequestExecutor {
    transport: Arc<dyn Transport>,
    default_timeout: Duration,
}

impl RequestExecutor {
    /// Creates an executor over `transport`.
    pub fn new(transport: impl Transport + 'static, default_timeout: Duration) -> Self {
        Self {
            transport: Arc::new(transport),
            default_timeout,
        }
    }

    /// Creates an executor over a default [`ReqwestTransport`].
    pub fn reqwest(default_timeout: Duration) -> Self {
        Self::new(ReqwestTransport::new(), default_timeout)
    }

    /// Timeout applied to requests that don't set their own.
    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Send one request. Never retries and never blocks past the timeout.
    pub async fn send(&self, request: Request) -> Response {
        let timeout = request.timeout.unwrap_or(self.default_timeout);
        let start = Instant::now();
        let result = tokio::time::timeout(timeout, self.transport.round_trip(&request)).await;
        let duration = start.elapsed();
        let name = request.name;

        match result {
            Ok(Ok(raw)) => Response {
                outcome: RequestOutcome::response(
                    name,
                    start,
                    duration,
                    raw.status,
                    raw.body.len() as u64,
                ),
                body: raw.body,
            },
            Ok(Err(err)) => {
                tracing::debug!(url = %request.url, error = %err, "request failed");
                Response {
                    outcome: RequestOutcome::error(name, start, duration, err),
                    body: Vec::new(),
                }
            },
            Err(_) => {
                tracing::debug!(url = %request.url, ?timeout, "request timed out");
                Response {
                    outcome: RequestOutcome::error(name, start, duration, RequestError::Timeout),
                    body: Vec::new(),
                }
            },
        }
    }
}
