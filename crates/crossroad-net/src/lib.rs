//! # Crossroad Net
//!
//! Request/response model and network fetching for the Crossroad Navigator
//! offline cache.
//!
//! ## Design Goals
//!
//! 1. **Fetch semantics**: requests carry a mode, responses carry a type
//!    (`basic`, `cors`, `opaque`, `error`) the way a worker sees them
//! 2. **Pluggable network**: everything above this crate talks to a [`Fetcher`]
//! 3. **Cheap clones**: response bodies are [`Bytes`], so a response can be
//!    stored and returned at the same time

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, trace};
use url::{Origin, Url};

/// Errors that can occur in networking.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Cross-origin request to {0} refused in same-origin mode")]
    CrossOrigin(Url),

    #[error("CORS check failed for {0}")]
    CorsRejected(Url),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
}

/// Unique identifier for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl RequestId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

/// Request mode, deciding how cross-origin responses are exposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestMode {
    /// Top-level page navigation.
    Navigate,
    /// Cross-origin requests are refused.
    SameOrigin,
    /// Cross-origin responses come back opaque.
    NoCors,
    /// Cross-origin responses must pass the CORS check.
    #[default]
    Cors,
}

/// HTTP request.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub mode: RequestMode,
}

impl Request {
    /// Create a GET request.
    pub fn get(url: Url) -> Self {
        Self {
            id: RequestId::new(),
            url,
            method: Method::GET,
            headers: HeaderMap::new(),
            mode: RequestMode::default(),
        }
    }

    /// Create a request with an arbitrary method.
    pub fn with_method(method: Method, url: Url) -> Self {
        Self {
            method,
            ..Self::get(url)
        }
    }

    /// Create a navigation request.
    pub fn navigate(url: Url) -> Self {
        Self::get(url).mode(RequestMode::Navigate)
    }

    /// Set the request mode.
    pub fn mode(mut self, mode: RequestMode) -> Self {
        self.mode = mode;
        self
    }

    /// Add a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }
}

/// How a response is exposed to the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseType {
    /// Same-origin response.
    Basic,
    /// Cross-origin response that passed the CORS check.
    Cors,
    /// Cross-origin no-cors response; status, headers and body are hidden.
    Opaque,
    /// Network error.
    Error,
}

impl ResponseType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseType::Basic => "basic",
            ResponseType::Cors => "cors",
            ResponseType::Opaque => "opaque",
            ResponseType::Error => "error",
        }
    }
}

/// HTTP response.
///
/// Opaque responses keep their headers and body for replay to the page, but
/// report status 0 and hide both through the worker-facing accessors.
#[derive(Debug, Clone)]
pub struct Response {
    url: Url,
    status: u16,
    status_text: String,
    headers: HeaderMap,
    body: Bytes,
    response_type: ResponseType,
}

impl Response {
    /// Create a basic (same-origin) response.
    pub fn basic(url: Url, status: u16, body: impl Into<Bytes>) -> Self {
        Self::from_parts(
            url,
            status,
            default_status_text(status),
            HeaderMap::new(),
            body.into(),
            ResponseType::Basic,
        )
    }

    /// Create a CORS response.
    pub fn cors(url: Url, status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            response_type: ResponseType::Cors,
            ..Self::basic(url, status, body)
        }
    }

    /// Create an opaque response carrying a replayable body.
    pub fn opaque(url: Url, body: impl Into<Bytes>) -> Self {
        Self::from_parts(
            url,
            0,
            String::new(),
            HeaderMap::new(),
            body.into(),
            ResponseType::Opaque,
        )
    }

    /// Create a network error response.
    pub fn network_error(url: Url) -> Self {
        Self::from_parts(
            url,
            0,
            "Network Error".to_string(),
            HeaderMap::new(),
            Bytes::new(),
            ResponseType::Error,
        )
    }

    /// Assemble a response from raw parts.
    pub fn from_parts(
        url: Url,
        status: u16,
        status_text: String,
        headers: HeaderMap,
        body: Bytes,
        response_type: ResponseType,
    ) -> Self {
        let status = match response_type {
            ResponseType::Opaque | ResponseType::Error => 0,
            _ => status,
        };
        Self {
            url,
            status,
            status_text,
            headers,
            body,
            response_type,
        }
    }

    /// Add a header.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Status code; 0 for opaque and error responses.
    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn status_text(&self) -> &str {
        &self.status_text
    }

    pub fn response_type(&self) -> ResponseType {
        self.response_type
    }

    pub fn is_opaque(&self) -> bool {
        self.response_type == ResponseType::Opaque
    }

    /// Check if the status is in the 2xx range.
    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Headers visible to the worker.
    pub fn headers(&self) -> Option<&HeaderMap> {
        (!self.is_opaque()).then_some(&self.headers)
    }

    /// Body visible to the worker.
    pub fn body(&self) -> Option<&Bytes> {
        (!self.is_opaque()).then_some(&self.body)
    }

    /// Headers as delivered to the page, opaque or not.
    pub fn raw_headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Body as delivered to the page, opaque or not.
    pub fn raw_body(&self) -> &Bytes {
        &self.body
    }
}

fn default_status_text(status: u16) -> String {
    http::StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or_default()
        .to_string()
}

/// Source of network responses.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Issue a request. A rejection means no response was produced at all;
    /// HTTP error statuses are still `Ok`.
    async fn fetch(&self, request: &Request) -> Result<Response, NetError>;
}

#[async_trait]
impl<F: Fetcher + ?Sized> Fetcher for Arc<F> {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        (**self).fetch(request).await
    }
}

/// HTTP fetcher configuration.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// User agent string.
    pub user_agent: String,
    /// Accept-Language header.
    pub accept_language: String,
    /// Default timeout.
    pub default_timeout: Duration,
    /// Maximum redirects.
    pub max_redirects: usize,
    /// Enable cookies.
    pub cookies_enabled: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            user_agent: concat!("CrossroadNavigator/", env!("CARGO_PKG_VERSION")).to_string(),
            accept_language: "en-US,en;q=0.9".to_string(),
            default_timeout: Duration::from_secs(30),
            max_redirects: 10,
            cookies_enabled: true,
        }
    }
}

/// [`Fetcher`] backed by reqwest, classifying responses against the
/// worker's origin.
pub struct HttpFetcher {
    client: Client,
    config: LoaderConfig,
    origin: Origin,
}

impl HttpFetcher {
    /// Create a fetcher for a worker living at `scope`.
    pub fn new(config: LoaderConfig, scope: &Url) -> Result<Self, NetError> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.default_timeout)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .cookie_store(config.cookies_enabled)
            .build()
            .map_err(|e| NetError::RequestFailed(e.to_string()))?;

        info!(origin = %scope.origin().ascii_serialization(), "HttpFetcher initialized");

        Ok(Self {
            client,
            config,
            origin: scope.origin(),
        })
    }

    fn classify(&self, request: &Request, headers: &HeaderMap) -> Result<ResponseType, NetError> {
        if request.url.origin() == self.origin {
            return Ok(ResponseType::Basic);
        }
        match request.mode {
            RequestMode::Navigate => Ok(ResponseType::Basic),
            RequestMode::NoCors => Ok(ResponseType::Opaque),
            RequestMode::SameOrigin => Err(NetError::CrossOrigin(request.url.clone())),
            RequestMode::Cors => {
                let allowed = headers
                    .get("access-control-allow-origin")
                    .and_then(|v| v.to_str().ok())
                    .map(|v| v == "*" || v == self.origin.ascii_serialization())
                    .unwrap_or(false);
                if allowed {
                    Ok(ResponseType::Cors)
                } else {
                    Err(NetError::CorsRejected(request.url.clone()))
                }
            }
        }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        debug!(url = %request.url, method = %request.method, mode = ?request.mode, "Fetching resource");

        if request.mode == RequestMode::SameOrigin && request.url.origin() != self.origin {
            return Err(NetError::CrossOrigin(request.url.clone()));
        }

        let mut req_builder = self
            .client
            .request(request.method.clone(), request.url.clone());

        for (name, value) in request.headers.iter() {
            req_builder = req_builder.header(name, value);
        }
        req_builder = req_builder.header("Accept-Language", &self.config.accept_language);

        let response = req_builder.send().await?;

        let status = response.status();
        let headers = response.headers().clone();
        let url = response.url().clone();
        let body = response.bytes().await?;

        let response_type = self.classify(request, &headers)?;

        trace!(
            url = %url,
            status = %status,
            response_type = response_type.as_str(),
            body_len = body.len(),
            "Response received"
        );

        Ok(Response::from_parts(
            url,
            status.as_u16(),
            status.canonical_reason().unwrap_or_default().to_string(),
            headers,
            body,
            response_type,
        ))
    }
}
