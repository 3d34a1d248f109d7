//! # PwaKit Net
//!
//! Request/response model and the network fetch interface used by the
//! offline cache manager.
//!
//! ## Design Goals
//!
//! 1. **Fetch-shaped types**: requests carry a mode and a client origin, responses a type
//! 2. **Cheap duplication**: response bodies are reference-counted so a response can be
//!    returned and persisted at the same time
//! 3. **Pluggable network**: anything implementing [`Fetcher`] can back the manager

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use mime::Mime;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::{Origin, Url};

pub mod loader;

pub use loader::{LoaderConfig, ResourceLoader};

/// Errors that can occur in networking.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Body decode error: {0}")]
    Decode(String),

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

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

/// Request mode, as seen by the fetch interceptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
    /// Top-level page navigation.
    Navigate,
    /// Same-origin only.
    SameOrigin,
    /// Cross-origin without CORS; the response is opaque.
    NoCors,
    /// Cross-origin with CORS.
    #[default]
    Cors,
}

/// Credentials mode for requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CredentialsMode {
    /// Never send cookies.
    Omit,
    /// Send cookies only for same-origin requests.
    #[default]
    SameOrigin,
    /// Always send cookies.
    Include,
}

/// HTTP request.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub timeout: Option<Duration>,
    pub mode: RequestMode,
    pub credentials: CredentialsMode,
    pub referrer: Option<Url>,
    /// Origin of the page that issued the request.
    pub client_origin: Option<Origin>,
}

impl Request {
    /// Create a request with an arbitrary method.
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            id: RequestId::new(),
            url,
            method,
            headers: HeaderMap::new(),
            body: None,
            timeout: None,
            mode: RequestMode::default(),
            credentials: CredentialsMode::SameOrigin,
            referrer: None,
            client_origin: None,
        }
    }

    /// Create a GET request.
    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    /// Create a POST request.
    pub fn post(url: Url, body: Bytes) -> Self {
        let mut request = Self::new(Method::POST, url);
        request.body = Some(body);
        request
    }

    /// Create a top-level navigation request.
    pub fn navigate(url: Url) -> Self {
        let origin = url.origin();
        Self::get(url).mode(RequestMode::Navigate).client_origin(origin)
    }

    /// Add a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set timeout.
    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }

    /// Set the request mode.
    pub fn mode(mut self, mode: RequestMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set referrer.
    pub fn referrer(mut self, referrer: Url) -> Self {
        self.referrer = Some(referrer);
        self
    }

    /// Set the origin of the issuing page.
    pub fn client_origin(mut self, origin: Origin) -> Self {
        self.client_origin = Some(origin);
        self
    }

    /// Whether this is a page navigation.
    pub fn is_navigation(&self) -> bool {
        self.mode == RequestMode::Navigate
    }

    /// Whether the URL scheme is http or https.
    pub fn is_http(&self) -> bool {
        matches!(self.url.scheme(), "http" | "https")
    }
}

/// Response type, following the fetch model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseType {
    /// Same-origin response.
    Basic,
    /// Cross-origin response permitted by CORS.
    Cors,
    /// Cross-origin `no-cors` response; contents are not reusable.
    Opaque,
    /// Response constructed locally rather than fetched.
    #[default]
    Default,
    /// Network error.
    Error,
}

impl ResponseType {
    /// Classify a fetched response from the request that produced it.
    pub fn classify(request: &Request, final_url: &Url) -> Self {
        if request.is_navigation() {
            return ResponseType::Basic;
        }
        match request.client_origin {
            None => ResponseType::Basic,
            Some(ref origin) if *origin == final_url.origin() => ResponseType::Basic,
            Some(_) if request.mode == RequestMode::NoCors => ResponseType::Opaque,
            Some(_) => ResponseType::Cors,
        }
    }
}

/// HTTP response with a fully buffered body.
#[derive(Debug, Clone)]
pub struct Response {
    pub request_id: Option<RequestId>,
    /// Final URL; `None` for synthesized responses.
    pub url: Option<Url>,
    pub status: StatusCode,
    pub status_text: String,
    pub headers: HeaderMap,
    pub response_type: ResponseType,
    pub redirected: bool,
    pub content_type: Option<Mime>,
    body: Bytes,
}

impl Response {
    /// Build a locally synthesized response.
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            request_id: None,
            url: None,
            status,
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            headers: HeaderMap::new(),
            response_type: ResponseType::Default,
            redirected: false,
            content_type: None,
            body: body.into(),
        }
    }

    /// Set a header; `Content-Type` also updates [`Response::content_type`].
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self.content_type = parse_content_type(&self.headers);
        self
    }

    /// Replace the headers wholesale.
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.content_type = parse_content_type(&headers);
        self.headers = headers;
        self
    }

    /// Override the reason phrase.
    pub fn with_status_text(mut self, text: impl Into<String>) -> Self {
        self.status_text = text.into();
        self
    }

    /// Set the response URL.
    pub fn with_url(mut self, url: Url) -> Self {
        self.url = Some(url);
        self
    }

    /// Set the response type.
    pub fn with_type(mut self, response_type: ResponseType) -> Self {
        self.response_type = response_type;
        self
    }

    /// Check if request was successful (2xx).
    pub fn ok(&self) -> bool {
        self.status.is_success()
    }

    /// Whether the response is a same-origin `basic` response.
    pub fn is_basic(&self) -> bool {
        self.response_type == ResponseType::Basic
    }

    /// Body bytes.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Take the body.
    pub fn into_body(self) -> Bytes {
        self.body
    }

    /// Get the body as text.
    pub fn text(&self) -> Result<String, NetError> {
        String::from_utf8(self.body.to_vec()).map_err(|e| NetError::Decode(e.to_string()))
    }

    /// Get the body as JSON.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, NetError> {
        serde_json::from_slice(&self.body).map_err(|e| NetError::Decode(e.to_string()))
    }
}

/// Parse the `Content-Type` header, if present and well formed.
pub fn parse_content_type(headers: &HeaderMap) -> Option<Mime> {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<Mime>().ok())
}

/// The network side of the fetch interceptor.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Issue a request, yielding a response or a network failure.
    ///
    /// HTTP error statuses are responses, not failures.
    async fn fetch(&self, request: Request) -> Result<Response, NetError>;
}
