//! # GoatKit Net
//!
//! Request/response model and network access for the GoatKit service worker host.
//!
//! ## Design Goals
//!
//! 1. **Explicit ownership**: forwarding a [`Request`] or storing a [`Response`]
//!    consumes it; a second use needs an explicit `duplicate()` taken first
//! 2. **Pluggable network**: everything talks to a [`Fetcher`], so the HTTP
//!    client, a scripted table or a permanently offline network are interchangeable
//! 3. **Origin awareness**: responses carry a [`ResponseType`] derived from the
//!    origin model in [`origin`]

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use mime::Mime;
use thiserror::Error;
use url::Url;

pub mod fetcher;
pub mod origin;

pub use fetcher::{HttpFetcher, LoaderConfig, OfflineFetcher, StaticFetcher, StaticRoute};
pub use origin::Origin;

/// Errors that can occur in networking.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Network is offline")]
    Offline,

    #[error("Invalid body: {0}")]
    InvalidBody(String),

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

/// Request mode, as set by whoever issued the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
    /// Top-level document navigation.
    Navigate,
    /// Cross-origin responses come back opaque.
    NoCors,
    /// Cross-origin responses are readable if the server allows it.
    #[default]
    Cors,
}

/// HTTP request.
///
/// Not `Clone`: use [`Request::duplicate`] before handing a request to an
/// operation that consumes it.
#[derive(Debug)]
pub struct Request {
    pub id: RequestId,
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub mode: RequestMode,
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
            mode: RequestMode::default(),
        }
    }

    /// Create a GET request.
    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    /// Create a POST request.
    pub fn post(url: Url, body: Bytes) -> Self {
        Self::new(Method::POST, url).body(body)
    }

    /// Create a top-level navigation request.
    pub fn navigate(url: Url) -> Self {
        Self::get(url)
            .mode(RequestMode::Navigate)
            .header(header::ACCEPT, HeaderValue::from_static("text/html"))
    }

    /// Add a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set the body.
    pub fn body(mut self, body: Bytes) -> Self {
        self.body = Some(body);
        self
    }

    /// Set the request mode.
    pub fn mode(mut self, mode: RequestMode) -> Self {
        self.mode = mode;
        self
    }

    /// Whether this is a document navigation.
    pub fn is_navigation(&self) -> bool {
        self.mode == RequestMode::Navigate
    }

    /// Explicit copy of the request, keeping its id.
    pub fn duplicate(&self) -> Self {
        Self {
            id: self.id,
            url: self.url.clone(),
            method: self.method.clone(),
            headers: self.headers.clone(),
            body: self.body.clone(),
            mode: self.mode,
        }
    }
}

/// Response type, mirroring what a page is allowed to see.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseType {
    /// Same-origin network response.
    Basic,
    /// Cross-origin response shared via CORS.
    Cors,
    /// Cross-origin no-cors response; status, headers and body are hidden.
    Opaque,
    /// Network error.
    Error,
    /// Constructed locally rather than fetched.
    #[default]
    Default,
}

impl ResponseType {
    /// Parse the name produced by [`ResponseType::as_str`].
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "basic" => Some(ResponseType::Basic),
            "cors" => Some(ResponseType::Cors),
            "opaque" => Some(ResponseType::Opaque),
            "error" => Some(ResponseType::Error),
            "default" => Some(ResponseType::Default),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseType::Basic => "basic",
            ResponseType::Cors => "cors",
            ResponseType::Opaque => "opaque",
            ResponseType::Error => "error",
            ResponseType::Default => "default",
        }
    }
}

impl std::fmt::Display for ResponseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// HTTP response.
///
/// The body is read at most once: [`Response::bytes`] and [`Response::text`]
/// consume the response. Use [`Response::duplicate`] to keep a copy.
#[derive(Debug)]
pub struct Response {
    pub url: Option<Url>,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub response_type: ResponseType,
    body: Bytes,
}

impl Response {
    /// Create a locally constructed response.
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            url: None,
            status,
            headers: HeaderMap::new(),
            response_type: ResponseType::Default,
            body: body.into(),
        }
    }

    /// Create a `200 OK` HTML response.
    pub fn html(body: impl Into<Bytes>) -> Self {
        Self::new(StatusCode::OK, body).with_header(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/html"),
        )
    }

    /// Add a header.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set the response type.
    pub fn with_type(mut self, response_type: ResponseType) -> Self {
        self.response_type = response_type;
        self
    }

    /// Set the final URL.
    pub fn with_url(mut self, url: Url) -> Self {
        self.url = Some(url);
        self
    }

    /// Check if request was successful (2xx).
    pub fn ok(&self) -> bool {
        self.status.is_success()
    }

    /// Same-origin network response.
    pub fn is_basic(&self) -> bool {
        self.response_type == ResponseType::Basic
    }

    /// Parsed `Content-Type`, if present and valid.
    pub fn content_type(&self) -> Option<Mime> {
        self.headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<Mime>().ok())
    }

    /// Body length in bytes.
    pub fn body_len(&self) -> usize {
        self.body.len()
    }

    /// Consume the response and return its body.
    pub fn bytes(self) -> Bytes {
        self.body
    }

    /// Consume the response and return its body as UTF-8 text.
    pub fn text(self) -> Result<String, NetError> {
        String::from_utf8(self.body.to_vec()).map_err(|e| NetError::InvalidBody(e.to_string()))
    }

    /// Explicit copy of the response, body included.
    pub fn duplicate(&self) -> Self {
        Self {
            url: self.url.clone(),
            status: self.status,
            headers: self.headers.clone(),
            response_type: self.response_type,
            body: self.body.clone(),
        }
    }
}

/// Anything that can turn a request into a response over some network.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Forward `request` to the network. The request is consumed.
    async fn fetch(&self, request: Request) -> Result<Response, NetError>;
}
