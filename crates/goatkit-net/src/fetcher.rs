//! Network fetchers: the real HTTP client plus scripted and offline stand-ins.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use hashbrown::HashMap;
use http::{header, HeaderValue, StatusCode};
use reqwest::Client;
use tokio::sync::Mutex;
use tracing::{debug, info, trace};
use url::Url;

use crate::{Fetcher, NetError, Origin, Request, RequestMode, Response, ResponseType};

/// HTTP loader configuration.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// User agent string.
    pub user_agent: String,
    /// Default timeout.
    pub default_timeout: Duration,
    /// Maximum redirects.
    pub max_redirects: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("GoatKit/{}", env!("CARGO_PKG_VERSION")),
            default_timeout: Duration::from_secs(30),
            max_redirects: 10,
        }
    }
}

/// `reqwest`-backed fetcher.
pub struct HttpFetcher {
    client: Client,
    config: LoaderConfig,
    origin: Option<Origin>,
}

impl HttpFetcher {
    /// Create a new HTTP fetcher.
    pub fn new(config: LoaderConfig) -> Result<Self, NetError> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.default_timeout)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()
            .map_err(|e| NetError::RequestFailed(e.to_string()))?;

        info!(user_agent = %config.user_agent, "HttpFetcher initialized");

        Ok(Self {
            client,
            config,
            origin: None,
        })
    }

    /// Origin that responses are classified against.
    ///
    /// Without one, each request is compared with its own URL's origin.
    pub fn with_origin(mut self, origin: Origin) -> Self {
        self.origin = Some(origin);
        self
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    fn classify(&self, request: &Request, final_url: &Url) -> ResponseType {
        let reference = self
            .origin
            .clone()
            .unwrap_or_else(|| Origin::from_url(&request.url));
        if reference.contains(final_url) && reference.contains(&request.url) {
            ResponseType::Basic
        } else if request.mode == RequestMode::NoCors {
            ResponseType::Opaque
        } else {
            ResponseType::Cors
        }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: Request) -> Result<Response, NetError> {
        debug!(url = %request.url, method = %request.method, "Fetching resource");

        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone());

        for (name, value) in request.headers.iter() {
            builder = builder.header(name, value);
        }

        if let Some(ref body) = request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                NetError::Timeout(self.config.default_timeout)
            } else {
                NetError::HttpError(e)
            }
        })?;

        let status = response.status();
        let headers = response.headers().clone();
        let final_url = response.url().clone();
        let response_type = self.classify(&request, &final_url);

        if response_type == ResponseType::Opaque {
            trace!(url = %final_url, "Opaque response, hiding body");
            return Ok(Response::new(status, Bytes::new()).opaque());
        }

        let body = response.bytes().await?;

        trace!(
            url = %final_url,
            status = %status,
            response_type = %response_type,
            body_len = body.len(),
            "Response received"
        );

        Ok(Response {
            url: Some(final_url),
            status,
            headers,
            response_type,
            body,
        })
    }
}

impl Response {
    /// Strip everything a page may not see from a cross-origin no-cors response.
    fn opaque(mut self) -> Self {
        self.url = None;
        self.headers.clear();
        self.body = Bytes::new();
        self.response_type = ResponseType::Opaque;
        self
    }
}

/// Canned response served by [`StaticFetcher`].
#[derive(Debug, Clone)]
pub struct StaticRoute {
    pub status: StatusCode,
    pub content_type: Option<String>,
    pub body: Bytes,
    pub response_type: ResponseType,
}

impl StaticRoute {
    /// A `200 OK` same-origin response.
    pub fn ok(content_type: &str, body: impl Into<Bytes>) -> Self {
        Self {
            status: StatusCode::OK,
            content_type: Some(content_type.to_string()),
            body: body.into(),
            response_type: ResponseType::Basic,
        }
    }

    /// A bodiless response with the given status.
    pub fn status(status: StatusCode) -> Self {
        Self {
            status,
            content_type: None,
            body: Bytes::new(),
            response_type: ResponseType::Basic,
        }
    }

    pub fn with_type(mut self, response_type: ResponseType) -> Self {
        self.response_type = response_type;
        self
    }

    fn to_response(&self, url: &Url) -> Response {
        let mut response = Response::new(self.status, self.body.clone())
            .with_type(self.response_type)
            .with_url(url.clone());
        if let Some(value) = self
            .content_type
            .as_deref()
            .and_then(|ct| HeaderValue::from_str(ct).ok())
        {
            response.headers.insert(header::CONTENT_TYPE, value);
        }
        response
    }
}

/// In-memory network answering from a fixed route table.
///
/// Counts every request it sees and can be switched offline at any time,
/// after which every fetch fails with [`NetError::Offline`]. Unknown URLs
/// answer `404 Not Found`.
#[derive(Debug, Default)]
pub struct StaticFetcher {
    routes: HashMap<String, StaticRoute>,
    offline: AtomicBool,
    calls: AtomicUsize,
    requested: Mutex<Vec<Url>>,
}

impl StaticFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `route` for `url` (fragment ignored).
    pub fn route(mut self, url: &str, route: StaticRoute) -> Self {
        let key = match Url::parse(url) {
            Ok(mut parsed) => {
                parsed.set_fragment(None);
                parsed.to_string()
            }
            Err(_) => url.to_string(),
        };
        self.routes.insert(key, route);
        self
    }

    /// Switch the network on or off.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn is_offline(&self) -> bool {
        self.offline.load(Ordering::SeqCst)
    }

    /// Number of fetches attempted, including failed ones.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// URLs fetched so far, in order.
    pub async fn requested(&self) -> Vec<Url> {
        self.requested.lock().await.clone()
    }
}

#[async_trait]
impl Fetcher for StaticFetcher {
    async fn fetch(&self, request: Request) -> Result<Response, NetError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requested.lock().await.push(request.url.clone());

        if self.is_offline() {
            return Err(NetError::Offline);
        }

        let mut url = request.url;
        url.set_fragment(None);
        match self.routes.get(url.as_str()) {
            Some(route) => Ok(route.to_response(&url)),
            None => Ok(StaticRoute::status(StatusCode::NOT_FOUND).to_response(&url)),
        }
    }
}

/// Network that is always down.
#[derive(Debug, Default, Clone, Copy)]
pub struct OfflineFetcher;

#[async_trait]
impl Fetcher for OfflineFetcher {
    async fn fetch(&self, request: Request) -> Result<Response, NetError> {
        debug!(url = %request.url, "Network offline, failing fetch");
        Err(NetError::Offline)
    }
}
