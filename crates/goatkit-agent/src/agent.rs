//! The cache agent: precache on install, prune on activate, cache-first fetch.

use async_trait::async_trait;
use futures::future::join_all;
use http::{Method, StatusCode};
use serde_json::Value as JsonValue;
use tracing::{debug, error, info, trace, warn};

use goatkit_net::{Request, Response};
use goatkit_sw::{
    Cache, ErrorEvent, FetchEvent, FetchOutcome, MessageEvent, ServiceWorkerHandler, SwError,
    WorkerScope,
};

use crate::config::{AgentConfig, HtmlFallbackMiss};
use crate::offline::offline_page;

/// Message payload that forces a waiting worker to activate.
pub const SKIP_WAITING: &str = "skipWaiting";

/// Offline-first asset cache.
#[derive(Debug, Clone)]
pub struct CacheAgent {
    config: AgentConfig,
}

impl CacheAgent {
    pub fn new(config: AgentConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Fetch and store every seed. Returns how many were stored.
    async fn precache(&self, scope: &WorkerScope) -> Result<usize, SwError> {
        let cache = scope.caches().open(&self.config.cache_name).await?;
        debug!(seeds = ?self.config.seed_list, "Attempting to cache seed list");

        let stored = join_all(
            self.config
                .seed_list
                .iter()
                .map(|seed| self.cache_seed(scope, &cache, seed)),
        )
        .await;
        Ok(stored.into_iter().filter(|ok| *ok).count())
    }

    async fn cache_seed(&self, scope: &WorkerScope, cache: &Cache, seed: &str) -> bool {
        let url = match scope.resolve(seed).await {
            Ok(url) => url,
            Err(e) => {
                warn!(seed, error = %e, "Could not cache seed");
                return false;
            }
        };

        let request = Request::get(url);
        let response = match scope.fetch(request.duplicate()).await {
            Ok(response) if response.ok() => response,
            Ok(response) => {
                warn!(url = %request.url, status = %response.status, "Could not cache seed");
                return false;
            }
            Err(e) => {
                warn!(url = %request.url, error = %e, "Could not cache seed");
                return false;
            }
        };

        match cache.put(&request, response).await {
            Ok(()) => true,
            Err(e) => {
                warn!(url = %request.url, error = %e, "Could not cache seed");
                false
            }
        }
    }

    /// Write a network response into the current store off the response path.
    fn store_in_background(&self, scope: &WorkerScope, request: Request, response: Response) {
        let caches = scope.caches().clone();
        let cache_name = self.config.cache_name.clone();
        scope.wait_until(async move {
            let stored = match caches.open(&cache_name).await {
                Ok(cache) => cache.put(&request, response).await,
                Err(e) => Err(e),
            };
            match stored {
                Ok(()) => debug!(url = %request.url, cache = %cache_name, "Cached new resource"),
                Err(e) => warn!(url = %request.url, error = %e, "Failed to cache resource"),
            }
        });
    }

    /// Answer a request the network could not.
    async fn offline_fallback(&self, scope: &WorkerScope, request: &Request) -> FetchOutcome {
        if is_html_request(request) {
            match scope.resolve(&self.config.root_document).await {
                Ok(root) => {
                    if let Some(document) = scope.caches().match_url(&root).await {
                        debug!(url = %request.url, root = %root, "Serving cached root document");
                        return FetchOutcome::Respond(document);
                    }
                }
                Err(e) => warn!(error = %e, "Root document does not resolve"),
            }

            if self.config.html_fallback_miss == HtmlFallbackMiss::NetworkError {
                debug!(url = %request.url, "Root document not cached, failing navigation");
                return FetchOutcome::NetworkError;
            }
        }

        FetchOutcome::Respond(offline_page(&self.config.app_name))
    }
}

/// Documents: navigations, and paths ending in `.html`/`.htm`.
fn is_html_request(request: &Request) -> bool {
    if request.is_navigation() {
        return true;
    }
    let path = request.url.path().to_ascii_lowercase();
    path.ends_with(".html") || path.ends_with(".htm")
}

#[async_trait]
impl ServiceWorkerHandler for CacheAgent {
    async fn install(&self, scope: &WorkerScope) -> Result<(), SwError> {
        info!(cache = %self.config.cache_name, "Service worker installing");

        match self.precache(scope).await {
            Ok(stored) => info!(
                stored,
                seeds = self.config.seed_list.len(),
                "Seed list cached"
            ),
            Err(e) => error!(cache = %self.config.cache_name, error = %e, "Cache installation failed"),
        }

        scope.skip_waiting();
        Ok(())
    }

    async fn activate(&self, scope: &WorkerScope) -> Result<(), SwError> {
        info!(cache = %self.config.cache_name, "Service worker activating");

        for name in scope.caches().keys().await {
            if name != self.config.cache_name {
                info!(cache = %name, "Deleting old cache");
                scope.caches().delete(&name).await;
            }
        }

        let claimed = scope.claim_clients().await?;
        info!(claimed, "Service worker activated");
        Ok(())
    }

    async fn fetch(&self, scope: &WorkerScope, event: &FetchEvent) -> FetchOutcome {
        let request = &event.request;
        if request.method != Method::GET {
            trace!(url = %request.url, method = %request.method, "Skipping non-GET request");
            return FetchOutcome::PassThrough;
        }
        if !scope.is_same_origin(&request.url) {
            trace!(url = %request.url, "Skipping cross-origin request");
            return FetchOutcome::PassThrough;
        }

        if let Some(cached) = scope.caches().match_request(request).await {
            debug!(url = %request.url, "Serving from cache");
            return FetchOutcome::Respond(cached);
        }

        debug!(url = %request.url, "Fetching from network");
        match scope.fetch(request.duplicate()).await {
            Ok(response) => {
                if response.status == StatusCode::OK && response.is_basic() {
                    self.store_in_background(scope, request.duplicate(), response.duplicate());
                }
                FetchOutcome::Respond(response)
            }
            Err(e) => {
                error!(url = %request.url, error = %e, "Network fetch failed");
                self.offline_fallback(scope, request).await
            }
        }
    }

    async fn message(&self, scope: &WorkerScope, event: MessageEvent) {
        if event.data == JsonValue::from(SKIP_WAITING) {
            info!(source = ?event.source, "skipWaiting message received");
            scope.skip_waiting();
        } else {
            trace!(data = %event.data, "Ignoring message");
        }
    }

    async fn error(&self, _scope: &WorkerScope, event: ErrorEvent) {
        error!(
            message = %event.message,
            filename = ?event.filename,
            "Service Worker Error"
        );
    }
}
