//! The worker global scope handed to every handler invocation.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, trace};
use url::Url;

use goatkit_net::{Fetcher, NetError, Origin, Request, Response};

use crate::cache::CacheStorage;
use crate::clients::Clients;
use crate::lifecycle::{Registration, ServiceWorkerEvent, ServiceWorkerId};
use crate::SwError;

/// Everything a worker can reach: its caches, its clients, the network and
/// the host's lifecycle controls.
///
/// Cheap to clone; clones refer to the same worker.
#[derive(Clone)]
pub struct WorkerScope {
    worker_id: ServiceWorkerId,
    origin: Origin,
    registration: Arc<RwLock<Registration>>,
    caches: CacheStorage,
    clients: Arc<RwLock<Clients>>,
    fetcher: Arc<dyn Fetcher>,
    skip_waiting: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<ServiceWorkerEvent>,
    pending: mpsc::UnboundedSender<JoinHandle<()>>,
}

#[derive(Clone)]
pub(crate) struct ScopeParts {
    pub registration: Arc<RwLock<Registration>>,
    pub caches: CacheStorage,
    pub clients: Arc<RwLock<Clients>>,
    pub fetcher: Arc<dyn Fetcher>,
    pub events: mpsc::UnboundedSender<ServiceWorkerEvent>,
    pub pending: mpsc::UnboundedSender<JoinHandle<()>>,
}

impl WorkerScope {
    pub(crate) fn new(worker_id: ServiceWorkerId, origin: Origin, parts: ScopeParts) -> Self {
        Self {
            worker_id,
            origin,
            registration: parts.registration,
            caches: parts.caches,
            clients: parts.clients,
            fetcher: parts.fetcher,
            skip_waiting: Arc::new(AtomicBool::new(false)),
            events: parts.events,
            pending: parts.pending,
        }
    }

    /// Id of the worker this scope belongs to.
    pub fn worker_id(&self) -> ServiceWorkerId {
        self.worker_id
    }

    /// Origin of the worker.
    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    /// Cache storage (`caches`).
    pub fn caches(&self) -> &CacheStorage {
        &self.caches
    }

    /// Registration scope URL.
    pub async fn scope_url(&self) -> Url {
        self.registration.read().await.scope.clone()
    }

    /// Resolve a path relative to the registration scope.
    pub async fn resolve(&self, path: &str) -> Result<Url, SwError> {
        self.scope_url()
            .await
            .join(path)
            .map_err(|e| SwError::NotFound(format!("{}: {}", path, e)))
    }

    /// Check whether `url` shares the worker's origin.
    pub fn is_same_origin(&self, url: &Url) -> bool {
        self.origin.contains(url)
    }

    /// Forward a request to the network (`fetch()`). Consumes the request.
    pub async fn fetch(&self, request: Request) -> Result<Response, NetError> {
        self.fetcher.fetch(request).await
    }

    /// Ask to become active without waiting for existing clients to close.
    pub fn skip_waiting(&self) {
        debug!(worker = %self.worker_id, "skipWaiting requested");
        self.skip_waiting.store(true, Ordering::SeqCst);
    }

    /// Whether `skip_waiting` has been called.
    pub fn skip_waiting_requested(&self) -> bool {
        self.skip_waiting.load(Ordering::SeqCst)
    }

    /// Take control of every client in scope (`clients.claim()`).
    ///
    /// Only the active worker may claim. Returns how many clients changed
    /// controller.
    pub async fn claim_clients(&self) -> Result<usize, SwError> {
        let scope = {
            let registration = self.registration.read().await;
            match registration.active.as_ref() {
                Some(active) if active.id == self.worker_id => registration.scope.clone(),
                _ => {
                    return Err(SwError::StateError(format!(
                        "Worker {} is not active and cannot claim clients",
                        self.worker_id
                    )))
                }
            }
        };

        let changed = self.clients.write().await.claim(self.worker_id, &scope);
        for &client_id in &changed {
            let _ = self.events.send(ServiceWorkerEvent::ControllerChange {
                client_id,
                worker_id: self.worker_id,
            });
        }
        Ok(changed.len())
    }

    /// Run `work` in the background; the host can await it via `settle`.
    pub fn wait_until<F>(&self, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(work);
        if self.pending.send(handle).is_err() {
            trace!(worker = %self.worker_id, "Host gone, background work detached");
        }
    }
}

impl std::fmt::Debug for WorkerScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerScope")
            .field("worker_id", &self.worker_id)
            .field("origin", &self.origin)
            .field("skip_waiting", &self.skip_waiting_requested())
            .finish_non_exhaustive()
    }
}
