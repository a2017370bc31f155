//! The host side: registers workers, drives their lifecycle and dispatches
//! signals to them.

use std::sync::Arc;

use hashbrown::HashMap;
use serde_json::Value as JsonValue;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use goatkit_net::{Fetcher, NetError, Origin, Request, Response};

use crate::cache::CacheStorage;
use crate::clients::{Client, ClientId, Clients};
use crate::handler::{
    ErrorEvent, FetchEvent, FetchOutcome, MessageEvent, ServiceWorkerHandler, SignalKind,
};
use crate::lifecycle::{
    Registration, ServiceWorker, ServiceWorkerEvent, ServiceWorkerId, ServiceWorkerState,
};
use crate::scope::{ScopeParts, WorkerScope};
use crate::SwError;

#[derive(Clone)]
struct WorkerSlot {
    handler: Arc<dyn ServiceWorkerHandler>,
    scope: WorkerScope,
}

/// Service worker container for one scope (`navigator.serviceWorker`).
pub struct ServiceWorkerContainer {
    origin: Origin,
    registration: Arc<RwLock<Registration>>,
    workers: RwLock<HashMap<ServiceWorkerId, WorkerSlot>>,
    caches: CacheStorage,
    clients: Arc<RwLock<Clients>>,
    fetcher: Arc<dyn Fetcher>,
    event_tx: mpsc::UnboundedSender<ServiceWorkerEvent>,
    pending_tx: mpsc::UnboundedSender<JoinHandle<()>>,
    pending_rx: Mutex<mpsc::UnboundedReceiver<JoinHandle<()>>>,
}

impl ServiceWorkerContainer {
    /// Create a container for `scope`, backed by `caches` and `fetcher`.
    pub fn new(
        scope: Url,
        caches: CacheStorage,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ServiceWorkerEvent>), SwError> {
        let origin = Origin::from_url(&scope);
        if origin.is_opaque() {
            return Err(SwError::SecurityError(format!(
                "Scope {} has an opaque origin",
                scope
            )));
        }

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (pending_tx, pending_rx) = mpsc::unbounded_channel();

        Ok((
            Self {
                origin,
                registration: Arc::new(RwLock::new(Registration::new(scope))),
                workers: RwLock::new(HashMap::new()),
                caches,
                clients: Arc::new(RwLock::new(Clients::new())),
                fetcher,
                event_tx,
                pending_tx,
                pending_rx: Mutex::new(pending_rx),
            },
            event_rx,
        ))
    }

    /// Cache storage shared with every worker.
    pub fn caches(&self) -> &CacheStorage {
        &self.caches
    }

    /// Snapshot of the registration.
    pub async fn registration(&self) -> Registration {
        self.registration.read().await.clone()
    }

    /// Id of the activated worker, if any.
    pub async fn active_worker(&self) -> Option<ServiceWorkerId> {
        self.registration.read().await.activated_id()
    }

    /// Id of the waiting worker, if any.
    pub async fn waiting_worker(&self) -> Option<ServiceWorkerId> {
        self.registration.read().await.waiting.as_ref().map(|w| w.id)
    }

    /// Register a worker script and run it through install (and activation
    /// when nothing holds it back).
    pub async fn register(
        &self,
        script_url: &str,
        handler: Arc<dyn ServiceWorkerHandler>,
    ) -> Result<ServiceWorkerId, SwError> {
        let script_url = self.resolve_script(script_url).await?;
        let worker = ServiceWorker::new(script_url);
        let id = worker.id;
        let slot = self.add_slot(id, handler).await;

        let displaced = self.registration.write().await.begin_install(worker);
        self.retire(displaced).await;
        self.emit(ServiceWorkerEvent::UpdateFound { worker_id: id });
        self.emit_state(id, ServiceWorkerState::Installing);
        info!(worker = %id, "Service worker installing");

        if slot.handler.listens(SignalKind::Install) {
            if let Err(e) = slot.handler.install(&slot.scope).await {
                warn!(worker = %id, error = %e, "Install failed");
                let failed = self.registration.write().await.install_failed();
                self.retire(failed).await;
                return Err(SwError::InstallFailed(e.to_string()));
            }
        }

        let displaced = self.registration.write().await.install_complete();
        self.retire(displaced).await;
        self.emit_state(id, ServiceWorkerState::Installed);

        self.activate_if_ready(&slot).await?;
        Ok(id)
    }

    /// Bring back a previously activated worker after a restart, without
    /// replaying install or activate.
    pub async fn resume(
        &self,
        script_url: &str,
        handler: Arc<dyn ServiceWorkerHandler>,
    ) -> Result<ServiceWorkerId, SwError> {
        let script_url = self.resolve_script(script_url).await?;
        let worker = ServiceWorker::new(script_url);
        let id = worker.id;
        self.add_slot(id, handler).await;

        let displaced = self.registration.write().await.restore_active(worker);
        self.retire(displaced).await;
        self.emit_state(id, ServiceWorkerState::Activated);
        info!(worker = %id, "Service worker resumed");
        Ok(id)
    }

    /// Route a request through the active worker, falling back to the
    /// network when no worker handles it.
    pub async fn dispatch_fetch(
        &self,
        request: Request,
        client_id: Option<ClientId>,
    ) -> Result<Response, NetError> {
        let slot = match self.controller_for(client_id).await {
            Some(slot) if slot.handler.listens(SignalKind::Fetch) => slot,
            _ => return self.fetcher.fetch(request).await,
        };

        let event = FetchEvent {
            request,
            client_id,
        };
        match slot.handler.fetch(&slot.scope, &event).await {
            FetchOutcome::PassThrough => {
                debug!(url = %event.request.url, "Fetch not handled, using network");
                self.fetcher.fetch(event.request).await
            }
            FetchOutcome::Respond(response) => Ok(response),
            FetchOutcome::NetworkError => Err(NetError::RequestFailed(format!(
                "Service worker failed the fetch for {}",
                event.request.url
            ))),
        }
    }

    /// Post a message to a worker (`worker.postMessage(data)`).
    pub async fn post_message(
        &self,
        worker: ServiceWorkerId,
        data: JsonValue,
        source: Option<ClientId>,
    ) -> Result<(), SwError> {
        let slot = self.slot(worker).await?;
        if slot.handler.listens(SignalKind::Message) {
            let event = MessageEvent { data, source };
            slot.handler.message(&slot.scope, event).await;
        }
        self.activate_if_ready(&slot).await
    }

    /// Deliver an uncaught error to a worker's error handler.
    pub async fn report_error(
        &self,
        worker: ServiceWorkerId,
        message: impl Into<String>,
        filename: Option<&str>,
    ) -> Result<(), SwError> {
        let slot = self.slot(worker).await?;
        if slot.handler.listens(SignalKind::Error) {
            let event = ErrorEvent {
                message: message.into(),
                filename: filename.map(str::to_string),
            };
            slot.handler.error(&slot.scope, event).await;
        }
        Ok(())
    }

    /// Open a page. Pages inside the scope are controlled by the active worker.
    pub async fn open_client(&self, url: &str) -> Result<Client, SwError> {
        let url = Url::parse(url).map_err(|e| SwError::NotFound(format!("{}: {}", url, e)))?;
        let controller = {
            let registration = self.registration.read().await;
            if registration.in_scope(&url) {
                registration.activated_id()
            } else {
                None
            }
        };
        let client = self.clients.write().await.open_window(url, controller);
        debug!(client = %client.id, controller = ?controller, "Client opened");
        Ok(client)
    }

    /// Close a page. Once the active worker controls no pages, a waiting
    /// worker takes over.
    pub async fn close_client(&self, id: ClientId) -> Result<bool, SwError> {
        if self.clients.write().await.remove(id).is_none() {
            return Ok(false);
        }
        debug!(client = %id, "Client closed");

        if let Some(waiting) = self.waiting_worker().await {
            let slot = self.slot(waiting).await?;
            self.activate_if_ready(&slot).await?;
        }
        Ok(true)
    }

    /// Snapshot of every client.
    pub async fn clients(&self) -> Vec<Client> {
        self.clients.read().await.all().into_iter().cloned().collect()
    }

    /// Await background work registered through `WorkerScope::wait_until`.
    pub async fn settle(&self) {
        let mut pending = self.pending_rx.lock().await;
        while let Ok(handle) = pending.try_recv() {
            if let Err(e) = handle.await {
                warn!(error = %e, "Background task did not complete");
            }
        }
    }

    async fn resolve_script(&self, script_url: &str) -> Result<Url, SwError> {
        let scope = self.registration.read().await.scope.clone();
        let url = scope
            .join(script_url)
            .map_err(|e| SwError::RegistrationFailed(format!("{}: {}", script_url, e)))?;
        if !self.origin.contains(&url) {
            return Err(SwError::SecurityError(format!(
                "Script {} is not same-origin with scope {}",
                url, scope
            )));
        }
        Ok(url)
    }

    async fn add_slot(
        &self,
        id: ServiceWorkerId,
        handler: Arc<dyn ServiceWorkerHandler>,
    ) -> WorkerSlot {
        let parts = ScopeParts {
            registration: Arc::clone(&self.registration),
            caches: self.caches.clone(),
            clients: Arc::clone(&self.clients),
            fetcher: Arc::clone(&self.fetcher),
            events: self.event_tx.clone(),
            pending: self.pending_tx.clone(),
        };
        let slot = WorkerSlot {
            handler,
            scope: WorkerScope::new(id, self.origin.clone(), parts),
        };
        self.workers.write().await.insert(id, slot.clone());
        slot
    }

    async fn slot(&self, id: ServiceWorkerId) -> Result<WorkerSlot, SwError> {
        self.workers
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| SwError::NotFound(format!("Worker {}", id)))
    }

    async fn controller_for(&self, client_id: Option<ClientId>) -> Option<WorkerSlot> {
        let worker = match client_id {
            Some(id) => self.clients.read().await.get(id)?.controller?,
            None => self.active_worker().await?,
        };
        self.workers.read().await.get(&worker).cloned()
    }

    /// Activate the waiting worker if `slot` is it and nothing holds it back.
    async fn activate_if_ready(&self, slot: &WorkerSlot) -> Result<(), SwError> {
        let id = slot.scope.worker_id();
        let active = {
            let registration = self.registration.read().await;
            if registration.waiting.as_ref().map(|w| w.id) != Some(id) {
                return Ok(());
            }
            registration.active.as_ref().map(|w| w.id)
        };

        let ready = match active {
            None => true,
            Some(active) => {
                slot.scope.skip_waiting_requested()
                    || self.clients.read().await.controlled_by(active) == 0
            }
        };
        if !ready {
            debug!(worker = %id, "Worker waiting for clients to close");
            return Ok(());
        }

        self.activate(slot).await
    }

    async fn activate(&self, slot: &WorkerSlot) -> Result<(), SwError> {
        let (id, previous) = self
            .registration
            .write()
            .await
            .begin_activation()
            .ok_or_else(|| SwError::StateError("No waiting worker to activate".to_string()))?;
        self.emit_state(id, ServiceWorkerState::Activating);
        info!(worker = %id, "Service worker activating");

        if let Some(previous) = previous {
            let moved = self.clients.write().await.hand_over(previous.id, id);
            for client_id in moved {
                self.emit(ServiceWorkerEvent::ControllerChange {
                    client_id,
                    worker_id: id,
                });
            }
            self.retire(Some(previous)).await;
        }

        if slot.handler.listens(SignalKind::Activate) {
            if let Err(e) = slot.handler.activate(&slot.scope).await {
                warn!(worker = %id, error = %e, "Activate handler failed");
            }
        }

        if self.registration.write().await.finish_activation(id) {
            self.emit_state(id, ServiceWorkerState::Activated);
            info!(worker = %id, "Service worker activated");
        }
        Ok(())
    }

    async fn retire(&self, worker: Option<ServiceWorker>) {
        if let Some(worker) = worker {
            self.workers.write().await.remove(&worker.id);
            self.emit_state(worker.id, ServiceWorkerState::Redundant);
            debug!(worker = %worker.id, "Service worker redundant");
        }
    }

    fn emit_state(&self, worker_id: ServiceWorkerId, new_state: ServiceWorkerState) {
        self.emit(ServiceWorkerEvent::StateChange {
            worker_id,
            new_state,
        });
    }

    fn emit(&self, event: ServiceWorkerEvent) {
        let _ = self.event_tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use goatkit_net::{StaticFetcher, StaticRoute};
    use http::StatusCode;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const SCOPE: &str = "https://goat-kids.example/";

    /// Records which signals arrived; optionally skips waiting on install.
    #[derive(Default)]
    struct Probe {
        skip_on_install: bool,
        installs: AtomicUsize,
        activates: AtomicUsize,
        messages: AtomicUsize,
        errors: AtomicUsize,
        fail_install: bool,
    }

    #[async_trait]
    impl ServiceWorkerHandler for Probe {
        async fn install(&self, scope: &WorkerScope) -> Result<(), SwError> {
            self.installs.fetch_add(1, Ordering::SeqCst);
            if self.fail_install {
                return Err(SwError::ScriptError("boom".to_string()));
            }
            if self.skip_on_install {
                scope.skip_waiting();
            }
            Ok(())
        }

        async fn activate(&self, scope: &WorkerScope) -> Result<(), SwError> {
            self.activates.fetch_add(1, Ordering::SeqCst);
            scope.claim_clients().await.map(|_| ())
        }

        async fn fetch(&self, _scope: &WorkerScope, event: &FetchEvent) -> FetchOutcome {
            if event.request.url.path() == "/hello" {
                FetchOutcome::Respond(Response::html("hello from worker"))
            } else if event.request.url.path() == "/broken" {
                FetchOutcome::NetworkError
            } else {
                FetchOutcome::PassThrough
            }
        }

        async fn message(&self, scope: &WorkerScope, event: MessageEvent) {
            self.messages.fetch_add(1, Ordering::SeqCst);
            if event.data == JsonValue::from("skipWaiting") {
                scope.skip_waiting();
            }
        }

        async fn error(&self, _scope: &WorkerScope, _event: ErrorEvent) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Listens to fetch only.
    struct FetchOnly;

    #[async_trait]
    impl ServiceWorkerHandler for FetchOnly {
        fn signals(&self) -> &[SignalKind] {
            &[SignalKind::Fetch]
        }

        async fn install(&self, _scope: &WorkerScope) -> Result<(), SwError> {
            Err(SwError::ScriptError("install should not be dispatched".to_string()))
        }
    }

    fn container_with(
        fetcher: Arc<StaticFetcher>,
    ) -> (
        ServiceWorkerContainer,
        mpsc::UnboundedReceiver<ServiceWorkerEvent>,
    ) {
        ServiceWorkerContainer::new(Url::parse(SCOPE).unwrap(), CacheStorage::new(), fetcher)
            .unwrap()
    }

    fn container() -> (
        ServiceWorkerContainer,
        mpsc::UnboundedReceiver<ServiceWorkerEvent>,
    ) {
        container_with(Arc::new(StaticFetcher::new()))
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServiceWorkerEvent>) -> Vec<ServiceWorkerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_first_worker_activates_immediately() {
        let (container, mut rx) = container();
        let probe = Arc::new(Probe::default());

        let id = container.register("sw.js", probe.clone()).await.unwrap();

        assert_eq!(container.active_worker().await, Some(id));
        assert_eq!(probe.installs.load(Ordering::SeqCst), 1);
        assert_eq!(probe.activates.load(Ordering::SeqCst), 1);

        let states: Vec<ServiceWorkerState> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                ServiceWorkerEvent::StateChange { new_state, .. } => Some(new_state),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![
                ServiceWorkerState::Installing,
                ServiceWorkerState::Installed,
                ServiceWorkerState::Activating,
                ServiceWorkerState::Activated,
            ]
        );
    }

    #[tokio::test]
    async fn test_update_waits_for_clients_to_close() {
        let (container, _rx) = container();
        let v1 = container
            .register("sw.js", Arc::new(Probe::default()))
            .await
            .unwrap();
        let page = container.open_client(SCOPE).await.unwrap();
        assert_eq!(page.controller, Some(v1));

        let v2 = container
            .register("sw.js", Arc::new(Probe::default()))
            .await
            .unwrap();
        assert_eq!(container.waiting_worker().await, Some(v2));
        assert_eq!(container.active_worker().await, Some(v1));

        assert!(container.close_client(page.id).await.unwrap());
        assert_eq!(container.active_worker().await, Some(v2));
        assert!(container.waiting_worker().await.is_none());
    }

    #[tokio::test]
    async fn test_skip_waiting_on_install_replaces_active_worker() {
        let (container, _rx) = container();
        let v1 = container
            .register("sw.js", Arc::new(Probe::default()))
            .await
            .unwrap();
        let page = container.open_client(SCOPE).await.unwrap();

        let v2 = container
            .register(
                "sw.js",
                Arc::new(Probe {
                    skip_on_install: true,
                    ..Default::default()
                }),
            )
            .await
            .unwrap();

        assert_eq!(container.active_worker().await, Some(v2));
        let clients = container.clients().await;
        assert_eq!(clients[0].id, page.id);
        assert_eq!(clients[0].controller, Some(v2));
        assert!(matches!(
            container.post_message(v1, JsonValue::Null, None).await,
            Err(SwError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_skip_waiting_message_activates_with_clients_open() {
        let (container, mut rx) = container();
        container
            .register("sw.js", Arc::new(Probe::default()))
            .await
            .unwrap();
        let page = container.open_client(SCOPE).await.unwrap();

        let probe = Arc::new(Probe::default());
        let v2 = container.register("sw.js", probe.clone()).await.unwrap();
        assert_eq!(container.waiting_worker().await, Some(v2));
        drain(&mut rx);

        container
            .post_message(v2, JsonValue::from("hello"), Some(page.id))
            .await
            .unwrap();
        assert_eq!(container.waiting_worker().await, Some(v2));

        container
            .post_message(v2, JsonValue::from("skipWaiting"), Some(page.id))
            .await
            .unwrap();

        assert_eq!(probe.messages.load(Ordering::SeqCst), 2);
        assert_eq!(container.active_worker().await, Some(v2));
        assert!(drain(&mut rx).contains(&ServiceWorkerEvent::StateChange {
            worker_id: v2,
            new_state: ServiceWorkerState::Activated,
        }));
        // The page is still open.
        assert_eq!(container.clients().await.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_install_makes_worker_redundant() {
        let (container, _rx) = container();
        let result = container
            .register(
                "sw.js",
                Arc::new(Probe {
                    fail_install: true,
                    ..Default::default()
                }),
            )
            .await;

        assert!(matches!(result, Err(SwError::InstallFailed(_))));
        let registration = container.registration().await;
        assert!(registration.installing.is_none());
        assert!(registration.waiting.is_none());
        assert!(registration.active.is_none());
    }

    #[tokio::test]
    async fn test_cross_origin_script_is_rejected() {
        let (container, _rx) = container();
        let result = container
            .register("https://evil.example/sw.js", Arc::new(Probe::default()))
            .await;
        assert!(matches!(result, Err(SwError::SecurityError(_))));
    }

    #[tokio::test]
    async fn test_dispatch_fetch_outcomes() {
        let fetcher = Arc::new(StaticFetcher::new().route(
            "https://goat-kids.example/net",
            StaticRoute::ok("text/plain", "from network"),
        ));
        let (container, _rx) = container_with(fetcher.clone());
        container
            .register("sw.js", Arc::new(Probe::default()))
            .await
            .unwrap();

        let url = |p: &str| Url::parse(SCOPE).unwrap().join(p).unwrap();

        let answered = container
            .dispatch_fetch(Request::get(url("hello")), None)
            .await
            .unwrap();
        assert_eq!(answered.text().unwrap(), "hello from worker");
        assert_eq!(fetcher.calls(), 0);

        let passed = container
            .dispatch_fetch(Request::get(url("net")), None)
            .await
            .unwrap();
        assert_eq!(passed.text().unwrap(), "from network");
        assert_eq!(fetcher.calls(), 1);

        let failed = container
            .dispatch_fetch(Request::get(url("broken")), None)
            .await;
        assert!(matches!(failed, Err(NetError::RequestFailed(_))));
    }

    #[tokio::test]
    async fn test_uncontrolled_client_goes_to_network() {
        let fetcher = Arc::new(StaticFetcher::new());
        let (container, _rx) = container_with(fetcher.clone());
        let page = container.open_client(SCOPE).await.unwrap();
        container
            .register("sw.js", Arc::new(FetchOnly))
            .await
            .unwrap();

        // Opened before any worker existed and never claimed.
        let response = container
            .dispatch_fetch(
                Request::get(Url::parse(SCOPE).unwrap().join("hello").unwrap()),
                Some(page.id),
            )
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::NOT_FOUND);
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_unlistened_signals_are_not_dispatched() {
        let (container, _rx) = container();
        // FetchOnly fails install if it ever receives it.
        let id = container
            .register("sw.js", Arc::new(FetchOnly))
            .await
            .unwrap();
        assert_eq!(container.active_worker().await, Some(id));
    }

    #[tokio::test]
    async fn test_activation_claims_open_clients() {
        let (container, mut rx) = container();
        let page = container.open_client(SCOPE).await.unwrap();
        assert!(page.controller.is_none());

        let id = container
            .register("sw.js", Arc::new(Probe::default()))
            .await
            .unwrap();

        assert_eq!(container.clients().await[0].controller, Some(id));
        assert!(drain(&mut rx).contains(&ServiceWorkerEvent::ControllerChange {
            client_id: page.id,
            worker_id: id,
        }));
    }

    #[tokio::test]
    async fn test_report_error_reaches_handler() {
        let (container, _rx) = container();
        let probe = Arc::new(Probe::default());
        let id = container.register("sw.js", probe.clone()).await.unwrap();

        container
            .report_error(id, "ReferenceError: x is not defined", Some("sw.js"))
            .await
            .unwrap();
        assert_eq!(probe.errors.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_resume_restores_active_worker() {
        let (container, mut rx) = container();
        let probe = Arc::new(Probe::default());
        let id = container.resume("sw.js", probe.clone()).await.unwrap();

        assert_eq!(container.active_worker().await, Some(id));
        assert_eq!(probe.installs.load(Ordering::SeqCst), 0);
        assert_eq!(probe.activates.load(Ordering::SeqCst), 0);
        assert_eq!(
            drain(&mut rx),
            vec![ServiceWorkerEvent::StateChange {
                worker_id: id,
                new_state: ServiceWorkerState::Activated,
            }]
        );
    }

    #[tokio::test]
    async fn test_settle_awaits_background_work() {
        struct Background;

        #[async_trait]
        impl ServiceWorkerHandler for Background {
            async fn install(&self, scope: &WorkerScope) -> Result<(), SwError> {
                let caches = scope.caches().clone();
                scope.wait_until(async move {
                    tokio::task::yield_now().await;
                    let _ = caches.open("late").await;
                });
                Ok(())
            }
        }

        let (container, _rx) = container();
        container
            .register("sw.js", Arc::new(Background))
            .await
            .unwrap();
        container.settle().await;
        assert!(container.caches().has("late").await);
    }
}
