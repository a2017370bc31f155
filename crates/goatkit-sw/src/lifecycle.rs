//! Worker lifecycle: ids, states, registrations and the events they emit.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::clients::ClientId;

/// Unique identifier for a service worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceWorkerId(u64);

impl ServiceWorkerId {
    pub(crate) fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ServiceWorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sw-{}", self.0)
    }
}

/// Service worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceWorkerState {
    /// Script parsed, nothing dispatched yet.
    #[default]
    Parsed,
    /// Install signal in flight.
    Installing,
    /// Installed, waiting for activation.
    Installed,
    /// Activate signal in flight.
    Activating,
    /// Active and controlling pages.
    Activated,
    /// Replaced, or install failed.
    Redundant,
}

impl std::fmt::Display for ServiceWorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ServiceWorkerState::Parsed => "parsed",
            ServiceWorkerState::Installing => "installing",
            ServiceWorkerState::Installed => "installed",
            ServiceWorkerState::Activating => "activating",
            ServiceWorkerState::Activated => "activated",
            ServiceWorkerState::Redundant => "redundant",
        };
        f.write_str(name)
    }
}

/// A service worker instance.
#[derive(Debug, Clone)]
pub struct ServiceWorker {
    /// Unique ID.
    pub id: ServiceWorkerId,

    /// Script URL.
    pub script_url: Url,

    /// Current state.
    pub state: ServiceWorkerState,

    /// Time of last state change.
    pub state_changed_at: Instant,
}

impl ServiceWorker {
    /// Create a new service worker.
    pub fn new(script_url: Url) -> Self {
        Self {
            id: ServiceWorkerId::new(),
            script_url,
            state: ServiceWorkerState::Parsed,
            state_changed_at: Instant::now(),
        }
    }

    /// Set state.
    pub fn set_state(&mut self, state: ServiceWorkerState) {
        self.state = state;
        self.state_changed_at = Instant::now();
    }

    /// Check if active.
    pub fn is_active(&self) -> bool {
        self.state == ServiceWorkerState::Activated
    }

    /// Check if redundant.
    pub fn is_redundant(&self) -> bool {
        self.state == ServiceWorkerState::Redundant
    }
}

/// Lifecycle notifications published by the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceWorkerEvent {
    /// A new worker started installing.
    UpdateFound { worker_id: ServiceWorkerId },
    /// A worker changed state.
    StateChange {
        worker_id: ServiceWorkerId,
        new_state: ServiceWorkerState,
    },
    /// A client got a new controller.
    ControllerChange {
        client_id: ClientId,
        worker_id: ServiceWorkerId,
    },
}

/// A service worker registration for one scope.
#[derive(Debug, Clone)]
pub struct Registration {
    /// Scope URL.
    pub scope: Url,

    /// Installing worker.
    pub installing: Option<ServiceWorker>,

    /// Waiting worker (installed but not active).
    pub waiting: Option<ServiceWorker>,

    /// Active worker.
    pub active: Option<ServiceWorker>,
}

impl Registration {
    /// Create a new registration.
    pub fn new(scope: Url) -> Self {
        Self {
            scope,
            installing: None,
            waiting: None,
            active: None,
        }
    }

    /// Check whether `url` falls under this registration's scope.
    pub fn in_scope(&self, url: &Url) -> bool {
        url.as_str().starts_with(self.scope.as_str())
    }

    /// Start installing `worker`. Returns a displaced installing worker.
    pub fn begin_install(&mut self, mut worker: ServiceWorker) -> Option<ServiceWorker> {
        worker.set_state(ServiceWorkerState::Installing);
        let displaced = self.installing.replace(worker);
        displaced.map(Self::retire)
    }

    /// Transition installing to waiting. Returns a displaced waiting worker.
    pub fn install_complete(&mut self) -> Option<ServiceWorker> {
        let mut worker = self.installing.take()?;
        worker.set_state(ServiceWorkerState::Installed);
        self.waiting.replace(worker).map(Self::retire)
    }

    /// Drop the installing worker after a failed install.
    pub fn install_failed(&mut self) -> Option<ServiceWorker> {
        self.installing.take().map(Self::retire)
    }

    /// Promote the waiting worker to active in the `Activating` state.
    ///
    /// Returns the promoted worker's id and the previous active worker, now
    /// redundant.
    pub fn begin_activation(&mut self) -> Option<(ServiceWorkerId, Option<ServiceWorker>)> {
        let mut worker = self.waiting.take()?;
        worker.set_state(ServiceWorkerState::Activating);
        let id = worker.id;
        let previous = self.active.replace(worker).map(Self::retire);
        Some((id, previous))
    }

    /// Mark the active worker `Activated`.
    pub fn finish_activation(&mut self, id: ServiceWorkerId) -> bool {
        match self.active.as_mut() {
            Some(worker) if worker.id == id => {
                worker.set_state(ServiceWorkerState::Activated);
                true
            }
            _ => false,
        }
    }

    /// Install `worker` directly as the activated worker.
    pub fn restore_active(&mut self, mut worker: ServiceWorker) -> Option<ServiceWorker> {
        worker.set_state(ServiceWorkerState::Activated);
        self.active.replace(worker).map(Self::retire)
    }

    /// Id of the active worker once it has finished activating.
    pub fn activated_id(&self) -> Option<ServiceWorkerId> {
        self.active.as_ref().filter(|w| w.is_active()).map(|w| w.id)
    }

    fn retire(mut worker: ServiceWorker) -> ServiceWorker {
        worker.set_state(ServiceWorkerState::Redundant);
        worker
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn script() -> Url {
        Url::parse("https://goat-kids.example/sw.js").unwrap()
    }

    fn registration() -> Registration {
        Registration::new(Url::parse("https://goat-kids.example/").unwrap())
    }

    #[test]
    fn test_service_worker_creation() {
        let worker = ServiceWorker::new(script());
        assert_eq!(worker.script_url, script());
        assert_eq!(worker.state, ServiceWorkerState::Parsed);
        assert!(!worker.is_active());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ServiceWorkerState::Activating.to_string(), "activating");
        assert_eq!(ServiceWorkerState::Redundant.to_string(), "redundant");
    }

    #[test]
    fn test_registration_lifecycle() {
        let mut reg = registration();
        let worker = ServiceWorker::new(script());
        let id = worker.id;

        assert!(reg.begin_install(worker).is_none());
        assert_eq!(
            reg.installing.as_ref().unwrap().state,
            ServiceWorkerState::Installing
        );

        // Installing -> Installed
        assert!(reg.install_complete().is_none());
        assert!(reg.installing.is_none());
        assert_eq!(reg.waiting.as_ref().unwrap().state, ServiceWorkerState::Installed);

        // Installed -> Activating -> Activated
        let (activated, previous) = reg.begin_activation().unwrap();
        assert_eq!(activated, id);
        assert!(previous.is_none());
        assert_eq!(reg.activated_id(), None);
        assert!(reg.finish_activation(id));
        assert_eq!(reg.activated_id(), Some(id));
    }

    #[test]
    fn test_activation_retires_previous_worker() {
        let mut reg = registration();
        let old = ServiceWorker::new(script());
        let old_id = old.id;
        reg.restore_active(old);

        reg.begin_install(ServiceWorker::new(script()));
        reg.install_complete();
        let (_, previous) = reg.begin_activation().unwrap();

        let previous = previous.unwrap();
        assert_eq!(previous.id, old_id);
        assert!(previous.is_redundant());
    }

    #[test]
    fn test_failed_install() {
        let mut reg = registration();
        reg.begin_install(ServiceWorker::new(script()));
        let failed = reg.install_failed().unwrap();
        assert!(failed.is_redundant());
        assert!(reg.waiting.is_none());
        assert!(reg.begin_activation().is_none());
    }

    #[test]
    fn test_in_scope() {
        let reg = registration();
        assert!(reg.in_scope(&Url::parse("https://goat-kids.example/index.html").unwrap()));
        assert!(!reg.in_scope(&Url::parse("https://other.example/").unwrap()));
    }
}
