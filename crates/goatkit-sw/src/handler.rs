//! Lifecycle signals and the handler trait a worker implements.

use async_trait::async_trait;
use goatkit_net::{Request, Response};
use serde_json::Value as JsonValue;

use crate::clients::ClientId;
use crate::scope::WorkerScope;
use crate::SwError;

/// The signals a host delivers to a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    Install,
    Activate,
    Fetch,
    Message,
    Error,
}

impl SignalKind {
    pub const ALL: [SignalKind; 5] = [
        SignalKind::Install,
        SignalKind::Activate,
        SignalKind::Fetch,
        SignalKind::Message,
        SignalKind::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::Install => "install",
            SignalKind::Activate => "activate",
            SignalKind::Fetch => "fetch",
            SignalKind::Message => "message",
            SignalKind::Error => "error",
        }
    }
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fetch event.
#[derive(Debug)]
pub struct FetchEvent {
    /// The intercepted request. Owned by the host.
    pub request: Request,

    /// Client that issued the request, if any.
    pub client_id: Option<ClientId>,
}

/// How a worker answered a fetch event.
#[derive(Debug)]
pub enum FetchOutcome {
    /// Not handled; the host performs its default network fetch.
    PassThrough,
    /// Answer with this response.
    Respond(Response),
    /// Fail the fetch (a failed navigation, for documents).
    NetworkError,
}

/// A message posted to a worker.
#[derive(Debug, Clone)]
pub struct MessageEvent {
    /// Structured payload.
    pub data: JsonValue,

    /// Posting client, if any.
    pub source: Option<ClientId>,
}

/// An uncaught error reported against a worker.
#[derive(Debug, Clone)]
pub struct ErrorEvent {
    pub message: String,
    pub filename: Option<String>,
}

/// Handler bound to a worker's lifecycle signals.
///
/// The host only delivers signals listed in [`ServiceWorkerHandler::signals`];
/// for anything else it applies default behaviour. Install and activate are
/// awaited to completion before the host finishes the state transition.
#[async_trait]
pub trait ServiceWorkerHandler: Send + Sync {
    /// Signals this handler listens to.
    fn signals(&self) -> &[SignalKind] {
        &SignalKind::ALL
    }

    fn listens(&self, kind: SignalKind) -> bool {
        self.signals().contains(&kind)
    }

    async fn install(&self, _scope: &WorkerScope) -> Result<(), SwError> {
        Ok(())
    }

    async fn activate(&self, _scope: &WorkerScope) -> Result<(), SwError> {
        Ok(())
    }

    async fn fetch(&self, _scope: &WorkerScope, _event: &FetchEvent) -> FetchOutcome {
        FetchOutcome::PassThrough
    }

    async fn message(&self, _scope: &WorkerScope, _event: MessageEvent) {}

    async fn error(&self, _scope: &WorkerScope, _event: ErrorEvent) {}
}
