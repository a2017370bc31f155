//! # GoatKit Service Workers
//!
//! Host runtime for offline-first service workers.
//!
//! ## Features
//!
//! - **Registration**: `navigator.serviceWorker.register()`
//! - **Lifecycle**: install, activate, skip-waiting, claim
//! - **Cache API**: `caches.open()`, `cache.put()`, `caches.match()`
//! - **Clients API**: pages a worker controls
//! - **Fetch Interception**: workers answer, fail or pass requests through
//!
//! ## Architecture
//!
//! ```text
//! ServiceWorkerContainer (navigator.serviceWorker)
//!     │
//!     ├── Registration
//!     │       ├── installing (ServiceWorker)
//!     │       ├── waiting (ServiceWorker)
//!     │       ├── active (ServiceWorker)
//!     │       └── scope
//!     │
//!     ├── workers: id → ServiceWorkerHandler + WorkerScope
//!     └── Clients
//!
//! CacheStorage (caches)
//!     └── Cache
//!             └── Request → Response
//! ```

use thiserror::Error;

pub mod cache;
pub mod clients;
pub mod container;
pub mod handler;
pub mod lifecycle;
pub mod scope;

pub use cache::{request_key, Cache, CacheEntry, CacheStorage};
pub use clients::{Client, ClientId, Clients};
pub use container::ServiceWorkerContainer;
pub use handler::{
    ErrorEvent, FetchEvent, FetchOutcome, MessageEvent, ServiceWorkerHandler, SignalKind,
};
pub use lifecycle::{
    Registration, ServiceWorker, ServiceWorkerEvent, ServiceWorkerId, ServiceWorkerState,
};
pub use scope::WorkerScope;

/// Errors that can occur in service worker operations.
#[derive(Error, Debug, Clone)]
pub enum SwError {
    #[error("Registration failed: {0}")]
    RegistrationFailed(String),

    #[error("Install failed: {0}")]
    InstallFailed(String),

    #[error("Script error: {0}")]
    ScriptError(String),

    #[error("Security error: {0}")]
    SecurityError(String),

    #[error("State error: {0}")]
    StateError(String),

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SwError::CacheError("Only GET requests can be cached".to_string());
        assert_eq!(err.to_string(), "Cache error: Only GET requests can be cached");
        let err = SwError::InstallFailed("seed fetch".to_string());
        assert_eq!(err.to_string(), "Install failed: seed fetch");
    }
}
