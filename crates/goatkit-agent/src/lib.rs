//! # GoatKit Agent
//!
//! Offline-first asset caching for the GOAT KIDS web app, run as a service
//! worker on the `goatkit-sw` host.
//!
//! ## Behaviour
//!
//! - **install**: fetch and store the seed list; failures are logged per
//!   entry and never abort the install; always skips waiting
//! - **activate**: delete every store but the current one, claim clients
//! - **fetch**: same-origin GETs are served cache-first; OK basic network
//!   responses are stored in the background; when the network is down,
//!   documents fall back to the stored root document and everything else
//!   to a synthesized offline page
//! - **message**: `"skipWaiting"` activates a waiting worker
//! - **error**: logged
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use goatkit_agent::{AgentConfig, CacheAgent};
//! use goatkit_net::{HttpFetcher, Request};
//! use goatkit_sw::{CacheStorage, ServiceWorkerContainer};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = AgentConfig::default();
//! let fetcher = Arc::new(HttpFetcher::new(config.loader_config())?);
//! let (container, _events) =
//!     ServiceWorkerContainer::new(config.scope_url()?, CacheStorage::new(), fetcher)?;
//!
//! container.register("sw.js", Arc::new(CacheAgent::new(config.clone()))).await?;
//! let page = container.open_client(&config.scope).await?;
//! let response = container
//!     .dispatch_fetch(Request::get(config.scope_url()?.join("index.html")?), Some(page.id))
//!     .await?;
//! container.settle().await;
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod config;
pub mod offline;

pub use agent::{CacheAgent, SKIP_WAITING};
pub use config::{AgentConfig, ConfigError, HtmlFallbackMiss};
pub use offline::offline_page;
