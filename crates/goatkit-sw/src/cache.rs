//! Cache API: named stores of request → response pairs.
//!
//! [`CacheStorage`] is the `caches` global. It hands out [`Cache`] handles that
//! share state, so a handle obtained in one handler sees writes made through
//! another. Storage can be snapshotted to a JSON file and loaded back, which
//! is what lets stores outlive a worker restart.

use std::path::Path;
use std::sync::Arc;

use hashbrown::HashMap;
use http::{HeaderMap, Method, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, trace};
use url::Url;

use goatkit_common::unix_millis;
use goatkit_net::{Request, Response, ResponseType};

use crate::SwError;

const SNAPSHOT_VERSION: u32 = 2;

/// Identity of a stored request: method plus URL without fragment.
pub fn request_key(method: &Method, url: &Url) -> String {
    let mut url = url.clone();
    url.set_fragment(None);
    format!("{} {}", method, url)
}

/// A cached request/response pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Request URL.
    pub url: String,

    /// Request method.
    pub method: String,

    /// Response status.
    #[serde(with = "status_code")]
    pub status: StatusCode,

    /// Response type (`basic`, `cors`, ...).
    #[serde(with = "response_type_name")]
    pub response_type: ResponseType,

    /// Response headers, repeated names and raw values included.
    #[serde(with = "header_list")]
    pub headers: HeaderMap,

    /// Response body.
    #[serde(with = "bytes_base64")]
    pub body: Vec<u8>,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    fn key(&self) -> String {
        format!("{} {}", self.method, self.url)
    }

    /// Rebuild a response from this entry.
    pub fn to_response(&self) -> Response {
        let mut response =
            Response::new(self.status, self.body.clone()).with_type(self.response_type);
        if let Ok(url) = Url::parse(&self.url) {
            response = response.with_url(url);
        }
        response.headers = self.headers.clone();
        response
    }
}

mod bytes_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

mod status_code {
    use http::StatusCode;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(status: &StatusCode, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u16(status.as_u16())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<StatusCode, D::Error> {
        let code = u16::deserialize(deserializer)?;
        StatusCode::from_u16(code)
            .map_err(|_| serde::de::Error::custom(format!("invalid status code {}", code)))
    }
}

mod response_type_name {
    use goatkit_net::ResponseType;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        response_type: &ResponseType,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(response_type.as_str())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<ResponseType, D::Error> {
        let name = String::deserialize(deserializer)?;
        ResponseType::from_name(&name)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown response type '{}'", name)))
    }
}

/// Headers as an ordered list of name/value pairs. Values are base64 so
/// bytes outside visible ASCII survive.
mod header_list {
    use http::{HeaderMap, HeaderName, HeaderValue};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    struct StoredHeader {
        name: String,
        #[serde(with = "super::bytes_base64")]
        value: Vec<u8>,
    }

    pub fn serialize<S: Serializer>(headers: &HeaderMap, serializer: S) -> Result<S::Ok, S::Error> {
        let list: Vec<StoredHeader> = headers
            .iter()
            .map(|(name, value)| StoredHeader {
                name: name.as_str().to_string(),
                value: value.as_bytes().to_vec(),
            })
            .collect();
        list.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<HeaderMap, D::Error> {
        let list = Vec::<StoredHeader>::deserialize(deserializer)?;
        let mut headers = HeaderMap::with_capacity(list.len());
        for stored in list {
            let name = HeaderName::from_bytes(stored.name.as_bytes())
                .map_err(|e| serde::de::Error::custom(format!("header '{}': {}", stored.name, e)))?;
            let value = HeaderValue::from_bytes(&stored.value)
                .map_err(|e| serde::de::Error::custom(format!("header '{}': {}", stored.name, e)))?;
            headers.append(name, value);
        }
        Ok(headers)
    }
}

/// A named cache. Cheap to clone; clones share entries.
#[derive(Debug, Clone)]
pub struct Cache {
    name: Arc<str>,
    entries: Arc<RwLock<HashMap<String, CacheEntry>>>,
}

impl Cache {
    fn new(name: &str) -> Self {
        Self {
            name: Arc::from(name),
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn from_entries(name: &str, entries: Vec<CacheEntry>) -> Self {
        let map = entries.into_iter().map(|e| (e.key(), e)).collect();
        Self {
            name: Arc::from(name),
            entries: Arc::new(RwLock::new(map)),
        }
    }

    /// Cache name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Match a request.
    pub async fn match_request(&self, request: &Request) -> Option<Response> {
        let key = request_key(&request.method, &request.url);
        self.entries.read().await.get(&key).map(CacheEntry::to_response)
    }

    /// Match a GET for `url`.
    pub async fn match_url(&self, url: &Url) -> Option<Response> {
        let key = request_key(&Method::GET, url);
        self.entries.read().await.get(&key).map(CacheEntry::to_response)
    }

    /// Store `response` under `request`. The response is consumed.
    ///
    /// Rejects non-GET requests, non-http(s) URLs and `206 Partial Content`.
    pub async fn put(&self, request: &Request, mut response: Response) -> Result<(), SwError> {
        if request.method != Method::GET {
            return Err(SwError::CacheError(format!(
                "Request method '{}' is unsupported",
                request.method
            )));
        }
        if !matches!(request.url.scheme(), "http" | "https") {
            return Err(SwError::CacheError(format!(
                "Request scheme '{}' is unsupported",
                request.url.scheme()
            )));
        }
        if response.status == StatusCode::PARTIAL_CONTENT {
            return Err(SwError::CacheError(
                "Partial response (status code 206) is unsupported".to_string(),
            ));
        }

        let mut url = request.url.clone();
        url.set_fragment(None);

        let entry = CacheEntry {
            url: url.to_string(),
            method: request.method.to_string(),
            status: response.status,
            response_type: response.response_type,
            headers: std::mem::take(&mut response.headers),
            cached_at: unix_millis(),
            body: response.bytes().to_vec(),
        };

        trace!(cache = %self.name, url = %entry.url, bytes = entry.body.len(), "Cache put");
        self.entries.write().await.insert(entry.key(), entry);
        Ok(())
    }

    /// Delete the entry for a request.
    pub async fn delete(&self, request: &Request) -> bool {
        let key = request_key(&request.method, &request.url);
        self.entries.write().await.remove(&key).is_some()
    }

    /// All stored request URLs, sorted.
    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .entries
            .read()
            .await
            .values()
            .map(|e| e.url.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Number of entries.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    async fn snapshot(&self) -> CacheSnapshot {
        let mut entries: Vec<CacheEntry> = self.entries.read().await.values().cloned().collect();
        entries.sort_by(|a, b| a.url.cmp(&b.url));
        CacheSnapshot {
            name: self.name.to_string(),
            entries,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheSnapshot {
    name: String,
    entries: Vec<CacheEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StorageSnapshot {
    version: u32,
    caches: Vec<CacheSnapshot>,
}

#[derive(Debug)]
struct StorageState {
    /// `Some(reason)` when the host refuses storage access.
    unavailable: Option<String>,
    /// Caches in creation order.
    caches: Vec<Cache>,
}

/// Cache storage (the `caches` global). Cheap to clone; clones share state.
#[derive(Debug, Clone)]
pub struct CacheStorage {
    state: Arc<RwLock<StorageState>>,
}

impl Default for CacheStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheStorage {
    /// Create empty cache storage.
    pub fn new() -> Self {
        Self::with_state(StorageState {
            unavailable: None,
            caches: Vec::new(),
        })
    }

    /// Storage the host refuses to open (private browsing, quota lockout).
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::with_state(StorageState {
            unavailable: Some(reason.into()),
            caches: Vec::new(),
        })
    }

    fn with_state(state: StorageState) -> Self {
        Self {
            state: Arc::new(RwLock::new(state)),
        }
    }

    /// Open a cache (creates if doesn't exist).
    pub async fn open(&self, name: &str) -> Result<Cache, SwError> {
        let mut state = self.state.write().await;
        if let Some(ref reason) = state.unavailable {
            return Err(SwError::SecurityError(format!(
                "Cache storage unavailable: {}",
                reason
            )));
        }
        if let Some(cache) = state.caches.iter().find(|c| c.name() == name) {
            return Ok(cache.clone());
        }
        debug!(cache = %name, "Creating cache");
        let cache = Cache::new(name);
        state.caches.push(cache.clone());
        Ok(cache)
    }

    /// Check if cache exists.
    pub async fn has(&self, name: &str) -> bool {
        self.state.read().await.caches.iter().any(|c| c.name() == name)
    }

    /// Delete a cache.
    pub async fn delete(&self, name: &str) -> bool {
        let mut state = self.state.write().await;
        let before = state.caches.len();
        state.caches.retain(|c| c.name() != name);
        state.caches.len() != before
    }

    /// All cache names, in creation order.
    pub async fn keys(&self) -> Vec<String> {
        self.state
            .read()
            .await
            .caches
            .iter()
            .map(|c| c.name().to_string())
            .collect()
    }

    /// Match across all caches, oldest cache first.
    pub async fn match_request(&self, request: &Request) -> Option<Response> {
        let caches = self.state.read().await.caches.clone();
        for cache in caches {
            if let Some(response) = cache.match_request(request).await {
                return Some(response);
            }
        }
        None
    }

    /// Match a GET for `url` across all caches.
    pub async fn match_url(&self, url: &Url) -> Option<Response> {
        let caches = self.state.read().await.caches.clone();
        for cache in caches {
            if let Some(response) = cache.match_url(url).await {
                return Some(response);
            }
        }
        None
    }

    /// Load storage from a snapshot file. A missing file yields empty storage.
    pub async fn load(path: &Path) -> Result<Self, SwError> {
        let contents = match tokio::fs::read_to_string(path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No cache snapshot, starting empty");
                return Ok(Self::new());
            }
            Err(e) => return Err(SwError::Storage(format!("{}: {}", path.display(), e))),
        };

        let snapshot: StorageSnapshot = serde_json::from_str(&contents)
            .map_err(|e| SwError::Storage(format!("{}: {}", path.display(), e)))?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(SwError::Storage(format!(
                "{}: unsupported snapshot version {}",
                path.display(),
                snapshot.version
            )));
        }

        let caches: Vec<Cache> = snapshot
            .caches
            .into_iter()
            .map(|c| Cache::from_entries(&c.name, c.entries))
            .collect();
        info!(path = %path.display(), caches = caches.len(), "Loaded cache snapshot");

        Ok(Self::with_state(StorageState {
            unavailable: None,
            caches,
        }))
    }

    /// Write every cache to a snapshot file.
    pub async fn save(&self, path: &Path) -> Result<(), SwError> {
        let caches = self.state.read().await.caches.clone();
        let mut snapshots = Vec::with_capacity(caches.len());
        for cache in &caches {
            snapshots.push(cache.snapshot().await);
        }
        let snapshot = StorageSnapshot {
            version: SNAPSHOT_VERSION,
            caches: snapshots,
        };

        let data = serde_json::to_string_pretty(&snapshot)
            .map_err(|e| SwError::Storage(e.to_string()))?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SwError::Storage(format!("{}: {}", parent.display(), e)))?;
        }
        tokio::fs::write(path, data)
            .await
            .map_err(|e| SwError::Storage(format!("{}: {}", path.display(), e)))?;

        debug!(path = %path.display(), caches = caches.len(), "Saved cache snapshot");
        Ok(())
    }
}
