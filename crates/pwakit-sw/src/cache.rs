//! Cache storage: named generations of request → response entries.
//!
//! ```text
//! CacheStorage (caches)
//!     ├── "app-static-v2"  ── Cache ── CacheKey → CacheEntry
//!     └── "app-dynamic-v2" ── Cache ── CacheKey → CacheEntry
//! ```

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use hashbrown::HashMap;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use pwakit_net::{Request, Response, ResponseType};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, trace};
use url::Url;

use crate::ServiceWorkerError;

// ==================== Keys ====================

/// Normalized request key: upper-case method plus URL without fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    method: String,
    url: String,
}

impl CacheKey {
    /// Key for `method` on `url`.
    pub fn new(method: &Method, url: &Url) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);
        Self {
            method: method.as_str().to_ascii_uppercase(),
            url: url.into(),
        }
    }

    /// Key for a GET of `url`.
    pub fn get(url: &Url) -> Self {
        Self::new(&Method::GET, url)
    }

    /// Key for an intercepted request.
    pub fn from_request(request: &Request) -> Self {
        Self::new(&request.method, &request.url)
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.url)
    }
}

// ==================== Entries ====================

/// A cached response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Request URL.
    pub url: String,

    /// Request method.
    pub method: String,

    /// Response status.
    pub status: u16,

    /// Response reason phrase.
    pub status_text: String,

    /// Response headers, in order. Values are kept as raw bytes.
    pub headers: Vec<(String, Vec<u8>)>,

    /// Response type at the time it was stored.
    pub response_type: ResponseType,

    /// Response body.
    pub body: Vec<u8>,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    /// Snapshot a response for storage under `key`.
    pub fn from_response(key: &CacheKey, response: &Response) -> Self {
        let headers = response
            .headers
            .iter()
            .map(|(name, value)| (name.as_str().to_string(), value.as_bytes().to_vec()))
            .collect();

        Self {
            url: key.url().to_string(),
            method: key.method().to_string(),
            status: response.status.as_u16(),
            status_text: response.status_text.clone(),
            headers,
            response_type: response.response_type,
            body: response.body().to_vec(),
            cached_at: now_millis(),
        }
    }

    /// Rebuild a response from the stored snapshot.
    pub fn to_response(&self) -> Response {
        let mut headers = HeaderMap::with_capacity(self.headers.len());
        for (name, value) in &self.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_bytes(value),
            ) {
                headers.append(name, value);
            }
        }

        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut response = Response::new(status, Bytes::from(self.body.clone()))
            .with_headers(headers)
            .with_status_text(self.status_text.clone())
            .with_type(self.response_type);
        if let Ok(url) = Url::parse(&self.url) {
            response = response.with_url(url);
        }
        response
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ==================== Generation ====================

/// One named cache generation.
#[derive(Debug, Default, Clone)]
pub struct Cache {
    /// Cache name.
    pub name: String,

    /// Cached entries.
    entries: HashMap<CacheKey, CacheEntry>,
}

impl Cache {
    /// Create a new, empty generation.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: HashMap::new(),
        }
    }

    /// Match a request key.
    pub fn match_request(&self, key: &CacheKey) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    /// Store an entry, replacing any previous one for the key.
    pub fn put(&mut self, key: CacheKey, entry: CacheEntry) {
        self.entries.insert(key, entry);
    }

    /// Delete entry.
    pub fn delete(&mut self, key: &CacheKey) -> bool {
        self.entries.remove(key).is_some()
    }

    /// All keys.
    pub fn keys(&self) -> Vec<&CacheKey> {
        self.entries.keys().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ==================== Storage ====================

/// The cache storage the manager runs against.
///
/// Implementations must give atomic per-key reads and writes, and
/// [`CacheStorage::put_all`] must store either every entry or none.
#[async_trait]
pub trait CacheStorage: Send + Sync {
    /// Open a generation, creating it if needed.
    async fn open(&self, name: &str) -> Result<(), ServiceWorkerError>;

    /// Whether a generation exists.
    async fn has(&self, name: &str) -> bool;

    /// Generation names, in creation order.
    async fn keys(&self) -> Vec<String>;

    /// Delete a generation. Returns whether it existed.
    async fn delete(&self, name: &str) -> bool;

    /// Match a key inside one generation.
    async fn match_in(
        &self,
        name: &str,
        key: &CacheKey,
    ) -> Result<Option<CacheEntry>, ServiceWorkerError>;

    /// Match a key across every generation, oldest generation first.
    async fn match_any(&self, key: &CacheKey) -> Result<Option<CacheEntry>, ServiceWorkerError>;

    /// Store one entry, creating the generation if needed.
    async fn put(
        &self,
        name: &str,
        key: CacheKey,
        entry: CacheEntry,
    ) -> Result<(), ServiceWorkerError>;

    /// Store one entry only if the generation still exists.
    ///
    /// Returns `false` without writing when the generation is gone. The
    /// existence check and the write happen atomically.
    async fn put_if_present(
        &self,
        name: &str,
        key: CacheKey,
        entry: CacheEntry,
    ) -> Result<bool, ServiceWorkerError>;

    /// Store a batch of entries atomically.
    async fn put_all(
        &self,
        name: &str,
        entries: Vec<(CacheKey, CacheEntry)>,
    ) -> Result<(), ServiceWorkerError>;
}

/// In-process cache storage.
#[derive(Debug, Default)]
pub struct MemoryCacheStorage {
    generations: RwLock<Vec<Cache>>,
}

impl MemoryCacheStorage {
    /// Create new cache storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries in a generation, if it exists.
    pub async fn entry_count(&self, name: &str) -> Option<usize> {
        self.generations
            .read()
            .await
            .iter()
            .find(|c| c.name == name)
            .map(Cache::len)
    }

    fn find_or_create<'a>(generations: &'a mut Vec<Cache>, name: &str) -> &'a mut Cache {
        match generations.iter().position(|c| c.name == name) {
            Some(index) => &mut generations[index],
            None => {
                debug!(cache = name, "Creating cache generation");
                generations.push(Cache::new(name));
                let last = generations.len() - 1;
                &mut generations[last]
            }
        }
    }
}

#[async_trait]
impl CacheStorage for MemoryCacheStorage {
    async fn open(&self, name: &str) -> Result<(), ServiceWorkerError> {
        let mut generations = self.generations.write().await;
        Self::find_or_create(&mut generations, name);
        Ok(())
    }

    async fn has(&self, name: &str) -> bool {
        self.generations.read().await.iter().any(|c| c.name == name)
    }

    async fn keys(&self) -> Vec<String> {
        self.generations
            .read()
            .await
            .iter()
            .map(|c| c.name.clone())
            .collect()
    }

    async fn delete(&self, name: &str) -> bool {
        let mut generations = self.generations.write().await;
        let before = generations.len();
        generations.retain(|c| c.name != name);
        before != generations.len()
    }

    async fn match_in(
        &self,
        name: &str,
        key: &CacheKey,
    ) -> Result<Option<CacheEntry>, ServiceWorkerError> {
        let generations = self.generations.read().await;
        Ok(generations
            .iter()
            .find(|c| c.name == name)
            .and_then(|c| c.match_request(key))
            .cloned())
    }

    async fn match_any(&self, key: &CacheKey) -> Result<Option<CacheEntry>, ServiceWorkerError> {
        let generations = self.generations.read().await;
        for cache in generations.iter() {
            if let Some(entry) = cache.match_request(key) {
                trace!(cache = %cache.name, key = %key, "Cache match");
                return Ok(Some(entry.clone()));
            }
        }
        Ok(None)
    }

    async fn put(
        &self,
        name: &str,
        key: CacheKey,
        entry: CacheEntry,
    ) -> Result<(), ServiceWorkerError> {
        let mut generations = self.generations.write().await;
        Self::find_or_create(&mut generations, name).put(key, entry);
        Ok(())
    }

    async fn put_if_present(
        &self,
        name: &str,
        key: CacheKey,
        entry: CacheEntry,
    ) -> Result<bool, ServiceWorkerError> {
        let mut generations = self.generations.write().await;
        match generations.iter_mut().find(|c| c.name == name) {
            Some(cache) => {
                cache.put(key, entry);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn put_all(
        &self,
        name: &str,
        entries: Vec<(CacheKey, CacheEntry)>,
    ) -> Result<(), ServiceWorkerError> {
        // One write lock for the whole batch.
        let mut generations = self.generations.write().await;
        let cache = Self::find_or_create(&mut generations, name);
        for (key, entry) in entries {
            cache.put(key, entry);
        }
        Ok(())
    }
}
