//! Versioned resource store (Cache API).
//!
//! A [`CacheStorage`] holds named generations; each [`Cache`] maps a
//! normalized request identity to a captured response. Entries never expire
//! by time: a generation is only ever replaced wholesale.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use futures::future::try_join_all;
use hashbrown::HashMap;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use pwakit_net::{Network, Request, Response, ResponseType};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::CacheError;

// ==================== Keys & Entries ====================

/// Normalized request identity: upper-cased method plus URL without fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestKey {
    pub method: String,
    pub url: String,
}

impl RequestKey {
    /// Build a key from method and URL.
    pub fn new(method: &Method, url: &Url) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);
        Self {
            method: method.as_str().to_ascii_uppercase(),
            url: url.into(),
        }
    }

    /// Key for a request.
    pub fn from_request(request: &Request) -> Self {
        Self::new(&request.method, &request.url)
    }

    /// Key for a GET of `url`.
    pub fn get(url: &Url) -> Self {
        Self::new(&Method::GET, url)
    }
}

/// A cached request/response pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Request method.
    pub method: String,

    /// Request URL.
    pub url: String,

    /// Final response URL (after redirects).
    pub response_url: String,

    /// Response status.
    pub status: u16,

    /// Response headers, in order, repeated names allowed.
    pub headers: Vec<(String, String)>,

    /// Response type name.
    pub response_type: String,

    /// Whether the response came through a redirect.
    pub redirected: bool,

    /// Response body.
    pub body: Bytes,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    /// Capture a buffered response under `key`.
    pub fn capture(key: &RequestKey, response: &Response) -> Result<Self, CacheError> {
        let body = response.body().ok_or(CacheError::NotBuffered)?;
        let headers = response
            .headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        Ok(Self {
            method: key.method.clone(),
            url: key.url.clone(),
            response_url: response.url.to_string(),
            status: response.status.as_u16(),
            headers,
            response_type: response.response_type.as_str().to_string(),
            redirected: response.redirected,
            body,
            cached_at: now_millis(),
        })
    }

    /// Identity this entry is stored under.
    pub fn key(&self) -> RequestKey {
        RequestKey {
            method: self.method.clone(),
            url: self.url.clone(),
        }
    }

    /// Body size in bytes.
    pub fn size(&self) -> u64 {
        self.body.len() as u64
    }

    /// Rebuild a response. Each call yields an independent copy.
    pub fn to_response(&self) -> Result<Response, CacheError> {
        let url = Url::parse(&self.response_url)
            .map_err(|e| CacheError::InvalidEntry(format!("{}: {}", self.response_url, e)))?;
        let status = StatusCode::from_u16(self.status)
            .map_err(|e| CacheError::InvalidEntry(format!("status {}: {}", self.status, e)))?;
        let response_type = ResponseType::parse(&self.response_type)
            .ok_or_else(|| CacheError::InvalidEntry(self.response_type.clone()))?;

        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            if let (Ok(n), Ok(v)) = (
                HeaderName::try_from(name.as_str()),
                HeaderValue::try_from(value.as_str()),
            ) {
                headers.append(n, v);
            }
        }

        let mut response = Response::new(url, status)
            .with_type(response_type)
            .with_redirected(self.redirected)
            .with_body(self.body.clone());
        response.headers = headers;
        Ok(response)
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

// ==================== Quota ====================

/// Byte budget shared by every generation in one storage.
#[derive(Debug, Default)]
struct Quota {
    limit: Option<u64>,
    used: AtomicU64,
}

impl Quota {
    /// Swap `released` bytes for `added` in one step, refusing to exceed the limit.
    fn reserve(&self, released: u64, added: u64) -> Result<(), CacheError> {
        let limit = self.limit;
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                let next = used.saturating_sub(released) + added;
                match limit {
                    Some(limit) if next > limit => None,
                    _ => Some(next),
                }
            })
            .map(|_| ())
            .map_err(|used| CacheError::QuotaExceeded {
                needed: added,
                available: limit.map_or(0, |l| l.saturating_sub(used.saturating_sub(released))),
            })
    }

    fn release(&self, bytes: u64) {
        // fetch_update never fails with a closure that always returns Some
        let _ = self
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                Some(used.saturating_sub(bytes))
            });
    }

    fn charge(&self, bytes: u64) {
        self.used.fetch_add(bytes, Ordering::AcqRel);
    }
}

// ==================== Cache ====================

/// One generation of the store.
#[derive(Debug)]
pub struct Cache {
    name: String,
    entries: RwLock<HashMap<RequestKey, CacheEntry>>,
    quota: Arc<Quota>,
    deleted: AtomicBool,
}

impl Cache {
    fn new(name: &str, quota: Arc<Quota>) -> Self {
        Self {
            name: name.to_string(),
            entries: RwLock::new(HashMap::new()),
            quota,
            deleted: AtomicBool::new(false),
        }
    }

    fn ensure_live(&self) -> Result<(), CacheError> {
        if self.deleted.load(Ordering::Acquire) {
            return Err(CacheError::GenerationDeleted(self.name.clone()));
        }
        Ok(())
    }

    /// Empty the generation for good, returning the bytes it held.
    async fn retire(&self) -> u64 {
        let mut entries = self.entries.write().await;
        self.deleted.store(true, Ordering::Release);
        let freed = entries.values().map(CacheEntry::size).sum();
        entries.clear();
        freed
    }

    /// Whether the generation was removed from its storage.
    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    /// Generation name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Exact-identity lookup.
    pub async fn match_key(&self, key: &RequestKey) -> Option<CacheEntry> {
        self.entries.read().await.get(key).cloned()
    }

    /// Look up a request and rebuild the stored response.
    pub async fn match_request(&self, request: &Request) -> Option<Response> {
        let entry = self.match_key(&RequestKey::from_request(request)).await?;
        match entry.to_response() {
            Ok(response) => Some(response),
            Err(e) => {
                warn!(cache = %self.name, url = %entry.url, error = %e, "Dropping unreadable entry");
                None
            }
        }
    }

    /// Store a buffered response, replacing any entry with the same identity.
    pub async fn put(&self, request: &Request, response: &Response) -> Result<(), CacheError> {
        let key = RequestKey::from_request(request);
        let entry = CacheEntry::capture(&key, response)?;

        let mut entries = self.entries.write().await;
        self.ensure_live()?;
        let released = entries.get(&key).map(CacheEntry::size).unwrap_or(0);
        self.quota.reserve(released, entry.size())?;

        trace!(cache = %self.name, url = %key.url, bytes = entry.size(), "Stored entry");
        entries.insert(key, entry);
        Ok(())
    }

    /// Fetch every URL and store all of them, or none.
    ///
    /// Responses must be OK; nothing is written until every fetch and body
    /// read has succeeded and the batch fits the quota.
    pub async fn add_all(&self, network: &dyn Network, urls: &[Url]) -> Result<(), CacheError> {
        let fetches = urls.iter().map(|url| async move {
            let request = Request::get(url.clone());
            let failed = |reason: String| CacheError::PrecacheFailed {
                url: url.to_string(),
                reason,
            };

            let response = network
                .fetch(&request)
                .await
                .map_err(|e| failed(e.to_string()))?;
            if !response.ok() {
                return Err(failed(format!("status {}", response.status)));
            }
            let response = response.buffered().await.map_err(|e| failed(e.to_string()))?;
            let key = RequestKey::from_request(&request);
            let entry = CacheEntry::capture(&key, &response)?;
            Ok::<_, CacheError>((key, entry))
        });

        let batch = try_join_all(fetches).await?;

        let mut entries = self.entries.write().await;
        self.ensure_live()?;
        let released: u64 = batch
            .iter()
            .filter_map(|(key, _)| entries.get(key).map(CacheEntry::size))
            .sum();
        let added: u64 = batch.iter().map(|(_, entry)| entry.size()).sum();
        self.quota.reserve(released, added)?;

        for (key, entry) in batch {
            entries.insert(key, entry);
        }
        debug!(cache = %self.name, count = urls.len(), bytes = added, "Precache complete");
        Ok(())
    }

    /// Delete an entry.
    pub async fn delete(&self, request: &Request) -> bool {
        let mut entries = self.entries.write().await;
        match entries.remove(&RequestKey::from_request(request)) {
            Some(entry) => {
                self.quota.release(entry.size());
                true
            }
            None => false,
        }
    }

    /// All stored identities, sorted.
    pub async fn keys(&self) -> Vec<RequestKey> {
        let mut keys: Vec<_> = self.entries.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Number of entries.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Whether the generation has no entries.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

}

// ==================== Cache Storage ====================

/// Serialized form of a [`CacheStorage`].
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct StorageSnapshot {
    pub generations: Vec<GenerationSnapshot>,
}

/// Serialized form of one generation.
#[derive(Debug, Serialize, Deserialize)]
pub struct GenerationSnapshot {
    pub name: String,
    pub entries: Vec<CacheEntry>,
}

/// All generations for the origin (the `caches` global).
#[derive(Debug, Default)]
pub struct CacheStorage {
    caches: RwLock<HashMap<String, Arc<Cache>>>,
    quota: Arc<Quota>,
}

impl CacheStorage {
    /// Create new, unbounded cache storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create cache storage capped at `limit` body bytes.
    pub fn with_quota(limit: u64) -> Self {
        Self {
            caches: RwLock::new(HashMap::new()),
            quota: Arc::new(Quota {
                limit: Some(limit),
                used: AtomicU64::new(0),
            }),
        }
    }

    /// Open a generation, creating it if it does not exist.
    pub async fn open(&self, name: &str) -> Arc<Cache> {
        if let Some(cache) = self.caches.read().await.get(name) {
            return Arc::clone(cache);
        }
        let mut caches = self.caches.write().await;
        Arc::clone(
            caches
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Cache::new(name, Arc::clone(&self.quota)))),
        )
    }

    /// Get a generation without creating it.
    pub async fn get(&self, name: &str) -> Option<Arc<Cache>> {
        self.caches.read().await.get(name).cloned()
    }

    /// Check if a generation exists.
    pub async fn has(&self, name: &str) -> bool {
        self.caches.read().await.contains_key(name)
    }

    /// Delete a generation.
    pub async fn delete(&self, name: &str) -> bool {
        let removed = self.caches.write().await.remove(name);
        match removed {
            Some(cache) => {
                // Writes still holding this cache are refused from here on.
                self.quota.release(cache.retire().await);
                info!(generation = %name, "Deleted cache generation");
                true
            }
            None => false,
        }
    }

    /// All generation names, sorted.
    pub async fn keys(&self) -> Vec<String> {
        let mut names: Vec<_> = self.caches.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Delete every generation whose name differs from `current`.
    pub async fn delete_all_except(&self, current: &str) -> Vec<String> {
        let stale: Vec<String> = self
            .keys()
            .await
            .into_iter()
            .filter(|name| name != current)
            .collect();
        for name in &stale {
            self.delete(name).await;
        }
        stale
    }

    /// Match across all generations.
    pub async fn match_request(&self, request: &Request) -> Option<Response> {
        let caches: Vec<_> = self.caches.read().await.values().cloned().collect();
        for cache in caches {
            if let Some(response) = cache.match_request(request).await {
                return Some(response);
            }
        }
        None
    }

    /// Body bytes currently stored across all generations.
    pub fn usage(&self) -> u64 {
        self.quota.used.load(Ordering::Acquire)
    }

    /// Capture every generation.
    pub async fn snapshot(&self) -> StorageSnapshot {
        let caches: Vec<_> = self.caches.read().await.values().cloned().collect();
        let mut generations = Vec::with_capacity(caches.len());
        for cache in caches {
            let mut entries: Vec<_> = cache.entries.read().await.values().cloned().collect();
            entries.sort_by(|a, b| a.url.cmp(&b.url));
            generations.push(GenerationSnapshot {
                name: cache.name.clone(),
                entries,
            });
        }
        generations.sort_by(|a, b| a.name.cmp(&b.name));
        StorageSnapshot { generations }
    }

    /// Persist every generation as JSON.
    pub async fn save_to(&self, path: &Path) -> Result<(), CacheError> {
        let snapshot = self.snapshot().await;
        let json = serde_json::to_vec(&snapshot)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, json).await?;
        info!(path = %path.display(), generations = snapshot.generations.len(), "Saved cache storage");
        Ok(())
    }

    /// Restore generations from a file written by [`CacheStorage::save_to`].
    pub async fn load_from(path: &Path, quota: Option<u64>) -> Result<Self, CacheError> {
        let json = tokio::fs::read(path).await?;
        let snapshot: StorageSnapshot = serde_json::from_slice(&json)?;

        let storage = match quota {
            Some(limit) => Self::with_quota(limit),
            None => Self::new(),
        };
        {
            let mut caches = storage.caches.write().await;
            for generation in snapshot.generations {
                let cache = Cache::new(&generation.name, Arc::clone(&storage.quota));
                {
                    let mut entries = cache.entries.write().await;
                    for entry in generation.entries {
                        storage.quota.charge(entry.size());
                        entries.insert(entry.key(), entry);
                    }
                }
                caches.insert(generation.name, Arc::new(cache));
            }
        }
        info!(path = %path.display(), usage = storage.usage(), "Loaded cache storage");
        Ok(storage)
    }
}
