//! Named request→response caches and the storage that owns them.
//!
//! ```text
//! CacheStorage (caches)
//!     └── Cache (name)
//!             └── GET url → Response
//! ```

use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use crossroad_net::{Fetcher, Request, RequestMode, Response, ResponseType};
use futures::future::try_join_all;
use hashbrown::HashMap;
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, trace};
use url::Url;

use crate::CacheError;

// ==================== Cache ====================

#[derive(Debug, Clone)]
struct CachedResponse {
    response: Response,
    cached_at: u64,
}

/// A cache instance.
///
/// Handles stay usable after the cache is deleted from its storage; they just
/// stop being reachable by name.
#[derive(Debug)]
pub struct Cache {
    name: String,
    entries: RwLock<HashMap<String, CachedResponse>>,
}

impl Cache {
    /// Create a new, empty cache.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Match a request. Only GET requests can hit.
    pub async fn match_request(&self, request: &Request) -> Option<Response> {
        if request.method != Method::GET {
            return None;
        }
        let entries = self.entries.read().await;
        let hit = entries
            .get(&cache_key(&request.url))
            .map(|cached| cached.response.clone());
        trace!(cache = %self.name, url = %request.url, hit = hit.is_some(), "Cache lookup");
        hit
    }

    /// Store a response for a request, replacing any previous entry.
    pub async fn put(&self, request: &Request, response: Response) -> Result<(), CacheError> {
        check_storable(request, &response)?;
        debug!(
            cache = %self.name,
            url = %request.url,
            response_type = response.response_type().as_str(),
            "Caching response"
        );
        self.entries
            .write()
            .await
            .insert(cache_key(&request.url), CachedResponse::now(response));
        Ok(())
    }

    /// Fetch a request and store the response.
    ///
    /// Non-ok responses are rejected, except opaque responses to `no-cors`
    /// requests.
    pub async fn add(&self, fetcher: &dyn Fetcher, request: Request) -> Result<(), CacheError> {
        let response = fetcher.fetch(&request).await?;
        check_addable(&request, &response)?;
        self.put(&request, response).await
    }

    /// Fetch every request concurrently and store the responses only if all of
    /// them succeed.
    pub async fn add_all(
        &self,
        fetcher: &dyn Fetcher,
        requests: Vec<Request>,
    ) -> Result<(), CacheError> {
        let fetched = try_join_all(requests.into_iter().map(|request| async move {
            let response = fetcher.fetch(&request).await?;
            check_addable(&request, &response)?;
            check_storable(&request, &response)?;
            Ok::<_, CacheError>((request, response))
        }))
        .await?;

        let mut entries = self.entries.write().await;
        for (request, response) in fetched {
            debug!(cache = %self.name, url = %request.url, "Caching response");
            entries.insert(cache_key(&request.url), CachedResponse::now(response));
        }
        Ok(())
    }

    /// Delete the entry for a request.
    pub async fn delete(&self, request: &Request) -> bool {
        if request.method != Method::GET {
            return false;
        }
        self.entries
            .write()
            .await
            .remove(&cache_key(&request.url))
            .is_some()
    }

    /// Get all cached URLs.
    pub async fn keys(&self) -> Vec<String> {
        self.entries.read().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

impl CachedResponse {
    fn now(response: Response) -> Self {
        Self {
            response,
            cached_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        }
    }
}

/// Entries are keyed by URL with the fragment stripped.
fn cache_key(url: &Url) -> String {
    let mut url = url.clone();
    url.set_fragment(None);
    url.into()
}

fn check_storable(request: &Request, response: &Response) -> Result<(), CacheError> {
    if request.method != Method::GET {
        return Err(CacheError::UnsupportedMethod(request.method.to_string()));
    }
    if response.status() == 206 {
        return Err(CacheError::PartialResponse(request.url.clone()));
    }
    if response.response_type() == ResponseType::Error {
        return Err(CacheError::NetworkErrorResponse(request.url.clone()));
    }
    Ok(())
}

fn check_addable(request: &Request, response: &Response) -> Result<(), CacheError> {
    let opaque_allowed = response.is_opaque() && request.mode == RequestMode::NoCors;
    if response.ok() || opaque_allowed {
        Ok(())
    } else {
        Err(CacheError::BadResponse {
            url: request.url.clone(),
            status: response.status(),
        })
    }
}

// ==================== Cache Storage ====================

/// Cache storage (the `caches` global). Keeps caches in creation order.
#[derive(Debug, Default)]
pub struct CacheStorage {
    caches: RwLock<Vec<Arc<Cache>>>,
}

impl CacheStorage {
    /// Create new cache storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a cache (creates if doesn't exist).
    pub async fn open(&self, name: &str) -> Arc<Cache> {
        if let Some(cache) = self.find(name).await {
            return cache;
        }

        let mut caches = self.caches.write().await;
        // Another opener may have won the race between the two locks.
        if let Some(cache) = caches.iter().find(|c| c.name == name) {
            return Arc::clone(cache);
        }
        info!(cache = %name, "Created cache");
        let cache = Arc::new(Cache::new(name));
        caches.push(Arc::clone(&cache));
        cache
    }

    async fn find(&self, name: &str) -> Option<Arc<Cache>> {
        self.caches
            .read()
            .await
            .iter()
            .find(|c| c.name == name)
            .cloned()
    }

    /// Check if cache exists.
    pub async fn has(&self, name: &str) -> bool {
        self.find(name).await.is_some()
    }

    /// Delete a cache.
    pub async fn delete(&self, name: &str) -> bool {
        let mut caches = self.caches.write().await;
        let before = caches.len();
        caches.retain(|c| c.name != name);
        caches.len() != before
    }

    /// Get all cache names.
    pub async fn keys(&self) -> Vec<String> {
        self.caches
            .read()
            .await
            .iter()
            .map(|c| c.name.clone())
            .collect()
    }

    /// Match across all caches, oldest first.
    pub async fn match_request(&self, request: &Request) -> Option<Response> {
        let caches: Vec<Arc<Cache>> = self.caches.read().await.clone();
        for cache in caches {
            if let Some(response) = cache.match_request(request).await {
                return Some(response);
            }
        }
        None
    }

    /// Write every cache to a JSON snapshot.
    pub async fn save(&self, path: &Path) -> Result<(), CacheError> {
        let snapshot = self.snapshot().await;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Written beside the target and renamed over it, so a crash mid-write
        // leaves the previous snapshot intact.
        let file_name = path
            .file_name()
            .ok_or_else(|| CacheError::Snapshot(format!("{} is not a file path", path.display())))?;
        let mut tmp_name = file_name.to_os_string();
        tmp_name.push(".tmp");
        let tmp = path.with_file_name(tmp_name);
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(&snapshot)?).await?;
        tokio::fs::rename(&tmp, path).await?;
        info!(path = %path.display(), caches = snapshot.caches.len(), "Saved cache snapshot");
        Ok(())
    }

    /// Restore storage from a snapshot written by [`CacheStorage::save`].
    pub async fn load(path: &Path) -> Result<Self, CacheError> {
        let bytes = tokio::fs::read(path).await?;
        let snapshot: StorageSnapshot = serde_json::from_slice(&bytes)?;
        let storage = Self::restore(snapshot)?;
        info!(path = %path.display(), "Loaded cache snapshot");
        Ok(storage)
    }

    async fn snapshot(&self) -> StorageSnapshot {
        let caches: Vec<Arc<Cache>> = self.caches.read().await.clone();
        let mut snapshot = StorageSnapshot { caches: Vec::new() };
        for cache in caches {
            let guard = cache.entries.read().await;
            let mut entries: Vec<CacheEntry> = guard
                .iter()
                .map(|(key, cached)| CacheEntry::from_cached(key, cached))
                .collect();
            entries.sort_by(|a, b| a.url.cmp(&b.url));
            snapshot.caches.push(CacheSnapshot {
                name: cache.name.clone(),
                entries,
            });
        }
        snapshot
    }

    fn restore(snapshot: StorageSnapshot) -> Result<Self, CacheError> {
        let mut caches = Vec::with_capacity(snapshot.caches.len());
        for cache_snapshot in snapshot.caches {
            let mut entries = HashMap::with_capacity(cache_snapshot.entries.len());
            for entry in cache_snapshot.entries {
                let (key, cached) = entry.into_cached()?;
                entries.insert(key, cached);
            }
            caches.push(Arc::new(Cache {
                name: cache_snapshot.name,
                entries: RwLock::new(entries),
            }));
        }
        Ok(Self {
            caches: RwLock::new(caches),
        })
    }
}

// ==================== Snapshot ====================

#[derive(Debug, Serialize, Deserialize)]
struct StorageSnapshot {
    caches: Vec<CacheSnapshot>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheSnapshot {
    name: String,
    entries: Vec<CacheEntry>,
}

/// A cached request/response pair as written to disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Request URL (cache key).
    pub url: String,

    /// Final response URL after redirects.
    pub response_url: String,

    /// Response status.
    pub status: u16,

    pub status_text: String,

    pub response_type: ResponseType,

    /// Response headers, in order. Values are raw bytes since they need not
    /// be ASCII.
    pub headers: Vec<(String, Vec<u8>)>,

    /// Response body.
    pub body: Vec<u8>,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    fn from_cached(key: &str, cached: &CachedResponse) -> Self {
        let response = &cached.response;
        Self {
            url: key.to_string(),
            response_url: response.url().to_string(),
            status: response.status(),
            status_text: response.status_text().to_string(),
            response_type: response.response_type(),
            headers: response
                .raw_headers()
                .iter()
                .map(|(name, value)| (name.as_str().to_string(), value.as_bytes().to_vec()))
                .collect(),
            body: response.raw_body().to_vec(),
            cached_at: cached.cached_at,
        }
    }

    fn into_cached(self) -> Result<(String, CachedResponse), CacheError> {
        let url = Url::parse(&self.response_url)
            .map_err(|e| CacheError::Snapshot(format!("{}: {e}", self.response_url)))?;

        let mut headers = HeaderMap::with_capacity(self.headers.len());
        for (name, value) in &self.headers {
            let name = HeaderName::try_from(name.as_str())
                .map_err(|e| CacheError::Snapshot(format!("header {name}: {e}")))?;
            let value = HeaderValue::from_bytes(value)
                .map_err(|e| CacheError::Snapshot(format!("header {name}: {e}")))?;
            headers.append(name, value);
        }

        let response = Response::from_parts(
            url,
            self.status,
            self.status_text,
            headers,
            Bytes::from(self.body),
            self.response_type,
        );
        Ok((
            self.url,
            CachedResponse {
                response,
                cached_at: self.cached_at,
            },
        ))
    }
}
