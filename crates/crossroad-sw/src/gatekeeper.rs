//! Cache-first gatekeeper for the Crossroad Navigator page.

use std::sync::Arc;

use async_trait::async_trait;
use crossroad_net::{Fetcher, Request, RequestMode, Response, ResponseType};
use futures::future::join_all;
use tracing::{debug, error, info, warn};

use crate::cache::{Cache, CacheStorage};
use crate::config::CacheManifest;
use crate::{LifecycleHandler, ServiceWorkerError};

/// Pre-caches the page's assets on install, serves fetches cache-first and
/// drops stale cache generations on activate.
pub struct CacheGatekeeper {
    manifest: CacheManifest,
    caches: Arc<CacheStorage>,
    fetcher: Arc<dyn Fetcher>,
}

impl CacheGatekeeper {
    pub fn new(manifest: CacheManifest, caches: Arc<CacheStorage>, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            manifest,
            caches,
            fetcher,
        }
    }

    pub fn manifest(&self) -> &CacheManifest {
        &self.manifest
    }

    async fn current_cache(&self) -> Arc<Cache> {
        self.caches.open(&self.manifest.cache_name).await
    }

    async fn cache_best_effort(&self, cache: &Cache) {
        let attempts = self.manifest.best_effort.iter().map(|url| async move {
            let request = Request::get(url.clone()).mode(RequestMode::NoCors);
            if let Err(err) = cache.add(self.fetcher.as_ref(), request).await {
                warn!(url = %url, error = %err, "Best-effort asset not cached");
            }
        });
        join_all(attempts).await;
    }

    /// Store a copy of the response; a rejected write never affects the
    /// response handed back to the page.
    async fn store(&self, cache: &Cache, request: &Request, response: &Response) {
        if let Err(err) = cache.put(request, response.clone()).await {
            warn!(url = %request.url, error = %err, "Failed to cache response");
        }
    }
}

#[async_trait]
impl LifecycleHandler for CacheGatekeeper {
    async fn on_install(&self) -> Result<(), ServiceWorkerError> {
        let cache = self.current_cache().await;
        info!(cache = %cache.name(), "Opened cache");

        let required: Vec<Request> = self
            .manifest
            .required
            .iter()
            .cloned()
            .map(Request::get)
            .collect();

        let ((), batch) = tokio::join!(
            self.cache_best_effort(&cache),
            cache.add_all(self.fetcher.as_ref(), required),
        );
        batch?;

        info!(cache = %cache.name(), assets = self.manifest.required.len(), "Install complete");
        Ok(())
    }

    async fn on_fetch(&self, request: Request) -> Option<Response> {
        let cache = self.current_cache().await;
        if let Some(response) = cache.match_request(&request).await {
            debug!(url = %request.url, "Serving from cache");
            return Some(response);
        }

        debug!(url = %request.url, "Cache miss, going to network");
        let response = match self.fetcher.fetch(&request).await {
            Ok(response) => response,
            Err(err) => {
                error!(url = %request.url, error = %err, "Fetch error");
                return None;
            }
        };

        // Only the passthrough marker skips caching. Non-200 same-origin
        // responses fall through and are cached like any other.
        if response.status() != 200 || response.response_type() != ResponseType::Basic {
            if self.manifest.is_passthrough(&request.url) {
                debug!(url = %request.url, status = response.status(), "Passing through uncached");
                return Some(response);
            }
            if response.is_opaque() {
                self.store(&cache, &request, &response).await;
                return Some(response);
            }
        }

        self.store(&cache, &request, &response).await;
        Some(response)
    }

    async fn on_activate(&self) -> Result<(), ServiceWorkerError> {
        let current = &self.manifest.cache_name;
        let stale: Vec<String> = self
            .caches
            .keys()
            .await
            .into_iter()
            .filter(|name| name != current)
            .collect();

        let deletions = stale.iter().map(|name| async move {
            if self.caches.delete(name).await {
                info!(cache = %name, "Deleted stale cache");
            }
        });
        join_all(deletions).await;

        Ok(())
    }
}
