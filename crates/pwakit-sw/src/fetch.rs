//! Fetch interception: decides between bypass, store, and network.

use std::sync::Arc;

use pwakit_net::{NetError, Network, Request, RequestRouter, Response, Route};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, trace, warn};
use url::Url;

use crate::cache::{CacheStorage, RequestKey};
use crate::CacheError;

/// Where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    /// Straight from the network.
    Network,
    /// From the current generation's store.
    Cache,
    /// The cached root document, standing in for a failed navigation.
    OfflineFallback,
}

/// Fetch event response.
#[derive(Debug)]
pub struct FetchResponse {
    pub response: Response,
    pub source: ResponseSource,
}

impl FetchResponse {
    pub(crate) fn new(response: Response, source: ResponseSource) -> Self {
        Self { response, source }
    }

    /// Whether the store answered.
    pub fn from_cache(&self) -> bool {
        self.source != ResponseSource::Network
    }
}

/// Request interception for one worker generation.
pub struct FetchGateway {
    generation: String,
    caches: Arc<CacheStorage>,
    network: Arc<dyn Network>,
    router: RequestRouter,
    fallback: Url,
    writes: Mutex<JoinSet<()>>,
}

impl FetchGateway {
    /// Create a gateway serving `generation`, with `fallback` as the offline document.
    pub fn new(
        generation: impl Into<String>,
        caches: Arc<CacheStorage>,
        network: Arc<dyn Network>,
        router: RequestRouter,
        fallback: Url,
    ) -> Self {
        Self {
            generation: generation.into(),
            caches,
            network,
            router,
            fallback,
            writes: Mutex::new(JoinSet::new()),
        }
    }

    /// Generation this gateway reads from and writes to.
    pub fn generation(&self) -> &str {
        &self.generation
    }

    /// Handle one intercepted request.
    ///
    /// `Err` only for non-navigation requests whose network fetch failed.
    pub async fn handle(&self, request: &Request) -> Result<FetchResponse, NetError> {
        if self.router.route(request) == Route::Bypass {
            trace!(url = %request.url, "Bypassing store");
            let response = self.network.fetch(request).await?;
            return Ok(FetchResponse::new(response, ResponseSource::Network));
        }

        if let Some(cache) = self.caches.get(&self.generation).await {
            if let Some(response) = cache.match_request(request).await {
                debug!(url = %request.url, generation = %self.generation, "Cache hit");
                return Ok(FetchResponse::new(response, ResponseSource::Cache));
            }
        }
        trace!(url = %request.url, "Cache miss");

        match self.fetch_and_populate(request).await {
            Ok(response) => Ok(FetchResponse::new(response, ResponseSource::Network)),
            Err(err) if request.is_navigation() => match self.offline_fallback().await {
                Some(response) => {
                    debug!(url = %request.url, error = %err, "Serving offline fallback");
                    Ok(FetchResponse::new(response, ResponseSource::OfflineFallback))
                }
                None => Err(err),
            },
            Err(err) => Err(err),
        }
    }

    async fn fetch_and_populate(&self, request: &Request) -> Result<Response, NetError> {
        let response = self.network.fetch(request).await?;
        if !response.is_cacheable() {
            trace!(
                url = %request.url,
                status = %response.status,
                response_type = response.response_type.as_str(),
                "Not cacheable"
            );
            return Ok(response);
        }

        // The body is read once; store and caller each get their own copy.
        let response = response.buffered().await?;
        match response.try_clone() {
            Some(copy) => self.spawn_write(request.clone(), copy).await,
            None => warn!(url = %request.url, "Buffered response could not be copied"),
        }
        Ok(response)
    }

    async fn spawn_write(&self, request: Request, response: Response) {
        let caches = Arc::clone(&self.caches);
        let generation = self.generation.clone();

        let mut writes = self.writes.lock().await;
        while writes.try_join_next().is_some() {}
        writes.spawn(async move {
            // A swept generation must not be recreated by a late write.
            let Some(cache) = caches.get(&generation).await else {
                debug!(url = %request.url, generation = %generation, "Generation gone; skipping write");
                return;
            };
            match cache.put(&request, &response).await {
                Ok(()) => {}
                Err(CacheError::GenerationDeleted(_)) => {
                    debug!(url = %request.url, generation = %generation, "Generation swept mid-write");
                }
                Err(e) => {
                    warn!(url = %request.url, generation = %generation, error = %e, "Cache write failed");
                }
            }
        });
    }

    async fn offline_fallback(&self) -> Option<Response> {
        let cache = self.caches.get(&self.generation).await?;
        let entry = cache.match_key(&RequestKey::get(&self.fallback)).await?;
        entry.to_response().ok()
    }

    /// Wait for every pending store write to finish.
    pub async fn settle(&self) {
        let mut writes = self.writes.lock().await;
        while writes.join_next().await.is_some() {}
    }
}
