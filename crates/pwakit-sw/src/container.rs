//! Service worker container: the per-origin host that registers workers,
//! rolls out new generations, and routes page requests to the active one.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use hashbrown::HashMap;
use pwakit_common::OfflineConfig;
use pwakit_net::{CacheMode, Network, Request};
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::CacheStorage;
use crate::clients::{Client, ClientId, Clients, Controller};
use crate::fetch::{FetchResponse, ResponseSource};
use crate::lifecycle::WorkerState;
use crate::registration::{RegistrationOptions, ServiceWorkerRegistration, UpdateViaCache};
use crate::worker::{ServiceWorker, WorkerId};
use crate::{CacheError, ServiceWorkerError};

/// Buffered events per subscriber before older ones are dropped.
const EVENT_CAPACITY: usize = 256;

/// Service worker events, as observed by pages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceWorkerEvent {
    /// A new worker started installing.
    UpdateFound { scope: Url, worker_id: WorkerId },
    /// A worker changed state.
    StateChange {
        scope: Url,
        worker_id: WorkerId,
        generation: String,
        state: WorkerState,
    },
    /// A client is now served by a different worker.
    ControllerChange {
        client_id: ClientId,
        worker_id: WorkerId,
        generation: String,
    },
}

/// Result of an update check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The script still describes the active generation.
    NoChange,
    /// A new generation installed and took over.
    Installed { generation: String },
    /// The new generation failed to install; the previous one keeps serving.
    InstallFailed { generation: String, reason: String },
}

/// Loads the worker definition behind a script URL.
#[async_trait]
pub trait WorkerScriptSource: Send + Sync {
    /// Fetch the current definition. With [`UpdateViaCache::None`] the source
    /// must not answer from any HTTP cache.
    async fn load(
        &self,
        script_url: &Url,
        update_via_cache: UpdateViaCache,
    ) -> Result<OfflineConfig, ServiceWorkerError>;
}

/// Worker definitions served as JSON by the origin.
pub struct NetworkScriptSource {
    network: Arc<dyn Network>,
}

impl NetworkScriptSource {
    /// Create a source that fetches through `network`.
    pub fn new(network: Arc<dyn Network>) -> Self {
        Self { network }
    }
}

#[async_trait]
impl WorkerScriptSource for NetworkScriptSource {
    async fn load(
        &self,
        script_url: &Url,
        update_via_cache: UpdateViaCache,
    ) -> Result<OfflineConfig, ServiceWorkerError> {
        let cache = match update_via_cache {
            UpdateViaCache::None => CacheMode::NoCache,
            UpdateViaCache::Imports | UpdateViaCache::All => CacheMode::Default,
        };
        let request = Request::get(script_url.clone()).cache(cache);
        let response = self.network.fetch(&request).await?;
        if !response.ok() {
            return Err(ServiceWorkerError::RegistrationFailed(format!(
                "{} answered {}",
                script_url, response.status
            )));
        }

        let body = response.text().await?;
        let config: OfflineConfig = serde_json::from_str(&body)
            .map_err(|e| ServiceWorkerError::RegistrationFailed(format!("{script_url}: {e}")))?;
        Ok(config)
    }
}

/// Service worker container (`navigator.serviceWorker` for one origin).
pub struct ServiceWorkerContainer {
    origin: Url,
    registrations: RwLock<HashMap<String, ServiceWorkerRegistration>>,
    caches: Arc<CacheStorage>,
    clients: Arc<RwLock<Clients>>,
    network: Arc<dyn Network>,
    source: Arc<dyn WorkerScriptSource>,
    events: broadcast::Sender<ServiceWorkerEvent>,
    jobs: Mutex<()>,
}

impl ServiceWorkerContainer {
    /// Create a container with empty storage.
    pub fn new(
        origin: Url,
        network: Arc<dyn Network>,
        source: Arc<dyn WorkerScriptSource>,
    ) -> Self {
        Self::with_storage(origin, network, source, Arc::new(CacheStorage::new()))
    }

    /// Create a container over existing (e.g. restored) storage.
    pub fn with_storage(
        origin: Url,
        network: Arc<dyn Network>,
        source: Arc<dyn WorkerScriptSource>,
        caches: Arc<CacheStorage>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            origin,
            registrations: RwLock::new(HashMap::new()),
            caches,
            clients: Arc::new(RwLock::new(Clients::new())),
            network,
            source,
            events,
            jobs: Mutex::new(()),
        }
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<ServiceWorkerEvent> {
        self.events.subscribe()
    }

    /// Shared cache storage.
    pub fn caches(&self) -> Arc<CacheStorage> {
        Arc::clone(&self.caches)
    }

    /// Track a newly opened page. It is controlled if a worker is active for it.
    pub async fn open_client(&self, url: Url) -> Client {
        let controller = self
            .active_for(&url)
            .await
            .map(|worker| worker.controller());
        self.clients.write().await.open_window(url, controller)
    }

    /// Forget a page.
    pub async fn close_client(&self, id: &ClientId) -> Option<Client> {
        self.clients.write().await.remove(id)
    }

    /// The worker currently serving a page.
    pub async fn controller(&self, id: &ClientId) -> Option<Controller> {
        self.clients.read().await.get(id)?.controller.clone()
    }

    /// Register a worker script. The first registration installs and
    /// activates immediately; install failures are not registration failures.
    pub async fn register(
        &self,
        script_url: &str,
        options: RegistrationOptions,
    ) -> Result<Url, ServiceWorkerError> {
        let script_url = self
            .origin
            .join(script_url)
            .map_err(|e| ServiceWorkerError::RegistrationFailed(e.to_string()))?;
        if script_url.origin() != self.origin.origin() {
            return Err(ServiceWorkerError::SecurityError(format!(
                "script {script_url} is not on {}",
                self.origin
            )));
        }

        let scope = match options.scope {
            Some(ref s) => script_url
                .join(s)
                .map_err(|e| ServiceWorkerError::RegistrationFailed(e.to_string()))?,
            None => script_url
                .join("./")
                .map_err(|e| ServiceWorkerError::RegistrationFailed(e.to_string()))?,
        };
        if scope.origin() != self.origin.origin() {
            return Err(ServiceWorkerError::SecurityError(format!(
                "scope {scope} is not on {}",
                self.origin
            )));
        }

        let first = {
            let mut registrations = self.registrations.write().await;
            let registration = registrations
                .entry(scope.to_string())
                .or_insert_with(|| {
                    ServiceWorkerRegistration::new(
                        scope.clone(),
                        script_url.clone(),
                        options.update_via_cache,
                    )
                });
            registration.script_url = script_url.clone();
            registration.update_via_cache = options.update_via_cache;
            registration.active.is_none()
        };
        info!(scope = %scope, script = %script_url, "Service worker registered");

        if first {
            if let Err(e) = self.update(&scope).await {
                self.registrations.write().await.remove(scope.as_str());
                return Err(e);
            }
        }
        Ok(scope)
    }

    /// Check the script for a new generation and roll it out.
    ///
    /// Only one update job runs at a time; fetches keep being served by the
    /// current worker while the new one installs.
    pub async fn update(&self, scope: &Url) -> Result<UpdateOutcome, ServiceWorkerError> {
        let _job = self.jobs.lock().await;

        let (script_url, update_via_cache, active_generation) = {
            let mut registrations = self.registrations.write().await;
            let registration = registrations
                .get_mut(scope.as_str())
                .ok_or_else(|| ServiceWorkerError::NotFound(scope.to_string()))?;
            registration.last_update_check = Some(Instant::now());
            (
                registration.script_url.clone(),
                registration.update_via_cache,
                registration.active_generation().map(str::to_string),
            )
        };

        let mut config = self.source.load(&script_url, update_via_cache).await?;
        config.origin = Some(self.origin.clone());
        config
            .validate()
            .map_err(|e| ServiceWorkerError::RegistrationFailed(e.to_string()))?;

        if active_generation.as_deref() == Some(config.cache_name.as_str()) {
            debug!(scope = %scope, generation = %config.cache_name, "No update");
            return Ok(UpdateOutcome::NoChange);
        }

        let generation = config.cache_name.clone();
        let worker = Arc::new(ServiceWorker::new(
            script_url,
            scope.clone(),
            config,
            Arc::clone(&self.caches),
            Arc::clone(&self.network),
            Arc::clone(&self.clients),
            self.events.clone(),
        )?);
        info!(scope = %scope, generation = %generation, previous = ?active_generation, "Update found");

        self.with_registration(scope, |r| r.installing = Some(Arc::clone(&worker)))
            .await?;
        let _ = self.events.send(ServiceWorkerEvent::UpdateFound {
            scope: scope.clone(),
            worker_id: worker.id(),
        });

        if let Err(e) = worker.install().await {
            warn!(scope = %scope, generation = %generation, error = %e, "New generation not promoted");
            self.with_registration(scope, |r| r.installing = None).await?;
            return Ok(UpdateOutcome::InstallFailed {
                generation,
                reason: e.to_string(),
            });
        }

        let replaced_waiting = self
            .with_registration(scope, |r| {
                r.installing = None;
                r.waiting.replace(Arc::clone(&worker))
            })
            .await?;
        if let Some(stale) = replaced_waiting {
            if let Err(e) = stale.supersede().await {
                debug!(worker = %stale.id(), error = %e, "Waiting worker already gone");
            }
        }

        worker.skip_waiting().await?;

        let previous = self.with_registration(scope, |r| r.promote_waiting()).await?;
        if let Some(previous) = previous {
            if let Err(e) = previous.supersede().await {
                debug!(worker = %previous.id(), error = %e, "Previous worker already redundant");
            }
        }

        Ok(UpdateOutcome::Installed { generation })
    }

    async fn with_registration<T>(
        &self,
        scope: &Url,
        f: impl FnOnce(&mut ServiceWorkerRegistration) -> T,
    ) -> Result<T, ServiceWorkerError> {
        let mut registrations = self.registrations.write().await;
        let registration = registrations
            .get_mut(scope.as_str())
            .ok_or_else(|| ServiceWorkerError::NotFound(scope.to_string()))?;
        Ok(f(registration))
    }

    /// The active worker whose scope covers `url`, longest scope first.
    pub async fn active_for(&self, url: &Url) -> Option<Arc<ServiceWorker>> {
        let registrations = self.registrations.read().await;
        registrations
            .values()
            .filter(|r| r.in_scope(url))
            .max_by_key(|r| r.scope.path().len())
            .and_then(|r| r.active.clone())
    }

    /// Route a page's request through the worker that serves it.
    ///
    /// Navigations go to the active worker for the target URL; subresources
    /// go to the worker controlling the page. Uncontrolled traffic goes
    /// straight to the network.
    pub async fn handle_fetch(
        &self,
        client: Option<&ClientId>,
        request: &Request,
    ) -> Result<FetchResponse, ServiceWorkerError> {
        let worker = if request.is_navigation() {
            self.active_for(&request.url).await
        } else {
            let page = match client {
                Some(id) => self.clients.read().await.get(id).cloned(),
                None => None,
            };
            match page {
                Some(page) if page.is_controlled() => self.active_for(&page.url).await,
                _ => None,
            }
        };

        if let Some(worker) = worker {
            match worker.fetch(request).await {
                Err(ServiceWorkerError::NotActive(state)) => {
                    debug!(worker = %worker.id(), ?state, "Worker no longer active; using network");
                }
                other => return other,
            }
        }

        let response = self.network.fetch(request).await?;
        Ok(FetchResponse::new(response, ResponseSource::Network))
    }

    /// Generation of the active worker for `scope`.
    pub async fn active_generation(&self, scope: &Url) -> Option<String> {
        self.registrations
            .read()
            .await
            .get(scope.as_str())?
            .active_generation()
            .map(str::to_string)
    }

    /// Scope of the registration covering `url`.
    pub async fn get_registration(&self, url: &Url) -> Option<Url> {
        self.registrations
            .read()
            .await
            .values()
            .filter(|r| r.in_scope(url))
            .max_by_key(|r| r.scope.path().len())
            .map(|r| r.scope.clone())
    }

    /// All registered scopes.
    pub async fn get_registrations(&self) -> Vec<Url> {
        let mut scopes: Vec<_> = self
            .registrations
            .read()
            .await
            .values()
            .map(|r| r.scope.clone())
            .collect();
        scopes.sort();
        scopes
    }

    /// Unregister and tear down every worker of `scope`. Stored generations stay.
    pub async fn unregister(&self, scope: &Url) -> Result<bool, ServiceWorkerError> {
        let _job = self.jobs.lock().await;
        let removed = self.registrations.write().await.remove(scope.as_str());
        let Some(mut registration) = removed else {
            return Ok(false);
        };
        for worker in registration.take_all() {
            if let Err(e) = worker.teardown().await {
                debug!(worker = %worker.id(), error = %e, "Worker already redundant");
            }
        }
        info!(scope = %scope, "Service worker unregistered");
        Ok(true)
    }

    /// Persist the store so a restarted host can serve offline.
    pub async fn persist(&self, path: &Path) -> Result<(), CacheError> {
        self.caches.save_to(path).await
    }
}
