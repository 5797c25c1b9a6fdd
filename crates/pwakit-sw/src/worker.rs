//! One worker generation: drives its [`LifecycleController`] and owns the
//! [`FetchGateway`] that serves requests once it is active.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use pwakit_common::OfflineConfig;
use pwakit_net::{Network, Request, RequestRouter};
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{info, warn};
use url::Url;

use crate::cache::CacheStorage;
use crate::clients::{Clients, Controller};
use crate::container::ServiceWorkerEvent;
use crate::fetch::{FetchGateway, FetchResponse};
use crate::lifecycle::{Effect, LifecycleController, LifecycleInput, WorkerState};
use crate::ServiceWorkerError;

/// Unique identifier for a service worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(u64);

impl WorkerId {
    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric ID.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sw-{}", self.0)
    }
}

/// A service worker instance for one generation.
pub struct ServiceWorker {
    id: WorkerId,
    script_url: Url,
    scope: Url,
    config: OfflineConfig,
    lifecycle: Mutex<LifecycleController>,
    caches: Arc<CacheStorage>,
    network: Arc<dyn Network>,
    clients: Arc<RwLock<Clients>>,
    gateway: FetchGateway,
    events: broadcast::Sender<ServiceWorkerEvent>,
    created_at: Instant,
}

impl fmt::Debug for ServiceWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceWorker")
            .field("id", &self.id)
            .field("script_url", &self.script_url.as_str())
            .field("generation", &self.config.cache_name)
            .finish()
    }
}

impl ServiceWorker {
    /// Create a worker for `config`'s generation.
    pub fn new(
        script_url: Url,
        scope: Url,
        config: OfflineConfig,
        caches: Arc<CacheStorage>,
        network: Arc<dyn Network>,
        clients: Arc<RwLock<Clients>>,
        events: broadcast::Sender<ServiceWorkerEvent>,
    ) -> Result<Self, ServiceWorkerError> {
        let fallback = config
            .resolve(&config.offline_fallback)
            .map_err(|e| ServiceWorkerError::RegistrationFailed(e.to_string()))?;
        let gateway = FetchGateway::new(
            config.cache_name.clone(),
            Arc::clone(&caches),
            Arc::clone(&network),
            RequestRouter::with_manifest_endpoint(&config.manifest_endpoint),
            fallback,
        );

        Ok(Self {
            id: WorkerId::next(),
            script_url,
            scope,
            lifecycle: Mutex::new(LifecycleController::new(config.cache_name.clone())),
            config,
            caches,
            network,
            clients,
            gateway,
            events,
            created_at: Instant::now(),
        })
    }

    /// Worker ID.
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Script URL.
    pub fn script_url(&self) -> &Url {
        &self.script_url
    }

    /// Generation name.
    pub fn generation(&self) -> &str {
        &self.config.cache_name
    }

    /// Configuration this worker was built from.
    pub fn config(&self) -> &OfflineConfig {
        &self.config
    }

    /// Time since the worker was created.
    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    /// Current state.
    pub async fn state(&self) -> WorkerState {
        self.lifecycle.lock().await.state()
    }

    /// Controller record for clients this worker serves.
    pub fn controller(&self) -> Controller {
        Controller {
            worker_id: self.id,
            generation: self.config.cache_name.clone(),
        }
    }

    /// Precache the asset manifest. On failure the worker is redundant and
    /// its generation has been deleted.
    pub async fn install(&self) -> Result<(), ServiceWorkerError> {
        match self.dispatch(LifecycleInput::Install).await? {
            WorkerState::Installed => Ok(()),
            _ => {
                let reason = self
                    .lifecycle
                    .lock()
                    .await
                    .failure()
                    .unwrap_or("install aborted")
                    .to_string();
                Err(ServiceWorkerError::InstallFailed(reason))
            }
        }
    }

    /// Activate now instead of waiting for older clients to go away.
    ///
    /// Deletes every other generation, then claims all open clients.
    pub async fn skip_waiting(&self) -> Result<(), ServiceWorkerError> {
        self.dispatch(LifecycleInput::SkipWaiting).await?;
        Ok(())
    }

    /// Install and, if that succeeds, activate immediately.
    pub async fn run_to_activation(&self) -> Result<(), ServiceWorkerError> {
        self.install().await?;
        self.skip_waiting().await
    }

    /// A newer generation took over.
    pub async fn supersede(&self) -> Result<(), ServiceWorkerError> {
        self.dispatch(LifecycleInput::Superseded).await?;
        Ok(())
    }

    /// Tear the worker down (unregistration).
    pub async fn teardown(&self) -> Result<(), ServiceWorkerError> {
        self.dispatch(LifecycleInput::Unregister).await?;
        self.clients.write().await.release(self.id);
        Ok(())
    }

    /// Intercept a request. Only an activated worker serves.
    pub async fn fetch(&self, request: &Request) -> Result<FetchResponse, ServiceWorkerError> {
        let state = self.state().await;
        if state != WorkerState::Activated {
            return Err(ServiceWorkerError::NotActive(state));
        }
        Ok(self.gateway.handle(request).await?)
    }

    /// Wait for store writes started by [`ServiceWorker::fetch`].
    pub async fn settle(&self) {
        self.gateway.settle().await;
    }

    /// Feed one input through the state machine, performing effects until
    /// no follow-up input remains. Returns the resulting state.
    async fn dispatch(&self, input: LifecycleInput) -> Result<WorkerState, ServiceWorkerError> {
        let mut pending = VecDeque::from([input]);
        while let Some(input) = pending.pop_front() {
            let effects = self.lifecycle.lock().await.handle(input)?;
            for effect in effects {
                if let Some(next) = self.perform(effect).await {
                    pending.push_back(next);
                }
            }
        }
        Ok(self.state().await)
    }

    async fn perform(&self, effect: Effect) -> Option<LifecycleInput> {
        match effect {
            Effect::Precache { generation } => {
                let urls = match self.config.precache_urls() {
                    Ok(urls) => urls,
                    Err(e) => {
                        return Some(LifecycleInput::PrecacheFailed {
                            reason: e.to_string(),
                        })
                    }
                };
                let cache = self.caches.open(&generation).await;
                match cache.add_all(self.network.as_ref(), &urls).await {
                    Ok(()) => Some(LifecycleInput::PrecacheSucceeded),
                    Err(e) => {
                        warn!(worker = %self.id, generation = %generation, error = %e, "Install failed");
                        Some(LifecycleInput::PrecacheFailed {
                            reason: e.to_string(),
                        })
                    }
                }
            }
            Effect::DiscardGeneration { generation } => {
                self.caches.delete(&generation).await;
                None
            }
            Effect::DeleteGenerationsExcept { current } => {
                let deleted = self.caches.delete_all_except(&current).await;
                if !deleted.is_empty() {
                    info!(worker = %self.id, ?deleted, "Removed stale generations");
                }
                Some(LifecycleInput::StaleGenerationsDeleted)
            }
            Effect::ClaimClients { generation } => {
                let controller = self.controller();
                let changed = self.clients.write().await.claim(&controller);
                for client_id in changed {
                    // No receivers just means no page is listening.
                    let _ = self.events.send(ServiceWorkerEvent::ControllerChange {
                        client_id,
                        worker_id: self.id,
                        generation: generation.clone(),
                    });
                }
                Some(LifecycleInput::ClientsClaimed)
            }
            Effect::StateChanged(state) => {
                info!(worker = %self.id, generation = %self.config.cache_name, ?state, "Worker state changed");
                let _ = self.events.send(ServiceWorkerEvent::StateChange {
                    scope: self.scope.clone(),
                    worker_id: self.id,
                    generation: self.config.cache_name.clone(),
                    state,
                });
                None
            }
        }
    }
}
