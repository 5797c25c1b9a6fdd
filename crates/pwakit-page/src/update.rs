//! Update coordination: keeps a page on the newest worker generation.
//!
//! The coordinator registers the worker, checks for a new generation right
//! away and then on a fixed interval, and reloads the page when a new
//! generation finishes installing while an older one controls the page.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pwakit_common::OfflineConfig;
use pwakit_sw::{
    ClientId, RegistrationOptions, ServiceWorkerContainer, ServiceWorkerError,
    ServiceWorkerEvent, UpdateOutcome, WorkerState,
};
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use url::Url;

/// The page's view of the worker runtime.
#[async_trait]
pub trait Registrar: Send + Sync {
    /// Register the worker script, returning its scope.
    async fn register(
        &self,
        script_url: &str,
        options: RegistrationOptions,
    ) -> Result<Url, ServiceWorkerError>;

    /// Check the registration for a new generation.
    async fn update(&self, scope: &Url) -> Result<UpdateOutcome, ServiceWorkerError>;

    /// Whether a worker currently controls `client`.
    async fn has_controller(&self, client: &ClientId) -> bool;

    /// Lifecycle notifications for every registration.
    fn subscribe(&self) -> broadcast::Receiver<ServiceWorkerEvent>;
}

#[async_trait]
impl Registrar for ServiceWorkerContainer {
    async fn register(
        &self,
        script_url: &str,
        options: RegistrationOptions,
    ) -> Result<Url, ServiceWorkerError> {
        ServiceWorkerContainer::register(self, script_url, options).await
    }

    async fn update(&self, scope: &Url) -> Result<UpdateOutcome, ServiceWorkerError> {
        ServiceWorkerContainer::update(self, scope).await
    }

    async fn has_controller(&self, client: &ClientId) -> bool {
        self.controller(client).await.is_some()
    }

    fn subscribe(&self) -> broadcast::Receiver<ServiceWorkerEvent> {
        ServiceWorkerContainer::subscribe(self)
    }
}

/// Navigates the page to itself.
pub trait Reloader: Send + Sync {
    fn reload(&self);
}

/// Where the coordinator stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorStatus {
    /// `start` has not run yet.
    Idle,
    /// Registered; polling for updates.
    Registered { scope: Url },
    /// Registration was rejected; the page runs without offline support.
    Unsupported { reason: String },
    /// Stopped by the page.
    Stopped,
}

/// Whether a worker reaching `state` should reload the page.
///
/// Only a generation that finishes installing while another already
/// controls the page replaces anything. The very first install does not.
pub fn should_reload(state: WorkerState, has_controller: bool) -> bool {
    state == WorkerState::Installed && has_controller
}

/// Registers the worker and reloads the page onto new generations.
pub struct UpdateCoordinator {
    registrar: Arc<dyn Registrar>,
    reloader: Arc<dyn Reloader>,
    client: ClientId,
    script_url: String,
    scope: String,
    interval: Duration,
    status: watch::Sender<CoordinatorStatus>,
    controlled: Arc<AtomicBool>,
    reloaded: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl UpdateCoordinator {
    /// Create a coordinator for the page `client`, using the worker script,
    /// scope, and poll interval from `config`.
    pub fn new(
        registrar: Arc<dyn Registrar>,
        reloader: Arc<dyn Reloader>,
        client: ClientId,
        config: &OfflineConfig,
    ) -> Self {
        let (status, _) = watch::channel(CoordinatorStatus::Idle);
        Self {
            registrar,
            reloader,
            client,
            script_url: config.worker_script.clone(),
            scope: config.scope.clone(),
            interval: config.update_interval(),
            status,
            controlled: Arc::new(AtomicBool::new(false)),
            reloaded: Arc::new(AtomicBool::new(false)),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Current status.
    pub fn status(&self) -> CoordinatorStatus {
        self.status.borrow().clone()
    }

    /// Watch status changes.
    pub fn watch_status(&self) -> watch::Receiver<CoordinatorStatus> {
        self.status.subscribe()
    }

    /// Whether the page was controlled as of the last processed event.
    pub fn is_controlled(&self) -> bool {
        self.controlled.load(Ordering::Acquire)
    }

    /// Whether a reload has been requested.
    pub fn reload_requested(&self) -> bool {
        self.reloaded.load(Ordering::Acquire)
    }

    /// Register the worker, check for an update immediately, and start the
    /// periodic check and the lifecycle listener.
    ///
    /// Registration failure is not an error for the page: it is logged and
    /// the coordinator reports [`CoordinatorStatus::Unsupported`].
    pub async fn start(&self) -> CoordinatorStatus {
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            return self.status();
        }

        // Subscribe before registering so the first install's events are seen.
        let events = self.registrar.subscribe();
        self.controlled.store(
            self.registrar.has_controller(&self.client).await,
            Ordering::Release,
        );

        let options = RegistrationOptions::no_cache(self.scope.clone());
        let scope = match self.registrar.register(&self.script_url, options).await {
            Ok(scope) => scope,
            Err(e) => {
                warn!(script = %self.script_url, error = %e, "Service worker registration failed");
                let status = CoordinatorStatus::Unsupported {
                    reason: e.to_string(),
                };
                self.status.send_replace(status.clone());
                return status;
            }
        };
        info!(scope = %scope, "Service worker registered");

        tasks.push(self.spawn_listener(scope.clone(), events));
        check_for_update(self.registrar.as_ref(), &scope).await;
        tasks.push(self.spawn_poll(scope.clone()));

        let status = CoordinatorStatus::Registered { scope };
        self.status.send_replace(status.clone());
        status
    }

    /// Check for a new generation now, outside the regular schedule.
    pub async fn check_now(&self) -> Option<UpdateOutcome> {
        match self.status() {
            CoordinatorStatus::Registered { scope } => {
                check_for_update(self.registrar.as_ref(), &scope).await
            }
            _ => None,
        }
    }

    /// Stop polling and listening.
    pub async fn stop(&self) {
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        self.status.send_replace(CoordinatorStatus::Stopped);
        debug!(client = %self.client, "Update coordinator stopped");
    }

    fn spawn_poll(&self, scope: Url) -> JoinHandle<()> {
        let registrar = Arc::clone(&self.registrar);
        let period = self.interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick is immediate; start already checked.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                check_for_update(registrar.as_ref(), &scope).await;
            }
        })
    }

    fn spawn_listener(
        &self,
        scope: Url,
        mut events: broadcast::Receiver<ServiceWorkerEvent>,
    ) -> JoinHandle<()> {
        let registrar = Arc::clone(&self.registrar);
        let reloader = Arc::clone(&self.reloader);
        let client = self.client.clone();
        let controlled = Arc::clone(&self.controlled);
        let reloaded = Arc::clone(&self.reloaded);

        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "Lifecycle events dropped; re-reading controller");
                        let now = registrar.has_controller(&client).await;
                        controlled.store(now, Ordering::Release);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };

                match event {
                    ServiceWorkerEvent::ControllerChange {
                        client_id,
                        generation,
                        ..
                    } if client_id == client => {
                        debug!(client = %client, generation = %generation, "Controller changed");
                        controlled.store(true, Ordering::Release);
                    }
                    ServiceWorkerEvent::StateChange {
                        scope: event_scope,
                        generation,
                        state,
                        ..
                    } if event_scope == scope => {
                        // Unregistering releases the page without an event.
                        if state == WorkerState::Installed && controlled.load(Ordering::Acquire) {
                            let now = registrar.has_controller(&client).await;
                            controlled.store(now, Ordering::Release);
                        }
                        if !should_reload(state, controlled.load(Ordering::Acquire)) {
                            continue;
                        }
                        // The page navigates away; once is enough.
                        if !reloaded.swap(true, Ordering::AcqRel) {
                            info!(generation = %generation, "New generation installed; reloading");
                            reloader.reload();
                        }
                    }
                    _ => {}
                }
            }
        })
    }
}

impl Drop for UpdateCoordinator {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

async fn check_for_update(registrar: &dyn Registrar, scope: &Url) -> Option<UpdateOutcome> {
    match registrar.update(scope).await {
        Ok(outcome) => {
            match &outcome {
                UpdateOutcome::NoChange => debug!(scope = %scope, "Worker is current"),
                UpdateOutcome::Installed { generation } => {
                    info!(scope = %scope, generation = %generation, "Worker updated")
                }
                UpdateOutcome::InstallFailed { generation, reason } => {
                    warn!(scope = %scope, generation = %generation, reason = %reason, "Worker update failed to install")
                }
            }
            Some(outcome)
        }
        Err(e) => {
            warn!(scope = %scope, error = %e, "Update check failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pwakit_net::Request;
    use pwakit_sw::{MemoryNetwork, UpdateViaCache, WorkerScriptSource};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;

    fn origin() -> Url {
        Url::parse("https://shop.example/").unwrap()
    }

    #[derive(Default)]
    struct CountingReloader {
        reloads: AtomicUsize,
    }

    impl Reloader for CountingReloader {
        fn reload(&self) {
            self.reloads.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl CountingReloader {
        fn count(&self) -> usize {
            self.reloads.load(Ordering::SeqCst)
        }
    }

    struct Deploy {
        config: StdMutex<OfflineConfig>,
    }

    impl Deploy {
        fn new(generation: &str) -> Arc<Self> {
            Arc::new(Self {
                config: StdMutex::new(
                    OfflineConfig::new(origin(), generation).with_precache(["/", "/index.html"]),
                ),
            })
        }

        fn publish(&self, generation: &str) {
            self.config.lock().unwrap().cache_name = generation.to_string();
        }
    }

    #[async_trait]
    impl WorkerScriptSource for Deploy {
        async fn load(
            &self,
            _script_url: &Url,
            _update_via_cache: UpdateViaCache,
        ) -> Result<OfflineConfig, ServiceWorkerError> {
            Ok(self.config.lock().unwrap().clone())
        }
    }

    fn container(deploy: Arc<Deploy>) -> Arc<ServiceWorkerContainer> {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("pwakit_page=debug,pwakit_sw=info")
            .with_test_writer()
            .try_init();
        let network = Arc::new(MemoryNetwork::new(origin()));
        network.serve("/", "home");
        network.serve("/index.html", "home");
        Arc::new(ServiceWorkerContainer::new(origin(), network, deploy))
    }

    async fn until(cond: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !cond() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("condition not reached");
    }

    /// Registrar with scripted results and a hand-driven event stream.
    struct ScriptedRegistrar {
        reject: bool,
        controlled: AtomicBool,
        updates: AtomicUsize,
        modes: StdMutex<Vec<UpdateViaCache>>,
        events: broadcast::Sender<ServiceWorkerEvent>,
    }

    impl ScriptedRegistrar {
        fn new(reject: bool, controlled: bool) -> Arc<Self> {
            Arc::new(Self {
                reject,
                controlled: AtomicBool::new(controlled),
                updates: AtomicUsize::new(0),
                modes: StdMutex::new(Vec::new()),
                events: broadcast::channel(16).0,
            })
        }
    }

    #[async_trait]
    impl Registrar for ScriptedRegistrar {
        async fn register(
            &self,
            _script_url: &str,
            options: RegistrationOptions,
        ) -> Result<Url, ServiceWorkerError> {
            self.modes.lock().unwrap().push(options.update_via_cache);
            if self.reject {
                return Err(ServiceWorkerError::SecurityError("insecure context".into()));
            }
            Ok(origin())
        }

        async fn update(&self, _scope: &Url) -> Result<UpdateOutcome, ServiceWorkerError> {
            self.updates.fetch_add(1, Ordering::SeqCst);
            Ok(UpdateOutcome::NoChange)
        }

        async fn has_controller(&self, _client: &ClientId) -> bool {
            self.controlled.load(Ordering::SeqCst)
        }

        fn subscribe(&self) -> broadcast::Receiver<ServiceWorkerEvent> {
            self.events.subscribe()
        }
    }

    fn client() -> ClientId {
        let mut clients = pwakit_sw::Clients::new();
        clients.open_window(origin(), None).id
    }

    #[test]
    fn test_should_reload() {
        assert!(should_reload(WorkerState::Installed, true));
        assert!(!should_reload(WorkerState::Installed, false));
        assert!(!should_reload(WorkerState::Activated, true));
        assert!(!should_reload(WorkerState::Installing, true));
    }

    #[tokio::test]
    async fn test_registration_failure_degrades() {
        let registrar = ScriptedRegistrar::new(true, false);
        let reloader = Arc::new(CountingReloader::default());
        let coordinator = UpdateCoordinator::new(
            registrar.clone(),
            reloader,
            client(),
            &OfflineConfig::default(),
        );

        let status = coordinator.start().await;
        assert!(matches!(status, CoordinatorStatus::Unsupported { .. }));
        assert_eq!(registrar.updates.load(Ordering::SeqCst), 0);
        assert!(coordinator.check_now().await.is_none());
    }

    #[tokio::test]
    async fn test_registers_with_script_revalidation() {
        let registrar = ScriptedRegistrar::new(false, false);
        let coordinator = UpdateCoordinator::new(
            registrar.clone(),
            Arc::new(CountingReloader::default()),
            client(),
            &OfflineConfig::default(),
        );

        coordinator.start().await;
        assert_eq!(*registrar.modes.lock().unwrap(), vec![UpdateViaCache::None]);
        // Immediate check after registration.
        assert_eq!(registrar.updates.load(Ordering::SeqCst), 1);
        coordinator.stop().await;
        assert_eq!(coordinator.status(), CoordinatorStatus::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_every_interval() {
        let registrar = ScriptedRegistrar::new(false, false);
        let coordinator = UpdateCoordinator::new(
            registrar.clone(),
            Arc::new(CountingReloader::default()),
            client(),
            &OfflineConfig::default(),
        );
        coordinator.start().await;
        assert_eq!(registrar.updates.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(299)).await;
        assert_eq!(registrar.updates.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(registrar.updates.load(Ordering::SeqCst), 2);

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(registrar.updates.load(Ordering::SeqCst), 3);

        coordinator.stop().await;
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(registrar.updates.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_installed_under_controller_reloads_once() {
        let registrar = ScriptedRegistrar::new(false, true);
        let reloader = Arc::new(CountingReloader::default());
        let coordinator = UpdateCoordinator::new(
            registrar.clone(),
            reloader.clone(),
            client(),
            &OfflineConfig::default(),
        );
        coordinator.start().await;

        for generation in ["v3", "v4"] {
            registrar
                .events
                .send(ServiceWorkerEvent::StateChange {
                    scope: origin(),
                    worker_id: test_worker_id(),
                    generation: generation.into(),
                    state: WorkerState::Installed,
                })
                .unwrap();
        }

        until(|| coordinator.reload_requested()).await;
        tokio::task::yield_now().await;
        assert_eq!(reloader.count(), 1);
        coordinator.stop().await;
    }

    #[tokio::test]
    async fn test_released_page_does_not_reload() {
        let registrar = ScriptedRegistrar::new(false, true);
        let reloader = Arc::new(CountingReloader::default());
        let coordinator = UpdateCoordinator::new(
            registrar.clone(),
            reloader.clone(),
            client(),
            &OfflineConfig::default(),
        );
        coordinator.start().await;
        assert!(coordinator.is_controlled());

        // Unregistered elsewhere: the page lost its controller silently.
        registrar.controlled.store(false, Ordering::SeqCst);
        registrar
            .events
            .send(ServiceWorkerEvent::StateChange {
                scope: origin(),
                worker_id: test_worker_id(),
                generation: "v3".into(),
                state: WorkerState::Installed,
            })
            .unwrap();

        until(|| !coordinator.is_controlled()).await;
        tokio::task::yield_now().await;
        assert_eq!(reloader.count(), 0);
        assert!(!coordinator.reload_requested());
        coordinator.stop().await;
    }

    fn test_worker_id() -> pwakit_sw::WorkerId {
        let config = OfflineConfig::new(origin(), "v0");
        pwakit_sw::ServiceWorker::new(
            origin().join("/sw.js").unwrap(),
            origin(),
            config,
            Arc::new(pwakit_sw::CacheStorage::new()),
            Arc::new(MemoryNetwork::new(origin())),
            Arc::new(tokio::sync::RwLock::new(pwakit_sw::Clients::new())),
            broadcast::channel(1).0,
        )
        .unwrap()
        .id()
    }

    #[tokio::test]
    async fn test_first_install_does_not_reload() {
        let deploy = Deploy::new("v1");
        let container = container(deploy);
        let page = container.open_client(origin()).await;
        let reloader = Arc::new(CountingReloader::default());

        let coordinator = UpdateCoordinator::new(
            container.clone(),
            reloader.clone(),
            page.id.clone(),
            &OfflineConfig::default(),
        );
        let status = coordinator.start().await;
        assert_eq!(status, CoordinatorStatus::Registered { scope: origin() });

        // Controlled now means Installed and the claim were both processed.
        until(|| coordinator.is_controlled()).await;
        assert_eq!(reloader.count(), 0);
        assert!(!coordinator.reload_requested());
        coordinator.stop().await;
    }

    #[tokio::test]
    async fn test_new_generation_reloads_controlled_page() {
        let deploy = Deploy::new("v2");
        let container = container(deploy.clone());
        let page = container.open_client(origin()).await;
        let reloader = Arc::new(CountingReloader::default());
        let coordinator = UpdateCoordinator::new(
            container.clone(),
            reloader.clone(),
            page.id.clone(),
            &OfflineConfig::default(),
        );
        coordinator.start().await;
        until(|| coordinator.is_controlled()).await;

        deploy.publish("v3");
        assert_eq!(
            coordinator.check_now().await,
            Some(UpdateOutcome::Installed {
                generation: "v3".into()
            })
        );
        until(|| reloader.count() == 1).await;

        // The reloaded page is served by v3.
        let res = container
            .handle_fetch(Some(&page.id), &Request::get(origin()))
            .await
            .unwrap();
        assert!(res.from_cache());
        assert_eq!(container.controller(&page.id).await.unwrap().generation, "v3");
        coordinator.stop().await;
    }

    #[tokio::test]
    async fn test_second_start_is_noop() {
        let registrar = ScriptedRegistrar::new(false, false);
        let coordinator = UpdateCoordinator::new(
            registrar.clone(),
            Arc::new(CountingReloader::default()),
            client(),
            &OfflineConfig::default(),
        );
        coordinator.start().await;
        coordinator.start().await;
        assert_eq!(registrar.modes.lock().unwrap().len(), 1);
        coordinator.stop().await;
    }
}
