//! End-to-end rollout scenarios: a page served by generation v2 while v3 is
//! published, installs, and takes over (or fails to).

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use http::StatusCode;
use pwakit_common::OfflineConfig;
use pwakit_net::{Request, RequestMode, ResponseType};
use pwakit_sw::{
    MemoryNetwork, RegistrationOptions, ResponseSource, ServiceWorkerContainer,
    ServiceWorkerError, ServiceWorkerEvent, UpdateOutcome, UpdateViaCache, WorkerScriptSource,
};
use url::Url;

fn origin() -> Url {
    Url::parse("https://shop.example/").unwrap()
}

fn url(path: &str) -> Url {
    origin().join(path).unwrap()
}

struct Deploy {
    config: Mutex<OfflineConfig>,
}

impl Deploy {
    fn new(generation: &str) -> Arc<Self> {
        Arc::new(Self {
            config: Mutex::new(
                OfflineConfig::new(origin(), generation)
                    .with_precache(["/", "/index.html", "/logo.png"]),
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

fn origin_server() -> Arc<MemoryNetwork> {
    let network = Arc::new(MemoryNetwork::new(origin()));
    network.serve("/", "<html>shop</html>");
    network.serve("/index.html", "<html>shop</html>");
    network.serve("/logo.png", "PNG");
    network.serve("/manifest.json", r#"{"name":"shop"}"#);
    network
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("pwakit_sw=debug")
        .with_test_writer()
        .try_init();
}

async fn serving_v2() -> (ServiceWorkerContainer, Arc<MemoryNetwork>, Arc<Deploy>, Url) {
    init_tracing();
    let network = origin_server();
    let deploy = Deploy::new("v2");
    let container = ServiceWorkerContainer::new(origin(), network.clone(), deploy.clone());
    let scope = container
        .register("/sw.js", RegistrationOptions::no_cache("/"))
        .await
        .unwrap();
    (container, network, deploy, scope)
}

#[tokio::test]
async fn new_generation_replaces_old_and_serves_offline() {
    let (container, network, deploy, scope) = serving_v2().await;
    let page = container.open_client(url("/")).await;

    deploy.publish("v3");
    let outcome = container.update(&scope).await.unwrap();
    assert_eq!(
        outcome,
        UpdateOutcome::Installed {
            generation: "v3".into()
        }
    );

    // Only the new generation remains.
    assert_eq!(container.caches().keys().await, vec!["v3"]);

    // Precached assets come from the store with the network gone.
    network.set_offline(true);
    let before = network.total_requests();
    let res = container
        .handle_fetch(Some(&page.id), &Request::get(url("/logo.png")))
        .await
        .unwrap();
    assert_eq!(res.source, ResponseSource::Cache);
    assert_eq!(res.response.text().await.unwrap(), "PNG");
    assert_eq!(network.total_requests(), before);
}

#[tokio::test]
async fn failed_install_leaves_previous_generation_serving() {
    let (container, network, deploy, scope) = serving_v2().await;
    let page = container.open_client(url("/")).await;

    network.serve_status("/logo.png", StatusCode::INTERNAL_SERVER_ERROR);
    deploy.publish("v3");
    let outcome = container.update(&scope).await.unwrap();
    assert!(matches!(
        outcome,
        UpdateOutcome::InstallFailed { ref generation, .. } if generation == "v3"
    ));

    // Nothing of v3 is observable.
    assert!(!container.caches().has("v3").await);
    assert_eq!(container.active_generation(&scope).await.as_deref(), Some("v2"));

    for path in ["/", "/index.html", "/logo.png"] {
        let res = container
            .handle_fetch(Some(&page.id), &Request::get(url(path)))
            .await
            .unwrap();
        assert_eq!(res.source, ResponseSource::Cache, "{path}");
    }
}

#[tokio::test]
async fn failed_install_is_retried_on_next_check() {
    let (container, network, deploy, scope) = serving_v2().await;

    network.fail("/logo.png");
    deploy.publish("v3");
    assert!(matches!(
        container.update(&scope).await.unwrap(),
        UpdateOutcome::InstallFailed { .. }
    ));

    network.serve("/logo.png", "PNG v3");
    assert_eq!(
        container.update(&scope).await.unwrap(),
        UpdateOutcome::Installed {
            generation: "v3".into()
        }
    );
}

#[tokio::test]
async fn manifest_endpoint_is_never_cached() {
    let (container, network, _deploy, _scope) = serving_v2().await;
    let page = container.open_client(url("/")).await;

    for _ in 0..3 {
        let res = container
            .handle_fetch(Some(&page.id), &Request::get(url("/manifest.json")))
            .await
            .unwrap();
        assert_eq!(res.source, ResponseSource::Network);
    }
    assert_eq!(network.requests_for("/manifest.json"), 3);

    network.set_offline(true);
    assert!(container
        .handle_fetch(Some(&page.id), &Request::get(url("/manifest.json")))
        .await
        .is_err());
}

#[tokio::test]
async fn only_basic_successful_responses_are_stored() {
    let (container, network, _deploy, _scope) = serving_v2().await;
    let page = container.open_client(url("/")).await;
    network.serve_typed("/ads.js", "ads", ResponseType::Opaque);

    let missing = container
        .handle_fetch(Some(&page.id), &Request::get(url("/missing.css")))
        .await
        .unwrap();
    assert_eq!(missing.response.status, StatusCode::NOT_FOUND);

    let opaque = container
        .handle_fetch(
            Some(&page.id),
            &Request::get(url("/ads.js")).mode(RequestMode::NoCors),
        )
        .await
        .unwrap();
    assert_eq!(opaque.response.response_type, ResponseType::Opaque);

    container.active_for(&url("/")).await.unwrap().settle().await;
    let cache = container.caches().get("v2").await.unwrap();
    assert_eq!(cache.len().await, 3);
}

#[tokio::test]
async fn offline_navigation_falls_back_to_root_document() {
    let (container, network, _deploy, _scope) = serving_v2().await;
    network.set_offline(true);

    let res = container
        .handle_fetch(None, &Request::navigate(url("/orders/17")))
        .await
        .unwrap();
    assert_eq!(res.source, ResponseSource::OfflineFallback);
    assert_eq!(res.response.text().await.unwrap(), "<html>shop</html>");

    let page = container.open_client(url("/")).await;
    assert!(container
        .handle_fetch(Some(&page.id), &Request::get(url("/orders.js")))
        .await
        .is_err());
}

#[tokio::test]
async fn lifecycle_events_reach_pages_in_order() {
    let (container, _network, deploy, scope) = serving_v2().await;
    let page = container.open_client(url("/")).await;
    let mut events = container.subscribe();

    deploy.publish("v3");
    container.update(&scope).await.unwrap();

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        match event {
            ServiceWorkerEvent::UpdateFound { .. } => seen.push("updatefound".to_string()),
            ServiceWorkerEvent::StateChange {
                generation, state, ..
            } => seen.push(format!("{generation}:{state:?}")),
            ServiceWorkerEvent::ControllerChange { client_id, .. } => {
                assert_eq!(client_id, page.id);
                seen.push("controllerchange".to_string());
            }
        }
    }

    assert_eq!(
        seen,
        vec![
            "updatefound",
            "v3:Installing",
            "v3:Installed",
            "v3:Activating",
            "controllerchange",
            "v3:Activated",
            "v2:Redundant",
        ]
    );
    assert_eq!(
        container.controller(&page.id).await.unwrap().generation,
        "v3"
    );
}

#[tokio::test]
async fn persisted_store_serves_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("caches.json");
    let (container, _network, _deploy, _scope) = serving_v2().await;
    container.persist(&path).await.unwrap();

    let restored = pwakit_sw::CacheStorage::load_from(&path, None).await.unwrap();
    assert_eq!(restored.keys().await, vec!["v2"]);
    let hit = restored
        .match_request(&Request::get(url("/logo.png")))
        .await
        .unwrap();
    assert_eq!(hit.text().await.unwrap(), "PNG");
}
