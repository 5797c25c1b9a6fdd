//! Service worker registration: which worker is installing, waiting, and active.

use std::sync::Arc;
use std::time::{Duration, Instant};

use url::Url;

use crate::worker::ServiceWorker;

/// Whether the HTTP cache may answer update checks for the worker script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdateViaCache {
    /// Only imported scripts may come from the HTTP cache.
    #[default]
    Imports,
    /// Everything may come from the HTTP cache.
    All,
    /// Always revalidate the worker script with the origin.
    None,
}

/// Options for service worker registration.
#[derive(Debug, Clone, Default)]
pub struct RegistrationOptions {
    /// Scope path; defaults to the script's directory.
    pub scope: Option<String>,

    /// Update via cache mode.
    pub update_via_cache: UpdateViaCache,
}

impl RegistrationOptions {
    /// Options that always revalidate the worker script.
    pub fn no_cache(scope: impl Into<String>) -> Self {
        Self {
            scope: Some(scope.into()),
            update_via_cache: UpdateViaCache::None,
        }
    }
}

/// A service worker registration.
#[derive(Debug)]
pub struct ServiceWorkerRegistration {
    /// Scope URL.
    pub scope: Url,

    /// Script URL.
    pub script_url: Url,

    /// Installing worker.
    pub installing: Option<Arc<ServiceWorker>>,

    /// Waiting worker (installed but not active).
    pub waiting: Option<Arc<ServiceWorker>>,

    /// Active worker.
    pub active: Option<Arc<ServiceWorker>>,

    /// Update via cache mode.
    pub update_via_cache: UpdateViaCache,

    /// Last update check time.
    pub last_update_check: Option<Instant>,
}

impl ServiceWorkerRegistration {
    /// Create a new registration.
    pub fn new(scope: Url, script_url: Url, update_via_cache: UpdateViaCache) -> Self {
        Self {
            scope,
            script_url,
            installing: None,
            waiting: None,
            active: None,
            update_via_cache,
            last_update_check: None,
        }
    }

    /// Get the active worker.
    pub fn get_active(&self) -> Option<&Arc<ServiceWorker>> {
        self.active.as_ref()
    }

    /// Generation of the active worker.
    pub fn active_generation(&self) -> Option<&str> {
        self.active.as_deref().map(ServiceWorker::generation)
    }

    /// Check if an update check is due.
    pub fn needs_update(&self, check_interval: Duration) -> bool {
        match self.last_update_check {
            Some(last) => last.elapsed() >= check_interval,
            None => true,
        }
    }

    /// Whether `url` falls under this registration's scope.
    pub fn in_scope(&self, url: &Url) -> bool {
        url.origin() == self.scope.origin() && url.path().starts_with(self.scope.path())
    }

    /// Promote the waiting worker, returning the previous active worker.
    pub fn promote_waiting(&mut self) -> Option<Arc<ServiceWorker>> {
        let next = self.waiting.take()?;
        self.active.replace(next)
    }

    /// Remove every worker from the registration.
    pub fn take_all(&mut self) -> Vec<Arc<ServiceWorker>> {
        [self.installing.take(), self.waiting.take(), self.active.take()]
            .into_iter()
            .flatten()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registration() -> ServiceWorkerRegistration {
        let scope = Url::parse("https://shop.example/app/").unwrap();
        let script = Url::parse("https://shop.example/app/sw.js").unwrap();
        ServiceWorkerRegistration::new(scope, script, UpdateViaCache::None)
    }

    #[test]
    fn test_new_registration_is_empty() {
        let registration = registration();
        assert!(registration.get_active().is_none());
        assert!(registration.active_generation().is_none());
        assert!(registration.needs_update(Duration::from_secs(300)));
    }

    #[test]
    fn test_needs_update_after_interval() {
        let mut registration = registration();
        registration.last_update_check = Some(Instant::now());
        assert!(!registration.needs_update(Duration::from_secs(300)));
        assert!(registration.needs_update(Duration::ZERO));
    }

    #[test]
    fn test_scope_matching() {
        let registration = registration();
        assert!(registration.in_scope(&Url::parse("https://shop.example/app/cart").unwrap()));
        assert!(!registration.in_scope(&Url::parse("https://shop.example/admin").unwrap()));
        assert!(!registration.in_scope(&Url::parse("https://other.example/app/").unwrap()));
    }

    #[test]
    fn test_no_cache_options() {
        let options = RegistrationOptions::no_cache("/");
        assert_eq!(options.update_via_cache, UpdateViaCache::None);
        assert_eq!(options.scope.as_deref(), Some("/"));
    }
}
