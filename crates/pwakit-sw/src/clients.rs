//! Clients API: the open pages of the origin and who controls them.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use tracing::debug;
use url::Url;

use crate::worker::WorkerId;

/// Client identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(String);

impl ClientId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(format!("client-{}", COUNTER.fetch_add(1, Ordering::Relaxed)))
    }

    /// Borrow as str.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Client type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientType {
    #[default]
    Window,
    Worker,
}

/// The worker generation serving a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Controller {
    pub worker_id: WorkerId,
    pub generation: String,
}

/// A client (an open page or a dedicated worker).
#[derive(Debug, Clone)]
pub struct Client {
    /// Client ID.
    pub id: ClientId,

    /// Client URL.
    pub url: Url,

    /// Client type.
    pub client_type: ClientType,

    /// Controlling worker, if any.
    pub controller: Option<Controller>,
}

impl Client {
    /// Whether a worker serves this client.
    pub fn is_controlled(&self) -> bool {
        self.controller.is_some()
    }
}

/// Clients API.
#[derive(Debug, Default)]
pub struct Clients {
    clients: HashMap<ClientId, Client>,
}

impl Clients {
    /// Create new clients manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a newly opened page, controlled by `controller` if one is active.
    pub fn open_window(&mut self, url: Url, controller: Option<Controller>) -> Client {
        let client = Client {
            id: ClientId::next(),
            url,
            client_type: ClientType::Window,
            controller,
        };
        debug!(client = %client.id, url = %client.url, controlled = client.is_controlled(), "Client opened");
        self.clients.insert(client.id.clone(), client.clone());
        client
    }

    /// Get a client by ID.
    pub fn get(&self, id: &ClientId) -> Option<&Client> {
        self.clients.get(id)
    }

    /// Remove a client (page closed or navigated away).
    pub fn remove(&mut self, id: &ClientId) -> Option<Client> {
        self.clients.remove(id)
    }

    /// All clients, optionally including those no worker controls.
    pub fn match_all(&self, include_uncontrolled: bool) -> Vec<&Client> {
        let mut clients: Vec<_> = self
            .clients
            .values()
            .filter(|c| include_uncontrolled || c.is_controlled())
            .collect();
        clients.sort_by(|a, b| a.id.cmp(&b.id));
        clients
    }

    /// Make `controller` serve every window client. Returns the clients whose
    /// controller changed.
    pub fn claim(&mut self, controller: &Controller) -> Vec<ClientId> {
        let mut changed: Vec<_> = self
            .clients
            .values_mut()
            .filter(|c| c.client_type == ClientType::Window)
            .filter(|c| c.controller.as_ref() != Some(controller))
            .map(|c| {
                c.controller = Some(controller.clone());
                c.id.clone()
            })
            .collect();
        changed.sort();
        changed
    }

    /// Drop control by `worker_id` from every client.
    pub fn release(&mut self, worker_id: WorkerId) {
        for client in self.clients.values_mut() {
            if client
                .controller
                .as_ref()
                .is_some_and(|c| c.worker_id == worker_id)
            {
                client.controller = None;
            }
        }
    }

    /// Number of clients.
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Whether no clients are open.
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(path: &str) -> Url {
        Url::parse("https://shop.example/").unwrap().join(path).unwrap()
    }

    fn controller(generation: &str) -> Controller {
        Controller {
            worker_id: WorkerId::next(),
            generation: generation.to_string(),
        }
    }

    #[test]
    fn test_open_window() {
        let mut clients = Clients::new();
        let client = clients.open_window(page("/"), None);

        assert_eq!(client.client_type, ClientType::Window);
        assert!(!client.is_controlled());
        assert!(clients.get(&client.id).is_some());
        assert_eq!(clients.match_all(false).len(), 0);
        assert_eq!(clients.match_all(true).len(), 1);
    }

    #[test]
    fn test_claim_repoints_all_windows() {
        let mut clients = Clients::new();
        let v2 = controller("v2");
        let old = clients.open_window(page("/"), Some(v2));
        let fresh = clients.open_window(page("/shop"), None);

        let v3 = controller("v3");
        let changed = clients.claim(&v3);
        assert_eq!(changed.len(), 2);
        assert_eq!(clients.get(&old.id).unwrap().controller, Some(v3.clone()));
        assert_eq!(clients.get(&fresh.id).unwrap().controller, Some(v3.clone()));

        // Claiming again changes nothing.
        assert!(clients.claim(&v3).is_empty());
    }

    #[test]
    fn test_release() {
        let mut clients = Clients::new();
        let v1 = controller("v1");
        let client = clients.open_window(page("/"), Some(v1.clone()));

        clients.release(v1.worker_id);
        assert!(!clients.get(&client.id).unwrap().is_controlled());

        assert!(clients.remove(&client.id).is_some());
        assert!(clients.is_empty());
    }
}
