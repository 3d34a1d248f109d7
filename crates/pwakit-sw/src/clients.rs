//! Clients: the open pages a registration can control.

use std::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use tracing::debug;
use url::Url;

use crate::lifecycle::ServiceWorkerId;

/// Unique identifier for a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(u64);

impl ClientId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Client type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientType {
    #[default]
    Window,
    Worker,
    SharedWorker,
}

/// A client (open page).
#[derive(Debug, Clone)]
pub struct Client {
    /// Client ID.
    pub id: ClientId,

    /// Client URL.
    pub url: Url,

    /// Client type.
    pub client_type: ClientType,

    /// Worker currently controlling this client.
    pub controller: Option<ServiceWorkerId>,
}

impl Client {
    /// Whether `worker` controls this client.
    pub fn is_controlled_by(&self, worker: ServiceWorkerId) -> bool {
        self.controller == Some(worker)
    }
}

/// Clients of one registration.
#[derive(Debug, Default)]
pub struct Clients {
    clients: HashMap<ClientId, Client>,
}

impl Clients {
    /// Create new clients manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a client by ID.
    pub fn get(&self, id: ClientId) -> Option<&Client> {
        self.clients.get(&id)
    }

    /// Whether the client belongs to this registration.
    pub fn contains(&self, id: ClientId) -> bool {
        self.clients.contains_key(&id)
    }

    /// Open a window client, controlled by `controller` if one is active.
    pub fn open_window(&mut self, url: Url, controller: Option<ServiceWorkerId>) -> ClientId {
        let id = ClientId::new();
        self.clients.insert(
            id,
            Client {
                id,
                url,
                client_type: ClientType::Window,
                controller,
            },
        );
        id
    }

    /// Remove a client.
    pub fn remove(&mut self, id: ClientId) -> Option<Client> {
        self.clients.remove(&id)
    }

    /// All clients.
    pub fn match_all(&self) -> Vec<&Client> {
        self.clients.values().collect()
    }

    /// Number of clients controlled by `worker`.
    pub fn controlled_by(&self, worker: ServiceWorkerId) -> usize {
        self.clients
            .values()
            .filter(|c| c.is_controlled_by(worker))
            .count()
    }

    /// Make `worker` the controller of every client. Returns the clients whose controller changed.
    pub fn claim(&mut self, worker: ServiceWorkerId) -> Vec<ClientId> {
        let mut changed = Vec::new();
        for client in self.clients.values_mut() {
            if !client.is_controlled_by(worker) {
                client.controller = Some(worker);
                changed.push(client.id);
            }
        }
        debug!(worker = ?worker, claimed = changed.len(), "Clients claimed");
        changed
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
