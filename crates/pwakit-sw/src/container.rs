//! Host-side registry of registrations (`navigator.serviceWorker`).

use std::sync::Arc;

use hashbrown::HashMap;
use pwakit_net::Fetcher;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};
use url::Url;

use crate::cache::{CacheStorage, MemoryCacheStorage};
use crate::clients::ClientId;
use crate::config::OfflineConfig;
use crate::fetch::{FetchDisposition, FetchEvent};
use crate::lifecycle::{ActivationReport, Registration, ServiceWorkerId, ServiceWorkerState};
use crate::manager::OfflineCacheManager;
use crate::message::{MessageEvent, MessageOutcome};
use crate::ServiceWorkerError;

/// Service worker events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceWorkerEvent {
    /// A new version started installing.
    UpdateFound { registration_scope: String },
    /// A worker changed state.
    StateChange {
        registration_scope: String,
        worker_id: ServiceWorkerId,
        new_state: ServiceWorkerState,
    },
    /// A page got a new controller.
    ControllerChange {
        client_id: ClientId,
        worker_id: ServiceWorkerId,
    },
    /// Install failed; the worker is redundant.
    InstallFailed {
        registration_scope: String,
        worker_id: ServiceWorkerId,
        error: String,
    },
}

/// Which worker of a registration a message goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerSlot {
    Waiting,
    Active,
}

/// Snapshot of a registration's workers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationInfo {
    pub scope: String,
    pub installing: Option<ServiceWorkerId>,
    pub waiting: Option<ServiceWorkerId>,
    pub active: Option<ServiceWorkerId>,
    pub active_version: Option<String>,
    pub clients: usize,
}

/// Service worker container.
pub struct ServiceWorkerContainer {
    /// Registrations by scope.
    registrations: RwLock<HashMap<String, Arc<RwLock<Registration>>>>,

    /// Cache storage shared by every worker of the origin.
    pub caches: Arc<dyn CacheStorage>,

    /// Event sender for state changes.
    event_tx: mpsc::UnboundedSender<ServiceWorkerEvent>,
}

impl ServiceWorkerContainer {
    /// Create a container over in-memory cache storage.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ServiceWorkerEvent>) {
        Self::with_storage(Arc::new(MemoryCacheStorage::new()))
    }

    /// Create a container over the given cache storage.
    pub fn with_storage(
        caches: Arc<dyn CacheStorage>,
    ) -> (Self, mpsc::UnboundedReceiver<ServiceWorkerEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (
            Self {
                registrations: RwLock::new(HashMap::new()),
                caches,
                event_tx,
            },
            event_rx,
        )
    }

    fn emit(&self, event: ServiceWorkerEvent) {
        // Nobody listening is fine.
        let _ = self.event_tx.send(event);
    }

    fn emit_state(&self, scope: &str, worker_id: ServiceWorkerId, new_state: ServiceWorkerState) {
        self.emit(ServiceWorkerEvent::StateChange {
            registration_scope: scope.to_string(),
            worker_id,
            new_state,
        });
    }

    fn emit_activation(&self, scope: &str, report: &ActivationReport) {
        if let Some(old) = report.replaced {
            self.emit_state(scope, old, ServiceWorkerState::Redundant);
        }
        self.emit_state(scope, report.worker_id, ServiceWorkerState::Activated);
        for client_id in &report.claimed_clients {
            self.emit(ServiceWorkerEvent::ControllerChange {
                client_id: *client_id,
                worker_id: report.worker_id,
            });
        }
    }

    /// Register a new version of the worker for `scope`.
    ///
    /// Runs install, then activates if nothing holds the new version back.
    /// The registration stays available to fetches and messages while the
    /// manifest downloads.
    pub async fn register(
        &self,
        scope: &str,
        config: OfflineConfig,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<ServiceWorkerId, ServiceWorkerError> {
        let scope = Url::parse(scope)
            .map_err(|e| ServiceWorkerError::RegistrationFailed(e.to_string()))?;
        if !matches!(scope.scheme(), "http" | "https") {
            return Err(ServiceWorkerError::RegistrationFailed(format!(
                "Unsupported scope scheme: {}",
                scope.scheme()
            )));
        }
        config
            .validate()
            .map_err(|e| ServiceWorkerError::Config(e.to_string()))?;

        let scope_str = scope.to_string();
        let registration = {
            let mut registrations = self.registrations.write().await;
            Arc::clone(
                registrations
                    .entry(scope_str.clone())
                    .or_insert_with(|| Arc::new(RwLock::new(Registration::new(scope.clone())))),
            )
        };

        let worker = Arc::new(OfflineCacheManager::new(
            scope,
            config,
            Arc::clone(&self.caches),
            fetcher,
        ));
        let worker_id = worker.id();

        self.emit(ServiceWorkerEvent::UpdateFound {
            registration_scope: scope_str.clone(),
        });

        registration.write().await.begin_install(Arc::clone(&worker));
        let result = worker.install().await;

        let mut registration = registration.write().await;
        if let Err(e) = registration.finish_install(&worker, result) {
            self.emit(ServiceWorkerEvent::InstallFailed {
                registration_scope: scope_str.clone(),
                worker_id,
                error: e.to_string(),
            });
            self.emit_state(&scope_str, worker_id, ServiceWorkerState::Redundant);
            return Err(e);
        }
        self.emit_state(&scope_str, worker_id, ServiceWorkerState::Installed);

        if let Some(report) = registration.try_activate().await? {
            self.emit_activation(&scope_str, &report);
        }

        Ok(worker_id)
    }

    /// Scope of the registration controlling `url` (longest matching scope).
    pub async fn get_registration(&self, url: &str) -> Option<String> {
        let url = Url::parse(url).ok()?;
        let registrations = self.registrations.read().await;
        registrations
            .keys()
            .filter(|scope| url.as_str().starts_with(scope.as_str()))
            .max_by_key(|scope| scope.len())
            .cloned()
    }

    /// Get all registration scopes.
    pub async fn get_registrations(&self) -> Vec<String> {
        self.registrations.read().await.keys().cloned().collect()
    }

    /// Snapshot of a registration.
    pub async fn registration_info(&self, scope: &str) -> Option<RegistrationInfo> {
        let registration = self.registration(scope).await?;
        let registration = registration.read().await;
        Some(RegistrationInfo {
            scope: scope.to_string(),
            installing: registration.installing.as_ref().map(|w| w.id()),
            waiting: registration.waiting.as_ref().map(|w| w.id()),
            active: registration.active.as_ref().map(|w| w.id()),
            active_version: registration.active.as_ref().map(|w| w.version().to_string()),
            clients: registration.clients.len(),
        })
    }

    async fn registration(&self, scope: &str) -> Option<Arc<RwLock<Registration>>> {
        self.registrations.read().await.get(scope).cloned()
    }

    async fn registration_for_url(&self, url: &Url) -> Option<Arc<RwLock<Registration>>> {
        let scope = self.get_registration(url.as_str()).await?;
        self.registration(&scope).await
    }

    async fn registration_for_client(
        &self,
        client_id: ClientId,
    ) -> Option<Arc<RwLock<Registration>>> {
        let registrations: Vec<_> = self.registrations.read().await.values().cloned().collect();
        for registration in registrations {
            if registration.read().await.clients.contains(client_id) {
                return Some(registration);
            }
        }
        None
    }

    // ==================== Clients ====================

    /// A page opened at `url`. It is controlled by the active worker of its scope, if any.
    pub async fn add_client(&self, url: &str) -> Result<ClientId, ServiceWorkerError> {
        let url = Url::parse(url).map_err(|e| ServiceWorkerError::NotFound(e.to_string()))?;
        let registration = self
            .registration_for_url(&url)
            .await
            .ok_or_else(|| ServiceWorkerError::NotFound(format!("No registration for {url}")))?;

        let mut registration = registration.write().await;
        let controller = registration.active.as_ref().map(|w| w.id());
        Ok(registration.clients.open_window(url, controller))
    }

    /// A page closed. May let a waiting worker activate.
    pub async fn close_client(&self, client_id: ClientId) -> Result<(), ServiceWorkerError> {
        let registration = self
            .registration_for_client(client_id)
            .await
            .ok_or_else(|| ServiceWorkerError::NotFound(format!("Client {client_id:?}")))?;

        let mut registration = registration.write().await;
        registration.clients.remove(client_id);
        let scope = registration.scope.to_string();
        if let Some(report) = registration.try_activate().await? {
            self.emit_activation(&scope, &report);
        }
        Ok(())
    }

    // ==================== Events ====================

    /// Route a fetch to the worker controlling it.
    ///
    /// Without an active worker the request passes through to the network.
    pub async fn handle_fetch(&self, event: FetchEvent) -> FetchDisposition {
        let registration = match event.client_id {
            Some(client_id) => self.registration_for_client(client_id).await,
            None => None,
        };
        let registration = match registration {
            Some(r) => Some(r),
            None => self.registration_for_url(&event.request.url).await,
        };

        let Some(registration) = registration else {
            return FetchDisposition::Passthrough;
        };

        // Release the registration before awaiting the network.
        let controller = registration.read().await.controller();
        match controller {
            Some(worker) => worker.handle_fetch(event).await,
            None => FetchDisposition::Passthrough,
        }
    }

    /// Post a message to the waiting or active worker of `scope`.
    pub async fn post_message(
        &self,
        scope: &str,
        slot: WorkerSlot,
        event: MessageEvent,
    ) -> Result<MessageOutcome, ServiceWorkerError> {
        let registration = self
            .registration(scope)
            .await
            .ok_or_else(|| ServiceWorkerError::NotFound(scope.to_string()))?;

        let worker = {
            let registration = registration.read().await;
            match slot {
                WorkerSlot::Waiting => registration.waiting.clone(),
                WorkerSlot::Active => registration.active.clone(),
            }
        }
        .ok_or_else(|| ServiceWorkerError::State(format!("No {slot:?} worker for {scope}")))?;

        let outcome = worker.handle_message(event).await;

        if outcome == MessageOutcome::SkipWaiting && slot == WorkerSlot::Waiting {
            let mut registration = registration.write().await;
            if let Some(report) = registration.try_activate().await? {
                self.emit_activation(scope, &report);
            }
        }

        Ok(outcome)
    }

    /// Dispatch a background sync event to the active worker.
    pub async fn dispatch_sync(&self, scope: &str, tag: &str) -> Result<(), ServiceWorkerError> {
        self.active_worker(scope).await?.handle_sync(tag).await;
        Ok(())
    }

    /// Dispatch a push event to the active worker.
    pub async fn dispatch_push(
        &self,
        scope: &str,
        data: Option<&[u8]>,
    ) -> Result<(), ServiceWorkerError> {
        self.active_worker(scope).await?.handle_push(data).await;
        Ok(())
    }

    async fn active_worker(
        &self,
        scope: &str,
    ) -> Result<Arc<OfflineCacheManager>, ServiceWorkerError> {
        let registration = self
            .registration(scope)
            .await
            .ok_or_else(|| ServiceWorkerError::NotFound(scope.to_string()))?;
        let active = registration.read().await.controller();
        active.ok_or_else(|| ServiceWorkerError::State(format!("No active worker for {scope}")))
    }

    /// Unregister a scope. Every worker becomes redundant; caches are left alone.
    pub async fn unregister(&self, scope: &str) -> Result<bool, ServiceWorkerError> {
        let removed = self.registrations.write().await.remove(scope);
        match removed {
            Some(registration) => {
                registration.write().await.unregister();
                info!(scope, "Service worker unregistered");
                Ok(true)
            }
            None => {
                debug!(scope, "Nothing to unregister");
                Ok(false)
            }
        }
    }
}

impl Default for ServiceWorkerContainer {
    fn default() -> Self {
        Self::new().0
    }
}
