//! Worker states and the registration that moves workers between them.
//!
//! ```text
//! parsed → installing → installed (waiting) → activating → activated → redundant
//!               │                                                 ▲
//!               └──────────── install failed ─────────────────────┘
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use crate::clients::{ClientId, Clients};
use crate::manager::OfflineCacheManager;
use crate::ServiceWorkerError;

/// Unique identifier for a service worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceWorkerId(u64);

impl ServiceWorkerId {
    pub(crate) fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Service worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceWorkerState {
    /// Created, not yet installing.
    #[default]
    Parsed,
    /// Installing (pre-caching the manifest).
    Installing,
    /// Installed and waiting for activation.
    Installed,
    /// Activating (purging stale generations, claiming clients).
    Activating,
    /// Active and intercepting fetches.
    Activated,
    /// Replaced, unregistered, or failed to install.
    Redundant,
}

impl ServiceWorkerState {
    /// Only an activated worker intercepts fetches.
    pub fn can_intercept_fetch(&self) -> bool {
        matches!(self, ServiceWorkerState::Activated)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ServiceWorkerState::Redundant)
    }
}

impl fmt::Display for ServiceWorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServiceWorkerState::Parsed => "parsed",
            ServiceWorkerState::Installing => "installing",
            ServiceWorkerState::Installed => "installed",
            ServiceWorkerState::Activating => "activating",
            ServiceWorkerState::Activated => "activated",
            ServiceWorkerState::Redundant => "redundant",
        };
        f.write_str(s)
    }
}

/// What an activation changed.
#[derive(Debug, Clone)]
pub struct ActivationReport {
    /// Newly active worker.
    pub worker_id: ServiceWorkerId,
    /// Worker it replaced, now redundant.
    pub replaced: Option<ServiceWorkerId>,
    /// Stale generations deleted.
    pub deleted_generations: Vec<String>,
    /// Clients whose controller changed.
    pub claimed_clients: Vec<ClientId>,
}

/// A service worker registration for one scope.
#[derive(Debug)]
pub struct Registration {
    /// Scope URL.
    pub scope: Url,

    /// Installing worker.
    pub installing: Option<Arc<OfflineCacheManager>>,

    /// Waiting worker (installed but not active).
    pub waiting: Option<Arc<OfflineCacheManager>>,

    /// Active worker.
    pub active: Option<Arc<OfflineCacheManager>>,

    /// Open pages in scope.
    pub clients: Clients,

    /// Last time a new version was installed.
    pub last_update_check: Option<Instant>,
}

impl Registration {
    /// Create a new registration.
    pub fn new(scope: Url) -> Self {
        Self {
            scope,
            installing: None,
            waiting: None,
            active: None,
            clients: Clients::new(),
            last_update_check: None,
        }
    }

    /// The worker controlling new requests.
    pub fn controller(&self) -> Option<Arc<OfflineCacheManager>> {
        self.active.clone()
    }

    /// Record `worker` as the installing worker. Any worker it displaces
    /// becomes redundant.
    ///
    /// The install itself runs without the registration held; report the
    /// outcome with [`finish_install`](Self::finish_install).
    pub fn begin_install(&mut self, worker: Arc<OfflineCacheManager>) {
        self.last_update_check = Some(Instant::now());
        if let Some(previous) = self.installing.replace(worker) {
            debug!(worker = ?previous.id(), "Installing worker superseded");
            previous.mark_redundant();
        }
    }

    /// Park a successfully installed worker in `waiting`.
    ///
    /// A worker that failed, or that a later registration displaced while it
    /// was installing, ends up redundant.
    pub fn finish_install(
        &mut self,
        worker: &Arc<OfflineCacheManager>,
        result: Result<(), ServiceWorkerError>,
    ) -> Result<(), ServiceWorkerError> {
        let current = self
            .installing
            .as_ref()
            .is_some_and(|installing| installing.id() == worker.id());
        if !current {
            worker.mark_redundant();
            return Err(result.err().unwrap_or_else(|| {
                ServiceWorkerError::State(format!(
                    "Worker {} was superseded while installing",
                    worker.id().raw()
                ))
            }));
        }
        self.installing = None;

        match result {
            Ok(()) => {
                if let Some(previous) = self.waiting.replace(Arc::clone(worker)) {
                    debug!(worker = ?previous.id(), "Waiting worker superseded");
                    previous.mark_redundant();
                }
                Ok(())
            }
            Err(e) => {
                worker.mark_redundant();
                Err(e)
            }
        }
    }

    /// Whether the waiting worker may activate now.
    ///
    /// True with no active worker, after skip-waiting, or once the active
    /// worker controls no open page.
    pub fn can_activate(&self) -> bool {
        let Some(ref waiting) = self.waiting else {
            return false;
        };
        match self.active {
            None => true,
            Some(ref active) => {
                waiting.skip_waiting_requested() || self.clients.controlled_by(active.id()) == 0
            }
        }
    }

    /// Activate the waiting worker if allowed.
    pub async fn try_activate(&mut self) -> Result<Option<ActivationReport>, ServiceWorkerError> {
        if !self.can_activate() {
            if let Some(ref waiting) = self.waiting {
                debug!(worker = ?waiting.id(), "Worker stays waiting");
            }
            return Ok(None);
        }
        self.activate().await.map(Some)
    }

    /// Activate the waiting worker unconditionally.
    pub async fn activate(&mut self) -> Result<ActivationReport, ServiceWorkerError> {
        let worker = self
            .waiting
            .take()
            .ok_or_else(|| ServiceWorkerError::State("No waiting worker".to_string()))?;

        let deleted_generations = match worker.activate().await {
            Ok(deleted) => deleted,
            Err(e) => {
                warn!(worker = ?worker.id(), error = %e, "Activation failed");
                worker.mark_redundant();
                return Err(e);
            }
        };

        let replaced = self.active.take().map(|old| {
            old.mark_redundant();
            old.id()
        });

        let claimed_clients = self.clients.claim(worker.id());
        worker.mark_activated();

        info!(
            scope = %self.scope,
            worker = ?worker.id(),
            version = worker.version(),
            claimed = claimed_clients.len(),
            "Service worker activated"
        );

        let report = ActivationReport {
            worker_id: worker.id(),
            replaced,
            deleted_generations,
            claimed_clients,
        };
        self.active = Some(worker);
        Ok(report)
    }

    /// Unregister: every worker becomes redundant.
    pub fn unregister(&mut self) {
        for worker in [self.active.take(), self.waiting.take(), self.installing.take()]
            .into_iter()
            .flatten()
        {
            worker.mark_redundant();
        }
    }
}
