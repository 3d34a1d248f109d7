//! # PwaKit Service Worker
//!
//! Offline cache manager for progressive web apps: a fetch-intercepting
//! worker that keeps the app usable without a network.
//!
//! ## Features
//!
//! - **Install**: pre-cache an essential resource manifest, all or nothing
//! - **Activate**: purge stale cache generations, claim open pages
//! - **Fetch**: cache first, network second, offline fallback last
//! - **Messages**: `SKIP_WAITING` and `GET_VERSION` from pages
//!
//! ## Architecture
//!
//! ```text
//! ServiceWorkerContainer
//!     │
//!     ├── Registration (per scope)
//!     │       ├── installing / waiting / active (OfflineCacheManager)
//!     │       └── Clients
//!     │
//!     └── CacheStorage (shared)
//!             ├── static generation   (manifest)
//!             └── dynamic generation  (network responses)
//! ```

use pwakit_common::PwaKitError;
use thiserror::Error;

pub mod cache;
pub mod clients;
pub mod config;
pub mod container;
pub mod fetch;
pub mod lifecycle;
pub mod manager;
pub mod message;

pub use cache::{Cache, CacheEntry, CacheKey, CacheStorage, MemoryCacheStorage};
pub use clients::{Client, ClientId, ClientType, Clients};
pub use config::{OfflineConfig, OfflinePage};
pub use container::{RegistrationInfo, ServiceWorkerContainer, ServiceWorkerEvent, WorkerSlot};
pub use fetch::{FetchDisposition, FetchEvent, FetchResponse, ResponseSource};
pub use lifecycle::{ActivationReport, Registration, ServiceWorkerId, ServiceWorkerState};
pub use manager::OfflineCacheManager;
pub use message::{ClientMessage, MessageEvent, MessageOutcome, ReplyPort, VersionReply};

// ==================== Errors ====================

/// Errors that can occur in service worker operations.
#[derive(Error, Debug, Clone)]
pub enum ServiceWorkerError {
    #[error("Registration failed: {0}")]
    RegistrationFailed(String),

    #[error("Install failed on {resource}: {reason}")]
    InstallFailed { resource: String, reason: String },

    #[error("State error: {0}")]
    State(String),

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("Message error: {0}")]
    Message(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<ServiceWorkerError> for PwaKitError {
    fn from(err: ServiceWorkerError) -> Self {
        match err {
            ServiceWorkerError::CacheError(message) => PwaKitError::cache(message),
            ServiceWorkerError::Config(message) => PwaKitError::config(message),
            ServiceWorkerError::NotFound(what) => PwaKitError::NotFound(what),
            ServiceWorkerError::RegistrationFailed(message) => {
                PwaKitError::InvalidArgument(message)
            }
            other => PwaKitError::lifecycle("service worker").with_source(other),
        }
    }
}
