//! The offline cache manager: one installed version of the worker.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::{join_all, try_join_all};
use pwakit_net::{Fetcher, Request, Response};
use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};
use url::Url;

use crate::cache::{CacheEntry, CacheKey, CacheStorage};
use crate::config::OfflineConfig;
use crate::fetch::{
    is_cacheable, offline_document, service_unavailable, should_intercept, FetchDisposition,
    FetchEvent, ResponseSource,
};
use crate::lifecycle::{ServiceWorkerId, ServiceWorkerState};
use crate::message::{ClientMessage, MessageEvent, MessageOutcome, BACKGROUND_SYNC_TAG};
use crate::ServiceWorkerError;

/// One version of the offline cache manager.
pub struct OfflineCacheManager {
    id: ServiceWorkerId,
    scope: Url,
    config: Arc<OfflineConfig>,
    storage: Arc<dyn CacheStorage>,
    fetcher: Arc<dyn Fetcher>,
    state: watch::Sender<ServiceWorkerState>,
    skip_waiting: AtomicBool,
}

impl OfflineCacheManager {
    /// Create a worker for `scope`. Nothing happens until [`install`](Self::install).
    pub fn new(
        scope: Url,
        config: OfflineConfig,
        storage: Arc<dyn CacheStorage>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Self {
        let (state, _) = watch::channel(ServiceWorkerState::Parsed);
        Self {
            id: ServiceWorkerId::new(),
            scope,
            config: Arc::new(config),
            storage,
            fetcher,
            state,
            skip_waiting: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> ServiceWorkerId {
        self.id
    }

    pub fn scope(&self) -> &Url {
        &self.scope
    }

    pub fn config(&self) -> &OfflineConfig {
        &self.config
    }

    /// Version identifier reported to pages: the static generation name.
    pub fn version(&self) -> &str {
        &self.config.static_cache_name
    }

    /// Current state.
    pub fn state(&self) -> ServiceWorkerState {
        *self.state.borrow()
    }

    /// Watch state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<ServiceWorkerState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: ServiceWorkerState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(worker = ?self.id, from = %previous, to = %state, "State change");
        }
    }

    pub(crate) fn mark_activated(&self) {
        self.set_state(ServiceWorkerState::Activated);
    }

    pub(crate) fn mark_redundant(&self) {
        self.set_state(ServiceWorkerState::Redundant);
    }

    /// Ask to be activated without waiting for open pages to close.
    pub fn skip_waiting(&self) {
        self.skip_waiting.store(true, Ordering::Release);
    }

    pub fn skip_waiting_requested(&self) -> bool {
        self.skip_waiting.load(Ordering::Acquire)
    }

    // ==================== Install ====================

    /// Pre-cache the manifest into the static generation.
    ///
    /// All or nothing: if any resource fails to fetch or answers with a
    /// non-2xx status, nothing is written and the error is returned. On
    /// success the dynamic generation is created too; later writes only go
    /// into it while it exists.
    pub async fn install(&self) -> Result<(), ServiceWorkerError> {
        self.set_state(ServiceWorkerState::Installing);
        info!(scope = %self.scope, version = self.version(), "Installing service worker");

        match self.precache().await {
            Ok(count) => {
                info!(cache = %self.config.static_cache_name, count, "Essential files cached");
                if self.config.skip_waiting_on_install {
                    self.skip_waiting();
                }
                self.set_state(ServiceWorkerState::Installed);
                Ok(())
            }
            Err(e) => {
                error!(scope = %self.scope, error = %e, "Failed to cache essential files");
                self.set_state(ServiceWorkerState::Redundant);
                Err(e)
            }
        }
    }

    async fn precache(&self) -> Result<usize, ServiceWorkerError> {
        let static_name = &self.config.static_cache_name;
        self.storage.open(static_name).await?;

        let urls = self
            .config
            .manifest
            .iter()
            .map(|entry| {
                self.scope
                    .join(entry)
                    .map_err(|e| ServiceWorkerError::InstallFailed {
                        resource: entry.clone(),
                        reason: e.to_string(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let entries = try_join_all(urls.into_iter().map(|url| self.fetch_for_precache(url))).await?;
        let count = entries.len();
        self.storage.put_all(static_name, entries).await?;
        self.storage.open(&self.config.dynamic_cache_name).await?;
        Ok(count)
    }

    async fn fetch_for_precache(
        &self,
        url: Url,
    ) -> Result<(CacheKey, CacheEntry), ServiceWorkerError> {
        let key = CacheKey::get(&url);
        let request = Request::get(url.clone()).client_origin(self.scope.origin());

        let response = self.fetcher.fetch(request).await.map_err(|e| {
            ServiceWorkerError::InstallFailed {
                resource: url.to_string(),
                reason: e.to_string(),
            }
        })?;

        if !response.ok() {
            return Err(ServiceWorkerError::InstallFailed {
                resource: url.to_string(),
                reason: format!("status {}", response.status),
            });
        }

        trace!(key = %key, "Pre-cached");
        let entry = CacheEntry::from_response(&key, &response);
        Ok((key, entry))
    }

    // ==================== Activate ====================

    /// Delete every generation other than this version's two.
    ///
    /// Returns once every deletion has completed.
    pub async fn activate(&self) -> Result<Vec<String>, ServiceWorkerError> {
        if self.state() != ServiceWorkerState::Installed {
            return Err(ServiceWorkerError::State(format!(
                "Cannot activate a worker that is {}",
                self.state()
            )));
        }
        self.set_state(ServiceWorkerState::Activating);
        info!(scope = %self.scope, version = self.version(), "Activating service worker");

        let stale: Vec<String> = self
            .storage
            .keys()
            .await
            .into_iter()
            .filter(|name| !self.config.is_current_generation(name))
            .collect();

        let results = join_all(stale.iter().map(|name| async move {
            info!(cache = %name, "Deleting old cache");
            self.storage.delete(name).await
        }))
        .await;

        Ok(stale
            .into_iter()
            .zip(results)
            .filter_map(|(name, existed)| existed.then_some(name))
            .collect())
    }

    // ==================== Fetch ====================

    /// Answer an intercepted request: cache first, then network, then fallback.
    pub async fn handle_fetch(&self, event: FetchEvent) -> FetchDisposition {
        if !self.state().can_intercept_fetch() {
            return FetchDisposition::Passthrough;
        }

        let request = event.request;
        if !should_intercept(&request) {
            trace!(url = %request.url, method = %request.method, "Not intercepted");
            return FetchDisposition::Passthrough;
        }

        let key = CacheKey::from_request(&request);
        match self.storage.match_any(&key).await {
            Ok(Some(entry)) => {
                debug!(url = %request.url, "Serving from cache");
                return FetchDisposition::respond(entry.to_response(), ResponseSource::Cache);
            }
            Ok(None) => {}
            Err(e) => warn!(url = %request.url, error = %e, "Cache lookup failed; treating as miss"),
        }

        debug!(url = %request.url, "Fetching from network");
        let is_navigation = request.is_navigation();
        let url = request.url.clone();

        match self.fetcher.fetch(request).await {
            Ok(response) => {
                // A newer version may have taken over while the request was in flight.
                if is_cacheable(&response) && self.state().can_intercept_fetch() {
                    self.store_dynamic(key, &response).await;
                }
                FetchDisposition::respond(response, ResponseSource::Network)
            }
            Err(e) => {
                debug!(url = %url, error = %e, "Network failed");
                self.offline_fallback(is_navigation).await
            }
        }
    }

    async fn store_dynamic(&self, key: CacheKey, response: &Response) {
        let entry = CacheEntry::from_response(&key, response);
        let cache = &self.config.dynamic_cache_name;
        match self.storage.put_if_present(cache, key.clone(), entry).await {
            Ok(true) => debug!(cache = %cache, key = %key, "Caching new resource"),
            Ok(false) => debug!(cache = %cache, key = %key, "Generation purged; not caching"),
            Err(e) => warn!(cache = %cache, key = %key, error = %e, "Failed to cache response"),
        }
    }

    async fn offline_fallback(&self, is_navigation: bool) -> FetchDisposition {
        if !is_navigation {
            return FetchDisposition::respond(service_unavailable(), ResponseSource::Unavailable);
        }

        if let Ok(root_url) = self.scope.join(&self.config.root_document) {
            match self.storage.match_any(&CacheKey::get(&root_url)).await {
                Ok(Some(entry)) => {
                    debug!(url = %root_url, "Serving root document for navigation");
                    return FetchDisposition::respond(
                        entry.to_response(),
                        ResponseSource::RootDocument,
                    );
                }
                Ok(None) => {}
                Err(e) => warn!(url = %root_url, error = %e, "Root document lookup failed"),
            }
        }

        FetchDisposition::respond(
            offline_document(&self.config.offline_page),
            ResponseSource::OfflinePage,
        )
    }

    // ==================== Messages ====================

    /// Handle a message posted by a page.
    pub async fn handle_message(&self, event: MessageEvent) -> MessageOutcome {
        debug!(worker = ?self.id, data = %event.data, "Message received");

        match ClientMessage::parse(&event.data) {
            Some(ClientMessage::SkipWaiting) => {
                self.skip_waiting();
                MessageOutcome::SkipWaiting
            }
            Some(ClientMessage::GetVersion) => {
                let Some(port) = event.ports.first() else {
                    warn!("GET_VERSION without a reply port");
                    return MessageOutcome::Ignored;
                };
                let version = self.version().to_string();
                match port.post_message(json!({ "version": version })) {
                    Ok(()) => MessageOutcome::VersionSent(version),
                    Err(e) => {
                        warn!(error = %e, "Could not reply to GET_VERSION");
                        MessageOutcome::Ignored
                    }
                }
            }
            None => MessageOutcome::Ignored,
        }
    }

    // ==================== Sync / Push ====================

    /// Background sync. Acknowledged; no work is performed.
    pub async fn handle_sync(&self, tag: &str) {
        info!(tag, "Background sync triggered");
        if tag == BACKGROUND_SYNC_TAG {
            debug!("Performing background sync");
        }
    }

    /// Push message. Acknowledged; no work is performed.
    pub async fn handle_push(&self, data: Option<&[u8]>) {
        info!(bytes = data.map_or(0, <[u8]>::len), "Push notification received");
    }
}

impl fmt::Debug for OfflineCacheManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OfflineCacheManager")
            .field("id", &self.id)
            .field("scope", &self.scope.as_str())
            .field("version", &self.version())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCacheStorage;
    use crate::message::ReplyPort;
    use async_trait::async_trait;
    use http::StatusCode;
    use pwakit_net::{NetError, ResponseType};

    struct StaticFetcher;

    #[async_trait]
    impl Fetcher for StaticFetcher {
        async fn fetch(&self, request: Request) -> Result<Response, NetError> {
            Ok(Response::new(StatusCode::OK, request.url.path().to_string())
                .with_url(request.url)
                .with_type(ResponseType::Basic))
        }
    }

    fn manager(config: OfflineConfig) -> OfflineCacheManager {
        OfflineCacheManager::new(
            Url::parse("https://app.example.com/").unwrap(),
            config,
            Arc::new(MemoryCacheStorage::new()),
            Arc::new(StaticFetcher),
        )
    }

    #[tokio::test]
    async fn test_install_moves_to_installed_and_skips_waiting() {
        let worker = manager(OfflineConfig::default());
        assert_eq!(worker.state(), ServiceWorkerState::Parsed);

        worker.install().await.unwrap();
        assert_eq!(worker.state(), ServiceWorkerState::Installed);
        assert!(worker.skip_waiting_requested());
    }

    #[tokio::test]
    async fn test_install_without_auto_skip() {
        let worker = manager(OfflineConfig {
            skip_waiting_on_install: false,
            ..Default::default()
        });
        worker.install().await.unwrap();
        assert!(!worker.skip_waiting_requested());
    }

    #[tokio::test]
    async fn test_not_intercepting_before_activation() {
        let worker = manager(OfflineConfig::default());
        worker.install().await.unwrap();

        let request = Request::get(Url::parse("https://app.example.com/index.html").unwrap());
        assert!(worker.handle_fetch(FetchEvent::new(request)).await.is_passthrough());
    }

    #[tokio::test]
    async fn test_activate_requires_installed() {
        let worker = manager(OfflineConfig::default());
        assert!(matches!(
            worker.activate().await,
            Err(ServiceWorkerError::State(_))
        ));
    }

    #[tokio::test]
    async fn test_state_watch() {
        let worker = manager(OfflineConfig::default());
        let mut rx = worker.subscribe_state();
        worker.install().await.unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), ServiceWorkerState::Installed);
    }

    #[tokio::test]
    async fn test_get_version_replies_static_name() {
        let worker = manager(OfflineConfig::default());
        let (port, mut rx) = ReplyPort::channel();

        let outcome = worker
            .handle_message(MessageEvent::new(json!({"type": "GET_VERSION"})).with_port(port))
            .await;

        assert_eq!(outcome, MessageOutcome::VersionSent("pwakit-static-v1".to_string()));
        assert_eq!(rx.recv().await.unwrap(), json!({"version": "pwakit-static-v1"}));
    }

    #[tokio::test]
    async fn test_get_version_without_port_is_ignored() {
        let worker = manager(OfflineConfig::default());
        let outcome = worker
            .handle_message(MessageEvent::new(json!({"type": "GET_VERSION"})))
            .await;
        assert_eq!(outcome, MessageOutcome::Ignored);
    }

    #[tokio::test]
    async fn test_skip_waiting_message() {
        let worker = manager(OfflineConfig {
            skip_waiting_on_install: false,
            ..Default::default()
        });
        let outcome = worker
            .handle_message(MessageEvent::new(json!({"type": "SKIP_WAITING"})))
            .await;
        assert_eq!(outcome, MessageOutcome::SkipWaiting);
        assert!(worker.skip_waiting_requested());
    }

    #[tokio::test]
    async fn test_sync_and_push_are_noops() {
        let worker = manager(OfflineConfig::default());
        worker.handle_sync(BACKGROUND_SYNC_TAG).await;
        worker.handle_push(Some(&b"hello"[..])).await;
        assert_eq!(worker.state(), ServiceWorkerState::Parsed);
    }
}
