//! End-to-end tests for the offline cache manager running inside a container.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{Method, StatusCode};
use pwakit_net::{Fetcher, NetError, Request, Response, ResponseType};
use pwakit_sw::fetch::UNAVAILABLE_BODY;
use pwakit_sw::{
    CacheEntry, CacheKey, CacheStorage, FetchEvent, MemoryCacheStorage, MessageEvent,
    MessageOutcome, OfflineConfig, ReplyPort, ResponseSource, ServiceWorkerContainer,
    ServiceWorkerError, ServiceWorkerEvent, ServiceWorkerState, WorkerSlot,
};
use serde_json::json;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::Notify;
use url::Url;

const SCOPE: &str = "https://app.example.com/";

/// A scripted origin server that counts every request it sees.
///
/// One path at a time can be held: its next request parks until `release`.
struct MockOrigin {
    resources: Mutex<HashMap<String, (StatusCode, ResponseType, Bytes)>>,
    online: AtomicBool,
    calls: AtomicUsize,
    held: Mutex<Option<String>>,
    parked: Notify,
    released: Notify,
}

impl MockOrigin {
    fn new() -> Arc<Self> {
        let origin = Arc::new(Self {
            resources: Mutex::new(HashMap::new()),
            online: AtomicBool::new(true),
            calls: AtomicUsize::new(0),
            held: Mutex::new(None),
            parked: Notify::new(),
            released: Notify::new(),
        });
        origin.serve("/", "<html>home</html>");
        origin.serve("/index.html", "<html>home</html>");
        origin.serve("/app.js", "console.log('app')");
        origin.serve("/data.json", r#"{"entries":3}"#);
        origin
    }

    fn serve(&self, path: &str, body: &'static str) {
        self.serve_with(path, StatusCode::OK, ResponseType::Basic, body);
    }

    fn serve_with(&self, path: &str, status: StatusCode, kind: ResponseType, body: &'static str) {
        self.resources
            .lock()
            .unwrap()
            .insert(url(path).to_string(), (status, kind, Bytes::from_static(body.as_bytes())));
    }

    fn go_offline(&self) {
        self.online.store(false, Ordering::SeqCst);
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn reset_calls(&self) {
        self.calls.store(0, Ordering::SeqCst);
    }

    fn hold(&self, path: &str) {
        *self.held.lock().unwrap() = Some(url(path).to_string());
    }

    async fn wait_until_parked(&self) {
        self.parked.notified().await;
    }

    fn release(&self) {
        self.released.notify_one();
    }
}

#[async_trait]
impl Fetcher for MockOrigin {
    async fn fetch(&self, request: Request) -> Result<Response, NetError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.online.load(Ordering::SeqCst) {
            return Err(NetError::RequestFailed("network unreachable".to_string()));
        }

        let park = {
            let mut held = self.held.lock().unwrap();
            if held.as_deref() == Some(request.url.as_str()) {
                held.take();
                true
            } else {
                false
            }
        };
        if park {
            self.parked.notify_one();
            self.released.notified().await;
        }

        let found = self.resources.lock().unwrap().get(request.url.as_str()).cloned();
        let (status, kind, body) =
            found.unwrap_or((StatusCode::NOT_FOUND, ResponseType::Basic, Bytes::new()));
        Ok(Response::new(status, body)
            .with_url(request.url)
            .with_type(kind))
    }
}

/// Storage whose single-entry writes always fail.
struct ReadOnlyStorage {
    inner: MemoryCacheStorage,
}

#[async_trait]
impl CacheStorage for ReadOnlyStorage {
    async fn open(&self, name: &str) -> Result<(), ServiceWorkerError> {
        self.inner.open(name).await
    }

    async fn has(&self, name: &str) -> bool {
        self.inner.has(name).await
    }

    async fn keys(&self) -> Vec<String> {
        self.inner.keys().await
    }

    async fn delete(&self, name: &str) -> bool {
        self.inner.delete(name).await
    }

    async fn match_in(
        &self,
        name: &str,
        key: &CacheKey,
    ) -> Result<Option<CacheEntry>, ServiceWorkerError> {
        self.inner.match_in(name, key).await
    }

    async fn match_any(&self, key: &CacheKey) -> Result<Option<CacheEntry>, ServiceWorkerError> {
        self.inner.match_any(key).await
    }

    async fn put(
        &self,
        _name: &str,
        _key: CacheKey,
        _entry: CacheEntry,
    ) -> Result<(), ServiceWorkerError> {
        Err(ServiceWorkerError::CacheError("quota exceeded".to_string()))
    }

    async fn put_if_present(
        &self,
        _name: &str,
        _key: CacheKey,
        _entry: CacheEntry,
    ) -> Result<bool, ServiceWorkerError> {
        Err(ServiceWorkerError::CacheError("quota exceeded".to_string()))
    }

    async fn put_all(
        &self,
        name: &str,
        entries: Vec<(CacheKey, CacheEntry)>,
    ) -> Result<(), ServiceWorkerError> {
        self.inner.put_all(name, entries).await
    }
}

fn url(path: &str) -> Url {
    Url::parse(SCOPE).unwrap().join(path).unwrap()
}

fn config(version: u32) -> OfflineConfig {
    OfflineConfig {
        static_cache_name: format!("journal-static-v{version}"),
        dynamic_cache_name: format!("journal-dynamic-v{version}"),
        manifest: vec![
            "/".to_string(),
            "/index.html".to_string(),
            "/app.js".to_string(),
        ],
        ..Default::default()
    }
}

fn get(path: &str) -> FetchEvent {
    FetchEvent::new(Request::get(url(path)))
}

fn navigate(path: &str) -> FetchEvent {
    FetchEvent::new(Request::navigate(url(path)))
}

/// Worker logs for failing tests; set `RUST_LOG=pwakit_sw=debug` to see them.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn installed() -> (ServiceWorkerContainer, Arc<MockOrigin>) {
    init_tracing();
    let (container, _rx) = ServiceWorkerContainer::new();
    let origin = MockOrigin::new();
    container.register(SCOPE, config(1), origin.clone()).await.unwrap();
    (container, origin)
}

fn drain(rx: &mut UnboundedReceiver<ServiceWorkerEvent>) -> Vec<ServiceWorkerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

// ==================== Install ====================

#[tokio::test]
async fn test_manifest_cached_after_install() {
    let (container, _origin) = installed().await;

    for path in ["/", "/index.html", "/app.js"] {
        let entry = container
            .caches
            .match_in("journal-static-v1", &CacheKey::get(&url(path)))
            .await
            .unwrap();
        assert!(entry.is_some(), "{path} missing from static generation");
    }

    let info = container.registration_info(SCOPE).await.unwrap();
    assert_eq!(info.active_version.as_deref(), Some("journal-static-v1"));
}

#[tokio::test]
async fn test_install_is_all_or_nothing() {
    let (container, mut rx) = ServiceWorkerContainer::new();
    let origin = MockOrigin::new();
    let mut broken = config(1);
    broken.manifest.push("/missing.png".to_string());

    let result = container.register(SCOPE, broken, origin.clone()).await;
    assert!(matches!(
        result,
        Err(ServiceWorkerError::InstallFailed { ref resource, .. })
            if resource.ends_with("/missing.png")
    ));

    for path in ["/", "/index.html", "/app.js"] {
        let key = CacheKey::get(&url(path));
        assert!(container.caches.match_any(&key).await.unwrap().is_none());
    }

    let info = container.registration_info(SCOPE).await.unwrap();
    assert_eq!(info.active, None);
    assert_eq!(info.waiting, None);

    let events = drain(&mut rx);
    assert!(events
        .iter()
        .any(|e| matches!(e, ServiceWorkerEvent::InstallFailed { .. })));
    assert!(events.iter().any(|e| matches!(
        e,
        ServiceWorkerEvent::StateChange { new_state: ServiceWorkerState::Redundant, .. }
    )));
}

#[tokio::test]
async fn test_install_fails_offline() {
    let (container, _rx) = ServiceWorkerContainer::new();
    let origin = MockOrigin::new();
    origin.go_offline();

    let result = container.register(SCOPE, config(1), origin).await;
    assert!(matches!(result, Err(ServiceWorkerError::InstallFailed { .. })));
}

#[tokio::test]
async fn test_failed_update_keeps_previous_version() {
    let (container, origin) = installed().await;
    let mut broken = config(2);
    broken.manifest.push("/missing.png".to_string());

    assert!(container.register(SCOPE, broken, origin.clone()).await.is_err());

    let info = container.registration_info(SCOPE).await.unwrap();
    assert_eq!(info.active_version.as_deref(), Some("journal-static-v1"));
    assert!(container.caches.has("journal-static-v1").await);
}

// ==================== Activate ====================

#[tokio::test]
async fn test_activation_purges_stale_generations() {
    let storage = Arc::new(MemoryCacheStorage::new());
    for name in ["journal-static-v0", "journal-dynamic-v0", "journal-dynamic-v1"] {
        storage.open(name).await.unwrap();
    }

    let (container, _rx) = ServiceWorkerContainer::with_storage(storage.clone());
    container
        .register(SCOPE, config(1), MockOrigin::new())
        .await
        .unwrap();

    let mut names = storage.keys().await;
    names.sort();
    assert_eq!(names, vec!["journal-dynamic-v1", "journal-static-v1"]);
    assert_eq!(storage.entry_count("journal-static-v1").await, Some(3));
}

#[tokio::test]
async fn test_upgrade_replaces_previous_version() {
    let (container, mut rx) = ServiceWorkerContainer::new();
    let origin = MockOrigin::new();
    let v1 = container.register(SCOPE, config(1), origin.clone()).await.unwrap();
    let v2 = container.register(SCOPE, config(2), origin.clone()).await.unwrap();

    let info = container.registration_info(SCOPE).await.unwrap();
    assert_eq!(info.active, Some(v2));
    assert!(!container.caches.has("journal-static-v1").await);
    assert!(container.caches.has("journal-static-v2").await);

    let events = drain(&mut rx);
    assert!(events.contains(&ServiceWorkerEvent::StateChange {
        registration_scope: SCOPE.to_string(),
        worker_id: v1,
        new_state: ServiceWorkerState::Redundant,
    }));
}

#[tokio::test]
async fn test_fetches_served_while_update_installs() {
    let (container, origin) = installed().await;
    let container = Arc::new(container);
    origin.hold("/app.js");

    let update = tokio::spawn({
        let container = Arc::clone(&container);
        let origin = origin.clone();
        async move { container.register(SCOPE, config(2), origin).await }
    });
    origin.wait_until_parked().await;

    let response = tokio::time::timeout(
        Duration::from_secs(2),
        container.handle_fetch(get("/index.html")),
    )
    .await
    .expect("fetch waited for the update to install")
    .into_response()
    .unwrap();
    assert_eq!(response.source, ResponseSource::Cache);

    let info = container.registration_info(SCOPE).await.unwrap();
    assert!(info.installing.is_some());
    assert_eq!(info.active_version.as_deref(), Some("journal-static-v1"));

    origin.release();
    let v2 = update.await.unwrap().unwrap();
    let info = container.registration_info(SCOPE).await.unwrap();
    assert_eq!(info.active, Some(v2));
    assert!(info.installing.is_none());
}

#[tokio::test]
async fn test_response_arriving_after_upgrade_skips_purged_generation() {
    let (container, origin) = installed().await;
    let container = Arc::new(container);
    origin.hold("/data.json");

    let pending = tokio::spawn({
        let container = Arc::clone(&container);
        async move { container.handle_fetch(get("/data.json")).await }
    });
    origin.wait_until_parked().await;

    container.register(SCOPE, config(2), origin.clone()).await.unwrap();
    origin.release();

    let response = pending.await.unwrap().into_response().unwrap();
    assert_eq!(response.source, ResponseSource::Network);
    assert_eq!(response.response.body().as_ref(), br#"{"entries":3}"#);

    let mut names = container.caches.keys().await;
    names.sort();
    assert_eq!(names, vec!["journal-dynamic-v2", "journal-static-v2"]);
}

// ==================== Fetch ====================

#[tokio::test]
async fn test_cache_hit_makes_no_network_call() {
    let (container, origin) = installed().await;
    origin.reset_calls();

    let response = container
        .handle_fetch(get("/app.js"))
        .await
        .into_response()
        .unwrap();

    assert_eq!(response.source, ResponseSource::Cache);
    assert_eq!(response.response.body().as_ref(), b"console.log('app')");
    assert_eq!(origin.calls(), 0);
}

#[tokio::test]
async fn test_network_response_lands_in_dynamic_generation() {
    let (container, origin) = installed().await;
    origin.reset_calls();

    let first = container
        .handle_fetch(get("/data.json"))
        .await
        .into_response()
        .unwrap();
    assert_eq!(first.source, ResponseSource::Network);
    assert_eq!(origin.calls(), 1);

    let stored = container
        .caches
        .match_in("journal-dynamic-v1", &CacheKey::get(&url("/data.json")))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.body, first.response.body().to_vec());

    let second = container
        .handle_fetch(get("/data.json"))
        .await
        .into_response()
        .unwrap();
    assert_eq!(second.source, ResponseSource::Cache);
    assert_eq!(second.response.body(), first.response.body());
    assert_eq!(origin.calls(), 1);
}

#[tokio::test]
async fn test_uncacheable_responses_are_returned_not_stored() {
    let (container, origin) = installed().await;
    origin.serve_with("/gone", StatusCode::NOT_FOUND, ResponseType::Basic, "gone");
    origin.serve_with("/font.woff", StatusCode::OK, ResponseType::Cors, "font");
    origin.serve_with("/pixel.gif", StatusCode::OK, ResponseType::Opaque, "");
    origin.serve_with("/partial", StatusCode::PARTIAL_CONTENT, ResponseType::Basic, "par");

    for (path, status) in [
        ("/gone", StatusCode::NOT_FOUND),
        ("/font.woff", StatusCode::OK),
        ("/pixel.gif", StatusCode::OK),
        ("/partial", StatusCode::PARTIAL_CONTENT),
    ] {
        let response = container.handle_fetch(get(path)).await.into_response().unwrap();
        assert_eq!(response.source, ResponseSource::Network);
        assert_eq!(response.response.status, status);

        let key = CacheKey::get(&url(path));
        assert!(container.caches.match_any(&key).await.unwrap().is_none(), "{path} was cached");
    }
}

#[tokio::test]
async fn test_non_get_and_non_http_are_never_intercepted() {
    let (container, origin) = installed().await;
    origin.reset_calls();

    let post = Request::post(url("/api/entries"), Bytes::from_static(b"{}"));
    assert!(container.handle_fetch(FetchEvent::new(post)).await.is_passthrough());

    let delete = Request::new(Method::DELETE, url("/app.js"));
    assert!(container.handle_fetch(FetchEvent::new(delete)).await.is_passthrough());

    let client = container.add_client(SCOPE).await.unwrap();
    let extension = Url::parse("chrome-extension://abcdef/popup.js").unwrap();
    let event = FetchEvent::from_client(Request::get(extension.clone()), client);
    assert!(container.handle_fetch(event).await.is_passthrough());

    assert_eq!(origin.calls(), 0);
    assert!(container
        .caches
        .match_any(&CacheKey::get(&extension))
        .await
        .unwrap()
        .is_none());
    let post_key = CacheKey::new(&Method::POST, &url("/api/entries"));
    assert!(container.caches.match_any(&post_key).await.unwrap().is_none());
}

#[tokio::test]
async fn test_fetch_outside_scope_passes_through() {
    let (container, _origin) = installed().await;
    let request = Request::get(Url::parse("https://cdn.example.net/lib.js").unwrap());
    assert!(container.handle_fetch(FetchEvent::new(request)).await.is_passthrough());
}

#[tokio::test]
async fn test_offline_navigation_gets_root_document() {
    let (container, origin) = installed().await;
    origin.go_offline();

    let response = container
        .handle_fetch(navigate("/journal/2024-03-01"))
        .await
        .into_response()
        .unwrap();

    assert_eq!(response.source, ResponseSource::RootDocument);
    assert_eq!(response.response.status, StatusCode::OK);
    assert_eq!(response.response.body().as_ref(), b"<html>home</html>");
}

#[tokio::test]
async fn test_offline_navigation_without_root_gets_offline_page() {
    let (container, origin) = installed().await;
    origin.go_offline();
    assert!(container.caches.delete("journal-static-v1").await);

    let response = container
        .handle_fetch(navigate("/journal"))
        .await
        .into_response()
        .unwrap();

    assert_eq!(response.source, ResponseSource::OfflinePage);
    assert_eq!(response.response.status, StatusCode::OK);
    assert_eq!(
        response.response.content_type.as_ref().map(|m| m.essence_str()),
        Some("text/html")
    );
    let html = response.response.text().unwrap();
    assert!(html.contains("Retry"));
}

#[tokio::test]
async fn test_offline_subresource_gets_503() {
    let (container, origin) = installed().await;
    origin.go_offline();

    let response = container
        .handle_fetch(get("/images/photo.jpg"))
        .await
        .into_response()
        .unwrap();

    assert_eq!(response.source, ResponseSource::Unavailable);
    assert_eq!(response.response.status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.response.text().unwrap(), UNAVAILABLE_BODY);
}

#[tokio::test]
async fn test_offline_cached_subresource_still_served() {
    let (container, origin) = installed().await;
    origin.go_offline();

    let response = container.handle_fetch(get("/app.js")).await.into_response().unwrap();
    assert_eq!(response.source, ResponseSource::Cache);
}

#[tokio::test]
async fn test_cache_write_failure_is_not_fatal() {
    let storage = Arc::new(ReadOnlyStorage {
        inner: MemoryCacheStorage::new(),
    });
    let (container, _rx) = ServiceWorkerContainer::with_storage(storage);
    container
        .register(SCOPE, config(1), MockOrigin::new())
        .await
        .unwrap();

    let response = container
        .handle_fetch(get("/data.json"))
        .await
        .into_response()
        .unwrap();

    assert_eq!(response.source, ResponseSource::Network);
    assert_eq!(response.response.body().as_ref(), br#"{"entries":3}"#);
}

#[tokio::test]
async fn test_concurrent_fetches() {
    let (container, _origin) = installed().await;

    let results = futures::future::join_all(
        ["/app.js", "/data.json", "/index.html", "/missing"]
            .into_iter()
            .map(|path| container.handle_fetch(get(path))),
    )
    .await;

    assert!(results.iter().all(|r| !r.is_passthrough()));
}

// ==================== Messages and clients ====================

#[tokio::test]
async fn test_skip_waiting_activates_with_clients_open() {
    let (container, mut rx) = ServiceWorkerContainer::new();
    let origin = MockOrigin::new();
    let v1 = container.register(SCOPE, config(1), origin.clone()).await.unwrap();
    let client = container.add_client(&url("/journal").to_string()).await.unwrap();

    let v2 = container
        .register(
            SCOPE,
            OfflineConfig {
                skip_waiting_on_install: false,
                ..config(2)
            },
            origin.clone(),
        )
        .await
        .unwrap();

    let info = container.registration_info(SCOPE).await.unwrap();
    assert_eq!(info.active, Some(v1));
    assert_eq!(info.waiting, Some(v2));
    drain(&mut rx);

    let outcome = container
        .post_message(
            SCOPE,
            WorkerSlot::Waiting,
            MessageEvent::new(json!({"type": "SKIP_WAITING"})),
        )
        .await
        .unwrap();
    assert_eq!(outcome, MessageOutcome::SkipWaiting);

    let info = container.registration_info(SCOPE).await.unwrap();
    assert_eq!(info.active, Some(v2));
    assert_eq!(info.waiting, None);
    assert_eq!(info.clients, 1);

    let events = drain(&mut rx);
    assert!(events.contains(&ServiceWorkerEvent::ControllerChange {
        client_id: client,
        worker_id: v2,
    }));
}

#[tokio::test]
async fn test_closing_last_client_activates_waiting_worker() {
    let (container, _rx) = ServiceWorkerContainer::new();
    let origin = MockOrigin::new();
    container.register(SCOPE, config(1), origin.clone()).await.unwrap();
    let first = container.add_client(SCOPE).await.unwrap();
    let second = container.add_client(&url("/settings").to_string()).await.unwrap();

    let v2 = container
        .register(
            SCOPE,
            OfflineConfig {
                skip_waiting_on_install: false,
                ..config(2)
            },
            origin,
        )
        .await
        .unwrap();

    container.close_client(first).await.unwrap();
    let info = container.registration_info(SCOPE).await.unwrap();
    assert_eq!(info.waiting, Some(v2));

    container.close_client(second).await.unwrap();
    let info = container.registration_info(SCOPE).await.unwrap();
    assert_eq!(info.active, Some(v2));
    assert_eq!(info.waiting, None);
}

#[tokio::test]
async fn test_get_version_through_container() {
    let (container, _origin) = installed().await;
    let (port, mut replies) = ReplyPort::channel();

    let outcome = container
        .post_message(
            SCOPE,
            WorkerSlot::Active,
            MessageEvent::new(json!({"type": "GET_VERSION"})).with_port(port),
        )
        .await
        .unwrap();

    assert_eq!(outcome, MessageOutcome::VersionSent("journal-static-v1".to_string()));
    assert_eq!(replies.recv().await.unwrap(), json!({"version": "journal-static-v1"}));
}

#[tokio::test]
async fn test_unknown_message_is_ignored() {
    let (container, _origin) = installed().await;
    let outcome = container
        .post_message(SCOPE, WorkerSlot::Active, MessageEvent::new(json!({"type": "NOPE"})))
        .await
        .unwrap();
    assert_eq!(outcome, MessageOutcome::Ignored);
}

#[tokio::test]
async fn test_sync_and_push_are_acknowledged() {
    let (container, _origin) = installed().await;
    container.dispatch_sync(SCOPE, "background-sync").await.unwrap();
    container.dispatch_push(SCOPE, Some(&b"ping"[..])).await.unwrap();
    container.dispatch_push(SCOPE, None).await.unwrap();
}
