//! PwaKit Smoke Harness
//!
//! Registers the offline cache manager against a live origin, requests a set
//! of paths with the network up, requests them again with the network cut,
//! and prints a JSON summary of where every response came from.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use async_trait::async_trait;
use pwakit_common::{init_logging, LogConfig};
use pwakit_net::{Fetcher, LoaderConfig, NetError, Request, ResourceLoader, Response};
use pwakit_sw::{
    FetchDisposition, FetchEvent, MessageEvent, MessageOutcome, OfflineConfig, ReplyPort,
    ResponseSource, ServiceWorkerContainer, WorkerSlot,
};
use serde_json::{json, Value};
use tracing::{error, info, warn};
use url::Url;

/// Performance timing collector for tracking operation durations.
struct PerfTiming {
    timings: RefCell<HashMap<&'static str, Vec<Duration>>>,
}

impl PerfTiming {
    fn new() -> Self {
        Self {
            timings: RefCell::new(HashMap::new()),
        }
    }

    fn record(&self, operation: &'static str, duration: Duration) {
        self.timings
            .borrow_mut()
            .entry(operation)
            .or_default()
            .push(duration);
    }

    fn summary(&self) -> Value {
        let timings = self.timings.borrow();
        let mut summary = serde_json::Map::new();

        for (op, durations) in timings.iter() {
            if durations.is_empty() {
                continue;
            }

            let millis: Vec<f64> = durations.iter().map(|d| d.as_secs_f64() * 1000.0).collect();
            let count = millis.len();
            let total_ms: f64 = millis.iter().sum();
            let min_ms = millis.iter().copied().fold(f64::INFINITY, f64::min);
            let max_ms = millis.iter().copied().fold(f64::NEG_INFINITY, f64::max);

            summary.insert(
                op.to_string(),
                json!({
                    "count": count,
                    "total_ms": round2(total_ms),
                    "avg_ms": round2(total_ms / count as f64),
                    "min_ms": round2(min_ms),
                    "max_ms": round2(max_ms),
                }),
            );
        }

        Value::Object(summary)
    }
}

fn round2(ms: f64) -> f64 {
    (ms * 100.0).round() / 100.0
}

/// Network fetcher the harness can cut off mid-run.
struct SwitchableFetcher {
    inner: ResourceLoader,
    online: AtomicBool,
}

impl SwitchableFetcher {
    fn new(inner: ResourceLoader) -> Self {
        Self {
            inner,
            online: AtomicBool::new(true),
        }
    }

    fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
        info!(online, "Network switched");
    }
}

#[async_trait]
impl Fetcher for SwitchableFetcher {
    async fn fetch(&self, request: Request) -> Result<Response, NetError> {
        if !self.online.load(Ordering::SeqCst) {
            return Err(NetError::RequestFailed(format!(
                "network disabled: {}",
                request.url
            )));
        }
        self.inner.fetch(request).await
    }
}

struct Args {
    scope: Option<String>,
    config: Option<String>,
    paths: Vec<String>,
    navigations: Vec<String>,
    offline_pass: bool,
    timeout_ms: u64,
    perf_output: Option<String>,
    json_logs: bool,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut parsed = Self {
            scope: None,
            config: None,
            paths: Vec::new(),
            navigations: Vec::new(),
            offline_pass: true,
            timeout_ms: 10_000,
            perf_output: None,
            json_logs: false,
        };

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--scope" => parsed.scope = args.next(),
                "--config" => parsed.config = args.next(),
                "--path" => parsed.paths.extend(args.next()),
                "--navigate" => parsed.navigations.extend(args.next()),
                "--no-offline" => parsed.offline_pass = false,
                "--timeout-ms" => {
                    if let Some(val) = args.next() {
                        parsed.timeout_ms = val.parse().unwrap_or(10_000);
                    }
                }
                "--perf-output" => parsed.perf_output = args.next(),
                "--json-logs" => parsed.json_logs = true,
                other => eprintln!("Warning: ignoring unknown argument {other}"),
            }
        }

        parsed
    }
}

fn source_label(source: ResponseSource) -> &'static str {
    match source {
        ResponseSource::Cache => "cache",
        ResponseSource::Network => "network",
        ResponseSource::RootDocument => "root-document",
        ResponseSource::OfflinePage => "offline-page",
        ResponseSource::Unavailable => "unavailable",
    }
}

/// Dispatch one request through the container and describe the outcome.
async fn probe(
    container: &ServiceWorkerContainer,
    perf: &PerfTiming,
    request: Request,
    path: &str,
) -> Value {
    let mode = if request.is_navigation() {
        "navigate"
    } else {
        "subresource"
    };

    let start = Instant::now();
    let disposition = container.handle_fetch(FetchEvent::new(request)).await;
    let elapsed = start.elapsed();
    perf.record("fetch", elapsed);

    match disposition {
        FetchDisposition::Passthrough => json!({
            "path": path,
            "mode": mode,
            "passthrough": true,
        }),
        FetchDisposition::Respond(answer) => json!({
            "path": path,
            "mode": mode,
            "status": answer.response.status.as_u16(),
            "source": source_label(answer.source),
            "bytes": answer.response.body().len(),
            "elapsed_ms": round2(elapsed.as_secs_f64() * 1000.0),
        }),
    }
}

async fn probe_all(
    container: &ServiceWorkerContainer,
    perf: &PerfTiming,
    scope: &Url,
    args: &Args,
) -> anyhow::Result<Vec<Value>> {
    let mut results = Vec::with_capacity(args.paths.len() + args.navigations.len());
    for path in &args.paths {
        let url = scope.join(path).with_context(|| format!("bad path {path}"))?;
        results.push(probe(container, perf, Request::get(url), path).await);
    }
    for path in &args.navigations {
        let url = scope.join(path).with_context(|| format!("bad path {path}"))?;
        results.push(probe(container, perf, Request::navigate(url), path).await);
    }
    Ok(results)
}

async fn query_version(container: &ServiceWorkerContainer, scope: &str) -> Option<String> {
    let (port, mut replies) = ReplyPort::channel();
    let event = MessageEvent::new(json!({"type": "GET_VERSION"})).with_port(port);

    match container.post_message(scope, WorkerSlot::Active, event).await {
        Ok(MessageOutcome::VersionSent(_)) => replies
            .recv()
            .await
            .and_then(|reply| reply.get("version")?.as_str().map(str::to_string)),
        Ok(outcome) => {
            warn!(?outcome, "GET_VERSION was not answered");
            None
        }
        Err(e) => {
            warn!(error = %e, "GET_VERSION failed");
            None
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut args = Args::parse();

    let log_config = if args.json_logs {
        LogConfig::structured()
    } else {
        LogConfig::from_env()?
    };
    init_logging(log_config);

    let Some(scope) = args.scope.clone() else {
        bail!("usage: pwakit-smoke --scope <url> [--config <file>] [--path <p>]... [--navigate <p>]... [--no-offline] [--timeout-ms <ms>] [--perf-output <file>] [--json-logs]");
    };
    let scope_url = Url::parse(&scope).with_context(|| format!("invalid scope {scope}"))?;

    let config = match args.config {
        Some(ref path) => {
            OfflineConfig::load(path).with_context(|| format!("loading config {path}"))?
        }
        None => OfflineConfig::default(),
    };
    if args.paths.is_empty() && args.navigations.is_empty() {
        args.paths = config.manifest.clone();
        args.navigations.push(config.root_document.clone());
    }

    info!(
        scope = %scope_url,
        version = %config.static_cache_name,
        paths = args.paths.len(),
        navigations = args.navigations.len(),
        "Starting PwaKit Smoke Harness"
    );

    let loader = ResourceLoader::new(LoaderConfig {
        default_timeout: Duration::from_millis(args.timeout_ms),
        ..Default::default()
    })?;
    let fetcher = Arc::new(SwitchableFetcher::new(loader));
    let (container, _events) = ServiceWorkerContainer::new();
    let perf = PerfTiming::new();
    let start = Instant::now();

    let install_start = Instant::now();
    let worker_id = match container.register(&scope, config, fetcher.clone()).await {
        Ok(id) => id,
        Err(e) => {
            error!(error = %e, "Registration failed");
            let result = json!({
                "status": "fail",
                "scope": scope,
                "error": e.to_string(),
                "elapsed_ms": start.elapsed().as_millis(),
            });
            println!("{}", result);
            std::process::exit(1);
        }
    };
    perf.record("install", install_start.elapsed());
    let scope = scope_url.to_string();

    let online = probe_all(&container, &perf, &scope_url, &args).await?;

    let offline = if args.offline_pass {
        fetcher.set_online(false);
        probe_all(&container, &perf, &scope_url, &args).await?
    } else {
        Vec::new()
    };

    let version = query_version(&container, &scope).await;
    let caches = container.caches.keys().await;

    if let Some(ref perf_path) = args.perf_output {
        let perf_json = json!({
            "timings": perf.summary(),
            "total_elapsed_ms": start.elapsed().as_millis(),
        });
        if let Err(e) = std::fs::write(perf_path, perf_json.to_string()) {
            error!(?e, "Failed to write perf output");
        } else {
            info!(?perf_path, "Perf summary written");
        }
    }

    let result = json!({
        "status": "pass",
        "scope": scope,
        "worker_id": worker_id.raw(),
        "version": version,
        "caches": caches,
        "online": online,
        "offline": offline,
        "elapsed_ms": start.elapsed().as_millis(),
        "perf": perf.summary(),
    });
    println!("{}", result);
    Ok(())
}
