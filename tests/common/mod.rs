//! Shared helpers for integration tests: mock emulator backends and a proxy
//! launcher.
//!
//! Not every test binary uses every helper.

#![allow(dead_code)]

use axum::{
    extract::{Request, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json, Router as AxumRouter,
};
use emulator_proxy::{ProxyConfig, ProxyServer, Router, UnroutablePolicy};
use serde_json::json;
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// Reserve a port that is free right now
pub fn unused_port() -> u16 {
    let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// A request as seen by a mock backend
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub connection: Option<String>,
    pub body: Vec<u8>,
}

#[derive(Debug)]
struct BackendState {
    label: String,
    started: Instant,
    ready_after: Duration,
    fail_first: usize,
    health_hits: AtomicUsize,
    api_hits: AtomicUsize,
    last_request: Mutex<Option<RecordedRequest>>,
}

impl BackendState {
    fn is_ready(&self, hit: usize) -> bool {
        hit > self.fail_first && self.started.elapsed() >= self.ready_after
    }
}

/// Mock identity emulator
///
/// Answers `/emulator/v1/projects/{id}/config` with 503 until it is ready
/// and echoes every other request back as JSON.
#[derive(Debug, Clone)]
pub struct MockBackend {
    label: String,
    ready_after: Duration,
    fail_first: usize,
}

impl MockBackend {
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            ready_after: Duration::ZERO,
            fail_first: 0,
        }
    }

    /// Health checks fail until this much time has passed since start
    pub fn ready_after(mut self, delay: Duration) -> Self {
        self.ready_after = delay;
        self
    }

    /// Health checks never pass
    pub fn never_ready(self) -> Self {
        self.ready_after(Duration::from_secs(3600))
    }

    /// The first `n` health checks fail
    pub fn fail_first(mut self, n: usize) -> Self {
        self.fail_first = n;
        self
    }

    pub async fn start(self) -> MockBackendHandle {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        self.serve(listener)
    }

    pub async fn start_on(self, port: u16) -> MockBackendHandle {
        let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        self.serve(listener)
    }

    fn serve(self, listener: TcpListener) -> MockBackendHandle {
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(BackendState {
            label: self.label,
            started: Instant::now(),
            ready_after: self.ready_after,
            fail_first: self.fail_first,
            health_hits: AtomicUsize::new(0),
            api_hits: AtomicUsize::new(0),
            last_request: Mutex::new(None),
        });

        let app = AxumRouter::new()
            .fallback(handle_request)
            .with_state(state.clone());

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        MockBackendHandle {
            addr,
            state,
            handle,
        }
    }
}

async fn handle_request(State(state): State<Arc<BackendState>>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let path = parts.uri.path().to_string();

    if path.starts_with("/emulator/v1/projects/") && path.ends_with("/config") {
        let hit = state.health_hits.fetch_add(1, Ordering::SeqCst) + 1;
        if state.is_ready(hit) {
            return Json(json!({ "signIn": { "allowDuplicateEmails": false } })).into_response();
        }
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    let body = axum::body::to_bytes(body, usize::MAX)
        .await
        .unwrap_or_default();
    let recorded = RecordedRequest {
        method: parts.method.to_string(),
        path,
        query: parts.uri.query().map(str::to_string),
        connection: parts
            .headers
            .get("connection")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        body: body.to_vec(),
    };
    state.api_hits.fetch_add(1, Ordering::SeqCst);
    *state.last_request.lock().unwrap() = Some(recorded.clone());

    Json(json!({
        "backend": state.label,
        "method": recorded.method,
        "path": recorded.path,
        "query": recorded.query,
        "body": String::from_utf8_lossy(&recorded.body),
        "idToken": format!("{}-token", state.label),
    }))
    .into_response()
}

/// Handle to a running mock backend
pub struct MockBackendHandle {
    pub addr: SocketAddr,
    state: Arc<BackendState>,
    handle: JoinHandle<()>,
}

impl MockBackendHandle {
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn config_url(&self) -> String {
        format!(
            "http://{}/emulator/v1/projects/{}/config",
            self.addr, self.state.label
        )
    }

    pub fn health_hits(&self) -> usize {
        self.state.health_hits.load(Ordering::SeqCst)
    }

    pub fn api_hits(&self) -> usize {
        self.state.api_hits.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<RecordedRequest> {
        self.state.last_request.lock().unwrap().clone()
    }

    /// Stop accepting connections
    pub fn stop(&self) {
        self.handle.abort();
    }
}

impl Drop for MockBackendHandle {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Proxy configuration suited to tests: loopback only, fast polling
pub fn test_config(listen_port: u16, tenants: &[(&str, u16)], policy: UnroutablePolicy) -> ProxyConfig {
    let mut config = ProxyConfig {
        bind_host: "127.0.0.1".to_string(),
        listen_port,
        backend_host: "127.0.0.1".to_string(),
        readiness_timeout_ms: 5_000,
        poll_interval_ms: 20,
        drain_timeout_ms: 500,
        unroutable: policy,
        ..ProxyConfig::default()
    };
    for (id, port) in tenants {
        config = config.with_tenant(*id, *port);
    }
    config
}

pub fn build_server(config: &ProxyConfig) -> ProxyServer {
    let router = Arc::new(Router::new(config.registry()));
    ProxyServer::new(router, config).unwrap()
}

/// Start a proxy on an ephemeral port in front of `tenants`
pub async fn start_proxy(tenants: &[(&str, u16)], policy: UnroutablePolicy) -> (ProxyServer, SocketAddr) {
    let config = test_config(0, tenants, policy);
    let mut server = build_server(&config);
    let addr = server.start().await.expect("proxy should start");
    (server, addr)
}

/// HTTP client that never reuses connections; the proxy closes every
/// connection after one exchange.
pub fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .no_proxy()
        .pool_max_idle_per_host(0)
        .build()
        .unwrap()
}

/// Write `request` on a fresh connection and read until the proxy closes it
pub async fn raw_exchange(addr: SocketAddr, request: &[u8]) -> Vec<u8> {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request).await.unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    response
}
