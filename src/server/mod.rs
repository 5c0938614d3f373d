//! HTTP front for the emulator proxy

mod connection;
mod request;

pub use request::{read_request_head, RequestHead, MAX_HEAD_BYTES};

use crate::config::{ProxyConfig, UnroutablePolicy};
use crate::error::ReadinessError;
use crate::readiness::ReadinessProbe;
use crate::router::{Router, HEALTH_CHECK_PATH};
use anyhow::Context;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::Instrument;

/// Environment variable the identity SDK reads to find its emulator
pub const EMULATOR_HOST_ENV: &str = "FIREBASE_AUTH_EMULATOR_HOST";

static EMULATOR_HOST: OnceLock<String> = OnceLock::new();

/// Make the proxy the emulator host for the identity SDK in this process.
///
/// Startup side effect: the first call sets [`EMULATOR_HOST_ENV`] and every
/// call returns the value published by that first call. Writing the
/// environment races with any thread reading it, so call this before other
/// threads start; the binary does so before building its runtime.
/// [`ProxyServer::start`] calls it again, which only has an effect when
/// nothing was published yet.
pub fn publish_emulator_host(host: &str) -> &'static str {
    EMULATOR_HOST.get_or_init(|| {
        std::env::set_var(EMULATOR_HOST_ENV, host);
        tracing::info!(host = %host, env = EMULATOR_HOST_ENV, "published emulator host");
        host.to_string()
    })
}

/// Decrements the active connection count when a connection task ends,
/// including by panic.
struct ConnectionGuard(Arc<AtomicUsize>);

impl ConnectionGuard {
    fn new(active: Arc<AtomicUsize>) -> Self {
        active.fetch_add(1, Ordering::Relaxed);
        Self(active)
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Proxy server
pub struct ProxyServer {
    router: Arc<Router>,
    listen_address: String,
    listen_port: u16,
    unroutable: UnroutablePolicy,
    readiness_timeout: Duration,
    drain_timeout: Duration,
    probe: ReadinessProbe,
    local_addr: Option<SocketAddr>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    accept_task: Option<JoinHandle<()>>,
    /// Active client connection count
    active_connections: Arc<AtomicUsize>,
}

impl ProxyServer {
    /// Create a new proxy server
    pub fn new(router: Arc<Router>, config: &ProxyConfig) -> crate::Result<Self> {
        let probe = ReadinessProbe::new(config.poll_interval())?;
        Ok(Self {
            router,
            listen_address: config.listen_address(),
            listen_port: config.listen_port,
            unroutable: config.unroutable,
            readiness_timeout: config.readiness_timeout(),
            drain_timeout: config.drain_timeout(),
            probe,
            local_addr: None,
            shutdown_tx: None,
            accept_task: None,
            active_connections: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Bound address, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Get active connection count
    pub fn get_active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    fn port(&self) -> u16 {
        self.local_addr
            .map(|addr| addr.port())
            .unwrap_or(self.listen_port)
    }

    /// `host:port` clients should use as the identity emulator
    pub fn emulator_host(&self) -> String {
        format!("localhost:{}", self.port())
    }

    /// The proxy's own health check URL
    pub fn health_check_url(&self) -> String {
        format!("http://localhost:{}{}", self.port(), HEALTH_CHECK_PATH)
    }

    /// Poll the proxy's own health check in the background
    ///
    /// Call after [`start`](Self::start), or after [`publish_emulator_host`]:
    /// the poller resolves names on background threads, which must not
    /// overlap the environment write.
    pub fn ready(&self, timeout: Duration) -> oneshot::Receiver<Result<(), ReadinessError>> {
        self.probe.self_ready(self.health_check_url(), timeout)
    }

    /// Wait for every backend, then bind and start accepting
    ///
    /// Returns the bound address. If a backend misses the readiness
    /// deadline the error is returned and nothing is bound.
    pub async fn start(&mut self) -> crate::Result<SocketAddr> {
        if self.local_addr.is_some() {
            anyhow::bail!("proxy server already started");
        }

        let targets = self.router.registry().health_targets();
        self.probe
            .wait_all_ready(targets, self.readiness_timeout)
            .await?;

        // An ephemeral port is only known once bound
        if self.listen_port != 0 {
            publish_emulator_host(&self.emulator_host());
        }
        let listener = TcpListener::bind(&self.listen_address)
            .await
            .with_context(|| format!("failed to bind {}", self.listen_address))?;
        let addr = listener.local_addr()?;
        self.local_addr = Some(addr);
        if self.listen_port == 0 {
            publish_emulator_host(&self.emulator_host());
        }

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        self.shutdown_tx = Some(shutdown_tx);

        self.accept_task = Some(tokio::spawn(accept_loop(
            listener,
            self.router.clone(),
            self.unroutable,
            self.active_connections.clone(),
            shutdown_rx,
        )));

        tracing::info!(
            addr = %addr,
            tenants = self.router.registry().len(),
            "proxy server listening"
        );
        Ok(addr)
    }

    /// Start and serve until the accept loop ends
    pub async fn listen_and_serve(mut self) -> crate::Result<()> {
        self.start().await?;
        if let Some(accept_task) = self.accept_task.take() {
            accept_task.await?;
        }
        Ok(())
    }

    /// Stop accepting, then wait up to the drain timeout for in-flight
    /// exchanges
    pub async fn shutdown(&mut self) -> crate::Result<()> {
        tracing::info!("Shutting down proxy server");

        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        if let Some(accept_task) = self.accept_task.take() {
            if let Err(e) = accept_task.await {
                tracing::warn!(error = %e, "accept loop ended abnormally");
            }
        }

        let poll_interval = Duration::from_millis(50);
        let deadline = Instant::now() + self.drain_timeout;

        while self.active_connections.load(Ordering::Relaxed) > 0 {
            if Instant::now() > deadline {
                tracing::warn!(
                    remaining_connections = self.active_connections.load(Ordering::Relaxed),
                    "drain timeout exceeded, abandoning connections"
                );
                break;
            }
            sleep(poll_interval).await;
        }

        self.local_addr = None;
        tracing::info!("Proxy shutdown complete");
        Ok(())
    }
}

async fn accept_loop(
    listener: TcpListener,
    router: Arc<Router>,
    unroutable: UnroutablePolicy,
    active_connections: Arc<AtomicUsize>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let mut next_id: u64 = 0;
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    next_id += 1;
                    let guard = ConnectionGuard::new(active_connections.clone());
                    let router = router.clone();
                    let span = tracing::info_span!("exchange", id = next_id, peer = %peer);

                    tokio::spawn(
                        async move {
                            let _guard = guard;
                            connection::handle_connection(&router, unroutable, stream).await;
                        }
                        .instrument(span),
                    );
                }
                Err(e) => {
                    tracing::error!(error = %e, "failed to accept connection");
                }
            },
            _ = &mut shutdown_rx => {
                tracing::info!("proxy server stopped listening");
                break;
            }
        }
    }
}
