//! Readiness polling for backend emulators and for the proxy itself
//!
//! Emulators are started out-of-band and bind their sockets whenever they
//! get around to it, so readiness is established by polling an HTTP health
//! endpoint until it answers 200 or a deadline passes.

use crate::error::ReadinessError;
use reqwest::StatusCode;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout_at, Instant};
use tokio_util::sync::CancellationToken;

/// Default delay between two health check attempts
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// URL to poll plus a label used in errors and logs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthTarget {
    pub label: String,
    pub url: String,
}

impl HealthTarget {
    pub fn new(label: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            url: url.into(),
        }
    }
}

/// Outcome of a single GET against a health target
enum Attempt {
    Ready,
    Status(StatusCode),
    Unreachable(reqwest::Error),
}

/// Health check poller
///
/// Cheap to clone; clones share the underlying connection pool.
#[derive(Debug, Clone)]
pub struct ReadinessProbe {
    client: reqwest::Client,
    poll_interval: Duration,
}

impl ReadinessProbe {
    /// Create a probe that waits `poll_interval` between attempts
    pub fn new(poll_interval: Duration) -> Result<Self, ReadinessError> {
        let client = reqwest::Client::builder()
            .no_proxy()
            .build()
            .map_err(ReadinessError::Client)?;
        Ok(Self {
            client,
            poll_interval,
        })
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Poll `target` until it answers 200 or `deadline` passes
    pub async fn wait_until_ready(
        &self,
        target: &HealthTarget,
        deadline: Instant,
    ) -> Result<(), ReadinessError> {
        self.poll(target, deadline, &CancellationToken::new()).await
    }

    /// Poll all targets concurrently under one shared deadline
    ///
    /// The first failure cancels every other wait; the cancelled tasks are
    /// awaited before this returns, so no retries outlive the call.
    pub async fn wait_all_ready(
        &self,
        targets: Vec<HealthTarget>,
        timeout: Duration,
    ) -> Result<(), ReadinessError> {
        let deadline = Instant::now() + timeout;
        let cancel = CancellationToken::new();
        let mut waits = JoinSet::new();

        tracing::info!(
            targets = targets.len(),
            timeout_ms = timeout.as_millis() as u64,
            "waiting for backends to become ready"
        );

        for target in targets {
            let probe = self.clone();
            let cancel = cancel.clone();
            waits.spawn(async move { probe.poll(&target, deadline, &cancel).await });
        }

        let mut failure = None;
        while let Some(joined) = waits.join_next().await {
            let outcome = joined.map_err(|e| ReadinessError::Aborted(e.to_string()));
            if let Err(e) = outcome.and_then(|result| result) {
                failure = Some(e);
                break;
            }
        }

        match failure {
            Some(err) => {
                cancel.cancel();
                waits.shutdown().await;
                tracing::error!(error = %err, "backends did not become ready");
                Err(err)
            }
            None => {
                tracing::info!("all backends ready");
                Ok(())
            }
        }
    }

    /// Start polling `url` in the background
    ///
    /// The receiver yields exactly one result: `Ok` once the URL answered
    /// 200, or the error that ended the wait.
    pub fn self_ready(
        &self,
        url: impl Into<String>,
        timeout: Duration,
    ) -> oneshot::Receiver<Result<(), ReadinessError>> {
        let (tx, rx) = oneshot::channel();
        let target = HealthTarget::new("proxy", url);
        let probe = self.clone();

        tokio::spawn(async move {
            let result = probe
                .wait_until_ready(&target, Instant::now() + timeout)
                .await;
            let _ = tx.send(result);
        });

        rx
    }

    async fn poll(
        &self,
        target: &HealthTarget,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<(), ReadinessError> {
        let retry_loop = async {
            let mut attempt: u32 = 0;
            loop {
                if cancel.is_cancelled() {
                    return Err(ReadinessError::Cancelled {
                        label: target.label.clone(),
                    });
                }
                attempt += 1;

                let outcome = tokio::select! {
                    _ = cancel.cancelled() => {
                        return Err(ReadinessError::Cancelled {
                            label: target.label.clone(),
                        });
                    }
                    outcome = self.attempt(&target.url) => outcome,
                };

                match outcome {
                    Attempt::Ready => {
                        tracing::info!(
                            label = %target.label,
                            url = %target.url,
                            attempts = attempt,
                            "health check passed"
                        );
                        return Ok(());
                    }
                    Attempt::Status(status) => {
                        tracing::debug!(
                            label = %target.label,
                            attempt = attempt,
                            status = status.as_u16(),
                            "health check not ready, retrying"
                        );
                    }
                    Attempt::Unreachable(e) => {
                        tracing::debug!(
                            label = %target.label,
                            attempt = attempt,
                            error = %e,
                            "health check unreachable, retrying"
                        );
                    }
                }

                tokio::select! {
                    _ = cancel.cancelled() => {
                        return Err(ReadinessError::Cancelled {
                            label: target.label.clone(),
                        });
                    }
                    _ = sleep(self.poll_interval) => {}
                }
            }
        };

        match timeout_at(deadline, retry_loop).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    label = %target.label,
                    url = %target.url,
                    "health check deadline exceeded"
                );
                Err(ReadinessError::Timeout {
                    label: target.label.clone(),
                    url: target.url.clone(),
                })
            }
        }
    }

    /// One GET; the body is always drained so the connection goes back to
    /// the pool.
    async fn attempt(&self, url: &str) -> Attempt {
        let response = match self.client.get(url).send().await {
            Ok(response) => response,
            Err(e) => return Attempt::Unreachable(e),
        };
        let status = response.status();
        if let Err(e) = response.bytes().await {
            return Attempt::Unreachable(e);
        }
        if status == StatusCode::OK {
            Attempt::Ready
        } else {
            Attempt::Status(status)
        }
    }
}
