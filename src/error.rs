//! Error types for the emulator proxy

use std::io;
use thiserror::Error;

/// Tenant lookup failures
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("tenant not registered: {0}")]
    NotFound(String),
}

/// Reasons a request cannot be routed to any backend
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RoutingError {
    /// Neither the projects nor the accounts rule yielded a tenant id
    #[error("no tenant id in request path {path}")]
    NoTenant { path: String },

    /// A tenant id was extracted but has no registry entry
    #[error("unknown tenant {tenant}")]
    UnknownTenant { tenant: String },
}

impl From<RegistryError> for RoutingError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound(tenant) => RoutingError::UnknownTenant { tenant },
        }
    }
}

/// Readiness polling failures
#[derive(Debug, Error)]
pub enum ReadinessError {
    /// The target did not answer 200 before the deadline
    #[error("{label} not ready at {url} before deadline")]
    Timeout { label: String, url: String },

    /// A sibling wait failed and this one was cancelled
    #[error("readiness wait for {label} cancelled")]
    Cancelled { label: String },

    /// A polling task died without reporting a result
    #[error("readiness task aborted: {0}")]
    Aborted(String),

    /// The HTTP client could not be constructed
    #[error("failed to build readiness client: {0}")]
    Client(#[source] reqwest::Error),
}

impl ReadinessError {
    /// Label of the target this error is attributable to, if any
    pub fn label(&self) -> Option<&str> {
        match self {
            ReadinessError::Timeout { label, .. } | ReadinessError::Cancelled { label } => {
                Some(label)
            }
            _ => None,
        }
    }
}

/// Per-exchange proxying failures
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("unroutable request: {0}")]
    UnroutableRequest(#[from] RoutingError),

    #[error("backend {addr} unreachable: {source}")]
    BackendUnreachable {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("forwarding failure: {0}")]
    ForwardingFailure(#[source] io::Error),

    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("request head exceeds {limit} bytes")]
    HeadTooLarge { limit: usize },
}

/// Configuration loading and validation failures
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("at least one tenant must be configured")]
    NoTenants,

    #[error("tenant id must not be empty")]
    EmptyTenantId,

    #[error("tenant {0} configured more than once")]
    DuplicateTenant(String),

    #[error("failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),
}
