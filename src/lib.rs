//! Emulator Proxy - multi-tenant front for per-project identity emulators
//!
//! This library provides the core functionality for the proxy:
//! - Tenant registry (tenant id to backend address)
//! - Readiness polling of backends and of the proxy itself
//! - Request routing by path or `key` query parameter
//! - Raw response passthrough over the taken-over client connection

pub mod config;
pub mod error;
pub mod identity;
pub mod readiness;
pub mod registry;
pub mod router;
pub mod server;

// Re-export commonly used types
pub use config::{LogFormat, ProxyConfig, TenantConfig, UnroutablePolicy};
pub use error::{ConfigError, ProxyError, ReadinessError, RegistryError, RoutingError};
pub use identity::IdentityClient;
pub use readiness::{HealthTarget, ReadinessProbe};
pub use registry::{Backend, TenantRegistry, TenantRegistryBuilder};
pub use router::{Route, RouteTarget, Router};
pub use server::{publish_emulator_host, ProxyServer, EMULATOR_HOST_ENV};

/// Result type used throughout the proxy
pub type Result<T> = anyhow::Result<T>;
