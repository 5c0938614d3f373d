//! Configuration management for the emulator proxy

use crate::error::ConfigError;
use crate::registry::{Backend, TenantRegistry};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Prefix of environment variables overriding file settings,
/// e.g. `EMULATOR_PROXY__LISTEN_PORT=7778`
pub const ENV_PREFIX: &str = "EMULATOR_PROXY";

/// What to do with a request that names no registered tenant
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnroutablePolicy {
    /// Abort the connection task with a dump of the request
    #[default]
    Panic,
    /// Answer 502 with a JSON error body
    Reject,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Proxy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Interface the proxy binds to
    pub bind_host: String,
    /// Proxy listen port
    pub listen_port: u16,
    /// Host the backend emulators listen on
    pub backend_host: String,
    /// Overall deadline for backend readiness at startup
    pub readiness_timeout_ms: u64,
    /// Delay between health check attempts
    pub poll_interval_ms: u64,
    /// How long shutdown waits for in-flight exchanges
    pub drain_timeout_ms: u64,
    pub unroutable: UnroutablePolicy,
    pub log_format: LogFormat,
    /// Tenant configurations
    pub tenants: Vec<TenantConfig>,
}

/// Tenant configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantConfig {
    /// Project id used as tenant id
    pub id: String,
    /// Port of the tenant's emulator
    pub port: u16,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            listen_port: 7777,
            backend_host: "localhost".to_string(),
            readiness_timeout_ms: 10_000,
            poll_interval_ms: 500,
            drain_timeout_ms: 5_000,
            unroutable: UnroutablePolicy::default(),
            log_format: LogFormat::default(),
            tenants: Vec::new(),
        }
    }
}

impl ProxyConfig {
    /// Load configuration from an optional file plus environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path));
        }
        let config = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Append a tenant entry
    pub fn with_tenant(mut self, id: impl Into<String>, port: u16) -> Self {
        self.tenants.push(TenantConfig {
            id: id.into(),
            port,
        });
        self
    }

    /// Check the invariants the proxy relies on
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tenants.is_empty() {
            return Err(ConfigError::NoTenants);
        }

        let mut seen = HashSet::new();
        for tenant in &self.tenants {
            if tenant.id.is_empty() {
                return Err(ConfigError::EmptyTenantId);
            }
            if !seen.insert(tenant.id.as_str()) {
                return Err(ConfigError::DuplicateTenant(tenant.id.clone()));
            }
        }

        Ok(())
    }

    /// Build the tenant registry from the configured entries
    pub fn registry(&self) -> TenantRegistry {
        let mut builder = TenantRegistry::builder();
        for tenant in &self.tenants {
            builder.put(
                tenant.id.clone(),
                Backend::new(self.backend_host.clone(), tenant.port),
            );
        }
        builder.build()
    }

    /// Address the listener binds to
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.bind_host, self.listen_port)
    }

    /// `host:port` the identity SDK should use; `None` until an ephemeral
    /// port is bound
    pub fn emulator_host(&self) -> Option<String> {
        (self.listen_port != 0).then(|| format!("localhost:{}", self.listen_port))
    }

    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_millis(self.readiness_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}
