//! Tenant registry
//!
//! Maps tenant (project) ids to the backend emulator serving them. The
//! registry is assembled with [`TenantRegistryBuilder`] during setup and then
//! frozen into a [`TenantRegistry`] snapshot that is shared read-only by every
//! connection task.

use crate::error::RegistryError;
use crate::readiness::HealthTarget;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Network address of a tenant's backend emulator
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Backend {
    host: String,
    port: u16,
}

impl Backend {
    /// Create a backend address
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Backend listening on `localhost`
    pub fn localhost(port: u16) -> Self {
        Self::new("localhost", port)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port` form used for connecting
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Emulator config endpoint that answers 200 once the tenant is served
    pub fn config_url(&self, tenant: &str) -> String {
        format!(
            "http://{}/emulator/v1/projects/{}/config",
            self.authority(),
            tenant
        )
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Mutable registry used while the proxy is being set up
#[derive(Debug, Default)]
pub struct TenantRegistryBuilder {
    tenants: HashMap<String, Backend>,
}

impl TenantRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite a tenant mapping, returning the replaced backend
    pub fn put(&mut self, tenant: impl Into<String>, backend: Backend) -> Option<Backend> {
        let tenant = tenant.into();
        tracing::debug!(tenant = %tenant, backend = %backend, "registering tenant");
        self.tenants.insert(tenant, backend)
    }

    /// Chaining form of [`put`](Self::put)
    pub fn with_tenant(mut self, tenant: impl Into<String>, backend: Backend) -> Self {
        self.put(tenant, backend);
        self
    }

    /// Freeze the mappings for serving
    pub fn build(self) -> TenantRegistry {
        TenantRegistry {
            tenants: Arc::new(self.tenants),
        }
    }
}

/// Read-only tenant snapshot shared by all request handlers
#[derive(Debug, Clone, Default)]
pub struct TenantRegistry {
    tenants: Arc<HashMap<String, Backend>>,
}

impl TenantRegistry {
    pub fn builder() -> TenantRegistryBuilder {
        TenantRegistryBuilder::new()
    }

    /// Look up the backend for a tenant
    pub fn resolve(&self, tenant: &str) -> Result<&Backend, RegistryError> {
        self.tenants
            .get(tenant)
            .ok_or_else(|| RegistryError::NotFound(tenant.to_string()))
    }

    pub fn len(&self) -> usize {
        self.tenants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tenants.is_empty()
    }

    /// Registered tenant ids, sorted
    pub fn tenant_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.tenants.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    /// One health target per tenant, ordered by tenant id
    pub fn health_targets(&self) -> Vec<HealthTarget> {
        self.tenant_ids()
            .into_iter()
            .filter_map(|tenant| {
                self.tenants
                    .get(tenant)
                    .map(|backend| HealthTarget::new(tenant, backend.config_url(tenant)))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_registered_tenant() {
        let registry = TenantRegistry::builder()
            .with_tenant("demo-admin", Backend::localhost(9099))
            .build();

        let backend = registry.resolve("demo-admin").unwrap();
        assert_eq!(backend.authority(), "localhost:9099");
    }

    #[test]
    fn test_resolve_unknown_tenant_is_not_found() {
        let registry = TenantRegistry::builder()
            .with_tenant("demo-admin", Backend::localhost(9099))
            .build();

        assert_eq!(
            registry.resolve("demo-user"),
            Err(RegistryError::NotFound("demo-user".to_string()))
        );
        assert!(registry.resolve("").is_err());
    }

    #[test]
    fn test_put_overwrites_existing_mapping() {
        let mut builder = TenantRegistryBuilder::new();
        assert!(builder.put("demo-admin", Backend::localhost(9099)).is_none());
        let previous = builder.put("demo-admin", Backend::localhost(9098));
        assert_eq!(previous, Some(Backend::localhost(9099)));

        let registry = builder.build();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.resolve("demo-admin").unwrap().port(), 9098);
    }

    #[test]
    fn test_clones_share_snapshot() {
        let registry = TenantRegistry::builder()
            .with_tenant("a", Backend::localhost(1))
            .build();
        let clone = registry.clone();
        assert!(Arc::ptr_eq(&registry.tenants, &clone.tenants));
    }

    #[test]
    fn test_health_targets_point_at_emulator_config() {
        let registry = TenantRegistry::builder()
            .with_tenant("demo-user", Backend::localhost(9098))
            .with_tenant("demo-admin", Backend::new("127.0.0.1", 9099))
            .build();

        let targets = registry.health_targets();
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].label, "demo-admin");
        assert_eq!(
            targets[0].url,
            "http://127.0.0.1:9099/emulator/v1/projects/demo-admin/config"
        );
        assert_eq!(targets[1].label, "demo-user");
        assert_eq!(
            targets[1].url,
            "http://localhost:9098/emulator/v1/projects/demo-user/config"
        );
    }

    #[test]
    fn test_empty_registry() {
        let registry = TenantRegistryBuilder::new().build();
        assert!(registry.is_empty());
        assert!(registry.health_targets().is_empty());
    }
}
