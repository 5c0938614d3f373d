//! Request routing for the emulator proxy
//!
//! Identity toolkit requests carry the tenant either as a path segment
//! (`/v1/projects/{tenant}/...`) or, for the `accounts:*` operations, as the
//! API key in the `key` query parameter. The emulators accept any API key and
//! the proxy's clients use the project id as the key.

use crate::error::RoutingError;
use crate::registry::{Backend, TenantRegistry};
use percent_encoding::percent_decode_str;
use regex::Regex;
use std::sync::LazyLock;

/// Path answered by the proxy itself for readiness probes
pub const HEALTH_CHECK_PATH: &str = "/health_check";

static PROJECTS_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^/identitytoolkit\.googleapis\.com/v1/projects/([^/:]+)")
        .expect("projects path pattern is valid")
});

static ACCOUNTS_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^/identitytoolkit\.googleapis\.com/v1/accounts")
        .expect("accounts path pattern is valid")
});

/// Where a request should go
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Answered locally with an empty 200
    HealthCheck,
    /// Forwarded to a tenant's backend
    Backend(RouteTarget),
}

/// Resolved forwarding destination for one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteTarget {
    pub tenant: String,
    pub backend: Backend,
    /// Original path with the query string re-encoded
    pub path_and_query: String,
}

/// Router - maps requests onto registered tenants
#[derive(Debug, Clone)]
pub struct Router {
    registry: TenantRegistry,
}

impl Router {
    /// Create a new router over a frozen registry
    pub fn new(registry: TenantRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &TenantRegistry {
        &self.registry
    }

    /// Route a request by its origin-form path and raw query string
    ///
    /// Matching runs on the percent-decoded path; the forwarded target keeps
    /// the path bytes as received.
    pub fn route(&self, path: &str, query: Option<&str>) -> Result<Route, RoutingError> {
        let decoded = percent_decode_str(path).decode_utf8_lossy();
        if decoded == HEALTH_CHECK_PATH {
            return Ok(Route::HealthCheck);
        }

        let tenant = extract_tenant(&decoded, query).ok_or_else(|| RoutingError::NoTenant {
            path: decoded.to_string(),
        })?;
        tracing::debug!(tenant = %tenant, path = %decoded, "request identified");

        let backend = self.registry.resolve(&tenant)?.clone();
        tracing::debug!(tenant = %tenant, backend = %backend, "request resolved");

        let path_and_query = match query.map(reencode_query) {
            Some(encoded) if !encoded.is_empty() => format!("{}?{}", path, encoded),
            _ => path.to_string(),
        };

        Ok(Route::Backend(RouteTarget {
            tenant,
            backend,
            path_and_query,
        }))
    }
}

/// Pull the tenant id out of a request, if either rule matches
pub fn extract_tenant(path: &str, query: Option<&str>) -> Option<String> {
    if let Some(captures) = PROJECTS_PATH.captures(path) {
        return captures.get(1).map(|m| m.as_str().to_string());
    }

    if ACCOUNTS_PATH.is_match(path) {
        return query.and_then(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .find(|(name, _)| name == "key")
                .map(|(_, value)| value.into_owned())
                .filter(|key| !key.is_empty())
        });
    }

    None
}

/// Decode and re-encode a query string with parameters sorted by name.
/// Values of a repeated name keep their relative order.
pub fn reencode_query(query: &str) -> String {
    let mut pairs: Vec<(String, String)> = url::form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect();
    pairs.sort_by(|a, b| a.0.cmp(&b.0));

    url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(pairs)
        .finish()
}
