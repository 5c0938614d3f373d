//! Identity toolkit client helpers
//!
//! Talks to the emulators through the proxy, using the tenant id as the API
//! key so the request is routed by the `accounts` rule.

use anyhow::Context;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SignInRequest<'a> {
    email: &'a str,
    password: &'a str,
    return_secure_token: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignInResponse {
    id_token: String,
}

/// Client for identity operations that go through the proxy
#[derive(Debug, Clone)]
pub struct IdentityClient {
    http: reqwest::Client,
    proxy_host: String,
}

impl IdentityClient {
    /// `proxy_host` is the proxy's `host:port`
    pub fn new(proxy_host: impl Into<String>) -> crate::Result<Self> {
        let http = reqwest::Client::builder()
            .no_proxy()
            .build()
            .context("failed to build identity client")?;
        Ok(Self {
            http,
            proxy_host: proxy_host.into(),
        })
    }

    /// Sign in with email and password and return the ID token
    pub async fn issue_id_token(
        &self,
        tenant: &str,
        email: &str,
        password: &str,
    ) -> crate::Result<String> {
        let url = format!(
            "http://{}/identitytoolkit.googleapis.com/v1/accounts:signInWithPassword",
            self.proxy_host
        );

        let response = self
            .http
            .post(&url)
            .query(&[("key", tenant)])
            .json(&SignInRequest {
                email,
                password,
                return_secure_token: true,
            })
            .send()
            .await
            .with_context(|| format!("sign-in request for tenant {} failed", tenant))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("sign-in for tenant {} failed with {}: {}", tenant, status, body);
        }

        let body: SignInResponse = response
            .json()
            .await
            .context("invalid sign-in response")?;
        tracing::debug!(tenant = %tenant, email = %email, "issued id token");
        Ok(body.id_token)
    }
}
