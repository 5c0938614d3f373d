//! One proxied exchange on a taken-over client connection
//!
//! The request head is parsed here, the tenant is resolved through the
//! router, and the backend's response bytes are copied onto the client
//! socket exactly as they arrive. The client connection is closed once the
//! backend closes its side.

use super::request::{read_request_head, RequestHead};
use crate::config::UnroutablePolicy;
use crate::error::{ProxyError, RoutingError};
use crate::router::{Route, RouteTarget, Router};
use bytes::BytesMut;
use http::StatusCode;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

/// Serve a single request on `client` and close it
pub(crate) async fn handle_connection<S>(router: &Router, policy: UnroutablePolicy, mut client: S)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(8 * 1024);
    let head = match read_request_head(&mut client, &mut buf).await {
        Ok(Some(head)) => head,
        Ok(None) => {
            tracing::debug!("client closed before sending a request");
            return;
        }
        Err(e) => {
            tracing::warn!(error = %e, "rejecting malformed request");
            if let Err(e) = write_response(&mut client, StatusCode::BAD_REQUEST, None, b"").await {
                tracing::debug!(error = %e, "failed to write 400 response");
            }
            return;
        }
    };
    tracing::debug!(method = %head.method, uri = %head.target, "request received");

    match router.route(head.path(), head.query()) {
        Ok(Route::HealthCheck) => {
            if let Err(e) = write_response(&mut client, StatusCode::OK, None, b"").await {
                tracing::debug!(error = %e, "failed to answer health check");
            }
        }
        Ok(Route::Backend(target)) => {
            let tenant = target.tenant.clone();
            match forward(client, &head, buf, target).await {
                Ok(bytes) => {
                    tracing::debug!(tenant = %tenant, response_bytes = bytes, "request completed");
                }
                Err(e @ ProxyError::BackendUnreachable { .. }) => {
                    tracing::error!(tenant = %tenant, error = %e, "backend unreachable");
                }
                Err(e) => {
                    tracing::warn!(tenant = %tenant, error = %e, "forwarding failed");
                }
            }
        }
        Err(err) => reject_unroutable(&mut client, policy, &head, &buf, err).await,
    }
}

async fn reject_unroutable<S>(
    client: &mut S,
    policy: UnroutablePolicy,
    head: &RequestHead,
    buffered: &[u8],
    err: RoutingError,
) where
    S: AsyncWrite + Unpin,
{
    let err = ProxyError::from(err);
    match policy {
        UnroutablePolicy::Panic => {
            tracing::error!(error = %err, method = %head.method, uri = %head.target, "unroutable request");
            panic!(
                "emulator proxy: {}, request:\n{}",
                err,
                head.dump(buffered)
            );
        }
        UnroutablePolicy::Reject => {
            tracing::error!(
                error = %err,
                method = %head.method,
                uri = %head.target,
                "rejecting unroutable request"
            );
            let body = serde_json::json!({
                "error": {
                    "code": StatusCode::BAD_GATEWAY.as_u16(),
                    "status": "UNROUTABLE_REQUEST",
                    "message": err.to_string(),
                }
            })
            .to_string();
            if let Err(e) = write_response(
                client,
                StatusCode::BAD_GATEWAY,
                Some("application/json"),
                body.as_bytes(),
            )
            .await
            {
                tracing::debug!(error = %e, "failed to write unroutable response");
            }
        }
    }
}

/// Send the rewritten request to the backend and relay its raw response
async fn forward<S>(
    mut client: S,
    head: &RequestHead,
    buffered: BytesMut,
    target: RouteTarget,
) -> Result<u64, ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let addr = target.backend.authority();
    let mut backend = match TcpStream::connect(&addr).await {
        Ok(backend) => backend,
        Err(source) => {
            if let Err(e) = write_response(&mut client, StatusCode::BAD_GATEWAY, None, b"").await {
                tracing::debug!(error = %e, "failed to write 502 response");
            }
            return Err(ProxyError::BackendUnreachable { addr, source });
        }
    };

    let request = head.to_forwarded(&target.path_and_query);
    if let Err(e) = send_request(&mut backend, &request, &buffered).await {
        if let Err(write_err) =
            write_response(&mut client, StatusCode::BAD_GATEWAY, None, b"").await
        {
            tracing::debug!(error = %write_err, "failed to write 502 response");
        }
        return Err(ProxyError::ForwardingFailure(e));
    }
    tracing::debug!(tenant = %target.tenant, backend = %addr, "request forwarded");

    relay(client, backend).await
}

async fn send_request<B>(backend: &mut B, head: &[u8], body_start: &[u8]) -> io::Result<()>
where
    B: AsyncWrite + Unpin,
{
    backend.write_all(head).await?;
    backend.write_all(body_start).await?;
    backend.flush().await
}

/// Pump the rest of the request body upstream while copying the backend's
/// response bytes verbatim to the client. Finishes when the backend closes,
/// then closes the client connection. Returns the response byte count.
pub(crate) async fn relay<C, B>(client: C, backend: B) -> Result<u64, ProxyError>
where
    C: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_rd, mut client_wr) = tokio::io::split(client);
    let (mut backend_rd, mut backend_wr) = tokio::io::split(backend);

    let downloaded = {
        let upload = tokio::io::copy(&mut client_rd, &mut backend_wr);
        let download = tokio::io::copy(&mut backend_rd, &mut client_wr);
        tokio::pin!(upload, download);

        let mut uploading = true;
        loop {
            tokio::select! {
                result = &mut download => break result,
                result = &mut upload, if uploading => {
                    uploading = false;
                    if let Err(e) = result {
                        tracing::debug!(error = %e, "request body upload ended");
                    }
                }
            }
        }
    };

    let downloaded = downloaded.map_err(ProxyError::ForwardingFailure)?;
    client_wr
        .shutdown()
        .await
        .map_err(ProxyError::ForwardingFailure)?;
    Ok(downloaded)
}

/// Minimal response written by the proxy itself
async fn write_response<S>(
    stream: &mut S,
    status: StatusCode,
    content_type: Option<&str>,
    body: &[u8],
) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut head = format!(
        "HTTP/1.1 {} {}\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or_default()
    );
    if let Some(content_type) = content_type {
        head.push_str(&format!("Content-Type: {}\r\n", content_type));
    }
    head.push_str(&format!(
        "Content-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    ));

    stream.write_all(head.as_bytes()).await?;
    stream.write_all(body).await?;
    stream.shutdown().await
}
