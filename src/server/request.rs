//! Inbound request head parsing
//!
//! The proxy owns the client connection outright, so it reads the request
//! line and headers itself and leaves the body bytes untouched in the read
//! buffer for relaying.

use crate::error::ProxyError;
use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Largest request head accepted
pub const MAX_HEAD_BYTES: usize = 64 * 1024;

const MAX_HEADERS: usize = 100;
const READ_CHUNK: usize = 8 * 1024;

/// Headers that describe the client connection rather than the request
const HOP_BY_HOP: &[&str] = &["connection", "keep-alive", "proxy-connection"];

/// Request line and headers of one inbound exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    /// Request target exactly as received
    pub target: String,
    /// The target in origin form (`/path?query`), scheme and authority
    /// stripped from an absolute-form target
    pub origin: String,
    /// HTTP/1 minor version
    pub version: u8,
    pub headers: Vec<(String, Vec<u8>)>,
}

impl RequestHead {
    /// Path component of the origin-form target, still percent-encoded
    pub fn path(&self) -> &str {
        self.split_origin().0
    }

    /// Raw query string, if the target has one
    pub fn query(&self) -> Option<&str> {
        self.split_origin().1
    }

    fn split_origin(&self) -> (&str, Option<&str>) {
        match self.origin.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (self.origin.as_str(), None),
        }
    }

    /// Serialize the head for the backend: new target, original headers
    /// minus connection management, and `Connection: close` so the backend
    /// ends the response by closing its side.
    pub fn to_forwarded(&self, path_and_query: &str) -> Vec<u8> {
        let mut out = Vec::with_capacity(512);
        out.extend_from_slice(
            format!(
                "{} {} HTTP/1.{}\r\n",
                self.method, path_and_query, self.version
            )
            .as_bytes(),
        );
        for (name, value) in &self.headers {
            if HOP_BY_HOP
                .iter()
                .any(|hop| name.eq_ignore_ascii_case(hop))
            {
                continue;
            }
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value);
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"Connection: close\r\n\r\n");
        out
    }

    /// Human-readable dump of the head plus whatever body bytes were read
    pub fn dump(&self, body: &[u8]) -> String {
        let mut dump = format!("{} {} HTTP/1.{}\r\n", self.method, self.target, self.version);
        for (name, value) in &self.headers {
            dump.push_str(name);
            dump.push_str(": ");
            dump.push_str(&String::from_utf8_lossy(value));
            dump.push_str("\r\n");
        }
        dump.push_str("\r\n");
        dump.push_str(&String::from_utf8_lossy(body));
        dump
    }
}

/// Reduce a request target to origin form
///
/// Origin-form and asterisk-form targets pass through. Absolute-form
/// targets (`http://host:port/path?query`) lose their scheme and authority.
fn origin_form(target: &str) -> Result<String, ProxyError> {
    if target.starts_with('/') || target == "*" {
        return Ok(target.to_string());
    }

    let url = url::Url::parse(target)
        .map_err(|e| ProxyError::MalformedRequest(format!("bad request target {}: {}", target, e)))?;
    if url.cannot_be_a_base() {
        return Err(ProxyError::MalformedRequest(format!(
            "bad request target {}",
            target
        )));
    }

    Ok(match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    })
}

/// Try to parse a complete head from the front of `buf`
fn parse_head(buf: &[u8]) -> Result<Option<(RequestHead, usize)>, ProxyError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut request = httparse::Request::new(&mut headers);

    let consumed = match request.parse(buf) {
        Ok(httparse::Status::Complete(consumed)) => consumed,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(e) => return Err(ProxyError::MalformedRequest(e.to_string())),
    };

    let target = request.path.unwrap_or_default().to_string();
    let head = RequestHead {
        method: request.method.unwrap_or_default().to_string(),
        origin: origin_form(&target)?,
        target,
        version: request.version.unwrap_or(1),
        headers: request
            .headers
            .iter()
            .map(|h| (h.name.to_string(), h.value.to_vec()))
            .collect(),
    };
    Ok(Some((head, consumed)))
}

/// Read from `stream` until a full request head is buffered
///
/// Returns `Ok(None)` when the peer closes before sending anything. On
/// success the head bytes are consumed from `buf`; any bytes after them
/// (the start of the body) stay in `buf`.
pub async fn read_request_head<S>(
    stream: &mut S,
    buf: &mut BytesMut,
) -> Result<Option<RequestHead>, ProxyError>
where
    S: AsyncRead + Unpin,
{
    loop {
        if let Some((head, consumed)) = parse_head(&buf[..])? {
            buf.advance(consumed);
            return Ok(Some(head));
        }
        if buf.len() >= MAX_HEAD_BYTES {
            return Err(ProxyError::HeadTooLarge {
                limit: MAX_HEAD_BYTES,
            });
        }

        buf.reserve(READ_CHUNK);
        let read = stream
            .read_buf(buf)
            .await
            .map_err(ProxyError::ForwardingFailure)?;
        if read == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(ProxyError::MalformedRequest(
                "connection closed mid-head".to_string(),
            ));
        }
    }
}
