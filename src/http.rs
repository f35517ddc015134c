//! HTTP proxy listener.
//!
//! `CONNECT host:port` opens a tunnel through the same dial routine and relay
//! engine the SOCKS5 path uses. Any other method must carry an absolute
//! `http://` URI and is forwarded to the origin with `Connection: close`, so
//! each client connection carries exactly one request.

use crate::access::AccessRecord;
use crate::address::{DialTarget, ResolveError};
use crate::commands;
use crate::registry::{SessionGuard, SessionKind, SessionState};
use crate::relay;
use crate::server::{ACCEPT_BACKOFF, ProxyContext};
use anyhow::{Context, Result, bail};
use httparse::Status;
use std::fmt::Write as _;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{Instrument, debug, info, info_span, warn};

/// Upper bound on a request or response head
pub const MAX_HEAD_SIZE: usize = 64 * 1024;

/// Upper bound on the number of headers in a head
const MAX_HEADERS: usize = 128;

/// HttpError is a request the proxy refuses before reaching an origin
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("head exceeds {MAX_HEAD_SIZE} bytes")]
    HeadTooLarge,

    #[error("malformed HTTP message: {0}")]
    Malformed(&'static str),

    #[error("invalid HTTP head: {0}")]
    Parse(#[from] httparse::Error),

    #[error("unsupported request target {0:?}")]
    UnsupportedTarget(String),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("connection closed before a request arrived")]
    Closed,

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl HttpError {
    /// status is the response code sent back for this error
    pub fn status(&self) -> u16 {
        match self {
            HttpError::HeadTooLarge | HttpError::Parse(httparse::Error::TooManyHeaders) => 431,
            _ => 400,
        }
    }
}

/// RequestHead is a parsed request line plus headers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
}

/// RequestHead implementation block
impl RequestHead {
    /// parse parses the head at the start of `buf`. Returns None while the
    /// head is still incomplete, otherwise the head and its length in bytes
    pub fn parse(buf: &[u8]) -> Result<Option<(Self, usize)>, HttpError> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut request = httparse::Request::new(&mut headers);

        let len = match request.parse(buf)? {
            Status::Complete(len) => len,
            Status::Partial => return Ok(None),
        };

        let (Some(method), Some(target), Some(version)) = (request.method, request.path, request.version) else {
            return Err(HttpError::Malformed("incomplete request line"));
        };

        let headers = request
            .headers
            .iter()
            .map(|header| {
                let value = std::str::from_utf8(header.value)
                    .map_err(|_| HttpError::Malformed("header value is not UTF-8"))?;
                Ok((header.name.to_string(), value.to_string()))
            })
            .collect::<Result<Vec<_>, HttpError>>()?;

        let head = Self {
            method: method.to_string(),
            target: target.to_string(),
            version: format!("HTTP/1.{version}"),
            headers,
        };

        Ok(Some((head, len)))
    }

    /// header returns the first header with the given name, ignoring case
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }
}

/// HttpProxy accepts HTTP proxy clients
pub struct HttpProxy {
    pub listen_addr: String,
    ctx: Arc<ProxyContext>,
    listener: Option<TcpListener>,
}

/// HttpProxy implementation block
impl HttpProxy {
    pub fn with_context(listen_addr: impl Into<String>, ctx: Arc<ProxyContext>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            ctx,
            listener: None,
        }
    }

    /// bind to the listen address and return the address actually bound
    pub async fn bind(&mut self) -> Result<SocketAddr> {
        if self.listener.is_some() {
            bail!("HTTP listener already bound");
        }

        let listener = TcpListener::bind(&self.listen_addr)
            .await
            .with_context(|| format!("binding HTTP listener on {}", self.listen_addr))?;
        let addr = listener.local_addr()?;

        info!("HTTP proxy listening on {addr}");

        self.listener = Some(listener);
        Ok(addr)
    }

    /// run accepts connections forever, one task per connection
    pub async fn run(&mut self) -> Result<()> {
        let listener = match self.listener.take() {
            Some(listener) => listener,
            None => {
                self.bind().await?;
                self.listener.take().context("HTTP listener missing after bind")?
            }
        };

        loop {
            let (inbound, peer_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("accept failed: {e}");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };

            let guard = self.ctx.registry.register(peer_addr, SessionKind::Http);
            let span = info_span!("http", id = %guard.id(), peer = %peer_addr);
            let ctx = Arc::clone(&self.ctx);

            tokio::spawn(
                async move {
                    if let Err(e) = handle_connection(inbound, peer_addr, ctx, guard).await {
                        warn!("request failed: {e:#}");
                    }
                }
                .instrument(span),
            );
        }
    }
}

/// handle_connection serves one HTTP proxy client and emits its access record
pub async fn handle_connection<S>(
    stream: S,
    peer: SocketAddr,
    ctx: Arc<ProxyContext>,
    guard: SessionGuard,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let started = Instant::now();
    let mut record = AccessRecord::new(peer);

    let result = serve(stream, &ctx, &guard, &mut record).await;
    guard.set_state(SessionState::Closed);

    // Status stays 0 when the client left without sending a request
    if record.status != 0 {
        record.elapsed = started.elapsed();
        ctx.access_log.record(&record);
    }

    result
}

async fn serve<S>(mut stream: S, ctx: &ProxyContext, guard: &SessionGuard, record: &mut AccessRecord) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (head, _, leftover) = match read_head(&mut stream, RequestHead::parse).await {
        Ok(read) => read,
        Err(HttpError::Closed) => return Ok(()),
        Err(e) => return reject(stream, record, e).await,
    };

    record.method = head.method.clone();
    record.proto = head.version.clone();
    record.uri = head.target.clone();
    record.host = head.header("host").unwrap_or(&head.target).to_string();
    record.user_agent = head.header("user-agent").unwrap_or_default().to_string();
    record.content_length = head.header("content-length").and_then(|v| v.parse().ok());

    if head.is_connect() {
        tunnel(stream, &head, leftover, ctx, guard, record).await
    } else {
        forward(stream, &head, leftover, ctx, guard, record).await
    }
}

/// tunnel answers CONNECT by relaying raw bytes to the requested authority
async fn tunnel<S>(
    mut stream: S,
    head: &RequestHead,
    leftover: Vec<u8>,
    ctx: &ProxyContext,
    guard: &SessionGuard,
    record: &mut AccessRecord,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let target = match DialTarget::parse_authority(&head.target, Some(443)) {
        Ok(target) => target,
        Err(e) => return reject(stream, record, e.into()).await,
    };

    guard.set_target(target.to_string());

    let mut upstream = match commands::dial(&target, ctx.config.connect_timeout).await {
        Ok(upstream) => upstream,
        Err(e) => {
            record.status = e.http_status();
            let _ = write_error(&mut stream, record.status).await;
            return Err(e).with_context(|| format!("CONNECT {target}"));
        }
    };

    stream
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await
        .context("writing CONNECT response")?;
    record.status = 200;

    // Bytes the client sent right behind the head (e.g. a TLS ClientHello)
    if !leftover.is_empty() {
        upstream.write_all(&leftover).await?;
        record.bytes_sent += leftover.len() as u64;
    }

    guard.set_state(SessionState::Relaying);
    let result = relay::relay(stream, upstream, &ctx.config.relay).await;
    record.bytes_sent += result.client_to_upstream.bytes;
    record.bytes_received += result.upstream_to_client.bytes;

    info!(
        "tunnel to {target} closed: {} bytes from client, {} bytes from server",
        result.client_to_upstream.bytes, result.upstream_to_client.bytes
    );

    Ok(())
}

/// forward passes a plain request through to its origin
async fn forward<S>(
    mut stream: S,
    head: &RequestHead,
    leftover: Vec<u8>,
    ctx: &ProxyContext,
    guard: &SessionGuard,
    record: &mut AccessRecord,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (authority, path) = match split_absolute_uri(&head.target) {
        Ok(parts) => parts,
        Err(e) => return reject(stream, record, e).await,
    };

    let target = match DialTarget::parse_authority(&authority, Some(80)) {
        Ok(target) => target,
        Err(e) => return reject(stream, record, e.into()).await,
    };

    record.host = authority.clone();
    guard.set_target(target.to_string());

    let mut upstream = match commands::dial(&target, ctx.config.connect_timeout).await {
        Ok(upstream) => upstream,
        Err(e) => {
            record.status = e.http_status();
            let _ = write_error(&mut stream, record.status).await;
            return Err(e).with_context(|| format!("{} {}", head.method, head.target));
        }
    };

    let request = origin_request(head, &path, &authority);
    upstream.write_all(&request).await?;
    upstream.write_all(&leftover).await?;
    record.bytes_sent = (request.len() + leftover.len()) as u64;

    // The status line is read here only to fill in the access record
    let (status, response_head, body_start) = match read_head(&mut upstream, parse_response_status).await {
        Ok(read) => read,
        Err(e) => {
            record.status = 502;
            let _ = write_error(&mut stream, record.status).await;
            return Err(e).context("reading origin response");
        }
    };
    record.status = status;

    stream.write_all(&response_head).await?;
    stream.write_all(&body_start).await?;
    record.bytes_received = (response_head.len() + body_start.len()) as u64;

    guard.set_state(SessionState::Relaying);
    let result = relay::relay(stream, upstream, &ctx.config.relay).await;
    record.bytes_sent += result.client_to_upstream.bytes;
    record.bytes_received += result.upstream_to_client.bytes;

    debug!("{} {} -> {}", head.method, head.target, record.status);
    Ok(())
}

/// reject answers with the error's status and closes
async fn reject<S>(mut stream: S, record: &mut AccessRecord, err: HttpError) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    record.status = err.status();
    let _ = write_error(&mut stream, record.status).await;
    let _ = stream.shutdown().await;
    Err(err.into())
}

/// read_head buffers a stream until `parse` recognizes a complete head.
/// Returns the parsed value, the raw head and whatever bytes arrived after it
pub async fn read_head<R, T, F>(reader: &mut R, parse: F) -> Result<(T, Vec<u8>, Vec<u8>), HttpError>
where
    R: AsyncRead + Unpin,
    F: Fn(&[u8]) -> Result<Option<(T, usize)>, HttpError>,
{
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Err(if buf.is_empty() {
                HttpError::Closed
            } else {
                HttpError::Malformed("connection closed inside head")
            });
        }

        buf.extend_from_slice(&chunk[..n]);

        // Only the first MAX_HEAD_SIZE bytes may hold the head
        let window = &buf[..buf.len().min(MAX_HEAD_SIZE)];
        if let Some((parsed, len)) = parse(window)? {
            let rest = buf.split_off(len);
            return Ok((parsed, buf, rest));
        }

        if buf.len() >= MAX_HEAD_SIZE {
            return Err(HttpError::HeadTooLarge);
        }
    }
}

/// split_absolute_uri splits `http://authority/path?query` into its
/// authority (userinfo dropped) and origin-form path
pub fn split_absolute_uri(uri: &str) -> Result<(String, String), HttpError> {
    let unsupported = || HttpError::UnsupportedTarget(uri.to_string());

    let scheme = uri.get(..7).ok_or_else(unsupported)?;
    if !scheme.eq_ignore_ascii_case("http://") {
        return Err(unsupported());
    }
    let rest = &uri[7..];

    let (authority, path) = match rest.find(['/', '?']) {
        Some(i) => (&rest[..i], &rest[i..]),
        None => (rest, "/"),
    };

    let authority = authority.rsplit_once('@').map_or(authority, |(_, host)| host);
    if authority.is_empty() {
        return Err(unsupported());
    }

    let path = if path.starts_with('?') {
        format!("/{path}")
    } else {
        path.to_string()
    };

    Ok((authority.to_string(), path))
}

/// origin_request rebuilds the head for the origin: origin-form target,
/// proxy and connection-management headers dropped, `Connection: close`
fn origin_request(head: &RequestHead, path: &str, authority: &str) -> Vec<u8> {
    let mut out = format!("{} {} {}\r\n", head.method, path, head.version);
    let mut has_host = false;

    for (name, value) in &head.headers {
        if is_hop_by_hop(name) {
            continue;
        }
        has_host |= name.eq_ignore_ascii_case("host");
        let _ = write!(out, "{name}: {value}\r\n");
    }

    if !has_host {
        let _ = write!(out, "Host: {authority}\r\n");
    }

    out.push_str("Connection: close\r\n\r\n");
    out.into_bytes()
}

fn is_hop_by_hop(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    name.starts_with("proxy-") || name == "connection" || name == "keep-alive"
}

/// parse_response_status reads the status code of a response head
fn parse_response_status(buf: &[u8]) -> Result<Option<(u16, usize)>, HttpError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut headers);

    match response.parse(buf)? {
        Status::Complete(len) => {
            let code = response.code.ok_or(HttpError::Malformed("missing status code"))?;
            Ok(Some((code, len)))
        }
        Status::Partial => Ok(None),
    }
}

async fn write_error<W>(stream: &mut W, status: u16) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let reason = reason_phrase(status);
    let response = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{reason}\r\n",
        reason.len() + 2
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        400 => "Bad Request",
        431 => "Request Header Fields Too Large",
        502 => "Bad Gateway",
        504 => "Gateway Timeout",
        _ => "Error",
    }
}
