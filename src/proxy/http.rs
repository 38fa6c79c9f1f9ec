//! Minimal HTTP/1.x framing for the proxy: head parsing with `httparse`,
//! target resolution, and body relaying.

use crate::models::{HttpMethod, RequestTarget, Scheme};
use http::StatusCode;
use thiserror::Error;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const MAX_HEADER_BYTES: usize = 64 * 1024;
const MAX_HEADER_COUNT: usize = 128;
const MAX_CHUNK_LINE_BYTES: usize = 4 * 1024;

/// Headers that only apply to a single connection and are never relayed.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authorization",
    "proxy-authenticate",
    "te",
    "trailer",
    "upgrade",
];

/// Never dropped even when a `Connection` header nominates them; the
/// message framing depends on them.
const FRAMING_HEADERS: &[&str] = &["host", "content-length", "transfer-encoding"];

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("malformed HTTP message: {0}")]
    Malformed(String),
    #[error("HTTP headers exceed {} bytes", MAX_HEADER_BYTES)]
    HeadersTooLarge,
    #[error("request body exceeds configured limit of {limit} bytes")]
    BodyTooLarge { limit: u64 },
    #[error("connection closed mid-message")]
    UnexpectedEof,
    #[error("no body progress for {0:?}")]
    Idle(Duration),
    #[error(transparent)]
    Parse(#[from] httparse::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl HttpError {
    /// Status to answer the client with when its request could not be read.
    pub fn status(&self) -> StatusCode {
        match self {
            HttpError::HeadersTooLarge => StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
            HttpError::BodyTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            HttpError::Idle(_) => StatusCode::REQUEST_TIMEOUT,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

/// How a message body is delimited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    None,
    Length(u64),
    Chunked,
    /// Response body delimited by the server closing the connection
    UntilEof,
}

#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: HttpMethod,
    pub target: RequestTarget,
    /// Minor version of HTTP/1.x
    pub version: u8,
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        header_value(&self.headers, name)
    }

    pub fn keep_alive(&self) -> bool {
        keep_alive(self.version, &self.headers)
    }

    pub fn expects_continue(&self) -> bool {
        self.header("expect")
            .map(|v| v.eq_ignore_ascii_case("100-continue"))
            .unwrap_or(false)
    }

    pub fn body_kind(&self, limit: u64) -> Result<BodyKind, HttpError> {
        if is_chunked(&self.headers) {
            return Ok(BodyKind::Chunked);
        }
        match content_length(&self.headers)? {
            Some(len) if len > limit => Err(HttpError::BodyTooLarge { limit }),
            Some(0) | None => Ok(BodyKind::None),
            Some(len) => Ok(BodyKind::Length(len)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: u16,
    pub reason: String,
    pub version: u8,
    pub headers: Vec<(String, String)>,
}

impl ResponseHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        header_value(&self.headers, name)
    }

    pub fn body_kind(&self, request_method: &HttpMethod) -> Result<BodyKind, HttpError> {
        if *request_method == HttpMethod::Head
            || (100..200).contains(&self.status)
            || self.status == 204
            || self.status == 304
        {
            return Ok(BodyKind::None);
        }
        if is_chunked(&self.headers) {
            return Ok(BodyKind::Chunked);
        }
        Ok(match content_length(&self.headers)? {
            Some(len) => BodyKind::Length(len),
            None => BodyKind::UntilEof,
        })
    }
}

/// Read raw head bytes up to and including the blank line.
///
/// Returns `Ok(None)` when the peer closed the connection before sending
/// anything, which is how idle keep-alive connections end.
async fn read_head_bytes<R>(reader: &mut R) -> Result<Option<Vec<u8>>, HttpError>
where
    R: AsyncBufRead + Unpin,
{
    let mut head = Vec::with_capacity(1024);
    loop {
        let line_start = head.len();
        let budget = (MAX_HEADER_BYTES + 1 - line_start) as u64;
        let read = (&mut *reader)
            .take(budget)
            .read_until(b'\n', &mut head)
            .await?;
        if read == 0 {
            return if head.is_empty() {
                Ok(None)
            } else {
                Err(HttpError::UnexpectedEof)
            };
        }
        if head.len() > MAX_HEADER_BYTES {
            return Err(HttpError::HeadersTooLarge);
        }
        let line = &head[line_start..];
        if line == b"\r\n" || line == b"\n" {
            // Tolerate stray blank lines before the request line.
            if line_start == 0 {
                head.clear();
                continue;
            }
            return Ok(Some(head));
        }
    }
}

pub async fn read_request_head<R>(
    reader: &mut R,
    default_scheme: Scheme,
) -> Result<Option<RequestHead>, HttpError>
where
    R: AsyncBufRead + Unpin,
{
    let Some(raw) = read_head_bytes(reader).await? else {
        return Ok(None);
    };

    let mut header_storage = [httparse::EMPTY_HEADER; MAX_HEADER_COUNT];
    let mut req = httparse::Request::new(&mut header_storage);
    if req.parse(&raw)?.is_partial() {
        return Err(HttpError::Malformed("partial request head".into()));
    }

    let method = HttpMethod::parse(req.method.unwrap_or("GET"));
    let raw_target = req.path.unwrap_or("/");
    let version = req.version.unwrap_or(1);
    let headers = collect_headers(req.headers);

    let target = if method == HttpMethod::Connect {
        let (host, port) = split_host_and_port(raw_target, Scheme::Https.default_port());
        RequestTarget {
            scheme: Scheme::Https,
            host,
            port,
            path: "/".to_string(),
        }
    } else {
        resolve_target(raw_target, &headers, default_scheme)?
    };
    if target.host.is_empty() {
        return Err(HttpError::Malformed(format!(
            "no host in request target {raw_target:?}"
        )));
    }

    Ok(Some(RequestHead {
        method,
        target,
        version,
        headers,
    }))
}

/// Read the final response head, skipping interim 1xx responses.
pub async fn read_response_head<R>(reader: &mut R) -> Result<ResponseHead, HttpError>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let raw = read_head_bytes(reader)
            .await?
            .ok_or(HttpError::UnexpectedEof)?;

        let mut header_storage = [httparse::EMPTY_HEADER; MAX_HEADER_COUNT];
        let mut res = httparse::Response::new(&mut header_storage);
        if res.parse(&raw)?.is_partial() {
            return Err(HttpError::Malformed("partial response head".into()));
        }
        let status = res.code.unwrap_or(502);
        if (100..200).contains(&status) && status != 101 {
            continue;
        }
        return Ok(ResponseHead {
            status,
            reason: res.reason.unwrap_or("").to_string(),
            version: res.version.unwrap_or(1),
            headers: collect_headers(res.headers),
        });
    }
}

fn collect_headers(headers: &[httparse::Header<'_>]) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|h| {
            (
                h.name.to_string(),
                String::from_utf8_lossy(h.value).trim().to_string(),
            )
        })
        .collect()
}

pub fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn is_chunked(headers: &[(String, String)]) -> bool {
    header_value(headers, "transfer-encoding")
        .map(|v| v.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false)
}

fn content_length(headers: &[(String, String)]) -> Result<Option<u64>, HttpError> {
    header_value(headers, "content-length")
        .map(|v| {
            v.parse::<u64>()
                .map_err(|_| HttpError::Malformed(format!("invalid content-length {v:?}")))
        })
        .transpose()
}

/// Lowercased options from every `Connection` header, or from
/// `Proxy-Connection` when the message has no `Connection` header.
fn connection_tokens(headers: &[(String, String)]) -> Vec<String> {
    let name = if header_value(headers, "connection").is_some() {
        "connection"
    } else {
        "proxy-connection"
    };
    headers
        .iter()
        .filter(|(k, _)| k.eq_ignore_ascii_case(name))
        .flat_map(|(_, v)| v.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .collect()
}

fn keep_alive(version: u8, headers: &[(String, String)]) -> bool {
    let tokens = connection_tokens(headers);
    if tokens.iter().any(|t| t == "close") {
        false
    } else if tokens.iter().any(|t| t == "keep-alive") {
        true
    } else {
        version >= 1
    }
}

/// Whether `name` must not cross the proxy: the fixed hop-by-hop set plus
/// anything the message's `Connection` header nominates.
fn is_hop_by_hop(name: &str, nominated: &[String]) -> bool {
    if HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h)) {
        return true;
    }
    !FRAMING_HEADERS.iter().any(|h| name.eq_ignore_ascii_case(h))
        && nominated.iter().any(|t| name.eq_ignore_ascii_case(t))
}

fn resolve_target(
    raw: &str,
    headers: &[(String, String)],
    default_scheme: Scheme,
) -> Result<RequestTarget, HttpError> {
    if let Some((scheme, rest)) = raw.split_once("://") {
        let scheme = match scheme.to_ascii_lowercase().as_str() {
            "http" => Scheme::Http,
            "https" => Scheme::Https,
            other => {
                return Err(HttpError::Malformed(format!(
                    "unsupported scheme {other:?}"
                )))
            }
        };
        let split_at = rest.find(['/', '?']).unwrap_or(rest.len());
        let (authority, path) = rest.split_at(split_at);
        // Drop userinfo, it is never forwarded.
        let authority = authority.rsplit('@').next().unwrap_or(authority);
        let (host, port) = split_host_and_port(authority, scheme.default_port());
        let path = match path {
            "" => "/".to_string(),
            p if p.starts_with('?') => format!("/{p}"),
            p => p.to_string(),
        };
        return Ok(RequestTarget {
            scheme,
            host,
            port,
            path,
        });
    }

    let host_header = header_value(headers, "host")
        .ok_or_else(|| HttpError::Malformed("missing Host header".into()))?;
    let (host, port) = split_host_and_port(host_header, default_scheme.default_port());
    Ok(RequestTarget {
        scheme: default_scheme,
        host,
        port,
        path: raw.to_string(),
    })
}

/// Split `host[:port]`, understanding bracketed IPv6 literals. The returned
/// host carries no brackets.
pub fn split_host_and_port(input: &str, default_port: u16) -> (String, u16) {
    if let Some(rest) = input.strip_prefix('[') {
        if let Some((host, tail)) = rest.split_once(']') {
            let port = tail
                .strip_prefix(':')
                .and_then(|p| p.parse::<u16>().ok())
                .unwrap_or(default_port);
            return (host.to_string(), port);
        }
    }
    if let Some((host, port)) = input.rsplit_once(':') {
        if let Ok(parsed) = port.parse::<u16>() {
            return (host.to_string(), parsed);
        }
    }
    (input.to_string(), default_port)
}

/// Write the request head for the upstream server.
///
/// Hop-by-hop headers and any client supplied copies of the injected
/// headers are dropped, `injected` is appended, and the upstream connection
/// is always marked `Connection: close`.
pub async fn write_upstream_request_head<W>(
    writer: &mut W,
    head: &RequestHead,
    injected: &[(&str, &str)],
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut out = format!("{} {} HTTP/1.1\r\n", head.method, head.target.path);
    if head.header("host").is_none() {
        out.push_str(&format!("Host: {}\r\n", host_header_value(&head.target)));
    }
    let nominated = connection_tokens(&head.headers);
    for (name, value) in &head.headers {
        if is_hop_by_hop(name, &nominated)
            || name.eq_ignore_ascii_case("expect")
            || injected.iter().any(|(n, _)| name.eq_ignore_ascii_case(n))
        {
            continue;
        }
        out.push_str(&format!("{name}: {value}\r\n"));
    }
    for (name, value) in injected {
        out.push_str(&format!("{name}: {value}\r\n"));
    }
    out.push_str("Connection: close\r\n\r\n");
    writer.write_all(out.as_bytes()).await
}

fn host_header_value(target: &RequestTarget) -> String {
    let host = if target.host.contains(':') {
        format!("[{}]", target.host)
    } else {
        target.host.clone()
    };
    if target.port == target.scheme.default_port() {
        host
    } else {
        format!("{}:{}", host, target.port)
    }
}

/// Write a relayed response head for the client with `injected` headers.
pub async fn write_client_response_head<W>(
    writer: &mut W,
    head: &ResponseHead,
    injected: &[(&str, &str)],
    keep_alive: bool,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let reason = if head.reason.is_empty() {
        StatusCode::from_u16(head.status)
            .ok()
            .and_then(|s| s.canonical_reason())
            .unwrap_or("")
    } else {
        head.reason.as_str()
    };
    let mut out = format!("HTTP/1.1 {} {}\r\n", head.status, reason);
    let nominated = connection_tokens(&head.headers);
    for (name, value) in &head.headers {
        if is_hop_by_hop(name, &nominated)
            || injected.iter().any(|(n, _)| name.eq_ignore_ascii_case(n))
        {
            continue;
        }
        out.push_str(&format!("{name}: {value}\r\n"));
    }
    for (name, value) in injected {
        out.push_str(&format!("{name}: {value}\r\n"));
    }
    out.push_str(if keep_alive {
        "Connection: keep-alive\r\n\r\n"
    } else {
        "Connection: close\r\n\r\n"
    });
    writer.write_all(out.as_bytes()).await
}

/// Write a complete response generated by the proxy itself.
pub async fn respond_with_status<W>(
    writer: &mut W,
    status: StatusCode,
    headers: &[(&str, &str)],
    content_type: &str,
    body: &str,
    keep_alive: bool,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut out = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or(""),
        content_type,
        body.len()
    );
    for (name, value) in headers {
        out.push_str(&format!("{name}: {value}\r\n"));
    }
    out.push_str(if keep_alive {
        "Connection: keep-alive\r\n\r\n"
    } else {
        "Connection: close\r\n\r\n"
    });
    out.push_str(body);
    writer.write_all(out.as_bytes()).await?;
    writer.flush().await
}

/// Copy a body from `reader` to `writer` preserving its framing. Returns
/// the number of payload bytes relayed.
///
/// Every read and write must make progress within `idle`, otherwise the
/// relay fails with [`HttpError::Idle`].
pub async fn relay_body<R, W>(
    reader: &mut R,
    writer: &mut W,
    kind: BodyKind,
    limit: Option<u64>,
    idle: Duration,
) -> Result<u64, HttpError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match kind {
        BodyKind::None => Ok(0),
        BodyKind::Length(len) => copy_within(reader, writer, Some(len), idle).await,
        BodyKind::Chunked => relay_chunked(reader, writer, limit, idle).await,
        BodyKind::UntilEof => copy_within(reader, writer, None, idle).await,
    }
}

async fn fill_within<'a, R>(reader: &'a mut R, idle: Duration) -> Result<&'a [u8], HttpError>
where
    R: AsyncBufRead + Unpin,
{
    match tokio::time::timeout(idle, reader.fill_buf()).await {
        Ok(buf) => Ok(buf?),
        Err(_) => Err(HttpError::Idle(idle)),
    }
}

async fn write_within<W>(writer: &mut W, bytes: &[u8], idle: Duration) -> Result<(), HttpError>
where
    W: AsyncWrite + Unpin,
{
    match tokio::time::timeout(idle, writer.write_all(bytes)).await {
        Ok(written) => Ok(written?),
        Err(_) => Err(HttpError::Idle(idle)),
    }
}

/// Copy exactly `len` bytes, or everything up to EOF when `len` is `None`.
async fn copy_within<R, W>(
    reader: &mut R,
    writer: &mut W,
    len: Option<u64>,
    idle: Duration,
) -> Result<u64, HttpError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut copied = 0u64;
    loop {
        let remaining = match len {
            Some(len) if copied >= len => return Ok(copied),
            Some(len) => len - copied,
            None => u64::MAX,
        };
        let buf = fill_within(reader, idle).await?;
        if buf.is_empty() {
            return match len {
                Some(_) => Err(HttpError::UnexpectedEof),
                None => Ok(copied),
            };
        }
        let n = buf.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
        write_within(writer, &buf[..n], idle).await?;
        reader.consume(n);
        copied += n as u64;
    }
}

async fn read_chunk_line<R>(
    reader: &mut R,
    line: &mut Vec<u8>,
    idle: Duration,
) -> Result<(), HttpError>
where
    R: AsyncBufRead + Unpin,
{
    line.clear();
    let mut limited = (&mut *reader).take(MAX_CHUNK_LINE_BYTES as u64);
    let read_line = limited.read_until(b'\n', line);
    let read = match tokio::time::timeout(idle, read_line).await {
        Ok(read) => read?,
        Err(_) => return Err(HttpError::Idle(idle)),
    };
    if read == 0 {
        return Err(HttpError::UnexpectedEof);
    }
    if !line.ends_with(b"\n") {
        return Err(HttpError::Malformed("chunk line too long".into()));
    }
    Ok(())
}

async fn relay_chunked<R, W>(
    reader: &mut R,
    writer: &mut W,
    limit: Option<u64>,
    idle: Duration,
) -> Result<u64, HttpError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut line = Vec::with_capacity(64);
    let mut total = 0u64;
    loop {
        read_chunk_line(reader, &mut line, idle).await?;
        write_within(writer, &line, idle).await?;

        let size_token = std::str::from_utf8(&line)
            .unwrap_or("")
            .split(';')
            .next()
            .unwrap_or("")
            .trim();
        let size = u64::from_str_radix(size_token, 16)
            .map_err(|_| HttpError::Malformed(format!("invalid chunk size {size_token:?}")))?;

        if size == 0 {
            // Trailer section ends with an empty line.
            loop {
                read_chunk_line(reader, &mut line, idle).await?;
                write_within(writer, &line, idle).await?;
                if line == b"\r\n" || line == b"\n" {
                    return Ok(total);
                }
            }
        }

        total = total.saturating_add(size);
        if let Some(limit) = limit {
            if total > limit {
                return Err(HttpError::BodyTooLarge { limit });
            }
        }

        copy_within(reader, writer, Some(size), idle).await?;
        read_chunk_line(reader, &mut line, idle).await?;
        if line != b"\r\n" && line != b"\n" {
            return Err(HttpError::Malformed("missing chunk terminator".into()));
        }
        write_within(writer, &line, idle).await?;
    }
}
