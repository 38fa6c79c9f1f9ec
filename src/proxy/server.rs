//! Proxy server implementation
//!
//! Accepts client connections, runs every request through the interceptor
//! and either refuses it or relays it to the origin server, recording
//! completed visits in the history store.

use super::http::{self as wire, BodyKind, HttpError, RequestHead};
use super::upstream::{UpstreamConnector, UpstreamError, UpstreamStream};
use crate::config::ProxyConfig;
use crate::filter::{InterceptDecision, RequestInterceptor, PRIVACY_HEADER};
use crate::models::{HttpMethod, RequestState, RequestTarget, Scheme};
use crate::stats::ProxyStats;
use crate::storage::HistoryStore;
use http::StatusCode;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::Instrument;
use uuid::Uuid;

/// Marks responses the proxy refused on behalf of the blocklist
pub const BLOCKED_BY_HEADER: &str = "X-Blocked-By";

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub connect_timeout: Duration,
    pub response_timeout: Duration,
    /// Idle time allowed between requests on one client connection
    pub keep_alive_timeout: Duration,
    pub max_request_body_bytes: u64,
}

impl ServerSettings {
    pub fn from_config(config: &ProxyConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            response_timeout: config.response_timeout(),
            keep_alive_timeout: config.keep_alive_timeout(),
            max_request_body_bytes: config.max_request_body_bytes as u64,
        }
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self::from_config(&ProxyConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RequestOutcome {
    state: RequestState,
    /// Whether the client connection can carry another request
    reusable: bool,
}

impl RequestOutcome {
    fn last(state: RequestState) -> Self {
        Self {
            state,
            reusable: false,
        }
    }
}

#[derive(Clone)]
pub struct ProxyServer {
    interceptor: Arc<RequestInterceptor>,
    history: Arc<HistoryStore>,
    stats: Arc<ProxyStats>,
    connector: Arc<dyn UpstreamConnector>,
    settings: ServerSettings,
}

impl ProxyServer {
    pub fn new(
        interceptor: Arc<RequestInterceptor>,
        history: Arc<HistoryStore>,
        stats: Arc<ProxyStats>,
        connector: Arc<dyn UpstreamConnector>,
        settings: ServerSettings,
    ) -> Self {
        Self {
            interceptor,
            history,
            stats,
            connector,
            settings,
        }
    }

    /// Accept connections until `shutdown` flips to `true` or its sender is
    /// dropped. Each connection runs in its own task.
    pub async fn serve(
        self,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        tracing::info!("Proxy server listening on {}", listener.local_addr()?);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                accepted = listener.accept() => match accepted {
                    Ok((socket, peer_addr)) => {
                        tracing::debug!("Connection from {}", peer_addr);
                        let _ = socket.set_nodelay(true);
                        let server = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = server.handle_connection(socket).await {
                                log_connection_error(&e);
                            }
                        });
                    }
                    Err(e) => back_off_after_accept_error("Proxy", &e).await,
                },
            }
        }

        tracing::info!("Proxy server stopped");
        Ok(())
    }

    /// Serve one client connection, with keep-alive.
    pub async fn handle_connection<S>(&self, stream: S) -> anyhow::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut client = BufReader::new(stream);
        let mut request_number: u32 = 0;

        loop {
            request_number += 1;

            let head = match tokio::time::timeout(
                self.settings.keep_alive_timeout,
                wire::read_request_head(&mut client, Scheme::Http),
            )
            .await
            {
                Ok(Ok(Some(head))) => head,
                Ok(Ok(None)) => break,
                Ok(Err(HttpError::Io(err))) => {
                    tracing::debug!("Client read failed: {err}");
                    break;
                }
                Ok(Err(HttpError::UnexpectedEof)) => break,
                Ok(Err(err)) => {
                    tracing::warn!("Failed to parse request: {err}");
                    let _ = wire::respond_with_status(
                        client.get_mut(),
                        err.status(),
                        &[PRIVACY_HEADER],
                        "text/plain",
                        &format!("{err}\n"),
                        false,
                    )
                    .await;
                    break;
                }
                Err(_) => {
                    tracing::debug!("Keep-alive timeout after {} requests", request_number - 1);
                    break;
                }
            };

            let span = tracing::info_span!(
                "request",
                id = %Uuid::new_v4(),
                method = %head.method,
                host = %head.target.host,
            );

            // CONNECT takes over the connection
            if head.method == HttpMethod::Connect {
                return self.handle_connect(client, head).instrument(span).await;
            }

            let outcome = self
                .process_request(&mut client, head)
                .instrument(span)
                .await?;
            debug_assert!(outcome.state.is_terminal());
            if !outcome.reusable {
                tracing::debug!("Closing client connection after {:?} request", outcome.state);
                break;
            }
        }

        Ok(())
    }

    async fn process_request<S>(
        &self,
        client: &mut BufReader<S>,
        head: RequestHead,
    ) -> anyhow::Result<RequestOutcome>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        self.stats.record_request();
        let url = head.target.normalized_url();
        tracing::debug!(state = ?RequestState::Received, "{} {}", head.method, url);

        let decision = self.interceptor.evaluate(&head.target.host);
        let keep_alive = head.keep_alive();
        let limit = self.settings.max_request_body_bytes;

        if decision.is_blocked() {
            // The unread body would corrupt the next request on this connection.
            let reusable = keep_alive && matches!(head.body_kind(limit), Ok(BodyKind::None));
            respond_blocked(client.get_mut(), &head.target.host, &decision, reusable).await?;
            tracing::debug!(state = ?RequestState::Blocked, "{}", url);
            return Ok(RequestOutcome {
                state: RequestState::Blocked,
                reusable,
            });
        }
        tracing::debug!(state = ?RequestState::Allowed, "{}", url);

        let body_kind = match head.body_kind(limit) {
            Ok(kind) => kind,
            Err(err) => return self.reject(client, &decision, err).await,
        };

        if head.expects_continue() && body_kind != BodyKind::None {
            // Expect is stripped upstream, so answer it here.
            client
                .get_mut()
                .write_all(b"HTTP/1.1 100 Continue\r\n\r\n")
                .await?;
            client.get_mut().flush().await?;
        }

        let mut upstream = match self.open_upstream(client, &head.target).await {
            Ok(Some(stream)) => BufReader::new(stream),
            Ok(None) => return Ok(cancelled(&url)),
            Err(err) => return self.fail(client, &decision, err).await,
        };
        tracing::debug!(state = ?RequestState::Forwarding, "{}", url);

        let sent = async {
            wire::write_upstream_request_head(upstream.get_mut(), &head, &decision.headers).await?;
            wire::relay_body(
                &mut *client,
                upstream.get_mut(),
                body_kind,
                Some(limit),
                self.settings.response_timeout,
            )
            .await?;
            upstream.get_mut().flush().await?;
            Ok::<(), HttpError>(())
        }
        .await;
        match sent {
            Ok(()) => {}
            Err(HttpError::UnexpectedEof) => return Ok(cancelled(&url)),
            Err(HttpError::Io(err)) => {
                return self.fail(client, &decision, UpstreamError::Io(err)).await
            }
            Err(err) => return self.reject(client, &decision, err).await,
        }

        let response_timeout = self.settings.response_timeout;
        let read_head = tokio::time::timeout(
            response_timeout,
            wire::read_response_head(&mut upstream),
        );
        let response = match unless_client_hangs_up(client, read_head).await {
            None => return Ok(cancelled(&url)),
            Some(Err(_)) => {
                let err = UpstreamError::Timeout {
                    phase: "response",
                    after: response_timeout,
                };
                return self.fail(client, &decision, err).await;
            }
            Some(Ok(Err(err))) => {
                let err = UpstreamError::Protocol(err.to_string());
                return self.fail(client, &decision, err).await;
            }
            Some(Ok(Ok(response))) => response,
        };
        let response_body = match response.body_kind(&head.method) {
            Ok(kind) => kind,
            Err(err) => {
                let err = UpstreamError::Protocol(err.to_string());
                return self.fail(client, &decision, err).await;
            }
        };

        let reusable = keep_alive && response_body != BodyKind::UntilEof;
        let relayed = async {
            wire::write_client_response_head(client.get_mut(), &response, &decision.headers, reusable)
                .await?;
            let bytes = wire::relay_body(
                &mut upstream,
                client.get_mut(),
                response_body,
                None,
                response_timeout,
            )
            .await?;
            client.get_mut().flush().await?;
            Ok::<u64, HttpError>(bytes)
        }
        .await;

        let bytes = match relayed {
            Ok(bytes) => bytes,
            Err(err) if client_gone(&err) => return Ok(cancelled(&url)),
            Err(HttpError::Idle(after)) => {
                let err = UpstreamError::Timeout {
                    phase: "response body",
                    after,
                };
                tracing::warn!("Relaying response for {} failed: {}", url, err);
                self.stats.record_failed();
                return Ok(RequestOutcome::last(RequestState::Failed));
            }
            Err(err) => {
                // Head already sent; the only thing left is to drop the connection.
                tracing::warn!("Relaying response for {} failed: {}", url, err);
                self.stats.record_failed();
                return Ok(RequestOutcome::last(RequestState::Failed));
            }
        };

        self.stats.record_completed();
        tracing::debug!(
            state = ?RequestState::Completed,
            status = response.status,
            bytes,
            "{}",
            url
        );
        self.record_visit(&url).await;

        Ok(RequestOutcome {
            state: RequestState::Completed,
            reusable,
        })
    }

    async fn handle_connect<S>(
        &self,
        mut client: BufReader<S>,
        head: RequestHead,
    ) -> anyhow::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        self.stats.record_request();
        let authority = head.target.authority();
        let decision = self.interceptor.evaluate(&head.target.host);

        if decision.is_blocked() {
            respond_blocked(client.get_mut(), &head.target.host, &decision, false).await?;
            return Ok(());
        }

        let mut upstream = match self.open_upstream(&mut client, &head.target).await {
            Ok(Some(stream)) => stream,
            Ok(None) => {
                cancelled(&authority);
                return Ok(());
            }
            Err(err) => {
                self.fail(&mut client, &decision, err).await?;
                return Ok(());
            }
        };

        let mut established = String::from("HTTP/1.1 200 Connection Established\r\n");
        for (name, value) in &decision.headers {
            established.push_str(&format!("{name}: {value}\r\n"));
        }
        established.push_str("\r\n");
        client.get_mut().write_all(established.as_bytes()).await?;
        client.get_mut().flush().await?;

        self.stats.record_completed();
        self.record_visit(&head.target.normalized_url()).await;

        // Anything the client sent early is still sitting in the buffer.
        let pending = client.buffer().to_vec();
        let mut client = client.into_inner();
        if !pending.is_empty() {
            upstream.write_all(&pending).await?;
        }

        match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
            Ok((sent, received)) => tracing::debug!(
                "Tunnel to {} closed ({} bytes sent, {} bytes received)",
                authority,
                sent,
                received
            ),
            Err(e) => tracing::debug!("Tunnel to {} ended: {}", authority, e),
        }
        Ok(())
    }

    /// Connect upstream within the connect timeout. `Ok(None)` means the
    /// client hung up while we were waiting.
    async fn open_upstream<S>(
        &self,
        client: &mut BufReader<S>,
        target: &RequestTarget,
    ) -> Result<Option<UpstreamStream>, UpstreamError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let connect_timeout = self.settings.connect_timeout;
        let connect = tokio::time::timeout(
            connect_timeout,
            self.connector.connect(&target.host, target.port),
        );
        match unless_client_hangs_up(client, connect).await {
            None => Ok(None),
            Some(Err(_)) => Err(UpstreamError::Timeout {
                phase: "connect",
                after: connect_timeout,
            }),
            Some(Ok(Err(source))) => Err(UpstreamError::Connect {
                authority: target.authority(),
                source,
            }),
            Some(Ok(Ok(stream))) => Ok(Some(stream)),
        }
    }

    async fn record_visit(&self, url: &str) {
        if let Err(err) = self.history.append(url).await {
            tracing::warn!("Failed to record visit to {}: {}", url, err);
            self.stats.record_history_failure(err.to_string());
        }
    }

    async fn fail<S>(
        &self,
        client: &mut BufReader<S>,
        decision: &InterceptDecision,
        err: UpstreamError,
    ) -> anyhow::Result<RequestOutcome>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        tracing::warn!(state = ?RequestState::Failed, "{err}");
        self.stats.record_failed();
        let _ = wire::respond_with_status(
            client.get_mut(),
            err.status(),
            &decision.headers,
            "text/plain",
            &format!("{err}\n"),
            false,
        )
        .await;
        Ok(RequestOutcome::last(RequestState::Failed))
    }

    async fn reject<S>(
        &self,
        client: &mut BufReader<S>,
        decision: &InterceptDecision,
        err: HttpError,
    ) -> anyhow::Result<RequestOutcome>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        tracing::warn!(state = ?RequestState::Failed, "Rejecting request: {err}");
        self.stats.record_failed();
        let _ = wire::respond_with_status(
            client.get_mut(),
            err.status(),
            &decision.headers,
            "text/plain",
            &format!("{err}\n"),
            false,
        )
        .await;
        Ok(RequestOutcome::last(RequestState::Failed))
    }
}

async fn respond_blocked<W>(
    writer: &mut W,
    host: &str,
    decision: &InterceptDecision,
    keep_alive: bool,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut headers = decision.headers.clone();
    headers.push((BLOCKED_BY_HEADER, "quietproxy"));
    wire::respond_with_status(
        writer,
        StatusCode::FORBIDDEN,
        &headers,
        "text/plain; charset=utf-8",
        &format!("Blocked by quietproxy: {host}\n"),
        keep_alive,
    )
    .await
}

fn cancelled(what: &str) -> RequestOutcome {
    tracing::debug!(state = ?RequestState::Cancelled, "Client went away: {}", what);
    RequestOutcome::last(RequestState::Cancelled)
}

/// Drive `fut` while watching the client for a hang-up. Returns `None` if
/// the client connection failed first. A half-close is not a hang-up: the
/// client may still be waiting for the response.
async fn unless_client_hangs_up<C, F>(client: &mut C, fut: F) -> Option<F::Output>
where
    C: AsyncBufRead + Unpin,
    F: Future,
{
    tokio::pin!(fut);
    tokio::select! {
        out = &mut fut => return Some(out),
        closed = client_closed(client) => {
            if closed {
                return None;
            }
        }
    }
    // Pipelined data stays buffered for the next request.
    Some(fut.await)
}

async fn client_closed<C>(client: &mut C) -> bool
where
    C: AsyncBufRead + Unpin,
{
    client.fill_buf().await.is_err()
}

/// Pause after a failed `accept`. Running out of descriptors is the usual
/// cause and retrying at once would spin.
pub(crate) const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

pub(crate) async fn back_off_after_accept_error(listener: &str, err: &io::Error) {
    tracing::error!("{} accept error: {}", listener, err);
    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
}

fn client_gone(err: &HttpError) -> bool {
    matches!(
        err,
        HttpError::Io(e) if matches!(
            e.kind(),
            io::ErrorKind::BrokenPipe
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
        )
    )
}

fn log_connection_error(e: &anyhow::Error) {
    // Clients dropping connections mid-write is routine for a browser proxy.
    let err_str = e.to_string().to_lowercase();
    if err_str.contains("broken pipe")
        || err_str.contains("connection reset")
        || err_str.contains("connection closed")
        || err_str.contains("eof")
    {
        tracing::debug!("Connection closed by client: {}", e);
    } else {
        tracing::error!("Error handling connection: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::BlocklistIndex;
    use crate::storage::DurableLog;
    use futures::future::BoxFuture;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use tokio::io::{duplex, AsyncReadExt, DuplexStream};

    const HOSTS: &str = "0.0.0.0 ads.example.com\n0.0.0.0 tracker.example.net\n";

    /// Origin that records the forwarded request and answers with a
    /// canned response.
    struct ScriptedUpstream {
        response: &'static [u8],
        requests: Arc<Mutex<Vec<String>>>,
    }

    impl ScriptedUpstream {
        fn new(response: &'static [u8]) -> Arc<Self> {
            Arc::new(Self {
                response,
                requests: Arc::new(Mutex::new(Vec::new())),
            })
        }

        fn requests(&self) -> Vec<String> {
            self.requests.lock().unwrap().clone()
        }
    }

    impl UpstreamConnector for ScriptedUpstream {
        fn connect(&self, host: &str, port: u16) -> BoxFuture<'static, io::Result<UpstreamStream>> {
            let (proxy_side, mut origin) = duplex(64 * 1024);
            let response = self.response;
            let requests = self.requests.clone();
            let authority = format!("{host}:{port}");
            tokio::spawn(async move {
                let request = read_message(&mut origin).await;
                requests.lock().unwrap().push(format!("{authority} {request}"));
                let _ = origin.write_all(response).await;
            });
            async move { Ok(Box::new(proxy_side) as UpstreamStream) }.boxed()
        }
    }

    /// Origin that accepts the request and never answers.
    struct StalledUpstream;

    impl UpstreamConnector for StalledUpstream {
        fn connect(&self, _host: &str, _port: u16) -> BoxFuture<'static, io::Result<UpstreamStream>> {
            let (proxy_side, mut origin) = duplex(64 * 1024);
            tokio::spawn(async move {
                let _ = read_message(&mut origin).await;
                tokio::time::sleep(Duration::from_secs(30)).await;
            });
            async move { Ok(Box::new(proxy_side) as UpstreamStream) }.boxed()
        }
    }

    /// Origin that sends a response head and part of the body, then stalls.
    struct StallingBodyUpstream;

    impl UpstreamConnector for StallingBodyUpstream {
        fn connect(&self, _host: &str, _port: u16) -> BoxFuture<'static, io::Result<UpstreamStream>> {
            let (proxy_side, mut origin) = duplex(64 * 1024);
            tokio::spawn(async move {
                let _ = read_message(&mut origin).await;
                let _ = origin
                    .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nab")
                    .await;
                tokio::time::sleep(Duration::from_secs(30)).await;
            });
            async move { Ok(Box::new(proxy_side) as UpstreamStream) }.boxed()
        }
    }

    struct RefusingUpstream;

    impl UpstreamConnector for RefusingUpstream {
        fn connect(&self, _host: &str, _port: u16) -> BoxFuture<'static, io::Result<UpstreamStream>> {
            async { Err(io::Error::from(io::ErrorKind::ConnectionRefused)) }.boxed()
        }
    }

    struct UnreachableUpstream;

    impl UpstreamConnector for UnreachableUpstream {
        fn connect(&self, _host: &str, _port: u16) -> BoxFuture<'static, io::Result<UpstreamStream>> {
            futures::future::pending().boxed()
        }
    }

    /// Origin that echoes bytes back, for tunnels.
    struct EchoUpstream;

    impl UpstreamConnector for EchoUpstream {
        fn connect(&self, _host: &str, _port: u16) -> BoxFuture<'static, io::Result<UpstreamStream>> {
            let (proxy_side, origin) = duplex(64 * 1024);
            tokio::spawn(async move {
                let (mut reader, mut writer) = tokio::io::split(origin);
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
            async move { Ok(Box::new(proxy_side) as UpstreamStream) }.boxed()
        }
    }

    #[derive(Clone, Default)]
    struct MemoryLog {
        fail_next: Arc<AtomicBool>,
    }

    impl DurableLog for MemoryLog {
        fn append_line(&mut self, _line: &str) -> io::Result<()> {
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(io::Error::other("no space left on device"));
            }
            Ok(())
        }
    }

    struct Harness {
        server: ProxyServer,
        interceptor: Arc<RequestInterceptor>,
        history: Arc<HistoryStore>,
        stats: Arc<ProxyStats>,
        log: MemoryLog,
    }

    fn harness(connector: Arc<dyn UpstreamConnector>) -> Harness {
        harness_with(connector, ServerSettings::default())
    }

    fn harness_with(connector: Arc<dyn UpstreamConnector>, settings: ServerSettings) -> Harness {
        let stats = Arc::new(ProxyStats::new());
        let blocklist = Arc::new(BlocklistIndex::from_text(HOSTS));
        let interceptor = Arc::new(RequestInterceptor::new(blocklist, true, stats.clone()));
        let log = MemoryLog::default();
        let history = Arc::new(HistoryStore::with_log(Vec::new(), Box::new(log.clone())));
        let server = ProxyServer::new(
            interceptor.clone(),
            history.clone(),
            stats.clone(),
            connector,
            settings,
        );
        Harness {
            server,
            interceptor,
            history,
            stats,
            log,
        }
    }

    fn spawn_connection(
        server: &ProxyServer,
    ) -> (BufReader<DuplexStream>, tokio::task::JoinHandle<anyhow::Result<()>>) {
        let (client, server_side) = duplex(64 * 1024);
        let server = server.clone();
        let task = tokio::spawn(async move { server.handle_connection(server_side).await });
        (BufReader::new(client), task)
    }

    /// Read one head plus a content-length body.
    async fn read_message<R>(stream: &mut R) -> String
    where
        R: AsyncRead + Unpin,
    {
        let mut reader = BufReader::new(stream);
        let mut text = String::new();
        loop {
            let mut line = String::new();
            if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
                return text;
            }
            text.push_str(&line);
            if line == "\r\n" {
                break;
            }
        }
        let len = text
            .lines()
            .filter_map(|l| l.split_once(':'))
            .find(|(k, _)| k.trim().eq_ignore_ascii_case("content-length"))
            .and_then(|(_, v)| v.trim().parse::<usize>().ok())
            .unwrap_or(0);
        let mut body = vec![0u8; len];
        if reader.read_exact(&mut body).await.is_ok() {
            text.push_str(&String::from_utf8_lossy(&body));
        }
        text
    }

    fn history_urls(history: &HistoryStore) -> Vec<String> {
        history.load_all().into_iter().map(|r| r.url).collect()
    }

    #[tokio::test]
    async fn blocked_host_gets_refusal_with_privacy_header() {
        let upstream = ScriptedUpstream::new(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n");
        let h = harness(upstream.clone());
        let (mut client, task) = spawn_connection(&h.server);

        client
            .get_mut()
            .write_all(b"GET http://ads.example.com/banner.js HTTP/1.1\r\nHost: ads.example.com\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let response = read_message(&mut client).await;
        task.await.unwrap().unwrap();

        assert!(response.starts_with("HTTP/1.1 403 Forbidden"), "{response}");
        assert!(response.contains("DNT: 1\r\n"));
        assert!(response.contains("X-Blocked-By: quietproxy\r\n"));
        assert!(response.contains("Blocked by quietproxy: ads.example.com"));
        assert!(upstream.requests().is_empty());
        assert!(h.history.is_empty());
        assert_eq!(h.stats.snapshot().blocked_requests, 1);
    }

    #[tokio::test]
    async fn allowed_request_is_forwarded_and_recorded() {
        let upstream =
            ScriptedUpstream::new(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nDNT: 0\r\n\r\nHELLO");
        let h = harness(upstream.clone());
        let (mut client, task) = spawn_connection(&h.server);

        client
            .get_mut()
            .write_all(b"GET http://news.example.com/today HTTP/1.1\r\nHost: news.example.com\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let response = read_message(&mut client).await;
        task.await.unwrap().unwrap();

        assert!(response.starts_with("HTTP/1.1 200 OK"), "{response}");
        assert!(response.contains("DNT: 1\r\n"));
        assert!(!response.contains("DNT: 0"));
        assert!(response.ends_with("HELLO"));

        let requests = upstream.requests();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].starts_with("news.example.com:80 GET /today HTTP/1.1\r\n"));
        assert!(requests[0].contains("DNT: 1\r\n"));

        assert_eq!(history_urls(&h.history), vec!["http://news.example.com/today"]);
        assert_eq!(h.stats.snapshot().completed_requests, 1);
    }

    #[tokio::test]
    async fn disabling_blocking_lets_listed_hosts_through() {
        let upstream = ScriptedUpstream::new(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nOK");
        let h = harness(upstream.clone());
        h.interceptor.set_active(false);
        let (mut client, task) = spawn_connection(&h.server);

        client
            .get_mut()
            .write_all(b"GET http://ads.example.com/ HTTP/1.1\r\nHost: ads.example.com\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let response = read_message(&mut client).await;
        task.await.unwrap().unwrap();

        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.contains("DNT: 1\r\n"));
        assert_eq!(upstream.requests().len(), 1);
        assert_eq!(history_urls(&h.history), vec!["http://ads.example.com/"]);
    }

    #[tokio::test]
    async fn private_mode_serves_but_does_not_record() {
        let upstream = ScriptedUpstream::new(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nOK");
        let h = harness(upstream);
        h.history.set_private_mode(true);
        let (mut client, task) = spawn_connection(&h.server);

        client
            .get_mut()
            .write_all(b"GET http://shop.example.com/cart HTTP/1.1\r\nHost: shop.example.com\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let response = read_message(&mut client).await;
        task.await.unwrap().unwrap();

        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(h.history.is_empty());
        assert_eq!(h.stats.snapshot().history_failures, 0);
    }

    #[tokio::test]
    async fn history_failure_does_not_fail_the_request() {
        let upstream = ScriptedUpstream::new(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nOK");
        let h = harness(upstream);
        h.log.fail_next.store(true, Ordering::SeqCst);

        for path in ["/first", "/second"] {
            let (mut client, task) = spawn_connection(&h.server);
            let request = format!(
                "GET http://news.example.com{path} HTTP/1.1\r\nHost: news.example.com\r\nConnection: close\r\n\r\n"
            );
            client.get_mut().write_all(request.as_bytes()).await.unwrap();
            let response = read_message(&mut client).await;
            task.await.unwrap().unwrap();
            assert!(response.starts_with("HTTP/1.1 200 OK"));
        }

        assert_eq!(history_urls(&h.history), vec!["http://news.example.com/second"]);
        let snap = h.stats.snapshot();
        assert_eq!(snap.history_failures, 1);
        assert!(snap
            .last_history_error
            .unwrap()
            .contains("no space left on device"));
    }

    #[tokio::test]
    async fn refused_upstream_is_bad_gateway() {
        let h = harness(Arc::new(RefusingUpstream));
        let (mut client, task) = spawn_connection(&h.server);

        client
            .get_mut()
            .write_all(b"GET http://down.example.com/ HTTP/1.1\r\nHost: down.example.com\r\n\r\n")
            .await
            .unwrap();
        let response = read_message(&mut client).await;
        task.await.unwrap().unwrap();

        assert!(response.starts_with("HTTP/1.1 502 Bad Gateway"), "{response}");
        assert!(response.contains("DNT: 1\r\n"));
        assert!(h.history.is_empty());
        assert_eq!(h.stats.snapshot().failed_requests, 1);
    }

    #[tokio::test]
    async fn connect_timeout_is_gateway_timeout() {
        let settings = ServerSettings {
            connect_timeout: Duration::from_millis(50),
            ..ServerSettings::default()
        };
        let h = harness_with(Arc::new(UnreachableUpstream), settings);
        let (mut client, task) = spawn_connection(&h.server);

        client
            .get_mut()
            .write_all(b"GET http://slow.example.com/ HTTP/1.1\r\nHost: slow.example.com\r\n\r\n")
            .await
            .unwrap();
        let response = read_message(&mut client).await;
        task.await.unwrap().unwrap();

        assert!(response.starts_with("HTTP/1.1 504 Gateway Timeout"), "{response}");
        assert!(response.contains("DNT: 1\r\n"));
        assert!(h.history.is_empty());
    }

    #[tokio::test]
    async fn response_timeout_is_gateway_timeout() {
        let settings = ServerSettings {
            response_timeout: Duration::from_millis(50),
            ..ServerSettings::default()
        };
        let h = harness_with(Arc::new(StalledUpstream), settings);
        let (mut client, task) = spawn_connection(&h.server);

        client
            .get_mut()
            .write_all(b"GET http://slow.example.com/ HTTP/1.1\r\nHost: slow.example.com\r\n\r\n")
            .await
            .unwrap();
        let response = read_message(&mut client).await;
        task.await.unwrap().unwrap();

        assert!(response.starts_with("HTTP/1.1 504 Gateway Timeout"), "{response}");
        assert!(h.history.is_empty());
    }

    #[tokio::test]
    async fn client_hangup_skips_history() {
        let settings = ServerSettings {
            response_timeout: Duration::from_millis(100),
            ..ServerSettings::default()
        };
        let h = harness_with(Arc::new(StalledUpstream), settings);
        let (mut client, task) = spawn_connection(&h.server);

        client
            .get_mut()
            .write_all(b"GET http://news.example.com/ HTTP/1.1\r\nHost: news.example.com\r\n\r\n")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(client);

        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("connection task ends after hang-up")
            .unwrap()
            .unwrap();
        assert!(h.history.is_empty());
        assert_eq!(h.stats.snapshot().completed_requests, 0);
    }

    #[tokio::test]
    async fn half_closed_client_still_gets_response() {
        let upstream = ScriptedUpstream::new(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nOK");
        let h = harness(upstream.clone());
        let (mut client, task) = spawn_connection(&h.server);

        client
            .get_mut()
            .write_all(b"GET http://news.example.com/ HTTP/1.0\r\nHost: news.example.com\r\n\r\n")
            .await
            .unwrap();
        client.get_mut().shutdown().await.unwrap();

        let mut response = String::new();
        tokio::time::timeout(Duration::from_secs(5), client.read_to_string(&mut response))
            .await
            .expect("response arrives after half-close")
            .unwrap();
        task.await.unwrap().unwrap();

        assert!(response.starts_with("HTTP/1.1 200 OK"), "{response}");
        assert!(response.ends_with("\r\n\r\nOK"));
        assert_eq!(history_urls(&h.history), vec!["http://news.example.com/"]);
        assert_eq!(h.stats.snapshot().completed_requests, 1);
    }

    #[tokio::test]
    async fn stalled_response_body_ends_as_failed() {
        let settings = ServerSettings {
            response_timeout: Duration::from_millis(50),
            ..ServerSettings::default()
        };
        let h = harness_with(Arc::new(StallingBodyUpstream), settings);
        let (mut client, task) = spawn_connection(&h.server);

        client
            .get_mut()
            .write_all(b"GET http://news.example.com/big HTTP/1.1\r\nHost: news.example.com\r\n\r\n")
            .await
            .unwrap();
        let mut response = Vec::new();
        tokio::time::timeout(Duration::from_secs(3), client.read_to_end(&mut response))
            .await
            .expect("proxy drops the connection once the body stalls")
            .unwrap();
        tokio::time::timeout(Duration::from_secs(3), task)
            .await
            .expect("connection task ends")
            .unwrap()
            .unwrap();

        let response = String::from_utf8(response).unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK"), "{response}");
        assert!(response.ends_with("\r\n\r\nab"));
        assert!(h.history.is_empty());
        let snap = h.stats.snapshot();
        assert_eq!(snap.failed_requests, 1);
        assert_eq!(snap.completed_requests, 0);
    }

    #[tokio::test]
    async fn hangup_during_stalled_body_releases_connection() {
        let settings = ServerSettings {
            response_timeout: Duration::from_millis(50),
            ..ServerSettings::default()
        };
        let h = harness_with(Arc::new(StallingBodyUpstream), settings);
        let (mut client, task) = spawn_connection(&h.server);

        client
            .get_mut()
            .write_all(b"GET http://news.example.com/big HTTP/1.1\r\nHost: news.example.com\r\n\r\n")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(client);

        tokio::time::timeout(Duration::from_secs(3), task)
            .await
            .expect("connection task ends after hang-up")
            .unwrap()
            .unwrap();
        assert!(h.history.is_empty());
        assert_eq!(h.stats.snapshot().completed_requests, 0);
    }

    #[tokio::test]
    async fn stalled_upload_is_rejected_with_408() {
        let upstream = ScriptedUpstream::new(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n");
        let settings = ServerSettings {
            response_timeout: Duration::from_millis(50),
            ..ServerSettings::default()
        };
        let h = harness_with(upstream, settings);
        let (mut client, task) = spawn_connection(&h.server);

        client
            .get_mut()
            .write_all(b"POST http://news.example.com/upload HTTP/1.1\r\nHost: news.example.com\r\nContent-Length: 10\r\n\r\nab")
            .await
            .unwrap();
        let response = tokio::time::timeout(Duration::from_secs(3), read_message(&mut client))
            .await
            .expect("proxy answers a stalled upload");
        tokio::time::timeout(Duration::from_secs(3), task)
            .await
            .expect("connection task ends")
            .unwrap()
            .unwrap();

        assert!(response.starts_with("HTTP/1.1 408 Request Timeout"), "{response}");
        assert!(response.contains("DNT: 1\r\n"));
        assert!(h.history.is_empty());
        assert_eq!(h.stats.snapshot().failed_requests, 1);
    }

    #[tokio::test]
    async fn accept_errors_back_off() {
        let started = std::time::Instant::now();
        back_off_after_accept_error("Proxy", &io::Error::from(io::ErrorKind::OutOfMemory)).await;
        assert!(started.elapsed() >= ACCEPT_ERROR_BACKOFF);
    }

    #[tokio::test]
    async fn keep_alive_serves_consecutive_requests() {
        let upstream = ScriptedUpstream::new(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nOK");
        let h = harness(upstream.clone());
        let (mut client, task) = spawn_connection(&h.server);

        client
            .get_mut()
            .write_all(b"GET http://news.example.com/1 HTTP/1.1\r\nHost: news.example.com\r\n\r\n")
            .await
            .unwrap();
        let first = read_message(&mut client).await;
        assert!(first.contains("Connection: keep-alive\r\n"));

        client
            .get_mut()
            .write_all(b"GET http://ads.example.com/2 HTTP/1.1\r\nHost: ads.example.com\r\n\r\n")
            .await
            .unwrap();
        let second = read_message(&mut client).await;
        assert!(second.starts_with("HTTP/1.1 403 Forbidden"));

        client
            .get_mut()
            .write_all(b"GET http://news.example.com/3 HTTP/1.1\r\nHost: news.example.com\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let third = read_message(&mut client).await;
        assert!(third.contains("Connection: close\r\n"));
        task.await.unwrap().unwrap();

        assert_eq!(upstream.requests().len(), 2);
        assert_eq!(
            history_urls(&h.history),
            vec!["http://news.example.com/1", "http://news.example.com/3"]
        );
    }

    #[tokio::test]
    async fn request_body_is_forwarded() {
        let upstream = ScriptedUpstream::new(b"HTTP/1.1 201 Created\r\nContent-Length: 0\r\n\r\n");
        let h = harness(upstream.clone());
        let (mut client, task) = spawn_connection(&h.server);

        client
            .get_mut()
            .write_all(b"POST http://api.example.com/items HTTP/1.1\r\nHost: api.example.com\r\nContent-Length: 7\r\nConnection: close\r\n\r\n{\"a\":1}")
            .await
            .unwrap();
        let response = read_message(&mut client).await;
        task.await.unwrap().unwrap();

        assert!(response.starts_with("HTTP/1.1 201 Created"));
        let requests = upstream.requests();
        assert!(requests[0].contains("POST /items HTTP/1.1"));
        assert!(requests[0].ends_with("{\"a\":1}"));
    }

    #[tokio::test]
    async fn oversized_body_is_rejected_before_connecting() {
        let upstream = ScriptedUpstream::new(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n");
        let settings = ServerSettings {
            max_request_body_bytes: 4,
            ..ServerSettings::default()
        };
        let h = harness_with(upstream.clone(), settings);
        let (mut client, task) = spawn_connection(&h.server);

        client
            .get_mut()
            .write_all(b"POST http://api.example.com/ HTTP/1.1\r\nHost: api.example.com\r\nContent-Length: 10\r\n\r\n0123456789")
            .await
            .unwrap();
        let response = read_message(&mut client).await;
        task.await.unwrap().unwrap();

        assert!(response.starts_with("HTTP/1.1 413 Payload Too Large"), "{response}");
        assert!(upstream.requests().is_empty());
    }

    #[tokio::test]
    async fn chunked_response_is_relayed() {
        let upstream = ScriptedUpstream::new(
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nRust\r\n6\r\nProxy!\r\n0\r\n\r\n",
        );
        let h = harness(upstream);
        let (mut client, task) = spawn_connection(&h.server);

        client
            .get_mut()
            .write_all(b"GET http://news.example.com/stream HTTP/1.1\r\nHost: news.example.com\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        client.read_to_string(&mut response).await.unwrap();
        task.await.unwrap().unwrap();

        assert!(response.contains("Transfer-Encoding: chunked\r\n"));
        assert!(response.ends_with("4\r\nRust\r\n6\r\nProxy!\r\n0\r\n\r\n"));
        assert_eq!(history_urls(&h.history), vec!["http://news.example.com/stream"]);
    }

    #[tokio::test]
    async fn response_without_length_is_read_to_eof() {
        let upstream = ScriptedUpstream::new(b"HTTP/1.0 200 OK\r\n\r\nstreamed until close");
        let h = harness(upstream);
        let (mut client, task) = spawn_connection(&h.server);

        client
            .get_mut()
            .write_all(b"GET http://news.example.com/ HTTP/1.1\r\nHost: news.example.com\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        client.read_to_string(&mut response).await.unwrap();
        task.await.unwrap().unwrap();

        assert!(response.contains("Connection: close\r\n"));
        assert!(response.ends_with("streamed until close"));
    }

    #[tokio::test]
    async fn blocked_connect_is_refused() {
        let h = harness(Arc::new(EchoUpstream));
        let (mut client, task) = spawn_connection(&h.server);

        client
            .get_mut()
            .write_all(b"CONNECT tracker.example.net:443 HTTP/1.1\r\nHost: tracker.example.net:443\r\n\r\n")
            .await
            .unwrap();
        let response = read_message(&mut client).await;
        task.await.unwrap().unwrap();

        assert!(response.starts_with("HTTP/1.1 403 Forbidden"));
        assert!(response.contains("DNT: 1\r\n"));
        assert!(h.history.is_empty());
    }

    #[tokio::test]
    async fn allowed_connect_tunnels_bytes() {
        let h = harness(Arc::new(EchoUpstream));
        let (mut client, task) = spawn_connection(&h.server);

        client
            .get_mut()
            .write_all(b"CONNECT secure.example.com:443 HTTP/1.1\r\nHost: secure.example.com:443\r\n\r\n")
            .await
            .unwrap();
        let established = read_message(&mut client).await;
        assert!(established.starts_with("HTTP/1.1 200 Connection Established\r\n"));
        assert!(established.contains("DNT: 1\r\n"));

        client.get_mut().write_all(b"opaque tls bytes").await.unwrap();
        let mut echoed = [0u8; 16];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"opaque tls bytes");

        drop(client);
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(history_urls(&h.history), vec!["https://secure.example.com/"]);
    }

    #[tokio::test]
    async fn malformed_request_gets_bad_request() {
        let h = harness(Arc::new(RefusingUpstream));
        let (mut client, task) = spawn_connection(&h.server);

        client
            .get_mut()
            .write_all(b"GET /no-host HTTP/1.1\r\n\r\n")
            .await
            .unwrap();
        let response = read_message(&mut client).await;
        task.await.unwrap().unwrap();

        assert!(response.starts_with("HTTP/1.1 400 Bad Request"), "{response}");
        assert!(response.contains("DNT: 1\r\n"));
    }
}
