//! The per-connection protocol engine

use crate::errors::HttpError;
use crate::files::mime::MimeLookup;
use crate::http::headers::{HeaderCase, HeaderCollection};
use crate::http::query::ParamMap;
use crate::http::request::{self, BodyFraming, Request};
use crate::http::response::{Handled, Response};
use crate::http::types::Method;
use crate::io::body::{RequestBody, ResponseBody};
use crate::io::compress::{negotiate, Compression};
use crate::io::recv::RecvBuffer;
use crate::limits::{ConnLimits, FileLimits, ProxyHeaderConfig, ReqLimits, RespLimits};
use crate::server::counters::ServerCounters;
use crate::server::server_impl::{Handler, ProxyTrust};
use crate::server::websocket;
use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::{split, AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf};
use tokio::sync::watch;
use url::Url;

/// The byte-stream capability a connection engine runs over: the TCP socket,
/// a TLS session, or an in-memory pipe in tests.
pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> Stream for T {}

/// The reader half of the connection as the engine sees it.
pub type EngineReader<S> = RecvBuffer<ReadHalf<S>>;

/// Where a connection currently is in its life cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Accepted,
    TlsPeek,
    TlsAcme,
    TlsHandshake,
    Reading,
    Dispatched,
    Writing,
    Draining,
    Erroring,
    Done,
}

/// Immutable facts about one accepted connection.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: u64,
    pub remote_addr: SocketAddr,
    pub local_addr: SocketAddr,
    /// Whether the transport is TLS.
    pub secure: bool,
}

/// Cooperative cancellation signal, honored at every suspension point of the
/// engine (reads, writes, flushes).
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self {
            tx: Arc::new(watch::channel(false).0),
        }
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                // the token itself holds the sender, so this cannot happen;
                // park forever rather than spuriously cancel
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Runs `fut` under a deadline and the engine's cancellation signal.
pub(crate) async fn timed<F: Future>(
    duration: Duration,
    cancel: &CancelToken,
    fut: F,
) -> Result<F::Output, HttpError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(HttpError::Cancelled),
        out = tokio::time::timeout(duration, fut) => out.map_err(|_| {
            HttpError::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                "socket operation timed out",
            ))
        }),
    }
}

/// Everything the engine needs besides the socket, shared across connections.
pub(crate) struct EngineConfig {
    pub conn: ConnLimits,
    pub req: ReqLimits,
    pub resp: RespLimits,
    pub file: FileLimits,
    pub proxy: ProxyHeaderConfig,
    pub app_path: Option<String>,
    pub trust: Arc<dyn ProxyTrust>,
    pub mime: Arc<dyn MimeLookup>,
    pub max_connections: usize,
}

/// The raw duplex stream handed back to the caller after a WebSocket
/// upgrade. Serves bytes that arrived buffered with the handshake before
/// touching the socket again.
pub struct Upgraded<S: Stream> {
    reader: EngineReader<S>,
    writer: WriteHalf<S>,
}

impl<S: Stream> AsyncRead for Upgraded<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().reader).poll_read(cx, buf)
    }
}

impl<S: Stream> AsyncWrite for Upgraded<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().writer).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().writer).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().writer).poll_shutdown(cx)
    }
}

enum CycleEnd {
    KeepAlive,
    Close,
}

/// One protocol engine, created per accepted connection, driving it through
/// request/response cycles until the peer leaves, a limit trips, or an error
/// makes the stream unusable.
///
/// Handlers receive an exclusive loan of the engine for the duration of one
/// cycle and interact with it through [`request`](Self::request_mut),
/// [`response`](Self::response_mut), the body-streaming methods, and
/// [`cancel_token`](Self::cancel_token).
pub struct HttpConnection<S: Stream> {
    pub(crate) info: ConnectionInfo,
    pub(crate) config: Arc<EngineConfig>,
    counters: Arc<ServerCounters>,
    cancel: CancelToken,

    base: Url,
    secure: bool,
    reader: Option<EngineReader<S>>,
    writer: Option<WriteHalf<S>>,
    body: Option<ResponseBody<WriteHalf<S>>>,

    pub(crate) request: Request<EngineReader<S>>,
    pub(crate) response: Response,
    pub(crate) negotiated_compression: Option<Compression>,

    state: EngineState,
    bytes_sent: bool,
    upgraded: bool,
    opened: Instant,
    served: usize,
}

impl<S: Stream> HttpConnection<S> {
    pub fn new(
        stream: S,
        info: ConnectionInfo,
        config: Arc<EngineConfig>,
        counters: Arc<ServerCounters>,
        cancel: CancelToken,
    ) -> Self {
        let (read_half, write_half) = split(stream);
        let scheme = if info.secure { "https" } else { "http" };
        let base = Url::parse(&format!("{scheme}://{}/", info.local_addr))
            .unwrap_or_else(|_| Url::parse("http://localhost/").expect("static url"));
        let secure = info.secure;
        let header_case = config.resp.header_case;

        Self {
            info,
            config,
            counters,
            cancel,
            base,
            secure,
            reader: Some(RecvBuffer::new(read_half)),
            writer: Some(write_half),
            body: None,
            request: Request::placeholder(),
            response: Response::new(header_case),
            negotiated_compression: None,
            state: EngineState::Accepted,
            bytes_sent: false,
            upgraded: false,
            opened: Instant::now(),
            served: 0,
        }
    }

    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn request(&self) -> &Request<EngineReader<S>> {
        &self.request
    }

    pub fn request_mut(&mut self) -> &mut Request<EngineReader<S>> {
        &mut self.request
    }

    pub fn response(&self) -> &Response {
        &self.response
    }

    pub fn response_mut(&mut self) -> &mut Response {
        &mut self.response
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// The compression negotiated from the request's `Accept-Encoding`.
    pub fn negotiated_compression(&self) -> Option<Compression> {
        self.negotiated_compression
    }

    fn set_state(&mut self, state: EngineState) {
        self.state = state;
        self.counters.set_state(self.info.id, state);
    }

    /// Drives the connection until it is done. Errors are mapped into
    /// best-effort error responses here; the caller only closes the socket.
    pub async fn run<H: Handler<S>>(&mut self, handler: &H) {
        loop {
            match self.cycle(handler).await {
                Ok(CycleEnd::KeepAlive) => continue,
                Ok(CycleEnd::Close) => break,
                Err(error) => {
                    if self.handle_cycle_error(error).await {
                        continue;
                    }
                    break;
                }
            }
        }
        self.finalize().await;
    }

    async fn cycle<H: Handler<S>>(&mut self, handler: &H) -> Result<CycleEnd, HttpError> {
        self.bytes_sent = false;
        self.upgraded = false;
        self.body = None;
        self.negotiated_compression = None;
        self.response = Response::new(self.config.resp.header_case);
        self.set_state(EngineState::Reading);

        if self.served >= self.config.conn.max_requests_per_connection
            || self.opened.elapsed() > self.config.conn.connection_lifetime
        {
            return Ok(CycleEnd::Close);
        }

        let Some(line) = self.read_head_line().await? else {
            // clean EOF while idle
            return Ok(CycleEnd::Close);
        };
        let started = Instant::now();
        let request_line = request::parse_request_line(&line)?;
        let request_line_text = format!(
            "{} {} {}",
            request_line.method_token, request_line.target, request_line.version
        );
        let headers = self.read_header_section().await?;

        let tokens = request::connection_tokens(&headers);
        let high_load = self.counters.high_load(self.config.max_connections);
        let framing = request::body_framing(request_line.method, &headers)?;
        self.negotiated_compression = negotiate(headers.get("Accept-Encoding").as_deref());

        let url = match request::resolve_target(&self.base, &request_line.target) {
            Ok(url) => url,
            Err(e) if request_line.method.is_some() => return Err(e),
            // a 501 answer does not need a usable target
            Err(_) => self.base.clone(),
        };
        let page = request::page_from_url(&url);
        let query = match url.query() {
            Some(raw) => ParamMap::parse(raw.as_bytes())?,
            None => ParamMap::new(),
        };
        let cookies = headers
            .get("Cookie")
            .map(|value| crate::http::cookies::CookieJar::parse(&value))
            .unwrap_or_default();
        let content_length = match framing {
            BodyFraming::Sized(n) => Some(n),
            _ => None,
        };

        self.request = Request {
            method: request_line.method.unwrap_or(Method::Get),
            protocol_version: request_line.version.clone(),
            url,
            page,
            headers,
            query,
            post_form: ParamMap::new(),
            cookies,
            connection_tokens: tokens.clone(),
            content_length,
            remote_ip: self.info.remote_addr.ip(),
            secure: self.secure,
            body: RequestBody::empty(),
        };
        self.attach_body(framing)?;
        self.counters.record_request(self.info.id);

        if request_line.method.is_none() {
            // Unknown method: the head is consumed and the framed body is
            // drained here, so the stream stays in sync and the catch point
            // can answer 501 without giving up the connection.
            self.set_state(EngineState::Draining);
            self.drain_request_body().await?;
            return Err(HttpError::NotImplementedMethod(request_line.method_token));
        }
        let method = self.request.method;

        self.trust_stage();
        self.response.compute_keep_alive(
            &self.request.protocol_version,
            &tokens,
            high_load,
            self.config.conn.keep_alive_seconds,
        );
        self.decode_form_body().await?;

        self.set_state(EngineState::Dispatched);
        let _handled: Handled = handler.handle(self).await?;

        self.set_state(EngineState::Writing);
        self.finish_response(method).await?;
        tracing::info!(
            target: "hearth_web::access",
            id = self.info.id,
            status = self.response.status_code(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "{request_line_text}"
        );

        self.set_state(EngineState::Draining);
        self.drain_request_body().await?;
        self.served += 1;

        Ok(self.cycle_end())
    }

    fn cycle_end(&self) -> CycleEnd {
        if self.upgraded
            || self.response.is_close_without_response()
            || self.response.effective_keep_alive() == 0
        {
            CycleEnd::Close
        } else {
            CycleEnd::KeepAlive
        }
    }

    async fn read_head_line(&mut self) -> Result<Option<Vec<u8>>, HttpError> {
        let read_timeout = self.config.conn.socket_read_timeout;
        let max = self.config.req.header_line_size;
        let Some(reader) = self.reader.as_mut() else {
            return Err(HttpError::Internal("connection reader unavailable".into()));
        };
        timed(read_timeout, &self.cancel, reader.read_line(max)).await?
    }

    async fn read_header_section(&mut self) -> Result<HeaderCollection, HttpError> {
        let headers = HeaderCollection::new(HeaderCase::Preserve);
        let mut count = 0usize;
        loop {
            let Some(line) = self.read_head_line().await? else {
                return Err(HttpError::ProtocolViolation(
                    "connection closed inside the header section".into(),
                ));
            };
            if line.is_empty() {
                return Ok(headers);
            }
            count += 1;
            if count > self.config.req.header_count {
                return Err(HttpError::RequestTooLarge("too many header lines"));
            }
            let (name, value) = request::parse_header_line(&line)?;
            headers.add(&name, &value)?;
        }
    }

    fn attach_body(&mut self, framing: BodyFraming) -> Result<(), HttpError> {
        match framing {
            BodyFraming::None | BodyFraming::Sized(0) => {
                self.request.body = RequestBody::empty();
            }
            BodyFraming::Sized(len) => {
                let reader = self
                    .reader
                    .take()
                    .ok_or_else(|| HttpError::Internal("connection reader unavailable".into()))?;
                self.request.body = RequestBody::sized(reader, len);
            }
            BodyFraming::Chunked => {
                let reader = self
                    .reader
                    .take()
                    .ok_or_else(|| HttpError::Internal("connection reader unavailable".into()))?;
                self.request.body = RequestBody::chunked(reader);
            }
        }
        Ok(())
    }

    /// The trusted-proxy stage: identity header rewrites for trusted peers,
    /// then application-path stripping.
    fn trust_stage(&mut self) {
        if self.config.trust.is_trusted_proxy(self.info.remote_addr.ip()) {
            let proxy = self.config.proxy;

            if proxy.x_real_ip {
                if let Some(value) = self.request.headers.get("X-Real-IP") {
                    if let Ok(ip) = value.trim().parse::<IpAddr>() {
                        self.request.remote_ip = ip;
                    }
                }
            }

            if proxy.x_forwarded_for {
                if let Some(value) = self.request.headers.get("X-Forwarded-For") {
                    if let Some(leftmost) = value.split(',').next() {
                        if let Ok(ip) = leftmost.trim().parse::<IpAddr>() {
                            self.request.remote_ip = ip;
                        }
                    }
                }
            }

            if proxy.x_forwarded_proto {
                if let Some(value) = self.request.headers.get("X-Forwarded-Proto") {
                    let https = value.trim().eq_ignore_ascii_case("https");
                    self.secure = https;
                    self.request.secure = https;
                    let _ = self
                        .base
                        .set_scheme(if https { "https" } else { "http" });
                }
            }
        }

        if let Some(app_path) = &self.config.app_path {
            if let Some(stripped) = request::strip_app_path(&self.request.page, app_path) {
                self.request.page = stripped;
            }
        }
    }

    /// Eagerly decodes `application/x-www-form-urlencoded` bodies into the
    /// form map, leaving a replayable in-memory body behind.
    async fn decode_form_body(&mut self) -> Result<(), HttpError> {
        let is_form = self
            .request
            .headers
            .get("Content-Type")
            .is_some_and(|ct| ct.to_ascii_lowercase().contains("application/x-www-form-urlencoded"));
        if !is_form || !self.request.body.is_stream() {
            return Ok(());
        }

        let cap = self.config.req.form_body_size;
        let read_timeout = self.config.conn.socket_read_timeout;
        let mut bytes = Vec::new();
        let mut buf = [0u8; 8 * 1024];
        loop {
            let n = timed(read_timeout, &self.cancel, self.request.body.read(&mut buf)).await??;
            if n == 0 {
                break;
            }
            if bytes.len() + n > cap {
                return Err(HttpError::RequestTooLarge("form body exceeds the decode cap"));
            }
            bytes.extend_from_slice(&buf[..n]);
        }

        self.request.post_form = ParamMap::parse(&bytes)?;
        if let Some(reader) = self.request.body.replace_with_buffer(bytes) {
            self.reader = Some(reader);
        }
        Ok(())
    }

    async fn write_socket(&mut self, data: &[u8]) -> Result<(), HttpError> {
        let write_timeout = self.config.conn.effective_write_timeout();
        let Some(writer) = self.writer.as_mut() else {
            return Err(HttpError::Internal("connection writer unavailable".into()));
        };
        timed(write_timeout, &self.cancel, writer.write_all(data)).await??;
        Ok(())
    }

    async fn flush_socket(&mut self) -> Result<(), HttpError> {
        let write_timeout = self.config.conn.effective_write_timeout();
        let Some(writer) = self.writer.as_mut() else {
            return Ok(());
        };
        timed(write_timeout, &self.cancel, writer.flush()).await??;
        Ok(())
    }

    async fn begin_body_internal(&mut self, method: Method) -> Result<(), HttpError> {
        let plan = self.response.encode_header(method)?;
        self.write_socket(&plan.bytes).await?;
        self.bytes_sent = true;

        let writer = self
            .writer
            .take()
            .ok_or_else(|| HttpError::Internal("connection writer unavailable".into()))?;
        let mut body = ResponseBody::new(writer, plan.mode, plan.compression);
        if let Some(bytes) = plan.body_bytes {
            let write_timeout = self.config.conn.effective_write_timeout();
            timed(write_timeout, &self.cancel, body.write_all(&bytes)).await??;
        }
        self.body = Some(body);
        Ok(())
    }

    /// Emits the response header and opens the body pipeline for streaming
    /// writes. Idempotent once the body is open.
    pub async fn begin_body(&mut self) -> Result<(), HttpError> {
        if self.body.is_some() {
            return Ok(());
        }
        if self.response.header_written() {
            return Err(HttpError::Internal(
                "response already finished; no body can be started".into(),
            ));
        }
        let method = self.request.method;
        self.begin_body_internal(method).await
    }

    /// Streams payload through the response body pipeline, emitting the
    /// header first if needed.
    pub async fn write_body(&mut self, data: &[u8]) -> Result<(), HttpError> {
        if self.body.is_none() {
            self.begin_body().await?;
        }
        let write_timeout = self.config.conn.effective_write_timeout();
        let Some(body) = self.body.as_mut() else {
            return Err(HttpError::Internal("response body unavailable".into()));
        };
        timed(write_timeout, &self.cancel, body.write_all(data)).await??;
        Ok(())
    }

    /// Marks the streamed body as complete. The engine finalizes the
    /// pipeline (codec trailer, terminal chunk, length check) afterwards.
    pub fn end_body(&mut self) -> Handled {
        Handled(())
    }

    /// Validates the WebSocket handshake, flushes the `101` response, and
    /// hands the raw stream back to the caller. The connection leaves the
    /// engine's control for good.
    pub async fn upgrade_websocket(
        &mut self,
        extra_headers: &[(&str, &str)],
    ) -> Result<(Upgraded<S>, Handled), HttpError> {
        let key = self.request.headers.get("Sec-WebSocket-Key").ok_or_else(|| {
            HttpError::ProtocolViolation("websocket upgrade without Sec-WebSocket-Key".into())
        })?;
        let accept = websocket::accept_key(key.trim());
        let handled = self.response.websocket_upgrade(&accept, extra_headers)?;

        let method = self.request.method;
        let plan = self.response.encode_header(method)?;
        self.write_socket(&plan.bytes).await?;
        self.bytes_sent = true;
        self.flush_socket().await?;

        let reader = self
            .reader
            .take()
            .or_else(|| self.request.body.take_reader())
            .ok_or_else(|| HttpError::Internal("connection reader unavailable".into()))?;
        let writer = self
            .writer
            .take()
            .ok_or_else(|| HttpError::Internal("connection writer unavailable".into()))?;
        self.upgraded = true;

        Ok((Upgraded { reader, writer }, handled))
    }

    async fn finish_response(&mut self, method: Method) -> Result<(), HttpError> {
        if self.response.is_close_without_response() || self.upgraded {
            return Ok(());
        }

        if !self.response.header_written() {
            self.begin_body_internal(method).await?;
        }
        if let Some(body) = self.body.take() {
            let write_timeout = self.config.conn.effective_write_timeout();
            let (writer, _payload) = timed(write_timeout, &self.cancel, body.finish()).await??;
            self.writer = Some(writer);
        }
        self.flush_socket().await
    }

    async fn drain_request_body(&mut self) -> Result<(), HttpError> {
        if !self.request.body.is_stream() || self.request.body.end_of_stream() {
            self.reclaim_reader();
            return Ok(());
        }

        let budget = self.config.conn.drain_budget;
        let read_timeout = self.config.conn.socket_read_timeout;
        let mut discarded = 0usize;
        let mut buf = [0u8; 8 * 1024];
        while !self.request.body.end_of_stream() {
            let n = timed(read_timeout, &self.cancel, self.request.body.read(&mut buf)).await??;
            if n == 0 {
                break;
            }
            discarded += n;
            if discarded > budget {
                return Err(HttpError::BodyNotDrained);
            }
        }

        if discarded > 0 {
            tracing::debug!(id = self.info.id, discarded, "discarded unread request body");
        }
        self.reclaim_reader();
        Ok(())
    }

    fn reclaim_reader(&mut self) {
        if self.reader.is_none() {
            if let Some(reader) = self.request.body.take_reader() {
                self.reader = Some(reader);
            }
        }
    }

    /// The per-cycle catch point: maps an error into a best-effort response
    /// if nothing was sent yet. Returns whether the connection survives.
    async fn handle_cycle_error(&mut self, error: HttpError) -> bool {
        self.set_state(EngineState::Erroring);

        if error.is_ordinary_disconnect() {
            tracing::debug!(id = self.info.id, %error, "peer disconnected");
            return false;
        }
        if matches!(error, HttpError::Tls(_)) {
            tracing::error!(id = self.info.id, %error, "tls failure");
            return false;
        }
        tracing::warn!(id = self.info.id, %error, "request cycle failed");

        let Some(status_line) = error.status_line() else {
            return false;
        };
        if self.bytes_sent || self.writer.is_none() {
            // Too late for an orderly answer; just close.
            return false;
        }

        let keep_alive = error.keep_alive_allowed();
        let mut response = Response::new(self.config.resp.header_case);
        let _ = response.set_status_line(status_line);
        let _ = response.set_content_type("text/plain; charset=utf-8");
        let _ = response.set_body_bytes(status_line.as_bytes().to_vec());
        if keep_alive {
            // 501 leaves the connection usable; grant it the same keep-alive
            // a successful cycle would have computed.
            let high_load = self.counters.high_load(self.config.max_connections);
            response.compute_keep_alive(
                &self.request.protocol_version,
                &self.request.connection_tokens,
                high_load,
                self.config.conn.keep_alive_seconds,
            );
        } else {
            response.prevent_keepalive();
        }
        self.response = response;
        self.body = None;

        let mut survives = false;
        if self.begin_body_internal(Method::Get).await.is_ok() {
            if let Some(body) = self.body.take() {
                let write_timeout = self.config.conn.effective_write_timeout();
                if let Ok(Ok((writer, _))) = timed(write_timeout, &self.cancel, body.finish()).await
                {
                    self.writer = Some(writer);
                    survives = keep_alive
                        && self.response.effective_keep_alive() > 0
                        && self.reader.is_some();
                }
            }
            if self.flush_socket().await.is_err() {
                survives = false;
            }
        }

        if survives {
            self.served += 1;
        }
        survives
    }

    async fn finalize(&mut self) {
        self.set_state(EngineState::Done);
        if let Some(mut writer) = self.writer.take() {
            let write_timeout = self.config.conn.effective_write_timeout();
            let _ = timed(write_timeout, &self.cancel, writer.shutdown()).await;
        }
        tracing::debug!(id = self.info.id, served = self.served, "connection finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::files::mime::StaticMime;
    use crate::http::types::StatusCode;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    fn config() -> Arc<EngineConfig> {
        Arc::new(EngineConfig {
            conn: ConnLimits::default(),
            req: ReqLimits::default(),
            resp: RespLimits::default(),
            file: FileLimits::default(),
            proxy: ProxyHeaderConfig::default(),
            app_path: None,
            trust: Arc::new(()),
            mime: Arc::new(StaticMime),
            max_connections: 100,
        })
    }

    fn trusting_config() -> Arc<EngineConfig> {
        struct TrustEveryone;
        impl ProxyTrust for TrustEveryone {
            fn is_trusted_proxy(&self, _: IpAddr) -> bool {
                true
            }
        }
        Arc::new(EngineConfig {
            conn: ConnLimits::default(),
            req: ReqLimits::default(),
            resp: RespLimits::default(),
            file: FileLimits::default(),
            proxy: ProxyHeaderConfig {
                x_real_ip: true,
                x_forwarded_for: true,
                x_forwarded_proto: true,
            },
            app_path: None,
            trust: Arc::new(TrustEveryone),
            mime: Arc::new(StaticMime),
            max_connections: 100,
        })
    }

    fn info() -> ConnectionInfo {
        ConnectionInfo {
            id: 1,
            remote_addr: "10.0.0.5:40000".parse().unwrap(),
            local_addr: "127.0.0.1:8080".parse().unwrap(),
            secure: false,
        }
    }

    /// Feeds `input` to an engine running `handler`, returns everything the
    /// engine wrote.
    async fn drive<H: Handler<DuplexStream>>(
        handler: H,
        engine_config: Arc<EngineConfig>,
        input: &[u8],
    ) -> Vec<u8> {
        let (mut client, server) = tokio::io::duplex(256 * 1024);
        let counters = Arc::new(ServerCounters::new());
        let mut engine = HttpConnection::new(
            server,
            info(),
            engine_config,
            counters,
            CancelToken::new(),
        );

        let task = tokio::spawn(async move {
            engine.run(&handler).await;
        });

        // the engine may close early (drain budget, errors); tolerate it
        let _ = client.write_all(input).await;
        let _ = client.shutdown().await;

        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        task.await.unwrap();
        out
    }

    struct Hello;
    impl Handler<DuplexStream> for Hello {
        async fn handle(
            &self,
            conn: &mut HttpConnection<DuplexStream>,
        ) -> Result<Handled, HttpError> {
            conn.response_mut()
                .full_response_utf8("hi", "text/plain; charset=utf-8", StatusCode::Ok)
        }
    }

    #[tokio::test]
    async fn simple_get_framing() {
        let out = drive(Hello, config(), b"GET /hello?x=1 HTTP/1.1\r\nHost: example\r\n\r\n").await;
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "HTTP/1.1 200 OK\r\n\
             Connection: keep-alive\r\n\
             Keep-Alive: timeout=4\r\n\
             Content-Type: text/plain; charset=utf-8\r\n\
             Content-Length: 2\r\n\
             \r\n\
             hi"
        );
    }

    struct EchoQuery;
    impl Handler<DuplexStream> for EchoQuery {
        async fn handle(
            &self,
            conn: &mut HttpConnection<DuplexStream>,
        ) -> Result<Handled, HttpError> {
            let x = conn.request().query().get("x").unwrap_or("?").to_owned();
            conn.response_mut()
                .full_response_utf8(&x, "text/plain", StatusCode::Ok)
        }
    }

    #[tokio::test]
    async fn keep_alive_serves_sequential_requests() {
        let input = b"GET /a?x=first HTTP/1.1\r\nHost: h\r\n\r\n\
                      GET /a?x=second HTTP/1.1\r\nHost: h\r\nConnection: close\r\n\r\n";
        let out = drive(EchoQuery, config(), input).await;
        let text = String::from_utf8(out).unwrap();

        assert_eq!(text.matches("HTTP/1.1 200 OK").count(), 2);
        assert!(text.contains("first"));
        assert!(text.contains("second"));
        // second response honors Connection: close
        assert!(text.contains("Connection: close\r\n"));
    }

    struct FormInspector;
    impl Handler<DuplexStream> for FormInspector {
        async fn handle(
            &self,
            conn: &mut HttpConnection<DuplexStream>,
        ) -> Result<Handled, HttpError> {
            let a = conn.request().post_form().get("a").unwrap_or("-").to_owned();
            let b = conn.request().post_form().get("b").unwrap_or("-").to_owned();
            // the original bytes remain readable from the replay buffer
            let replay = conn.request_mut().body().read_to_end_capped(1024).await?;
            let body = format!("a={a} b={b} raw={}", String::from_utf8_lossy(&replay));
            conn.response_mut()
                .full_response_utf8(&body, "text/plain", StatusCode::Ok)
        }
    }

    #[tokio::test]
    async fn chunked_post_form_decodes() {
        let input = b"POST /submit HTTP/1.1\r\n\
                      Host: h\r\n\
                      Transfer-Encoding: chunked\r\n\
                      Content-Type: application/x-www-form-urlencoded\r\n\
                      Connection: close\r\n\
                      \r\n\
                      5\r\na=1&b\r\nA\r\n=two+words\r\n0\r\n\r\n";
        let out = drive(FormInspector, config(), input).await;
        let text = String::from_utf8(out).unwrap();

        assert!(text.contains("a=1 b=two words"), "{text}");
        assert!(text.contains("raw=a=1&b=two+words"), "{text}");
    }

    struct IgnoresBody;
    impl Handler<DuplexStream> for IgnoresBody {
        async fn handle(
            &self,
            conn: &mut HttpConnection<DuplexStream>,
        ) -> Result<Handled, HttpError> {
            conn.response_mut().simple(StatusCode::Ok, "ok")
        }
    }

    #[tokio::test]
    async fn small_unread_body_is_drained_and_keep_alive_survives() {
        let mut input = Vec::new();
        input.extend_from_slice(b"POST /up HTTP/1.1\r\nHost: h\r\nContent-Length: 10000\r\n\r\n");
        input.extend_from_slice(&vec![b'x'; 10_000]);
        input.extend_from_slice(b"GET /next HTTP/1.1\r\nHost: h\r\nConnection: close\r\n\r\n");

        let out = drive(IgnoresBody, config(), &input).await;
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text.matches("HTTP/1.1 200 OK").count(), 2, "{text}");
    }

    #[tokio::test]
    async fn oversized_unread_body_kills_the_connection() {
        let mut input = Vec::new();
        input.extend_from_slice(b"POST /up HTTP/1.1\r\nHost: h\r\nContent-Length: 500000\r\n\r\n");
        input.extend_from_slice(&vec![b'x'; 500_000]);
        input.extend_from_slice(b"GET /next HTTP/1.1\r\nHost: h\r\n\r\n");

        let out = drive(IgnoresBody, config(), &input).await;
        let text = String::from_utf8(out).unwrap();
        // the first response went out, then the drain budget tripped
        assert_eq!(text.matches("HTTP/1.1 200 OK").count(), 1, "{text}");
    }

    #[tokio::test]
    async fn unknown_method_gets_501_and_keeps_the_connection() {
        let input = b"BREW /pot HTTP/1.1\r\nHost: h\r\n\r\n\
                      GET /a?x=after HTTP/1.1\r\nHost: h\r\nConnection: close\r\n\r\n";
        let out = drive(EchoQuery, config(), input).await;
        let text = String::from_utf8(out).unwrap();

        assert!(text.starts_with("HTTP/1.1 501 Not Implemented\r\n"), "{text}");
        assert!(text.contains("HTTP/1.1 200 OK"), "{text}");
        assert!(text.contains("after"), "{text}");
    }

    #[tokio::test]
    async fn post_without_framing_gets_411() {
        let out = drive(IgnoresBody, config(), b"POST /x HTTP/1.1\r\nHost: h\r\n\r\n").await;
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 411 Length Required\r\n"), "{text}");
        assert!(text.contains("Connection: close\r\n"), "{text}");
    }

    struct PeerReporter;
    impl Handler<DuplexStream> for PeerReporter {
        async fn handle(
            &self,
            conn: &mut HttpConnection<DuplexStream>,
        ) -> Result<Handled, HttpError> {
            let body = format!(
                "{} {}",
                conn.request().remote_ip(),
                conn.request().is_secure()
            );
            conn.response_mut()
                .full_response_utf8(&body, "text/plain", StatusCode::Ok)
        }
    }

    #[tokio::test]
    async fn trusted_proxy_headers_rewrite_identity() {
        let input = b"GET / HTTP/1.1\r\n\
                      Host: h\r\n\
                      X-Forwarded-For: 203.0.113.7, 10.0.0.1\r\n\
                      X-Forwarded-Proto: https\r\n\
                      Connection: close\r\n\r\n";
        let out = drive(PeerReporter, trusting_config(), input).await;
        let text = String::from_utf8(out).unwrap();
        assert!(text.ends_with("203.0.113.7 true"), "{text}");
    }

    #[tokio::test]
    async fn untrusted_peer_headers_are_ignored() {
        let input = b"GET / HTTP/1.1\r\n\
                      Host: h\r\n\
                      X-Forwarded-For: 203.0.113.7\r\n\
                      Connection: close\r\n\r\n";
        let out = drive(PeerReporter, config(), input).await;
        let text = String::from_utf8(out).unwrap();
        assert!(text.ends_with("10.0.0.5 false"), "{text}");
    }

    struct WsEcho;
    impl Handler<DuplexStream> for WsEcho {
        async fn handle(
            &self,
            conn: &mut HttpConnection<DuplexStream>,
        ) -> Result<Handled, HttpError> {
            let (mut ws, handled) = conn.upgrade_websocket(&[]).await?;
            ws.write_all(b"raw-after-upgrade").await?;
            ws.shutdown().await?;
            Ok(handled)
        }
    }

    #[tokio::test]
    async fn websocket_upgrade_hands_over_the_stream() {
        let input = b"GET /chat HTTP/1.1\r\n\
                      Host: h\r\n\
                      Upgrade: websocket\r\n\
                      Connection: Upgrade\r\n\
                      Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n";
        let out = drive(WsEcho, config(), input).await;
        let text = String::from_utf8(out).unwrap();

        assert!(text.starts_with("HTTP/1.1 101 Switching Protocols\r\n"), "{text}");
        assert!(text.contains("Connection: upgrade\r\n"), "{text}");
        assert!(text.contains("Upgrade: websocket\r\n"), "{text}");
        assert!(
            text.contains("Sec-Websocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"),
            "{text}"
        );
        assert!(text.ends_with("\r\n\r\nraw-after-upgrade"), "{text}");
    }

    #[tokio::test]
    async fn head_suppresses_the_body() {
        let out = drive(Hello, config(), b"HEAD / HTTP/1.1\r\nHost: h\r\nConnection: close\r\n\r\n").await;
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("Content-Length: 2\r\n"), "{text}");
        assert!(text.ends_with("\r\n\r\n"), "{text}");
    }

    struct SlamsTheDoor;
    impl Handler<DuplexStream> for SlamsTheDoor {
        async fn handle(
            &self,
            conn: &mut HttpConnection<DuplexStream>,
        ) -> Result<Handled, HttpError> {
            Ok(conn.response_mut().close_without_response())
        }
    }

    #[tokio::test]
    async fn close_without_response_writes_nothing() {
        let out = drive(SlamsTheDoor, config(), b"GET / HTTP/1.1\r\nHost: h\r\n\r\n").await;
        assert!(out.is_empty());
    }

    struct Streams;
    impl Handler<DuplexStream> for Streams {
        async fn handle(
            &self,
            conn: &mut HttpConnection<DuplexStream>,
        ) -> Result<Handled, HttpError> {
            conn.write_body(b"part one, ").await?;
            conn.write_body(b"part two").await?;
            Ok(conn.end_body())
        }
    }

    #[tokio::test]
    async fn streamed_body_uses_chunked_framing() {
        let out = drive(Streams, config(), b"GET / HTTP/1.1\r\nHost: h\r\n\r\n").await;
        let text = String::from_utf8(out).unwrap();

        assert!(text.contains("Transfer-Encoding: chunked\r\n"), "{text}");
        assert!(text.contains("a\r\npart one, \r\n"), "{text}");
        assert!(text.contains("8\r\npart two\r\n"), "{text}");
        assert!(text.ends_with("0\r\n\r\n"), "{text}");
    }

    struct Fails;
    impl Handler<DuplexStream> for Fails {
        async fn handle(
            &self,
            _conn: &mut HttpConnection<DuplexStream>,
        ) -> Result<Handled, HttpError> {
            Err(HttpError::Internal("handler exploded".into()))
        }
    }

    #[tokio::test]
    async fn handler_errors_become_500() {
        let out = drive(Fails, config(), b"GET / HTTP/1.1\r\nHost: h\r\n\r\n").await;
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 500 Internal Server Error\r\n"), "{text}");
        assert!(text.contains("Connection: close\r\n"), "{text}");
    }

    #[tokio::test]
    async fn malformed_request_line_gets_400() {
        let out = drive(Hello, config(), b"GARBAGE\r\n\r\n").await;
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{text}");
    }

    #[tokio::test]
    async fn cancellation_stops_the_engine() {
        let (mut client, server) = tokio::io::duplex(16 * 1024);
        let counters = Arc::new(ServerCounters::new());
        let cancel = CancelToken::new();
        let mut engine =
            HttpConnection::new(server, info(), config(), counters, cancel.clone());

        let task = tokio::spawn(async move {
            engine.run(&Hello).await;
        });

        // engine is now waiting for a request line
        cancel.cancel();
        task.await.unwrap();

        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        assert!(out.is_empty());
    }
}
