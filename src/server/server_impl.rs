//! Server assembly: builder, scheduling, load shedding

use crate::errors::HttpError;
use crate::files::mime::{MimeLookup, StaticMime};
use crate::http::response::{Handled, Response};
use crate::http::types::Method;
use crate::limits::{
    ConnLimits, FileLimits, ReqLimits, RespLimits, Scheduling, ServerLimits, WaitStrategy,
};
use crate::server::connection::{
    timed, CancelToken, ConnectionInfo, EngineConfig, EngineState, HttpConnection, Stream,
};
use crate::server::counters::ServerCounters;
use crate::server::tls::{front_door, BindingMode, CertificateProvider, FrontDoor, ServerStream};
use crossbeam::queue::SegQueue;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::yield_now;
use tokio::time::sleep;

/// The prebuilt answer for connections accepted past the hard cap. Written
/// as-is and the socket closed; the protocol engine never sees these peers.
const SHED_RESPONSE: &[u8] =
    b"HTTP/1.1 503 Service Unavailable\r\nConnection: close\r\n\r\nServer too busy";

/// Handles one request/response cycle.
///
/// The engine loans itself to the handler for the duration of the call; the
/// request, response, and cancellation token are reached through it.
///
/// # Examples
///
/// ```no_run
/// use hearth_web::{Handled, Handler, HttpConnection, HttpError, ServerStream, StatusCode};
///
/// struct MyHandler;
///
/// impl Handler for MyHandler {
///     async fn handle(
///         &self,
///         conn: &mut HttpConnection<ServerStream>,
///     ) -> Result<Handled, HttpError> {
///         if conn.request().page() == "status" {
///             conn.response_mut().simple(StatusCode::Ok, "running")
///         } else {
///             conn.response_mut().simple(StatusCode::Ok, "hello")
///         }
///     }
/// }
/// ```
pub trait Handler<S: Stream = ServerStream>
where
    Self: Sync + Send + 'static,
{
    fn handle(
        &self,
        conn: &mut HttpConnection<S>,
    ) -> impl Future<Output = Result<Handled, HttpError>> + Send;
}

/// Vetoes TCP peers before any HTTP processing happens.
///
/// The synchronous check runs first for cheap in-memory decisions; the async
/// one afterwards for lookups. A rejecting filter may populate the provided
/// response, which is written with `Connection: close` before the socket is
/// dropped.
pub trait ConnectionFilter: Sync + Send + 'static {
    fn filter(
        &self,
        client_addr: SocketAddr,
        server_addr: SocketAddr,
        error_response: &mut Response,
    ) -> Result<(), Handled>;

    fn filter_async(
        &self,
        #[allow(unused_variables)] client_addr: SocketAddr,
        #[allow(unused_variables)] server_addr: SocketAddr,
        #[allow(unused_variables)] error_response: &mut Response,
    ) -> impl Future<Output = Result<(), Handled>> + Send {
        async { Ok(()) }
    }
}

impl ConnectionFilter for () {
    fn filter(&self, _: SocketAddr, _: SocketAddr, _: &mut Response) -> Result<(), Handled> {
        Ok(())
    }
}

/// Decides which peers may speak for their clients through proxy identity
/// headers (`X-Real-IP`, `X-Forwarded-For`, `X-Forwarded-Proto`).
pub trait ProxyTrust: Sync + Send + 'static {
    fn is_trusted_proxy(&self, peer: IpAddr) -> bool;
}

/// The default: nobody is trusted.
impl ProxyTrust for () {
    fn is_trusted_proxy(&self, _: IpAddr) -> bool {
        false
    }
}

type TcpQueue = Arc<SegQueue<(TcpStream, SocketAddr)>>;

/// State shared by every connection of one server.
struct Shared<H, F> {
    handler: Arc<H>,
    filter: Arc<F>,
    provider: Option<Arc<dyn CertificateProvider>>,
    binding: BindingMode,
    config: Arc<EngineConfig>,
    counters: Arc<ServerCounters>,
    cancel: CancelToken,
}

/// An HTTP server: an accept loop feeding per-connection protocol engines,
/// with load shedding at the accept boundary.
pub struct Server<H, F = ()>
where
    H: Handler,
    F: ConnectionFilter,
{
    listener: TcpListener,
    limits: ServerLimits,
    shared: Arc<Shared<H, F>>,
}

impl<H: Handler> Server<H, ()> {
    /// Creates a new builder for configuring the server instance.
    pub fn builder() -> ServerBuilder<H, ()> {
        ServerBuilder::new()
    }
}

impl<H, F> Server<H, F>
where
    H: Handler,
    F: ConnectionFilter,
{
    /// The process-wide connection and request statistics.
    pub fn counters(&self) -> Arc<ServerCounters> {
        self.shared.counters.clone()
    }

    /// A token that stops the accept loop and cancels running engines at
    /// their next suspension point.
    pub fn cancel_token(&self) -> CancelToken {
        self.shared.cancel.clone()
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Starts accepting connections. Returns once the cancel token fires.
    pub async fn launch(self) {
        match self.limits.scheduling {
            Scheduling::WorkerPool => self.launch_worker_pool().await,
            Scheduling::TaskPerConnection => self.launch_task_per_connection().await,
        }
    }

    async fn launch_task_per_connection(self) {
        loop {
            let accepted = tokio::select! {
                biased;
                _ = self.shared.cancel.cancelled() => return,
                accepted = self.listener.accept() => accepted,
            };
            let Ok((stream, peer)) = accepted else {
                continue;
            };

            if self.shared.counters.open_connections() >= self.limits.max_connections {
                tokio::spawn(shed(stream));
                continue;
            }
            let shared = self.shared.clone();
            tokio::spawn(handle_connection(shared, stream, peer));
        }
    }

    async fn launch_worker_pool(self) {
        let queue: TcpQueue = Arc::new(SegQueue::new());

        for _ in 0..self.limits.max_connections {
            let queue = queue.clone();
            let shared = self.shared.clone();
            let wait = self.limits.wait_strategy.clone();
            tokio::spawn(async move {
                while let Some((stream, peer)) = next_connection(&queue, &wait, &shared.cancel).await
                {
                    handle_connection(shared.clone(), stream, peer).await;
                }
            });
        }

        loop {
            let accepted = tokio::select! {
                biased;
                _ = self.shared.cancel.cancelled() => return,
                accepted = self.listener.accept() => accepted,
            };
            let Ok((stream, peer)) = accepted else {
                continue;
            };

            if queue.len() >= self.limits.max_pending_connections {
                tokio::spawn(shed(stream));
            } else {
                queue.push((stream, peer));
            }
        }
    }
}

async fn next_connection(
    queue: &TcpQueue,
    wait: &WaitStrategy,
    cancel: &CancelToken,
) -> Option<(TcpStream, SocketAddr)> {
    loop {
        if cancel.is_cancelled() {
            return None;
        }
        if let Some(pair) = queue.pop() {
            return Some(pair);
        }
        match wait {
            WaitStrategy::Yield => yield_now().await,
            WaitStrategy::Sleep(duration) => sleep(*duration).await,
        }
    }
}

async fn shed(mut stream: TcpStream) {
    let _ = tokio::time::timeout(Duration::from_secs(1), stream.write_all(SHED_RESPONSE)).await;
    let _ = stream.shutdown().await;
}

async fn handle_connection<H, F>(shared: Arc<Shared<H, F>>, stream: TcpStream, peer: SocketAddr)
where
    H: Handler,
    F: ConnectionFilter,
{
    let Ok(local) = stream.local_addr() else {
        return;
    };
    let id = shared.counters.begin_connection(peer);

    if shared.counters.high_load(shared.config.max_connections) {
        // under pressure, stop buffering large responses in the kernel
        let _ = socket2::SockRef::from(&stream).set_send_buffer_size(16 * 1024);
    }

    let mut veto = Response::new(shared.config.resp.header_case);
    let rejected = shared.filter.filter(peer, local, &mut veto).is_err()
        || shared
            .filter
            .filter_async(peer, local, &mut veto)
            .await
            .is_err();
    if rejected {
        write_veto_response(stream, veto, &shared.config.conn, &shared.cancel).await;
        shared.counters.end_connection(id);
        return;
    }

    let mut info = ConnectionInfo {
        id,
        remote_addr: peer,
        local_addr: local,
        secure: false,
    };

    shared.counters.set_state(id, EngineState::TlsPeek);
    let routed = front_door(
        stream,
        shared.binding,
        shared.provider.as_ref(),
        &info,
        shared.config.conn.socket_read_timeout,
    )
    .await;

    match routed {
        Ok(FrontDoor::Http {
            stream,
            secure,
            server_name,
        }) => {
            if let Some(name) = server_name {
                tracing::trace!(id, server_name = %name, "sni-selected certificate in use");
            }
            info.secure = secure;
            let mut engine = HttpConnection::new(
                stream,
                info,
                shared.config.clone(),
                shared.counters.clone(),
                shared.cancel.clone(),
            );
            engine.run(&*shared.handler).await;
        }
        Ok(FrontDoor::AcmeServed) => {
            shared.counters.set_state(id, EngineState::TlsAcme);
        }
        Ok(FrontDoor::Rejected(reason)) => {
            tracing::debug!(id, reason, "connection rejected at the front door");
        }
        Err(error) => {
            if error.is_ordinary_disconnect() {
                tracing::debug!(id, %error, "peer left during tls setup");
            } else {
                tracing::error!(id, %error, "tls front door failed");
            }
        }
    }

    shared.counters.end_connection(id);
}

async fn write_veto_response(
    mut stream: TcpStream,
    mut response: Response,
    limits: &ConnLimits,
    cancel: &CancelToken,
) {
    response.prevent_keepalive();
    let Ok(plan) = response.encode_header(Method::Get) else {
        return;
    };
    let mut bytes = plan.bytes;
    if let Some(body) = plan.body_bytes {
        bytes.extend_from_slice(&body);
    }
    let _ = timed(
        limits.effective_write_timeout(),
        cancel,
        stream.write_all(&bytes),
    )
    .await;
    let _ = stream.shutdown().await;
}

/// Builder for configuring and creating [`Server`] instances.
pub struct ServerBuilder<H, F = ()>
where
    H: Handler,
    F: ConnectionFilter,
{
    listener: Option<TcpListener>,
    handler: Option<Arc<H>>,
    filter: Arc<F>,
    provider: Option<Arc<dyn CertificateProvider>>,
    binding: BindingMode,
    trust: Arc<dyn ProxyTrust>,
    mime: Arc<dyn MimeLookup>,

    server_limits: Option<ServerLimits>,
    connection_limits: Option<ConnLimits>,
    request_limits: Option<ReqLimits>,
    response_limits: Option<RespLimits>,
    file_limits: Option<FileLimits>,
}

impl<H: Handler> ServerBuilder<H, ()> {
    fn new() -> Self {
        Self {
            listener: None,
            handler: None,
            filter: Arc::new(()),
            provider: None,
            binding: BindingMode::Plain,
            trust: Arc::new(()),
            mime: Arc::new(StaticMime),
            server_limits: None,
            connection_limits: None,
            request_limits: None,
            response_limits: None,
            file_limits: None,
        }
    }
}

impl<H, F> ServerBuilder<H, F>
where
    H: Handler,
    F: ConnectionFilter,
{
    /// Sets the TCP listener the server accepts from.
    ///
    /// **This is a required component.**
    pub fn listener(mut self, listener: TcpListener) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Sets the request handler.
    ///
    /// **This is a required component.**
    pub fn handler(mut self, handler: H) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Installs a connection filter checked before any parsing happens.
    pub fn conn_filter<NewF: ConnectionFilter>(self, filter: NewF) -> ServerBuilder<H, NewF> {
        ServerBuilder {
            listener: self.listener,
            handler: self.handler,
            filter: Arc::new(filter),
            provider: self.provider,
            binding: self.binding,
            trust: self.trust,
            mime: self.mime,
            server_limits: self.server_limits,
            connection_limits: self.connection_limits,
            request_limits: self.request_limits,
            response_limits: self.response_limits,
            file_limits: self.file_limits,
        }
    }

    /// Supplies certificates for TLS and ACME-TLS/1. Required for
    /// [`BindingMode::Tls`] and [`BindingMode::Hybrid`].
    pub fn certificate_provider<P: CertificateProvider>(mut self, provider: P) -> Self {
        self.provider = Some(Arc::new(provider));
        self
    }

    /// What the listening socket accepts (default: plain HTTP).
    pub fn binding_mode(mut self, mode: BindingMode) -> Self {
        self.binding = mode;
        self
    }

    /// Decides which peers' proxy identity headers are honored.
    pub fn proxy_trust<T: ProxyTrust>(mut self, trust: T) -> Self {
        self.trust = Arc::new(trust);
        self
    }

    /// Replaces the built-in MIME table.
    pub fn mime_lookup<M: MimeLookup>(mut self, mime: M) -> Self {
        self.mime = Arc::new(mime);
        self
    }

    pub fn server_limits(mut self, limits: ServerLimits) -> Self {
        self.server_limits = Some(limits);
        self
    }

    pub fn connection_limits(mut self, limits: ConnLimits) -> Self {
        self.connection_limits = Some(limits);
        self
    }

    pub fn request_limits(mut self, limits: ReqLimits) -> Self {
        self.request_limits = Some(limits);
        self
    }

    pub fn response_limits(mut self, limits: RespLimits) -> Self {
        self.response_limits = Some(limits);
        self
    }

    pub fn file_limits(mut self, limits: FileLimits) -> Self {
        self.file_limits = Some(limits);
        self
    }

    /// Finalizes the builder.
    ///
    /// # Panics
    ///
    /// When `listener` or `handler` was not provided.
    #[track_caller]
    pub fn build(self) -> Server<H, F> {
        let listener = self
            .listener
            .expect("the `listener` method must be called before `build`");
        let handler = self
            .handler
            .expect("the `handler` method must be called before `build`");

        let limits = self.server_limits.unwrap_or_default();
        let config = Arc::new(EngineConfig {
            conn: self.connection_limits.unwrap_or_default(),
            req: self.request_limits.unwrap_or_default(),
            resp: self.response_limits.unwrap_or_default(),
            file: self.file_limits.unwrap_or_default(),
            proxy: limits.proxy_headers,
            app_path: limits.app_path.clone(),
            trust: self.trust,
            mime: self.mime,
            max_connections: limits.max_connections,
        });

        Server {
            listener,
            limits,
            shared: Arc::new(Shared {
                handler,
                filter: self.filter,
                provider: self.provider,
                binding: self.binding,
                config,
                counters: Arc::new(ServerCounters::new()),
                cancel: CancelToken::new(),
            }),
        }
    }
}
