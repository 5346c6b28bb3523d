//! Server configuration limits and timeouts
//!
//! # Security-First Defaults
//!
//! Default limits are intentionally conservative to prevent:
//! - Resource exhaustion attacks
//! - Slowloris-style trickled requests
//! - Header and body flooding
//!
//! Every limit can be raised for trusted deployments; the defaults are the
//! ones the engine is tested against.

use crate::http::headers::HeaderCase;
use std::time::Duration;

/// Server-level concurrency, scheduling, and trust configuration.
#[derive(Debug, Clone)]
pub struct ServerLimits {
    /// Maximum number of concurrent active connections (default: `100`).
    ///
    /// Connections accepted past this cap receive an immediate prebuilt
    /// `503 Service Unavailable` and are closed without touching the engine.
    pub max_connections: usize,

    /// Maximum number of accepted sockets waiting in the admission queue
    /// when [`Scheduling::WorkerPool`] is active (default: `250`).
    pub max_pending_connections: usize,

    /// How connections are scheduled onto the runtime (default:
    /// [`Scheduling::WorkerPool`]).
    pub scheduling: Scheduling,

    /// Worker wait behavior when the admission queue is empty
    /// (default: `Sleep(50µs)`).
    pub wait_strategy: WaitStrategy,

    /// Optional application path prefix stripped from `page` during the
    /// trust-header stage (default: `None`).
    pub app_path: Option<String>,

    /// Which proxy identity headers are honored for trusted peers
    /// (default: all disabled).
    pub proxy_headers: ProxyHeaderConfig,
}

impl Default for ServerLimits {
    fn default() -> Self {
        Self {
            max_connections: 100,
            max_pending_connections: 250,
            scheduling: Scheduling::WorkerPool,
            wait_strategy: WaitStrategy::Sleep(Duration::from_micros(50)),
            app_path: None,
            proxy_headers: ProxyHeaderConfig::default(),
        }
    }
}

/// How accepted connections are mapped onto the async runtime.
///
/// The protocol engine is identical in both modes; only the scheduling
/// primitive differs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheduling {
    /// A fixed pool of long-lived worker tasks drains an admission queue.
    /// A connection occupies one worker for its whole lifetime, so
    /// concurrency is bounded by `max_connections` and memory use is flat.
    WorkerPool,

    /// One spawned task per accepted connection. Scales to many idle
    /// keep-alive connections with a small number of OS threads.
    TaskPerConnection,
}

/// Strategy for worker task waiting when no connections are queued.
#[derive(Debug, Clone)]
pub enum WaitStrategy {
    /// While waiting, uses [`tokio::task::yield_now()`]. Burns CPU for the
    /// lowest possible pickup latency.
    Yield,

    /// While waiting, uses [`tokio::time::sleep()`].
    Sleep(Duration),
}

/// Feature switches for the trusted-proxy header rewrite stage.
///
/// Each header is honored only when the peer passes the server's
/// [`ProxyTrust`](crate::ProxyTrust) predicate *and* the matching flag here
/// is enabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProxyHeaderConfig {
    /// `X-Real-IP` replaces the observed remote IP.
    pub x_real_ip: bool,
    /// `X-Forwarded-For` replaces the observed remote IP with the leftmost
    /// comma-separated value.
    pub x_forwarded_for: bool,
    /// `X-Forwarded-Proto` flips the HTTPS indicator and the base URI scheme
    /// used for relative-URL resolution on subsequent requests.
    pub x_forwarded_proto: bool,
}

/// Connection-level limits and timeouts.
#[derive(Debug, Clone)]
pub struct ConnLimits {
    /// Maximum duration of a single socket read (default: `5 seconds`).
    ///
    /// Applies to every read: each header line of the next request while the
    /// connection idles between cycles, and every body read. The primary
    /// mechanism for cleaning up stalled connections.
    pub socket_read_timeout: Duration,

    /// Maximum duration of a single socket write (default: `5 seconds`).
    ///
    /// Values below one second are treated as one second; a send timeout
    /// that short only manufactures spurious disconnects.
    pub socket_write_timeout: Duration,

    /// Keep-alive grant per response, in seconds (default: `5`).
    ///
    /// Advertised to the client as `Keep-Alive: timeout=N-1` (clamped to
    /// `[1, 60]`). Zero disables keep-alive entirely.
    pub keep_alive_seconds: u32,

    /// Maximum requests served per connection (default: `100`).
    pub max_requests_per_connection: usize,

    /// Maximum lifetime of a connection (default: `2 minutes`).
    pub connection_lifetime: Duration,

    /// How many unread request-body bytes the engine discards at the end of
    /// a cycle before declaring the connection unsalvageable
    /// (default: `125_000`).
    pub drain_budget: usize,
}

impl Default for ConnLimits {
    fn default() -> Self {
        Self {
            socket_read_timeout: Duration::from_secs(5),
            socket_write_timeout: Duration::from_secs(5),
            keep_alive_seconds: 5,
            max_requests_per_connection: 100,
            connection_lifetime: Duration::from_secs(120),
            drain_budget: 125_000,
        }
    }
}

impl ConnLimits {
    /// The write timeout with the one-second floor applied.
    pub(crate) fn effective_write_timeout(&self) -> Duration {
        self.socket_write_timeout.max(Duration::from_secs(1))
    }
}

/// Request parsing limits.
#[derive(Debug, Clone)]
pub struct ReqLimits {
    /// Maximum bytes in a single head line, request line included
    /// (default: `32_768`). Overflow is answered with `413`.
    pub header_line_size: usize,

    /// Maximum number of header lines per request (default: `100`).
    pub header_count: usize,

    /// Maximum size of an `application/x-www-form-urlencoded` body decoded
    /// eagerly into the form map (default: `2 MiB`). Larger bodies are
    /// answered with `413`.
    pub form_body_size: usize,
}

impl Default for ReqLimits {
    fn default() -> Self {
        Self {
            header_line_size: 32_768,
            header_count: 100,
            form_body_size: 2 * 1024 * 1024,
        }
    }
}

/// Response emission configuration.
#[derive(Debug, Clone)]
pub struct RespLimits {
    /// Header name normalization on the wire (default: title-case).
    pub header_case: HeaderCase,

    /// Minimum payload size before compression activates
    /// (default: `200` bytes).
    pub compression_threshold: u64,

    /// File extensions considered worth compressing (default: `html`,
    /// `htm`, `js`, `css`, `txt`, `svg`, `xml`).
    pub compressible_extensions: Vec<String>,
}

impl Default for RespLimits {
    fn default() -> Self {
        Self {
            header_case: HeaderCase::Title,
            compression_threshold: 200,
            compressible_extensions: ["html", "htm", "js", "css", "txt", "svg", "xml"]
                .into_iter()
                .map(str::to_owned)
                .collect(),
        }
    }
}

impl RespLimits {
    pub(crate) fn is_compressible_extension(&self, ext: &str) -> bool {
        self.compressible_extensions
            .iter()
            .any(|e| e.eq_ignore_ascii_case(ext))
    }
}

/// Static file responder configuration.
#[derive(Debug, Clone)]
pub struct FileLimits {
    /// Extensions never served with caching headers (default: `htm`, `html`).
    ///
    /// Markup is the usual entry point of an application and tends to change
    /// with every deploy; everything else gets a week of `max-age`.
    pub non_cacheable_extensions: Vec<String>,

    /// `Cache-Control: max-age` for cacheable files, in seconds
    /// (default: `604_800`).
    pub cache_max_age: u32,
}

impl Default for FileLimits {
    fn default() -> Self {
        Self {
            non_cacheable_extensions: ["htm", "html"].into_iter().map(str::to_owned).collect(),
            cache_max_age: 604_800,
        }
    }
}

impl FileLimits {
    pub(crate) fn is_cacheable_extension(&self, ext: &str) -> bool {
        !self
            .non_cacheable_extensions
            .iter()
            .any(|e| e.eq_ignore_ascii_case(ext))
    }
}
