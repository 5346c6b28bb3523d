//! Response composition and header emission

use crate::errors::HttpError;
use crate::http::cookies::CookieJar;
use crate::http::headers::{HeaderCase, HeaderCollection};
use crate::http::types::{body_forbidden, Method, StatusCode};
use crate::io::body::SinkMode;
use crate::io::compress::Compression;

/// Proof that a handler produced a response (or deliberately refused to).
///
/// Only finalizing methods hand one out, so every handler path must pass
/// through one of them.
pub struct Handled(pub(crate) ());

/// Header names the builder owns. A user header with one of these names is
/// a deterministic error before any byte is written.
const RESERVED_HEADERS: [&str; 5] = [
    "Connection",
    "Keep-Alive",
    "Transfer-Encoding",
    "Content-Encoding",
    "Set-Cookie",
];

/// One HTTP response, built once per engine cycle.
///
/// Configuration methods only mutate state; bytes hit the wire when the
/// engine emits the header. After that the one-shot `header_written` flag is
/// latched and any further mutation is an error.
#[derive(Debug)]
pub struct Response {
    status_line: String,
    headers: HeaderCollection,
    cookies: CookieJar,
    body_bytes: Option<Vec<u8>>,
    compression: Option<Compression>,
    keep_alive_seconds: u32,
    prevent_keepalive: bool,
    header_written: bool,
    close_without_response: bool,
}

/// Everything the engine needs to put a response on the wire: the encoded
/// header block, the body transport, and the buffered payload if any.
pub(crate) struct HeaderPlan {
    pub bytes: Vec<u8>,
    pub mode: SinkMode,
    pub compression: Option<Compression>,
    pub body_bytes: Option<Vec<u8>>,
}

impl Response {
    pub(crate) fn new(case: HeaderCase) -> Self {
        Self {
            status_line: StatusCode::Ok.as_line().to_owned(),
            headers: HeaderCollection::new(case),
            cookies: CookieJar::new(),
            body_bytes: None,
            compression: None,
            keep_alive_seconds: 0,
            prevent_keepalive: false,
            header_written: false,
            close_without_response: false,
        }
    }

    fn ensure_mutable(&self) -> Result<(), HttpError> {
        if self.header_written {
            return Err(HttpError::Internal(
                "response header already written; the response can no longer change".into(),
            ));
        }
        Ok(())
    }

    /// Sets the status from the known set.
    pub fn set_status(&mut self, status: StatusCode) -> Result<(), HttpError> {
        self.ensure_mutable()?;
        self.status_line = status.as_line().to_owned();
        Ok(())
    }

    /// Sets a free-form status line; it must start with a 3-digit code.
    pub fn set_status_line(&mut self, line: &str) -> Result<(), HttpError> {
        self.ensure_mutable()?;
        let code_ok = line.len() >= 3
            && line.as_bytes()[..3].iter().all(u8::is_ascii_digit)
            && matches!(line.as_bytes().get(3), None | Some(b' '));
        if !code_ok {
            return Err(HttpError::Internal(format!(
                "status line must start with a 3-digit code: {line:?}"
            )));
        }
        self.status_line = line.to_owned();
        Ok(())
    }

    pub fn status_line(&self) -> &str {
        &self.status_line
    }

    pub(crate) fn status_code(&self) -> u16 {
        self.status_line[..3].parse().unwrap_or(0)
    }

    /// User headers. The collection's internal lock makes a shared reference
    /// sufficient for mutation.
    pub fn headers(&self) -> &HeaderCollection {
        &self.headers
    }

    pub fn cookies(&self) -> &CookieJar {
        &self.cookies
    }

    pub fn cookies_mut(&mut self) -> &mut CookieJar {
        &mut self.cookies
    }

    /// Buffers a small payload to be written right after the header.
    pub fn set_body_bytes(&mut self, bytes: Vec<u8>) -> Result<(), HttpError> {
        self.ensure_mutable()?;
        self.body_bytes = Some(bytes);
        Ok(())
    }

    pub fn body_bytes(&self) -> Option<&[u8]> {
        self.body_bytes.as_deref()
    }

    pub fn set_content_type(&mut self, content_type: &str) -> Result<(), HttpError> {
        self.ensure_mutable()?;
        self.headers.set("Content-Type", Some(content_type))
    }

    pub fn set_content_length(&mut self, len: u64) -> Result<(), HttpError> {
        self.ensure_mutable()?;
        self.headers.set("Content-Length", Some(&len.to_string()))
    }

    /// The `Content-Length` header as a number, validated non-negative.
    pub fn content_length(&self) -> Result<Option<u64>, HttpError> {
        match self.headers.get("Content-Length") {
            None => Ok(None),
            Some(value) => value.trim().parse::<u64>().map(Some).map_err(|_| {
                HttpError::Internal(format!("invalid Content-Length on response: {value:?}"))
            }),
        }
    }

    pub fn set_compression(&mut self, compression: Option<Compression>) -> Result<(), HttpError> {
        self.ensure_mutable()?;
        self.compression = compression;
        Ok(())
    }

    pub fn compression(&self) -> Option<Compression> {
        self.compression
    }

    /// Forces `Connection: close` on this response.
    pub fn prevent_keepalive(&mut self) {
        self.prevent_keepalive = true;
    }

    pub fn keepalive_prevented(&self) -> bool {
        self.prevent_keepalive
    }

    pub fn keep_alive_seconds(&self) -> u32 {
        self.keep_alive_seconds
    }

    /// The keep-alive grant with the prevent flag applied.
    pub(crate) fn effective_keep_alive(&self) -> u32 {
        if self.prevent_keepalive {
            0
        } else {
            self.keep_alive_seconds
        }
    }

    /// Computes the keep-alive grant, once per response:
    /// HTTP/1.1 or an explicit `keep-alive` token earns the configured
    /// seconds; a `close` token or high server load zeroes it.
    pub(crate) fn compute_keep_alive(
        &mut self,
        protocol_version: &str,
        connection_tokens: &[String],
        high_load: bool,
        configured: u32,
    ) {
        let has = |token: &str| {
            connection_tokens
                .iter()
                .any(|t| t.eq_ignore_ascii_case(token))
        };

        let mut candidate = 0;
        if !self.prevent_keepalive && (protocol_version == "HTTP/1.1" || has("keep-alive")) {
            candidate = configured;
        }
        if has("close") {
            candidate = 0;
        }
        if high_load {
            candidate = 0;
        }
        self.keep_alive_seconds = candidate;
    }

    pub fn header_written(&self) -> bool {
        self.header_written
    }

    pub(crate) fn is_close_without_response(&self) -> bool {
        self.close_without_response
    }
}

/// Convenience constructors. They mutate configuration only and never
/// perform I/O.
impl Response {
    /// A plain-text response, or a bodyless one when `description` is empty.
    pub fn simple(&mut self, status: StatusCode, description: &str) -> Result<Handled, HttpError> {
        self.set_status(status)?;
        if !description.is_empty() {
            self.set_content_type("text/plain; charset=utf-8")?;
            self.set_body_bytes(description.as_bytes().to_vec())?;
        }
        Ok(Handled(()))
    }

    /// UTF-8 payload with its content type and length set.
    pub fn full_response_utf8(
        &mut self,
        body: &str,
        content_type: &str,
        status: StatusCode,
    ) -> Result<Handled, HttpError> {
        self.set_status(status)?;
        self.set_content_type(content_type)?;
        self.set_content_length(body.len() as u64)?;
        self.set_body_bytes(body.as_bytes().to_vec())?;
        Ok(Handled(()))
    }

    /// `302 Found` to `url`; the connection closes after this response.
    pub fn redirect(&mut self, url: &str) -> Result<Handled, HttpError> {
        self.set_status(StatusCode::Found)?;
        self.headers.set("Location", Some(url))?;
        self.prevent_keepalive();
        Ok(Handled(()))
    }

    /// `307 Temporary Redirect`; otherwise identical to [`redirect`](Self::redirect).
    pub fn redirect_temporary(&mut self, url: &str) -> Result<Handled, HttpError> {
        self.set_status(StatusCode::TemporaryRedirect)?;
        self.headers.set("Location", Some(url))?;
        self.prevent_keepalive();
        Ok(Handled(()))
    }

    /// Configures the `101 Switching Protocols` answer of a WebSocket
    /// handshake. The engine hands over the raw stream after the flush.
    pub fn websocket_upgrade(
        &mut self,
        accept_key: &str,
        extra_headers: &[(&str, &str)],
    ) -> Result<Handled, HttpError> {
        self.set_status(StatusCode::SwitchingProtocols)?;
        self.headers.set("Upgrade", Some("websocket"))?;
        self.headers.set("Sec-WebSocket-Accept", Some(accept_key))?;
        for (name, value) in extra_headers {
            self.headers.add(name, value)?;
        }
        self.prevent_keepalive();
        Ok(Handled(()))
    }

    /// Closes the connection without writing anything. Latches the one-shot
    /// flag so nothing can be added afterwards.
    pub fn close_without_response(&mut self) -> Handled {
        self.close_without_response = true;
        self.header_written = true;
        Handled(())
    }

    /// Wipes everything except the one-shot flag, which must be unset.
    pub fn reset(&mut self, status: StatusCode) -> Result<(), HttpError> {
        self.ensure_mutable()?;
        self.status_line = status.as_line().to_owned();
        self.headers.clear();
        self.cookies.clear();
        self.body_bytes = None;
        self.compression = None;
        self.prevent_keepalive = false;
        self.close_without_response = false;
        Ok(())
    }
}

impl Response {
    /// Emits the header block in its fixed order and decides the body
    /// transport. Latches the one-shot flag.
    pub(crate) fn encode_header(&mut self, method: Method) -> Result<HeaderPlan, HttpError> {
        self.ensure_mutable()?;
        self.header_written = true;

        if method == Method::Head {
            self.body_bytes = None;
        }

        if let Some(bytes) = &self.body_bytes {
            let len = bytes.len().to_string();
            self.headers.set("Content-Length", Some(&len))?;
        }

        if self.compression.is_some() {
            self.headers.remove("Content-Length");
        }

        let code = self.status_code();
        let content_length = self.content_length()?;
        if body_forbidden(code) {
            if let Some(len) = content_length {
                if len > 0 {
                    return Err(HttpError::Internal(format!(
                        "status {code} forbids a body but Content-Length is {len}"
                    )));
                }
            }
        }
        let body_allowed = !body_forbidden(code) && method != Method::Head;

        let case = self.headers.case();
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(b"HTTP/1.1 ");
        out.extend_from_slice(self.status_line.as_bytes());
        out.extend_from_slice(b"\r\n");

        let upgrading = self
            .headers
            .get("Upgrade")
            .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
        let keep_alive = if upgrading {
            self.prevent_keepalive = true;
            push_header(&mut out, &case.normalize("Connection"), "upgrade");
            0
        } else {
            let keep_alive = self.effective_keep_alive();
            if keep_alive > 0 {
                push_header(&mut out, &case.normalize("Connection"), "keep-alive");
                let timeout = keep_alive.saturating_sub(1).clamp(1, 60);
                push_header(
                    &mut out,
                    &case.normalize("Keep-Alive"),
                    &format!("timeout={timeout}"),
                );
            } else {
                push_header(&mut out, &case.normalize("Connection"), "close");
            }
            keep_alive
        };
        self.keep_alive_seconds = keep_alive;

        let chunked = body_allowed && keep_alive > 0 && !self.headers.contains("Content-Length");
        if chunked {
            push_header(&mut out, &case.normalize("Transfer-Encoding"), "chunked");
        }

        if let Some(compression) = self.compression {
            push_header(
                &mut out,
                &case.normalize("Content-Encoding"),
                compression.token(),
            );
        }

        let set_cookie = case.normalize("Set-Cookie");
        for value in self.cookies.set_cookie_values() {
            push_header(&mut out, &set_cookie, &value);
        }

        for header in self.headers.snapshot() {
            if RESERVED_HEADERS
                .iter()
                .any(|r| r.eq_ignore_ascii_case(header.name()))
            {
                return Err(HttpError::Internal(format!(
                    "reserved header {:?} must be set through the response builder",
                    header.name()
                )));
            }
            push_header(&mut out, header.name(), header.value());
        }

        out.extend_from_slice(b"\r\n");

        let mode = if !body_allowed {
            SinkMode::Discard
        } else if chunked {
            SinkMode::Chunked
        } else if let Some(len) = content_length {
            SinkMode::Fixed(len)
        } else {
            SinkMode::Raw
        };

        Ok(HeaderPlan {
            bytes: out,
            mode,
            compression: if body_allowed { self.compression } else { None },
            body_bytes: self.body_bytes.take(),
        })
    }
}

fn push_header(out: &mut Vec<u8>, name: &str, value: &str) {
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(b": ");
    out.extend_from_slice(value.as_bytes());
    out.extend_from_slice(b"\r\n");
}
