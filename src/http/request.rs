//! The parsed request and its head parsing

use crate::errors::HttpError;
use crate::http::cookies::CookieJar;
use crate::http::headers::{HeaderCase, HeaderCollection};
use crate::http::query::ParamMap;
use crate::http::types::Method;
use crate::io::body::RequestBody;
use std::net::{IpAddr, Ipv4Addr};
use url::Url;

/// One HTTP request, built once per engine cycle and destroyed at its end.
///
/// `R` is the connection reader backing [`body`](Request::body); the engine
/// reclaims it after the body is drained.
#[derive(Debug)]
pub struct Request<R> {
    pub(crate) method: Method,
    pub(crate) protocol_version: String,
    pub(crate) url: Url,
    pub(crate) page: String,
    pub(crate) headers: HeaderCollection,
    pub(crate) query: ParamMap,
    pub(crate) post_form: ParamMap,
    pub(crate) cookies: CookieJar,
    pub(crate) connection_tokens: Vec<String>,
    pub(crate) content_length: Option<u64>,
    pub(crate) remote_ip: IpAddr,
    pub(crate) secure: bool,
    pub(crate) body: RequestBody<R>,
}

impl<R> Request<R> {
    /// Placeholder request that lives between cycles; replaced by the parser.
    pub(crate) fn placeholder() -> Self {
        Self {
            method: Method::Get,
            protocol_version: String::new(),
            url: Url::parse("http://localhost/").expect("static url"),
            page: String::new(),
            headers: HeaderCollection::new(HeaderCase::Preserve),
            query: ParamMap::new(),
            post_form: ParamMap::new(),
            cookies: CookieJar::new(),
            connection_tokens: Vec::new(),
            content_length: None,
            remote_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            secure: false,
            body: RequestBody::empty(),
        }
    }

    pub fn method(&self) -> Method {
        self.method
    }

    /// The version token from the request line, verbatim.
    pub fn protocol_version(&self) -> &str {
        &self.protocol_version
    }

    /// The absolute request URL, relative targets resolved against the
    /// per-connection base URI.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Path without the leading `/`, percent-encoding preserved.
    pub fn page(&self) -> &str {
        &self.page
    }

    pub fn headers(&self) -> &HeaderCollection {
        &self.headers
    }

    pub fn query(&self) -> &ParamMap {
        &self.query
    }

    /// Decoded form parameters; populated only for
    /// `application/x-www-form-urlencoded` bodies under the decode cap.
    pub fn post_form(&self) -> &ParamMap {
        &self.post_form
    }

    pub fn cookies(&self) -> &CookieJar {
        &self.cookies
    }

    /// Trimmed entries of the `Connection` header.
    pub fn connection_tokens(&self) -> &[String] {
        &self.connection_tokens
    }

    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    /// The peer address, possibly rewritten by the trusted-proxy stage.
    pub fn remote_ip(&self) -> IpAddr {
        self.remote_ip
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn body(&mut self) -> &mut RequestBody<R> {
        &mut self.body
    }

    pub(crate) fn has_connection_token(&self, token: &str) -> bool {
        self.connection_tokens
            .iter()
            .any(|t| t.eq_ignore_ascii_case(token))
    }
}

/// The parsed request line. `method` is `None` for tokens outside the closed
/// set, which the engine answers with `501` after consuming the full head.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct RequestLine {
    pub method: Option<Method>,
    pub method_token: String,
    pub target: String,
    pub version: String,
}

/// Splits `METHOD TARGET VERSION` - exactly three space-separated tokens.
pub(crate) fn parse_request_line(line: &[u8]) -> Result<RequestLine, HttpError> {
    let text = simdutf8::basic::from_utf8(line)
        .map_err(|_| HttpError::ProtocolViolation("request line is not valid utf-8".into()))?;

    let mut tokens = text.split(' ');
    let (Some(method_token), Some(target), Some(version), None) =
        (tokens.next(), tokens.next(), tokens.next(), tokens.next())
    else {
        return Err(HttpError::ProtocolViolation(
            "request line must be three space-separated tokens".into(),
        ));
    };
    if method_token.is_empty() || target.is_empty() || version.is_empty() {
        return Err(HttpError::ProtocolViolation("empty request line token".into()));
    }

    Ok(RequestLine {
        method: Method::from_token(method_token),
        method_token: method_token.to_owned(),
        target: target.to_owned(),
        version: version.to_owned(),
    })
}

/// Splits a head line into name and value. The value is everything after the
/// first `:` with leading spaces stripped.
pub(crate) fn parse_header_line(line: &[u8]) -> Result<(String, String), HttpError> {
    let text = simdutf8::basic::from_utf8(line)
        .map_err(|_| HttpError::BadHeader("header line is not valid utf-8".into()))?;

    let Some((name, value)) = text.split_once(':') else {
        return Err(HttpError::BadHeader(format!("header line without ':': {text:?}")));
    };
    Ok((name.to_owned(), value.trim_start_matches(' ').to_owned()))
}

/// Resolves the request target: absolute-form targets are parsed directly,
/// anything else against the per-connection base URI.
pub(crate) fn resolve_target(base: &Url, target: &str) -> Result<Url, HttpError> {
    let absolute = ["http://", "https://", "ws://", "wss://"]
        .iter()
        .any(|scheme| target.starts_with(scheme));

    let result = if absolute {
        Url::parse(target)
    } else {
        base.join(target)
    };
    result.map_err(|e| HttpError::ProtocolViolation(format!("unparseable request target: {e}")))
}

/// The path without its leading `/`, percent-encoding untouched.
pub(crate) fn page_from_url(url: &Url) -> String {
    url.path().trim_start_matches('/').to_owned()
}

/// Strips a configured application prefix from `page`.
pub(crate) fn strip_app_path(page: &str, app_path: &str) -> Option<String> {
    let prefix = app_path.trim_matches('/');
    if prefix.is_empty() {
        return None;
    }
    let rest = page.strip_prefix(prefix)?;
    if rest.is_empty() {
        return Some(String::new());
    }
    rest.strip_prefix('/').map(str::to_owned)
}

/// How the request body is framed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyFraming {
    None,
    Sized(u64),
    Chunked,
}

/// The framing decision of the parser.
///
/// `Content-Length` wins; otherwise `Transfer-Encoding` must be the single
/// token `chunked`; otherwise methods that carry a payload get
/// `411 Length Required`. `TRACE` never reads a body.
pub(crate) fn body_framing(
    method: Option<Method>,
    headers: &HeaderCollection,
) -> Result<BodyFraming, HttpError> {
    if method == Some(Method::Trace) {
        return Ok(BodyFraming::None);
    }

    if let Some(value) = headers.get("Content-Length") {
        let len: u64 = value.trim().parse().map_err(|_| {
            HttpError::ProtocolViolation(format!("unparseable Content-Length: {value:?}"))
        })?;
        return Ok(BodyFraming::Sized(len));
    }

    if let Some(value) = headers.get("Transfer-Encoding") {
        if value.trim().eq_ignore_ascii_case("chunked") {
            return Ok(BodyFraming::Chunked);
        }
        return Err(HttpError::ProtocolViolation(format!(
            "unsupported Transfer-Encoding: {value:?}"
        )));
    }

    match method {
        Some(m) if m.requires_body_framing() => Err(HttpError::LengthRequired),
        _ => Ok(BodyFraming::None),
    }
}

/// Parses the `Connection` header into trimmed tokens.
pub(crate) fn connection_tokens(headers: &HeaderCollection) -> Vec<String> {
    headers
        .get("Connection")
        .map(|value| {
            value
                .split(',')
                .map(|token| token.trim().to_owned())
                .filter(|token| !token.is_empty())
                .collect()
        })
        .unwrap_or_default()
}
