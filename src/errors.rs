use std::io;
use thiserror::Error;

/// Every failure the protocol engine can produce.
///
/// Each request/response cycle has a single catch point in the connection
/// engine which maps one of these into a best-effort error response, provided
/// the response header has not been emitted yet. Kinds without a
/// [`status_line`](HttpError::status_line) close the socket silently.
#[derive(Debug, Error)]
pub enum HttpError {
    /// Malformed request or response framing on the wire.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Invalid header name or value, or an oversize header.
    #[error("bad header: {0}")]
    BadHeader(String),

    /// A bounded input (header line, form body) exceeded its cap.
    #[error("request too large: {0}")]
    RequestTooLarge(&'static str),

    /// POST/PUT/PATCH without `Content-Length` or `chunked` framing.
    #[error("length required")]
    LengthRequired,

    /// Request method outside the closed set of nine.
    #[error("method not implemented: {0}")]
    NotImplementedMethod(String),

    /// Reversed or overlapping byte ranges.
    #[error("invalid byte range")]
    RangeInvalid,

    /// Every requested byte range falls outside the resource.
    #[error("no satisfiable byte range")]
    RangeUnsatisfiable,

    /// Fewer body bytes were written than `Content-Length` promised.
    #[error("response body incomplete: promised {promised} bytes, wrote {written}")]
    IncompleteBody { promised: u64, written: u64 },

    /// An unread request body exceeded the drain budget.
    #[error("request body exceeds drain budget")]
    BodyNotDrained,

    /// The engine's cancellation token fired at a suspension point.
    #[error("operation cancelled")]
    Cancelled,

    /// TLS handshake or certificate selection failure.
    #[error("tls failure: {0}")]
    Tls(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    /// Anything unexpected, including handler programming errors caught
    /// before bytes hit the wire.
    #[error("internal error: {0}")]
    Internal(String),
}

impl HttpError {
    /// The status line of the best-effort error response, or `None` when the
    /// error is fatal-and-silent (the socket is just closed).
    pub fn status_line(&self) -> Option<&'static str> {
        match self {
            HttpError::ProtocolViolation(_) | HttpError::BadHeader(_) | HttpError::RangeInvalid => {
                Some("400 Bad Request")
            }
            HttpError::RequestTooLarge(_) => Some("413 Request Entity Too Large"),
            HttpError::LengthRequired => Some("411 Length Required"),
            HttpError::NotImplementedMethod(_) => Some("501 Not Implemented"),
            HttpError::RangeUnsatisfiable => Some("416 Requested Range Not Satisfiable"),
            HttpError::Internal(_) => Some("500 Internal Server Error"),
            HttpError::IncompleteBody { .. }
            | HttpError::BodyNotDrained
            | HttpError::Cancelled
            | HttpError::Tls(_)
            | HttpError::Io(_) => None,
        }
    }

    /// Whether the connection may continue serving requests after the error
    /// response. Only an unrecognized method leaves the connection usable:
    /// its head was fully read, so the stream is still in sync.
    pub fn keep_alive_allowed(&self) -> bool {
        matches!(self, HttpError::NotImplementedMethod(_))
    }

    /// The quiet-disconnect classifier.
    ///
    /// Peers vanish constantly; a reset, EOF at idle, a timed-out read or a
    /// cancellation is routine and must not produce an error response or a
    /// noisy log line.
    pub fn is_ordinary_disconnect(&self) -> bool {
        match self {
            HttpError::Cancelled => true,
            HttpError::Io(e) => !matches!(
                e.kind(),
                io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        #[rustfmt::skip]
        let cases = [
            (HttpError::ProtocolViolation("x".into()), Some("400 Bad Request")),
            (HttpError::BadHeader("x".into()),         Some("400 Bad Request")),
            (HttpError::RangeInvalid,                  Some("400 Bad Request")),
            (HttpError::RequestTooLarge("form"),       Some("413 Request Entity Too Large")),
            (HttpError::LengthRequired,                Some("411 Length Required")),
            (HttpError::NotImplementedMethod("BREW".into()), Some("501 Not Implemented")),
            (HttpError::RangeUnsatisfiable,            Some("416 Requested Range Not Satisfiable")),
            (HttpError::Internal("x".into()),          Some("500 Internal Server Error")),
            (HttpError::BodyNotDrained,                None),
            (HttpError::Cancelled,                     None),
            (HttpError::IncompleteBody { promised: 2, written: 1 }, None),
        ];

        for (error, expected) in cases {
            assert_eq!(error.status_line(), expected, "{error:?}");
        }
    }

    #[test]
    fn keep_alive_only_for_unknown_method() {
        assert!(HttpError::NotImplementedMethod("BREW".into()).keep_alive_allowed());
        assert!(!HttpError::LengthRequired.keep_alive_allowed());
        assert!(!HttpError::ProtocolViolation("x".into()).keep_alive_allowed());
    }

    #[test]
    fn disconnect_classifier() {
        let eof = HttpError::Io(io::Error::new(io::ErrorKind::UnexpectedEof, "eof"));
        let reset = HttpError::Io(io::Error::new(io::ErrorKind::ConnectionReset, "rst"));
        let timeout = HttpError::Io(io::Error::new(io::ErrorKind::TimedOut, "t"));
        let invalid = HttpError::Io(io::Error::new(io::ErrorKind::InvalidInput, "bug"));

        assert!(eof.is_ordinary_disconnect());
        assert!(reset.is_ordinary_disconnect());
        assert!(timeout.is_ordinary_disconnect());
        assert!(HttpError::Cancelled.is_ordinary_disconnect());

        assert!(!invalid.is_ordinary_disconnect());
        assert!(!HttpError::BodyNotDrained.is_ordinary_disconnect());
        assert!(!HttpError::Internal("x".into()).is_ordinary_disconnect());
    }
}
