//! Core HTTP protocol types

/// HTTP request methods.
///
/// The engine recognizes exactly this closed set; any other token on the
/// request line is answered with `501 Not Implemented`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Connect,
    Options,
    Trace,
    Patch,
}

impl Method {
    /// Parses a request-line token. `None` for anything outside the set.
    pub fn from_token(token: &str) -> Option<Method> {
        match token {
            "GET" => Some(Method::Get),
            "HEAD" => Some(Method::Head),
            "POST" => Some(Method::Post),
            "PUT" => Some(Method::Put),
            "DELETE" => Some(Method::Delete),
            "CONNECT" => Some(Method::Connect),
            "OPTIONS" => Some(Method::Options),
            "TRACE" => Some(Method::Trace),
            "PATCH" => Some(Method::Patch),
            _ => None,
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Connect => "CONNECT",
            Method::Options => "OPTIONS",
            Method::Trace => "TRACE",
            Method::Patch => "PATCH",
        }
    }

    /// Methods that require body framing (`411 Length Required` without it).
    pub(crate) const fn requires_body_framing(&self) -> bool {
        matches!(self, Method::Post | Method::Put | Method::Patch)
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

macro_rules! set_status_codes {
    ($(
        $name:ident = ($num:expr, $str:expr);
    )+) => {
        /// The HTTP status codes the engine emits.
        ///
        /// A [`Response`](crate::Response) also accepts a free-form status
        /// line for anything outside this set.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum StatusCode { $(
            #[doc = concat!(stringify!($num), " ", $str)]
            $name = $num,
        )+ }

        impl StatusCode {
            /// The status line without the protocol prefix,
            /// e.g. `"200 OK"`.
            pub const fn as_line(&self) -> &'static str {
                match self { $(
                    StatusCode::$name => concat!($num, " ", $str),
                )+ }
            }

            pub const fn code(&self) -> u16 {
                *self as u16
            }
        }
    }
}

set_status_codes! {
    SwitchingProtocols = (101, "Switching Protocols");
    Ok = (200, "OK");
    PartialContent = (206, "Partial Content");
    Found = (302, "Found");
    NotModified = (304, "Not Modified");
    TemporaryRedirect = (307, "Temporary Redirect");
    BadRequest = (400, "Bad Request");
    MethodNotAllowed = (405, "Method Not Allowed");
    LengthRequired = (411, "Length Required");
    RequestEntityTooLarge = (413, "Request Entity Too Large");
    RangeNotSatisfiable = (416, "Requested Range Not Satisfiable");
    InternalServerError = (500, "Internal Server Error");
    NotImplemented = (501, "Not Implemented");
    ServiceUnavailable = (503, "Service Unavailable");
}

/// Whether a status code forbids a response body (1xx, 204, 205, 304).
pub(crate) const fn body_forbidden(code: u16) -> bool {
    matches!(code, 100..=199 | 204 | 205 | 304)
}
