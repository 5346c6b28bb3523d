//! hearth_web - Embeddable HTTP/1.1 server library
//!
//! A per-connection protocol engine for HTTP/1.1 with persistent connections,
//! chunked transfer encoding, streaming response compression, static file
//! serving with conditional GET and byte ranges, WebSocket upgrades, and a
//! TLS front door that routes on Server Name Indication before the first
//! HTTP byte crosses the wire.
//!
//! # Protocol Support
//!
//! - **HTTP/1.1**: full protocol with keep-alive, `Content-Length` and
//!   `chunked` request bodies, chunked and compressed responses
//! - **HTTP/1.0**: served with `Connection: close` unless the client opts
//!   into keep-alive
//! - **TLS 1.2/1.3**: certificate selection by SNI, with ACME-TLS/1
//!   (`acme-tls/1` ALPN) validation handled before any HTTP processing
//!
//! # Features
//!
//! ## 🔒 Security & Protection
//! - **Conservative limits by default** - header, body, and drain budgets
//!   that shut down abusive peers instead of buffering them.
//! - **Connection filtering** - implement [`ConnectionFilter`] to reject
//!   unwanted peers at the TCP level, before any parsing happens.
//! - **Load shedding** - a hard connection cap answered with a prebuilt
//!   `503`, and a high-load mode that disables keep-alive.
//!
//! ## 🌐 Protocol & Management
//! - **One engine per connection** - [`HttpConnection`] drives every
//!   request/response cycle on its socket and nothing else touches it.
//! - **Trusted proxy support** - `X-Real-IP`, `X-Forwarded-For` and
//!   `X-Forwarded-Proto` rewriting behind a [`ProxyTrust`] predicate.
//! - **Static files** - ETags, conditional GET, single and multipart byte
//!   ranges, negotiated gzip/deflate/brotli compression.
//!
//! # Quick Start
//!
//! ```no_run
//! use hearth_web::{Server, Handler, Handled, HttpConnection, HttpError, StatusCode};
//! use tokio::net::TcpListener;
//!
//! struct MyHandler;
//!
//! impl Handler for MyHandler {
//!     async fn handle(
//!         &self,
//!         conn: &mut HttpConnection<hearth_web::ServerStream>,
//!     ) -> Result<Handled, HttpError> {
//!         conn.response_mut()
//!             .full_response_utf8("Hello World!", "text/plain; charset=utf-8", StatusCode::Ok)
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     Server::builder()
//!         .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
//!         .handler(MyHandler)
//!         .build()
//!         .launch()
//!         .await;
//! }
//! ```
pub(crate) mod http {
    pub mod cookies;
    pub mod headers;
    pub mod query;
    pub mod request;
    pub mod response;
    pub mod types;
}
pub mod io {
    pub mod body;
    pub mod chunked;
    pub mod compress;
    pub mod recv;
    pub mod substream;
}
pub(crate) mod files {
    pub mod etag;
    pub mod mime;
    pub mod range;
    pub mod responder;
}
pub(crate) mod server {
    pub mod connection;
    pub mod counters;
    pub mod server_impl;
    pub mod tls;
    pub mod websocket;
}
pub(crate) mod errors;
pub mod limits;

pub use crate::{
    errors::HttpError,
    files::{
        mime::{mime_from_extension, MimeLookup, StaticMime},
        responder::FileOptions,
    },
    http::{
        cookies::{Cookie, CookieJar},
        headers::{Header, HeaderCase, HeaderCollection},
        query::ParamMap,
        request::Request,
        response::{Handled, Response},
        types::{Method, StatusCode},
    },
    io::{
        body::{RequestBody, ResponseBody},
        compress::{Compression, CompressionMethod},
    },
    server::{
        connection::{
            CancelToken, ConnectionInfo, EngineReader, EngineState, HttpConnection, Stream,
            Upgraded,
        },
        counters::{ConnectionSnapshot, ServerCounters},
        server_impl::{ConnectionFilter, Handler, ProxyTrust, Server, ServerBuilder},
        tls::{BindingMode, CertificateProvider, ServerStream, TlsIdentity},
        websocket,
    },
};
