//! TLS front door: SNI peek, certificate selection, ACME-TLS/1 diversion

use crate::errors::HttpError;
use crate::server::connection::ConnectionInfo;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::Acceptor;
use rustls::ServerConfig;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::server::TlsStream;
use tokio_rustls::LazyConfigAcceptor;

const ACME_TLS_ALPN: &[u8] = b"acme-tls/1";

/// What a listening socket accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingMode {
    /// Plain HTTP only; the front door is skipped entirely.
    Plain,
    /// TLS only; plaintext peers are dropped.
    Tls,
    /// TLS when the first byte looks like a handshake record, plain HTTP
    /// otherwise.
    Hybrid,
}

/// A certificate chain plus its private key, as the provider hands them out.
#[derive(Debug)]
pub struct TlsIdentity {
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

/// The single boundary interface between the engine and certificate
/// management.
pub trait CertificateProvider: Send + Sync + 'static {
    /// A certificate for a normal TLS session. `None` drops the connection.
    fn certificate(&self, info: &ConnectionInfo, server_name: Option<&str>) -> Option<TlsIdentity>;

    /// A certificate for ACME-TLS/1 validation of `server_name`. `None`
    /// drops the connection.
    fn acme_tls1_certificate(
        &self,
        info: &ConnectionInfo,
        server_name: Option<&str>,
    ) -> Option<TlsIdentity> {
        let _ = (info, server_name);
        None
    }
}

/// The byte stream a connection engine runs on once the front door is done
/// with it.
pub enum ServerStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl std::fmt::Debug for ServerStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerStream::Plain(_) => f.write_str("ServerStream::Plain"),
            ServerStream::Tls(_) => f.write_str("ServerStream::Tls"),
        }
    }
}

impl AsyncRead for ServerStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ServerStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            ServerStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ServerStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            ServerStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            ServerStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ServerStream::Plain(s) => Pin::new(s).poll_flush(cx),
            ServerStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ServerStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            ServerStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Where the front door routed a connection.
pub(crate) enum FrontDoor {
    /// Hand the stream to the protocol engine.
    Http {
        stream: ServerStream,
        secure: bool,
        server_name: Option<String>,
    },
    /// An ACME-TLS/1 validation handshake completed; the connection never
    /// carries HTTP and is already shut down.
    AcmeServed,
    /// Drop the socket.
    Rejected(&'static str),
}

/// First byte of a TLS handshake record.
fn looks_like_tls(first_byte: u8) -> bool {
    first_byte == 0x16
}

fn server_config(identity: TlsIdentity, alpn: Option<&[u8]>) -> Result<Arc<ServerConfig>, HttpError> {
    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(identity.cert_chain, identity.key)
        .map_err(|e| HttpError::Tls(format!("rejected certificate: {e}")))?;
    if let Some(protocol) = alpn {
        config.alpn_protocols = vec![protocol.to_vec()];
    }
    Ok(Arc::new(config))
}

/// Routes a fresh TCP connection before any HTTP bytes cross the wire.
///
/// On a TLS-capable binding the ClientHello is read without committing to a
/// configuration, SNI and ALPN are extracted, and the socket either finishes
/// an ACME-TLS/1 validation handshake, becomes a TLS session, or (on hybrid
/// bindings) continues as plain HTTP.
pub(crate) async fn front_door(
    stream: TcpStream,
    mode: BindingMode,
    provider: Option<&Arc<dyn CertificateProvider>>,
    info: &ConnectionInfo,
    handshake_timeout: Duration,
) -> Result<FrontDoor, HttpError> {
    if mode == BindingMode::Plain {
        return Ok(FrontDoor::Http {
            stream: ServerStream::Plain(stream),
            secure: false,
            server_name: None,
        });
    }

    let mut first = [0u8; 1];
    let peeked = timeout(handshake_timeout, stream.peek(&mut first))
        .await
        .map_err(|_| HttpError::Io(io::Error::new(io::ErrorKind::TimedOut, "tls peek timed out")))??;
    if peeked == 0 {
        return Ok(FrontDoor::Rejected("peer closed before the first byte"));
    }

    if !looks_like_tls(first[0]) {
        return match mode {
            BindingMode::Hybrid => Ok(FrontDoor::Http {
                stream: ServerStream::Plain(stream),
                secure: false,
                server_name: None,
            }),
            _ => Ok(FrontDoor::Rejected("plaintext bytes on a tls-only binding")),
        };
    }

    let Some(provider) = provider else {
        return Ok(FrontDoor::Rejected("tls binding without a certificate provider"));
    };

    let start = timeout(
        handshake_timeout,
        LazyConfigAcceptor::new(Acceptor::default(), stream),
    )
    .await
    .map_err(|_| HttpError::Tls("client hello timed out".into()))?
    .map_err(|e| HttpError::Tls(format!("client hello rejected: {e}")))?;

    let (server_name, acme_requested) = {
        let hello = start.client_hello();
        let server_name = hello.server_name().map(str::to_owned);
        let acme_requested = hello
            .alpn()
            .map(|mut protocols| protocols.any(|p| p == ACME_TLS_ALPN))
            .unwrap_or(false);
        (server_name, acme_requested)
    };

    if acme_requested {
        let Some(identity) = provider.acme_tls1_certificate(info, server_name.as_deref()) else {
            return Ok(FrontDoor::Rejected("no acme-tls/1 certificate available"));
        };
        let config = server_config(identity, Some(ACME_TLS_ALPN))?;
        let mut session = timeout(handshake_timeout, start.into_stream(config))
            .await
            .map_err(|_| HttpError::Tls("acme-tls/1 handshake timed out".into()))?
            .map_err(|e| HttpError::Tls(format!("acme-tls/1 handshake failed: {e}")))?;

        // The validation is the handshake itself; no HTTP ever flows.
        let _ = session.shutdown().await;
        tracing::debug!(server_name = ?server_name, "served acme-tls/1 validation handshake");
        return Ok(FrontDoor::AcmeServed);
    }

    let Some(identity) = provider.certificate(info, server_name.as_deref()) else {
        return Ok(FrontDoor::Rejected("no certificate for the requested name"));
    };
    let config = server_config(identity, None)?;
    let session = timeout(handshake_timeout, start.into_stream(config))
        .await
        .map_err(|_| HttpError::Tls("tls handshake timed out".into()))?
        .map_err(|e| HttpError::Tls(format!("tls handshake failed: {e}")))?;

    Ok(FrontDoor::Http {
        stream: ServerStream::Tls(Box::new(session)),
        secure: true,
        server_name,
    })
}
