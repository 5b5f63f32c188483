//! Stream types for IMAP connections.
//!
//! The engine is generic over [`Transport`]; [`ImapStream`] is the production
//! implementation backed by a TCP socket, plaintext or TLS via rustls.

#![allow(clippy::missing_errors_doc)]

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use rustls::pki_types::{CertificateDer, ServerName};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;

use crate::config::Config;
use crate::{Error, Result};

/// A duplex byte transport the engine can drive.
///
/// Beyond plain async I/O, a transport knows how to upgrade itself to TLS in
/// place (STARTTLS) and to expose the peer certificate once secured.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + Sized + 'static {
    /// Upgrades the transport to TLS in place, trusting `extra_roots` (DER)
    /// in addition to the built-in roots.
    fn upgrade_to_secure(
        self,
        host: &str,
        extra_roots: &[Vec<u8>],
    ) -> impl Future<Output = Result<Self>> + Send;

    /// Returns the DER-encoded leaf certificate of the peer, if secured.
    fn peer_certificate(&self) -> Option<Vec<u8>> {
        None
    }

    /// Returns true if the transport is TLS-encrypted.
    fn is_secure(&self) -> bool {
        false
    }
}

/// A stream that can be either plaintext or TLS.
pub enum ImapStream {
    /// Plaintext TCP stream.
    Plain(TcpStream),
    /// TLS-encrypted stream (boxed to reduce enum size).
    Tls(Box<TlsStream<TcpStream>>),
}

impl ImapStream {
    /// Creates a new plaintext stream.
    #[must_use]
    pub const fn plain(stream: TcpStream) -> Self {
        Self::Plain(stream)
    }

    /// Creates a new TLS stream.
    #[must_use]
    pub fn tls(stream: TlsStream<TcpStream>) -> Self {
        Self::Tls(Box::new(stream))
    }

    /// Returns true if the stream is TLS-encrypted.
    #[must_use]
    pub const fn is_tls(&self) -> bool {
        matches!(self, Self::Tls(_))
    }
}

impl Transport for ImapStream {
    fn upgrade_to_secure(
        self,
        host: &str,
        extra_roots: &[Vec<u8>],
    ) -> impl Future<Output = Result<Self>> + Send {
        async move {
            match self {
                Self::Plain(tcp) => {
                    let connector = create_tls_connector(extra_roots)?;
                    let server_name = ServerName::try_from(host.to_string())?;
                    let tls = connector.connect(server_name, tcp).await?;
                    Ok(Self::Tls(Box::new(tls)))
                }
                Self::Tls(_) => Err(Error::InvalidState("stream is already TLS".to_string())),
            }
        }
    }

    fn peer_certificate(&self) -> Option<Vec<u8>> {
        match self {
            Self::Plain(_) => None,
            Self::Tls(stream) => stream
                .get_ref()
                .1
                .peer_certificates()
                .and_then(|certs| certs.first())
                .map(|cert| cert.as_ref().to_vec()),
        }
    }

    fn is_secure(&self) -> bool {
        self.is_tls()
    }
}

impl AsyncRead for ImapStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            Self::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ImapStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            Self::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_flush(cx),
            Self::Tls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            Self::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// Creates a TLS connector with the webpki roots plus any extra DER roots.
pub fn create_tls_connector(extra_roots: &[Vec<u8>]) -> Result<TlsConnector> {
    let mut root_store = rustls::RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };
    for der in extra_roots {
        root_store.add(CertificateDer::from(der.clone()))?;
    }

    let config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Opens the transport described by `config`, honoring its connect timeout.
pub async fn connect(config: &Config) -> Result<ImapStream> {
    let connecting = TcpStream::connect((config.host.as_str(), config.port));
    let tcp = tokio::time::timeout(config.connect_timeout, connecting)
        .await
        .map_err(|_| Error::Timeout(config.connect_timeout))??;

    if config.secure {
        let connector = create_tls_connector(&config.extra_roots)?;
        let server_name = ServerName::try_from(config.host.clone())?;
        let tls = connector.connect(server_name, tcp).await?;
        Ok(ImapStream::Tls(Box::new(tls)))
    } else {
        Ok(ImapStream::Plain(tcp))
    }
}

/// Connects to a server with TLS from the start.
pub async fn connect_tls(host: &str, port: u16) -> Result<ImapStream> {
    let tcp = TcpStream::connect((host, port)).await?;
    let connector = create_tls_connector(&[])?;
    let server_name = ServerName::try_from(host.to_string())?;
    let tls = connector.connect(server_name, tcp).await?;
    Ok(ImapStream::Tls(Box::new(tls)))
}

/// Connects to a server without TLS (for STARTTLS or testing).
pub async fn connect_plain(host: &str, port: u16) -> Result<ImapStream> {
    let tcp = TcpStream::connect((host, port)).await?;
    Ok(ImapStream::Plain(tcp))
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names
)]
mod tests {
    use super::*;

    #[test]
    fn test_create_tls_connector() {
        let connector = create_tls_connector(&[]);
        assert!(connector.is_ok());
    }

    #[test]
    fn test_bogus_extra_root_rejected() {
        let connector = create_tls_connector(&[vec![0u8; 4]]);
        assert!(connector.is_err());
    }
}
