//! Stream types for accepted POP3 connections.

#![allow(clippy::missing_errors_doc)]

use std::fs;
use std::io;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use rustls::RootCertStore;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::server::TlsStream;

use crate::config::TlsConfig;
use crate::{Error, Result};

/// An accepted stream that can be either plaintext or TLS.
pub enum ServerStream {
    /// Plaintext TCP stream.
    Plain(TcpStream),
    /// TLS-encrypted stream (boxed to reduce enum size).
    Tls(Box<TlsStream<TcpStream>>),
}

impl ServerStream {
    /// Wraps a socket, performing the TLS handshake if `acceptor` is set.
    pub async fn accept(tcp: TcpStream, acceptor: Option<&TlsAcceptor>) -> Result<Self> {
        match acceptor {
            Some(acceptor) => {
                let tls = acceptor.accept(tcp).await?;
                Ok(Self::Tls(Box::new(tls)))
            }
            None => Ok(Self::Plain(tcp)),
        }
    }

    /// Returns true if the stream is TLS-encrypted.
    #[must_use]
    pub const fn is_tls(&self) -> bool {
        matches!(self, Self::Tls(_))
    }
}

impl AsyncRead for ServerStream {
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

impl AsyncWrite for ServerStream {
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

/// Creates a TLS acceptor from PEM files.
///
/// With a CA file, clients may present a certificate signed by it; clients
/// without one are still accepted.
pub fn create_tls_acceptor(config: &TlsConfig) -> Result<TlsAcceptor> {
    let certs = load_certs(&config.cert_path)?;
    let key = load_key(&config.key_path)?;

    let builder = rustls::ServerConfig::builder();
    let builder = match &config.ca_path {
        Some(ca_path) => {
            let mut roots = RootCertStore::empty();
            for cert in load_certs(ca_path)? {
                roots.add(cert)?;
            }
            let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
                .allow_unauthenticated()
                .build()
                .map_err(|e| Error::Config(format!("invalid client CA: {e}")))?;
            builder.with_client_cert_verifier(verifier)
        }
        None => builder.with_no_client_auth(),
    };

    let server_config = builder
        .with_single_cert(certs, key)
        .map_err(|e| Error::Config(format!("invalid TLS config: {e}")))?;

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let pem = fs::read(path).map_err(|e| {
        Error::Config(format!("failed to read certificate '{}': {e}", path.display()))
    })?;

    let certs = rustls_pemfile::certs(&mut &pem[..])
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Config(format!("failed to parse certificates: {e}")))?;

    if certs.is_empty() {
        return Err(Error::Config(format!(
            "no certificate found in '{}'",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let pem = fs::read(path)
        .map_err(|e| Error::Config(format!("failed to read key '{}': {e}", path.display())))?;

    rustls_pemfile::private_key(&mut &pem[..])
        .map_err(|e| Error::Config(format!("failed to parse private key: {e}")))?
        .ok_or_else(|| Error::Config("no private key found".to_string()))
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
    use std::path::PathBuf;

    use super::*;

    fn temp_file(name: &str, contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("maildrop-{}-{name}", std::process::id()));
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_missing_files_fail() {
        let config = TlsConfig {
            cert_path: PathBuf::from("/nonexistent/cert.pem"),
            key_path: PathBuf::from("/nonexistent/key.pem"),
            ca_path: None,
        };
        assert!(matches!(create_tls_acceptor(&config), Err(Error::Config(_))));
    }

    #[test]
    fn test_file_without_pem_blocks_fails() {
        let cert = temp_file("cert.pem", "not a certificate\n");
        let key = temp_file("key.pem", "not a key\n");
        let config = TlsConfig {
            cert_path: cert.clone(),
            key_path: key.clone(),
            ca_path: None,
        };

        let result = create_tls_acceptor(&config);
        let _ = fs::remove_file(cert);
        let _ = fs::remove_file(key);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_plain_accept() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(TcpStream::connect(addr));

        let (tcp, _) = listener.accept().await.unwrap();
        let stream = ServerStream::accept(tcp, None).await.unwrap();
        assert!(!stream.is_tls());
        client.await.unwrap().unwrap();
    }
}
