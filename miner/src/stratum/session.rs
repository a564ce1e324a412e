//! Socket-level session: TCP connect, optional TLS handshake, and the
//! unified stream the protocol engine reads and writes.

use crate::config::{Endpoint, Security};
use rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

/// Socket-level I/O deadline. Connects, handshakes and writes that
/// stall longer than this count as a dead pool.
pub const SOCKET_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("connect to {0} failed: {1}")]
    Connect(String, io::Error),
    #[error("connect to {0} timed out")]
    ConnectTimeout(String),
    #[error("TLS setup failed: {0}")]
    Tls(String),
    #[error("TLS handshake with {0} failed: {1}")]
    Handshake(String, io::Error),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// The session's byte stream: plain TCP or TLS on top of it.
pub enum PoolStream {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for PoolStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            PoolStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            PoolStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for PoolStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            PoolStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            PoolStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            PoolStream::Plain(s) => Pin::new(s).poll_flush(cx),
            PoolStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            PoolStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            PoolStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Resolve, connect and (when configured) complete the TLS handshake.
pub async fn open(endpoint: &Endpoint) -> Result<PoolStream, SessionError> {
    let addr = format!("{}:{}", endpoint.host, endpoint.port);

    let tcp = tokio::time::timeout(SOCKET_TIMEOUT, TcpStream::connect(&addr))
        .await
        .map_err(|_| SessionError::ConnectTimeout(addr.clone()))?
        .map_err(|e| SessionError::Connect(addr.clone(), e))?;
    tcp.set_nodelay(true)?;

    if endpoint.security == Security::None {
        return Ok(PoolStream::Plain(tcp));
    }

    let connector = tls_connector(endpoint.security)?;
    let server_name = ServerName::try_from(endpoint.host.clone())
        .map_err(|e| SessionError::Tls(format!("invalid server name: {}", e)))?;

    let tls = tokio::time::timeout(SOCKET_TIMEOUT, connector.connect(server_name, tcp))
        .await
        .map_err(|_| SessionError::ConnectTimeout(addr.clone()))?
        .map_err(|e| {
            if format!("{}", e).contains("InvalidCertificate") {
                log::error!(
                    "TLS certificate verification against {} failed. If the pool \
                     uses a self-signed certificate, connect with a stratum+ssl:// \
                     scheme; otherwise update the system root store (SSL_CERT_FILE \
                     is honored on POSIX).",
                    endpoint.host
                );
            }
            SessionError::Handshake(addr.clone(), e)
        })?;

    Ok(PoolStream::Tls(Box::new(tls)))
}

fn tls_connector(security: Security) -> Result<TlsConnector, SessionError> {
    let config = match security {
        Security::TlsAllowSelfSigned => rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate))
            .with_no_client_auth(),
        Security::Tls12 => rustls::ClientConfig::builder_with_protocol_versions(&[
            &rustls::version::TLS12,
        ])
        .with_root_certificates(native_roots()?)
        .with_no_client_auth(),
        _ => rustls::ClientConfig::builder()
            .with_root_certificates(native_roots()?)
            .with_no_client_auth(),
    };
    Ok(TlsConnector::from(Arc::new(config)))
}

fn native_roots() -> Result<rustls::RootCertStore, SessionError> {
    let mut roots = rustls::RootCertStore::empty();
    let certs = rustls_native_certs::load_native_certs()
        .map_err(|e| SessionError::Tls(format!("cannot load system root store: {}", e)))?;
    let mut rejected = 0usize;
    for cert in certs {
        if roots.add(cert).is_err() {
            rejected += 1;
        }
    }
    if rejected > 0 {
        log::warn!("{} system root certificates were not parseable", rejected);
    }
    if roots.is_empty() {
        return Err(SessionError::Tls("system root store is empty".into()));
    }
    Ok(roots)
}

/// Verifier for `stratum+ssl://`: accepts whatever certificate the pool
/// presents. Signature checks still run on the handshake transcript.
#[derive(Debug)]
struct AcceptAnyCertificate;

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
        ]
    }
}
