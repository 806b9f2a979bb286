//! TLS plumbing: connector construction and the plain-or-TLS stream.
//!
//! The negotiation sequence starts on a plain TCP socket and may upgrade
//! it in place when the server offers `<starttls/>`. `XmppStream` is the
//! single stream type the pipeline is spawned over, so the reader and
//! writer tasks never care whether TLS happened.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{self, ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::warn;

use crate::error::{Result, StreamEngineError};

/// Initialize the rustls crypto provider (idempotent)
pub(crate) fn init_crypto_provider() {
    use std::sync::Once;
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// TLS certificate verifier that accepts all certificates without
/// validation.
///
/// **DANGEROUS**: only reachable through the explicit
/// `accept_invalid_certs` configuration switch, for test servers with
/// self-signed certificates.
#[derive(Debug)]
struct InsecureCertVerifier(Arc<rustls::crypto::CryptoProvider>);

impl rustls::client::danger::ServerCertVerifier for InsecureCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

/// Build a TLS connector: caller-supplied client config when present,
/// otherwise the system's native root certificates.
pub(crate) fn build_connector(
    custom: Option<Arc<ClientConfig>>,
    accept_invalid_certs: bool,
) -> Result<TlsConnector> {
    init_crypto_provider();

    if let Some(config) = custom {
        return Ok(TlsConnector::from(config));
    }

    if accept_invalid_certs {
        warn!("TLS certificate verification DISABLED (accept_invalid_certs)");
        let provider = rustls::crypto::ring::default_provider();
        let config = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureCertVerifier(Arc::new(provider))))
            .with_no_client_auth();
        return Ok(TlsConnector::from(Arc::new(config)));
    }

    let mut root_store = RootCertStore::empty();
    let native_certs = rustls_native_certs::load_native_certs();
    if native_certs.certs.is_empty() {
        return Err(StreamEngineError::ConfigurationConflict(
            "no system root certificates found; TLS connections cannot be verified".into(),
        ));
    }
    for cert in native_certs.certs {
        root_store
            .add(cert)
            .map_err(|e| StreamEngineError::ConfigurationConflict(format!("bad root cert: {e}")))?;
    }

    let config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    Ok(TlsConnector::from(Arc::new(config)))
}

/// The socket as the pipeline sees it: plain TCP or upgraded to TLS
pub(crate) enum XmppStream {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl XmppStream {
    /// Upgrade the plain socket to TLS using `server_name` for SNI. A
    /// no-op error on an already-secured stream.
    pub(crate) async fn upgrade_to_tls(
        self,
        connector: &TlsConnector,
        server_name: &str,
    ) -> Result<XmppStream> {
        match self {
            XmppStream::Plain(tcp) => {
                let name = ServerName::try_from(server_name.to_string()).map_err(|e| {
                    StreamEngineError::ConfigurationConflict(format!(
                        "invalid TLS server name '{server_name}': {e}"
                    ))
                })?;
                let tls = connector
                    .connect(name, tcp)
                    .await
                    .map_err(|e| StreamEngineError::IoFailure(format!("TLS handshake: {e}")))?;
                Ok(XmppStream::Tls(Box::new(tls)))
            }
            XmppStream::Tls(_) => Err(StreamEngineError::StateConflict(
                "stream is already secured".into(),
            )),
        }
    }

    pub(crate) fn is_secure(&self) -> bool {
        matches!(self, XmppStream::Tls(_))
    }
}

impl AsyncRead for XmppStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            XmppStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            XmppStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for XmppStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            XmppStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            XmppStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            XmppStream::Plain(s) => Pin::new(s).poll_flush(cx),
            XmppStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            XmppStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            XmppStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}
