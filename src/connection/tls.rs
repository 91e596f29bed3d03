//! TLS connector construction and the STARTTLS socket upgrade.

use std::sync::Arc;

use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::{error, warn};

/// Initialize the rustls crypto provider (idempotent).
fn init_crypto_provider() {
    use std::sync::Once;
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Certificate verifier that accepts anything.
///
/// Only reachable when the connection was created with `allow_insecure` set,
/// for development servers with self-signed certificates.
#[derive(Debug)]
struct InsecureCertVerifier(Arc<rustls::crypto::CryptoProvider>);

impl rustls::client::danger::ServerCertVerifier for InsecureCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
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
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
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

/// Build a TLS connector against the platform trust roots, or a
/// verification-free one when `allow_insecure` is set.
pub(crate) fn create_connector(allow_insecure: bool) -> Result<TlsConnector, String> {
    init_crypto_provider();

    if allow_insecure {
        warn!("TLS certificate verification DISABLED for this connection");
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
        return Err(
            "No system root certificates found. TLS connections will fail. \
             Ensure CA certificates are installed (e.g., ca-certificates package on Linux)."
                .to_string(),
        );
    }
    for cert in native_certs.certs {
        root_store
            .add(cert)
            .map_err(|e| format!("Failed to add cert: {}", e))?;
    }

    let config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Upgrade an established TCP stream to TLS.
///
/// The certificate is checked against `domain`, the account domain from the
/// stream opener, not the SRV target we happened to connect to (RFC 6120
/// §13.7.2.1).
pub(crate) async fn upgrade(
    tcp_stream: TcpStream,
    domain: &str,
    allow_insecure: bool,
) -> Result<TlsStream<TcpStream>, String> {
    let connector = create_connector(allow_insecure)?;
    let server_name = ServerName::try_from(domain.to_string())
        .map_err(|e| format!("Invalid server name '{}': {}", domain, e))?;

    connector.connect(server_name, tcp_stream).await.map_err(|e| {
        let error_detail = format!("{}", e);
        let classification = if error_detail.contains("ertificate") {
            "certificate_error"
        } else if error_detail.contains("timed out") || error_detail.contains("timeout") {
            "timeout"
        } else if error_detail.contains("refused") || error_detail.contains("reset") {
            "connection_refused"
        } else {
            "other"
        };
        error!(domain, error = %e, error_class = classification, "TLS handshake failed");
        format!("TLS handshake failed ({}): {}", classification, e)
    })
}
