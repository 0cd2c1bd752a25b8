//! Byte transport: TCP connect with timeout and optional direct TLS (rustls).

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::{error, info, warn};

use super::dns::{resolve_endpoints, XmppEndpoint};
use super::ConnectionConfig;
use crate::error::ConnectionError;

/// Any bidirectional byte stream the engine can run over.
pub trait XmppStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> XmppStream for T {}

pub type BoxedStream = Box<dyn XmppStream>;

/// Inbound half handed to the framing reader.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Install the ring crypto provider once per process.
pub fn init_crypto_provider() {
    use std::sync::Once;
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Accepts every server certificate. Only installed when the configuration
/// explicitly asks for insecure TLS (self-signed development servers).
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

/// TLS connector over the system's native roots, or over the accept-all
/// verifier when `insecure` is set.
pub fn create_tls_connector(insecure: bool) -> Result<TlsConnector, ConnectionError> {
    if insecure {
        warn!("TLS certificate verification DISABLED (insecure_tls)");
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
        return Err(ConnectionError::TlsHandshakeFailed(
            "no system root certificates found".to_string(),
        ));
    }
    for cert in native_certs.certs {
        root_store
            .add(cert)
            .map_err(|e| ConnectionError::TlsHandshakeFailed(format!("bad root cert: {}", e)))?;
    }

    let config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    Ok(TlsConnector::from(Arc::new(config)))
}

async fn upgrade_to_tls(
    tcp_stream: TcpStream,
    tls_name: &str,
    insecure: bool,
    timeout: Duration,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>, ConnectionError> {
    let connector = create_tls_connector(insecure)?;
    let server_name = ServerName::try_from(tls_name.to_string()).map_err(|e| {
        ConnectionError::TlsHandshakeFailed(format!("invalid server name {}: {}", tls_name, e))
    })?;

    let handshake = tokio::time::timeout(timeout, connector.connect(server_name, tcp_stream))
        .await
        .map_err(|_| {
            error!(tls_name, timeout_secs = timeout.as_secs(), "TLS handshake timed out");
            ConnectionError::TlsHandshakeFailed(format!(
                "{} (timeout): no handshake after {}ms",
                tls_name,
                timeout.as_millis()
            ))
        })?;

    handshake.map_err(|e| {
        let detail = e.to_string();
        let classification = if detail.contains("ertificate") {
            "certificate_error"
        } else if detail.contains("timed out") || detail.contains("timeout") {
            "timeout"
        } else if detail.contains("refused") || detail.contains("reset") {
            "connection_refused"
        } else {
            "other"
        };
        error!(tls_name, error = %e, error_class = classification, "TLS handshake failed");
        ConnectionError::TlsHandshakeFailed(format!("{} ({}): {}", tls_name, classification, e))
    })
}

async fn connect_tcp(host: &str, port: u16, timeout: Duration) -> Result<TcpStream, ConnectionError> {
    tokio::time::timeout(timeout, TcpStream::connect((host, port)))
        .await
        .map_err(|_| {
            error!(host, port, timeout_secs = timeout.as_secs(), "TCP connect timed out");
            ConnectionError::ConnectTimeout {
                host: host.to_string(),
                port,
                secs: timeout.as_secs(),
            }
        })?
        .map_err(|e| {
            error!(host, port, error = %e, error_kind = ?e.kind(), "TCP connect failed");
            ConnectionError::ConnectFailed {
                host: host.to_string(),
                port,
                reason: e.to_string(),
            }
        })
}

/// Connect to a single endpoint.
pub async fn connect_endpoint(
    endpoint: &XmppEndpoint,
    config: &ConnectionConfig,
) -> Result<BoxedStream, ConnectionError> {
    let tcp_stream = connect_tcp(&endpoint.host, endpoint.port, config.connect_timeout).await?;
    if !endpoint.use_tls {
        info!(host = %endpoint.host, port = endpoint.port, "Connected (TCP)");
        return Ok(Box::new(tcp_stream));
    }

    init_crypto_provider();
    let tls_stream = upgrade_to_tls(
        tcp_stream,
        endpoint.tls_name(),
        config.insecure_tls,
        config.connect_timeout,
    )
    .await?;
    info!(host = %endpoint.host, port = endpoint.port,
        tls_name = endpoint.tls_name(), "Connected (direct TLS)");
    Ok(Box::new(tls_stream))
}

/// Resolve and connect, trying candidates in order. The last failure is
/// returned when none of them accepts.
pub async fn open_stream(config: &ConnectionConfig) -> Result<BoxedStream, ConnectionError> {
    let endpoints = resolve_endpoints(config).await;
    let mut last_error = None;

    for endpoint in &endpoints {
        match connect_endpoint(endpoint, config).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                warn!(host = %endpoint.host, port = endpoint.port, error = %e,
                    "Endpoint failed, trying next candidate");
                last_error = Some(e);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| {
        ConnectionError::DnsResolutionFailed(format!(
            "no endpoint for {}",
            config.server_host()
        ))
    }))
}
