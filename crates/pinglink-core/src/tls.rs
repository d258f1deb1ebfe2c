//! Development-only TLS for the agent side: the link is encrypted and ALPN
//! is pinned to HTTP/2, but the server certificate chain is not validated
//! (self-signed deployments).

use std::io;
use std::sync::Arc;

use hyper_util::rt::TokioIo;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{ring, verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tonic::transport::{Channel, Endpoint, Uri};

/// Accepts any server certificate. Handshake signatures are still checked
/// against the presented certificate, so the session keys are sound even
/// though the peer is unauthenticated.
#[derive(Debug)]
struct SkipServerVerification {
    provider: CryptoProvider,
}

impl SkipServerVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            provider: ring::default_provider(),
        })
    }
}

impl ServerCertVerifier for SkipServerVerification {
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
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Client TLS configuration with certificate verification skipped and ALPN
/// restricted to the HTTP/2 identifier.
pub fn insecure_client_config() -> ClientConfig {
    let mut config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(SkipServerVerification::new())
        .with_no_client_auth();
    config.alpn_protocols = vec![b"h2".to_vec()];
    config
}

/// Lazy channel over the given client TLS configuration: TCP connect plus
/// handshake happen on first use, so connectivity errors surface at
/// stream-open time rather than here.
pub fn connect_lazy_insecure(endpoint: Endpoint, tls: Arc<ClientConfig>) -> Channel {
    endpoint.connect_with_connector_lazy(tower::service_fn(move |uri: Uri| {
        let connector = TlsConnector::from(tls.clone());
        async move {
            let host = uri
                .host()
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "uri has no host"))?
                .to_string();
            let port = uri.port_u16().unwrap_or(50051);
            let stream = TcpStream::connect((host.as_str(), port)).await?;
            let domain = ServerName::try_from(host)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
            let tls_stream = connector.connect(domain, stream).await?;
            Ok::<_, io::Error>(TokioIo::new(tls_stream))
        }
    }))
}
