//! Fingerprint-pinned TLS plumbing.
//!
//! Peers and relays use self-signed certificates with arbitrary subject
//! names, so chain and hostname validation are disabled outright. The
//! verifier still checks handshake signatures against the presented leaf
//! certificate; trust is then established by comparing the leaf's SHA-256
//! fingerprint with the expected device id after the handshake completes.

use std::sync::Arc;

use bex_deviceid::DeviceId;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
use rustls::{DigitallySignedStruct, SignatureScheme};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;

use crate::{HANDSHAKE_TIMEOUT, TransportError};

/// Accepts any certificate chain while still verifying handshake
/// signatures; identity is pinned by fingerprint elsewhere.
#[derive(Debug)]
struct AcceptAnyServerCert {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyServerCert {
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

/// Builds the client configuration: our certificate for mutual TLS, no
/// chain validation of the peer.
pub(crate) fn client_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<rustls::ClientConfig, rustls::Error> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert { provider }))
        .with_client_auth_cert(certs, key)?;
    Ok(config)
}

/// Runs the TLS client handshake over an established TCP stream.
pub(crate) async fn upgrade(
    tcp: TcpStream,
    host: &str,
    config: Arc<rustls::ClientConfig>,
    step: &'static str,
) -> Result<TlsStream<TcpStream>, TransportError> {
    let server_name = ServerName::try_from(host.to_owned())
        .map_err(|_| TransportError::InvalidEndpoint(format!("bad host name '{host}'")))?;
    let connector = TlsConnector::from(config);
    tokio::time::timeout(HANDSHAKE_TIMEOUT, connector.connect(server_name, tcp))
        .await
        .map_err(|_| TransportError::HandshakeTimeout(step))?
        .map_err(TransportError::from)
}

/// Derives the device id of the TLS peer from its leaf certificate.
pub(crate) fn peer_device_id(
    stream: &TlsStream<TcpStream>,
) -> Result<DeviceId, TransportError> {
    let (_, session) = stream.get_ref();
    let leaf = session
        .peer_certificates()
        .and_then(|chain| chain.first())
        .ok_or(TransportError::MissingPeerCertificate)?;
    Ok(DeviceId::from_der(leaf.as_ref()))
}
