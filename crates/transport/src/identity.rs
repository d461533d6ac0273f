//! Client certificate identity.

use std::path::Path;
use std::sync::Arc;

use bex_deviceid::DeviceId;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};

use crate::TransportError;
use crate::tls;

/// The local device: certificate chain, private key, and the device id
/// derived from the leaf certificate.
///
/// The TLS client configuration is built once at load time; dialing
/// re-uses it for the relay hop and the peer connection alike.
#[derive(Clone)]
pub struct Identity {
    device_id: DeviceId,
    tls_config: Arc<rustls::ClientConfig>,
}

impl Identity {
    /// Loads the identity from PEM certificate and key files.
    ///
    /// The key may be PKCS#8, PKCS#1 (RSA) or SEC1 (EC); RSA-2048 and
    /// ECDSA P-256 keys are both in active use by peers.
    pub fn load(cert_path: &Path, key_path: &Path) -> Result<Self, TransportError> {
        let cert_pem = std::fs::read(cert_path)?;
        let key_pem = std::fs::read(key_path)?;
        Self::from_pem(&cert_pem, &key_pem).map_err(|error| match error {
            TransportError::MissingCertificate(_) => {
                TransportError::MissingCertificate(cert_path.display().to_string())
            }
            TransportError::MissingKey(_) => {
                TransportError::MissingKey(key_path.display().to_string())
            }
            other => other,
        })
    }

    /// Builds the identity from in-memory PEM documents.
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self, TransportError> {
        let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut &cert_pem[..])
            .collect::<Result<_, _>>()?;
        let leaf = certs
            .first()
            .ok_or_else(|| TransportError::MissingCertificate("<pem>".into()))?;
        let device_id = DeviceId::from_der(leaf.as_ref());

        let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut &key_pem[..])?
            .ok_or_else(|| TransportError::MissingKey("<pem>".into()))?;

        let tls_config = Arc::new(tls::client_config(certs, key)?);
        Ok(Self {
            device_id,
            tls_config,
        })
    }

    /// The local device id.
    #[must_use]
    pub const fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub(crate) fn tls_config(&self) -> Arc<rustls::ClientConfig> {
        Arc::clone(&self.tls_config)
    }
}
