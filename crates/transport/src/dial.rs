//! Endpoint parsing and connection establishment.

use std::fmt;
use std::str::FromStr;

use bex_deviceid::DeviceId;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tracing::{debug, info};
use url::Url;

use crate::identity::Identity;
use crate::{HANDSHAKE_TIMEOUT, TransportError, relay, tls};

/// A parsed dialable endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Endpoint {
    /// Direct TLS connection to the peer.
    Tcp {
        /// Peer host.
        host: String,
        /// Peer port.
        port: u16,
    },
    /// Session brokered through a rendezvous relay.
    Relay {
        /// Relay host.
        host: String,
        /// Relay port.
        port: u16,
        /// Expected relay identity from the `id` query parameter.
        relay_id: DeviceId,
    },
}

impl Endpoint {
    /// Parses `tcp://host:port` or `relay://host:port?id=<device-id>`.
    pub fn parse(input: &str) -> Result<Self, TransportError> {
        let url = Url::parse(input)
            .map_err(|error| TransportError::InvalidEndpoint(format!("{input}: {error}")))?;
        let host = url
            .host_str()
            .ok_or_else(|| TransportError::InvalidEndpoint(format!("{input}: missing host")))?
            .to_owned();
        let port = url
            .port()
            .ok_or_else(|| TransportError::InvalidEndpoint(format!("{input}: missing port")))?;

        match url.scheme() {
            "tcp" => Ok(Self::Tcp { host, port }),
            "relay" => {
                let id = url
                    .query_pairs()
                    .find(|(name, _)| name == "id")
                    .map(|(_, value)| value.into_owned())
                    .ok_or_else(|| {
                        TransportError::InvalidEndpoint(format!("{input}: missing id parameter"))
                    })?;
                let relay_id = DeviceId::parse(&id).map_err(|error| {
                    TransportError::InvalidEndpoint(format!("{input}: bad relay id: {error}"))
                })?;
                Ok(Self::Relay {
                    host,
                    port,
                    relay_id,
                })
            }
            other => Err(TransportError::UnsupportedScheme(other.to_owned())),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
            Self::Relay { host, port, .. } => write!(f, "relay://{host}:{port}"),
        }
    }
}

impl FromStr for Endpoint {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Concrete stream type produced by [`dial`].
pub type PeerStream = TlsStream<TcpStream>;

/// An authenticated connection to the peer.
pub struct TlsConnection {
    /// The upgraded stream; ready for the BEP hello.
    pub stream: PeerStream,
    /// The endpoint the stream was dialed through.
    pub endpoint: Endpoint,
}

/// Dials the endpoint and authenticates the peer by fingerprint.
///
/// Both variants end in the same place: a mutual-TLS stream whose leaf
/// certificate hashes to `expected_peer`. A mismatch is fatal and the
/// socket is dropped.
pub async fn dial(
    endpoint: Endpoint,
    expected_peer: &DeviceId,
    identity: &Identity,
) -> Result<TlsConnection, TransportError> {
    let stream = match &endpoint {
        Endpoint::Tcp { host, port } => {
            debug!(%endpoint, "dialing peer directly");
            let tcp = timeout(HANDSHAKE_TIMEOUT, TcpStream::connect((host.as_str(), *port)))
                .await
                .map_err(|_| TransportError::HandshakeTimeout("peer connect"))??;
            tls::upgrade(tcp, host, identity.tls_config(), "peer TLS handshake").await?
        }
        Endpoint::Relay {
            host,
            port,
            relay_id,
        } => {
            debug!(%endpoint, "brokering relay session");
            let session =
                relay::broker_session(host, *port, relay_id, expected_peer, identity).await?;
            tls::upgrade(session, host, identity.tls_config(), "peer TLS handshake").await?
        }
    };

    let actual = tls::peer_device_id(&stream)?;
    if actual != *expected_peer {
        return Err(TransportError::PeerAuthFailed {
            expected: *expected_peer,
            actual,
        });
    }
    info!(peer = %actual, %endpoint, "peer authenticated");

    Ok(TlsConnection { stream, endpoint })
}
