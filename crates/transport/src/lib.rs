#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! Connection establishment for the BEP client: loading the client
//! certificate identity, dialing `tcp://` endpoints directly or brokering
//! a session through a `relay://` rendezvous, and wrapping the resulting
//! socket in mutual TLS.
//!
//! # Design
//!
//! Peers present self-signed certificates, so the TLS layer performs no
//! chain validation at all; identity rests solely on comparing the
//! SHA-256 fingerprint of the presented leaf certificate against the
//! expected [`DeviceId`](bex_deviceid::DeviceId). Handshake signatures
//! are still cryptographically verified, which binds the fingerprint to
//! the session. Every relay handshake step runs under a hard 10-second
//! timeout, and sockets are dropped on all error paths.

mod dial;
mod identity;
mod relay;
mod tls;

use std::io;

use bex_deviceid::DeviceId;
use bex_protocol::relay::RelayError;

pub use dial::{Endpoint, PeerStream, TlsConnection, dial};
pub use identity::Identity;

/// Hard per-step timeout for connection and relay handshakes.
pub const HANDSHAKE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// Idle timeout applied by the session layer to the upgraded stream.
pub const IDLE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(270);

/// Errors produced while establishing a connection.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The endpoint URL used a scheme other than `tcp` or `relay`.
    #[error("unsupported endpoint scheme '{0}'")]
    UnsupportedScheme(String),

    /// The endpoint URL was structurally unusable.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// The peer's certificate fingerprint did not match the expected id.
    #[error("peer authentication failed: expected {expected}, got {actual}")]
    PeerAuthFailed {
        /// Identity we dialed.
        expected: DeviceId,
        /// Identity derived from the presented certificate.
        actual: DeviceId,
    },

    /// The relay's certificate fingerprint did not match the URL's id.
    #[error("relay authentication failed: expected {expected}, got {actual}")]
    RelayAuthFailed {
        /// Identity from the `id` query parameter.
        expected: DeviceId,
        /// Identity derived from the presented certificate.
        actual: DeviceId,
    },

    /// The relay refused the session join.
    #[error("relay session failed with code {code}: {message}")]
    RelaySessionFailed {
        /// Non-zero relay response code.
        code: u32,
        /// Relay-provided detail.
        message: String,
    },

    /// The relay answered with a message we did not expect at that step.
    #[error("unexpected relay message during {0}")]
    UnexpectedRelayMessage(&'static str),

    /// A handshake step exceeded [`HANDSHAKE_TIMEOUT`].
    #[error("timed out during {0}")]
    HandshakeTimeout(&'static str),

    /// The TLS session exposed no peer certificate.
    #[error("peer presented no certificate")]
    MissingPeerCertificate,

    /// No CERTIFICATE section in the identity PEM file.
    #[error("no certificate found in {0}")]
    MissingCertificate(String),

    /// No usable private key in the identity PEM file.
    #[error("no private key found in {0}")]
    MissingKey(String),

    /// Relay frame codec failure.
    #[error("relay protocol error: {0}")]
    Relay(#[from] RelayError),

    /// TLS layer failure.
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// Socket failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
