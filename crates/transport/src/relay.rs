//! Relay session brokering.
//!
//! Two-step handshake against a rendezvous relay (spoken over the frame
//! format in [`bex_protocol::relay`]):
//!
//! 1. TLS-connect to the relay, authenticate its fingerprint against the
//!    id from the endpoint URL, send a `ConnectRequest` naming the peer,
//!    and wait for a `SessionInvitation`.
//! 2. Open a plain TCP connection to the invited port on the relay host,
//!    send a `JoinSessionRequest` with the invitation key, and require a
//!    success `Response`. The caller upgrades that socket to TLS towards
//!    the actual peer.

use bex_deviceid::DeviceId;
use bex_protocol::relay::{RELAY_HEADER_LEN, RESPONSE_SUCCESS, RelayHeader, RelayMessage};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::identity::Identity;
use crate::{HANDSHAKE_TIMEOUT, TransportError, tls};

/// Brokers a relay session and returns the raw TCP socket to upgrade.
pub(crate) async fn broker_session(
    host: &str,
    port: u16,
    relay_id: &DeviceId,
    peer: &DeviceId,
    identity: &Identity,
) -> Result<TcpStream, TransportError> {
    let tcp = timeout(HANDSHAKE_TIMEOUT, TcpStream::connect((host, port)))
        .await
        .map_err(|_| TransportError::HandshakeTimeout("relay connect"))??;
    let mut relay = tls::upgrade(tcp, host, identity.tls_config(), "relay TLS handshake").await?;

    let actual = tls::peer_device_id(&relay)?;
    if actual != *relay_id {
        return Err(TransportError::RelayAuthFailed {
            expected: *relay_id,
            actual,
        });
    }
    debug!(relay = %relay_id, "relay authenticated");

    let request = RelayMessage::ConnectRequest {
        id: peer.as_bytes().to_vec(),
    };
    write_step(&mut relay, &request.encode(), "connect request").await?;

    let invitation = read_message(&mut relay, "session invitation").await?;
    let RelayMessage::SessionInvitation { key, port, .. } = invitation else {
        warn!(?invitation, "relay answered connect request with unexpected message");
        return Err(TransportError::UnexpectedRelayMessage("session invitation"));
    };
    let session_port = u16::try_from(port)
        .map_err(|_| TransportError::InvalidEndpoint(format!("invited port {port}")))?;
    debug!(port = session_port, "session invitation received");

    // The invitation names a port on the relay itself; join over plain TCP
    // and let the caller upgrade the joined socket towards the peer.
    let mut session = timeout(
        HANDSHAKE_TIMEOUT,
        TcpStream::connect((host, session_port)),
    )
    .await
    .map_err(|_| TransportError::HandshakeTimeout("session connect"))??;

    join_session(&mut session, key).await?;
    debug!("relay session joined");

    Ok(session)
}

/// Presents the invitation key on the session socket and requires a
/// success response.
pub(crate) async fn join_session<S>(session: &mut S, key: Vec<u8>) -> Result<(), TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let join = RelayMessage::JoinSessionRequest { key };
    write_step(session, &join.encode(), "join request").await?;

    let response = read_message(session, "join response").await?;
    let RelayMessage::Response { code, message } = response else {
        warn!(?response, "relay answered join request with unexpected message");
        return Err(TransportError::UnexpectedRelayMessage("join response"));
    };
    if code != RESPONSE_SUCCESS {
        return Err(TransportError::RelaySessionFailed { code, message });
    }
    Ok(())
}

async fn write_step<S>(stream: &mut S, frame: &[u8], step: &'static str) -> Result<(), TransportError>
where
    S: AsyncWrite + Unpin,
{
    timeout(HANDSHAKE_TIMEOUT, stream.write_all(frame))
        .await
        .map_err(|_| TransportError::HandshakeTimeout(step))??;
    Ok(())
}

async fn read_message<S>(stream: &mut S, step: &'static str) -> Result<RelayMessage, TransportError>
where
    S: AsyncRead + Unpin,
{
    let mut header_bytes = [0u8; RELAY_HEADER_LEN];
    timeout(HANDSHAKE_TIMEOUT, stream.read_exact(&mut header_bytes))
        .await
        .map_err(|_| TransportError::HandshakeTimeout(step))??;
    let header = RelayHeader::parse(&header_bytes)?;

    let mut payload = vec![0u8; header.payload_len];
    timeout(HANDSHAKE_TIMEOUT, stream.read_exact(&mut payload))
        .await
        .map_err(|_| TransportError::HandshakeTimeout(step))??;
    Ok(RelayMessage::decode(header, &payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn read_message_parses_a_framed_response() {
        let frame = RelayMessage::Response {
            code: 1,
            message: "no such session".into(),
        }
        .encode();
        let mut stream = Cursor::new(frame.to_vec());
        let message = read_message(&mut stream, "test").await.expect("parse");
        assert_eq!(
            message,
            RelayMessage::Response {
                code: 1,
                message: "no such session".into()
            }
        );
    }

    #[tokio::test]
    async fn read_message_rejects_bad_magic() {
        let mut frame = RelayMessage::Response {
            code: 0,
            message: String::new(),
        }
        .encode()
        .to_vec();
        frame[0] = 0;
        let mut stream = Cursor::new(frame);
        assert!(read_message(&mut stream, "test").await.is_err());
    }

    #[tokio::test]
    async fn join_refusal_fails_the_session() {
        let (mut client, mut relay) = tokio::io::duplex(4096);

        let relay_side = tokio::spawn(async move {
            // Expect the join request, then refuse the session.
            let message = read_message(&mut relay, "join").await.expect("join request");
            assert!(matches!(message, RelayMessage::JoinSessionRequest { .. }));
            let refusal = RelayMessage::Response {
                code: 1,
                message: "session not found".into(),
            };
            tokio::io::AsyncWriteExt::write_all(&mut relay, &refusal.encode())
                .await
                .expect("write refusal");
        });

        let error = join_session(&mut client, vec![9; 32])
            .await
            .expect_err("refused join");
        assert!(matches!(
            error,
            TransportError::RelaySessionFailed { code: 1, .. }
        ));
        relay_side.await.expect("relay task");
    }

    #[tokio::test]
    async fn join_success_returns_the_socket_to_the_caller() {
        let (mut client, mut relay) = tokio::io::duplex(4096);

        let relay_side = tokio::spawn(async move {
            let message = read_message(&mut relay, "join").await.expect("join request");
            let RelayMessage::JoinSessionRequest { key } = message else {
                panic!("expected join request");
            };
            assert_eq!(key, vec![9; 32]);
            let ok = RelayMessage::Response {
                code: 0,
                message: "ok".into(),
            };
            tokio::io::AsyncWriteExt::write_all(&mut relay, &ok.encode())
                .await
                .expect("write response");
        });

        join_session(&mut client, vec![9; 32]).await.expect("joined");
        relay_side.await.expect("relay task");
    }
}
