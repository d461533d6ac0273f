//! Relay rendezvous wire format.
//!
//! # Wire Format
//!
//! Every relay frame is `magic (u32 BE, 0x9E79BC40) | type (u32 BE) |
//! length (u32 BE) | payload`. Byte-string fields inside payloads are
//! length-prefixed with a u32. The client only ever sends
//! [`RelayMessage::ConnectRequest`] and [`RelayMessage::JoinSessionRequest`]
//! and only ever receives [`RelayMessage::SessionInvitation`] and
//! [`RelayMessage::Response`]; socket I/O lives in the transport crate.

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Magic prefixing every relay frame.
pub const RELAY_MAGIC: u32 = 0x9E79_BC40;

/// Fixed size of the relay frame header.
pub const RELAY_HEADER_LEN: usize = 12;

/// Relay `Response.code` signalling success.
pub const RESPONSE_SUCCESS: u32 = 0;

const TYPE_JOIN_SESSION_REQUEST: u32 = 3;
const TYPE_RESPONSE: u32 = 4;
const TYPE_CONNECT_REQUEST: u32 = 5;
const TYPE_SESSION_INVITATION: u32 = 6;

/// Upper bound on a relay payload; invitations are tiny.
const MAX_RELAY_PAYLOAD: usize = 16 * 1024;

/// Errors raised while encoding or decoding relay frames.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RelayError {
    /// The frame did not start with [`RELAY_MAGIC`].
    #[error("relay magic mismatch: expected 0x9E79BC40, got 0x{0:08X}")]
    MagicMismatch(u32),

    /// The frame declared an implausible payload length.
    #[error("relay payload of {0} bytes exceeds limit")]
    PayloadTooLarge(usize),

    /// The payload ended before a declared field did.
    #[error("truncated relay payload")]
    Truncated,

    /// The frame type is not one this client understands.
    #[error("unexpected relay message type {0}")]
    UnexpectedType(u32),
}

/// Parsed relay frame header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RelayHeader {
    /// Frame type discriminant.
    pub message_type: u32,
    /// Payload length in bytes.
    pub payload_len: usize,
}

impl RelayHeader {
    /// Parses the fixed 12-byte header.
    pub fn parse(bytes: &[u8; RELAY_HEADER_LEN]) -> Result<Self, RelayError> {
        let magic = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        if magic != RELAY_MAGIC {
            return Err(RelayError::MagicMismatch(magic));
        }
        let message_type = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let payload_len =
            u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize;
        if payload_len > MAX_RELAY_PAYLOAD {
            return Err(RelayError::PayloadTooLarge(payload_len));
        }
        Ok(Self {
            message_type,
            payload_len,
        })
    }
}

/// The relay messages this client exchanges.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RelayMessage {
    /// Client → relay: request a session towards a peer device.
    ConnectRequest {
        /// Raw 32-byte device id of the peer.
        id: Vec<u8>,
    },
    /// Relay → client: where and how to join the brokered session.
    SessionInvitation {
        /// Device id of the inviting peer.
        from: Vec<u8>,
        /// Session key to present when joining.
        key: Vec<u8>,
        /// Address hint; empty means "use the relay host".
        address: Vec<u8>,
        /// TCP port of the session listener.
        port: u32,
    },
    /// Client → relay session listener: join with the invitation key.
    JoinSessionRequest {
        /// Session key from the invitation.
        key: Vec<u8>,
    },
    /// Relay → client: outcome of a join request.
    Response {
        /// `0` is success; anything else is fatal.
        code: u32,
        /// Human-readable detail.
        message: String,
    },
}

impl RelayMessage {
    /// Encodes the message as a complete relay frame.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let (message_type, payload) = match self {
            Self::ConnectRequest { id } => (TYPE_CONNECT_REQUEST, encode_bytes_field(id)),
            Self::JoinSessionRequest { key } => {
                (TYPE_JOIN_SESSION_REQUEST, encode_bytes_field(key))
            }
            Self::SessionInvitation {
                from,
                key,
                address,
                port,
            } => {
                let mut buf = BytesMut::new();
                buf.extend_from_slice(&encode_bytes_field(from));
                buf.extend_from_slice(&encode_bytes_field(key));
                buf.extend_from_slice(&encode_bytes_field(address));
                buf.put_u32(*port);
                (TYPE_SESSION_INVITATION, buf.freeze())
            }
            Self::Response { code, message } => {
                let mut buf = BytesMut::new();
                buf.put_u32(*code);
                buf.extend_from_slice(&encode_bytes_field(message.as_bytes()));
                (TYPE_RESPONSE, buf.freeze())
            }
        };

        let mut frame = BytesMut::with_capacity(RELAY_HEADER_LEN + payload.len());
        frame.put_u32(RELAY_MAGIC);
        frame.put_u32(message_type);
        frame.put_u32(payload.len() as u32);
        frame.extend_from_slice(&payload);
        frame.freeze()
    }

    /// Decodes a payload according to the header's frame type.
    pub fn decode(header: RelayHeader, payload: &[u8]) -> Result<Self, RelayError> {
        if payload.len() != header.payload_len {
            return Err(RelayError::Truncated);
        }
        let mut buf = payload;
        match header.message_type {
            TYPE_CONNECT_REQUEST => Ok(Self::ConnectRequest {
                id: decode_bytes_field(&mut buf)?,
            }),
            TYPE_JOIN_SESSION_REQUEST => Ok(Self::JoinSessionRequest {
                key: decode_bytes_field(&mut buf)?,
            }),
            TYPE_SESSION_INVITATION => {
                let from = decode_bytes_field(&mut buf)?;
                let key = decode_bytes_field(&mut buf)?;
                let address = decode_bytes_field(&mut buf)?;
                if buf.remaining() < 4 {
                    return Err(RelayError::Truncated);
                }
                let port = buf.get_u32();
                Ok(Self::SessionInvitation {
                    from,
                    key,
                    address,
                    port,
                })
            }
            TYPE_RESPONSE => {
                if buf.remaining() < 4 {
                    return Err(RelayError::Truncated);
                }
                let code = buf.get_u32();
                let message = decode_bytes_field(&mut buf)?;
                Ok(Self::Response {
                    code,
                    message: String::from_utf8_lossy(&message).into_owned(),
                })
            }
            other => Err(RelayError::UnexpectedType(other)),
        }
    }
}

fn encode_bytes_field(bytes: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + bytes.len());
    buf.put_u32(bytes.len() as u32);
    buf.extend_from_slice(bytes);
    buf.freeze()
}

fn decode_bytes_field(buf: &mut &[u8]) -> Result<Vec<u8>, RelayError> {
    if buf.remaining() < 4 {
        return Err(RelayError::Truncated);
    }
    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return Err(RelayError::Truncated);
    }
    let mut field = vec![0u8; len];
    buf.copy_to_slice(&mut field);
    Ok(field)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(message: RelayMessage) -> RelayMessage {
        let frame = message.encode();
        let header =
            RelayHeader::parse(frame[..RELAY_HEADER_LEN].try_into().unwrap()).expect("header");
        RelayMessage::decode(header, &frame[RELAY_HEADER_LEN..]).expect("payload")
    }

    #[test]
    fn connect_request_round_trips() {
        let message = RelayMessage::ConnectRequest { id: vec![7u8; 32] };
        assert_eq!(round_trip(message.clone()), message);
    }

    #[test]
    fn session_invitation_round_trips() {
        let message = RelayMessage::SessionInvitation {
            from: vec![1; 32],
            key: vec![2; 32],
            address: b"192.0.2.10".to_vec(),
            port: 22067,
        };
        assert_eq!(round_trip(message.clone()), message);
    }

    #[test]
    fn refusal_response_round_trips() {
        let message = RelayMessage::Response {
            code: 1,
            message: "session not found".into(),
        };
        assert_eq!(round_trip(message.clone()), message);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut frame = RelayMessage::ConnectRequest { id: vec![0; 32] }.encode().to_vec();
        frame[0] ^= 0xFF;
        let err = RelayHeader::parse(frame[..RELAY_HEADER_LEN].try_into().unwrap()).unwrap_err();
        assert!(matches!(err, RelayError::MagicMismatch(_)));
    }

    #[test]
    fn truncated_invitation_is_rejected() {
        let frame = RelayMessage::SessionInvitation {
            from: vec![1; 32],
            key: vec![2; 32],
            address: Vec::new(),
            port: 1,
        }
        .encode();
        let header =
            RelayHeader::parse(frame[..RELAY_HEADER_LEN].try_into().unwrap()).expect("header");
        let short = &frame[RELAY_HEADER_LEN..frame.len() - 2];
        assert_eq!(
            RelayMessage::decode(
                RelayHeader {
                    payload_len: short.len(),
                    ..header
                },
                short
            ),
            Err(RelayError::Truncated)
        );
    }
}
