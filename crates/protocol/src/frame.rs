//! BEP frame codec.
//!
//! # Wire Format
//!
//! The first bytes on the freshly upgraded TLS stream are the hello
//! exchange, then every message is header-framed:
//!
//! ```text
//! hello:  magic (u32 BE, 0x2EA7D90B) | helloLen (u16 BE) | Hello protobuf
//! frame:  headerLen (u16 BE) | Header protobuf
//!         | msgLen (u32 BE) | [decompressedLen (u32 BE)]? | payload
//! ```
//!
//! When the header declares LZ4 compression the nominal payload region
//! starts with the decompressed length and the remaining `msgLen - 4`
//! bytes are an LZ4 block, expanded to exactly that length before message
//! decoding. Outbound frames are never compressed.
//!
//! Stream reads are not message-aligned; the codec is driven through
//! `tokio_util::codec::Framed`, which buffers partial frames and resumes
//! as more bytes arrive. Any malformed frame is unrecoverable because the
//! wire format has no resynchronisation marker after hello, so every
//! [`FrameError`] closes the connection.

use std::io;

use bytes::{Buf, BufMut, BytesMut};
use prost::Message as _;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{trace, warn};

use crate::wire::{Header, Hello, Message, MessageCompression, MessageType};

/// Magic preceding the hello frame.
pub const HELLO_MAGIC: u32 = 0x2EA7_D90B;

/// Upper bound on the encoded frame header.
const MAX_HEADER_LEN: usize = 4 * 1024;

/// Upper bound on a single message payload, compressed or not.
const MAX_MESSAGE_LEN: usize = 64 * 1024 * 1024;

/// Errors raised by the codec; all of them are fatal to the connection.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The hello frame did not start with [`HELLO_MAGIC`].
    #[error("hello magic mismatch: expected 0x2EA7D90B, got 0x{0:08X}")]
    MagicMismatch(u32),

    /// The frame header exceeded `MAX_HEADER_LEN`.
    #[error("frame header of {0} bytes exceeds limit")]
    HeaderTooLarge(usize),

    /// The message payload exceeded `MAX_MESSAGE_LEN`.
    #[error("message of {0} bytes exceeds limit")]
    MessageTooLarge(usize),

    /// The header fields did not describe a decodable frame.
    #[error("malformed frame: {0}")]
    Malformed(&'static str),

    /// LZ4 expansion failed or did not produce the declared length.
    #[error("payload decompression failed: {0}")]
    Decompress(#[from] lz4_flex::block::DecompressError),

    /// Protobuf decoding failed.
    #[error("message decoding failed: {0}")]
    Decode(#[from] prost::DecodeError),

    /// The underlying stream failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// A decoded inbound frame.
#[derive(Clone, Debug, PartialEq)]
pub enum Frame {
    /// The hello exchanged before any header-framed traffic.
    Hello(Hello),
    /// A post-hello message.
    Message(Message),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CodecState {
    AwaitingHello,
    Frames,
}

/// Stateful BEP codec: hello first, header-framed messages afterwards.
#[derive(Debug)]
pub struct BepCodec {
    state: CodecState,
}

impl BepCodec {
    /// Creates a codec expecting the hello exchange.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: CodecState::AwaitingHello,
        }
    }
}

impl Default for BepCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for BepCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        loop {
            match self.state {
                CodecState::AwaitingHello => {
                    if src.len() < 6 {
                        return Ok(None);
                    }
                    let magic = u32::from_be_bytes([src[0], src[1], src[2], src[3]]);
                    if magic != HELLO_MAGIC {
                        return Err(FrameError::MagicMismatch(magic));
                    }
                    let hello_len = usize::from(u16::from_be_bytes([src[4], src[5]]));
                    if src.len() < 6 + hello_len {
                        src.reserve(6 + hello_len - src.len());
                        return Ok(None);
                    }
                    src.advance(6);
                    let payload = src.split_to(hello_len);
                    let hello = Hello::decode(payload.as_ref())?;
                    self.state = CodecState::Frames;
                    trace!(device = %hello.device_name, client = %hello.client_name, "hello received");
                    return Ok(Some(Frame::Hello(hello)));
                }
                CodecState::Frames => {
                    if src.len() < 2 {
                        return Ok(None);
                    }
                    let header_len = usize::from(u16::from_be_bytes([src[0], src[1]]));
                    if header_len > MAX_HEADER_LEN {
                        return Err(FrameError::HeaderTooLarge(header_len));
                    }
                    if src.len() < 2 + header_len + 4 {
                        return Ok(None);
                    }
                    let msg_len = u32::from_be_bytes([
                        src[2 + header_len],
                        src[3 + header_len],
                        src[4 + header_len],
                        src[5 + header_len],
                    ]) as usize;
                    if msg_len > MAX_MESSAGE_LEN {
                        return Err(FrameError::MessageTooLarge(msg_len));
                    }
                    let total = 2 + header_len + 4 + msg_len;
                    if src.len() < total {
                        src.reserve(total - src.len());
                        return Ok(None);
                    }

                    let header = Header::decode(&src[2..2 + header_len])?;
                    src.advance(2 + header_len + 4);
                    let payload = src.split_to(msg_len);

                    let compression = MessageCompression::try_from(header.compression)
                        .map_err(|_| FrameError::Malformed("unknown compression"))?;
                    let payload = match compression {
                        MessageCompression::None => payload.to_vec(),
                        MessageCompression::Lz4 => expand_lz4(&payload)?,
                    };

                    let Ok(message_type) = MessageType::try_from(header.r#type) else {
                        warn!(r#type = header.r#type, "dropping message of unknown type");
                        continue;
                    };
                    let message = decode_message(message_type, &payload)?;
                    trace!(r#type = ?message_type, len = payload.len(), "frame received");
                    return Ok(Some(Frame::Message(message)));
                }
            }
        }
    }
}

impl Encoder<Frame> for BepCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        match frame {
            Frame::Hello(hello) => {
                let payload = hello.encode_to_vec();
                let hello_len = u16::try_from(payload.len())
                    .map_err(|_| FrameError::Malformed("hello too large"))?;
                dst.reserve(6 + payload.len());
                dst.put_u32(HELLO_MAGIC);
                dst.put_u16(hello_len);
                dst.put_slice(&payload);
            }
            Frame::Message(message) => {
                let header = Header {
                    r#type: message.message_type() as i32,
                    compression: MessageCompression::None as i32,
                };
                let header_bytes = header.encode_to_vec();
                let payload = message.encode_payload();
                let header_len = u16::try_from(header_bytes.len())
                    .map_err(|_| FrameError::Malformed("header too large"))?;
                let msg_len = u32::try_from(payload.len())
                    .map_err(|_| FrameError::Malformed("payload too large"))?;
                dst.reserve(2 + header_bytes.len() + 4 + payload.len());
                dst.put_u16(header_len);
                dst.put_slice(&header_bytes);
                dst.put_u32(msg_len);
                dst.put_slice(&payload);
            }
        }
        Ok(())
    }
}

/// Expands an LZ4 payload: 4-byte big-endian decompressed length, then the
/// compressed block, which must inflate to exactly that length.
fn expand_lz4(payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    if payload.len() < 4 {
        return Err(FrameError::Malformed("compressed payload shorter than its length field"));
    }
    let decompressed_len =
        u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) as usize;
    if decompressed_len > MAX_MESSAGE_LEN {
        return Err(FrameError::MessageTooLarge(decompressed_len));
    }
    let expanded = lz4_flex::block::decompress(&payload[4..], decompressed_len)?;
    Ok(expanded)
}

fn decode_message(message_type: MessageType, payload: &[u8]) -> Result<Message, FrameError> {
    use crate::wire;

    let message = match message_type {
        MessageType::ClusterConfig => {
            Message::ClusterConfig(wire::ClusterConfig::decode(payload)?)
        }
        MessageType::Index => Message::Index(wire::Index::decode(payload)?),
        MessageType::IndexUpdate => Message::IndexUpdate(wire::Index::decode(payload)?),
        MessageType::Request => Message::Request(wire::Request::decode(payload)?),
        MessageType::Response => Message::Response(wire::Response::decode(payload)?),
        MessageType::DownloadProgress => {
            Message::DownloadProgress(wire::DownloadProgress::decode(payload)?)
        }
        MessageType::Ping => Message::Ping(wire::Ping::decode(payload)?),
        MessageType::Close => Message::Close(wire::Close::decode(payload)?),
    };
    Ok(message)
}
