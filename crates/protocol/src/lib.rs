#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! Wire layer of the BEP client: the protobuf-defined message set, the
//! length-delimited frame codec spoken after the TLS handshake, the index
//! shaping that turns flat wire file lists into directory-grouped records,
//! and the relay rendezvous wire format.
//!
//! # Design
//!
//! Messages are plain `prost` derive structs ([`wire`]); the codec
//! ([`frame::BepCodec`]) is a `tokio_util` [`Decoder`]/[`Encoder`] pair so
//! partially received frames are reassembled by the framed stream without
//! any session-level buffering. Decoded traffic is surfaced as the tagged
//! [`wire::Message`] enum — the decoder never hands an untyped record
//! upward. The relay codec ([`relay`]) is pure: it encodes and decodes
//! frames over byte slices and leaves socket I/O to the transport crate.
//!
//! [`Decoder`]: tokio_util::codec::Decoder
//! [`Encoder`]: tokio_util::codec::Encoder

pub mod frame;
pub mod index;
pub mod relay;
pub mod wire;

pub use frame::{BepCodec, Frame, FrameError};
pub use index::{BlockRecord, DirectoryRecord, EntryKind, EntryRecord, FolderIndex, shape_index};
pub use wire::{Message, MessageCompression, MessageType};
