//! BEP message definitions.
//!
//! The Block Exchange Protocol describes its messages in protobuf; the
//! structs here mirror that schema as `prost` derive types. Request and
//! response identifiers are carried as 64-bit integers and the scheduler
//! keeps them below 2^53, so every wire field is preserved at full width.

use prost::Message as _;

/// Message type discriminant carried in every post-hello frame header.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, prost::Enumeration)]
#[repr(i32)]
pub enum MessageType {
    /// Mutually exchanged folder/device description.
    ClusterConfig = 0,
    /// Full index of a folder.
    Index = 1,
    /// Delta index of a folder.
    IndexUpdate = 2,
    /// Block content request.
    Request = 3,
    /// Block content response.
    Response = 4,
    /// Peer download progress report.
    DownloadProgress = 5,
    /// Keepalive.
    Ping = 6,
    /// Orderly connection shutdown.
    Close = 7,
}

/// Payload compression indicator in the frame header.
#[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
pub enum MessageCompression {
    /// Payload bytes are the encoded message.
    None = 0,
    /// Payload is an LZ4 block preceded by its decompressed length.
    Lz4 = 1,
}

/// Entry type in a wire [`FileInfo`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
pub enum FileInfoType {
    /// Regular file.
    File = 0,
    /// Directory.
    Directory = 1,
    /// Symbolic link.
    Symlink = 4,
}

/// First message on the wire in either direction.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Hello {
    /// Human-readable device name.
    #[prost(string, tag = "1")]
    pub device_name: String,
    /// Client implementation name.
    #[prost(string, tag = "2")]
    pub client_name: String,
    /// Client implementation version.
    #[prost(string, tag = "3")]
    pub client_version: String,
}

/// Frame header preceding every post-hello message.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Header {
    /// Message type of the payload.
    #[prost(enumeration = "MessageType", tag = "1")]
    pub r#type: i32,
    /// Payload compression.
    #[prost(enumeration = "MessageCompression", tag = "2")]
    pub compression: i32,
}

/// Cluster-wide folder and device description.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ClusterConfig {
    /// Folders the sending device participates in.
    #[prost(message, repeated, tag = "1")]
    pub folders: Vec<Folder>,
}

/// One folder in a [`ClusterConfig`].
#[derive(Clone, PartialEq, prost::Message)]
pub struct Folder {
    /// Opaque folder identifier, unique per cluster.
    #[prost(string, tag = "1")]
    pub id: String,
    /// Human-readable label.
    #[prost(string, tag = "2")]
    pub label: String,
    /// The sender will not accept writes.
    #[prost(bool, tag = "3")]
    pub read_only: bool,
    /// Permission bits are not tracked.
    #[prost(bool, tag = "4")]
    pub ignore_permissions: bool,
    /// Deletes are ignored by the sender.
    #[prost(bool, tag = "5")]
    pub ignore_delete: bool,
    /// Temporary indexes are disabled.
    #[prost(bool, tag = "6")]
    pub disable_temp_indexes: bool,
    /// Folder is paused on the sender.
    #[prost(bool, tag = "7")]
    pub paused: bool,
    /// Devices sharing this folder.
    #[prost(message, repeated, tag = "16")]
    pub devices: Vec<Device>,
}

/// One device entry within a [`Folder`].
#[derive(Clone, PartialEq, prost::Message)]
pub struct Device {
    /// Raw 32-byte device id.
    #[prost(bytes = "vec", tag = "1")]
    pub id: Vec<u8>,
    /// Device name as configured on the sender.
    #[prost(string, tag = "2")]
    pub name: String,
    /// Dialable addresses.
    #[prost(string, repeated, tag = "3")]
    pub addresses: Vec<String>,
    /// Highest index sequence the sender holds for this device.
    #[prost(int64, tag = "6")]
    pub max_sequence: i64,
    /// Index epoch; a change demands a full resync.
    #[prost(uint64, tag = "8")]
    pub index_id: u64,
}

/// Full folder index.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Index {
    /// Folder identifier.
    #[prost(string, tag = "1")]
    pub folder: String,
    /// Flat list of files, directories and symlinks.
    #[prost(message, repeated, tag = "2")]
    pub files: Vec<FileInfo>,
}

/// One entry in an [`Index`] or index update.
#[derive(Clone, PartialEq, prost::Message)]
pub struct FileInfo {
    /// Relative name without a leading slash.
    #[prost(string, tag = "1")]
    pub name: String,
    /// Entry type.
    #[prost(enumeration = "FileInfoType", tag = "2")]
    pub r#type: i32,
    /// Size in bytes; zero for directories.
    #[prost(int64, tag = "3")]
    pub size: i64,
    /// Unix permission bits.
    #[prost(uint32, tag = "4")]
    pub permissions: u32,
    /// Modification time, seconds part.
    #[prost(int64, tag = "5")]
    pub modified_s: i64,
    /// Entry is deleted (tombstone).
    #[prost(bool, tag = "6")]
    pub deleted: bool,
    /// Entry is invalid on the sender.
    #[prost(bool, tag = "7")]
    pub invalid: bool,
    /// Permission bits are meaningless for this entry.
    #[prost(bool, tag = "8")]
    pub no_permissions: bool,
    /// Version vector.
    #[prost(message, optional, tag = "9")]
    pub version: Option<Vector>,
    /// Per-folder, per-device sequence number.
    #[prost(int64, tag = "10")]
    pub sequence: i64,
    /// Modification time, nanoseconds part.
    #[prost(int32, tag = "11")]
    pub modified_ns: i32,
    /// Short id of the last modifying device.
    #[prost(uint64, tag = "12")]
    pub modified_by: u64,
    /// Block size used to slice the file.
    #[prost(int32, tag = "13")]
    pub block_size: i32,
    /// Content blocks, offset-ordered by convention but not by contract.
    #[prost(message, repeated, tag = "16")]
    pub blocks: Vec<BlockInfo>,
    /// Symlink target, when the entry is a symlink.
    #[prost(string, tag = "17")]
    pub symlink_target: String,
}

/// One content block of a file.
#[derive(Clone, PartialEq, prost::Message)]
pub struct BlockInfo {
    /// Byte offset within the file.
    #[prost(int64, tag = "1")]
    pub offset: i64,
    /// Block length in bytes.
    #[prost(int32, tag = "2")]
    pub size: i32,
    /// SHA-256 of the block content.
    #[prost(bytes = "vec", tag = "3")]
    pub hash: Vec<u8>,
}

/// Version vector.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Vector {
    /// Per-device counters.
    #[prost(message, repeated, tag = "1")]
    pub counters: Vec<Counter>,
}

/// One counter of a version [`Vector`].
#[derive(Clone, PartialEq, prost::Message)]
pub struct Counter {
    /// Short device id.
    #[prost(uint64, tag = "1")]
    pub id: u64,
    /// Counter value.
    #[prost(uint64, tag = "2")]
    pub value: u64,
}

/// Block content request.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Request {
    /// Request id; echoed by the matching [`Response`].
    #[prost(int64, tag = "1")]
    pub id: i64,
    /// Folder identifier.
    #[prost(string, tag = "2")]
    pub folder: String,
    /// Relative file name without a leading slash.
    #[prost(string, tag = "3")]
    pub name: String,
    /// Block offset within the file.
    #[prost(int64, tag = "4")]
    pub offset: i64,
    /// Block length.
    #[prost(int32, tag = "5")]
    pub size: i32,
    /// Expected SHA-256 of the block.
    #[prost(bytes = "vec", tag = "6")]
    pub hash: Vec<u8>,
}

/// Block content response.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Response {
    /// Request id this response answers.
    #[prost(int64, tag = "1")]
    pub id: i64,
    /// Block content; empty on error.
    #[prost(bytes = "vec", tag = "2")]
    pub data: Vec<u8>,
    /// 0 success, 1 generic, 2 no such file, 3 invalid.
    #[prost(int32, tag = "3")]
    pub code: i32,
}

/// Peer download progress; decoded and discarded by this client.
#[derive(Clone, PartialEq, prost::Message)]
pub struct DownloadProgress {
    /// Folder identifier.
    #[prost(string, tag = "1")]
    pub folder: String,
}

/// Keepalive message; empty payload.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Ping {}

/// Orderly shutdown notice.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Close {
    /// Human-readable reason.
    #[prost(string, tag = "1")]
    pub reason: String,
}

/// Tagged union over every decodable post-hello message.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    /// Cluster configuration.
    ClusterConfig(ClusterConfig),
    /// Full index.
    Index(Index),
    /// Index delta.
    IndexUpdate(Index),
    /// Block request (inbound requests are refused by this client).
    Request(Request),
    /// Block response.
    Response(Response),
    /// Peer progress report.
    DownloadProgress(DownloadProgress),
    /// Keepalive.
    Ping(Ping),
    /// Shutdown notice.
    Close(Close),
}

impl Message {
    /// Returns the header discriminant for this message.
    #[must_use]
    pub const fn message_type(&self) -> MessageType {
        match self {
            Self::ClusterConfig(_) => MessageType::ClusterConfig,
            Self::Index(_) => MessageType::Index,
            Self::IndexUpdate(_) => MessageType::IndexUpdate,
            Self::Request(_) => MessageType::Request,
            Self::Response(_) => MessageType::Response,
            Self::DownloadProgress(_) => MessageType::DownloadProgress,
            Self::Ping(_) => MessageType::Ping,
            Self::Close(_) => MessageType::Close,
        }
    }

    /// Encodes the message payload without header or framing.
    #[must_use]
    pub fn encode_payload(&self) -> Vec<u8> {
        match self {
            Self::ClusterConfig(m) => m.encode_to_vec(),
            Self::Index(m) | Self::IndexUpdate(m) => m.encode_to_vec(),
            Self::Request(m) => m.encode_to_vec(),
            Self::Response(m) => m.encode_to_vec(),
            Self::DownloadProgress(m) => m.encode_to_vec(),
            Self::Ping(m) => m.encode_to_vec(),
            Self::Close(m) => m.encode_to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trips_full_width_offsets() {
        let request = Request {
            id: (1 << 53) - 1,
            folder: "photos".into(),
            name: "album/a.jpg".into(),
            offset: i64::MAX - 131_072,
            size: 131_072,
            hash: vec![0xAB; 32],
        };
        let decoded = Request::decode(request.encode_to_vec().as_slice()).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn message_type_matches_variant() {
        let ping = Message::Ping(Ping {});
        assert_eq!(ping.message_type(), MessageType::Ping);
        assert!(ping.encode_payload().is_empty());

        let close = Message::Close(Close {
            reason: "going away".into(),
        });
        assert_eq!(close.message_type(), MessageType::Close);
    }
}
