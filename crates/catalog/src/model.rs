//! Catalog value types.

use std::fmt;

/// Sync intent attached to directories and files.
///
/// `Full` marks a subtree whose block data should be kept locally; index
/// changes under a `Full` parent are what make an update "material".
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum SyncLevel {
    /// Metadata only.
    None = 0,
    /// Fetch on demand.
    Download = 1,
    /// Keep blocks cached.
    Full = 2,
}

impl SyncLevel {
    /// Maps the stored integer; unknown values degrade to `None`.
    #[must_use]
    pub const fn from_i64(value: i64) -> Self {
        match value {
            1 => Self::Download,
            2 => Self::Full,
            _ => Self::None,
        }
    }
}

/// Cache state of a single block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CachedState {
    /// Not present in the local cache.
    Absent = 0,
    /// Present and believed valid.
    Present = 1,
    /// Present on disk but superseded; awaiting cleanup.
    Stale = 2,
}

impl CachedState {
    /// Maps the stored integer; unknown values degrade to `Absent`.
    #[must_use]
    pub const fn from_i64(value: i64) -> Self {
        match value {
            1 => Self::Present,
            2 => Self::Stale,
            _ => Self::Absent,
        }
    }
}

/// Entry type reported by [`list`](crate::Store::list) and
/// [`attributes`](crate::Store::attributes).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryType {
    /// Regular file.
    File,
    /// Directory.
    Directory,
    /// Symbolic link.
    Symlink,
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File => f.write_str("file"),
            Self::Directory => f.write_str("directory"),
            Self::Symlink => f.write_str("symlink"),
        }
    }
}

/// One directory listing entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListEntry {
    /// Entry type.
    pub entry_type: EntryType,
    /// Basename (or folder label at the root).
    pub name: String,
    /// Size in bytes; zero for directories.
    pub size: i64,
    /// Unix permission bits.
    pub permissions: u32,
    /// Modification time in seconds since the epoch.
    pub modified: i64,
    /// Short id of the last modifying device.
    pub modified_by: [u8; 8],
}

/// One block a read needs, as planned by the catalog.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockRequest {
    /// Folder id string.
    pub folder: String,
    /// Relative wire name of the file, no leading slash.
    pub name: String,
    /// Row id of the owning file.
    pub file_id: i64,
    /// Block offset within the file.
    pub offset: i64,
    /// Block length in bytes.
    pub size: i32,
    /// Expected SHA-256 of the block.
    pub hash: Vec<u8>,
    /// Cache state at planning time.
    pub cached: CachedState,
}

/// A stale cached block awaiting cleanup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StaleBlock {
    /// Folder id string.
    pub folder: String,
    /// Row id of the owning file.
    pub file_id: i64,
    /// Block offset within the file.
    pub offset: i64,
    /// Stored size; zero marks a tombstone row to delete after cleanup.
    pub size: i32,
}
