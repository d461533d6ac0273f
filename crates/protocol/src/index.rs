//! Index shaping.
//!
//! Wire indexes are flat lists of files, directories and symlinks with
//! relative names. The catalog wants them grouped: one record per
//! directory holding its immediate children, names absolute. Files may
//! precede their directory entry within a message, so shaping inserts a
//! placeholder directory that a later real entry replaces; a placeholder
//! that never gets replaced is applied with empty metadata for the
//! transaction.

use tracing::warn;

use crate::wire::{FileInfo, FileInfoType, Index, Vector};

/// Flag bit: entry is a tombstone.
pub const FLAG_DELETED: u32 = 1;
/// Flag bit: entry is invalid on the sending device.
pub const FLAG_INVALID: u32 = 2;
/// Flag bit: permission bits are meaningless.
pub const FLAG_NO_PERMISSIONS: u32 = 4;

/// Entry kind after shaping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryKind {
    /// Regular file.
    File,
    /// Directory.
    Directory,
    /// Symbolic link.
    Symlink,
}

/// One content block after shaping, offset-ordered.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockRecord {
    /// Byte offset within the file.
    pub offset: i64,
    /// Block length in bytes.
    pub size: i32,
    /// SHA-256 of the block content.
    pub hash: Vec<u8>,
}

/// Metadata for one shaped entry.
///
/// For directories `name` is the absolute path; for files and symlinks it
/// is the basename within their parent directory.
#[derive(Clone, Debug, PartialEq)]
pub struct EntryRecord {
    /// Name; see the type-level note.
    pub name: String,
    /// Entry kind.
    pub kind: EntryKind,
    /// Size in bytes.
    pub size: i64,
    /// Unix permission bits.
    pub permissions: u32,
    /// Modification time, seconds.
    pub modified_s: i64,
    /// Modification time, nanoseconds.
    pub modified_ns: i32,
    /// Short id of the last modifying device, as 8 big-endian bytes.
    pub modified_by: [u8; 8],
    /// Packed flags; see the `FLAG_*` constants.
    pub flags: u32,
    /// Sender-side sequence number.
    pub sequence: i64,
    /// Block size used to slice the file.
    pub block_size: i32,
    /// Serialised version vector.
    pub version: String,
    /// Symlink target, when the entry is a symlink.
    pub symlink_target: String,
    /// Content blocks, sorted by offset.
    pub blocks: Vec<BlockRecord>,
}

/// A directory and its immediate children within one index message.
#[derive(Clone, Debug, PartialEq)]
pub struct DirectoryRecord {
    /// Absolute directory name, starting with `/`.
    pub name: String,
    /// The directory's own metadata; `None` while it is a placeholder.
    pub entry: Option<EntryRecord>,
    /// Immediate child files and symlinks.
    pub files: Vec<EntryRecord>,
}

/// A shaped index message.
#[derive(Clone, Debug, PartialEq)]
pub struct FolderIndex {
    /// Folder identifier.
    pub folder: String,
    /// Directories in first-seen order.
    pub directories: Vec<DirectoryRecord>,
}

/// Reshapes a wire index into directory-grouped records.
///
/// Entries with an unknown type are dropped with a warning. Blocks are
/// sorted by offset; the sender's ordering is not trusted.
#[must_use]
pub fn shape_index(index: Index) -> FolderIndex {
    let mut shaped = FolderIndex {
        folder: index.folder,
        directories: Vec::new(),
    };

    for file in index.files {
        let absolute = format!("/{}", file.name);
        match FileInfoType::try_from(file.r#type) {
            Ok(FileInfoType::Directory) => {
                let entry = shape_entry(&file, EntryKind::Directory, absolute.clone());
                let record = find_or_insert(&mut shaped.directories, absolute);
                // A real entry replaces the placeholder inserted for an
                // earlier child.
                record.entry = Some(entry);
            }
            Ok(kind @ (FileInfoType::File | FileInfoType::Symlink)) => {
                let kind = if kind == FileInfoType::File {
                    EntryKind::File
                } else {
                    EntryKind::Symlink
                };
                let (parent, basename) = split_path(&absolute);
                let entry = shape_entry(&file, kind, basename.to_owned());
                let record = find_or_insert(&mut shaped.directories, parent.to_owned());
                record.files.push(entry);
            }
            Err(_) => {
                warn!(name = %file.name, r#type = file.r#type, "dropping entry of unknown type");
            }
        }
    }

    shaped
}

fn find_or_insert(directories: &mut Vec<DirectoryRecord>, name: String) -> &mut DirectoryRecord {
    if let Some(position) = directories.iter().position(|d| d.name == name) {
        &mut directories[position]
    } else {
        directories.push(DirectoryRecord {
            name,
            entry: None,
            files: Vec::new(),
        });
        directories.last_mut().expect("just pushed")
    }
}

fn shape_entry(file: &FileInfo, kind: EntryKind, name: String) -> EntryRecord {
    let mut flags = 0;
    if file.deleted {
        flags |= FLAG_DELETED;
    }
    if file.invalid {
        flags |= FLAG_INVALID;
    }
    if file.no_permissions {
        flags |= FLAG_NO_PERMISSIONS;
    }

    let mut blocks: Vec<BlockRecord> = file
        .blocks
        .iter()
        .map(|block| BlockRecord {
            offset: block.offset,
            size: block.size,
            hash: block.hash.clone(),
        })
        .collect();
    blocks.sort_by_key(|block| block.offset);

    EntryRecord {
        name,
        kind,
        size: file.size,
        permissions: file.permissions,
        modified_s: file.modified_s,
        modified_ns: file.modified_ns,
        modified_by: file.modified_by.to_be_bytes(),
        flags,
        sequence: file.sequence,
        block_size: file.block_size,
        version: version_string(file.version.as_ref()),
        symlink_target: file.symlink_target.clone(),
        blocks,
    }
}

/// Splits an absolute path into its parent directory and basename.
fn split_path(absolute: &str) -> (&str, &str) {
    match absolute.rfind('/') {
        Some(0) => ("/", &absolute[1..]),
        Some(position) => (&absolute[..position], &absolute[position + 1..]),
        None => ("/", absolute),
    }
}

/// Serialises a version vector as `id:value` pairs joined by commas.
#[must_use]
pub fn version_string(version: Option<&Vector>) -> String {
    version
        .map(|v| {
            v.counters
                .iter()
                .map(|c| format!("{}:{}", c.id, c.value))
                .collect::<Vec<_>>()
                .join(",")
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{BlockInfo, Counter, Index};

    fn file_info(name: &str, r#type: FileInfoType) -> FileInfo {
        FileInfo {
            name: name.into(),
            r#type: r#type as i32,
            size: 0,
            permissions: 0o644,
            modified_s: 1_700_000_000,
            modified_ns: 0,
            modified_by: 0x0102_0304_0506_0708,
            deleted: false,
            invalid: false,
            no_permissions: false,
            version: Some(Vector {
                counters: vec![Counter { id: 1, value: 2 }],
            }),
            sequence: 1,
            block_size: 131_072,
            blocks: Vec::new(),
            symlink_target: String::new(),
        }
    }

    #[test]
    fn file_preceding_its_directory_uses_a_placeholder() {
        let index = Index {
            folder: "docs".into(),
            files: vec![
                file_info("a/b.txt", FileInfoType::File),
                file_info("a", FileInfoType::Directory),
            ],
        };
        let shaped = shape_index(index);
        assert_eq!(shaped.directories.len(), 1);
        let dir = &shaped.directories[0];
        assert_eq!(dir.name, "/a");
        assert!(dir.entry.is_some(), "placeholder must be replaced");
        assert_eq!(dir.files.len(), 1);
        assert_eq!(dir.files[0].name, "b.txt");
    }

    #[test]
    fn unreplaced_placeholder_survives() {
        let index = Index {
            folder: "docs".into(),
            files: vec![file_info("deep/nested.txt", FileInfoType::File)],
        };
        let shaped = shape_index(index);
        assert_eq!(shaped.directories.len(), 1);
        assert_eq!(shaped.directories[0].name, "/deep");
        assert!(shaped.directories[0].entry.is_none());
    }

    #[test]
    fn top_level_file_lands_in_root() {
        let index = Index {
            folder: "docs".into(),
            files: vec![file_info("readme.md", FileInfoType::File)],
        };
        let shaped = shape_index(index);
        assert_eq!(shaped.directories[0].name, "/");
        assert_eq!(shaped.directories[0].files[0].name, "readme.md");
    }

    #[test]
    fn blocks_are_sorted_by_offset() {
        let mut info = file_info("big.bin", FileInfoType::File);
        info.blocks = vec![
            BlockInfo {
                offset: 131_072,
                size: 131_072,
                hash: vec![2; 32],
            },
            BlockInfo {
                offset: 0,
                size: 131_072,
                hash: vec![1; 32],
            },
        ];
        let shaped = shape_index(Index {
            folder: "docs".into(),
            files: vec![info],
        });
        let blocks = &shaped.directories[0].files[0].blocks;
        assert_eq!(blocks[0].offset, 0);
        assert_eq!(blocks[1].offset, 131_072);
    }

    #[test]
    fn flags_are_packed() {
        let mut info = file_info("gone.txt", FileInfoType::File);
        info.deleted = true;
        info.no_permissions = true;
        let shaped = shape_index(Index {
            folder: "docs".into(),
            files: vec![info],
        });
        let entry = &shaped.directories[0].files[0];
        assert_eq!(entry.flags, FLAG_DELETED | FLAG_NO_PERMISSIONS);
    }

    #[test]
    fn modified_by_is_big_endian_bytes() {
        let shaped = shape_index(Index {
            folder: "docs".into(),
            files: vec![file_info("x", FileInfoType::File)],
        });
        let entry = &shaped.directories[0].files[0];
        assert_eq!(entry.modified_by, [1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn version_vector_is_serialised() {
        let shaped = shape_index(Index {
            folder: "docs".into(),
            files: vec![file_info("x", FileInfoType::File)],
        });
        assert_eq!(shaped.directories[0].files[0].version, "1:2");
    }
}
