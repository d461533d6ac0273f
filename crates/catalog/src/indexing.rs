//! Index application.
//!
//! One exclusive transaction per index message. Every mutation takes a
//! fresh per-folder sequence drawn from the peer device's internal
//! counter, which is persisted at commit; a rollback therefore also
//! rolls the counter back, so no sequence is ever burned by a failed
//! message.

use bex_protocol::index::{
    DirectoryRecord, EntryKind, EntryRecord, FLAG_DELETED, FolderIndex,
};
use rusqlite::{OptionalExtension, Transaction, TransactionBehavior, params};
use tracing::debug;

use crate::CatalogError;
use crate::model::SyncLevel;
use crate::store::Store;

/// Stored kind discriminants for file-table rows.
const KIND_FILE: i64 = 0;
const KIND_SYMLINK: i64 = 1;

impl Store {
    /// Applies one index or index-update message atomically.
    ///
    /// Returns `true` when an entry whose parent carries sync level
    /// `Full` was added or modified — the signal that locally cached
    /// data may need refreshing.
    pub fn update_index(&self, index: &FolderIndex) -> Result<bool, CatalogError> {
        let mut writer = self.writer.lock().expect("catalog writer lock poisoned");
        let txn = writer.transaction_with_behavior(TransactionBehavior::Exclusive)?;

        let folder_id: i64 = txn
            .query_row(
                "SELECT id FROM folder WHERE id_string = ?1",
                params![index.folder],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| CatalogError::UnknownFolder(index.folder.clone()))?;

        let (device_row, mut sequence) = self.peer_device_sequence(&txn, folder_id)?;
        let mut updated = false;

        ensure_root(&txn, folder_id, &mut sequence)?;

        for directory in &index.directories {
            let parent_sync = lookup_sync(&txn, folder_id, &parent_of(&directory.name))?
                .unwrap_or(SyncLevel::None);
            let Some((directory_id, directory_sync)) =
                apply_directory(&txn, folder_id, directory, parent_sync, &mut sequence, &mut updated)?
            else {
                continue;
            };

            for file in &directory.files {
                let Some(file_id) =
                    apply_file(&txn, directory_id, file, directory_sync, &mut sequence, &mut updated)?
                else {
                    continue;
                };
                apply_blocks(&txn, file_id, file)?;
            }
        }

        txn.execute(
            "UPDATE device SET max_sequence_internal = ?2 WHERE id = ?1",
            params![device_row, sequence],
        )?;
        txn.commit()?;

        debug!(folder = %index.folder, sequence, updated, "index applied");
        Ok(updated)
    }

    /// Finds the peer (non-self) device row for a folder and its current
    /// internal sequence counter.
    fn peer_device_sequence(
        &self,
        txn: &Transaction<'_>,
        folder_id: i64,
    ) -> Result<(i64, i64), CatalogError> {
        txn.query_row(
            "SELECT id, max_sequence_internal FROM device
             WHERE folder_id = ?1 AND device_id != ?2
             ORDER BY id LIMIT 1",
            params![folder_id, self.self_id.as_slice()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?
        .ok_or_else(|| CatalogError::MissingPeerDevice(folder_id.to_string()))
    }
}

/// Creates the lazily-materialised root directory row.
fn ensure_root(
    txn: &Transaction<'_>,
    folder_id: i64,
    sequence: &mut i64,
) -> Result<(), CatalogError> {
    let exists: Option<i64> = txn
        .query_row(
            "SELECT id FROM directory WHERE folder_id = ?1 AND name = '/'",
            params![folder_id],
            |row| row.get(0),
        )
        .optional()?;
    if exists.is_none() {
        *sequence += 1;
        txn.execute(
            "INSERT INTO directory (folder_id, name, sequence) VALUES (?1, '/', ?2)",
            params![folder_id, *sequence],
        )?;
    }
    Ok(())
}

fn parent_of(name: &str) -> String {
    match name.rfind('/') {
        Some(0) | None => "/".to_owned(),
        Some(position) => name[..position].to_owned(),
    }
}

fn lookup_sync(
    txn: &Transaction<'_>,
    folder_id: i64,
    name: &str,
) -> Result<Option<SyncLevel>, CatalogError> {
    let sync: Option<i64> = txn
        .query_row(
            "SELECT sync FROM directory WHERE folder_id = ?1 AND name = ?2",
            params![folder_id, name],
            |row| row.get(0),
        )
        .optional()?;
    Ok(sync.map(SyncLevel::from_i64))
}

/// Applies a directory record. Returns the row id and effective sync
/// level, or `None` when the record is a tombstone for an unknown row
/// (children are skipped in that case).
fn apply_directory(
    txn: &Transaction<'_>,
    folder_id: i64,
    directory: &DirectoryRecord,
    parent_sync: SyncLevel,
    sequence: &mut i64,
    updated: &mut bool,
) -> Result<Option<(i64, SyncLevel)>, CatalogError> {
    let existing: Option<(i64, i64, DirFields)> = txn
        .query_row(
            "SELECT id, sync, permissions, modified_s, modified_ns, modified_by, flags, version
             FROM directory WHERE folder_id = ?1 AND name = ?2",
            params![folder_id, directory.name],
            |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    DirFields {
                        permissions: row.get(2)?,
                        modified_s: row.get(3)?,
                        modified_ns: row.get(4)?,
                        modified_by: row.get(5)?,
                        flags: row.get(6)?,
                        version: row.get(7)?,
                    },
                ))
            },
        )
        .optional()?;

    let Some(entry) = &directory.entry else {
        // Placeholder: materialise it if unknown, otherwise leave the
        // stored row untouched.
        return match existing {
            Some((id, sync, _)) => Ok(Some((id, SyncLevel::from_i64(sync)))),
            None => {
                *sequence += 1;
                txn.execute(
                    "INSERT INTO directory (folder_id, name, sequence, sync)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![folder_id, directory.name, *sequence, parent_sync as i64],
                )?;
                Ok(Some((txn.last_insert_rowid(), parent_sync)))
            }
        };
    };

    let incoming = DirFields {
        permissions: i64::from(entry.permissions),
        modified_s: entry.modified_s,
        modified_ns: i64::from(entry.modified_ns),
        modified_by: entry.modified_by.to_vec(),
        flags: i64::from(entry.flags),
        version: entry.version.clone(),
    };

    match existing {
        None if entry.flags & FLAG_DELETED != 0 => Ok(None),
        None => {
            *sequence += 1;
            txn.execute(
                "INSERT INTO directory
                     (folder_id, name, permissions, modified_s, modified_ns, modified_by,
                      flags, sequence, version, sync)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    folder_id,
                    directory.name,
                    incoming.permissions,
                    incoming.modified_s,
                    incoming.modified_ns,
                    incoming.modified_by,
                    incoming.flags,
                    *sequence,
                    incoming.version,
                    parent_sync as i64
                ],
            )?;
            if parent_sync == SyncLevel::Full {
                *updated = true;
            }
            Ok(Some((txn.last_insert_rowid(), parent_sync)))
        }
        Some((id, sync, stored)) => {
            let sync = SyncLevel::from_i64(sync);
            if stored != incoming {
                *sequence += 1;
                txn.execute(
                    "UPDATE directory SET permissions = ?2, modified_s = ?3, modified_ns = ?4,
                         modified_by = ?5, flags = ?6, sequence = ?7, version = ?8
                     WHERE id = ?1",
                    params![
                        id,
                        incoming.permissions,
                        incoming.modified_s,
                        incoming.modified_ns,
                        incoming.modified_by,
                        incoming.flags,
                        *sequence,
                        incoming.version
                    ],
                )?;
                if sync == SyncLevel::Full {
                    *updated = true;
                }
            }
            Ok(Some((id, sync)))
        }
    }
}

/// Applies a file or symlink record under its directory row. Returns the
/// file row id, or `None` for a tombstone of an unknown row.
fn apply_file(
    txn: &Transaction<'_>,
    directory_id: i64,
    file: &EntryRecord,
    parent_sync: SyncLevel,
    sequence: &mut i64,
    updated: &mut bool,
) -> Result<Option<i64>, CatalogError> {
    let existing: Option<(i64, i64, FileFields)> = txn
        .query_row(
            "SELECT id, sync, kind, size, permissions, modified_s, modified_ns, modified_by,
                    flags, block_size, version, symlink_target
             FROM file WHERE directory_id = ?1 AND name = ?2",
            params![directory_id, file.name],
            |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    FileFields {
                        kind: row.get(2)?,
                        size: row.get(3)?,
                        permissions: row.get(4)?,
                        modified_s: row.get(5)?,
                        modified_ns: row.get(6)?,
                        modified_by: row.get(7)?,
                        flags: row.get(8)?,
                        block_size: row.get(9)?,
                        version: row.get(10)?,
                        symlink_target: row.get(11)?,
                    },
                ))
            },
        )
        .optional()?;

    let incoming = FileFields {
        kind: if file.kind == EntryKind::Symlink {
            KIND_SYMLINK
        } else {
            KIND_FILE
        },
        size: file.size,
        permissions: i64::from(file.permissions),
        modified_s: file.modified_s,
        modified_ns: i64::from(file.modified_ns),
        modified_by: file.modified_by.to_vec(),
        flags: i64::from(file.flags),
        block_size: i64::from(file.block_size),
        version: file.version.clone(),
        symlink_target: file.symlink_target.clone(),
    };

    match existing {
        None if file.flags & FLAG_DELETED != 0 => Ok(None),
        None => {
            *sequence += 1;
            txn.execute(
                "INSERT INTO file
                     (directory_id, name, kind, size, permissions, modified_s, modified_ns,
                      modified_by, flags, sequence, block_size, version, symlink_target, sync)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                params![
                    directory_id,
                    file.name,
                    incoming.kind,
                    incoming.size,
                    incoming.permissions,
                    incoming.modified_s,
                    incoming.modified_ns,
                    incoming.modified_by,
                    incoming.flags,
                    *sequence,
                    incoming.block_size,
                    incoming.version,
                    incoming.symlink_target,
                    parent_sync as i64
                ],
            )?;
            if parent_sync == SyncLevel::Full {
                *updated = true;
            }
            Ok(Some(txn.last_insert_rowid()))
        }
        Some((id, sync, stored)) => {
            if stored != incoming {
                *sequence += 1;
                txn.execute(
                    "UPDATE file SET kind = ?2, size = ?3, permissions = ?4, modified_s = ?5,
                         modified_ns = ?6, modified_by = ?7, flags = ?8, sequence = ?9,
                         block_size = ?10, version = ?11, symlink_target = ?12
                     WHERE id = ?1",
                    params![
                        id,
                        incoming.kind,
                        incoming.size,
                        incoming.permissions,
                        incoming.modified_s,
                        incoming.modified_ns,
                        incoming.modified_by,
                        incoming.flags,
                        *sequence,
                        incoming.block_size,
                        incoming.version,
                        incoming.symlink_target
                    ],
                )?;
                if SyncLevel::from_i64(sync) == SyncLevel::Full {
                    *updated = true;
                }
            }
            Ok(Some(id))
        }
    }
}

/// Reconciles a file's stored block list against the incoming one,
/// pairwise in offset order.
///
/// A changed block that was cached is downgraded to stale so cleanup can
/// remove the on-disk copy; surplus stored blocks past the incoming list
/// become zero-size stale tombstones when cached and are deleted
/// otherwise. The final insert uses `OR REPLACE` so a tombstone left at
/// a colliding offset yields to the fresh block.
fn apply_blocks(
    txn: &Transaction<'_>,
    file_id: i64,
    file: &EntryRecord,
) -> Result<(), CatalogError> {
    struct StoredBlock {
        id: i64,
        offset: i64,
        size: i64,
        hash: Vec<u8>,
        cached: i64,
    }

    let mut stmt = txn.prepare(
        "SELECT id, offset, size, hash, cached FROM block WHERE file_id = ?1 ORDER BY offset",
    )?;
    let existing: Vec<StoredBlock> = stmt
        .query_map(params![file_id], |row| {
            Ok(StoredBlock {
                id: row.get(0)?,
                offset: row.get(1)?,
                size: row.get(2)?,
                hash: row.get(3)?,
                cached: row.get(4)?,
            })
        })?
        .collect::<Result<_, _>>()?;
    drop(stmt);

    let mut pending: Vec<(i64, i64, Vec<u8>, i64)> = Vec::new();

    for position in 0..existing.len().max(file.blocks.len()) {
        match (existing.get(position), file.blocks.get(position)) {
            (Some(stored), Some(incoming)) => {
                let unchanged = stored.offset == incoming.offset
                    && stored.size == i64::from(incoming.size)
                    && stored.hash == incoming.hash;
                if unchanged {
                    continue;
                }
                let downgraded = if stored.cached == 1 { 2 } else { stored.cached };
                if stored.offset == incoming.offset {
                    txn.execute(
                        "UPDATE block SET size = ?2, hash = ?3, cached = ?4 WHERE id = ?1",
                        params![stored.id, incoming.size, incoming.hash, downgraded],
                    )?;
                } else {
                    // Offset moved: replace the row. Any cached copy at the
                    // old offset path is orphaned and left to cache pruning.
                    txn.execute("DELETE FROM block WHERE id = ?1", params![stored.id])?;
                    pending.push((incoming.offset, i64::from(incoming.size), incoming.hash.clone(), 0));
                }
            }
            (None, Some(incoming)) => {
                pending.push((incoming.offset, i64::from(incoming.size), incoming.hash.clone(), 0));
            }
            (Some(stored), None) => {
                if stored.cached != 0 {
                    txn.execute(
                        "UPDATE block SET size = 0, cached = 2 WHERE id = ?1",
                        params![stored.id],
                    )?;
                } else {
                    txn.execute("DELETE FROM block WHERE id = ?1", params![stored.id])?;
                }
            }
            (None, None) => unreachable!("loop bounded by the longer list"),
        }
    }

    for (offset, size, hash, cached) in pending {
        txn.execute(
            "INSERT OR REPLACE INTO block (file_id, offset, size, hash, cached)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![file_id, offset, size, hash, cached],
        )?;
    }

    Ok(())
}

#[derive(PartialEq)]
struct DirFields {
    permissions: i64,
    modified_s: i64,
    modified_ns: i64,
    modified_by: Vec<u8>,
    flags: i64,
    version: String,
}

#[derive(PartialEq)]
struct FileFields {
    kind: i64,
    size: i64,
    permissions: i64,
    modified_s: i64,
    modified_ns: i64,
    modified_by: Vec<u8>,
    flags: i64,
    block_size: i64,
    version: String,
    symlink_target: String,
}
