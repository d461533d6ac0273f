//! Read-side queries: the read planner, directory listings, attribute
//! lookups, and the cache-maintenance feeds.

use rusqlite::{Connection, OptionalExtension, params};

use crate::CatalogError;
use crate::model::{
    BlockRequest, CachedState, EntryType, ListEntry, StaleBlock, SyncLevel,
};
use crate::store::{Store, split_folder_path};

impl Store {
    /// Plans the ordered block fetches satisfying a byte-range read.
    ///
    /// Selects every block whose `[offset, offset + size)` overlaps
    /// `[position, position + length)`, in offset order, tagged with the
    /// cache state recorded at planning time.
    pub fn blocks_for_read(
        &self,
        path: &str,
        position: i64,
        length: i64,
    ) -> Result<Vec<BlockRequest>, CatalogError> {
        let (folder, dir_name, file_name) = split_file_path(path)?;
        let conn = self.pool.acquire()?;

        let (file_id, wire) = resolve_file(&conn, &folder, &dir_name, &file_name)
            .ok_or_else(|| CatalogError::NotFound(path.to_owned()))?;

        let mut stmt = conn.prepare(
            "SELECT offset, size, hash, cached FROM block
             WHERE file_id = ?1 AND offset < ?2 AND offset + size > ?3
             ORDER BY offset",
        )?;
        let blocks = stmt
            .query_map(params![file_id, position + length, position], |row| {
                Ok(BlockRequest {
                    folder: folder.clone(),
                    name: wire.clone(),
                    file_id,
                    offset: row.get(0)?,
                    size: row.get::<_, i64>(1)? as i32,
                    hash: row.get(2)?,
                    cached: CachedState::from_i64(row.get(3)?),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(blocks)
    }

    /// Lists a directory.
    ///
    /// The root lists one synthetic directory per known folder, named by
    /// the folder's local path label. Deleted entries are omitted; an
    /// unknown path yields an empty list.
    pub fn list(&self, path: &str) -> Result<Vec<ListEntry>, CatalogError> {
        let conn = self.pool.acquire()?;

        if path == "/" {
            let mut stmt = conn.prepare("SELECT path FROM folder ORDER BY id_string")?;
            let entries = stmt
                .query_map([], |row| {
                    Ok(ListEntry {
                        entry_type: EntryType::Directory,
                        name: row.get(0)?,
                        size: 0,
                        permissions: 0,
                        modified: 0,
                        modified_by: [0; 8],
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(entries);
        }

        let (folder, dir_name) = split_folder_path(path)?;
        let Some(folder_id) = folder_row(&conn, &folder)? else {
            return Ok(Vec::new());
        };
        let directory: Option<i64> = conn
            .query_row(
                "SELECT id FROM directory WHERE folder_id = ?1 AND name = ?2 AND flags & 1 = 0",
                params![folder_id, dir_name],
                |row| row.get(0),
            )
            .optional()?;
        let Some(directory_id) = directory else {
            return Ok(Vec::new());
        };

        let mut entries = Vec::new();

        let mut dir_stmt = conn.prepare(
            "SELECT name, permissions, modified_s, modified_by FROM directory
             WHERE folder_id = ?1 AND name != '/' AND flags & 1 = 0 ORDER BY name",
        )?;
        let child_dirs = dir_stmt.query_map(params![folder_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, Vec<u8>>(3)?,
            ))
        })?;
        for row in child_dirs {
            let (name, permissions, modified_s, modified_by) = row?;
            if parent_name(&name) != dir_name {
                continue;
            }
            entries.push(ListEntry {
                entry_type: EntryType::Directory,
                name: basename(&name).to_owned(),
                size: 0,
                permissions: permissions as u32,
                modified: modified_s,
                modified_by: fixed_modified_by(&modified_by),
            });
        }

        let mut file_stmt = conn.prepare(
            "SELECT name, kind, size, permissions, modified_s, modified_by FROM file
             WHERE directory_id = ?1 AND flags & 1 = 0 ORDER BY name",
        )?;
        let files = file_stmt.query_map(params![directory_id], |row| {
            Ok(ListEntry {
                entry_type: if row.get::<_, i64>(1)? == 1 {
                    EntryType::Symlink
                } else {
                    EntryType::File
                },
                name: row.get(0)?,
                size: row.get(2)?,
                permissions: row.get::<_, i64>(3)? as u32,
                modified: row.get(4)?,
                modified_by: fixed_modified_by(&row.get::<_, Vec<u8>>(5)?),
            })
        })?;
        for entry in files {
            entries.push(entry?);
        }

        Ok(entries)
    }

    /// Looks a single path up; `None` when absent or deleted.
    pub fn attributes(&self, path: &str) -> Result<Option<ListEntry>, CatalogError> {
        if path == "/" {
            return Ok(Some(ListEntry {
                entry_type: EntryType::Directory,
                name: "/".to_owned(),
                size: 0,
                permissions: 0,
                modified: 0,
                modified_by: [0; 8],
            }));
        }

        let conn = self.pool.acquire()?;
        let (folder, dir_name) = split_folder_path(path)?;
        let Some(folder_id) = folder_row(&conn, &folder)? else {
            return Ok(None);
        };

        if dir_name == "/" {
            let label: String = conn.query_row(
                "SELECT path FROM folder WHERE id = ?1",
                params![folder_id],
                |row| row.get(0),
            )?;
            let root = directory_entry(&conn, folder_id, "/", &label)?;
            return Ok(Some(root.unwrap_or(ListEntry {
                entry_type: EntryType::Directory,
                name: label,
                size: 0,
                permissions: 0,
                modified: 0,
                modified_by: [0; 8],
            })));
        }

        if let Some(entry) =
            directory_entry(&conn, folder_id, &dir_name, basename(&dir_name))?
        {
            return Ok(Some(entry));
        }

        let parent = parent_name(&dir_name);
        let name = basename(&dir_name);
        let Some(directory_id): Option<i64> = conn
            .query_row(
                "SELECT id FROM directory WHERE folder_id = ?1 AND name = ?2",
                params![folder_id, parent],
                |row| row.get(0),
            )
            .optional()?
        else {
            return Ok(None);
        };

        let entry = conn
            .query_row(
                "SELECT kind, size, permissions, modified_s, modified_by, flags FROM file
                 WHERE directory_id = ?1 AND name = ?2",
                params![directory_id, name],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, Vec<u8>>(4)?,
                        row.get::<_, i64>(5)?,
                    ))
                },
            )
            .optional()?;
        Ok(entry.and_then(|(kind, size, permissions, modified_s, modified_by, flags)| {
            if flags & 1 != 0 {
                return None;
            }
            Some(ListEntry {
                entry_type: if kind == 1 {
                    EntryType::Symlink
                } else {
                    EntryType::File
                },
                name: name.to_owned(),
                size,
                permissions: permissions as u32,
                modified: modified_s,
                modified_by: fixed_modified_by(&modified_by),
            })
        }))
    }

    /// Stale cached blocks awaiting on-disk cleanup.
    pub fn stale_blocks(&self) -> Result<Vec<StaleBlock>, CatalogError> {
        let conn = self.pool.acquire()?;
        let mut stmt = conn.prepare(
            "SELECT folder.id_string, block.file_id, block.offset, block.size
             FROM block
             JOIN file ON file.id = block.file_id
             JOIN directory ON directory.id = file.directory_id
             JOIN folder ON folder.id = directory.folder_id
             WHERE block.cached = 2",
        )?;
        let blocks = stmt
            .query_map([], |row| {
                Ok(StaleBlock {
                    folder: row.get(0)?,
                    file_id: row.get(1)?,
                    offset: row.get(2)?,
                    size: row.get::<_, i64>(3)? as i32,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(blocks)
    }

    /// Uncached blocks of live, fully-synced files, for opportunistic
    /// background refill.
    pub fn refill_candidates(&self, limit: usize) -> Result<Vec<BlockRequest>, CatalogError> {
        let conn = self.pool.acquire()?;
        let mut stmt = conn.prepare(
            "SELECT folder.id_string, directory.name, file.name, block.file_id,
                    block.offset, block.size, block.hash
             FROM block
             JOIN file ON file.id = block.file_id
             JOIN directory ON directory.id = file.directory_id
             JOIN folder ON folder.id = directory.folder_id
             WHERE block.cached = 0 AND file.flags & 1 = 0 AND file.sync = ?1
             ORDER BY block.file_id, block.offset
             LIMIT ?2",
        )?;
        let blocks = stmt
            .query_map(params![SyncLevel::Full as i64, limit as i64], |row| {
                let dir_name: String = row.get(1)?;
                let file_name: String = row.get(2)?;
                Ok(BlockRequest {
                    folder: row.get(0)?,
                    name: wire_name(&dir_name, &file_name),
                    file_id: row.get(3)?,
                    offset: row.get(4)?,
                    size: row.get::<_, i64>(5)? as i32,
                    hash: row.get(6)?,
                    cached: CachedState::Absent,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(blocks)
    }
}

fn folder_row(conn: &Connection, id_string: &str) -> Result<Option<i64>, CatalogError> {
    Ok(conn
        .query_row(
            "SELECT id FROM folder WHERE id_string = ?1",
            params![id_string],
            |row| row.get(0),
        )
        .optional()?)
}

fn directory_entry(
    conn: &Connection,
    folder_id: i64,
    dir_name: &str,
    display_name: &str,
) -> Result<Option<ListEntry>, CatalogError> {
    let row = conn
        .query_row(
            "SELECT permissions, modified_s, modified_by, flags FROM directory
             WHERE folder_id = ?1 AND name = ?2",
            params![folder_id, dir_name],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            },
        )
        .optional()?;
    Ok(row.and_then(|(permissions, modified_s, modified_by, flags)| {
        if flags & 1 != 0 {
            return None;
        }
        Some(ListEntry {
            entry_type: EntryType::Directory,
            name: display_name.to_owned(),
            size: 0,
            permissions: permissions as u32,
            modified: modified_s,
            modified_by: fixed_modified_by(&modified_by),
        })
    }))
}

/// Splits an absolute path into folder, containing directory, and file
/// basename. Paths that name a folder or the root are not file paths.
pub(crate) fn split_file_path(path: &str) -> Result<(String, String, String), CatalogError> {
    let (folder, dir_and_file) = split_folder_path(path)?;
    if dir_and_file == "/" {
        return Err(CatalogError::InvalidPath(path.to_owned()));
    }
    let dir = parent_name(&dir_and_file);
    let file = basename(&dir_and_file);
    if file.is_empty() {
        return Err(CatalogError::InvalidPath(path.to_owned()));
    }
    Ok((folder, dir.to_owned(), file.to_owned()))
}

fn resolve_file(
    conn: &Connection,
    folder: &str,
    dir_name: &str,
    file_name: &str,
) -> Option<(i64, String)> {
    let folder_id: i64 = conn
        .query_row(
            "SELECT id FROM folder WHERE id_string = ?1",
            params![folder],
            |row| row.get(0),
        )
        .optional()
        .ok()??;
    let directory_id: i64 = conn
        .query_row(
            "SELECT id FROM directory WHERE folder_id = ?1 AND name = ?2",
            params![folder_id, dir_name],
            |row| row.get(0),
        )
        .optional()
        .ok()??;
    let file_id: i64 = conn
        .query_row(
            "SELECT id FROM file WHERE directory_id = ?1 AND name = ?2 AND flags & 1 = 0",
            params![directory_id, file_name],
            |row| row.get(0),
        )
        .optional()
        .ok()??;
    Some((file_id, wire_name(dir_name, file_name)))
}

/// Joins a directory path and basename into the relative wire name.
fn wire_name(dir_name: &str, file_name: &str) -> String {
    if dir_name == "/" {
        file_name.to_owned()
    } else {
        format!("{}/{}", &dir_name[1..], file_name)
    }
}

fn parent_name(name: &str) -> String {
    match name.rfind('/') {
        Some(0) | None => "/".to_owned(),
        Some(position) => name[..position].to_owned(),
    }
}

fn basename(name: &str) -> &str {
    match name.rfind('/') {
        Some(position) => &name[position + 1..],
        None => name,
    }
}

fn fixed_modified_by(bytes: &[u8]) -> [u8; 8] {
    let mut fixed = [0u8; 8];
    let len = bytes.len().min(8);
    fixed[..len].copy_from_slice(&bytes[..len]);
    fixed
}
