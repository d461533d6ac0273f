//! Schema creation and versioning.

use rusqlite::Connection;
use tracing::info;

/// Current schema version.
pub(crate) const SCHEMA_VERSION: i64 = 1;

/// Creates missing tables and records the schema version.
///
/// The catalog is created wholesale at the current version; there are no
/// stepwise migrations yet because version 1 is the first on-disk layout.
pub(crate) fn ensure_schema(conn: &Connection) -> Result<(), rusqlite::Error> {
    let existing: Option<i64> = conn
        .query_row(
            "SELECT version FROM schema LIMIT 1",
            [],
            |row| row.get(0),
        )
        .map(Some)
        .or_else(|error| match error {
            rusqlite::Error::SqliteFailure(..) | rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
        })?;

    if existing == Some(SCHEMA_VERSION) {
        return Ok(());
    }

    conn.execute_batch(
        "
        BEGIN EXCLUSIVE;

        CREATE TABLE IF NOT EXISTS schema (
            version INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS folder (
            id          INTEGER PRIMARY KEY,
            id_string   TEXT NOT NULL UNIQUE,
            label       TEXT NOT NULL DEFAULT '',
            path        TEXT NOT NULL DEFAULT '',
            flags       INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS device (
            id                    INTEGER PRIMARY KEY,
            device_id             BLOB NOT NULL,
            folder_id             INTEGER NOT NULL REFERENCES folder(id) ON DELETE CASCADE,
            name                  TEXT NOT NULL DEFAULT '',
            addresses             TEXT NOT NULL DEFAULT '',
            max_sequence          INTEGER NOT NULL DEFAULT 0,
            max_sequence_internal INTEGER NOT NULL DEFAULT 0,
            index_id              BLOB NOT NULL,
            UNIQUE (device_id, folder_id)
        );

        CREATE TABLE IF NOT EXISTS directory (
            id          INTEGER PRIMARY KEY,
            folder_id   INTEGER NOT NULL REFERENCES folder(id) ON DELETE CASCADE,
            name        TEXT NOT NULL,
            permissions INTEGER NOT NULL DEFAULT 0,
            modified_s  INTEGER NOT NULL DEFAULT 0,
            modified_ns INTEGER NOT NULL DEFAULT 0,
            modified_by BLOB NOT NULL DEFAULT (zeroblob(8)),
            flags       INTEGER NOT NULL DEFAULT 0,
            sequence    INTEGER NOT NULL DEFAULT 0,
            version     TEXT NOT NULL DEFAULT '',
            sync        INTEGER NOT NULL DEFAULT 0,
            UNIQUE (folder_id, name)
        );

        CREATE TABLE IF NOT EXISTS file (
            id             INTEGER PRIMARY KEY,
            directory_id   INTEGER NOT NULL REFERENCES directory(id) ON DELETE CASCADE,
            name           TEXT NOT NULL,
            kind           INTEGER NOT NULL DEFAULT 0,
            size           INTEGER NOT NULL DEFAULT 0,
            permissions    INTEGER NOT NULL DEFAULT 0,
            modified_s     INTEGER NOT NULL DEFAULT 0,
            modified_ns    INTEGER NOT NULL DEFAULT 0,
            modified_by    BLOB NOT NULL DEFAULT (zeroblob(8)),
            flags          INTEGER NOT NULL DEFAULT 0,
            sequence       INTEGER NOT NULL DEFAULT 0,
            block_size     INTEGER NOT NULL DEFAULT 0,
            version        TEXT NOT NULL DEFAULT '',
            symlink_target TEXT NOT NULL DEFAULT '',
            sync           INTEGER NOT NULL DEFAULT 0,
            UNIQUE (directory_id, name)
        );

        CREATE TABLE IF NOT EXISTS block (
            id      INTEGER PRIMARY KEY,
            file_id INTEGER NOT NULL REFERENCES file(id) ON DELETE CASCADE,
            offset  INTEGER NOT NULL,
            size    INTEGER NOT NULL DEFAULT 0,
            hash    BLOB NOT NULL,
            cached  INTEGER NOT NULL DEFAULT 0,
            UNIQUE (file_id, offset)
        );

        CREATE INDEX IF NOT EXISTS idx_block_cached ON block (cached);
        CREATE INDEX IF NOT EXISTS idx_directory_name ON directory (folder_id, name);

        DELETE FROM schema;
        INSERT INTO schema (version) VALUES (1);

        COMMIT;
        ",
    )?;

    info!(version = SCHEMA_VERSION, "catalog schema ready");
    Ok(())
}
