//! Store handle and cluster-config application.

use std::path::Path;
use std::sync::Mutex;

use bex_deviceid::DeviceId;
use bex_protocol::wire;
use rand::RngCore;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use tracing::{debug, info, warn};

use crate::model::{CachedState, StaleBlock, SyncLevel};
use crate::pool::Pool;
use crate::{CatalogError, schema};

/// Handle over the catalog database.
///
/// One dedicated writer connection serialises every mutation behind
/// exclusive transactions; reads run on pooled connections.
pub struct Store {
    pub(crate) writer: Mutex<Connection>,
    pub(crate) pool: Pool,
    pub(crate) self_id: [u8; 32],
    pub(crate) device_name: String,
}

impl Store {
    /// Opens (creating if necessary) the catalog at `path`.
    ///
    /// `self_id` is the local device identity; `device_name` overrides
    /// whatever name peers advertise for us.
    pub fn open(
        path: &Path,
        self_id: &DeviceId,
        device_name: &str,
    ) -> Result<Self, CatalogError> {
        let writer = Connection::open(path)?;
        writer.pragma_update(None, "foreign_keys", true)?;
        writer.busy_timeout(std::time::Duration::from_secs(5))?;
        schema::ensure_schema(&writer)?;
        Ok(Self {
            writer: Mutex::new(writer),
            pool: Pool::new(path),
            self_id: *self_id.as_bytes(),
            device_name: device_name.to_owned(),
        })
    }

    /// Applies a peer's cluster configuration.
    ///
    /// Folders and their devices are upserted. The self device receives a
    /// random index id on first insert and always keeps our configured
    /// name; a non-self device whose index id changed gets its internal
    /// sequence reset to zero, forcing a full resync.
    pub fn update_cluster_config(
        &self,
        cluster: &wire::ClusterConfig,
    ) -> Result<(), CatalogError> {
        let mut writer = self.writer.lock().expect("catalog writer lock poisoned");
        let txn = writer.transaction_with_behavior(TransactionBehavior::Exclusive)?;

        for folder in &cluster.folders {
            txn.execute(
                "INSERT INTO folder (id_string, label, path) VALUES (?1, ?2, ?1)
                 ON CONFLICT (id_string) DO UPDATE SET label = ?2",
                params![folder.id, folder.label],
            )?;
            let folder_id: i64 = txn.query_row(
                "SELECT id FROM folder WHERE id_string = ?1",
                params![folder.id],
                |row| row.get(0),
            )?;

            for device in &folder.devices {
                if device.id.len() != 32 {
                    warn!(folder = %folder.id, len = device.id.len(), "skipping device with malformed id");
                    continue;
                }
                self.upsert_device(&txn, folder_id, device)?;
            }

            // The peer's description may omit us entirely; the self row
            // must exist for the outbound config to be constructible.
            self.ensure_self_device(&txn, folder_id)?;
        }

        txn.commit()?;
        debug!(folders = cluster.folders.len(), "cluster configuration applied");
        Ok(())
    }

    fn upsert_device(
        &self,
        txn: &rusqlite::Transaction<'_>,
        folder_id: i64,
        device: &wire::Device,
    ) -> Result<(), CatalogError> {
        let is_self = device.id.as_slice() == self.self_id;
        let name = if is_self {
            self.device_name.as_str()
        } else {
            device.name.as_str()
        };
        let addresses = device.addresses.join(",");
        let wire_index_id = device.index_id.to_be_bytes();

        let existing: Option<(i64, Vec<u8>)> = txn
            .query_row(
                "SELECT id, index_id FROM device WHERE device_id = ?1 AND folder_id = ?2",
                params![device.id, folder_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match existing {
            None => {
                let index_id: [u8; 8] = if is_self {
                    random_index_id()
                } else {
                    wire_index_id
                };
                txn.execute(
                    "INSERT INTO device
                         (device_id, folder_id, name, addresses, max_sequence, index_id)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        device.id,
                        folder_id,
                        name,
                        addresses,
                        device.max_sequence,
                        index_id.as_slice()
                    ],
                )?;
            }
            Some((row_id, stored_index_id)) => {
                txn.execute(
                    "UPDATE device SET name = ?2, addresses = ?3, max_sequence = ?4 WHERE id = ?1",
                    params![row_id, name, addresses, device.max_sequence],
                )?;
                if !is_self && stored_index_id != wire_index_id {
                    warn!(
                        device = %hex::encode(&device.id[..8]),
                        "device index id changed; resetting sequence for full resync"
                    );
                    txn.execute(
                        "UPDATE device SET index_id = ?2, max_sequence_internal = 0 WHERE id = ?1",
                        params![row_id, wire_index_id.as_slice()],
                    )?;
                }
            }
        }
        Ok(())
    }

    fn ensure_self_device(
        &self,
        txn: &rusqlite::Transaction<'_>,
        folder_id: i64,
    ) -> Result<(), CatalogError> {
        let present: Option<i64> = txn
            .query_row(
                "SELECT id FROM device WHERE device_id = ?1 AND folder_id = ?2",
                params![self.self_id.as_slice(), folder_id],
                |row| row.get(0),
            )
            .optional()?;
        if present.is_none() {
            let index_id = random_index_id();
            txn.execute(
                "INSERT INTO device (device_id, folder_id, name, addresses, index_id)
                 VALUES (?1, ?2, ?3, '', ?4)",
                params![
                    self.self_id.as_slice(),
                    folder_id,
                    self.device_name,
                    index_id.as_slice()
                ],
            )?;
        }
        Ok(())
    }

    /// Builds the cluster configuration we advertise to `peer`.
    ///
    /// Every folder carries exactly two devices: ourselves, announcing
    /// the stored index id and the internal sequence high-water mark, and
    /// the peer. A folder without a peer device row is an error.
    pub fn cluster_config_for(
        &self,
        peer: &DeviceId,
    ) -> Result<wire::ClusterConfig, CatalogError> {
        let conn = self.pool.acquire()?;
        let mut folders = Vec::new();

        let mut folder_stmt =
            conn.prepare("SELECT id, id_string, label FROM folder ORDER BY id_string")?;
        let folder_rows: Vec<(i64, String, String)> = folder_stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
            .collect::<Result<_, _>>()?;

        for (folder_id, id_string, label) in folder_rows {
            let self_device = self.device_for(&conn, folder_id, &self.self_id)?.ok_or_else(
                || CatalogError::MissingPeerDevice(id_string.clone()),
            )?;
            let peer_device = self
                .device_for(&conn, folder_id, peer.as_bytes())?
                .ok_or_else(|| CatalogError::MissingPeerDevice(id_string.clone()))?;

            folders.push(wire::Folder {
                id: id_string,
                label,
                devices: vec![
                    wire::Device {
                        id: self.self_id.to_vec(),
                        name: self.device_name.clone(),
                        addresses: self_device.addresses,
                        max_sequence: self_device.max_sequence_internal,
                        index_id: self_device.index_id,
                    },
                    wire::Device {
                        id: peer.as_bytes().to_vec(),
                        name: peer_device.name,
                        addresses: peer_device.addresses,
                        max_sequence: peer_device.max_sequence,
                        index_id: peer_device.index_id,
                    },
                ],
                ..Default::default()
            });
        }

        Ok(wire::ClusterConfig { folders })
    }

    fn device_for(
        &self,
        conn: &Connection,
        folder_id: i64,
        device_id: &[u8],
    ) -> Result<Option<DeviceFields>, CatalogError> {
        let row = conn
            .query_row(
                "SELECT name, addresses, max_sequence, max_sequence_internal, index_id
                 FROM device WHERE folder_id = ?1 AND device_id = ?2",
                params![folder_id, device_id],
                |row| {
                    let name: String = row.get(0)?;
                    let addresses: String = row.get(1)?;
                    let max_sequence: i64 = row.get(2)?;
                    let max_sequence_internal: i64 = row.get(3)?;
                    let index_id: Vec<u8> = row.get(4)?;
                    Ok(DeviceFields {
                        name,
                        addresses: addresses
                            .split(',')
                            .filter(|part| !part.is_empty())
                            .map(str::to_owned)
                            .collect(),
                        max_sequence,
                        max_sequence_internal,
                        index_id: index_id_to_u64(&index_id),
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Updates a block's cache state after cache I/O.
    pub fn mark_block(
        &self,
        file_id: i64,
        offset: i64,
        state: CachedState,
    ) -> Result<(), CatalogError> {
        let writer = self.writer.lock().expect("catalog writer lock poisoned");
        writer.execute(
            "UPDATE block SET cached = ?3 WHERE file_id = ?1 AND offset = ?2",
            params![file_id, offset, state as i64],
        )?;
        Ok(())
    }

    /// Finishes cleanup of a stale block: tombstone rows disappear,
    /// regular rows return to the absent state.
    pub fn resolve_stale(&self, block: &StaleBlock) -> Result<(), CatalogError> {
        let writer = self.writer.lock().expect("catalog writer lock poisoned");
        if block.size == 0 {
            writer.execute(
                "DELETE FROM block WHERE file_id = ?1 AND offset = ?2 AND cached = 2",
                params![block.file_id, block.offset],
            )?;
        } else {
            writer.execute(
                "UPDATE block SET cached = 0 WHERE file_id = ?1 AND offset = ?2 AND cached = 2",
                params![block.file_id, block.offset],
            )?;
        }
        Ok(())
    }

    /// Sets the sync level for a directory subtree.
    ///
    /// Applies to the named directory, every directory below it, and all
    /// their files; newly indexed entries inherit it from their parent.
    pub fn set_sync(&self, path: &str, level: SyncLevel) -> Result<(), CatalogError> {
        let (folder, dir_name) = split_folder_path(path)?;
        let mut writer = self.writer.lock().expect("catalog writer lock poisoned");
        let txn = writer.transaction_with_behavior(TransactionBehavior::Exclusive)?;

        let folder_id: i64 = txn
            .query_row(
                "SELECT id FROM folder WHERE id_string = ?1",
                params![folder],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| CatalogError::UnknownFolder(folder.to_owned()))?;

        let prefix = if dir_name == "/" {
            String::new()
        } else {
            dir_name.clone()
        };
        let updated = txn.execute(
            "UPDATE directory SET sync = ?3
             WHERE folder_id = ?1 AND (name = ?2 OR name LIKE ?4 || '/%')",
            params![folder_id, dir_name, level as i64, prefix],
        )?;
        if updated == 0 {
            return Err(CatalogError::NotFound(path.to_owned()));
        }
        txn.execute(
            "UPDATE file SET sync = ?2 WHERE directory_id IN (
                 SELECT id FROM directory
                 WHERE folder_id = ?1 AND (name = ?3 OR name LIKE ?4 || '/%'))",
            params![folder_id, level as i64, dir_name, prefix],
        )?;

        txn.commit()?;
        info!(path, level = ?level, "sync level updated");
        Ok(())
    }
}

struct DeviceFields {
    name: String,
    addresses: Vec<String>,
    max_sequence: i64,
    max_sequence_internal: i64,
    index_id: u64,
}

fn random_index_id() -> [u8; 8] {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

pub(crate) fn index_id_to_u64(bytes: &[u8]) -> u64 {
    let mut fixed = [0u8; 8];
    let len = bytes.len().min(8);
    fixed[..len].copy_from_slice(&bytes[..len]);
    u64::from_be_bytes(fixed)
}

/// Splits an absolute catalog path into its folder id string and the
/// directory path within the folder.
pub(crate) fn split_folder_path(path: &str) -> Result<(String, String), CatalogError> {
    let trimmed = path
        .strip_prefix('/')
        .ok_or_else(|| CatalogError::InvalidPath(path.to_owned()))?;
    if trimmed.is_empty() {
        return Err(CatalogError::InvalidPath(path.to_owned()));
    }
    match trimmed.split_once('/') {
        None => Ok((trimmed.to_owned(), "/".to_owned())),
        Some((folder, rest)) if rest.is_empty() => Ok((folder.to_owned(), "/".to_owned())),
        Some((folder, rest)) => Ok((folder.to_owned(), format!("/{rest}"))),
    }
}
