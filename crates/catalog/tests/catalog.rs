//! Catalog behaviour: cluster-config application, index deltas, the read
//! planner, and listings.

use bex_catalog::{CachedState, CatalogError, EntryType, Store, SyncLevel};
use bex_deviceid::DeviceId;
use bex_protocol::index::shape_index;
use bex_protocol::wire::{
    BlockInfo, ClusterConfig, Device, FileInfo, FileInfoType, Folder, Index,
};
use rusqlite::Connection;

const SELF_ID: [u8; 32] = [1; 32];
const PEER_ID: [u8; 32] = [2; 32];

fn open_store(dir: &tempfile::TempDir) -> (Store, std::path::PathBuf) {
    let path = dir.path().join("catalog.db");
    let store = Store::open(&path, &DeviceId::from_bytes(SELF_ID), "reader").expect("open");
    (store, path)
}

fn cluster_config(peer_index_id: u64) -> ClusterConfig {
    ClusterConfig {
        folders: vec![Folder {
            id: "docs".into(),
            label: "Documents".into(),
            devices: vec![
                Device {
                    id: SELF_ID.to_vec(),
                    name: "ignored-upstream-name".into(),
                    addresses: vec!["dynamic".into()],
                    max_sequence: 0,
                    index_id: 77,
                },
                Device {
                    id: PEER_ID.to_vec(),
                    name: "server".into(),
                    addresses: vec!["tcp://server:22000".into()],
                    max_sequence: 42,
                    index_id: peer_index_id,
                },
            ],
            ..Default::default()
        }],
    }
}

fn file_info(name: &str, blocks: Vec<BlockInfo>) -> FileInfo {
    FileInfo {
        name: name.into(),
        r#type: FileInfoType::File as i32,
        size: blocks.iter().map(|b| i64::from(b.size)).sum(),
        permissions: 0o644,
        modified_s: 1_700_000_000,
        modified_ns: 0,
        modified_by: 2,
        deleted: false,
        invalid: false,
        no_permissions: false,
        version: None,
        sequence: 1,
        block_size: 131_072,
        blocks,
        symlink_target: String::new(),
    }
}

fn dir_info(name: &str) -> FileInfo {
    let mut info = file_info(name, Vec::new());
    info.r#type = FileInfoType::Directory as i32;
    info
}

fn block(offset: i64, hash: u8) -> BlockInfo {
    BlockInfo {
        offset,
        size: 131_072,
        hash: vec![hash; 32],
    }
}

fn apply(store: &Store, files: Vec<FileInfo>) -> bool {
    store
        .update_index(&shape_index(Index {
            folder: "docs".into(),
            files,
        }))
        .expect("apply index")
}

/// Dumps the whole database into comparable rows.
fn dump(path: &std::path::Path) -> Vec<String> {
    let conn = Connection::open(path).expect("open dump connection");
    let mut rows = Vec::new();
    for table in ["folder", "device", "directory", "file", "block"] {
        let mut stmt = conn
            .prepare(&format!("SELECT * FROM {table} ORDER BY id"))
            .expect("prepare");
        let count = stmt.column_count();
        let table_rows = stmt
            .query_map([], |row| {
                let mut text = String::new();
                for index in 0..count {
                    let value = row.get::<_, rusqlite::types::Value>(index)?;
                    text.push_str(&format!("{value:?}|"));
                }
                Ok(text)
            })
            .expect("query");
        for row in table_rows {
            rows.push(format!("{table}:{}", row.expect("row")));
        }
    }
    rows
}

#[test]
fn cluster_config_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let (store, path) = open_store(&dir);

    store.update_cluster_config(&cluster_config(9)).unwrap();
    let first = dump(&path);
    store.update_cluster_config(&cluster_config(9)).unwrap();
    assert_eq!(first, dump(&path), "second application must not mutate");
}

#[test]
fn outbound_config_pairs_self_with_peer() {
    let dir = tempfile::tempdir().unwrap();
    let (store, _) = open_store(&dir);
    store.update_cluster_config(&cluster_config(9)).unwrap();

    let outbound = store
        .cluster_config_for(&DeviceId::from_bytes(PEER_ID))
        .unwrap();
    assert_eq!(outbound.folders.len(), 1);
    let devices = &outbound.folders[0].devices;
    assert_eq!(devices.len(), 2);
    assert_eq!(devices[0].id, SELF_ID.to_vec());
    assert_eq!(devices[0].name, "reader", "configured name wins");
    assert_ne!(devices[0].index_id, 77, "self index id is generated, not taken from the wire");
    assert_eq!(devices[1].id, PEER_ID.to_vec());
    assert_eq!(devices[1].max_sequence, 42);
    assert_eq!(devices[1].index_id, 9);
}

#[test]
fn missing_peer_device_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let (store, _) = open_store(&dir);
    let mut config = cluster_config(9);
    config.folders[0].devices.truncate(1);
    store.update_cluster_config(&config).unwrap();

    assert!(matches!(
        store.cluster_config_for(&DeviceId::from_bytes(PEER_ID)),
        Err(CatalogError::MissingPeerDevice(_))
    ));
}

#[test]
fn peer_index_id_change_resets_internal_sequence() {
    let dir = tempfile::tempdir().unwrap();
    let (store, path) = open_store(&dir);
    store.update_cluster_config(&cluster_config(9)).unwrap();
    apply(&store, vec![file_info("a.txt", vec![block(0, 0xAA)])]);

    let before: i64 = Connection::open(&path)
        .unwrap()
        .query_row(
            "SELECT max_sequence_internal FROM device WHERE device_id = ?1",
            [PEER_ID.as_slice()],
            |row| row.get(0),
        )
        .unwrap();
    assert!(before > 0, "index application advances the counter");

    store.update_cluster_config(&cluster_config(10)).unwrap();
    let after: i64 = Connection::open(&path)
        .unwrap()
        .query_row(
            "SELECT max_sequence_internal FROM device WHERE device_id = ?1",
            [PEER_ID.as_slice()],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(after, 0, "changed index id forces a resync");
}

#[test]
fn index_application_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let (store, path) = open_store(&dir);
    store.update_cluster_config(&cluster_config(9)).unwrap();

    let files = vec![
        dir_info("a"),
        file_info("a/b.txt", vec![block(0, 0xAA)]),
    ];
    apply(&store, files.clone());
    let first = dump(&path);
    let updated = apply(&store, files);
    assert!(!updated, "second application reports no change");
    assert_eq!(first, dump(&path), "second application must not mutate");
}

#[test]
fn sequence_covers_every_mutated_row() {
    let dir = tempfile::tempdir().unwrap();
    let (store, path) = open_store(&dir);
    store.update_cluster_config(&cluster_config(9)).unwrap();
    apply(
        &store,
        vec![
            dir_info("a"),
            file_info("a/b.txt", vec![block(0, 0xAA)]),
            file_info("a/c.txt", vec![block(0, 0xBB)]),
        ],
    );

    let conn = Connection::open(&path).unwrap();
    let counter: i64 = conn
        .query_row(
            "SELECT max_sequence_internal FROM device WHERE device_id = ?1",
            [PEER_ID.as_slice()],
            |row| row.get(0),
        )
        .unwrap();
    let max_row_sequence: i64 = conn
        .query_row(
            "SELECT max((SELECT max(sequence) FROM directory),
                        (SELECT max(sequence) FROM file))",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert!(counter >= max_row_sequence);
}

#[test]
fn superseding_block_marks_cached_copy_stale() {
    let dir = tempfile::tempdir().unwrap();
    let (store, path) = open_store(&dir);
    store.update_cluster_config(&cluster_config(9)).unwrap();

    apply(&store, vec![file_info("a/b.txt", vec![block(0, 0xAA)])]);
    let plan = store.blocks_for_read("/docs/a/b.txt", 0, 131_072).unwrap();
    store
        .mark_block(plan[0].file_id, 0, CachedState::Present)
        .unwrap();

    // Same file, new content hash.
    apply(&store, vec![file_info("a/b.txt", vec![block(0, 0xCC)])]);

    let conn = Connection::open(&path).unwrap();
    let (hash, cached): (Vec<u8>, i64) = conn
        .query_row("SELECT hash, cached FROM block", [], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })
        .unwrap();
    assert_eq!(hash, vec![0xCC; 32]);
    assert_eq!(cached, 2, "previously cached block is stale");
}

#[test]
fn surplus_cached_blocks_become_tombstones() {
    let dir = tempfile::tempdir().unwrap();
    let (store, path) = open_store(&dir);
    store.update_cluster_config(&cluster_config(9)).unwrap();

    apply(
        &store,
        vec![file_info("big.bin", vec![block(0, 0xAA), block(131_072, 0xBB)])],
    );
    let plan = store.blocks_for_read("/docs/big.bin", 0, 262_144).unwrap();
    store
        .mark_block(plan[0].file_id, 131_072, CachedState::Present)
        .unwrap();

    // The file shrank to a single block.
    apply(&store, vec![file_info("big.bin", vec![block(0, 0xAA)])]);

    let conn = Connection::open(&path).unwrap();
    let (size, cached): (i64, i64) = conn
        .query_row(
            "SELECT size, cached FROM block WHERE offset = 131072",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .unwrap();
    assert_eq!((size, cached), (0, 2), "cached surplus block becomes a stale tombstone");

    let stale = store.stale_blocks().unwrap();
    assert_eq!(stale.len(), 1);
    store.resolve_stale(&stale[0]).unwrap();
    let remaining: i64 = Connection::open(&path)
        .unwrap()
        .query_row("SELECT count(*) FROM block WHERE offset = 131072", [], |row| {
            row.get(0)
        })
        .unwrap();
    assert_eq!(remaining, 0, "tombstone row is removed after cleanup");
}

#[test]
fn read_plan_selects_overlapping_blocks_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let (store, _) = open_store(&dir);
    store.update_cluster_config(&cluster_config(9)).unwrap();
    apply(
        &store,
        vec![file_info(
            "a/big.bin",
            vec![block(0, 0xAA), block(131_072, 0xBB), block(262_144, 0xCC)],
        )],
    );

    let plan = store
        .blocks_for_read("/docs/a/big.bin", 100_000, 200_000)
        .unwrap();
    let offsets: Vec<i64> = plan.iter().map(|b| b.offset).collect();
    assert_eq!(offsets, vec![0, 131_072, 262_144]);
    assert!(plan.iter().all(|b| b.name == "a/big.bin" && b.folder == "docs"));

    let tail = store
        .blocks_for_read("/docs/a/big.bin", 262_144, 10)
        .unwrap();
    assert_eq!(tail.len(), 1);
    assert_eq!(tail[0].offset, 262_144);
}

#[test]
fn unknown_read_path_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let (store, _) = open_store(&dir);
    store.update_cluster_config(&cluster_config(9)).unwrap();
    assert!(matches!(
        store.blocks_for_read("/docs/missing.txt", 0, 10),
        Err(CatalogError::NotFound(_))
    ));
}

#[test]
fn listings_follow_the_tree() {
    let dir = tempfile::tempdir().unwrap();
    let (store, _) = open_store(&dir);
    store.update_cluster_config(&cluster_config(9)).unwrap();
    apply(
        &store,
        vec![
            dir_info("a"),
            file_info("a/b.txt", vec![block(0, 0xAA)]),
            file_info("top.txt", vec![block(0, 0xBB)]),
        ],
    );

    let root = store.list("/").unwrap();
    assert_eq!(root.len(), 1);
    assert_eq!(root[0].entry_type, EntryType::Directory);
    assert_eq!(root[0].name, "docs", "root names folders by local path label");

    let folder = store.list("/docs").unwrap();
    let names: Vec<&str> = folder.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["a", "top.txt"]);

    let nested = store.list("/docs/a").unwrap();
    assert_eq!(nested.len(), 1);
    assert_eq!(nested[0].name, "b.txt");
    assert_eq!(nested[0].size, 131_072);

    assert!(store.list("/docs/absent").unwrap().is_empty());
}

#[test]
fn attributes_resolve_files_directories_and_tombstones() {
    let dir = tempfile::tempdir().unwrap();
    let (store, _) = open_store(&dir);
    store.update_cluster_config(&cluster_config(9)).unwrap();
    apply(
        &store,
        vec![dir_info("a"), file_info("a/b.txt", vec![block(0, 0xAA)])],
    );

    let file = store.attributes("/docs/a/b.txt").unwrap().expect("file");
    assert_eq!(file.entry_type, EntryType::File);
    assert_eq!(file.size, 131_072);
    assert_eq!(file.modified_by, [0, 0, 0, 0, 0, 0, 0, 2]);

    let directory = store.attributes("/docs/a").unwrap().expect("directory");
    assert_eq!(directory.entry_type, EntryType::Directory);
    assert_eq!(directory.name, "a");

    assert!(store.attributes("/docs/absent").unwrap().is_none());

    // Tombstone the file; attributes must stop reporting it.
    let mut gone = file_info("a/b.txt", Vec::new());
    gone.deleted = true;
    apply(&store, vec![gone]);
    assert!(store.attributes("/docs/a/b.txt").unwrap().is_none());
}

#[test]
fn full_sync_subtree_flags_updates_and_feeds_refill() {
    let dir = tempfile::tempdir().unwrap();
    let (store, _) = open_store(&dir);
    store.update_cluster_config(&cluster_config(9)).unwrap();
    apply(&store, vec![dir_info("a")]);

    store.set_sync("/docs/a", SyncLevel::Full).unwrap();

    let updated = apply(&store, vec![file_info("a/new.txt", vec![block(0, 0xDD)])]);
    assert!(updated, "a new entry under a full-sync parent is material");

    let refill = store.refill_candidates(16).unwrap();
    assert_eq!(refill.len(), 1);
    assert_eq!(refill[0].name, "a/new.txt");
    assert_eq!(refill[0].cached, CachedState::Absent);

    let outside = apply(&store, vec![file_info("elsewhere.txt", vec![block(0, 0xEE)])]);
    assert!(!outside, "entries outside the subtree are not material");
}

#[test]
fn file_preceding_directory_is_adopted() {
    let dir = tempfile::tempdir().unwrap();
    let (store, _) = open_store(&dir);
    store.update_cluster_config(&cluster_config(9)).unwrap();

    // File first, directory metadata afterwards in the same message.
    apply(
        &store,
        vec![
            file_info("a/early.txt", vec![block(0, 0xAA)]),
            dir_info("a"),
        ],
    );

    let entry = store.attributes("/docs/a").unwrap().expect("directory");
    assert_eq!(entry.permissions, 0o644, "real metadata replaced the placeholder");
    assert!(store.attributes("/docs/a/early.txt").unwrap().is_some());
}

#[test]
fn deleted_entry_for_unknown_row_is_a_noop() {
    let dir = tempfile::tempdir().unwrap();
    let (store, path) = open_store(&dir);
    store.update_cluster_config(&cluster_config(9)).unwrap();

    let mut tombstone = file_info("ghost.txt", Vec::new());
    tombstone.deleted = true;
    apply(&store, vec![tombstone]);

    let count: i64 = Connection::open(&path)
        .unwrap()
        .query_row("SELECT count(*) FROM file", [], |row| row.get(0))
        .unwrap();
    assert_eq!(count, 0, "tombstones for unknown rows are skipped");
}
