//! Read-path behaviour: cache hits, corruption refetch, and assembly.

use std::path::PathBuf;
use std::sync::atomic::Ordering;

use bex_catalog::CachedState;
use bex_protocol::shape_index;
use bex_protocol::wire::{
    BlockInfo, ClusterConfig, Device, FileInfo, FileInfoType, Folder, Index,
};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;

use crate::{Client, ClientConfig, ClientError, MAX_READ_LENGTH};

const PEER_ID: [u8; 32] = [2; 32];
const BLOCK: usize = 256;

fn identity_files(dir: &tempfile::TempDir) -> (PathBuf, PathBuf) {
    let rcgen::CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(vec!["bex-test".into()]).expect("generate");
    let cert_path = dir.path().join("cert.pem");
    let key_path = dir.path().join("key.pem");
    std::fs::write(&cert_path, cert.pem()).expect("write cert");
    std::fs::write(&key_path, key_pair.serialize_pem()).expect("write key");
    (cert_path, key_path)
}

fn client(dir: &tempfile::TempDir) -> Client {
    let (cert_path, key_path) = identity_files(dir);
    let config = ClientConfig::builder()
        .cert_path(cert_path)
        .key_path(key_path)
        .device_name("reader")
        .database_path(dir.path().join("catalog.db"))
        .cache_path(dir.path().join("blocks"))
        .build()
        .expect("complete config");
    Client::new(config).expect("client")
}

fn payload(fill: u8) -> Vec<u8> {
    vec![fill; BLOCK]
}

/// Seeds the catalog with one folder and `a/b.txt` made of `payloads`.
fn seed(client: &Client, payloads: &[Vec<u8>]) {
    client
        .store
        .update_cluster_config(&ClusterConfig {
            folders: vec![Folder {
                id: "docs".into(),
                label: "Documents".into(),
                devices: vec![
                    Device {
                        id: client.device_id().as_bytes().to_vec(),
                        ..Default::default()
                    },
                    Device {
                        id: PEER_ID.to_vec(),
                        name: "server".into(),
                        ..Default::default()
                    },
                ],
                ..Default::default()
            }],
        })
        .expect("cluster config");

    let blocks: Vec<BlockInfo> = payloads
        .iter()
        .enumerate()
        .map(|(index, payload)| BlockInfo {
            offset: (index * BLOCK) as i64,
            size: BLOCK as i32,
            hash: Sha256::digest(payload).to_vec(),
        })
        .collect();
    client
        .store
        .update_index(&shape_index(Index {
            folder: "docs".into(),
            files: vec![FileInfo {
                name: "a/b.txt".into(),
                r#type: FileInfoType::File as i32,
                size: (payloads.len() * BLOCK) as i64,
                block_size: BLOCK as i32,
                sequence: 1,
                blocks,
                ..Default::default()
            }],
        }))
        .expect("index");
}

fn file_id(client: &Client) -> i64 {
    client
        .store
        .blocks_for_read("/docs/a/b.txt", 0, 1)
        .expect("plan")[0]
        .file_id
}

/// Answers every dispatched request with the matching payload.
fn serve_blocks(client: &Client, payloads: Vec<Vec<u8>>) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    client.scheduler.attach(tx);
    let scheduler = client.scheduler.clone();
    tokio::spawn(async move {
        while let Some(request) = rx.recv().await {
            let index = (request.offset as usize) / BLOCK;
            scheduler.received(request.id, &payloads[index]);
        }
    });
}

#[tokio::test]
async fn cached_read_never_touches_the_network() {
    let dir = tempfile::tempdir().unwrap();
    let client = client(&dir);
    let p0 = payload(0x11);
    seed(&client, std::slice::from_ref(&p0));

    let id = file_id(&client);
    client.cache.write_block("docs", id, 0, &p0).await.unwrap();
    client
        .store
        .mark_block(id, 0, CachedState::Present)
        .unwrap();

    // Disconnected and no transmit channel: only the cache can satisfy
    // this read.
    let bytes = client.read("/docs/a/b.txt", 0, BLOCK as i64).await.unwrap();
    assert_eq!(bytes, p0);

    let middle = client.read("/docs/a/b.txt", 100, 50).await.unwrap();
    assert_eq!(middle, p0[100..150]);
}

#[tokio::test]
async fn corrupted_cache_is_marked_stale_and_refetched() {
    let dir = tempfile::tempdir().unwrap();
    let client = client(&dir);
    let p0 = payload(0x11);
    seed(&client, std::slice::from_ref(&p0));

    let id = file_id(&client);
    let mut corrupted = p0.clone();
    corrupted[0] ^= 0xFF;
    client
        .cache
        .write_block("docs", id, 0, &corrupted)
        .await
        .unwrap();
    client
        .store
        .mark_block(id, 0, CachedState::Present)
        .unwrap();

    client.connected.store(true, Ordering::SeqCst);
    serve_blocks(&client, vec![p0.clone()]);

    let bytes = client.read("/docs/a/b.txt", 0, BLOCK as i64).await.unwrap();
    assert_eq!(bytes, p0, "remote copy replaces the corrupt cache");

    let plan = client
        .store
        .blocks_for_read("/docs/a/b.txt", 0, BLOCK as i64)
        .unwrap();
    assert_eq!(plan[0].cached, CachedState::Stale, "corrupt copy was downgraded");
}

#[tokio::test]
async fn assembly_mixes_cached_and_fetched_blocks_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let client = client(&dir);
    let payloads = vec![payload(0x11), payload(0x22), payload(0x33)];
    seed(&client, &payloads);

    // Cache blocks 0 and 2; block 1 must come from the peer.
    let id = file_id(&client);
    for index in [0usize, 2] {
        client
            .cache
            .write_block("docs", id, (index * BLOCK) as i64, &payloads[index])
            .await
            .unwrap();
        client
            .store
            .mark_block(id, (index * BLOCK) as i64, CachedState::Present)
            .unwrap();
    }
    client.connected.store(true, Ordering::SeqCst);
    serve_blocks(&client, payloads.clone());

    let bytes = client
        .read("/docs/a/b.txt", 0, (3 * BLOCK) as i64)
        .await
        .unwrap();
    let expected: Vec<u8> = payloads.concat();
    assert_eq!(bytes, expected);

    // A window crossing all three blocks slices each correctly.
    let window = client.read("/docs/a/b.txt", 100, 400).await.unwrap();
    assert_eq!(window, expected[100..500]);
}

#[tokio::test]
async fn read_is_short_at_end_of_file() {
    let dir = tempfile::tempdir().unwrap();
    let client = client(&dir);
    let p0 = payload(0x11);
    seed(&client, std::slice::from_ref(&p0));

    let id = file_id(&client);
    client.cache.write_block("docs", id, 0, &p0).await.unwrap();
    client
        .store
        .mark_block(id, 0, CachedState::Present)
        .unwrap();

    let bytes = client.read("/docs/a/b.txt", 200, 10_000).await.unwrap();
    assert_eq!(bytes, p0[200..], "short read at end of file");
}

#[tokio::test]
async fn oversized_reads_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let client = client(&dir);
    assert!(matches!(
        client.read("/docs/a/b.txt", 0, MAX_READ_LENGTH + 1).await,
        Err(ClientError::ReadTooLarge(_))
    ));
}

#[tokio::test]
async fn unknown_path_reads_as_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let client = client(&dir);
    seed(&client, &[payload(0x11)]);
    assert!(matches!(
        client.read("/docs/missing.txt", 0, 16).await,
        Err(ClientError::Catalog(_))
    ));
}

#[tokio::test]
async fn remote_blocks_require_a_connection() {
    let dir = tempfile::tempdir().unwrap();
    let client = client(&dir);
    seed(&client, &[payload(0x11)]);
    assert!(matches!(
        client.read("/docs/a/b.txt", 0, BLOCK as i64).await,
        Err(ClientError::NotConnected)
    ));
}
