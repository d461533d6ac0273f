#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! The catalog is the client's durable model of the remote cluster:
//! folders, devices, directories, files and content blocks, persisted in
//! an embedded SQLite database. Index messages are applied as atomic
//! deltas with per-folder sequence tracking, and the read planner maps a
//! `(path, offset, length)` read onto the ordered set of blocks that
//! satisfy it.
//!
//! # Design
//!
//! All multi-write operations run on a dedicated writer connection inside
//! exclusive transactions and roll back on any error; intermediate index
//! states are never observable. Reads draw plain connections from a
//! bounded [`pool::Pool`]. Entities reference each other by row id only
//! and deletion cascades folder → directory → file → block.

mod indexing;
mod model;
mod pool;
mod query;
mod schema;
mod store;

pub use model::{
    BlockRequest, CachedState, EntryType, ListEntry, StaleBlock, SyncLevel,
};
pub use pool::{Pool, PooledConnection};
pub use store::Store;

/// Errors surfaced by catalog operations.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    /// Underlying database failure.
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// All pooled connections are checked out and the cap was reached.
    #[error("connection pool exhausted")]
    PoolExhausted,

    /// The path names a folder the catalog does not know.
    #[error("unknown folder '{0}'")]
    UnknownFolder(String),

    /// A folder has no device row for the connected peer.
    #[error("folder '{0}' has no configured peer device")]
    MissingPeerDevice(String),

    /// The path does not resolve to a stored entry.
    #[error("path not found: {0}")]
    NotFound(String),

    /// The path is not absolute or otherwise unusable.
    #[error("invalid path: {0}")]
    InvalidPath(String),
}
