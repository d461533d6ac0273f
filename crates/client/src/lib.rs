#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! The public face of the BEP client. A [`Client`] connects to exactly
//! one remote peer, ingests its folder indexes into the catalog, and
//! serves byte-range reads by combining hash-verified cached blocks with
//! on-demand block requests.
//!
//! # Examples
//!
//! ```ignore
//! use bex_client::{Client, ClientConfig};
//!
//! let config = ClientConfig::builder()
//!     .cert_path("cert.pem")
//!     .key_path("key.pem")
//!     .database_path("catalog.db")
//!     .cache_path("blocks")
//!     .build()
//!     .expect("complete configuration");
//!
//! let client = Client::new(config)?;
//! client.connect("tcp://server:22000", peer_id).await?;
//! let listing = client.list("/")?;
//! let bytes = client.read("/photos/album/a.jpg", 0, 65536).await?;
//! ```

mod cache;
mod config;
mod discovery;
mod scheduler;
mod session;
#[cfg(test)]
mod tests;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bex_catalog::{CatalogError, Store};
use bex_deviceid::DeviceIdError;
use bex_protocol::FrameError;
use bex_transport::{Endpoint, Identity, TransportError};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub use bex_catalog::{BlockRequest, CachedState, EntryType, ListEntry, SyncLevel};
pub use bex_deviceid::DeviceId;
pub use cache::BlockCache;
pub use config::{ClientConfig, ClientConfigBuilder};
pub use discovery::{Discovery, DiscoveryError};
pub use scheduler::{Priority, RequestError, RequestScheduler, SchedulerConfig};

/// Hard cap on a single read request.
pub const MAX_READ_LENGTH: i64 = 10 * 1024 * 1024;

/// Events emitted over the client's broadcast channel.
#[derive(Clone, Debug)]
pub enum Event {
    /// The cluster-config exchange completed.
    Connected,
    /// An index delta materially changed the catalog.
    Updated,
    /// The connection ended.
    Closed,
    /// The connection failed; the description is best-effort.
    Error(String),
}

/// Errors surfaced by the public API.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Connection establishment or transport failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Catalog failure.
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    /// Device-id parsing failure.
    #[error(transparent)]
    DeviceId(#[from] DeviceIdError),

    /// Frame codec failure.
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// A block request failed terminally.
    #[error(transparent)]
    Request(#[from] RequestError),

    /// Discovery lookup failure.
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    /// The requested read length exceeds [`MAX_READ_LENGTH`].
    #[error("read of {0} bytes exceeds the 10 MiB limit")]
    ReadTooLarge(i64),

    /// No connection is established.
    #[error("not connected to a peer")]
    NotConnected,

    /// `connect` was asked to resolve `dynamic` without a resolver.
    #[error("no discovery resolver configured for dynamic connect")]
    NoDiscovery,

    /// Every candidate endpoint failed.
    #[error("connect failed: {0}")]
    ConnectFailed(String),
}

pub(crate) fn client_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// A read-only BEP client bound to one peer.
pub struct Client {
    config: ClientConfig,
    identity: Identity,
    store: Arc<Store>,
    cache: BlockCache,
    scheduler: RequestScheduler,
    events: broadcast::Sender<Event>,
    connected: Arc<AtomicBool>,
    session: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Client {
    /// Creates a client: loads the certificate identity and opens the
    /// catalog and cache.
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let identity = Identity::load(&config.cert_path, &config.key_path)?;
        let store = Store::open(
            &config.database_path,
            identity.device_id(),
            &config.device_name,
        )?;
        let cache = BlockCache::new(&config.cache_path);
        let scheduler = RequestScheduler::new(SchedulerConfig {
            concurrent: config.concurrent_requests,
            timeout: config.request_timeout,
            retries: config.request_retries,
        });
        let (events, _) = broadcast::channel(64);

        Ok(Self {
            config,
            identity,
            store: Arc::new(store),
            cache,
            scheduler,
            events,
            connected: Arc::new(AtomicBool::new(false)),
            session: std::sync::Mutex::new(None),
        })
    }

    /// The local device id, derived from the certificate.
    #[must_use]
    pub fn device_id(&self) -> &DeviceId {
        self.identity.device_id()
    }

    /// Subscribes to lifecycle events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Connects to the peer and resolves once the cluster-config
    /// exchange completes.
    ///
    /// `url` is a `tcp://` or `relay://…?id=…` endpoint, or the literal
    /// `dynamic` to consult the configured discovery resolver. When
    /// several candidate addresses exist they are tried in order.
    pub async fn connect(&self, url: &str, peer: &str) -> Result<(), ClientError> {
        let peer_id = DeviceId::parse(peer)?;

        let candidates = if url == "dynamic" {
            let discovery = self
                .config
                .discovery
                .as_ref()
                .ok_or(ClientError::NoDiscovery)?;
            discovery.resolve(&peer_id).await?
        } else {
            vec![url.to_owned()]
        };
        if candidates.is_empty() {
            return Err(ClientError::ConnectFailed(
                "discovery returned no addresses".to_owned(),
            ));
        }

        let mut last_error = String::from("no endpoint attempted");
        for candidate in candidates {
            let endpoint = match Endpoint::parse(&candidate) {
                Ok(endpoint) => endpoint,
                Err(error) => {
                    warn!(%candidate, %error, "skipping unusable endpoint");
                    last_error = error.to_string();
                    continue;
                }
            };
            match bex_transport::dial(endpoint, &peer_id, &self.identity).await {
                Ok(connection) => {
                    let (ready_tx, ready_rx) = oneshot::channel();
                    let context = session::SessionContext {
                        store: Arc::clone(&self.store),
                        cache: self.cache.clone(),
                        scheduler: self.scheduler.clone(),
                        events: self.events.clone(),
                        connected: Arc::clone(&self.connected),
                        peer: peer_id,
                        device_name: self.config.device_name.clone(),
                        refill_batch: self.config.refill_batch,
                    };
                    let handle =
                        tokio::spawn(session::run_session(connection, context, ready_tx));
                    *self.session.lock().expect("session slot poisoned") = Some(handle);

                    return match ready_rx.await {
                        Ok(Ok(())) => Ok(()),
                        Ok(Err(message)) => Err(ClientError::ConnectFailed(message)),
                        Err(_) => Err(ClientError::ConnectFailed(
                            "session ended before the cluster exchange".to_owned(),
                        )),
                    };
                }
                Err(error) => {
                    warn!(%candidate, %error, "endpoint failed");
                    last_error = error.to_string();
                }
            }
        }
        Err(ClientError::ConnectFailed(last_error))
    }

    /// Disconnects, aborting the session task if one is running.
    pub fn disconnect(&self) {
        if let Some(handle) = self.session.lock().expect("session slot poisoned").take() {
            handle.abort();
        }
        self.connected.store(false, Ordering::SeqCst);
        self.scheduler.shutdown();
        let _ = self.events.send(Event::Closed);
    }

    /// Looks a single path up; `None` when absent or deleted.
    pub fn attributes(&self, path: &str) -> Result<Option<ListEntry>, ClientError> {
        Ok(self.store.attributes(path)?)
    }

    /// Lists a directory; the root lists one entry per known folder.
    pub fn list(&self, path: &str) -> Result<Vec<ListEntry>, ClientError> {
        Ok(self.store.list(path)?)
    }

    /// Sets the sync level for a directory subtree.
    pub fn set_sync(&self, path: &str, level: SyncLevel) -> Result<(), ClientError> {
        Ok(self.store.set_sync(path, level)?)
    }

    /// Cancels pending block requests for one file; their waiters fail
    /// with [`RequestError::Removed`].
    pub fn cancel(&self, path: &str) {
        let Some(rest) = path.strip_prefix('/') else {
            return;
        };
        if let Some((folder, name)) = rest.split_once('/') {
            self.scheduler.remove(folder, name);
        }
    }

    /// Reads up to `length` bytes of `path` starting at `position`.
    ///
    /// Cached blocks are served from disk after hash verification; a
    /// cached block that fails verification is marked stale and fetched
    /// remotely. Missing blocks are requested at user priority. The
    /// result preserves offset order and may be short at end of file.
    pub async fn read(
        &self,
        path: &str,
        position: i64,
        length: i64,
    ) -> Result<Vec<u8>, ClientError> {
        if length > MAX_READ_LENGTH {
            return Err(ClientError::ReadTooLarge(length));
        }
        if length <= 0 {
            return Ok(Vec::new());
        }

        let plan = self.store.blocks_for_read(path, position, length)?;
        debug!(path, position, length, blocks = plan.len(), "read planned");

        if plan.iter().any(|block| block.cached != CachedState::Present)
            && !self.connected.load(Ordering::SeqCst)
        {
            return Err(ClientError::NotConnected);
        }

        // Queue every remote fetch up front so they run concurrently;
        // assembly below still consumes blocks in offset order.
        let fetches: Vec<_> = plan
            .iter()
            .map(|block| {
                if block.cached == CachedState::Present {
                    None
                } else {
                    Some(self.scheduler.wait(block.clone(), Priority::User))
                }
            })
            .collect();

        let mut output = Vec::new();
        for (block, fetch) in plan.iter().zip(fetches) {
            let bytes = match fetch {
                Some(fetch) => fetch.await?,
                None => self.cached_or_refetched(block).await?,
            };
            let start =
                usize::try_from((position - block.offset).max(0)).unwrap_or_default();
            let end = usize::try_from(
                i64::from(block.size).min(position + length - block.offset),
            )
            .unwrap_or_default()
            .min(bytes.len());
            if start < end {
                output.extend_from_slice(&bytes[start..end]);
            }
        }
        Ok(output)
    }

    /// Serves a believed-cached block, downgrading and refetching when
    /// the on-disk copy fails verification.
    async fn cached_or_refetched(&self, block: &BlockRequest) -> Result<Vec<u8>, ClientError> {
        if let Some(bytes) = self
            .cache
            .read_block(
                &block.folder,
                block.file_id,
                block.offset,
                block.size as usize,
                &block.hash,
            )
            .await
        {
            return Ok(bytes);
        }

        warn!(
            name = %block.name,
            offset = block.offset,
            "cached block failed verification; refetching"
        );
        self.store
            .mark_block(block.file_id, block.offset, CachedState::Stale)?;
        if !self.connected.load(Ordering::SeqCst) {
            return Err(ClientError::NotConnected);
        }
        Ok(self.scheduler.wait(block.clone(), Priority::User).await?)
    }
}
