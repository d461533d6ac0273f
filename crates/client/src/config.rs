//! Client configuration.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::discovery::Discovery;

/// Default cap on in-flight block requests.
pub const DEFAULT_CONCURRENT_REQUESTS: usize = 5;

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// Default retry budget per block request.
pub const DEFAULT_REQUEST_RETRIES: u32 = 2;

/// Default bound on background refill requests enqueued per update.
pub const DEFAULT_REFILL_BATCH: usize = 64;

/// Configuration for a [`Client`](crate::Client).
///
/// Build one with [`ClientConfig::builder`]; only the certificate pair
/// and the storage locations are mandatory.
#[derive(Clone)]
pub struct ClientConfig {
    /// PEM certificate path.
    pub cert_path: PathBuf,
    /// PEM private-key path.
    pub key_path: PathBuf,
    /// Device name advertised in the hello and cluster config.
    pub device_name: String,
    /// Catalog database path.
    pub database_path: PathBuf,
    /// Block cache root directory.
    pub cache_path: PathBuf,
    /// In-flight request cap.
    pub concurrent_requests: usize,
    /// Per-request timeout.
    pub request_timeout: Duration,
    /// Retries per request before it fails.
    pub request_retries: u32,
    /// Background refill requests enqueued per material update.
    pub refill_batch: usize,
    /// Resolver used when connecting to the literal `dynamic`.
    pub discovery: Option<Arc<dyn Discovery>>,
}

impl ClientConfig {
    /// Starts a builder.
    #[must_use]
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }
}

/// Builder for [`ClientConfig`].
#[derive(Default)]
pub struct ClientConfigBuilder {
    cert_path: Option<PathBuf>,
    key_path: Option<PathBuf>,
    device_name: Option<String>,
    database_path: Option<PathBuf>,
    cache_path: Option<PathBuf>,
    concurrent_requests: Option<usize>,
    request_timeout: Option<Duration>,
    request_retries: Option<u32>,
    refill_batch: Option<usize>,
    discovery: Option<Arc<dyn Discovery>>,
}

impl ClientConfigBuilder {
    /// Sets the PEM certificate path.
    #[must_use]
    pub fn cert_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.cert_path = Some(path.into());
        self
    }

    /// Sets the PEM private-key path.
    #[must_use]
    pub fn key_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.key_path = Some(path.into());
        self
    }

    /// Sets the advertised device name.
    #[must_use]
    pub fn device_name(mut self, name: impl Into<String>) -> Self {
        self.device_name = Some(name.into());
        self
    }

    /// Sets the catalog database path.
    #[must_use]
    pub fn database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.database_path = Some(path.into());
        self
    }

    /// Sets the block cache root.
    #[must_use]
    pub fn cache_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.cache_path = Some(path.into());
        self
    }

    /// Overrides the in-flight request cap.
    #[must_use]
    pub fn concurrent_requests(mut self, count: usize) -> Self {
        self.concurrent_requests = Some(count);
        self
    }

    /// Overrides the per-request timeout.
    #[must_use]
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Overrides the retry budget.
    #[must_use]
    pub fn request_retries(mut self, retries: u32) -> Self {
        self.request_retries = Some(retries);
        self
    }

    /// Overrides the refill batch bound.
    #[must_use]
    pub fn refill_batch(mut self, batch: usize) -> Self {
        self.refill_batch = Some(batch);
        self
    }

    /// Installs a discovery resolver for `dynamic` connects.
    #[must_use]
    pub fn discovery(mut self, discovery: Arc<dyn Discovery>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    /// Finishes the configuration.
    ///
    /// Returns `None` when a mandatory field (certificate, key, database
    /// or cache path) is missing.
    #[must_use]
    pub fn build(self) -> Option<ClientConfig> {
        Some(ClientConfig {
            cert_path: self.cert_path?,
            key_path: self.key_path?,
            device_name: self.device_name.unwrap_or_else(|| "bex".to_owned()),
            database_path: self.database_path?,
            cache_path: self.cache_path?,
            concurrent_requests: self
                .concurrent_requests
                .unwrap_or(DEFAULT_CONCURRENT_REQUESTS),
            request_timeout: self.request_timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT),
            request_retries: self.request_retries.unwrap_or(DEFAULT_REQUEST_RETRIES),
            refill_batch: self.refill_batch.unwrap_or(DEFAULT_REFILL_BATCH),
            discovery: self.discovery,
        })
    }
}
