//! Discovery resolver seam.
//!
//! Global discovery is an external collaborator: the client only needs
//! `device id → dialable addresses`. Implementations typically wrap the
//! discovery server's HTTPS lookup; tests substitute a fixed table.

use bex_deviceid::DeviceId;
use futures::future::BoxFuture;

/// Resolves a device id to candidate endpoint URLs.
pub trait Discovery: Send + Sync {
    /// Returns endpoint URLs (`tcp://` or `relay://`) to try in order.
    fn resolve<'a>(
        &'a self,
        device: &'a DeviceId,
    ) -> BoxFuture<'a, Result<Vec<String>, DiscoveryError>>;
}

/// Errors from a discovery lookup.
#[derive(Debug, thiserror::Error)]
#[error("discovery failed: {0}")]
pub struct DiscoveryError(pub String);
