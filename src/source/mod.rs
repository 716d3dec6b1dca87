//! Credential source collaborator
//!
//! The engine never speaks the source's wire protocol itself; it goes through
//! [`CredentialSource`] clients obtained from a [`ClientProvider`].

pub mod cache;
pub mod cache_key;

pub use cache::{CachingClientProvider, ClientCache, ClientFactory};
pub use cache_key::ClientCacheKey;

use crate::error::CredsyncResult;
use crate::task::{LeaseStatus, SyncTask};
use async_trait::async_trait;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// Raw event messages from the source's subscription endpoint.
///
/// The stream ending means the connection was closed.
pub type EventStream = Pin<Box<dyn Stream<Item = CredsyncResult<Vec<u8>>> + Send>>;

/// Response to a read, write or renewal
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SecretResponse {
    #[serde(default)]
    pub request_id: String,
    #[serde(default)]
    pub lease_id: String,
    /// Lease duration in seconds
    #[serde(default)]
    pub lease_duration: u64,
    #[serde(default)]
    pub renewable: bool,
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl SecretResponse {
    pub fn lease_status(&self) -> LeaseStatus {
        LeaseStatus {
            id: self.lease_id.clone(),
            duration: self.lease_duration,
            renewable: self.renewable,
            request_id: self.request_id.clone(),
        }
    }
}

/// A client for one authenticated identity on the credential source
#[async_trait]
pub trait CredentialSource: Send + Sync {
    /// Key this client is cached under
    fn cache_key(&self) -> &ClientCacheKey;

    async fn read(&self, path: &str) -> CredsyncResult<SecretResponse>;

    async fn write(&self, path: &str, params: &Map<String, Value>)
        -> CredsyncResult<SecretResponse>;

    /// Renew a lease.
    ///
    /// The granted duration may be shorter than `increment`.
    async fn renew(&self, lease_id: &str, increment: Duration) -> CredsyncResult<SecretResponse>;

    async fn revoke(&self, lease_id: &str) -> CredsyncResult<()>;

    /// Open the event subscription stream
    async fn subscribe(&self, event_types: &str) -> CredsyncResult<EventStream>;
}

/// Hands out credential source clients for tasks
#[async_trait]
pub trait ClientProvider: Send + Sync {
    async fn client(&self, task: &SyncTask) -> CredsyncResult<Arc<dyn CredentialSource>>;

    /// Mark a client as suspect after a forbidden response
    fn taint(&self, key: &ClientCacheKey);
}
