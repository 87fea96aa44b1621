//! Tern kubehub: the remote store contract, its kube-rs and in-memory
//! implementations, and the lister-watcher that feeds a delta processor.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use futures::stream::BoxStream;
use tern_core::{Snapshot, TransportError};

pub mod kube_store;
pub mod memory;
pub mod reflector;

pub use kube_store::KubeStore;
pub use memory::MemoryStore;
pub use reflector::Reflector;

/// Result of a full listing.
#[derive(Debug, Clone)]
pub struct Listing {
    pub resource_version: String,
    pub items: Vec<Snapshot>,
}

/// One notification on a watch stream.
#[derive(Debug, Clone)]
pub enum RemoteEvent {
    Added(Snapshot),
    Modified(Snapshot),
    Deleted(Snapshot),
    /// Progress marker: no object changed, but the stream is current up to this version.
    Bookmark(String),
}

pub type WatchStream = BoxStream<'static, Result<RemoteEvent, TransportError>>;

/// Transport to the authoritative store. Handles are passed in explicitly and
/// may be shared by several lister-watchers.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn list(&self, kind: &str) -> Result<Listing, TransportError>;

    /// Open a change stream starting after `from`. `TransportError::Gone` means
    /// `from` is no longer available and the caller must relist.
    async fn watch(&self, kind: &str, from: &str) -> Result<WatchStream, TransportError>;
}
