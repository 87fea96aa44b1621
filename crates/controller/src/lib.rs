//! Tern controller: turns cache notifications into queued keys and drives
//! reconcilers over them.
//!
//! ```ignore
//! let running = Controller::new(remote, EngineConfig::from_env())
//!     .watch("v1/Pod", Arc::new(MyReconciler))
//!     .start(stop.clone());
//! running.wait_for_cache_sync().await;
//! running.join().await?;
//! ```

#![forbid(unsafe_code)]

use std::sync::Arc;

use async_trait::async_trait;
use tern_core::{ObjectKey, Snapshot};

pub mod controller;
pub mod dispatcher;
pub mod feed;
pub mod worker;

pub use controller::{Controller, RunningController};
pub use dispatcher::QueueDispatcher;
pub use feed::{EventFeed, ResourceEvent};
pub use worker::TerminalFailure;

/// Business logic for one kind.
///
/// Called with the key and the object as currently cached, or `None` if it no
/// longer exists. Must be idempotent: the same key may be reconciled again at
/// any time (resync, retries, coalesced changes).
#[async_trait]
pub trait Reconciler: Send + Sync {
    async fn reconcile(&self, key: &ObjectKey, current: Option<Arc<Snapshot>>) -> anyhow::Result<()>;
}
