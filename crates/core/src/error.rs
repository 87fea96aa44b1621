//! Error taxonomy shared across crates.

use thiserror::Error;

/// Failures reported by a remote store transport.
///
/// All variants are retryable from the engine's point of view; `Gone` additionally
/// means the watch cannot resume and a full relist is required.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("resource version {0} is too old; relist required")]
    Gone(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("transport: {0}")]
    Transient(String),
}

impl TransportError {
    pub fn is_gone(&self) -> bool { matches!(self, TransportError::Gone(_)) }
}

/// Caller bugs detected by the work queue.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue is shut down")]
    ShutDown,
    #[error("done() called for {0} which is not in flight")]
    NotInFlight(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SnapshotError {
    #[error("object has no metadata")]
    MissingMetadata,
    #[error("object has no metadata.name")]
    MissingName,
}
