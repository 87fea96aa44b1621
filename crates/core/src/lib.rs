//! Tern core types: identities, snapshots, deltas and the handler contract.

#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub mod config;
pub mod error;

pub use config::{BackoffConfig, EngineConfig};
pub use error::{QueueError, SnapshotError, TransportError};

/// Identity of a remote object: `(kind, namespace, name)`.
///
/// `kind` is a group/version/kind key such as `v1/Pod` or `apps/v1/Deployment`.
/// Cluster-scoped objects carry no namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(kind: impl Into<String>, namespace: Option<&str>, name: impl Into<String>) -> Self {
        Self { kind: kind.into(), namespace: namespace.map(|s| s.to_string()), name: name.into() }
    }

    pub fn namespaced(kind: impl Into<String>, namespace: &str, name: impl Into<String>) -> Self {
        Self::new(kind, Some(namespace), name)
    }

    pub fn cluster(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(kind, None, name)
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}:{}/{}", self.kind, ns, self.name),
            None => write!(f, "{}:{}", self.kind, self.name),
        }
    }
}

/// Last observed state of one object.
///
/// Snapshots are shared as `Arc<Snapshot>` and never mutated after intake.
/// Callers that need a modified copy take one with [`Snapshot::to_body`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    key: ObjectKey,
    resource_version: String,
    body: serde_json::Value,
}

impl Snapshot {
    pub fn new(key: ObjectKey, resource_version: impl Into<String>, body: serde_json::Value) -> Self {
        Self { key, resource_version: resource_version.into(), body }
    }

    /// Build a snapshot from a raw object, reading identity and version from `metadata`.
    pub fn from_value(kind: &str, mut raw: serde_json::Value) -> Result<Self, SnapshotError> {
        let meta = raw.get("metadata").and_then(|m| m.as_object()).ok_or(SnapshotError::MissingMetadata)?;
        let name = meta
            .get("name")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or(SnapshotError::MissingName)?
            .to_string();
        let namespace = meta.get("namespace").and_then(|v| v.as_str()).filter(|s| !s.is_empty()).map(|s| s.to_string());
        let resource_version = meta.get("resourceVersion").and_then(|v| v.as_str()).unwrap_or("").to_string();
        strip_managed_fields(&mut raw);
        Ok(Self { key: ObjectKey { kind: kind.to_string(), namespace, name }, resource_version, body: raw })
    }

    pub fn key(&self) -> &ObjectKey { &self.key }
    pub fn resource_version(&self) -> &str { &self.resource_version }
    pub fn body(&self) -> &serde_json::Value { &self.body }

    /// Deep copy of the body for callers that intend to modify it.
    pub fn to_body(&self) -> serde_json::Value { self.body.clone() }

    /// Raw `metadata.creationTimestamp` (RFC 3339), if present.
    pub fn creation_timestamp(&self) -> Option<&str> {
        self.body.get("metadata").and_then(|m| m.get("creationTimestamp")).and_then(|v| v.as_str())
    }

    pub fn labels(&self) -> Vec<(&str, &str)> {
        self.body
            .get("metadata")
            .and_then(|m| m.get("labels"))
            .and_then(|l| l.as_object())
            .map(|l| l.iter().filter_map(|(k, v)| v.as_str().map(|v| (k.as_str(), v))).collect())
            .unwrap_or_default()
    }
}

#[cfg(feature = "strip-managed-fields")]
fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("managedFields");
    }
}

#[cfg(not(feature = "strip-managed-fields"))]
fn strip_managed_fields(_v: &mut serde_json::Value) {}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeltaKind {
    Added,
    Updated,
    Deleted,
    /// Periodic replay of an unchanged cached object.
    Sync,
}

#[derive(Debug, Clone)]
pub struct Delta {
    pub kind: DeltaKind,
    pub object: Arc<Snapshot>,
}

impl Delta {
    pub fn new(kind: DeltaKind, object: impl Into<Arc<Snapshot>>) -> Self {
        Self { kind, object: object.into() }
    }

    pub fn key(&self) -> &ObjectKey { self.object.key() }
}

/// Message from a lister-watcher to the delta processor of its kind.
#[derive(Debug, Clone)]
pub enum FeedMessage {
    /// One change observed on the watch stream.
    Delta(Delta),
    /// Complete listing; replaces the cache contents.
    Replace { items: Vec<Snapshot>, resource_version: String },
    /// Periodic resync tick.
    Resync,
}

/// Callbacks invoked by the delta processor after each applied delta.
///
/// Implementations must return quickly; they run on the single writer path of a cache.
pub trait ResourceEventHandler: Send + Sync {
    fn on_add(&self, obj: &Arc<Snapshot>);
    fn on_update(&self, old: &Arc<Snapshot>, new: &Arc<Snapshot>);
    /// `last_known` is the final state seen before removal.
    fn on_delete(&self, last_known: &Arc<Snapshot>);
    fn on_sync(&self, obj: &Arc<Snapshot>);
}

pub mod prelude {
    pub use super::{
        BackoffConfig, Delta, DeltaKind, EngineConfig, FeedMessage, ObjectKey, QueueError, ResourceEventHandler,
        Snapshot, SnapshotError, TransportError,
    };
}
