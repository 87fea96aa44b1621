//! In-process [`RemoteStore`] with a versioned event log.
//!
//! Every mutation bumps a global resource version and is appended to the log,
//! so watches can resume from any version that has not been compacted away.
//! Failure injection (failed lists/watches, dropped connections, changes lost
//! during an outage) makes it usable for exercising recovery paths.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tern_core::{ObjectKey, Snapshot, TransportError};
use tokio::sync::mpsc;
use tracing::debug;

use crate::{Listing, RemoteEvent, RemoteStore, WatchStream};

type EventTx = mpsc::UnboundedSender<Result<RemoteEvent, TransportError>>;

#[derive(Default)]
struct State {
    rv: u64,
    objects: BTreeMap<ObjectKey, Snapshot>,
    log: Vec<(u64, RemoteEvent)>,
    /// Watches starting before this version get `Gone`.
    compacted: u64,
    watchers: Vec<(String, EventTx)>,
    fail_lists: u32,
    fail_watches: u32,
    list_calls: u32,
    watch_calls: u32,
}

impl State {
    fn publish(&mut self, kind: &str, ev: RemoteEvent) {
        self.log.push((self.rv, ev.clone()));
        self.watchers.retain(|(k, tx)| k != kind || tx.send(Ok(ev.clone())).is_ok());
    }
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

fn kind_of(ev: &RemoteEvent) -> Option<&str> {
    match ev {
        RemoteEvent::Added(s) | RemoteEvent::Modified(s) | RemoteEvent::Deleted(s) => Some(s.key().kind.as_str()),
        RemoteEvent::Bookmark(_) => None,
    }
}

/// Write identity and version into the object's metadata.
fn stamp(key: &ObjectKey, rv: u64, mut body: Value) -> Snapshot {
    if !body.is_object() {
        body = json!({});
    }
    if let Some(obj) = body.as_object_mut() {
        let meta = obj.entry("metadata").or_insert_with(|| json!({}));
        if !meta.is_object() {
            *meta = json!({});
        }
        if let Some(m) = meta.as_object_mut() {
            m.insert("name".into(), Value::String(key.name.clone()));
            if let Some(ns) = &key.namespace {
                m.insert("namespace".into(), Value::String(ns.clone()));
            }
            m.insert("resourceVersion".into(), Value::String(rv.to_string()));
        }
    }
    Snapshot::new(key.clone(), rv.to_string(), body)
}

impl MemoryStore {
    pub fn new() -> Self { Self::default() }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create or replace an object; returns the stored snapshot.
    pub fn upsert(&self, key: &ObjectKey, body: Value) -> Snapshot {
        let mut st = self.state();
        st.rv += 1;
        let snap = stamp(key, st.rv, body);
        let ev = match st.objects.insert(key.clone(), snap.clone()) {
            Some(_) => RemoteEvent::Modified(snap.clone()),
            None => RemoteEvent::Added(snap.clone()),
        };
        st.publish(&key.kind, ev);
        snap
    }

    pub fn delete(&self, key: &ObjectKey) -> Option<Snapshot> {
        let mut st = self.state();
        let prev = st.objects.remove(key)?;
        st.rv += 1;
        let last = stamp(key, st.rv, prev.to_body());
        st.publish(&key.kind, RemoteEvent::Deleted(last.clone()));
        Some(last)
    }

    /// Remove an object while every watch is disconnected and history is lost:
    /// open streams end, and resuming from any earlier version yields `Gone`.
    pub fn delete_during_outage(&self, key: &ObjectKey) -> Option<Snapshot> {
        let mut st = self.state();
        st.watchers.clear();
        let prev = st.objects.remove(key);
        st.rv += 1;
        st.compacted = st.rv;
        st.log.clear();
        prev
    }

    /// End every open watch stream.
    pub fn disconnect_watchers(&self) {
        self.state().watchers.clear();
    }

    /// Drop history up to the current version.
    pub fn compact(&self) {
        let mut st = self.state();
        st.compacted = st.rv;
        st.log.clear();
    }

    /// Deliver an error on every open watch stream.
    pub fn inject_watch_error(&self, err: TransportError) {
        self.state().watchers.retain(|(_, tx)| tx.send(Err(err.clone())).is_ok());
    }

    /// Send a bookmark at the current version on every open watch of `kind`.
    pub fn bookmark(&self, kind: &str) {
        let mut st = self.state();
        let rv = st.rv.to_string();
        st.watchers.retain(|(k, tx)| k != kind || tx.send(Ok(RemoteEvent::Bookmark(rv.clone()))).is_ok());
    }

    pub fn fail_next_lists(&self, n: u32) { self.state().fail_lists = n; }
    pub fn fail_next_watches(&self, n: u32) { self.state().fail_watches = n; }

    pub fn list_calls(&self) -> u32 { self.state().list_calls }
    pub fn watch_calls(&self) -> u32 { self.state().watch_calls }
    pub fn open_watches(&self) -> usize { self.state().watchers.iter().filter(|(_, tx)| !tx.is_closed()).count() }
    pub fn resource_version(&self) -> String { self.state().rv.to_string() }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn list(&self, kind: &str) -> Result<Listing, TransportError> {
        let mut st = self.state();
        st.list_calls += 1;
        if st.fail_lists > 0 {
            st.fail_lists -= 1;
            return Err(TransportError::Transient("injected list failure".into()));
        }
        let items: Vec<Snapshot> = st.objects.values().filter(|s| s.key().kind == kind).cloned().collect();
        Ok(Listing { resource_version: st.rv.to_string(), items })
    }

    async fn watch(&self, kind: &str, from: &str) -> Result<WatchStream, TransportError> {
        let mut st = self.state();
        st.watch_calls += 1;
        if st.fail_watches > 0 {
            st.fail_watches -= 1;
            return Err(TransportError::Transient("injected watch failure".into()));
        }
        let from_rv: u64 = from.parse().map_err(|_| TransportError::Gone(from.to_string()))?;
        if from_rv < st.compacted {
            debug!(kind = %kind, from = %from, compacted = st.compacted, "watch from compacted version");
            return Err(TransportError::Gone(from.to_string()));
        }
        // History after `from` first, then live events; both under the same lock so nothing falls in between.
        let backlog: Vec<Result<RemoteEvent, TransportError>> = st
            .log
            .iter()
            .filter(|(rv, ev)| *rv > from_rv && kind_of(ev) == Some(kind))
            .map(|(_, ev)| Ok(ev.clone()))
            .collect();
        let (tx, rx) = mpsc::unbounded_channel();
        st.watchers.push((kind.to_string(), tx));
        let live = futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) });
        Ok(futures::stream::iter(backlog).chain(live).boxed())
    }
}
