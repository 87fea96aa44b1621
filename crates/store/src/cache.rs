//! Keyed cache of the last observed snapshot per object.
//!
//! [`CacheWriter`] is the only mutation path and is owned by the delta processor of
//! its kind; any number of [`Cache`] read handles can be cloned from it. Each
//! mutation takes the write lock once, so readers see either the state before or
//! after a delta (or a whole relist), never a mix.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use rustc_hash::FxHashMap;
use tern_core::{Delta, DeltaKind, ObjectKey, Snapshot};

type Items = FxHashMap<ObjectKey, Arc<Snapshot>>;

/// Read handle to a cache. Cheap to clone; reads never touch the network.
#[derive(Clone)]
pub struct Cache {
    kind: Arc<str>,
    items: Arc<RwLock<Items>>,
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache").field("kind", &self.kind).field("len", &self.len()).finish()
    }
}

impl Cache {
    fn read(&self) -> RwLockReadGuard<'_, Items> {
        self.items.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn kind(&self) -> &str { &self.kind }

    pub fn get(&self, key: &ObjectKey) -> Option<Arc<Snapshot>> {
        self.read().get(key).cloned()
    }

    /// Lookup by namespace and name within this cache's kind.
    pub fn get_by_name(&self, namespace: Option<&str>, name: &str) -> Option<Arc<Snapshot>> {
        self.get(&ObjectKey::new(self.kind.as_ref(), namespace, name))
    }

    /// All cached snapshots, ordered by key.
    pub fn list(&self) -> Vec<Arc<Snapshot>> {
        self.list_where(|_| true)
    }

    /// Cached snapshots matching `pred`, ordered by key.
    pub fn list_where(&self, pred: impl Fn(&Snapshot) -> bool) -> Vec<Arc<Snapshot>> {
        let mut out: Vec<Arc<Snapshot>> = self.read().values().filter(|s| pred(s)).cloned().collect();
        out.sort_by(|a, b| a.key().cmp(b.key()));
        out
    }

    pub fn by_namespace(&self, namespace: &str) -> Vec<Arc<Snapshot>> {
        self.list_where(|s| s.key().namespace.as_deref() == Some(namespace))
    }

    pub fn keys(&self) -> Vec<ObjectKey> {
        let mut keys: Vec<ObjectKey> = self.read().keys().cloned().collect();
        keys.sort_unstable();
        keys
    }

    pub fn len(&self) -> usize { self.read().len() }
    pub fn is_empty(&self) -> bool { self.read().is_empty() }
}

/// Result of [`CacheWriter::replace`], ordered by key within each group.
#[derive(Debug, Default)]
pub struct ReplaceOutcome {
    pub added: Vec<Arc<Snapshot>>,
    /// `(previous, listed)` pairs for keys present before and after.
    pub updated: Vec<(Arc<Snapshot>, Arc<Snapshot>)>,
    /// Entries that were cached but are missing from the listing.
    pub removed: Vec<Arc<Snapshot>>,
}

/// Sole writer of a cache. Not `Clone`.
pub struct CacheWriter {
    cache: Cache,
}

impl CacheWriter {
    pub fn new(kind: impl Into<String>) -> Self {
        let kind: String = kind.into();
        Self { cache: Cache { kind: Arc::from(kind), items: Arc::new(RwLock::new(Items::default())) } }
    }

    pub fn reader(&self) -> Cache { self.cache.clone() }

    fn write(&self) -> RwLockWriteGuard<'_, Items> {
        self.cache.items.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply one delta and return the entry it replaced or removed.
    pub fn apply(&mut self, delta: &Delta) -> Option<Arc<Snapshot>> {
        let mut items = self.write();
        let previous = match delta.kind {
            DeltaKind::Added | DeltaKind::Updated | DeltaKind::Sync => {
                items.insert(delta.key().clone(), Arc::clone(&delta.object))
            }
            DeltaKind::Deleted => items.remove(delta.key()),
        };
        let len = items.len();
        drop(items);
        metrics::gauge!("cache_objects", len as f64, "kind" => self.cache.kind.to_string());
        previous
    }

    /// Swap the whole content for `items` (last one wins on duplicate keys).
    pub fn replace(&mut self, items: impl IntoIterator<Item = Arc<Snapshot>>) -> ReplaceOutcome {
        let mut next = Items::default();
        for s in items {
            next.insert(s.key().clone(), s);
        }
        let mut outcome = ReplaceOutcome::default();
        let mut guard = self.write();
        for (key, listed) in next.iter() {
            match guard.get(key) {
                Some(prev) => outcome.updated.push((Arc::clone(prev), Arc::clone(listed))),
                None => outcome.added.push(Arc::clone(listed)),
            }
        }
        outcome.removed = guard.iter().filter(|(k, _)| !next.contains_key(*k)).map(|(_, v)| Arc::clone(v)).collect();
        let len = next.len();
        *guard = next;
        drop(guard);
        outcome.added.sort_by(|a, b| a.key().cmp(b.key()));
        outcome.updated.sort_by(|a, b| a.1.key().cmp(b.1.key()));
        outcome.removed.sort_by(|a, b| a.key().cmp(b.key()));
        metrics::gauge!("cache_objects", len as f64, "kind" => self.cache.kind.to_string());
        outcome
    }
}
