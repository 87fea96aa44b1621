//! Per-key merging delta queue.
//!
//! Keys are served in first-arrival order. Each key holds an ordered run of
//! deltas; pushes merge into the tail of that run where a newer delta makes an
//! older one redundant, but never reorder it.

use std::collections::VecDeque;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tern_core::{Delta, DeltaKind, ObjectKey, Snapshot};

#[derive(Default)]
pub struct DeltaFifo {
    items: FxHashMap<ObjectKey, VecDeque<Delta>>,
    order: VecDeque<ObjectKey>,
}

impl DeltaFifo {
    pub fn new() -> Self { Self::default() }

    /// Number of keys with pending deltas.
    pub fn len(&self) -> usize { self.items.len() }
    pub fn is_empty(&self) -> bool { self.items.is_empty() }

    pub fn has_pending(&self, key: &ObjectKey) -> bool { self.items.contains_key(key) }

    /// Snapshot carried by the newest pending delta for `key`.
    pub fn latest(&self, key: &ObjectKey) -> Option<&Arc<Snapshot>> {
        self.items.get(key).and_then(|q| q.back()).map(|d| &d.object)
    }

    pub fn pending_keys(&self) -> impl Iterator<Item = &ObjectKey> { self.order.iter() }

    /// Queue a delta. Returns `false` when it was dropped as redundant.
    ///
    /// `Sync` deltas are only accepted for keys with nothing pending, so a replay
    /// of cached state can never overtake a real change that has not been applied yet.
    pub fn push(&mut self, d: Delta) -> bool {
        match self.items.get_mut(d.key()) {
            None => {
                let key = d.key().clone();
                self.order.push_back(key.clone());
                self.items.insert(key, VecDeque::from([d]));
                true
            }
            Some(_) if d.kind == DeltaKind::Sync => false,
            Some(run) => merge(run, d),
        }
    }

    /// Remove and return the whole pending run of the oldest key.
    pub fn pop(&mut self) -> Option<Vec<Delta>> {
        while let Some(key) = self.order.pop_front() {
            if let Some(run) = self.items.remove(&key) {
                return Some(run.into());
            }
        }
        None
    }

    /// Remove everything, preserving key order and per-key order.
    pub fn drain(&mut self) -> Vec<Delta> {
        let mut out = Vec::new();
        while let Some(run) = self.pop() {
            out.extend(run);
        }
        out
    }
}

fn merge(run: &mut VecDeque<Delta>, d: Delta) -> bool {
    let Some(last) = run.back_mut() else {
        run.push_back(d);
        return true;
    };
    match (last.kind, d.kind) {
        // Replay of the version that was just deleted.
        (DeltaKind::Deleted, DeltaKind::Updated) if last.object.resource_version() == d.object.resource_version() => {
            return false;
        }
        (DeltaKind::Deleted, DeltaKind::Deleted) | (DeltaKind::Updated, DeltaKind::Updated) => *last = d,
        (DeltaKind::Added, DeltaKind::Updated) => last.object = d.object,
        (_, DeltaKind::Deleted) => {
            while matches!(run.back().map(|l| l.kind), Some(DeltaKind::Updated | DeltaKind::Sync)) {
                run.pop_back();
            }
            run.push_back(d);
        }
        _ => run.push_back(d),
    }
    true
}
