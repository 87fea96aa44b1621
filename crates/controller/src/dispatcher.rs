//! Handler that reduces notifications to keys on the work queue.

use std::sync::Arc;

use tern_core::{ObjectKey, ResourceEventHandler, Snapshot};
use tern_queue::WorkQueue;
use tracing::{error, trace};

pub struct QueueDispatcher {
    queue: WorkQueue<ObjectKey>,
}

impl QueueDispatcher {
    pub fn new(queue: WorkQueue<ObjectKey>) -> Self { Self { queue } }

    fn enqueue(&self, key: &ObjectKey, cause: &'static str) {
        trace!(key = %key, cause, "enqueue");
        if let Err(e) = self.queue.add(key.clone()) {
            // Processors stop before the queue does, so this is a wiring bug.
            error!(key = %key, cause, error = %e, "enqueue rejected");
        }
    }
}

impl ResourceEventHandler for QueueDispatcher {
    fn on_add(&self, obj: &Arc<Snapshot>) { self.enqueue(obj.key(), "add"); }

    fn on_update(&self, old: &Arc<Snapshot>, new: &Arc<Snapshot>) {
        if old.resource_version() == new.resource_version() {
            metrics::counter!("dispatcher_suppressed_total", 1u64, "kind" => new.key().kind.clone());
            trace!(key = %new.key(), rv = %new.resource_version(), "unchanged version; not enqueued");
            return;
        }
        self.enqueue(new.key(), "update");
    }

    fn on_delete(&self, last_known: &Arc<Snapshot>) { self.enqueue(last_known.key(), "delete"); }

    fn on_sync(&self, obj: &Arc<Snapshot>) { self.enqueue(obj.key(), "sync"); }
}
