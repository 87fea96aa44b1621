//! Broadcast of cache changes for read-only observers.
//!
//! Receivers that fall behind lose the oldest events (`RecvError::Lagged`);
//! the feed never slows down the delta processor.

use std::sync::Arc;

use tern_core::{ObjectKey, ResourceEventHandler, Snapshot};
use tokio::sync::broadcast;
use tracing::trace;

#[derive(Debug, Clone)]
pub enum ResourceEvent {
    Added(Arc<Snapshot>),
    Updated { old: Arc<Snapshot>, new: Arc<Snapshot> },
    Deleted(Arc<Snapshot>),
}

impl ResourceEvent {
    pub fn key(&self) -> &ObjectKey {
        match self {
            ResourceEvent::Added(s) | ResourceEvent::Deleted(s) => s.key(),
            ResourceEvent::Updated { new, .. } => new.key(),
        }
    }
}

#[derive(Clone)]
pub struct EventFeed {
    tx: broadcast::Sender<ResourceEvent>,
}

impl EventFeed {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ResourceEvent> { self.tx.subscribe() }

    fn publish(&self, ev: ResourceEvent) {
        // No subscribers is fine.
        if self.tx.send(ev).is_err() {
            trace!("event feed has no subscribers");
        }
    }
}

impl ResourceEventHandler for EventFeed {
    fn on_add(&self, obj: &Arc<Snapshot>) { self.publish(ResourceEvent::Added(Arc::clone(obj))); }

    fn on_update(&self, old: &Arc<Snapshot>, new: &Arc<Snapshot>) {
        if old.resource_version() != new.resource_version() {
            self.publish(ResourceEvent::Updated { old: Arc::clone(old), new: Arc::clone(new) });
        }
    }

    fn on_delete(&self, last_known: &Arc<Snapshot>) { self.publish(ResourceEvent::Deleted(Arc::clone(last_known))); }

    fn on_sync(&self, _obj: &Arc<Snapshot>) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn snap(rv: &str) -> Arc<Snapshot> {
        Arc::new(Snapshot::new(ObjectKey::cluster("v1/Node", "n1"), rv, Value::Null))
    }

    #[test]
    fn publishes_changes_only() {
        let feed = EventFeed::new(8);
        let mut rx = feed.subscribe();
        feed.on_add(&snap("1"));
        feed.on_update(&snap("1"), &snap("1"));
        feed.on_sync(&snap("1"));
        feed.on_update(&snap("1"), &snap("2"));
        feed.on_delete(&snap("2"));

        assert!(matches!(rx.try_recv().unwrap(), ResourceEvent::Added(_)));
        match rx.try_recv().unwrap() {
            ResourceEvent::Updated { old, new } => {
                assert_eq!((old.resource_version(), new.resource_version()), ("1", "2"));
            }
            other => panic!("unexpected {other:?}"),
        }
        let last = rx.try_recv().unwrap();
        assert!(matches!(last, ResourceEvent::Deleted(_)));
        assert_eq!(last.key().name, "n1");
        assert!(rx.try_recv().is_err());
    }
}
