#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tern_core::{Delta, DeltaKind, FeedMessage, ObjectKey, ResourceEventHandler, Snapshot};
use tern_store::{spawn_processor, DeltaProcessor};
use tokio_util::sync::CancellationToken;

fn snap(ns: &str, name: &str, rv: &str) -> Snapshot {
    Snapshot::new(ObjectKey::namespaced("v1/ConfigMap", ns, name), rv, serde_json::json!({}))
}

#[derive(Default)]
struct Counter {
    adds: AtomicUsize,
    deletes: AtomicUsize,
}

impl ResourceEventHandler for Counter {
    fn on_add(&self, _obj: &Arc<Snapshot>) { self.adds.fetch_add(1, Ordering::SeqCst); }
    fn on_update(&self, _old: &Arc<Snapshot>, _new: &Arc<Snapshot>) {}
    fn on_delete(&self, _last: &Arc<Snapshot>) { self.deletes.fetch_add(1, Ordering::SeqCst); }
    fn on_sync(&self, _obj: &Arc<Snapshot>) {}
}

async fn run_sequence(seq: &[FeedMessage]) -> Vec<(String, String, String)> {
    let stop = CancellationToken::new();
    let (tx, handle, task) = spawn_processor(DeltaProcessor::new("v1/ConfigMap"), 128, stop.clone());
    for m in seq.iter().cloned() {
        tx.send(m).await.unwrap();
    }
    drop(tx);
    task.await.unwrap();
    handle
        .cache()
        .list()
        .iter()
        .map(|s| {
            let k = s.key();
            (k.namespace.clone().unwrap_or_default(), k.name.clone(), s.resource_version().to_string())
        })
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn deterministic_across_runs() {
    let seq = vec![
        FeedMessage::Replace { items: vec![snap("ns1", "a", "1"), snap("ns2", "b", "1")], resource_version: "1".into() },
        FeedMessage::Delta(Delta::new(DeltaKind::Added, snap("ns3", "c", "2"))),
        FeedMessage::Delta(Delta::new(DeltaKind::Updated, snap("ns2", "b", "3"))),
        FeedMessage::Delta(Delta::new(DeltaKind::Updated, snap("ns2", "b", "3"))),
        FeedMessage::Resync,
        FeedMessage::Delta(Delta::new(DeltaKind::Deleted, snap("ns3", "c", "2"))),
        FeedMessage::Delta(Delta::new(DeltaKind::Added, snap("prod", "d", "4"))),
    ];

    let c1 = run_sequence(&seq).await;
    let c2 = run_sequence(&seq).await;
    assert_eq!(c1, c2, "cache contents must be deterministic across runs");
    assert_eq!(
        c1,
        vec![
            ("ns1".to_string(), "a".to_string(), "1".to_string()),
            ("ns2".to_string(), "b".to_string(), "3".to_string()),
            ("prod".to_string(), "d".to_string(), "4".to_string()),
        ]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn synced_after_first_listing_and_drains_on_stop() {
    let counter = Arc::new(Counter::default());
    let stop = CancellationToken::new();
    let (tx, handle, task) =
        spawn_processor(DeltaProcessor::new("v1/ConfigMap").with_handler(counter.clone()), 16, stop.clone());
    assert!(!handle.has_synced());

    tx.send(FeedMessage::Delta(Delta::new(DeltaKind::Added, snap("ns", "early", "1")))).await.unwrap();
    tx.send(FeedMessage::Replace { items: vec![snap("ns", "a", "2")], resource_version: "2".into() }).await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), handle.wait_synced()).await.expect("sync timed out");
    assert!(handle.has_synced());
    // "early" was applied before the listing and removed by it
    assert_eq!(counter.adds.load(Ordering::SeqCst), 2);
    assert_eq!(counter.deletes.load(Ordering::SeqCst), 1);
    assert_eq!(handle.cache().keys(), vec![ObjectKey::namespaced("v1/ConfigMap", "ns", "a")]);

    // Buffered but possibly not yet received when stop fires.
    for name in ["late-1", "late-2", "late-3"] {
        tx.send(FeedMessage::Delta(Delta::new(DeltaKind::Added, snap("ns", name, "3")))).await.unwrap();
    }
    stop.cancel();
    task.await.unwrap();
    assert_eq!(handle.cache().len(), 4);
    assert!(handle.cache().get_by_name(Some("ns"), "late-3").is_some());
    assert_eq!(counter.adds.load(Ordering::SeqCst), 5);
    // Sender stays open but the loop has exited.
    assert!(tx.send(FeedMessage::Resync).await.is_err());
}
