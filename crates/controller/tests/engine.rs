#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tern_controller::{Controller, QueueDispatcher, Reconciler, ResourceEvent};
use tern_core::{BackoffConfig, Delta, DeltaKind, EngineConfig, FeedMessage, ObjectKey, Snapshot};
use tern_kubehub::{MemoryStore, RemoteStore};
use tern_queue::WorkQueue;
use tern_store::DeltaProcessor;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const KIND: &str = "v1/ConfigMap";

fn key(name: &str) -> ObjectKey { ObjectKey::namespaced(KIND, "default", name) }

fn snap(name: &str, rv: &str) -> Snapshot { Snapshot::new(key(name), rv, json!({})) }

fn fast() -> BackoffConfig {
    BackoffConfig { initial: Duration::from_millis(5), max: Duration::from_millis(20), multiplier: 2.0, jitter: 0.0 }
}

async fn eventually(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(30);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Records every call; fails the first `fail_first` calls (panicking instead if `panics`).
#[derive(Default)]
struct Recorder {
    fail_first: usize,
    panics: bool,
    calls: Mutex<Vec<(ObjectKey, Option<String>, Instant, u32)>>,
    queue: OnceLock<WorkQueue<ObjectKey>>,
}

impl Recorder {
    fn failing(n: usize) -> Self { Self { fail_first: n, ..Self::default() } }

    fn calls(&self) -> Vec<(ObjectKey, Option<String>, Instant, u32)> { self.calls.lock().unwrap().clone() }

    fn calls_for(&self, name: &str) -> usize { self.calls().iter().filter(|c| c.0.name == name).count() }
}

#[async_trait]
impl Reconciler for Recorder {
    async fn reconcile(&self, key: &ObjectKey, current: Option<Arc<Snapshot>>) -> anyhow::Result<()> {
        let requeues = self.queue.get().map(|q| q.num_requeues(key)).unwrap_or(0);
        let n = {
            let mut calls = self.calls.lock().unwrap();
            calls.push((key.clone(), current.map(|s| s.resource_version().to_string()), Instant::now(), requeues));
            calls.len()
        };
        if n <= self.fail_first {
            if self.panics {
                panic!("reconciler blew up on call {n}");
            }
            anyhow::bail!("call {n} failed");
        }
        Ok(())
    }
}

fn config() -> EngineConfig {
    EngineConfig::default().with_workers(1).with_resync(None).with_watch_backoff(fast())
}

#[tokio::test]
async fn updates_with_same_version_enqueue_nothing() {
    let queue = WorkQueue::new("t", BackoffConfig::retry_default());
    let mut p = DeltaProcessor::new(KIND).with_handler(Arc::new(QueueDispatcher::new(queue.clone())));
    p.enqueue(FeedMessage::Replace { items: vec![snap("a", "1"), snap("b", "1")], resource_version: "1".into() });
    assert_eq!(queue.len(), 2);
    for _ in 0..2 {
        let k = queue.get().await.unwrap();
        queue.done(&k).unwrap();
    }

    p.enqueue(FeedMessage::Delta(Delta::new(DeltaKind::Updated, snap("a", "1"))));
    p.process_all();
    assert!(queue.is_empty());

    p.enqueue(FeedMessage::Delta(Delta::new(DeltaKind::Updated, snap("a", "2"))));
    p.process_all();
    assert_eq!(queue.len(), 1);
    assert_eq!(queue.get().await, Some(key("a")));
}

#[tokio::test(start_paused = true)]
async fn failures_back_off_and_success_forgets() {
    let store = Arc::new(MemoryStore::new());
    store.upsert(&key("a"), json!({"data": {"k": "v"}}));
    let rec = Arc::new(Recorder::failing(2));
    let stop = CancellationToken::new();
    let remote: Arc<dyn RemoteStore> = store.clone();
    let running = Controller::new(remote, config()).watch(KIND, rec.clone()).start(stop.clone());
    let _ = rec.queue.set(running.queue().clone());

    assert!(running.wait_for_cache_sync().await);
    eventually("third attempt", || rec.calls().len() == 3).await;
    let calls = rec.calls();
    let first_gap = calls[1].2 - calls[0].2;
    let second_gap = calls[2].2 - calls[1].2;
    assert!(first_gap >= Duration::from_secs(1) && first_gap < Duration::from_millis(1050), "{first_gap:?}");
    assert!(second_gap >= Duration::from_secs(2) && second_gap < Duration::from_millis(2050), "{second_gap:?}");
    // the failure count only resets once a pass succeeds
    assert_eq!(calls.iter().map(|c| c.3).collect::<Vec<_>>(), vec![0, 1, 2]);
    assert!(calls.iter().all(|c| c.1.as_deref() == Some("1")));
    let queue = running.queue().clone();
    eventually("forgotten", || queue.num_requeues(&key("a")) == 0 && queue.in_flight() == 0).await;

    stop.cancel();
    running.join().await.unwrap();
    assert!(queue.is_shutting_down());
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_are_reported_not_fatal() {
    let store = Arc::new(MemoryStore::new());
    store.upsert(&key("bad"), json!({}));
    let rec = Arc::new(Recorder::failing(usize::MAX));
    let stop = CancellationToken::new();
    let cfg = config().with_max_retries(Some(2)).with_queue_backoff(fast());
    let remote: Arc<dyn RemoteStore> = store.clone();
    let running = Controller::new(remote, cfg).watch(KIND, rec.clone()).start(stop.clone());
    let mut failures = running.subscribe_failures();

    let failure = tokio::time::timeout(Duration::from_secs(10), failures.recv()).await.unwrap().unwrap();
    assert_eq!(failure.key, key("bad"));
    assert_eq!(failure.attempts, 3);
    assert!(failure.error.contains("call 3 failed"), "{}", failure.error);
    assert_eq!(running.queue().num_requeues(&key("bad")), 0);

    // no further retries once given up
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(rec.calls_for("bad"), 3);

    // a later change starts over
    store.upsert(&key("bad"), json!({"v": 2}));
    eventually("fresh attempt", || rec.calls_for("bad") == 4).await;

    stop.cancel();
    running.join().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn panicking_reconciler_is_retried() {
    let store = Arc::new(MemoryStore::new());
    store.upsert(&key("a"), json!({}));
    let rec = Arc::new(Recorder { fail_first: 1, panics: true, ..Recorder::default() });
    let stop = CancellationToken::new();
    let remote: Arc<dyn RemoteStore> = store.clone();
    let running = Controller::new(remote, config()).watch(KIND, rec.clone()).start(stop.clone());

    eventually("retry after panic", || rec.calls().len() == 2).await;
    stop.cancel();
    running.join().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stale_watch_relists_and_reconciles_deletion() {
    let store = Arc::new(MemoryStore::new());
    store.upsert(&key("a"), json!({}));
    store.upsert(&key("b"), json!({}));
    let rec = Arc::new(Recorder::default());
    let stop = CancellationToken::new();
    let remote: Arc<dyn RemoteStore> = store.clone();
    let running = Controller::new(remote, config().with_workers(2)).watch(KIND, rec.clone()).start(stop.clone());
    let mut events = running.subscribe();

    assert!(running.wait_for_cache_sync().await);
    eventually("initial passes", || rec.calls_for("a") == 1 && rec.calls_for("b") == 1).await;
    eventually("watch open", || store.open_watches() == 1).await;

    store.delete_during_outage(&key("b"));

    let deleted = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(ResourceEvent::Deleted(s)) => break s,
                Ok(_) => continue,
                Err(e) => panic!("feed closed: {e}"),
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(deleted.key(), &key("b"));

    eventually("deletion reconciled", || rec.calls_for("b") == 2).await;
    let last_b = rec.calls().into_iter().filter(|c| c.0.name == "b").last().unwrap();
    assert_eq!(last_b.1, None);
    let cache = running.cache(KIND).unwrap();
    assert!(cache.get(&key("b")).is_none());
    assert!(cache.get(&key("a")).is_some());
    assert!(running.cache("v1/Secret").is_none());

    stop.cancel();
    tokio::time::timeout(Duration::from_secs(5), running.join()).await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_before_sync_still_joins() {
    let store = Arc::new(MemoryStore::new());
    store.fail_next_lists(u32::MAX);
    let rec = Arc::new(Recorder::default());
    let stop = CancellationToken::new();
    let remote: Arc<dyn RemoteStore> = store.clone();
    let running = Controller::new(remote, config()).watch(KIND, rec.clone()).start(stop.clone());
    eventually("list attempts", || store.list_calls() >= 2).await;
    assert!(!running.has_synced());

    stop.cancel();
    tokio::time::timeout(Duration::from_secs(5), running.join()).await.unwrap().unwrap();
    assert!(rec.calls().is_empty());
}
