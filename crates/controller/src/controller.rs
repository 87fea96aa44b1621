//! Engine wiring: one reflector, processor and cache per watched kind, one
//! shared work queue and worker pool.
//!
//! Stopping is driven by the token passed to [`Controller::start`]. Reflectors
//! and processors see it first; processors drain what they already received
//! (still enqueueing keys), then the queue is shut down so workers finish the
//! remaining keys and exit.

use std::sync::Arc;

use anyhow::{Context, Result};
use rustc_hash::FxHashMap;
use tern_core::{EngineConfig, ObjectKey};
use tern_kubehub::{Reflector, RemoteStore};
use tern_queue::WorkQueue;
use tern_store::{spawn_processor, Cache, DeltaProcessor, ProcessorHandle};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::dispatcher::QueueDispatcher;
use crate::feed::{EventFeed, ResourceEvent};
use crate::worker::{run_worker, KindEntry, TerminalFailure, WorkerContext};
use crate::Reconciler;

const FAILURE_CHANNEL_CAP: usize = 256;

pub struct Controller {
    remote: Arc<dyn RemoteStore>,
    config: EngineConfig,
    kinds: Vec<(String, Arc<dyn Reconciler>)>,
}

impl Controller {
    pub fn new(remote: Arc<dyn RemoteStore>, config: EngineConfig) -> Self {
        Self { remote, config, kinds: Vec::new() }
    }

    /// Watch `kind` and reconcile its keys with `reconciler`. Registering a kind
    /// twice keeps the last reconciler.
    pub fn watch(mut self, kind: impl Into<String>, reconciler: Arc<dyn Reconciler>) -> Self {
        let kind = kind.into();
        self.kinds.retain(|(k, _)| *k != kind);
        self.kinds.push((kind, reconciler));
        self
    }

    /// Spawn every task. Must be called inside a Tokio runtime.
    pub fn start(self, stop: CancellationToken) -> RunningController {
        let cfg = self.config;
        let queue: WorkQueue<ObjectKey> = WorkQueue::new("tern", cfg.queue_backoff);
        let feed = EventFeed::new(cfg.channel_capacity);
        let (failures, _) = broadcast::channel(FAILURE_CHANNEL_CAP);

        let mut handles = FxHashMap::default();
        let mut entries = FxHashMap::default();
        let mut sources = Vec::new();
        for (kind, reconciler) in self.kinds {
            let processor = DeltaProcessor::new(kind.clone())
                .with_handler(Arc::new(QueueDispatcher::new(queue.clone())))
                .with_handler(Arc::new(feed.clone()));
            let (tx, handle, processor_task) = spawn_processor(processor, cfg.channel_capacity, stop.clone());
            let reflector = Reflector::new(kind.clone(), Arc::clone(&self.remote), tx)
                .with_resync(cfg.resync)
                .with_backoff(cfg.watch_backoff);
            let reflector_task = tokio::spawn(reflector.run(stop.clone()));
            sources.push((format!("reflector {kind}"), reflector_task));
            sources.push((format!("processor {kind}"), processor_task));
            entries.insert(kind.clone(), KindEntry { cache: handle.cache().clone(), reconciler });
            handles.insert(kind, handle);
        }

        let ctx = Arc::new(WorkerContext { queue: queue.clone(), kinds: entries, max_retries: cfg.max_retries, failures: failures.clone() });
        let workers = (0..cfg.workers.max(1)).map(|id| tokio::spawn(run_worker(id, Arc::clone(&ctx)))).collect();

        let supervisor = {
            let queue = queue.clone();
            tokio::spawn(async move {
                stop.cancelled().await;
                debug!("stop requested; waiting for reflectors and processors");
                let mut first_err = None;
                for (name, task) in sources {
                    if let Err(e) = task.await {
                        first_err.get_or_insert_with(|| anyhow::Error::new(e).context(format!("{name} task failed")));
                    }
                }
                queue.shutdown();
                first_err.map_or(Ok(()), Err)
            })
        };

        info!(kinds = handles.len(), workers = cfg.workers.max(1), resync_secs = ?cfg.resync.map(|d| d.as_secs()), "controller started");
        RunningController { handles, queue, feed, failures, supervisor, workers }
    }
}

pub struct RunningController {
    handles: FxHashMap<String, ProcessorHandle>,
    queue: WorkQueue<ObjectKey>,
    feed: EventFeed,
    failures: broadcast::Sender<TerminalFailure>,
    supervisor: JoinHandle<Result<()>>,
    workers: Vec<JoinHandle<Result<(), tern_core::QueueError>>>,
}

impl RunningController {
    pub fn cache(&self, kind: &str) -> Option<Cache> { self.handles.get(kind).map(|h| h.cache().clone()) }

    pub fn queue(&self) -> &WorkQueue<ObjectKey> { &self.queue }

    pub fn has_synced(&self) -> bool { self.handles.values().all(ProcessorHandle::has_synced) }

    /// Wait until every kind has applied its first listing. Returns `false` if a
    /// processor stopped before that.
    pub async fn wait_for_cache_sync(&self) -> bool {
        for (kind, handle) in self.handles.iter() {
            if !handle.wait_synced().await {
                debug!(kind = %kind, "processor stopped before sync");
                return false;
            }
        }
        true
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ResourceEvent> { self.feed.subscribe() }

    pub fn subscribe_failures(&self) -> broadcast::Receiver<TerminalFailure> { self.failures.subscribe() }

    /// Wait for the stop token and a complete, ordered shutdown.
    pub async fn join(self) -> Result<()> {
        let sources = self.supervisor.await.context("controller supervisor task failed")?;
        for worker in self.workers {
            worker.await.context("worker task failed")?.context("work queue misuse")?;
        }
        sources?;
        info!("controller stopped");
        Ok(())
    }
}
