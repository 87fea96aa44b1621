//! Tern store: per-kind cache, merging delta queue and the processor loop that
//! is the single writer of the cache.

#![forbid(unsafe_code)]

use std::sync::Arc;

use tern_core::{Delta, DeltaKind, FeedMessage, ResourceEventHandler, Snapshot};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

pub mod cache;
pub mod fifo;

pub use cache::{Cache, CacheWriter, ReplaceOutcome};
pub use fifo::DeltaFifo;

/// Applies deltas to a cache and notifies handlers, one delta at a time.
pub struct DeltaProcessor {
    writer: CacheWriter,
    fifo: DeltaFifo,
    handlers: Vec<Arc<dyn ResourceEventHandler>>,
}

impl DeltaProcessor {
    pub fn new(kind: impl Into<String>) -> Self {
        Self { writer: CacheWriter::new(kind), fifo: DeltaFifo::new(), handlers: Vec::new() }
    }

    pub fn with_handler(mut self, handler: Arc<dyn ResourceEventHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn add_handler(&mut self, handler: Arc<dyn ResourceEventHandler>) {
        self.handlers.push(handler);
    }

    pub fn cache(&self) -> Cache { self.writer.reader() }

    /// Keys with deltas waiting to be applied.
    pub fn pending(&self) -> usize { self.fifo.len() }

    /// Take one feed message. Returns `true` when it was a listing that has now been applied.
    ///
    /// Deltas are only queued; a listing first drains everything queued before it so
    /// per-key order holds across the relist.
    pub fn enqueue(&mut self, msg: FeedMessage) -> bool {
        match msg {
            FeedMessage::Delta(d) => {
                if !self.fifo.push(d) {
                    trace!(kind = %self.writer.reader().kind(), "redundant delta merged away");
                }
                false
            }
            FeedMessage::Replace { items, resource_version } => {
                self.process_all();
                self.replace(items, &resource_version);
                true
            }
            FeedMessage::Resync => {
                let cached = self.writer.reader().list();
                let total = cached.len();
                let queued = cached.into_iter().filter(|s| self.fifo.push(Delta::new(DeltaKind::Sync, Arc::clone(s)))).count();
                debug!(kind = %self.writer.reader().kind(), total, queued, "resync");
                false
            }
        }
    }

    /// Apply the pending run of the oldest key. Returns `false` when nothing was pending.
    pub fn process_next(&mut self) -> bool {
        let Some(run) = self.fifo.pop() else { return false };
        for d in run {
            self.apply(d);
        }
        true
    }

    pub fn process_all(&mut self) -> usize {
        let mut n = 0;
        while self.process_next() {
            n += 1;
        }
        n
    }

    fn apply(&mut self, d: Delta) {
        let previous = self.writer.apply(&d);
        metrics::counter!("processor_deltas_total", 1u64, "kind" => kind_label(d.kind));
        for h in self.handlers.iter() {
            match (d.kind, &previous) {
                (DeltaKind::Added | DeltaKind::Updated, Some(old)) => h.on_update(old, &d.object),
                (DeltaKind::Added | DeltaKind::Updated, None) => h.on_add(&d.object),
                (DeltaKind::Sync, _) => h.on_sync(&d.object),
                (DeltaKind::Deleted, last) => h.on_delete(last.as_ref().unwrap_or(&d.object)),
            }
        }
    }

    fn replace(&mut self, items: Vec<Snapshot>, resource_version: &str) {
        let outcome = self.writer.replace(items.into_iter().map(Arc::new));
        info!(
            kind = %self.writer.reader().kind(),
            rv = %resource_version,
            added = outcome.added.len(),
            updated = outcome.updated.len(),
            removed = outcome.removed.len(),
            "listing applied"
        );
        for h in self.handlers.iter() {
            for s in outcome.added.iter() {
                h.on_add(s);
            }
            for (old, new) in outcome.updated.iter() {
                h.on_update(old, new);
            }
            for s in outcome.removed.iter() {
                h.on_delete(s);
            }
        }
    }
}

fn kind_label(kind: DeltaKind) -> &'static str {
    match kind {
        DeltaKind::Added => "added",
        DeltaKind::Updated => "updated",
        DeltaKind::Deleted => "deleted",
        DeltaKind::Sync => "sync",
    }
}

/// Read side of a running processor.
#[derive(Clone)]
pub struct ProcessorHandle {
    cache: Cache,
    synced_rx: watch::Receiver<bool>,
}

impl ProcessorHandle {
    pub fn cache(&self) -> &Cache { &self.cache }

    pub fn has_synced(&self) -> bool { *self.synced_rx.borrow() }

    /// Wait until the first listing is applied. Returns `false` if the processor stopped first.
    pub async fn wait_synced(&self) -> bool {
        let mut rx = self.synced_rx.clone();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return *rx.borrow();
            }
        }
        true
    }
}

/// Spawn the processor loop. Returns the feed sender, a read handle and the task handle.
///
/// The loop exits when `stop` is cancelled or every sender is dropped. Messages
/// still buffered in the channel and pending deltas are applied before it returns.
pub fn spawn_processor(
    mut processor: DeltaProcessor,
    cap: usize,
    stop: CancellationToken,
) -> (mpsc::Sender<FeedMessage>, ProcessorHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<FeedMessage>(cap.max(1));
    let (synced_tx, synced_rx) = watch::channel(false);
    let handle = ProcessorHandle { cache: processor.cache(), synced_rx };

    let task = tokio::spawn(async move {
        let kind = processor.cache().kind().to_string();
        let intake = |processor: &mut DeltaProcessor, msg: FeedMessage| {
            if processor.enqueue(msg) && !*synced_tx.borrow() {
                info!(kind = %kind, "cache synced");
                synced_tx.send_replace(true);
            }
        };
        loop {
            if processor.pending() == 0 {
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => break,
                    maybe = rx.recv() => match maybe {
                        Some(msg) => intake(&mut processor, msg),
                        None => {
                            debug!("feed channel closed; draining and exiting processor loop");
                            break;
                        }
                    },
                }
            } else {
                // Merge whatever already arrived before applying the next key.
                for _ in 0..cap.max(1) {
                    match rx.try_recv() {
                        Ok(msg) => intake(&mut processor, msg),
                        Err(_) => break,
                    }
                }
                processor.process_next();
                if stop.is_cancelled() {
                    break;
                }
                tokio::task::yield_now().await;
            }
        }
        // Whatever the feed already buffered is applied too.
        rx.close();
        while let Ok(msg) = rx.try_recv() {
            intake(&mut processor, msg);
        }
        let drained = processor.process_all();
        info!(kind = %kind, drained, "delta processor stopped");
    });

    (tx, handle, task)
}
