//! Reconciliation workers.
//!
//! Each worker loops on the shared queue: take a key, read the current object
//! from the cache of its kind, run the reconciler, then settle the key (forget
//! on success, rate-limited requeue on failure) before marking it done. Queued
//! keys carry no payload, so a retry always sees the latest cached state.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use rustc_hash::FxHashMap;
use tern_core::{ObjectKey, QueueError};
use tern_queue::WorkQueue;
use tern_store::Cache;
use tokio::sync::broadcast;
use tracing::{debug, error, warn};

use crate::Reconciler;

/// A key that kept failing until it ran out of retries and was dropped.
#[derive(Debug, Clone)]
pub struct TerminalFailure {
    pub key: ObjectKey,
    /// Failed passes, including the last one.
    pub attempts: u32,
    pub error: String,
}

pub(crate) struct KindEntry {
    pub(crate) cache: Cache,
    pub(crate) reconciler: Arc<dyn Reconciler>,
}

pub(crate) struct WorkerContext {
    pub(crate) queue: WorkQueue<ObjectKey>,
    pub(crate) kinds: FxHashMap<String, KindEntry>,
    pub(crate) max_retries: Option<u32>,
    pub(crate) failures: broadcast::Sender<TerminalFailure>,
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Run until the queue is shut down and drained.
pub(crate) async fn run_worker(id: usize, ctx: Arc<WorkerContext>) -> Result<(), QueueError> {
    debug!(worker = id, "worker started");
    while let Some(key) = ctx.queue.get().await {
        reconcile_one(&ctx, &key).await;
        ctx.queue.done(&key)?;
    }
    debug!(worker = id, "worker stopped");
    Ok(())
}

async fn reconcile_one(ctx: &WorkerContext, key: &ObjectKey) {
    let Some(entry) = ctx.kinds.get(&key.kind) else {
        warn!(key = %key, "no reconciler registered for kind; dropping key");
        ctx.queue.forget(key);
        return;
    };
    let current = entry.cache.get(key);
    let started = Instant::now();
    let outcome = match AssertUnwindSafe(entry.reconciler.reconcile(key, current)).catch_unwind().await {
        Ok(res) => res,
        Err(payload) => Err(anyhow::anyhow!("reconciler panicked: {}", panic_message(&*payload))),
    };
    metrics::histogram!("reconcile_ms", started.elapsed().as_secs_f64() * 1000.0, "kind" => key.kind.clone());

    let err = match outcome {
        Ok(()) => {
            ctx.queue.forget(key);
            debug!(key = %key, "reconciled");
            return;
        }
        Err(e) => e,
    };
    metrics::counter!("reconcile_errors_total", 1u64, "kind" => key.kind.clone());
    let retries = ctx.queue.num_requeues(key);
    if ctx.max_retries.is_some_and(|max| retries >= max) {
        ctx.queue.forget(key);
        metrics::counter!("reconcile_terminal_total", 1u64, "kind" => key.kind.clone());
        error!(key = %key, attempts = retries + 1, error = %format!("{err:#}"), "giving up after repeated failures");
        let failure = TerminalFailure { key: key.clone(), attempts: retries + 1, error: format!("{err:#}") };
        if ctx.failures.send(failure).is_err() {
            debug!(key = %key, "no failure subscribers");
        }
        return;
    }
    let delay = ctx.queue.requeue_rate_limited(key.clone());
    warn!(
        key = %key,
        attempt = retries + 1,
        delay_ms = delay.as_millis() as u64,
        error = %format!("{err:#}"),
        "reconcile failed; requeued"
    );
}
