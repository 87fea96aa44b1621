//! Tern work queue: deduplicating, retry-capable queue of keys with at most one
//! in-flight processing pass per key.
//!
//! A key moves through three sets: *pending* (queued, waiting for `get`),
//! *processing* (handed to a worker) and *dirty* (needs a pass). Adding a key
//! that is being processed only marks it dirty; `done` puts it back in line.
//! However many times a key is added while in flight, it gets exactly one more
//! pass afterwards.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rustc_hash::{FxHashMap, FxHashSet};
use tern_core::{BackoffConfig, QueueError};
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Per-key exponential backoff: `initial * multiplier^failures`, capped at `max`.
///
/// Delays for one key never decrease until [`forget`](Self::forget) resets it.
#[derive(Debug)]
pub struct ExponentialLimiter<K> {
    backoff: BackoffConfig,
    failures: FxHashMap<K, u32>,
}

impl<K: Eq + Hash + Clone> ExponentialLimiter<K> {
    pub fn new(backoff: BackoffConfig) -> Self {
        Self { backoff, failures: FxHashMap::default() }
    }

    /// Delay for the next retry of `key`; counts one more failure.
    pub fn when(&mut self, key: &K) -> Duration {
        let n = self.failures.entry(key.clone()).or_insert(0);
        let delay = self.backoff.delay(*n);
        *n = n.saturating_add(1);
        delay
    }

    pub fn forget(&mut self, key: &K) {
        self.failures.remove(key);
    }

    pub fn num_requeues(&self, key: &K) -> u32 {
        self.failures.get(key).copied().unwrap_or(0)
    }
}

struct State<K> {
    queue: VecDeque<K>,
    dirty: FxHashSet<K>,
    processing: FxHashSet<K>,
    /// Deadline of the one delayed add per key; the earliest request wins.
    waiting: FxHashMap<K, Instant>,
    shutting_down: bool,
}

struct Inner<K> {
    name: String,
    state: Mutex<State<K>>,
    ready: Notify,
    limiter: Mutex<ExponentialLimiter<K>>,
    shutdown: CancellationToken,
}

/// Cloneable handle to a shared work queue.
pub struct WorkQueue<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self { Self { inner: Arc::clone(&self.inner) } }
}

impl<K> WorkQueue<K>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, backoff: BackoffConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: FxHashSet::default(),
                    processing: FxHashSet::default(),
                    waiting: FxHashMap::default(),
                    shutting_down: false,
                }),
                ready: Notify::new(),
                limiter: Mutex::new(ExponentialLimiter::new(backoff)),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State<K>> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn limiter(&self) -> MutexGuard<'_, ExponentialLimiter<K>> {
        self.inner.limiter.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn report_depth(&self, depth: usize) {
        metrics::gauge!("workqueue_depth", depth as f64, "name" => self.inner.name.clone());
    }

    /// Mark `key` as needing a pass. No-op if it is already pending.
    pub fn add(&self, key: K) -> Result<(), QueueError> {
        let mut st = self.state();
        if st.shutting_down {
            return Err(QueueError::ShutDown);
        }
        if !st.dirty.insert(key.clone()) {
            trace!(queue = %self.inner.name, key = ?key, "already pending");
            return Ok(());
        }
        metrics::counter!("workqueue_adds_total", 1u64, "name" => self.inner.name.clone());
        if st.processing.contains(&key) {
            trace!(queue = %self.inner.name, key = ?key, "in flight; marked dirty");
            return Ok(());
        }
        st.queue.push_back(key);
        let depth = st.queue.len();
        drop(st);
        self.report_depth(depth);
        self.inner.ready.notify_one();
        Ok(())
    }

    /// Wait for the next key and mark it in flight.
    ///
    /// After [`shutdown`](Self::shutdown) keys already queued are still handed
    /// out; `None` is returned once the queue is empty.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.inner.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut st = self.state();
                if let Some(key) = st.queue.pop_front() {
                    st.dirty.remove(&key);
                    st.processing.insert(key.clone());
                    let depth = st.queue.len();
                    drop(st);
                    self.report_depth(depth);
                    return Some(key);
                }
                if st.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Finish the pass for `key`; queue it again if it was added meanwhile.
    pub fn done(&self, key: &K) -> Result<(), QueueError> {
        let mut st = self.state();
        if !st.processing.remove(key) {
            return Err(QueueError::NotInFlight(format!("{key:?}")));
        }
        if st.dirty.contains(key) {
            st.queue.push_back(key.clone());
            let depth = st.queue.len();
            drop(st);
            self.report_depth(depth);
            self.inner.ready.notify_one();
        }
        Ok(())
    }

    /// Add `key` after `delay` without blocking the caller. Cancelled by shutdown.
    ///
    /// A key has at most one delayed add outstanding: a request with a later
    /// deadline than the one already waiting is dropped, an earlier one replaces it.
    pub fn requeue_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            if let Err(e) = self.add(key) {
                debug!(queue = %self.inner.name, error = %e, "requeue dropped");
            }
            return;
        }
        let deadline = Instant::now() + delay;
        {
            let mut st = self.state();
            if st.shutting_down {
                debug!(queue = %self.inner.name, key = ?key, "shutting down; requeue dropped");
                return;
            }
            match st.waiting.get(&key) {
                Some(existing) if *existing <= deadline => {
                    trace!(queue = %self.inner.name, key = ?key, "earlier delayed add already waiting");
                    return;
                }
                _ => {
                    st.waiting.insert(key.clone(), deadline);
                }
            }
        }
        let q = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = q.inner.shutdown.cancelled() => {}
                _ = tokio::time::sleep_until(deadline) => q.fire_delayed(key, deadline),
            }
        });
    }

    fn fire_delayed(&self, key: K, deadline: Instant) {
        {
            let mut st = self.state();
            if st.waiting.get(&key) != Some(&deadline) {
                // Superseded by an earlier deadline.
                return;
            }
            st.waiting.remove(&key);
        }
        if let Err(e) = self.add(key) {
            debug!(queue = %self.inner.name, error = %e, "delayed requeue dropped");
        }
    }

    /// Requeue with the per-key exponential delay; returns the delay used.
    pub fn requeue_rate_limited(&self, key: K) -> Duration {
        let delay = self.limiter().when(&key);
        metrics::counter!("workqueue_retries_total", 1u64, "name" => self.inner.name.clone());
        self.requeue_after(key, delay);
        delay
    }

    /// Reset the failure count of `key`.
    pub fn forget(&self, key: &K) {
        self.limiter().forget(key);
    }

    pub fn num_requeues(&self, key: &K) -> u32 {
        self.limiter().num_requeues(key)
    }

    /// Keys waiting for a worker.
    pub fn len(&self) -> usize { self.state().queue.len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }
    pub fn in_flight(&self) -> usize { self.state().processing.len() }
    /// Keys with a delayed add outstanding.
    pub fn waiting(&self) -> usize { self.state().waiting.len() }
    pub fn is_in_flight(&self, key: &K) -> bool { self.state().processing.contains(key) }
    pub fn is_shutting_down(&self) -> bool { self.state().shutting_down }
    pub fn name(&self) -> &str { &self.inner.name }

    /// Refuse further adds, cancel delayed requeues and wake every waiting `get`.
    pub fn shutdown(&self) {
        {
            let mut st = self.state();
            if st.shutting_down {
                return;
            }
            st.shutting_down = true;
            st.waiting.clear();
        }
        debug!(queue = %self.inner.name, "shutting down");
        self.inner.shutdown.cancel();
        self.inner.ready.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> WorkQueue<&'static str> {
        WorkQueue::new("test", BackoffConfig::retry_default())
    }

    #[tokio::test]
    async fn duplicate_adds_collapse() {
        let q = queue();
        q.add("a").unwrap();
        q.add("a").unwrap();
        q.add("b").unwrap();
        assert_eq!(q.len(), 2);
        assert_eq!(q.get().await, Some("a"));
        assert_eq!(q.get().await, Some("b"));
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn add_while_in_flight_requeues_once_on_done() {
        let q = queue();
        q.add("a").unwrap();
        let k = q.get().await.unwrap();
        assert!(q.is_in_flight(&k));
        q.add("a").unwrap();
        q.add("a").unwrap();
        // not handed out again while in flight
        assert!(q.is_empty());
        q.done(&k).unwrap();
        assert_eq!(q.len(), 1);
        assert_eq!(q.get().await, Some("a"));
        q.done(&"a").unwrap();
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn contract_violations_are_errors() {
        let q = queue();
        assert_eq!(q.done(&"x"), Err(QueueError::NotInFlight("\"x\"".into())));
        q.shutdown();
        assert_eq!(q.add("x"), Err(QueueError::ShutDown));
    }

    #[tokio::test]
    async fn shutdown_drains_then_returns_none() {
        let q = queue();
        q.add("a").unwrap();
        q.shutdown();
        assert_eq!(q.get().await, Some("a"));
        assert_eq!(q.get().await, None);
    }

    #[test]
    fn limiter_is_non_decreasing_until_forget() {
        let mut l = ExponentialLimiter::new(BackoffConfig {
            initial: Duration::from_millis(5),
            max: Duration::from_millis(100),
            multiplier: 2.0,
            jitter: 0.0,
        });
        let mut prev = Duration::ZERO;
        for _ in 0..20 {
            let d = l.when(&"a");
            assert!(d >= prev);
            prev = d;
        }
        assert_eq!(prev, Duration::from_millis(100));
        assert_eq!(l.num_requeues(&"a"), 20);
        // other keys are independent
        assert_eq!(l.when(&"b"), Duration::from_millis(5));
        l.forget(&"a");
        assert_eq!(l.num_requeues(&"a"), 0);
        assert_eq!(l.when(&"a"), Duration::from_millis(5));
    }
}
