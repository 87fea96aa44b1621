//! Lister-watcher: keeps a delta processor fed with the state of one kind.
//!
//! List once, then watch from the listed version. A stream that ends is reopened
//! from the last version seen; a version the server no longer has (`Gone`) leads
//! back to a full list. Transport failures are retried forever with jittered
//! exponential backoff until the stop token is cancelled; repeated `Gone`
//! answers with no event in between back off the same way. A resync tick is
//! forwarded every `resync` interval from a separate loop, so it keeps firing
//! while the list or watch is failing.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tern_core::{BackoffConfig, Delta, DeltaKind, FeedMessage, TransportError};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{RemoteEvent, RemoteStore};

pub struct Reflector {
    kind: String,
    remote: Arc<dyn RemoteStore>,
    tx: mpsc::Sender<FeedMessage>,
    resync: Option<Duration>,
    backoff: BackoffConfig,
}

impl Reflector {
    pub fn new(kind: impl Into<String>, remote: Arc<dyn RemoteStore>, tx: mpsc::Sender<FeedMessage>) -> Self {
        Self { kind: kind.into(), remote, tx, resync: None, backoff: BackoffConfig::watch_default() }
    }

    /// `None` or zero disables resync.
    pub fn with_resync(mut self, resync: Option<Duration>) -> Self {
        self.resync = resync.filter(|d| !d.is_zero());
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    async fn send(&self, msg: FeedMessage, stop: &CancellationToken) -> bool {
        tokio::select! {
            biased;
            _ = stop.cancelled() => false,
            res = self.tx.send(msg) => match res {
                Ok(()) => true,
                Err(_) => {
                    debug!(kind = %self.kind, "processor gone");
                    false
                }
            },
        }
    }

    /// Sleep for the next backoff step. Returns `false` if stopped meanwhile.
    async fn backoff(&self, failures: &mut u32, stop: &CancellationToken) -> bool {
        let delay = self.backoff.jittered(*failures);
        *failures = failures.saturating_add(1);
        debug!(kind = %self.kind, delay_ms = delay.as_millis() as u64, "backing off");
        tokio::select! {
            _ = stop.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    fn report(&self, what: &str, e: &TransportError, failures: u32) {
        metrics::counter!("reflector_errors_total", 1u64, "kind" => self.kind.clone(), "op" => what.to_string());
        warn!(kind = %self.kind, error = %e, attempt = failures, "{what} failed; will retry");
    }

    pub async fn run(self, stop: CancellationToken) {
        info!(kind = %self.kind, resync_secs = ?self.resync.map(|d| d.as_secs()), "reflector started");
        // Resync ends with the list/watch loop, whichever way that one exits.
        let resync_stop = stop.child_token();
        tokio::join!(
            async {
                self.list_watch(&stop).await;
                resync_stop.cancel();
            },
            self.resync_loop(&resync_stop),
        );
        info!(kind = %self.kind, "reflector stopped");
    }

    /// Periodic resync, independent of the state of the list/watch loop.
    async fn resync_loop(&self, stop: &CancellationToken) {
        let Some(period) = self.resync else { return };
        let mut ticks = tokio::time::interval_at(Instant::now() + period, period);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                _ = ticks.tick() => {
                    if !self.send(FeedMessage::Resync, stop).await {
                        break;
                    }
                }
            }
        }
    }

    async fn list_watch(&self, stop: &CancellationToken) {
        let mut failures: u32 = 0;
        // Relists forced by `Gone` with no event seen since the last listing.
        let mut stale_relists: u32 = 0;

        'relist: loop {
            let listed = tokio::select! {
                biased;
                _ = stop.cancelled() => break 'relist,
                res = self.remote.list(&self.kind) => res,
            };
            let listing = match listed {
                Ok(l) => l,
                Err(e) => {
                    self.report("list", &e, failures);
                    if !self.backoff(&mut failures, stop).await {
                        break 'relist;
                    }
                    continue 'relist;
                }
            };
            failures = 0;
            metrics::counter!("reflector_relists_total", 1u64, "kind" => self.kind.clone());
            let mut rv = listing.resource_version.clone();
            debug!(kind = %self.kind, rv = %rv, count = listing.items.len(), "listed");
            let replace = FeedMessage::Replace { items: listing.items, resource_version: listing.resource_version };
            if !self.send(replace, stop).await {
                break 'relist;
            }

            loop {
                let opened = tokio::select! {
                    biased;
                    _ = stop.cancelled() => break 'relist,
                    res = self.remote.watch(&self.kind, &rv) => res,
                };
                let mut stream = match opened {
                    Ok(s) => s,
                    Err(e) if e.is_gone() => {
                        info!(kind = %self.kind, rv = %rv, "watch version expired; relisting");
                        if stale_relists > 0 && !self.backoff(&mut stale_relists, stop).await {
                            break 'relist;
                        }
                        stale_relists = stale_relists.max(1);
                        continue 'relist;
                    }
                    Err(e) => {
                        self.report("watch", &e, failures);
                        if !self.backoff(&mut failures, stop).await {
                            break 'relist;
                        }
                        continue;
                    }
                };
                debug!(kind = %self.kind, rv = %rv, "watch opened");
                let mut received = false;

                loop {
                    let next = tokio::select! {
                        biased;
                        _ = stop.cancelled() => break 'relist,
                        next = stream.next() => next,
                    };
                    match next {
                        Some(Ok(ev)) => {
                            received = true;
                            failures = 0;
                            stale_relists = 0;
                            metrics::counter!("reflector_events_total", 1u64, "kind" => self.kind.clone());
                            if let Some(delta) = translate(ev, &mut rv) {
                                if !self.send(FeedMessage::Delta(delta), stop).await {
                                    break 'relist;
                                }
                            }
                        }
                        Some(Err(e)) if e.is_gone() => {
                            info!(kind = %self.kind, rv = %rv, "watch reported expired version; relisting");
                            if stale_relists > 0 && !self.backoff(&mut stale_relists, stop).await {
                                break 'relist;
                            }
                            stale_relists = stale_relists.max(1);
                            continue 'relist;
                        }
                        Some(Err(e)) => {
                            metrics::counter!("reflector_watch_restarts_total", 1u64, "kind" => self.kind.clone());
                            self.report("watch stream", &e, failures);
                            if !self.backoff(&mut failures, stop).await {
                                break 'relist;
                            }
                            break;
                        }
                        None => {
                            metrics::counter!("reflector_watch_restarts_total", 1u64, "kind" => self.kind.clone());
                            debug!(kind = %self.kind, rv = %rv, "watch stream ended; reopening");
                            // A stream that closes straight away must not turn into a hot loop.
                            if !received && !self.backoff(&mut failures, stop).await {
                                break 'relist;
                            }
                            break;
                        }
                    }
                }
            }
        }
    }
}

/// Turn a watch event into a delta, advancing the last observed version.
fn translate(ev: RemoteEvent, rv: &mut String) -> Option<Delta> {
    let (kind, snap) = match ev {
        RemoteEvent::Added(s) => (DeltaKind::Added, s),
        RemoteEvent::Modified(s) => (DeltaKind::Updated, s),
        RemoteEvent::Deleted(s) => (DeltaKind::Deleted, s),
        RemoteEvent::Bookmark(v) => {
            if !v.is_empty() {
                *rv = v;
            }
            return None;
        }
    };
    if !snap.resource_version().is_empty() {
        *rv = snap.resource_version().to_string();
    }
    Some(Delta::new(kind, snap))
}
