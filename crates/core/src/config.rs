//! Engine configuration with `TERN_*` environment overrides.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Exponential backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    /// Upper bound of the random extra delay, as a fraction of the computed delay (0 disables).
    pub jitter: f64,
}

impl BackoffConfig {
    /// Work queue retries: 1s, 2s, 4s ... capped at 5 minutes, no jitter.
    pub fn retry_default() -> Self {
        Self { initial: Duration::from_secs(1), max: Duration::from_secs(300), multiplier: 2.0, jitter: 0.0 }
    }

    /// List/watch reconnects: 800ms doubling up to 30s with 25% jitter.
    pub fn watch_default() -> Self {
        Self { initial: Duration::from_millis(800), max: Duration::from_secs(30), multiplier: 2.0, jitter: 0.25 }
    }

    /// Delay before retry number `attempt` (0-based), without jitter. Never exceeds `max`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.initial.as_secs_f64() * self.multiplier.max(1.0).powi(exp);
        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            return self.max;
        }
        Duration::from_secs_f64(secs)
    }

    /// [`delay`](Self::delay) plus up to `jitter * delay` of random extra time.
    pub fn jittered(&self, attempt: u32) -> Duration {
        let base = self.delay(attempt);
        if self.jitter <= 0.0 {
            return base;
        }
        let factor = rand::thread_rng().gen_range(0.0..=self.jitter);
        base + base.mul_f64(factor)
    }
}

impl Default for BackoffConfig {
    fn default() -> Self { Self::retry_default() }
}

/// Runtime knobs for one engine instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Interval between `Sync` replays of the cache; `None` disables resync.
    pub resync: Option<Duration>,
    pub workers: usize,
    /// Failures after which a key is dropped and reported as terminal; `None` retries forever.
    pub max_retries: Option<u32>,
    pub queue_backoff: BackoffConfig,
    pub watch_backoff: BackoffConfig,
    /// Capacity of the lister-watcher -> processor channel.
    pub channel_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            resync: Some(Duration::from_secs(30)),
            workers: 2,
            max_retries: Some(15),
            queue_backoff: BackoffConfig::retry_default(),
            watch_backoff: BackoffConfig::watch_default(),
            channel_capacity: 2048,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse::<T>().ok())
}

impl EngineConfig {
    /// Defaults overridden by `TERN_*` variables; unparsable values are ignored.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(secs) = env_parse::<u64>("TERN_RESYNC_SECS") {
            cfg.resync = if secs == 0 { None } else { Some(Duration::from_secs(secs)) };
        }
        if let Some(n) = env_parse::<usize>("TERN_WORKERS") { cfg.workers = n.max(1); }
        if let Some(n) = env_parse::<u32>("TERN_MAX_RETRIES") {
            cfg.max_retries = if n == 0 { None } else { Some(n) };
        }
        if let Some(cap) = env_parse::<usize>("TERN_QUEUE_CAP") { cfg.channel_capacity = cap.max(1); }
        if let Some(ms) = env_parse::<u64>("TERN_RETRY_INITIAL_MS") { cfg.queue_backoff.initial = Duration::from_millis(ms); }
        if let Some(ms) = env_parse::<u64>("TERN_RETRY_MAX_MS") { cfg.queue_backoff.max = Duration::from_millis(ms); }
        if let Some(secs) = env_parse::<u64>("TERN_WATCH_BACKOFF_MAX_SECS") {
            cfg.watch_backoff.max = Duration::from_secs(secs);
        }
        cfg
    }

    pub fn with_resync(mut self, resync: Option<Duration>) -> Self {
        self.resync = resync;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_max_retries(mut self, max_retries: Option<u32>) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_queue_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.queue_backoff = backoff;
        self
    }

    pub fn with_watch_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.watch_backoff = backoff;
        self
    }
}
