use mage_store::KvStore;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub trait Clock {
    fn epoch_secs(&self) -> u64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn epoch_secs(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub success: bool,
    pub limit: u64,
    pub remaining: u64,
    pub reset: u64,
}

/// Fixed-window request counter. One key per (identifier, window start);
/// the record's TTL matches the window so expiry is delegated to the store.
pub struct RateLimiter<S: KvStore, C: Clock> {
    store: S,
    clock: C,
}

impl<S: KvStore> RateLimiter<S, SystemClock> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            clock: SystemClock,
        }
    }
}

impl<S: KvStore, C: Clock> RateLimiter<S, C> {
    pub fn with_clock(store: S, clock: C) -> Self {
        Self { store, clock }
    }

    pub fn check(&self, identifier: &str, limit: u64, window_secs: u64) -> RateLimitDecision {
        let window_secs = window_secs.max(1);
        let window_start = self.clock.epoch_secs() / window_secs * window_secs;
        let reset = window_start + window_secs;
        let key = format!("ratelimit:{identifier}:{window_start}");

        match self.try_count(&key, limit, window_secs) {
            Ok(decision) => RateLimitDecision {
                limit,
                reset,
                ..decision
            },
            Err(err) => {
                // Infrastructure failure: fail open rather than blocking
                // legitimate traffic on a store outage.
                tracing::warn!("rate limiter store error, failing open: {err:#}");
                RateLimitDecision {
                    success: true,
                    limit,
                    remaining: 1,
                    reset,
                }
            }
        }
    }

    fn try_count(&self, key: &str, limit: u64, window_secs: u64) -> anyhow::Result<RateLimitDecision> {
        let count = self
            .store
            .get(key)?
            .and_then(|raw| raw.parse::<u64>().ok())
            .unwrap_or(0);

        if count >= limit {
            return Ok(RateLimitDecision {
                success: false,
                limit,
                remaining: 0,
                reset: 0,
            });
        }

        let next = count + 1;
        self.store.set(
            key,
            &next.to_string(),
            Some(Duration::from_secs(window_secs)),
        )?;
        Ok(RateLimitDecision {
            success: true,
            limit,
            remaining: limit - next,
            reset: 0,
        })
    }
}
