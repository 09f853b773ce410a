//! Throttle engine (spec §4.10): token-bucket bandwidth limiting, with an
//! optional per-connection rate cap plus membership in zero or more shared
//! pools (e.g. "this vhost gets 10MB/s total").
//!
//! Grounded in the teacher's C sibling `main/throttle.c`. That file shards
//! each pool's token bucket per-OS-thread-worker and uses lock-free atomics
//! plus a per-worker waiting queue to redistribute a pool's tokens fairly
//! without ever taking a lock on the hot path, because it runs N worker
//! *processes worth of threads* all hammering the same pool concurrently.
//! This crate's pools are shared by far fewer workers (spec §4.8: "N+1"),
//! so we keep the token-bucket algorithm and its constants exactly
//! (`THROTTLE_MAX_STEP`, `THROTTLE_OVERLOAD`, query/rearm shape) but back
//! a shared pool with a single `Mutex` instead of a lock-free per-worker
//! shard array — noted as a deliberate simplification in the design ledger.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Largest number of bytes released to a single query (spec: "max amount
/// of bytes we release in one query").
pub const THROTTLE_MAX_STEP: i64 = 64 * 1024;
/// Bytes handed out even from an empty bucket, so new requests aren't
/// stalled indefinitely waiting for a full token (spec: "release
/// `overload` bytes to get requests started").
pub const THROTTLE_OVERLOAD: i64 = 8 * 1024;
/// Minimum interval between token-bucket refills.
pub const THROTTLE_GRANULARITY: Duration = Duration::from_millis(100);

struct PoolInner {
    rate: i64,
    burst: i64,
    magazine: i64,
    last_rearm: Instant,
}

impl PoolInner {
    fn rearm(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_rearm);
        if elapsed < THROTTLE_GRANULARITY {
            return;
        }
        let fill = (self.rate as i128 * elapsed.as_millis() as i128 / 1000) as i64;
        self.magazine = (self.magazine + fill).min(self.burst);
        self.last_rearm = now;
    }
}

/// A bandwidth budget shared by every connection that joins it (spec:
/// `liThrottlePool`).
#[derive(Clone)]
pub struct ThrottlePool(Arc<Mutex<PoolInner>>);

impl ThrottlePool {
    /// `rate` bytes/sec sustained, bursting up to `burst` bytes.
    pub fn new(rate: u32, burst: u32) -> ThrottlePool {
        ThrottlePool(Arc::new(Mutex::new(PoolInner {
            rate: rate as i64,
            burst: burst as i64,
            magazine: burst as i64,
            last_rearm: Instant::now(),
        })))
    }

    fn peek_available(&self, now: Instant) -> i64 {
        let mut inner = self.0.lock().unwrap();
        inner.rearm(now);
        inner.magazine
    }

    fn consume(&self, n: i64) {
        let mut inner = self.0.lock().unwrap();
        inner.magazine -= n;
    }
}

/// Outcome of a [`ThrottleState::query`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleResult {
    /// Send up to this many bytes now.
    Allowed(u32),
    /// The bucket is empty; retry once woken from the throttle wait queue.
    Queued,
}

/// Per-connection throttle state (spec: `liThrottleState`).
pub struct ThrottleState {
    magazine: i64,
    single_rate: i64,
    single_burst: i64,
    single_magazine: i64,
    single_last_rearm: Instant,
    pools: Vec<ThrottlePool>,
}

impl Default for ThrottleState {
    fn default() -> Self {
        ThrottleState::new()
    }
}

impl ThrottleState {
    pub fn new() -> ThrottleState {
        ThrottleState {
            magazine: 0,
            single_rate: 0,
            single_burst: 0,
            single_magazine: 0,
            single_last_rearm: Instant::now(),
            pools: Vec::new(),
        }
    }

    /// Cap this single connection (independent of any shared pool) at
    /// `rate` bytes/sec, bursting up to `burst`.
    pub fn set_single(&mut self, rate: u32, burst: u32) {
        self.single_rate = rate as i64;
        self.single_burst = burst as i64;
        self.single_magazine = burst as i64;
        self.single_last_rearm = Instant::now();
    }

    /// Join a shared pool (idempotent).
    pub fn add_pool(&mut self, pool: ThrottlePool) -> bool {
        if self.pools.iter().any(|p| Arc::ptr_eq(&p.0, &pool.0)) {
            return false;
        }
        self.pools.push(pool);
        true
    }

    /// Leave a shared pool.
    pub fn remove_pool(&mut self, pool: &ThrottlePool) {
        self.pools.retain(|p| !Arc::ptr_eq(&p.0, &pool.0));
    }

    /// Ask for up to `interested` bytes to send right now (spec
    /// `li_throttle_query`).
    pub fn query(&mut self, interested: u32, now: Instant) -> ThrottleResult {
        let mut interested = (interested as i64).min(THROTTLE_MAX_STEP);

        if interested <= self.magazine + THROTTLE_OVERLOAD {
            return ThrottleResult::Allowed(interested as u32);
        }

        let mut fill = interested - self.magazine;

        if self.single_rate != 0 {
            let elapsed = now.saturating_duration_since(self.single_last_rearm);
            if elapsed >= THROTTLE_GRANULARITY {
                let single_fill = self.single_rate * elapsed.as_millis() as i64 / 1000;
                self.single_magazine = (self.single_magazine + single_fill).min(self.single_burst);
                self.single_last_rearm = now;
            }
            fill = fill.min(self.single_magazine);
        }

        let mut pool_fill = fill;
        for pool in &self.pools {
            pool_fill = pool_fill.min(pool.peek_available(now));
        }

        if pool_fill > 0 {
            for pool in &self.pools {
                pool.consume(pool_fill);
            }
            if self.single_rate != 0 {
                self.single_magazine -= pool_fill;
            }
            self.magazine += pool_fill;
        }

        if self.magazine + THROTTLE_OVERLOAD <= 0 {
            return ThrottleResult::Queued;
        }

        interested = interested.min(self.magazine + THROTTLE_OVERLOAD);
        ThrottleResult::Allowed(interested as u32)
    }

    /// Record that `used` bytes were actually sent, debiting the magazine
    /// (spec `li_throttle_update`; may go negative, i.e. into debt).
    pub fn update(&mut self, used: u32) {
        self.magazine -= used as i64;
    }
}
