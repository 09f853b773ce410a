//! Balancer (spec §4.11): a configuration action that picks among N backend
//! sub-actions per request, with failure fallback and a fair backlog for
//! when every backend is down.
//!
//! Grounded in the teacher's `client::pool` load-tracking idea (least-loaded
//! connection picked from a pool) generalized to spec §4.11's two named
//! policies (SQF, round robin) plus the health/backlog state machine the
//! teacher has no analogue for — that part follows `original_source/`'s
//! `mod_balance.c` directly: per-backend `{load, state, wake_ts}`, a FIFO
//! backlog with head-reinsertion for starvation avoidance, and a
//! reactivation tick that wakes `max(1, backends/2)` parked requests per
//! sweep. Spec §4.11 "Cross-thread safety: balancer carries a mutex" is
//! implemented directly: a balancer is shared (one instance per compiled
//! config action) across every worker thread, each dispatching its own VRs
//! against it, so its backend table and backlog live behind a `Mutex`.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::config::action::Action;
use crate::event_loop::job::JobRef;

/// How long an `Overloaded` backend stays out of rotation before a retry
/// (spec: "mark backend Overloaded with 5s wake").
pub const OVERLOAD_WAKE: Duration = Duration::from_secs(5);
/// How long a `Down` backend stays out of rotation before a retry (spec:
/// "mark Down with 1s wake").
pub const DEAD_WAKE: Duration = Duration::from_secs(1);
/// Interval on which the balancer's reactivation timer sweeps
/// `Overloaded`/`Down` backends and releases backlog entries (spec: "a
/// timer fires every GRANULARITY interval while any backend is not
/// Alive"). The spec leaves the exact value implementation-defined; we
/// reuse the throttle engine's own granularity as a reasonable default.
pub const GRANULARITY: Duration = crate::throttle::THROTTLE_GRANULARITY;

/// Load-balancing policy (spec §4.11).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalancePolicy {
    /// Shortest-queue-first: pick the `Alive` backend with minimum load.
    Sqf,
    /// Next index in modulo order among `Alive` backends.
    RoundRobin,
}

/// Per-backend health (spec §4.11 `state`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendHealth {
    Alive,
    Overloaded,
    Down,
}

/// The two ways a dispatched backend can report failure (spec §4.11
/// `fallback(error)`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendError {
    Overload,
    Dead,
}

/// What the action stack should do after asking a [`Balancer`] to pick a
/// backend.
#[derive(Debug, Clone)]
pub enum SelectOutcome {
    /// Run backend `index`'s action.
    Dispatch(usize),
    /// No backend alive; the VR was parked on the backlog.
    Parked,
    /// No backend alive and the backlog is full (spec: `backend_overloaded`
    /// / `backend_dead` → 503).
    Rejected,
}

struct BackendSlot {
    action: Arc<Action>,
    load: i64,
    state: BackendHealth,
    wake_at: Option<Instant>,
}

struct BacklogEntry {
    job: JobRef,
}

struct Inner {
    backends: Vec<BackendSlot>,
    rr_next: usize,
    backlog: VecDeque<BacklogEntry>,
    backlog_limit: usize,
}

impl Inner {
    fn pick(&mut self, policy: BalancePolicy) -> Option<usize> {
        let picked = match policy {
            BalancePolicy::Sqf => self
                .backends
                .iter()
                .enumerate()
                .filter(|(_, s)| s.state == BackendHealth::Alive)
                .min_by_key(|(_, s)| s.load)
                .map(|(i, _)| i),
            BalancePolicy::RoundRobin => {
                let n = self.backends.len();
                (0..n)
                    .map(|offset| (self.rr_next + offset) % n.max(1))
                    .find(|&idx| self.backends.get(idx).map_or(false, |s| s.state == BackendHealth::Alive))
            }
        };
        if let Some(idx) = picked {
            self.backends[idx].load += 1;
            if policy == BalancePolicy::RoundRobin {
                self.rr_next = (idx + 1) % self.backends.len().max(1);
            }
        }
        picked
    }
}

/// A compiled balancer action (spec §4.11 `Balancer`).
pub struct Balancer {
    policy: BalancePolicy,
    inner: Mutex<Inner>,
}

impl Balancer {
    /// `backends` are the per-backend sub-actions, in table order.
    /// `backlog_limit` bounds how many VRs may be parked at once.
    pub fn new(policy: BalancePolicy, backends: Vec<Arc<Action>>, backlog_limit: usize) -> Balancer {
        let backends = backends
            .into_iter()
            .map(|action| BackendSlot {
                action,
                load: 0,
                state: BackendHealth::Alive,
                wake_at: None,
            })
            .collect();
        Balancer {
            policy,
            inner: Mutex::new(Inner {
                backends,
                rr_next: 0,
                backlog: VecDeque::new(),
                backlog_limit,
            }),
        }
    }

    /// Number of configured backends.
    pub fn backend_count(&self) -> usize {
        self.inner.lock().unwrap().backends.len()
    }

    /// Number of VRs currently parked.
    pub fn backlog_len(&self) -> usize {
        self.inner.lock().unwrap().backlog.len()
    }

    /// The compiled action for backend `index`.
    pub fn backend_action(&self, index: usize) -> Arc<Action> {
        self.inner.lock().unwrap().backends[index].action.clone()
    }

    /// Pick a backend (spec `select`). If none is `Alive`, park `job` on
    /// the backlog — unless it's already full, in which case reject (spec:
    /// "If no backend is Alive, and backlog_limit not exceeded, the VR is
    /// parked... If backlog is full, the VR is signaled 503").
    pub fn select(&self, job: JobRef) -> SelectOutcome {
        let mut inner = self.inner.lock().unwrap();
        if let Some(idx) = inner.pick(self.policy) {
            return SelectOutcome::Dispatch(idx);
        }
        if inner.backlog.len() >= inner.backlog_limit {
            return SelectOutcome::Rejected;
        }
        inner.backlog.push_back(BacklogEntry { job });
        SelectOutcome::Parked
    }

    /// A backend reported `backend_failed` (spec `fallback(error)`): marks
    /// `Overloaded` (5s wake) if the error was itself `Overload` or the
    /// backend still had outstanding load at the time of failure,
    /// otherwise `Down` (1s wake).
    pub fn fallback(&self, index: usize, error: BackendError, now: Instant) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(slot) = inner.backends.get_mut(index) {
            let had_load = slot.load > 0;
            slot.load = slot.load.saturating_sub(1);
            if error == BackendError::Overload || had_load {
                slot.state = BackendHealth::Overloaded;
                slot.wake_at = Some(now + OVERLOAD_WAKE);
            } else {
                slot.state = BackendHealth::Down;
                slot.wake_at = Some(now + DEAD_WAKE);
            }
        }
    }

    /// A backend's request finished successfully (spec `finished`):
    /// releases its load slot.
    pub fn finished(&self, index: usize) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(slot) = inner.backends.get_mut(index) {
            slot.load = slot.load.saturating_sub(1);
        }
    }

    /// Periodic reactivation sweep (spec: "a timer fires every GRANULARITY
    /// interval while any backend is not Alive, reactivating `n = max(1,
    /// backends/2)` backlog entries"). Returns the job handles to wake.
    pub fn tick(&self, now: Instant) -> Vec<JobRef> {
        let mut inner = self.inner.lock().unwrap();
        for slot in inner.backends.iter_mut() {
            if slot.state != BackendHealth::Alive {
                if let Some(at) = slot.wake_at {
                    if now >= at {
                        slot.state = BackendHealth::Alive;
                        slot.wake_at = None;
                    }
                }
            }
        }
        let any_alive = inner.backends.iter().any(|s| s.state == BackendHealth::Alive);
        if !any_alive || inner.backlog.is_empty() {
            return Vec::new();
        }
        let n = (inner.backends.len() / 2).max(1).min(inner.backlog.len());
        (0..n).filter_map(|_| inner.backlog.pop_front().map(|e| e.job)).collect()
    }

    /// True if at least one backend still needs periodic reactivation
    /// (drives whether the owning worker keeps the balancer's tick timer
    /// alive, spec §4.1 `keep_loop_alive`).
    pub fn needs_tick(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.backends.iter().any(|s| s.state != BackendHealth::Alive) && !inner.backlog.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::value::Value;

    fn dummy_backend() -> Arc<Action> {
        Arc::new(Action::Setting {
            index: 0,
            value: Value::None,
        })
    }

    fn dummy_job() -> JobRef {
        // A JobRef with no registered job on the other end; good enough to
        // exercise balancer bookkeeping without a real worker.
        let queue = crate::event_loop::job::JobQueue::new(std::sync::Arc::new(tokio::sync::Notify::new()));
        struct Noop;
        impl crate::event_loop::job::Job for Noop {
            fn run(&self) {}
        }
        queue.register(std::rc::Rc::new(Noop))
    }

    #[test]
    fn sqf_picks_the_least_loaded_alive_backend() {
        let bal = Balancer::new(BalancePolicy::Sqf, vec![dummy_backend(), dummy_backend()], 8);
        match bal.select(dummy_job()) {
            SelectOutcome::Dispatch(0) => {}
            _ => panic!("expected backend 0 first"),
        }
        // backend 0 now has load 1; next pick should prefer backend 1
        match bal.select(dummy_job()) {
            SelectOutcome::Dispatch(1) => {}
            _ => panic!("expected backend 1 next"),
        }
    }

    #[test]
    fn round_robin_cycles_through_alive_backends() {
        let bal = Balancer::new(BalancePolicy::RoundRobin, vec![dummy_backend(), dummy_backend()], 8);
        let first = match bal.select(dummy_job()) {
            SelectOutcome::Dispatch(i) => i,
            _ => panic!("expected a dispatch"),
        };
        let second = match bal.select(dummy_job()) {
            SelectOutcome::Dispatch(i) => i,
            _ => panic!("expected a dispatch"),
        };
        assert_ne!(first, second);
    }

    #[test]
    fn every_backend_down_parks_then_rejects_once_full() {
        let bal = Balancer::new(BalancePolicy::Sqf, vec![dummy_backend()], 1);
        let now = Instant::now();
        bal.fallback(0, BackendError::Dead, now);
        match bal.select(dummy_job()) {
            SelectOutcome::Parked => {}
            _ => panic!("expected the VR to park"),
        }
        match bal.select(dummy_job()) {
            SelectOutcome::Rejected => {}
            _ => panic!("expected rejection once backlog is full"),
        }
    }

    #[test]
    fn tick_reactivates_dead_backends_and_drains_backlog() {
        let bal = Balancer::new(BalancePolicy::Sqf, vec![dummy_backend()], 8);
        let now = Instant::now();
        bal.fallback(0, BackendError::Dead, now);
        assert!(matches!(bal.select(dummy_job()), SelectOutcome::Parked));
        assert_eq!(bal.backlog_len(), 1);

        let woken = bal.tick(now + DEAD_WAKE);
        assert_eq!(woken.len(), 1);
        assert_eq!(bal.backlog_len(), 0);
    }
}
