//! CQLimit (spec §3.1, §4.4): a shared byte counter attached to one or more
//! chunk-queues to enforce back-pressure.
//!
//! Multiple chunk-queues may share one [`CqLimit`] — that's how a stream's
//! source and its downstream filter share back-pressure (spec §3.2). When
//! `current` drops from "at limit" to "below", the limit fires its notify
//! callback so the upstream producer can resume.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// Callback invoked when a [`CqLimit`] transitions from "at/over limit" to
/// "below limit". Takes the opaque context registered alongside it.
pub trait LimitNotify {
    /// Called once per crossing, with `locked` true if the notification
    /// happens while the caller already holds whatever lock backs the
    /// chunk-queue (the source distinguishes this to avoid re-entrant
    /// locking; this crate's single-threaded-per-worker model means it is
    /// almost always `false`, but the parameter is kept for callers that
    /// share a limit across an explicit `RefCell` borrow).
    fn notify(&self, locked: bool);
}

struct Inner {
    limit: u64,
    current: u64,
    notify: Option<Rc<dyn LimitNotify>>,
}

impl fmt::Debug for Inner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CqLimitInner")
            .field("limit", &self.limit)
            .field("current", &self.current)
            .field("has_notify", &self.notify.is_some())
            .finish()
    }
}

/// A shared back-pressure counter (spec §3.1 `CQLimit`).
#[derive(Clone)]
pub struct CqLimit {
    inner: Rc<RefCell<Inner>>,
}

impl fmt::Debug for CqLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.inner.borrow().fmt(f)
    }
}

impl CqLimit {
    /// Create a new limit, initially unused (`current == 0`).
    pub fn new(limit: u64) -> CqLimit {
        CqLimit {
            inner: Rc::new(RefCell::new(Inner {
                limit,
                current: 0,
                notify: None,
            })),
        }
    }

    /// Register (or replace) the callback fired on a full-to-below
    /// transition.
    pub fn set_notify(&self, notify: Rc<dyn LimitNotify>) {
        self.inner.borrow_mut().notify = Some(notify);
    }

    /// The configured limit.
    pub fn limit(&self) -> u64 {
        self.inner.borrow().limit
    }

    /// Change the configured limit. If this immediately brings `current`
    /// below the new limit, fires notify.
    pub fn set_limit(&self, limit: u64) {
        let was_full = self.is_full();
        self.inner.borrow_mut().limit = limit;
        self.maybe_notify(was_full);
    }

    /// Bytes currently accounted against this limit.
    pub fn current(&self) -> u64 {
        self.inner.borrow().current
    }

    /// Whether `current >= limit` (no more data should be produced).
    pub fn is_full(&self) -> bool {
        let inner = self.inner.borrow();
        inner.current >= inner.limit
    }

    /// Remaining capacity before the limit is reached (0 if already full).
    pub fn available(&self) -> u64 {
        let inner = self.inner.borrow();
        inner.limit.saturating_sub(inner.current)
    }

    /// Apply a signed net delta to `current` (append increases it, skip/
    /// steal-out decreases it), firing notify on a full→below transition.
    pub fn apply_delta(&self, delta: i64) {
        let was_full = self.is_full();
        {
            let mut inner = self.inner.borrow_mut();
            if delta >= 0 {
                inner.current = inner.current.saturating_add(delta as u64);
            } else {
                inner.current = inner.current.saturating_sub((-delta) as u64);
            }
        }
        self.maybe_notify(was_full);
    }

    fn maybe_notify(&self, was_full: bool) {
        if was_full && !self.is_full() {
            let notify = self.inner.borrow().notify.clone();
            if let Some(notify) = notify {
                notify.notify(false);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct CountNotify(Rc<Cell<u32>>);
    impl LimitNotify for CountNotify {
        fn notify(&self, _locked: bool) {
            self.0.set(self.0.get() + 1);
        }
    }

    #[test]
    fn notify_fires_only_on_full_to_below_transition() {
        let limit = CqLimit::new(10);
        let count = Rc::new(Cell::new(0));
        limit.set_notify(Rc::new(CountNotify(count.clone())));

        limit.apply_delta(5);
        assert!(!limit.is_full());
        assert_eq!(count.get(), 0);

        limit.apply_delta(5); // now at limit (10/10)
        assert!(limit.is_full());
        assert_eq!(count.get(), 0);

        limit.apply_delta(2); // stays full, over-limit
        assert_eq!(count.get(), 0);

        limit.apply_delta(-4); // 8/10, below limit: fires once
        assert!(!limit.is_full());
        assert_eq!(count.get(), 1);

        limit.apply_delta(-1); // still below: no further fire
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn available_never_underflows() {
        let limit = CqLimit::new(5);
        limit.apply_delta(9);
        assert_eq!(limit.available(), 0);
    }
}
