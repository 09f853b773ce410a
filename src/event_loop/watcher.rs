//! Event-watcher abstraction (spec §4.1).
//!
//! Every watcher carries a human-readable name (for diagnostics) and a
//! `keep_loop_alive` bit: while set (and the watcher is active), the owning
//! [`Loop`](super::Loop) will not consider itself drained. The teacher's
//! event family (`IO`, `Timer`, `Async`, `Child`, `Signal`, `Prepare`,
//! `Check`) is modeled here as a tagged sum with a shared base, the same
//! shape `common/exec.rs` gives the `Exec` enum in the teacher.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Shared bookkeeping every watcher carries, regardless of kind.
#[derive(Debug)]
struct WatcherBase {
    name: &'static str,
    keep_loop_alive: AtomicBool,
    active: AtomicBool,
    loop_keep_alive_count: Arc<AtomicUsize>,
}

impl Drop for WatcherBase {
    fn drop(&mut self) {
        if self.active.load(Ordering::Acquire) && self.keep_loop_alive.load(Ordering::Acquire) {
            self.loop_keep_alive_count.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

/// The tag distinguishing watcher kinds, kept only for diagnostics; the
/// actual readiness plumbing for each kind lives in the owning module (the
/// job queue drives `Async`, `WaitQueue` drives `Timer`, etc).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherKind {
    /// Readiness on a file descriptor / socket.
    Io,
    /// A one-shot or repeating timer.
    Timer,
    /// A cross-thread-safe wakeup.
    Async,
    /// Notification that a child process exited.
    Child,
    /// A delivered Unix signal.
    Signal,
    /// Runs once before the loop blocks for I/O.
    Prepare,
    /// Runs once after the loop returns from blocking for I/O.
    Check,
}

/// A registered watcher handle.
///
/// This crate's event loop is implemented on top of `tokio`'s reactor
/// (spec §9 "Coroutine / callback control flow" explicitly allows this); the
/// [`Watcher`] type here is the diagnostic/keep-alive handle the rest of the
/// core attaches to a [`Loop`](super::Loop), not a replacement reactor.
#[derive(Debug, Clone)]
pub struct Watcher {
    base: Arc<WatcherBase>,
    kind: WatcherKind,
}

impl Watcher {
    pub(crate) fn new(
        registry: &KeepAliveRegistry,
        kind: WatcherKind,
        name: &'static str,
        keep_loop_alive: bool,
    ) -> Watcher {
        Watcher {
            base: Arc::new(WatcherBase {
                name,
                keep_loop_alive: AtomicBool::new(keep_loop_alive),
                active: AtomicBool::new(false),
                loop_keep_alive_count: registry.count.clone(),
            }),
            kind,
        }
    }

    /// The diagnostic name given at registration.
    pub fn event_name(&self) -> &'static str {
        self.base.name
    }

    /// The watcher's kind.
    pub fn kind(&self) -> WatcherKind {
        self.kind
    }

    /// Whether this watcher currently prevents the loop from considering
    /// itself drained.
    pub fn keeps_loop_alive(&self) -> bool {
        self.base.keep_loop_alive.load(Ordering::Acquire)
    }

    /// Clear the keep-alive bit (used by `Loop::end()`, spec §4.1).
    pub fn clear_keep_loop_alive(&self) {
        if self.base.active.load(Ordering::Acquire)
            && self.base.keep_loop_alive.swap(false, Ordering::AcqRel)
        {
            self.base.loop_keep_alive_count.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Whether the watcher is currently started.
    pub fn is_active(&self) -> bool {
        self.base.active.load(Ordering::Acquire)
    }

    /// Start the watcher (spec: attach/start). Idempotent.
    pub fn start(&self) {
        if !self.base.active.swap(true, Ordering::AcqRel)
            && self.base.keep_loop_alive.load(Ordering::Acquire)
        {
            self.base.loop_keep_alive_count.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Stop the watcher (spec: stop/detach). Idempotent.
    pub fn stop(&self) {
        if self.base.active.swap(false, Ordering::AcqRel)
            && self.base.keep_loop_alive.load(Ordering::Acquire)
        {
            self.base.loop_keep_alive_count.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

impl fmt::Display for Watcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self.kind, self.base.name)
    }
}

/// Per-loop counter of watchers currently keeping the loop alive.
#[derive(Debug, Default)]
pub(crate) struct KeepAliveRegistry {
    count: Arc<AtomicUsize>,
}

impl KeepAliveRegistry {
    pub(crate) fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starting_a_keep_alive_watcher_increments_registry() {
        let reg = KeepAliveRegistry::default();
        let w = Watcher::new(&reg, WatcherKind::Io, "socket", true);
        assert_eq!(reg.count(), 0);
        w.start();
        assert_eq!(reg.count(), 1);
        w.stop();
        assert_eq!(reg.count(), 0);
    }

    #[test]
    fn optional_watchers_never_count() {
        let reg = KeepAliveRegistry::default();
        let w = Watcher::new(&reg, WatcherKind::Timer, "stats-tick", false);
        w.start();
        assert_eq!(reg.count(), 0);
    }

    #[test]
    fn clearing_keep_alive_while_active_decrements_immediately() {
        let reg = KeepAliveRegistry::default();
        let w = Watcher::new(&reg, WatcherKind::Io, "socket", true);
        w.start();
        assert_eq!(reg.count(), 1);
        w.clear_keep_loop_alive();
        assert_eq!(reg.count(), 0);
        // stopping afterward must not double-decrement
        w.stop();
        assert_eq!(reg.count(), 0);
    }

    #[test]
    fn dropping_an_active_keep_alive_watcher_releases_the_count() {
        let reg = KeepAliveRegistry::default();
        {
            let w = Watcher::new(&reg, WatcherKind::Io, "socket", true);
            w.start();
            assert_eq!(reg.count(), 1);
        }
        assert_eq!(reg.count(), 0);
    }
}
