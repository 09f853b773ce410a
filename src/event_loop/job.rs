//! Job queue (spec §4.2): a cooperative, single-thread work queue attached
//! to a [`Loop`](super::Loop).
//!
//! `job_later` resumes at the next loop iteration, `job_now` resumes as soon
//! as possible within the same iteration, and a [`JobRef`] is a handle that
//! can be held across threads; `JobRef::async_signal` posts it back to the
//! owning loop. This mirrors the teacher's split between same-thread
//! scheduling (`common/exec.rs` `Exec::execute`) and cross-thread wakeups
//! (`want`, `futures-channel`), generalized to the explicit FIFO semantics
//! spec §4.2 and §5 require: within one loop turn jobs run FIFO, and a job
//! that re-posts itself yields to others first.
//!
//! Jobs themselves (a VR, a stream) are pinned to their owning worker thread
//! and are not `Send`. A [`JobRef`] therefore does not carry the job across
//! threads — it carries a plain integer token registered on the owning
//! thread; `async_signal` sends just that token over an MPSC channel, and
//! the owning loop looks the job back up in its local registry before
//! running it. This is the same indirection the source uses: the async
//! watcher only *wakes* the target worker, the VR/stream referenced never
//! moves.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use tokio::sync::{mpsc, Notify};

/// A unit of deferred work, registered once and potentially re-posted many
/// times (spec: "a job that re-posts itself yields to others first").
pub trait Job {
    /// Run the job. Called on the worker thread that owns the queue.
    fn run(&self);
}

type BoxJob = std::rc::Rc<dyn Job>;

#[derive(Default)]
struct Inner {
    later: VecDeque<BoxJob>,
    now: VecDeque<BoxJob>,
    registry: HashMap<u64, BoxJob>,
    next_token: u64,
}

/// Per-worker job queue. Not `Send`; lives on the worker thread inside its
/// [`Loop`](super::Loop).
pub struct JobQueue {
    inner: RefCell<Inner>,
    async_tx: mpsc::UnboundedSender<u64>,
    async_rx: RefCell<mpsc::UnboundedReceiver<u64>>,
    /// The owning [`Loop`](super::Loop)'s wakeup doorbell, shared so a
    /// [`JobRef::async_signal`] call from another thread doesn't just sit
    /// in `async_tx` until something unrelated happens to poll `run()`.
    wakeup: Arc<Notify>,
}

impl fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("JobQueue")
            .field("later_len", &inner.later.len())
            .field("now_len", &inner.now.len())
            .field("registered", &inner.registry.len())
            .finish()
    }
}

impl JobQueue {
    pub(crate) fn new(wakeup: Arc<Notify>) -> JobQueue {
        let (async_tx, async_rx) = mpsc::unbounded_channel();
        JobQueue {
            inner: RefCell::new(Inner::default()),
            async_tx,
            async_rx: RefCell::new(async_rx),
            wakeup,
        }
    }

    /// Schedule `job` to resume at the next loop iteration.
    pub fn job_later(&self, job: BoxJob) {
        self.inner.borrow_mut().later.push_back(job);
    }

    /// Schedule `job` to resume as soon as possible, within the current
    /// iteration if this call happens during a drain.
    pub fn job_now(&self, job: BoxJob) {
        self.inner.borrow_mut().now.push_back(job);
    }

    /// Register `job` under a fresh token and return a cross-thread handle
    /// for it. The job stays registered (and alive) until
    /// [`unregister`](Self::unregister) is called with the same token —
    /// typically on VR reset or stream destroy.
    pub fn register(&self, job: BoxJob) -> JobRef {
        let mut inner = self.inner.borrow_mut();
        let token = inner.next_token;
        inner.next_token += 1;
        inner.registry.insert(token, job);
        JobRef {
            token,
            sender: self.async_tx.clone(),
            wakeup: self.wakeup.clone(),
        }
    }

    /// Drop a previously registered job from the registry.
    pub fn unregister(&self, token: u64) {
        self.inner.borrow_mut().registry.remove(&token);
    }

    /// Pull any tokens posted asynchronously from other threads, resolve
    /// them against the local registry, and push the resolved jobs onto
    /// `now`. Called once per loop iteration before draining.
    fn absorb_async(&self) {
        let mut rx = self.async_rx.borrow_mut();
        let mut inner = self.inner.borrow_mut();
        while let Ok(token) = rx.try_recv() {
            if let Some(job) = inner.registry.get(&token).cloned() {
                inner.now.push_back(job);
            }
        }
    }

    /// Run every job currently queued, FIFO, including any `now` jobs
    /// re-posted while draining (but not jobs posted via `job_later` during
    /// this drain — those wait for the next iteration, per spec §4.2/§5
    /// ordering guarantees).
    pub fn run_pending(&self) {
        self.absorb_async();

        loop {
            let job = {
                let mut inner = self.inner.borrow_mut();
                inner.now.pop_front()
            };
            match job {
                Some(job) => job.run(),
                None => break,
            }
        }

        let later = {
            let mut inner = self.inner.borrow_mut();
            std::mem::take(&mut inner.later)
        };
        for job in later {
            job.run();
        }
    }

    /// True if there is nothing left to run this turn.
    pub fn is_empty(&self) -> bool {
        let inner = self.inner.borrow();
        inner.later.is_empty() && inner.now.is_empty()
    }
}

/// A cross-thread-safe handle back to a single registered job on a
/// [`JobQueue`] (spec §4.2 `async_signal`).
#[derive(Clone)]
pub struct JobRef {
    token: u64,
    sender: mpsc::UnboundedSender<u64>,
    wakeup: Arc<Notify>,
}

impl fmt::Debug for JobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRef").field("token", &self.token).finish()
    }
}

impl JobRef {
    /// Post this handle's job to the owning loop's queue from any thread.
    /// The owning worker wakes and runs the job on its next iteration. A
    /// closed receiver (worker shut down) drops the signal silently, per
    /// spec §5 "worker-level errors never propagate up and never stop the
    /// worker".
    pub fn async_signal(&self) {
        let _ = self.sender.send(self.token);
        self.wakeup.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    struct CountingJob {
        order: Rc<RefCell<Vec<&'static str>>>,
        label: &'static str,
    }

    impl Job for CountingJob {
        fn run(&self) {
            self.order.borrow_mut().push(self.label);
        }
    }

    #[test]
    fn later_jobs_run_fifo_after_now_jobs() {
        let q = JobQueue::new(std::sync::Arc::new(tokio::sync::Notify::new()));
        let order = Rc::new(RefCell::new(Vec::new()));

        q.job_later(Rc::new(CountingJob {
            order: order.clone(),
            label: "later-1",
        }));
        q.job_now(Rc::new(CountingJob {
            order: order.clone(),
            label: "now-1",
        }));
        q.job_later(Rc::new(CountingJob {
            order: order.clone(),
            label: "later-2",
        }));

        q.run_pending();

        assert_eq!(*order.borrow(), vec!["now-1", "later-1", "later-2"]);
    }

    struct RepostingJob {
        ran: Rc<Cell<u32>>,
    }

    impl Job for RepostingJob {
        fn run(&self) {
            self.ran.set(self.ran.get() + 1);
        }
    }

    #[test]
    fn reposting_a_job_yields_to_jobs_already_queued() {
        let q = JobQueue::new(std::sync::Arc::new(tokio::sync::Notify::new()));
        let ran = Rc::new(Cell::new(0));
        let order = Rc::new(RefCell::new(Vec::new()));

        let repost = Rc::new(RepostingJob { ran: ran.clone() });
        q.job_now(repost.clone());
        q.job_now(Rc::new(CountingJob {
            order: order.clone(),
            label: "peer",
        }));

        q.run_pending();
        assert_eq!(ran.get(), 1);
        assert_eq!(*order.borrow(), vec!["peer"]);
    }

    #[test]
    fn async_signal_is_absorbed_on_next_run() {
        let q = JobQueue::new(std::sync::Arc::new(tokio::sync::Notify::new()));
        let order = Rc::new(RefCell::new(Vec::new()));
        let job_ref = q.register(Rc::new(CountingJob {
            order: order.clone(),
            label: "cross-thread",
        }));

        job_ref.async_signal();

        q.run_pending();
        assert_eq!(*order.borrow(), vec!["cross-thread"]);
    }

    #[test]
    fn unregistered_token_is_ignored() {
        let q = JobQueue::new(std::sync::Arc::new(tokio::sync::Notify::new()));
        let order = Rc::new(RefCell::new(Vec::new()));
        let job_ref = q.register(Rc::new(CountingJob {
            order: order.clone(),
            label: "gone",
        }));
        q.unregister(job_ref.token);

        job_ref.async_signal();
        q.run_pending();

        assert!(order.borrow().is_empty());
    }
}
