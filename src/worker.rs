//! Worker (spec §4.8): per-thread state — the event loop, the connection
//! registry, the keep-alive and IO-timeout bookkeeping, the per-worker
//! [`StatCache`], and the four lifecycle signals a server process posts to
//! each of its N+1 workers from the main thread.
//!
//! Grounded in the teacher's connection-pool idle/idle-interval bookkeeping
//! (`client::pool::Pool`: a deque of idle connections plus an interval that
//! sweeps expired ones) generalized to spec §4.8's richer per-worker state.
//! One structural departure from a literal port: the C source shares a
//! single mutable `liConnection` array across the worker's callbacks, which
//! in Rust would mean a `Connection` reachable (and mutably borrowable)
//! from both its own per-connection task *and* the worker's periodic
//! sweeps. Rather than wrap every connection in a `RefCell` and risk a
//! borrow panic when a sweep fires while a connection's task is suspended
//! mid-await (holding a live borrow across the suspension point), each
//! connection is owned outright by the task driving it; the worker keeps
//! only cheap, `Cell`/`Notify`-based handles (a "force close" flag, a
//! resume doorbell) to reach into it. This is the same cooperative-flag
//! idiom the teacher's own graceful-shutdown watcher uses, just applied per
//! connection instead of per pool.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Notify};
use tokio::time::MissedTickBehavior;

use crate::config::action::Action;
use crate::connection::{ConnState, Connection, RequestDecoder};
use crate::event_loop::job::{Job, JobRef};
use crate::event_loop::watcher::{Watcher, WatcherKind};
use crate::event_loop::Loop;
use crate::stat_cache::StatCache;
use crate::wait_queue::WaitQueue;

#[cfg(feature = "tls")]
use rustls::ServerConfig;

/// Default `io.timeout` (spec §5 "Timeouts": "IO-timeout (global, per
/// server, default 300s)").
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(300);
/// How often the worker sweeps for IO-timeout expiry. The source drives
/// this off the shared wait-queue's own `update()` re-arm; we just poll at
/// a fixed cadence well under the timeout itself.
const IO_TIMEOUT_SWEEP: Duration = Duration::from_millis(500);
/// Stats watcher cadence (spec §4.8 "fires once per second").
const STATS_TICK: Duration = Duration::from_secs(1);
/// Free-list GC cadence (spec §4.8 parenthetical, supplemented feature B.2).
const FREE_LIST_GC_INTERVAL: Duration = Duration::from_secs(300);

/// A freshly `accept()`-ed socket, already resolved to its peer/local
/// address, on its way to whichever worker `dispatch_connection` picks
/// (spec §4.7 `worker_new_con`).
pub struct AcceptedSocket {
    pub socket: tokio::net::TcpStream,
    pub remote_addr: String,
    pub local_addr: String,
}

/// The four lifecycle signals spec §4.8 describes as "async watchers that
/// signal the worker from another thread", plus the one way to hand off a
/// freshly accepted socket.
pub enum WorkerMsg {
    Accept(AcceptedSocket),
    /// `worker_stop_watcher`: finish in-flight requests, then exit.
    SoftStop,
    /// `worker_stopping_watcher`: stop accepting new connections and close
    /// out the keep-alive deque immediately.
    Stopping,
    /// `worker_suspend_watcher`.
    Suspend,
    /// Undo a prior `Suspend`.
    Resume,
    /// `worker_exit_watcher`: break the loop unconditionally.
    Exit,
}

/// A `Send` handle a dispatcher (or the supervisor) holds for a worker it
/// does not own. Dispatch picks the worker with the lowest
/// [`WorkerHandle::load`] (spec §4.8 "find worker with minimum
/// connection_load").
#[derive(Clone)]
pub struct WorkerHandle {
    load: Arc<AtomicUsize>,
    tx: mpsc::UnboundedSender<WorkerMsg>,
}

impl WorkerHandle {
    /// This worker's current connection count, as tracked by
    /// [`dispatch_connection`]/[`Worker::release_slot`] (spec §4.8
    /// "incremented on dispatch, decremented on `con_put`").
    pub fn load(&self) -> usize {
        self.load.load(Ordering::Acquire)
    }

    fn send(&self, msg: WorkerMsg) {
        let _ = self.tx.send(msg);
    }

    pub fn soft_stop(&self) {
        self.send(WorkerMsg::SoftStop);
    }

    pub fn stopping(&self) {
        self.send(WorkerMsg::Stopping);
    }

    pub fn suspend(&self) {
        self.send(WorkerMsg::Suspend);
    }

    pub fn resume(&self) {
        self.send(WorkerMsg::Resume);
    }

    pub fn exit(&self) {
        self.send(WorkerMsg::Exit);
    }
}

/// Pick the worker with the lowest reported load and hand it `socket`
/// (spec §4.7 "accept on the main worker's loop; for each accepted fd find
/// worker with minimum `connection_load` and dispatch via async queue").
/// Returns the chosen index, or gives the socket back if every worker's
/// channel has hung up.
pub fn dispatch_connection(workers: &[WorkerHandle], socket: AcceptedSocket) -> Result<usize, AcceptedSocket> {
    let Some((idx, handle)) = workers.iter().enumerate().min_by_key(|(_, w)| w.load()) else {
        return Err(socket);
    };
    handle.load.fetch_add(1, Ordering::AcqRel);
    match handle.tx.send(WorkerMsg::Accept(socket)) {
        Ok(()) => Ok(idx),
        Err(mpsc::error::SendError(WorkerMsg::Accept(socket))) => {
            handle.load.fetch_sub(1, Ordering::AcqRel);
            Err(socket)
        }
        Err(_) => unreachable!("SendError always carries back the message we sent"),
    }
}

/// Per-worker config a server hands every spawned worker thread (spec
/// §6.6 keys `io.throttle*` aside — those attach per-connection, not
/// per-worker; this is just the bit of context a worker needs to build
/// connections and run their action tree).
pub struct WorkerConfig {
    pub io_timeout: Duration,
    pub keep_alive_idle: Duration,
    pub stat_cache_ttl: Option<Duration>,
    pub use_proxy_protocol: bool,
    pub root_action: Arc<Action>,
    pub decoder_factory: Box<dyn Fn() -> Box<dyn RequestDecoder>>,
    #[cfg(feature = "tls")]
    pub tls_config: Option<Arc<ServerConfig>>,
}

impl WorkerConfig {
    pub fn new(root_action: Arc<Action>, decoder_factory: Box<dyn Fn() -> Box<dyn RequestDecoder>>) -> WorkerConfig {
        WorkerConfig {
            io_timeout: DEFAULT_IO_TIMEOUT,
            keep_alive_idle: Duration::from_secs(5),
            stat_cache_ttl: None,
            use_proxy_protocol: false,
            root_action,
            decoder_factory,
            #[cfg(feature = "tls")]
            tls_config: None,
        }
    }
}

/// 5-second rolling throughput + request/connection counters (spec §4.8
/// "fires once per second to update 5-second rolling averages and peaks
/// for bytes_in, bytes_out, requests, active connections").
#[derive(Debug, Default, Clone, Copy)]
pub struct WorkerStats {
    pub requests_total: u64,
    pub bytes_in_total: u64,
    pub bytes_out_total: u64,
    avg_requests_per_sec: f64,
    avg_in_per_sec: f64,
    avg_out_per_sec: f64,
    last_requests: u64,
    last_bytes_in: u64,
    last_bytes_out: u64,
    pub peak_active: usize,
}

impl WorkerStats {
    const DECAY: f64 = 0.2;

    fn tick(&mut self, active: usize) {
        let d_req = self.requests_total - self.last_requests;
        let d_in = self.bytes_in_total - self.last_bytes_in;
        let d_out = self.bytes_out_total - self.last_bytes_out;
        self.last_requests = self.requests_total;
        self.last_bytes_in = self.bytes_in_total;
        self.last_bytes_out = self.bytes_out_total;
        self.avg_requests_per_sec += (d_req as f64 - self.avg_requests_per_sec) * Self::DECAY;
        self.avg_in_per_sec += (d_in as f64 - self.avg_in_per_sec) * Self::DECAY;
        self.avg_out_per_sec += (d_out as f64 - self.avg_out_per_sec) * Self::DECAY;
        self.peak_active = self.peak_active.max(active);
    }

    pub fn requests_per_5s(&self) -> f64 {
        self.avg_requests_per_sec * 5.0
    }

    pub fn bytes_in_per_5s(&self) -> f64 {
        self.avg_in_per_sec * 5.0
    }

    pub fn bytes_out_per_5s(&self) -> f64 {
        self.avg_out_per_sec * 5.0
    }
}

/// Lightweight per-connection handles the worker keeps so its periodic
/// sweeps can reach into a connection's owning task without ever touching
/// the `Connection` value itself.
struct ConnHandle {
    force_close: Rc<Cell<bool>>,
    resume: Rc<Notify>,
    /// Bumped on every read/write so a stale IO-timeout sweep entry can be
    /// told apart from a fresh one without removing it from the middle of
    /// the queue (spec §4.3 "O(1) per element" — see `touch_io_timeout`).
    io_generation: Cell<u64>,
}

/// Per-worker state (spec §4.8 `liWorker`): one per worker thread, plus
/// the main worker, which additionally owns the listening sockets (out of
/// this crate's scope — see spec §1, listener management is server
/// plumbing, not core).
pub struct Worker {
    pub loop_: Rc<Loop>,
    config: WorkerConfig,
    handles: RefCell<HashMap<usize, ConnHandle>>,
    next_id: Cell<usize>,
    active: Cell<usize>,
    io_timeout_queue: RefCell<WaitQueue<(usize, u64)>>,
    keep_alive_queue: RefCell<WaitQueue<usize>>,
    pub stat_cache: Rc<StatCache>,
    load: Arc<AtomicUsize>,
    stats: RefCell<WorkerStats>,
    soft_stop: Cell<bool>,
    stop_accepting: Cell<bool>,
    suspended: Cell<bool>,
    high_water_5m: Cell<usize>,
    /// Keeps the loop from considering itself drained for the worker's
    /// entire active lifetime (spec §4.1 `keep_loop_alive`). Without this,
    /// `Loop::run` would tear down the whole dispatch future the first time
    /// an unrelated `JobRef::async_signal` wakes it while no watcher
    /// happens to be registered — a worker with zero open connections is
    /// still a worker that should keep accepting new ones.
    alive_watcher: Watcher,
}

struct ResumeJob {
    resume: Rc<Notify>,
}

impl Job for ResumeJob {
    fn run(&self) {
        self.resume.notify_one();
    }
}

impl Worker {
    /// Build a new worker sharing `load` with whatever [`WorkerHandle`] the
    /// dispatcher was given for it (see [`spawn_worker`]).
    pub fn new(config: WorkerConfig, load: Arc<AtomicUsize>) -> std::io::Result<Rc<Worker>> {
        let loop_ = Rc::new(Loop::new()?);
        Ok(Rc::new(Worker {
            loop_,
            io_timeout_queue: RefCell::new(WaitQueue::new(config.io_timeout)),
            keep_alive_queue: RefCell::new(WaitQueue::new(config.keep_alive_idle)),
            stat_cache: Rc::new(StatCache::new(config.stat_cache_ttl)),
            config,
            handles: RefCell::new(HashMap::new()),
            next_id: Cell::new(0),
            active: Cell::new(0),
            load,
            stats: RefCell::new(WorkerStats::default()),
            soft_stop: Cell::new(false),
            stop_accepting: Cell::new(false),
            suspended: Cell::new(false),
            high_water_5m: Cell::new(0),
        }))
    }

    /// Number of connections this worker currently owns (spec §4.8
    /// "connection array + active count").
    pub fn active_count(&self) -> usize {
        self.active.get()
    }

    pub fn stats(&self) -> WorkerStats {
        *self.stats.borrow()
    }

    fn alloc_id(&self) -> usize {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        id
    }

    /// Retract-then-repush by generation bump (spec §4.7 "every read/write
    /// resets the IOTimeout wait-queue entry", §4.3 "O(1) per element").
    /// Rather than splice the entry out of the middle of the queue, we bump
    /// a per-connection generation counter and push a fresh `(id, gen)`
    /// pair; [`sweep_io_timeouts`] discards any popped entry whose
    /// generation is stale, so only the most recent touch can ever fire.
    pub fn touch_io_timeout(&self, id: usize) {
        let Some(handle) = self.handles.borrow().get(&id).map(|h| h.io_generation.clone()) else {
            return;
        };
        let gen = handle.get() + 1;
        handle.set(gen);
        self.io_timeout_queue.borrow_mut().push((id, gen));
    }

    /// Pop every IO-timeout entry whose delay has elapsed, force-closing
    /// any connection whose generation still matches (i.e. that has seen
    /// no read/write since the entry was queued). Returns the ids closed.
    pub fn sweep_io_timeouts(&self, now: Instant) -> Vec<usize> {
        let expired = self.io_timeout_queue.borrow_mut().pop_expired_at(now);
        let mut closed = Vec::new();
        let handles = self.handles.borrow();
        for (id, gen) in expired {
            if let Some(handle) = handles.get(&id) {
                if handle.io_generation.get() == gen {
                    handle.force_close.set(true);
                    handle.resume.notify_one();
                    closed.push(id);
                }
            }
        }
        closed
    }

    /// Record that a connection entered the keep-alive deque (spec §3.5
    /// `keep_alive_data`, §4.7). The actual idle-timeout enforcement is
    /// driven locally by the connection's own driving task, which already
    /// holds the exact deadline `Connection::try_enter_keep_alive`
    /// computed; this queue exists so the worker has the same view spec
    /// §4.8 describes ("keep-alive deque, sorted by deadline") for
    /// introspection/stats and so [`sweep_keep_alive`] can force-close a
    /// connection whose task has gone unresponsive.
    pub fn note_keep_alive(&self, id: usize) {
        self.keep_alive_queue.borrow_mut().push(id);
    }

    pub fn sweep_keep_alive(&self, now: Instant) -> Vec<usize> {
        let expired = self.keep_alive_queue.borrow_mut().pop_expired_at(now);
        let handles = self.handles.borrow();
        let mut closed = Vec::new();
        for id in expired {
            if let Some(handle) = handles.get(&id) {
                handle.force_close.set(true);
                handle.resume.notify_one();
                closed.push(id);
            }
        }
        closed
    }

    /// Stats watcher (spec §4.8 "fires once per second").
    pub fn tick_stats(&self, _now: Instant) {
        self.stats.borrow_mut().tick(self.active.get());
    }

    pub fn record_request(&self) {
        self.stats.borrow_mut().requests_total += 1;
    }

    pub fn record_bytes_in(&self, n: u64) {
        self.stats.borrow_mut().bytes_in_total += n;
    }

    pub fn record_bytes_out(&self, n: u64) {
        self.stats.borrow_mut().bytes_out_total += n;
    }

    /// Free-list GC (spec §4.8 parenthetical, supplemented feature B.2):
    /// since slots are released the instant a connection's task ends
    /// (nothing is actually pooled for reuse — the `Connection` itself is
    /// cheap to allocate and `tokio` tasks are cheap to spawn), there is no
    /// literal free list to shrink. We keep the high-water-mark tracking
    /// spec'd for it so a future pooling layer has the number to shrink
    /// against, and so [`Worker::high_water_mark`] is observable/testable.
    pub fn gc_free_list(&self, _now: Instant) {
        self.high_water_5m.set(self.active.get().max(0));
    }

    pub fn high_water_mark(&self) -> usize {
        self.high_water_5m.get()
    }

    fn register_slot(&self) -> (usize, Rc<Cell<bool>>, Rc<Notify>) {
        let id = self.alloc_id();
        let force_close = Rc::new(Cell::new(false));
        let resume = Rc::new(Notify::new());
        self.handles.borrow_mut().insert(
            id,
            ConnHandle {
                force_close: force_close.clone(),
                resume: resume.clone(),
                io_generation: Cell::new(0),
            },
        );
        self.active.set(self.active.get() + 1);
        (id, force_close, resume)
    }

    /// A connection's task is done; release its bookkeeping slot and the
    /// load-counter share the dispatcher incremented on its behalf (spec
    /// §4.8 "decremented on `con_put`").
    fn release_slot(&self, id: usize) {
        self.handles.borrow_mut().remove(&id);
        self.active.set(self.active.get().saturating_sub(1));
        self.load.fetch_sub(1, Ordering::AcqRel);
    }

    /// Accept path (spec §4.7 `worker_new_con` on the target worker): pull
    /// a fresh slot, build the `Connection`, and spawn its driving task.
    pub fn accept(self: Rc<Self>, accepted: AcceptedSocket) {
        if self.stop_accepting.get() || self.suspended.get() {
            self.load.fetch_sub(1, Ordering::AcqRel);
            return;
        }
        let (id, force_close, resume) = self.register_slot();
        let job = self.loop_.jobs().register(Rc::new(ResumeJob { resume: resume.clone() }));
        let decoder = (self.config.decoder_factory)();

        #[cfg(feature = "tls")]
        let built = match self.config.tls_config.clone() {
            Some(tls_config) => Connection::new_tls(accepted.socket, job, decoder, self.config.use_proxy_protocol, tls_config, |_sni: &str| {}),
            None => Ok(Connection::new(accepted.socket, job, decoder, self.config.use_proxy_protocol)),
        };
        #[cfg(not(feature = "tls"))]
        let built: Result<Connection, ()> = Ok(Connection::new(accepted.socket, job, decoder, self.config.use_proxy_protocol));

        let mut conn = match built {
            Ok(conn) => conn,
            Err(_) => {
                self.release_slot(id);
                return;
            }
        };
        conn.set_remote_addr(accepted.remote_addr, accepted.local_addr);

        self.touch_io_timeout(id);
        let worker = self.clone();
        self.loop_.spawn_local(async move {
            worker.drive(id, conn, force_close, resume).await;
        });
    }

    /// The per-connection driving task: races socket readiness against the
    /// resume doorbell (fired either by a suspended VR's collaborator via
    /// `JobRef::async_signal`, or by one of this worker's own timeout
    /// sweeps setting `force_close`), and steps the connection's state
    /// machine synchronously in response — never holding a borrow of
    /// anything shared across an `.await` point (see the module doc for
    /// why that matters here).
    async fn drive(self: Rc<Self>, id: usize, mut conn: Connection, force_close: Rc<Cell<bool>>, resume: Rc<Notify>) {
        loop {
            if force_close.get() {
                break;
            }

            let awaiting_request = matches!(conn.state, ConnState::RequestStart | ConnState::ReadRequestHeader | ConnState::KeepAlive);
            let pending_write = matches!(conn.state, ConnState::Write) && !conn.is_write_complete();

            enum Woke {
                Read(std::io::Result<usize>),
                Write(std::io::Result<usize>),
                Resumed,
            }

            let woke = tokio::select! {
                biased;
                _ = resume.notified() => Woke::Resumed,
                r = conn.pump_read(), if awaiting_request => Woke::Read(r),
                w = conn.pump_write(), if pending_write => Woke::Write(w),
            };

            match woke {
                Woke::Resumed => {
                    if force_close.get() {
                        break;
                    }
                    let result = conn.resume(Instant::now());
                    self.after_action(id, &mut conn, result);
                }
                Woke::Read(Ok(0)) => break,
                Woke::Read(Ok(n)) => {
                    self.record_bytes_in(n as u64);
                    self.touch_io_timeout(id);
                    match conn.feed_parser() {
                        Ok(true) => {
                            self.record_request();
                            let result = conn.begin_request(self.config.root_action.clone(), Instant::now());
                            self.after_action(id, &mut conn, result);
                        }
                        Ok(false) => {}
                        Err(_) => break,
                    }
                }
                Woke::Read(Err(_)) => break,
                Woke::Write(Ok(n)) => {
                    self.record_bytes_out(n as u64);
                    self.touch_io_timeout(id);
                }
                Woke::Write(Err(_)) => break,
            }

            if conn.is_write_complete() {
                if conn.try_enter_keep_alive(Instant::now(), self.config.keep_alive_idle) {
                    self.note_keep_alive(id);
                    continue;
                }
                break;
            }
        }
        self.release_slot(id);
    }

    fn after_action(&self, id: usize, conn: &mut Connection, result: crate::config::ActionResult) {
        if result == crate::config::ActionResult::Error {
            debug!("worker: vr {} entered Error state", id);
            conn.handle_error(Instant::now());
        }
    }

    /// `worker_stop_watcher`: stop taking new work but let in-flight
    /// requests finish.
    pub fn soft_stop(&self) {
        self.soft_stop.set(true);
        self.stop_accepting.set(true);
    }

    /// `worker_stopping_watcher`: stop accepting and force every
    /// currently-idle keep-alive connection closed immediately (spec §4.8).
    pub fn stopping(&self) {
        self.stop_accepting.set(true);
        for id in self.sweep_keep_alive(Instant::now() + self.config.keep_alive_idle) {
            let _ = id;
        }
        let handles = self.handles.borrow();
        for handle in handles.values() {
            handle.force_close.set(true);
            handle.resume.notify_one();
        }
    }

    pub fn suspend(&self) {
        self.suspended.set(true);
    }

    pub fn resume_accepting(&self) {
        self.suspended.set(false);
    }

    pub fn is_idle_and_stopped(&self) -> bool {
        self.soft_stop.get() && self.active_count() == 0
    }

    /// Drive this worker's loop to completion, consuming lifecycle
    /// messages from its `WorkerHandle` counterpart and running the
    /// periodic sweeps (spec §4.8).
    pub fn run(self: Rc<Self>, mut rx: mpsc::UnboundedReceiver<WorkerMsg>) {
        let loop_ = self.loop_.clone();
        let worker = self.clone();
        loop_.run(async move {
            let mut stats_tick = tokio::time::interval(STATS_TICK);
            stats_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut timeout_tick = tokio::time::interval(IO_TIMEOUT_SWEEP);
            timeout_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut gc_tick = tokio::time::interval(FREE_LIST_GC_INTERVAL);
            gc_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    msg = rx.recv() => {
                        match msg {
                            Some(WorkerMsg::Accept(sock)) => Rc::clone(&worker).accept(sock),
                            Some(WorkerMsg::SoftStop) => worker.soft_stop(),
                            Some(WorkerMsg::Stopping) => worker.stopping(),
                            Some(WorkerMsg::Suspend) => worker.suspend(),
                            Some(WorkerMsg::Resume) => worker.resume_accepting(),
                            Some(WorkerMsg::Exit) | None => break,
                        }
                    }
                    _ = stats_tick.tick() => worker.tick_stats(Instant::now()),
                    _ = timeout_tick.tick() => { worker.sweep_io_timeouts(Instant::now()); }
                    _ = gc_tick.tick() => worker.gc_free_list(Instant::now()),
                }
                if worker.is_idle_and_stopped() {
                    break;
                }
            }
        });
    }
}

/// Spawn a worker on its own OS thread (spec §4.8 "thread handle"; §2
/// "each owning its own event loop on a dedicated thread"). Returns the
/// `Send` handle a dispatcher uses to reach it plus the thread's
/// `JoinHandle`.
pub fn spawn_worker(
    build_config: impl FnOnce() -> WorkerConfig + Send + 'static,
) -> (WorkerHandle, std::thread::JoinHandle<()>) {
    let load = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = WorkerHandle { load: load.clone(), tx };
    let join = std::thread::Builder::new()
        .name("lighttpd2-worker".to_string())
        .spawn(move || {
            let config = build_config();
            let worker = Worker::new(config, load).expect("build per-worker event loop");
            worker.run(rx);
        })
        .expect("spawn worker thread");
    (handle, join)
}
