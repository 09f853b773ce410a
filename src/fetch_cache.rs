//! Fetch cache (spec §4.17): a generic, coalesced, LRU-bounded cache for
//! results of an expensive async lookup (DNS, backend health, external
//! auth — anything keyed and worth not repeating).
//!
//! Grounded in the teacher's C sibling `common/fetch.c`: separate LRU
//! queues for positive and negative results with independent size caps,
//! an explicit `refresh` path that keeps serving the old value while a
//! new one is fetched, and a wait-queue of callers blocked on an in-flight
//! fetch. The C version's callback-based wakeup queue (`liFetchWaitElement`
//! / `wakeup_jobs`) becomes ordinary `tokio::sync::Notify`-based task
//! suspension, the same pattern used in [`crate::stat_cache`].
//!
//! Open question (spec §9): what happens if `invalidate` is called while
//! a `refresh` is in flight for the same key. We decide: `invalidate`
//! always wins immediately — the entry is dropped from the cache right
//! away, and when the in-flight refresh completes its result is discarded
//! (checked via a per-entry generation counter) rather than reinserted.
//! This matches the "invalidate means gone now" reading a cache caller
//! reasonably expects, at the cost of a wasted fetch already in flight.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::hash::Hash;
use std::rc::Rc;

use tokio::sync::Notify;

enum Data<V> {
    Positive(Rc<V>),
    Negative,
}

enum State {
    Pending,
    Valid,
    RefreshOld,
}

struct Entry<V> {
    data: RefCell<Option<Data<V>>>,
    state: RefCell<State>,
    notify: Notify,
    generation: std::cell::Cell<u64>,
}

/// A generic, size-bounded, coalesced async lookup cache (spec §4.17
/// `FetchDatabase`).
pub struct FetchCache<K, V> {
    cache_size: usize,
    neg_cache_size: usize,
    entries: RefCell<HashMap<K, Rc<Entry<V>>>>,
    order: RefCell<VecDeque<K>>,
    neg_order: RefCell<VecDeque<K>>,
}

impl<K: Eq + Hash + Clone, V> FetchCache<K, V> {
    pub fn new(cache_size: usize, neg_cache_size: usize) -> FetchCache<K, V> {
        FetchCache {
            cache_size,
            neg_cache_size,
            entries: RefCell::new(HashMap::new()),
            order: RefCell::new(VecDeque::new()),
            neg_order: RefCell::new(VecDeque::new()),
        }
    }

    fn touch(&self, key: &K, positive: bool) {
        let mut order = if positive { self.order.borrow_mut() } else { self.neg_order.borrow_mut() };
        if let Some(pos) = order.iter().position(|k| k == key) {
            order.remove(pos);
        }
        order.push_back(key.clone());
        let limit = if positive { self.cache_size } else { self.neg_cache_size };
        while order.len() > limit {
            if let Some(evict) = order.pop_front() {
                drop(order);
                self.entries.borrow_mut().remove(&evict);
                order = if positive { self.order.borrow_mut() } else { self.neg_order.borrow_mut() };
            } else {
                break;
            }
        }
    }

    /// Look up `key`, computing it with `fetch` on a miss. Concurrent
    /// lookups of the same pending key coalesce onto the single fetch.
    pub async fn get_or_fetch<F, Fut>(&self, key: K, fetch: F) -> Option<Rc<V>>
    where
        F: FnOnce(K) -> Fut,
        Fut: Future<Output = Option<V>>,
    {
        let existing = self.entries.borrow().get(&key).cloned();
        let entry = match existing {
            Some(entry) => entry,
            None => {
                let entry = Rc::new(Entry {
                    data: RefCell::new(None),
                    state: RefCell::new(State::Pending),
                    notify: Notify::new(),
                    generation: std::cell::Cell::new(0),
                });
                self.entries.borrow_mut().insert(key.clone(), entry.clone());
                let gen = entry.generation.get();
                let result = fetch(key.clone()).await;
                self.complete(&key, &entry, gen, result);
                entry
            }
        };

        loop {
            let notified = entry.notify.notified();
            if matches!(&*entry.state.borrow(), State::Valid | State::RefreshOld) {
                break;
            }
            notified.await;
        }
        match &*entry.data.borrow() {
            Some(Data::Positive(v)) => Some(v.clone()),
            _ => None,
        }
    }

    fn complete(&self, key: &K, entry: &Rc<Entry<V>>, generation: u64, result: Option<V>) {
        if entry.generation.get() != generation {
            // invalidated (or superseded by another refresh) while in flight
            return;
        }
        *entry.data.borrow_mut() = match result {
            Some(v) => Some(Data::Positive(Rc::new(v))),
            None => Some(Data::Negative),
        };
        let positive = matches!(&*entry.data.borrow(), Some(Data::Positive(_)));
        *entry.state.borrow_mut() = State::Valid;
        self.touch(key, positive);
        entry.notify.notify_waiters();
    }

    /// Re-run the fetch for an already-cached `key`, continuing to serve
    /// the old value to concurrent lookups until the new one lands (spec:
    /// `RefreshOld` state).
    pub async fn refresh<F, Fut>(&self, key: K, fetch: F)
    where
        F: FnOnce(K) -> Fut,
        Fut: Future<Output = Option<V>>,
    {
        let entry = match self.entries.borrow().get(&key).cloned() {
            Some(e) => e,
            None => return,
        };
        *entry.state.borrow_mut() = State::RefreshOld;
        let gen = entry.generation.get();
        let result = fetch(key.clone()).await;
        self.complete(&key, &entry, gen, result);
    }

    /// Drop `key` from the cache immediately; any in-flight fetch for it
    /// is left to complete but its result is discarded (see the module
    /// doc comment's Open Question decision).
    pub fn invalidate(&self, key: &K) {
        if let Some(entry) = self.entries.borrow_mut().remove(key) {
            entry.generation.set(entry.generation.get() + 1);
        }
        if let Some(pos) = self.order.borrow().iter().position(|k| k == key) {
            self.order.borrow_mut().remove(pos);
        }
        if let Some(pos) = self.neg_order.borrow().iter().position(|k| k == key) {
            self.neg_order.borrow_mut().remove(pos);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }
}
