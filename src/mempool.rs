//! Memory pool (spec §4.18): size-classed buffer recycling to avoid
//! fragmenting the allocator with "allocate many same-size buffers, use
//! briefly, free them all" churn — the dominant allocation pattern for
//! per-request scratch buffers in this crate.
//!
//! The teacher's C sibling `common/mempool.c` builds this out of mmap'd,
//! page-aligned "magazines" with a bitvector free-list and per-thread
//! `GPrivate` pool sets, because it has to support allocation from many
//! OS threads sharing no allocator state. Every worker in this crate owns
//! exactly one pool on its own thread (spec §4.8), so the thread-local
//! dance and the lock-free bitvector search it exists for both disappear:
//! this is a plain `Rc<RefCell<..>>` per-size-class free list, generalizing
//! the same "recycle same-size buffers, round up to a page" idea to safe,
//! single-threaded-per-worker Rust. `B.2`'s periodic GC sweep (trim each
//! free list back to its high-water mark) replaces the magazine-eviction
//! logic in `mp_pools_get`/`mempool_free`.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

const DEFAULT_PAGE_SIZE: usize = 4096;
/// Matches the C sibling's `MP_MAX_ALLOC_SIZE`: above this, buffers aren't
/// pooled at all, just allocated and dropped normally.
const MAX_POOLED_SIZE: usize = 8 * 1024 * 1024;

struct Inner {
    page_size: usize,
    free: HashMap<usize, Vec<Vec<u8>>>,
    high_water: HashMap<usize, usize>,
}

impl Inner {
    fn align(&self, size: usize) -> usize {
        let p = self.page_size;
        (size + p - 1) & !(p - 1)
    }
}

/// A per-worker buffer pool (spec §4.18 `MemPool`).
#[derive(Clone)]
pub struct MemPool {
    inner: Rc<RefCell<Inner>>,
}

impl Default for MemPool {
    fn default() -> Self {
        MemPool::new()
    }
}

impl MemPool {
    /// A fresh, empty pool using the system page size.
    pub fn new() -> MemPool {
        MemPool::with_page_size(DEFAULT_PAGE_SIZE)
    }

    /// A fresh, empty pool using an explicit page size (tests use a small
    /// one so size classes are easy to reason about).
    pub fn with_page_size(page_size: usize) -> MemPool {
        assert!(page_size.is_power_of_two());
        MemPool {
            inner: Rc::new(RefCell::new(Inner {
                page_size,
                free: HashMap::new(),
                high_water: HashMap::new(),
            })),
        }
    }

    /// Round `size` up to this pool's page size (spec
    /// `mempool_align_page_size`).
    pub fn align_size(&self, size: usize) -> usize {
        self.inner.borrow().align(size)
    }

    /// Check out a buffer of at least `size` bytes, reusing a freed one of
    /// the same size class if available.
    pub fn alloc(&self, size: usize) -> PoolBuf {
        let class = self.inner.borrow().align(size);
        if class > MAX_POOLED_SIZE {
            return PoolBuf { buf: vec![0u8; class], class, pool: None };
        }
        let reused = {
            let mut inner = self.inner.borrow_mut();
            inner.free.get_mut(&class).and_then(Vec::pop)
        };
        let buf = reused.unwrap_or_else(|| vec![0u8; class]);
        PoolBuf { buf, class, pool: Some(self.inner.clone()) }
    }

    /// Number of free (checked-in, unused) buffers currently held, summed
    /// across all size classes.
    pub fn free_count(&self) -> usize {
        self.inner.borrow().free.values().map(Vec::len).sum()
    }

    /// Periodic GC sweep (spec B.2): trim every size class's free list
    /// back down to its observed high-water mark from the last sweep, then
    /// reset that mark to the class's *current* size so sustained demand
    /// isn't punished on the next sweep.
    pub fn gc_sweep(&self) {
        let mut inner = self.inner.borrow_mut();
        let mut marks = std::mem::take(&mut inner.high_water);
        for (class, list) in inner.free.iter_mut() {
            let keep = marks.remove(class).unwrap_or(0).max(list.len() / 2);
            if list.len() > keep {
                list.truncate(keep);
            }
        }
        inner.free.retain(|_, list| !list.is_empty());
        for (class, list) in inner.free.iter() {
            marks.insert(*class, list.len());
        }
        inner.high_water = marks;
    }

    fn checkin(&self, buf: Vec<u8>, class: usize) {
        let mut inner = self.inner.borrow_mut();
        let list = inner.free.entry(class).or_default();
        list.push(buf);
        let water = inner.high_water.entry(class).or_insert(0);
        if list.len() > *water {
            *water = list.len();
        }
    }
}

/// A checked-out, page-aligned buffer. Returns itself to its pool's free
/// list for its size class on drop, unless it came from the
/// above-`MAX_POOLED_SIZE` fallback path.
pub struct PoolBuf {
    buf: Vec<u8>,
    class: usize,
    pool: Option<Rc<RefCell<Inner>>>,
}

impl PoolBuf {
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

impl Drop for PoolBuf {
    fn drop(&mut self) {
        if let Some(inner) = self.pool.take() {
            let buf = std::mem::take(&mut self.buf);
            let pool = MemPool { inner };
            pool.checkin(buf, self.class);
        }
    }
}

impl std::ops::Deref for PoolBuf {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl std::ops::DerefMut for PoolBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_rounds_up_to_page_size() {
        let pool = MemPool::with_page_size(64);
        assert_eq!(pool.align_size(1), 64);
        assert_eq!(pool.align_size(64), 64);
        assert_eq!(pool.align_size(65), 128);
    }

    #[test]
    fn checked_in_buffer_is_reused_by_the_next_alloc_of_the_same_class() {
        let pool = MemPool::with_page_size(64);
        let ptr = {
            let mut buf = pool.alloc(10);
            buf.as_mut_slice()[0] = 0xAB;
            buf.as_slice().as_ptr()
        };
        assert_eq!(pool.free_count(), 1);
        let buf2 = pool.alloc(20); // same size class (64)
        assert_eq!(buf2.as_slice().as_ptr(), ptr);
        assert_eq!(pool.free_count(), 0);
    }

    #[test]
    fn oversized_allocations_are_never_pooled() {
        let pool = MemPool::with_page_size(64);
        let buf = pool.alloc(MAX_POOLED_SIZE + 1);
        drop(buf);
        assert_eq!(pool.free_count(), 0);
    }

    #[test]
    fn gc_sweep_trims_free_lists_toward_their_high_water_mark() {
        let pool = MemPool::with_page_size(64);
        let bufs: Vec<_> = (0..8).map(|_| pool.alloc(10)).collect();
        drop(bufs);
        assert_eq!(pool.free_count(), 8);
        pool.gc_sweep();
        // no prior mark recorded yet, so the first sweep only trims to half
        assert_eq!(pool.free_count(), 4);
        pool.gc_sweep();
        // second sweep: last sweep's survivor count (4) is this round's mark
        assert_eq!(pool.free_count(), 4);
    }
}
