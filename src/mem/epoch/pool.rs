//! Typed memory pools with epoch-deferred free.
//!
//! A [`Pool<T>`] owns every `T` it hands out. Allocation recycles
//! storage through a per-worker free list; `retire` defers the free
//! until the global epoch has advanced twice past the retirement epoch,
//! at which point no announced reader can still observe the object.
//!
//! With the `memcheck` feature (default) every slot is wrapped in guard
//! words. The sweep aborts the process on a corrupted guard or a double
//! free; [`Pool::check_not_corrupted`] exposes the same check to
//! clients and tests.

use std::alloc::{alloc, dealloc, handle_alloc_error, Layout};
use std::cell::UnsafeCell;
use std::mem::ManuallyDrop;
use std::ptr;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::Relaxed;
use std::time::Instant;

use crate::mem::epoch::{self, global};
use crate::mem::CachePadded;

#[cfg(feature = "memcheck")]
use std::sync::atomic::AtomicU64;

#[cfg(feature = "memcheck")]
const GUARD_LIVE: u64 = 0x6c1fe;
#[cfg(feature = "memcheck")]
const GUARD_FREED: u64 = 0xdead;

/// Milliseconds between forced `update_epoch` attempts, scaled by
/// worker id so workers do not convoy on the epoch counter.
const MS_BETWEEN_UPDATES: f64 = 20.0;

#[cfg(feature = "memcheck")]
#[repr(C)]
struct Padded<T> {
    pad: u64,
    head: AtomicU64,
    value: ManuallyDrop<T>,
    tail: AtomicU64,
}

#[cfg(not(feature = "memcheck"))]
#[repr(C)]
struct Padded<T> {
    value: ManuallyDrop<T>,
}

unsafe fn pad_from_value<T>(p: *mut T) -> *mut Padded<T> {
    (p as *mut u8).sub(std::mem::offset_of!(Padded<T>, value)) as *mut Padded<T>
}

unsafe fn value_of<T>(slot: *mut Padded<T>) -> *mut T {
    ptr::addr_of_mut!((*slot).value) as *mut T
}

/// One cell of a retire list.
struct Link<T> {
    next: *mut Link<T>,
    skip: AtomicBool,
    value: *mut T,
}

/// Handle returned by [`Pool::retire`]; lets the caller roll back a
/// speculative retire.
///
/// The handle points into the retire cell itself, so it is valid only
/// until the retiring epoch has advanced twice (the point at which the
/// cell may be swept).
pub struct CancelHandle {
    skip: *mut AtomicBool,
}

impl CancelHandle {
    /// Cancel the retire: the object will be skipped at sweep time and
    /// stays owned by the caller.
    ///
    /// # Safety
    ///
    /// Must happen before the epoch that would free the cell advances
    /// twice, and at most once per handle.
    pub unsafe fn cancel(&self) {
        (*self.skip).store(true, Relaxed);
    }

    /// Re-arm a canceled retire.
    ///
    /// # Safety
    ///
    /// Same window as [`CancelHandle::cancel`].
    pub unsafe fn restore(&self) {
        (*self.skip).store(false, Relaxed);
    }
}

/// Per-worker pool state. Touched only by its owning worker, except
/// during single-threaded teardown.
struct LocalPool<T> {
    /// Retired in an epoch before the current list was opened
    old: *mut Link<T>,
    /// Retired since `epoch`
    current: *mut Link<T>,
    /// Epoch at which `current` was opened
    epoch: i64,
    /// Retires since the last `update_epoch` attempt
    count: u64,
    last_update: Instant,
    /// Recycled slots ready for reuse
    free: Vec<*mut Padded<T>>,
    /// Constructed objects minus destructed ones
    live: i64,
}

impl<T> LocalPool<T> {
    fn new(stagger: u64) -> LocalPool<T> {
        LocalPool {
            old: ptr::null_mut(),
            current: ptr::null_mut(),
            epoch: 0,
            count: stagger,
            last_update: Instant::now(),
            free: Vec::new(),
            live: 0,
        }
    }
}

/// Aggregate pool counters. Exact only while no other worker is using
/// the pool.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Objects constructed and not yet destructed (retired-but-unswept
    /// objects count as live).
    pub live: usize,
    /// Recycled slots waiting on free lists.
    pub free: usize,
    /// Cells sitting on `old`/`current` retire lists.
    pub retired: usize,
}

/// A typed allocation pool with deferred free.
pub struct Pool<T> {
    locals: Vec<CachePadded<UnsafeCell<LocalPool<T>>>>,
}

unsafe impl<T: Send> Send for Pool<T> {}
unsafe impl<T: Send> Sync for Pool<T> {}

impl<T> Default for Pool<T> {
    fn default() -> Pool<T> {
        Pool::new()
    }
}

impl<T> Pool<T> {
    pub fn new() -> Pool<T> {
        let mut locals = Vec::with_capacity(global::MAX_WORKERS);
        for i in 0..global::MAX_WORKERS {
            // staggered retire counts so workers don't all hit
            // update_epoch on the same beat
            let stagger = (i as u64).wrapping_mul(0x9e3779b9) % 320;
            locals.push(CachePadded::new(UnsafeCell::new(LocalPool::new(stagger))));
        }
        Pool { locals }
    }

    /// The calling worker's slice of the pool.
    ///
    /// Sound because only worker `w` touches slot `w` while the pool is
    /// shared; teardown paths take `&mut self`.
    #[allow(clippy::mut_from_ref)]
    unsafe fn local(&self) -> &mut LocalPool<T> {
        &mut *self.locals[epoch::my_id()].get()
    }

    fn layout() -> Layout {
        Layout::new::<Padded<T>>()
    }

    fn alloc_slot(local: &mut LocalPool<T>) -> *mut Padded<T> {
        if let Some(slot) = local.free.pop() {
            return slot;
        }
        let slot = unsafe { alloc(Self::layout()) } as *mut Padded<T>;
        if slot.is_null() {
            handle_alloc_error(Self::layout());
        }
        slot
    }

    /// Allocate a slot and move `value` into it.
    pub fn new_obj(&self, value: T) -> *mut T {
        let local = unsafe { self.local() };
        let slot = Self::alloc_slot(local);
        unsafe {
            #[cfg(feature = "memcheck")]
            {
                ptr::addr_of_mut!((*slot).pad).write(GUARD_LIVE);
                ptr::addr_of_mut!((*slot).head).write(AtomicU64::new(GUARD_LIVE));
                ptr::addr_of_mut!((*slot).tail).write(AtomicU64::new(GUARD_LIVE));
            }
            let p = value_of(slot);
            p.write(value);
            local.live += 1;
            p
        }
    }

    /// Allocate, then run `init` on the object before it is published.
    pub fn new_init<F: FnOnce(&mut T)>(&self, value: T, init: F) -> *mut T {
        let p = self.new_obj(value);
        init(unsafe { &mut *p });
        p
    }

    /// Destruct `p` and recycle its slot immediately.
    ///
    /// # Safety
    ///
    /// `p` must be live in this pool, and no other thread may be able
    /// to reach it.
    pub unsafe fn destruct(&self, p: *mut T) {
        let local = self.local();
        Self::destruct_into(p, local);
    }

    unsafe fn destruct_into(p: *mut T, local: &mut LocalPool<T>) {
        ptr::drop_in_place(p);
        let slot = pad_from_value(p);
        #[cfg(feature = "memcheck")]
        (*slot).head.store(GUARD_FREED, Relaxed);
        local.live -= 1;
        local.free.push(slot);
    }

    /// Whether the guard words around `p` are intact. Always true
    /// without the `memcheck` feature.
    #[cfg(feature = "memcheck")]
    pub fn check_not_corrupted(&self, p: *mut T) -> bool {
        unsafe {
            let slot = pad_from_value(p);
            let mut ok = true;
            if (*slot).pad != GUARD_LIVE {
                eprintln!("keel: pool pad word corrupted");
                ok = false;
            }
            if (*slot).head.load(Relaxed) != GUARD_LIVE {
                eprintln!("keel: pool head word corrupted");
                ok = false;
            }
            if (*slot).tail.load(Relaxed) != GUARD_LIVE {
                eprintln!("keel: pool tail word corrupted");
                ok = false;
            }
            ok
        }
    }

    /// Whether the guard words around `p` are intact. Always true
    /// without the `memcheck` feature.
    #[cfg(not(feature = "memcheck"))]
    pub fn check_not_corrupted(&self, _p: *mut T) -> bool {
        true
    }

    /// Overwrite the trailing guard word of `p`. Exists so tests can
    /// exercise the corruption detector.
    #[cfg(feature = "memcheck")]
    pub fn clobber_tail(&self, p: *mut T) {
        unsafe {
            let slot = pad_from_value(p);
            (*slot).tail.store(0, Relaxed);
        }
    }

    /// Retire `p`: defer its destruction until the epoch has advanced
    /// far enough that no announced reader can still observe it.
    ///
    /// # Safety
    ///
    /// `p` must be live in this pool and already unlinked from every
    /// shared location, and must not be retired again.
    pub unsafe fn retire(&self, p: *mut T) -> CancelHandle {
        let local = self.local();
        self.advance(local);
        let link = Box::into_raw(Box::new(Link {
            next: local.current,
            skip: AtomicBool::new(false),
            value: p,
        }));
        local.current = link;
        CancelHandle {
            skip: ptr::addr_of_mut!((*link).skip),
        }
    }

    /// Run the retire-list advance step for the calling worker without
    /// recording a retire: sweep `old` if the epoch has moved far
    /// enough, then promote `current`.
    pub fn collect(&self) {
        let local = unsafe { self.local() };
        self.advance_lists(local);
    }

    fn advance_lists(&self, local: &mut LocalPool<T>) -> bool {
        let e = epoch::current();
        if local.epoch + 1 < e {
            unsafe {
                let old = local.old;
                local.old = ptr::null_mut();
                self.sweep_list(old, local);
            }
            local.old = local.current;
            local.current = ptr::null_mut();
            local.epoch = e;
            true
        } else {
            false
        }
    }

    fn advance(&self, local: &mut LocalPool<T>) {
        self.advance_lists(local);

        // pacing heuristic: force an update_epoch attempt every
        // 10 * workers retires, or when the wall-clock budget for this
        // worker runs out
        local.count += 1;
        let workers = global::get().workers() as u64;
        let budget_ms = MS_BETWEEN_UPDATES * (1.0 + epoch::my_id() as f64 / workers as f64);
        if local.count >= 10 * workers
            || local.last_update.elapsed().as_secs_f64() * 1e3 > budget_ms
        {
            local.count = 0;
            local.last_update = Instant::now();
            epoch::update_epoch();
        }
    }

    /// Destruct every non-skipped cell of `list` and free the cells.
    unsafe fn sweep_list(&self, mut list: *mut Link<T>, local: &mut LocalPool<T>) {
        while !list.is_null() {
            let link = Box::from_raw(list);
            list = link.next;
            if link.skip.load(Relaxed) {
                continue;
            }
            #[cfg(feature = "memcheck")]
            {
                let slot = pad_from_value(link.value);
                let head = (*slot).head.load(Relaxed);
                let tail = (*slot).tail.load(Relaxed);
                if (*slot).pad != GUARD_LIVE || head != GUARD_LIVE || tail != GUARD_LIVE {
                    if head == GUARD_FREED {
                        eprintln!("keel: double free of pooled object");
                    } else if head != GUARD_LIVE || (*slot).pad != GUARD_LIVE {
                        eprintln!("keel: corrupted head word");
                    }
                    if tail != GUARD_LIVE {
                        eprintln!("keel: corrupted tail word");
                    }
                    std::process::abort();
                }
            }
            Self::destruct_into(link.value, local);
        }
    }

    /// Pre-fault `n` slots onto the calling worker's free list.
    pub fn reserve(&self, n: usize) {
        let local = unsafe { self.local() };
        local.free.reserve(n);
        for _ in 0..n {
            let slot = unsafe { alloc(Self::layout()) } as *mut Padded<T>;
            if slot.is_null() {
                handle_alloc_error(Self::layout());
            }
            local.free.push(slot);
        }
    }

    /// Randomize the free list so neighboring allocations stop sharing
    /// cache lines; ensures at least `n` slots are available first.
    /// Benchmark hook; no correctness effect.
    pub fn shuffle(&self, n: usize) {
        use rand::seq::SliceRandom;
        let missing = {
            let local = unsafe { self.local() };
            n.saturating_sub(local.free.len())
        };
        if missing > 0 {
            self.reserve(missing);
        }
        let local = unsafe { self.local() };
        local.free.shuffle(&mut rand::thread_rng());
    }

    /// Aggregate counters across workers. Exact only when quiescent.
    pub fn stats(&self) -> PoolStats {
        let mut s = PoolStats::default();
        for cell in self.locals.iter() {
            let local = unsafe { &*cell.get() };
            s.live += local.live.max(0) as usize;
            s.free += local.free.len();
            for mut list in [local.old, local.current] {
                while !list.is_null() {
                    unsafe {
                        if !(*list).skip.load(Relaxed) {
                            s.retired += 1;
                        }
                        list = (*list).next;
                    }
                }
            }
        }
        s
    }

    /// Single-threaded teardown: sweep every worker's retire lists
    /// regardless of epoch and return all recycled storage to the OS.
    pub fn clear(&mut self) {
        epoch::update_epoch();
        for i in 0..self.locals.len() {
            let local = unsafe { &mut *self.locals[i].get() };
            unsafe {
                let old = local.old;
                local.old = ptr::null_mut();
                self.sweep_list(old, local);
                let current = local.current;
                local.current = ptr::null_mut();
                self.sweep_list(current, local);
            }
            local.epoch = epoch::current();
            for slot in local.free.drain(..) {
                unsafe { dealloc(slot as *mut u8, Self::layout()) };
            }
        }
    }
}

impl<T> Drop for Pool<T> {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering::SeqCst;

    struct Counted<'a>(&'a AtomicUsize);
    impl Drop for Counted<'_> {
        fn drop(&mut self) {
            self.0.fetch_add(1, SeqCst);
        }
    }

    #[test]
    fn test_new_destruct_recycles() {
        let drops = AtomicUsize::new(0);
        let pool: Pool<Counted> = Pool::new();
        let p = pool.new_obj(Counted(&drops));
        assert!(pool.check_not_corrupted(p));
        unsafe { pool.destruct(p) };
        assert_eq!(drops.load(SeqCst), 1);
        let stats = pool.stats();
        assert_eq!(stats.live, 0);
        assert_eq!(stats.free, 1);
        // the slot comes back
        let q = pool.new_obj(Counted(&drops));
        assert_eq!(q, p);
        unsafe { pool.destruct(q) };
    }

    #[test]
    fn test_new_init_runs_before_publication() {
        let pool: Pool<(u32, u32)> = Pool::new();
        let p = pool.new_init((1, 0), |v| v.1 = v.0 + 1);
        assert_eq!(unsafe { *p }, (1, 2));
        unsafe { pool.destruct(p) };
    }

    #[test]
    fn test_retire_cancel() {
        let drops = AtomicUsize::new(0);
        let mut pool: Pool<Counted> = Pool::new();
        let p = pool.new_obj(Counted(&drops));
        let h = unsafe { pool.retire(p) };
        unsafe { h.cancel() };
        pool.clear();
        // canceled retire: the object must not have been destructed
        assert_eq!(drops.load(SeqCst), 0);
        unsafe { pool.destruct(p) };
        assert_eq!(drops.load(SeqCst), 1);
    }

    #[test]
    fn test_clear_sweeps_everything() {
        let drops = AtomicUsize::new(0);
        let mut pool: Pool<Counted> = Pool::new();
        for _ in 0..64 {
            let p = pool.new_obj(Counted(&drops));
            unsafe { pool.retire(p) };
        }
        pool.clear();
        assert_eq!(drops.load(SeqCst), 64);
        assert_eq!(pool.stats(), PoolStats::default());
    }

    #[test]
    fn test_reserve_and_shuffle() {
        let pool: Pool<u64> = Pool::new();
        pool.reserve(32);
        assert!(pool.stats().free >= 32);
        pool.shuffle(64);
        assert!(pool.stats().free >= 64);
    }
}
