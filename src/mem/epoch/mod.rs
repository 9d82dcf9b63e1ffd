//! Epoch-based memory management
//!
//! This module lets readers traverse lock-free or optimistically-locked
//! data structures without per-node reference counts, while guaranteeing
//! that no reader ever observes a freed allocation. It is built around
//! [Keir Fraser's *epoch-based
//! reclamation*](https://www.cl.cam.ac.uk/techreports/UCAM-CL-TR-579.pdf).
//!
//! The basic problem: when one thread unlinks a node from a shared
//! structure, other threads may still hold pointers to it, so the memory
//! cannot be freed immediately. Two facts make deferred freeing work:
//!
//! 1. A node is reachable either from the structure or from the
//!    snapshots held by threads currently inside an operation.
//!
//! 2. Once a node is unlinked, no *new* snapshots reaching it can be
//!    created.
//!
//! A global epoch counter advances only when every worker that has
//! *announced* an epoch has caught up with the current one. A node
//! retired in epoch `e` is therefore safe to free once the counter has
//! passed `e + 1`: every announcement from epoch `e` or earlier is gone.
//!
//! Using the scheme:
//!
//! - Wrap every operation on a shared structure in [`with_epoch`]. This
//!   announces the current epoch for the calling worker and retracts the
//!   announcement on all exit paths. Nesting is free; only the outermost
//!   call pays the fence.
//!
//! - Allocate nodes from a typed [`Pool`](pool::Pool) and hand removed
//!   nodes back with [`Pool::retire`](pool::Pool::retire). The pool
//!   sweeps retired nodes once the epoch has advanced twice past their
//!   retirement epoch.
//!
//! - Writers that lose a race use [`try_loop`] to retry with bounded
//!   exponential backoff.
//!
//! # Example
//!
//! ```
//! use keel::mem::epoch::{self, pool::Pool};
//!
//! let pool: Pool<u64> = Pool::new();
//!
//! let p = pool.new_obj(42);
//! epoch::with_epoch(|| {
//!     // safe to read while the epoch is announced
//!     assert_eq!(unsafe { *p }, 42);
//! });
//!
//! // unlinked from every shared location, so retire it; the pool frees
//! // it once the epoch has advanced twice
//! epoch::with_epoch(|| unsafe {
//!     pool.retire(p);
//! });
//! ```

use std::cell::{Cell, RefCell};
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release, SeqCst};

pub mod global;
pub mod pool;

pub use global::{MAX_WORKERS, NONE};

struct WorkerSlot {
    id: usize,
}

impl Drop for WorkerSlot {
    fn drop(&mut self) {
        global::get().release_worker(self.id);
    }
}

const NO_STAMP: u64 = u64::MAX;

thread_local! {
    static WORKER: RefCell<Option<WorkerSlot>> = const { RefCell::new(None) };
    static EPOCH_DEPTH: Cell<usize> = const { Cell::new(0) };
    static LOCAL_STAMP: Cell<u64> = const { Cell::new(NO_STAMP) };
}

/// The calling thread's worker index, assigned on first use.
///
/// Indexes the announcement slots and the per-worker pool state. Slots
/// are recycled when the thread exits.
pub fn my_id() -> usize {
    WORKER.with(|w| {
        let mut slot = w.borrow_mut();
        match &*slot {
            Some(s) => s.id,
            None => {
                let id = global::get().acquire_worker();
                *slot = Some(WorkerSlot { id });
                id
            }
        }
    })
}

/// The current global epoch.
pub fn current() -> i64 {
    global::get().epoch.load(SeqCst)
}

/// Associate the calling worker with the current epoch.
///
/// Publishes the observed epoch with a full fence (an exchange), then
/// re-reads the counter and retries if it moved. After this returns, no
/// later load on this thread can be ordered before the announcement, so
/// every pointer the thread reads stays allocated until [`unannounce`].
pub fn announce() -> usize {
    let state = global::get();
    let id = my_id();
    loop {
        let e = state.epoch.load(SeqCst);
        // an exchange doubles as the store-load fence
        state.announcements[id].swap(e, SeqCst);
        if state.epoch.load(SeqCst) == e {
            return id;
        }
    }
}

/// Retract the worker's announcement.
pub fn unannounce(id: usize) {
    global::get().announcements[id].store(NONE, Release);
}

/// The epoch currently announced by this worker (`NONE` outside one).
pub fn get_my_epoch() -> i64 {
    global::get().announcements[my_id()].load(SeqCst)
}

/// Directly set this worker's announcement; for clients that manage
/// their own announce/unannounce window.
pub fn set_my_epoch(e: i64) {
    global::get().announcements[my_id()].store(e, SeqCst);
}

/// Try to advance the global epoch by one.
///
/// Succeeds only if every announced worker has caught up with the
/// current epoch. Runs the registered before-hooks ahead of the
/// increment and the after-hooks once the increment lands. At most one
/// increment per call; failure is silent.
pub fn update_epoch() {
    let state = global::get();
    let cur = state.epoch.load(SeqCst);

    for slot in state.announcements.iter() {
        let a = slot.load(Acquire);
        if a != NONE && a < cur {
            return;
        }
    }

    for h in state.before_hooks.lock().unwrap().iter() {
        h();
    }
    if state
        .epoch
        .compare_exchange(cur, cur + 1, SeqCst, Relaxed)
        .is_ok()
    {
        for h in state.after_hooks.lock().unwrap().iter() {
            h();
        }
    }
}

/// Register a thunk to run just before each epoch increment.
pub fn register_before_hook<F: Fn() + Send + Sync + 'static>(f: F) {
    global::get().before_hooks.lock().unwrap().push(Box::new(f));
}

/// Register a thunk to run just after each successful epoch increment.
pub fn register_after_hook<F: Fn() + Send + Sync + 'static>(f: F) {
    global::get().after_hooks.lock().unwrap().push(Box::new(f));
}

struct EpochGuard {
    id: Option<usize>,
}

impl Drop for EpochGuard {
    fn drop(&mut self) {
        EPOCH_DEPTH.with(|d| d.set(d.get() - 1));
        if let Some(id) = self.id {
            unannounce(id);
        }
    }
}

/// Run `f` with the current epoch announced.
///
/// Nested calls are permitted; only the outermost announces and
/// unannounces. The announcement is retracted on every exit path,
/// including unwinding.
pub fn with_epoch<R, F: FnOnce() -> R>(f: F) -> R {
    let outermost = EPOCH_DEPTH.with(|d| {
        let v = d.get();
        d.set(v + 1);
        v == 0
    });
    let _guard = EpochGuard {
        id: if outermost { Some(announce()) } else { None },
    };
    f()
}

struct StampGuard;

impl Drop for StampGuard {
    fn drop(&mut self) {
        LOCAL_STAMP.with(|s| s.set(NO_STAMP));
    }
}

/// Run `f` inside an epoch with a snapshot timestamp pinned.
///
/// Every [`SnapPtr`](crate::mem::snapshot::SnapPtr) load inside `f`
/// returns the version that was current when the snapshot opened, so a
/// group of reads observes one consistent state of the structure.
/// Nested calls share the outermost snapshot.
pub fn with_snapshot<R, F: FnOnce() -> R>(f: F) -> R {
    with_epoch(|| {
        if LOCAL_STAMP.with(|s| s.get()) != NO_STAMP {
            return f();
        }
        // opening a snapshot advances the clock, so everything stamped
        // before this point is visible to us and later writes are not
        let ts = global::get().stamp.fetch_add(1, SeqCst);
        LOCAL_STAMP.with(|s| s.set(ts));
        let _guard = StampGuard;
        f()
    })
}

/// The snapshot timestamp pinned by the innermost [`with_snapshot`],
/// if any.
pub fn local_stamp() -> Option<u64> {
    let v = LOCAL_STAMP.with(|s| s.get());
    if v == NO_STAMP {
        None
    } else {
        Some(v)
    }
}

/// The current value of the write-timestamp clock.
pub fn write_stamp() -> u64 {
    global::get().stamp.load(SeqCst)
}

/// Retry `f` until it returns `Some`, with [`try_loop_with`]'s default
/// backoff (`delay = 200`, `max_multiplier = 10`).
pub fn try_loop<R, F: FnMut() -> Option<R>>(f: F) -> R {
    try_loop_with(f, 200, 10)
}

/// Retry `f` until it returns `Some`.
///
/// `None` means "state changed under me, try again". Between attempts
/// the loop spins for `delay * multiplier` iterations, doubling the
/// multiplier up to `max_multiplier`. Exceeding the retry ceiling of
/// `10^10 / (delay * max_multiplier)` attempts aborts the process: a
/// correct client recovers from contention long before that, so hitting
/// the ceiling means a livelock bug.
pub fn try_loop_with<R, F: FnMut() -> Option<R>>(
    mut f: F,
    delay: usize,
    max_multiplier: usize,
) -> R {
    let ceiling = 10_000_000_000u64 / (delay as u64 * max_multiplier as u64);
    let mut multiplier = 1;
    let mut count = 0u64;
    loop {
        if count == ceiling {
            eprintln!("keel: probably in an infinite retry loop");
            std::process::abort();
        }
        count += 1;
        if let Some(r) = f() {
            return r;
        }
        multiplier = std::cmp::min(2 * multiplier, max_multiplier);
        for _ in 0..delay * multiplier {
            std::hint::spin_loop();
        }
    }
}
