//! Snapshot-capable versioned pointers.
//!
//! A [`SnapPtr`] keeps its prior values alive as a chain of version
//! cells, newest first, each stamped with the value of the global
//! write-timestamp clock at publication. A reader inside
//! [`with_snapshot`](crate::mem::epoch::with_snapshot) walks the chain
//! to the newest version stamped at or before its snapshot, so a group
//! of reads across many pointers observes one consistent state.
//!
//! Versions are installed with the stamp `TBD` and stamped lazily: the
//! first reader (or the storing writer itself, which stamps eagerly
//! before returning) CASes a current clock value in. Losing that CAS is
//! harmless because the winning stamp is also a current clock value —
//! the clock never goes backwards.
//!
//! The chain is append-only: never spliced, never re-stamped, no
//! back-edges. Displaced cells are retired through the epoch pool, and
//! a cell is retired only after the replacing version is stamped, so no
//! later snapshot can need it.

use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering::{Acquire, Relaxed, SeqCst};
use std::sync::OnceLock;

use crate::mem::epoch::{self, pool::Pool};
use crate::mem::field::{MutableVal, WriteOnce};

/// Stamp of a version that has not been timestamped yet.
const TBD: u64 = u64::MAX;
/// Stamp of initial versions; older than every snapshot.
const ZERO_STAMP: u64 = 0;

/// One cell of a version chain.
pub struct VLink {
    stamp: AtomicU64,
    /// Older neighbor; written once, by the cell's creator.
    next: WriteOnce<*mut VLink>,
    value: *mut u8,
}

unsafe impl Send for VLink {}
unsafe impl Sync for VLink {}

/// All version cells share one process-wide pool.
fn link_pool() -> &'static Pool<VLink> {
    static POOL: OnceLock<Pool<VLink>> = OnceLock::new();
    POOL.get_or_init(Pool::new)
}

/// Stamp `link` with the current clock value if it is still `TBD`.
fn set_stamp(link: *mut VLink) -> *mut VLink {
    unsafe {
        if (*link).stamp.load(Acquire) == TBD {
            let ts = epoch::write_stamp();
            // losers are fine: the winner also installed a current
            // clock value
            let _ = (*link).stamp.compare_exchange(TBD, ts, SeqCst, Relaxed);
        }
    }
    link
}

/// A pointer whose prior values stay readable by in-flight snapshots.
///
/// Stores require the single-writer discipline (callers hold the owning
/// object's lock); loads are wait-free and may run anywhere inside an
/// epoch.
pub struct SnapPtr<T> {
    head: MutableVal<*mut VLink>,
    _marker: PhantomData<*mut T>,
}

impl<T> SnapPtr<T> {
    fn new_link(p: *mut T, stamp: u64, next: *mut VLink) -> *mut VLink {
        link_pool().new_obj(VLink {
            stamp: AtomicU64::new(stamp),
            next: WriteOnce::new(next),
            value: p as *mut u8,
        })
    }

    pub fn new(p: *mut T) -> SnapPtr<T> {
        SnapPtr {
            head: MutableVal::new(Self::new_link(p, ZERO_STAMP, ptr::null_mut())),
            _marker: PhantomData,
        }
    }

    /// Reset to a fresh zero-stamped version. Only before the pointer
    /// is shared: the old chain is freed immediately.
    pub fn init(&self, p: *mut T) {
        let old = self.head.read();
        if !old.is_null() {
            unsafe {
                link_pool().destruct(old);
            }
        }
        self.head.init(Self::new_link(p, ZERO_STAMP, ptr::null_mut()));
    }

    /// The current value; inside a snapshot, the value at the snapshot
    /// stamp.
    pub fn load(&self) -> *mut T {
        match epoch::local_stamp() {
            Some(ls) => self.read_snapshot(ls),
            None => unsafe { (*set_stamp(self.head.load())).value as *mut T },
        }
    }

    fn read_snapshot(&self, ls: u64) -> *mut T {
        let mut cur = set_stamp(self.head.load());
        unsafe {
            while !cur.is_null() && (*cur).stamp.load(Acquire) > ls {
                cur = (*cur).next.load();
            }
            if cur.is_null() {
                ptr::null_mut()
            } else {
                (*cur).value as *mut T
            }
        }
    }

    /// The current value, ignoring any pinned snapshot. Writers
    /// validating an edge under a lock use this: they must compare
    /// against the head, not the snapshot view.
    pub fn load_cur(&self) -> *mut T {
        unsafe { (*set_stamp(self.head.load())).value as *mut T }
    }

    /// Fence-free read of the current version. Only safe on a traversal
    /// that re-validates (a later [`SnapPtr::validate`] or a lock that
    /// re-checks the pointer); ignores any pinned snapshot.
    pub fn read(&self) -> *mut T {
        unsafe { (*self.head.read()).value as *mut T }
    }

    /// Flush the head version's stamp so later snapshots order
    /// correctly against it.
    pub fn validate(&self) {
        set_stamp(self.head.load());
    }

    /// Install `p` as the new current value.
    pub fn store(&self, p: *mut T) {
        let old = self.head.load();
        let link = Self::new_link(p, TBD, old);
        let _installed = self.head.cas(old, link);
        debug_assert!(_installed, "SnapPtr store raced another writer");
        // stamp before retiring the displaced cell: anything opened
        // after this point stops at the new head
        set_stamp(link);
        unsafe {
            link_pool().retire(old);
        }
    }

    /// Swing the pointer from `old` to `new`; fails if the current
    /// value is not `old`.
    pub fn cas(&self, old: *mut T, new: *mut T) -> bool {
        let head = self.head.load();
        if unsafe { (*head).value as *mut T } != old {
            return false;
        }
        let link = Self::new_link(new, TBD, head);
        if self.head.cas(head, link) {
            set_stamp(link);
            unsafe {
                link_pool().retire(head);
            }
            true
        } else {
            unsafe {
                link_pool().destruct(link);
            }
            false
        }
    }
}

impl<T> Drop for SnapPtr<T> {
    fn drop(&mut self) {
        // Displaced cells were retired individually by `store`; the
        // head cell is freed with the owning object. By the time the
        // owner is destructed, no announced reader can reach us.
        let head = self.head.read();
        if !head.is_null() {
            unsafe {
                link_pool().destruct(head);
            }
        }
    }
}
