//! An ordered linked-list map whose links are versioned pointers.
//!
//! Structurally the same sorted list as
//! [`ListMap`](crate::sync::list::ListMap), but every `next` link is a
//! [`SnapPtr`], so reads performed inside
//! [`with_snapshot`](crate::mem::epoch::with_snapshot) observe the list
//! as of one instant: `find` and `range` across many keys return a
//! mutually consistent answer even while writers run.
//!
//! To keep old versions meaningful, nodes are immutable once published;
//! `upsert` replaces the node rather than updating it in place. Removal
//! uses the two-lock protocol (predecessor and victim), which keeps the
//! per-edge invariant simple at the cost of a second try-lock.
//!
//! Snapshots pin reads only: `find` and `range` inside `with_snapshot`
//! return the pinned state, while mutations always act on the current
//! list (their edge validation reads the version-chain head directly)
//! and are stamped after every open snapshot.

use std::ptr;

use crate::mem::epoch::{
    self,
    pool::{Pool, PoolStats},
};
use crate::mem::field::{zeroed, Word, WriteOnce};
use crate::mem::lock::Lock;
use crate::mem::snapshot::SnapPtr;

#[repr(align(64))]
struct Node<K, V: Word> {
    next: SnapPtr<Node<K, V>>,
    key: K,
    value: V,
    is_end: WriteOnce<bool>,
    removed: WriteOnce<bool>,
    lck: Lock,
}

impl<K, V: Word> Node<K, V> {
    fn new(key: K, value: V, next: *mut Node<K, V>) -> Node<K, V> {
        Node {
            next: SnapPtr::new(next),
            key,
            value,
            is_end: WriteOnce::new(false),
            removed: WriteOnce::new(false),
            lck: Lock::new(),
        }
    }
}

/// An ordered map supporting snapshot-consistent multi-point reads.
pub struct SnapList<K, V: Word> {
    root: *mut Node<K, V>,
    pool: Pool<Node<K, V>>,
}

unsafe impl<K: Send, V: Word + Send> Send for SnapList<K, V> {}
unsafe impl<K: Send + Sync, V: Word + Send + Sync> Sync for SnapList<K, V> {}

impl<K: Copy + Ord + Default, V: Word> SnapList<K, V> {
    pub fn new() -> SnapList<K, V> {
        Self::with_capacity(0)
    }

    pub fn with_capacity(hint: usize) -> SnapList<K, V> {
        let pool = Pool::new();
        if hint > 0 {
            pool.reserve(hint);
        }
        let tail = pool.new_init(
            Node::new(K::default(), zeroed(), ptr::null_mut()),
            |n| n.is_end.init(true),
        );
        let root = pool.new_obj(Node::new(K::default(), zeroed(), tail));
        SnapList { root, pool }
    }

    /// Optimistic walk to the edge `cur -> nxt` with `nxt.key >= k`.
    /// Writer-side only: uses current-version reads and is re-validated
    /// under the edge lock.
    fn find_location(&self, k: &K) -> (*mut Node<K, V>, *mut Node<K, V>) {
        unsafe {
            let mut cur = self.root;
            let mut nxt = (*cur).next.read();
            loop {
                let nxt_nxt = (*nxt).next.read();
                if (*nxt).is_end.read() || (*nxt).key >= *k {
                    break;
                }
                cur = nxt;
                nxt = nxt_nxt;
            }
            (cur, nxt)
        }
    }

    /// Point lookup. Inside [`with_snapshot`] this reads the version of
    /// the list pinned by the snapshot.
    ///
    /// [`with_snapshot`]: crate::mem::epoch::with_snapshot
    pub fn find(&self, key: &K) -> Option<V> {
        epoch::with_epoch(|| unsafe {
            let mut cur = (*self.root).next.load();
            while !(*cur).is_end.load() && (*cur).key < *key {
                cur = (*cur).next.load();
            }
            if !(*cur).is_end.load() && (*cur).key == *key {
                Some((*cur).value)
            } else {
                None
            }
        })
    }

    pub fn insert(&self, key: K, value: V) -> bool {
        epoch::with_epoch(|| {
            epoch::try_loop(|| {
                let (cur, nxt) = self.find_location(&key);
                unsafe {
                    if !(*nxt).is_end.read() && (*nxt).key == key {
                        return Some(false);
                    }
                    if (*cur).lck.try_lock(|| {
                        if (*cur).removed.load() || (*cur).next.load_cur() != nxt {
                            return false;
                        }
                        let node = self.pool.new_obj(Node::new(key, value, nxt));
                        (*cur).next.store(node);
                        true
                    }) {
                        Some(true)
                    } else {
                        None
                    }
                }
            })
        })
    }

    /// Insert `key` or replace its node with one holding `f`'s value;
    /// returns true if a new key was inserted. Replacement keeps old
    /// versions readable by in-flight snapshots.
    pub fn upsert<F: Fn(Option<V>) -> V>(&self, key: K, f: F) -> bool {
        epoch::with_epoch(|| {
            epoch::try_loop(|| {
                let (cur, nxt) = self.find_location(&key);
                unsafe {
                    if !(*nxt).is_end.read() && (*nxt).key == key {
                        return if (*cur).lck.try_lock(|| {
                            if (*cur).removed.load() || (*cur).next.load_cur() != nxt {
                                return false;
                            }
                            (*nxt).lck.try_lock(|| {
                                let nxt_nxt = (*nxt).next.load_cur();
                                (*nxt).removed.store(true);
                                let node = self
                                    .pool
                                    .new_obj(Node::new(key, f(Some((*nxt).value)), nxt_nxt));
                                (*cur).next.store(node);
                                self.pool.retire(nxt);
                                true
                            })
                        }) {
                            Some(false)
                        } else {
                            None
                        };
                    }
                    if (*cur).lck.try_lock(|| {
                        if (*cur).removed.load() || (*cur).next.load_cur() != nxt {
                            return false;
                        }
                        let node = self.pool.new_obj(Node::new(key, f(None), nxt));
                        (*cur).next.store(node);
                        true
                    }) {
                        Some(true)
                    } else {
                        None
                    }
                }
            })
        })
    }

    pub fn remove(&self, key: &K) -> bool {
        epoch::with_epoch(|| {
            epoch::try_loop(|| {
                let (cur, nxt) = self.find_location(key);
                unsafe {
                    if (*nxt).is_end.read() || (*nxt).key != *key {
                        return Some(false);
                    }
                    if (*cur).lck.try_lock(|| {
                        if (*cur).removed.load() || (*cur).next.load_cur() != nxt {
                            return false;
                        }
                        (*nxt).lck.try_lock(|| {
                            let nxt_nxt = (*nxt).next.load_cur();
                            (*nxt).removed.store(true);
                            // shortcut past the victim
                            (*cur).next.store(nxt_nxt);
                            self.pool.retire(nxt);
                            true
                        })
                    }) {
                        Some(true)
                    } else {
                        None
                    }
                }
            })
        })
    }

    /// Emit every `(k, v)` with `lo <= k <= hi`, ascending. Run inside
    /// [`with_snapshot`] to get an atomic pass.
    ///
    /// [`with_snapshot`]: crate::mem::epoch::with_snapshot
    pub fn range<F: FnMut(K, V)>(&self, lo: &K, hi: &K, mut emit: F) {
        epoch::with_epoch(|| unsafe {
            let mut cur = (*self.root).next.load();
            while !(*cur).is_end.load() {
                let k = (*cur).key;
                if k > *hi {
                    break;
                }
                if k >= *lo {
                    emit(k, (*cur).value);
                }
                cur = (*cur).next.load();
            }
        })
    }

    pub fn size(&self) -> usize {
        epoch::with_epoch(|| unsafe {
            let mut count = 0;
            let mut cur = (*self.root).next.load();
            while !(*cur).is_end.load() {
                count += 1;
                cur = (*cur).next.load();
            }
            count
        })
    }

    /// Validate the structure and return the key count. Aborts on a
    /// violation.
    pub fn check(&self) -> usize {
        epoch::with_epoch(|| unsafe {
            let mut count = 0;
            let mut last: Option<K> = None;
            let mut cur = (*self.root).next.load();
            while !(*cur).is_end.load() {
                if !self.pool.check_not_corrupted(cur) {
                    std::process::abort();
                }
                if let Some(l) = last {
                    if (*cur).key <= l {
                        eprintln!("keel: list keys out of order");
                        std::process::abort();
                    }
                }
                last = Some((*cur).key);
                count += 1;
                cur = (*cur).next.load();
            }
            count
        })
    }

    /// Single-threaded teardown and reset to an empty map.
    pub fn clear(&mut self) {
        self.destruct_all();
        self.pool.clear();
        let tail = self.pool.new_init(
            Node::new(K::default(), zeroed(), ptr::null_mut()),
            |n| n.is_end.init(true),
        );
        self.root = self.pool.new_obj(Node::new(K::default(), zeroed(), tail));
    }

    pub fn reserve(&self, n: usize) {
        self.pool.reserve(n);
    }

    pub fn shuffle(&self, n: usize) {
        self.pool.shuffle(n);
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }
}

impl<K, V: Word> SnapList<K, V> {
    fn destruct_all(&mut self) {
        unsafe {
            let mut cur = self.root;
            while !cur.is_null() {
                // follow the current version of each link
                let nxt = (*cur).next.read();
                self.pool.destruct(cur);
                cur = nxt;
            }
        }
        self.root = ptr::null_mut();
    }
}

impl<K: Copy + Ord + Default, V: Word> Default for SnapList<K, V> {
    fn default() -> SnapList<K, V> {
        SnapList::new()
    }
}

impl<K, V: Word> Drop for SnapList<K, V> {
    fn drop(&mut self) {
        self.destruct_all();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mem::epoch::with_snapshot;

    #[test]
    fn test_insert_find_remove() {
        let m: SnapList<u64, u64> = SnapList::new();
        assert!(m.insert(4, 40));
        assert!(m.insert(2, 20));
        assert!(!m.insert(4, 99));
        assert_eq!(m.find(&2), Some(20));
        assert_eq!(m.find(&4), Some(40));
        assert!(m.remove(&2));
        assert!(!m.remove(&2));
        assert_eq!(m.find(&2), None);
        assert_eq!(m.check(), 1);
    }

    #[test]
    fn test_upsert_replaces() {
        let m: SnapList<u64, u64> = SnapList::new();
        assert!(m.upsert(1, |_| 5));
        assert!(!m.upsert(1, |old| old.unwrap() * 2));
        assert_eq!(m.find(&1), Some(10));
        assert_eq!(m.check(), 1);
    }

    #[test]
    fn test_snapshot_sees_frozen_state() {
        let m: SnapList<u64, u64> = SnapList::new();
        m.insert(1, 1);
        m.insert(2, 2);
        with_snapshot(|| {
            assert_eq!(m.find(&1), Some(1));
            // writes from this thread land after the snapshot stamp
            m.remove(&1);
            m.insert(3, 3);
            assert_eq!(m.find(&1), Some(1));
            assert_eq!(m.find(&3), None);
        });
        assert_eq!(m.find(&1), None);
        assert_eq!(m.find(&3), Some(3));
    }
}
