//! An ordered linked-list map with single-lock removal.
//!
//! Writers take one try-lock (on the predecessor of the affected edge)
//! and validate the edge inside it; removal additionally waits — without
//! acquiring — on locks whose holders could otherwise leave the
//! validated edge half-updated. Readers never lock: they traverse with
//! fence-free pointer reads and rely on the lock-side validation plus
//! epoch reclamation for safety.
//!
//! Because `wait_lock` can block on a specific holder, nodes carry
//! inline locks; this protocol must not be used with the hashed lock
//! table (an accidental collision could make two unrelated removals
//! wait on each other).

use std::ptr;

use crate::mem::epoch::{
    self,
    pool::{Pool, PoolStats},
};
use crate::mem::field::{zeroed, MutableVal, OptPtr, Word, WriteOnce};
use crate::mem::lock::Lock;

#[repr(align(64))]
struct Node<K, V: Word> {
    next: OptPtr<Node<K, V>>,
    key: K,
    value: MutableVal<V>,
    is_end: WriteOnce<bool>,
    removed: WriteOnce<bool>,
    lck: Lock,
}

impl<K, V: Word> Node<K, V> {
    fn new(key: K, value: V, next: *mut Node<K, V>) -> Node<K, V> {
        Node {
            next: OptPtr::new(next),
            key,
            value: MutableVal::new(value),
            is_end: WriteOnce::new(false),
            removed: WriteOnce::new(false),
            lck: Lock::new(),
        }
    }
}

/// An ordered map from `K` to `V` over a sorted singly-linked list.
pub struct ListMap<K, V: Word> {
    root: *mut Node<K, V>,
    pool: Pool<Node<K, V>>,
}

unsafe impl<K: Send, V: Word + Send> Send for ListMap<K, V> {}
unsafe impl<K: Send + Sync, V: Word + Send + Sync> Sync for ListMap<K, V> {}

impl<K: Copy + Ord + Default, V: Word> ListMap<K, V> {
    pub fn new() -> ListMap<K, V> {
        Self::with_capacity(0)
    }

    /// `hint` pre-faults pool slots; it does not bound the map.
    pub fn with_capacity(hint: usize) -> ListMap<K, V> {
        let pool = Pool::new();
        if hint > 0 {
            pool.reserve(hint);
        }
        let tail = pool.new_init(
            Node::new(K::default(), zeroed(), ptr::null_mut()),
            |n| n.is_end.init(true),
        );
        let root = pool.new_obj(Node::new(K::default(), zeroed(), tail));
        ListMap { root, pool }
    }

    /// Walk to the edge `cur -> nxt` where `nxt` is the first node with
    /// `key >= k`. Uses fence-free reads; callers re-validate under a
    /// lock before acting. Also returns `cur`'s predecessor for the
    /// removal protocol.
    fn find_location(&self, k: &K) -> (*mut Node<K, V>, *mut Node<K, V>, *mut Node<K, V>) {
        unsafe {
            let mut prev = ptr::null_mut();
            let mut cur = self.root;
            let mut nxt = (*cur).next.read();
            loop {
                // prefetch one edge ahead
                let nxt_nxt = (*nxt).next.read();
                if (*nxt).is_end.read() || (*nxt).key >= *k {
                    break;
                }
                prev = cur;
                cur = nxt;
                nxt = nxt_nxt;
            }
            (prev, cur, nxt)
        }
    }

    pub fn find(&self, key: &K) -> Option<V> {
        epoch::with_epoch(|| {
            let (_, _, nxt) = self.find_location(key);
            unsafe {
                if !(*nxt).is_end.read() && (*nxt).key == *key {
                    Some((*nxt).value.load())
                } else {
                    None
                }
            }
        })
    }

    /// Insert `key`; returns false if it was already present.
    pub fn insert(&self, key: K, value: V) -> bool {
        epoch::with_epoch(|| {
            epoch::try_loop(|| {
                let (prev, cur, nxt) = self.find_location(&key);
                unsafe {
                    if !(*nxt).is_end.read() && (*nxt).key == key {
                        return Some(false);
                    }
                    // a half-finished removal at prev could have marked
                    // cur removed but not yet spliced; waiting here
                    // keeps the retry loop from spinning against it
                    if !prev.is_null() {
                        (*prev).lck.wait_lock();
                    }
                    if (*cur).lck.try_lock(|| {
                        if (*cur).removed.load() || (*cur).next.load() != nxt {
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

    /// Insert `key` or update its value with `f`; returns true if a new
    /// key was inserted.
    ///
    /// `f` may run multiple times under contention; it sees the value
    /// current at each attempt.
    pub fn upsert<F: Fn(Option<V>) -> V>(&self, key: K, f: F) -> bool {
        epoch::with_epoch(|| {
            epoch::try_loop(|| {
                let (prev, cur, nxt) = self.find_location(&key);
                unsafe {
                    if !(*nxt).is_end.read() && (*nxt).key == key {
                        return if (*nxt).lck.try_lock(|| {
                            if (*nxt).removed.load() {
                                return false;
                            }
                            let old = (*nxt).value.load();
                            (*nxt).value.store(f(Some(old)));
                            true
                        }) {
                            Some(false)
                        } else {
                            None
                        };
                    }
                    if !prev.is_null() {
                        (*prev).lck.wait_lock();
                    }
                    if (*cur).lck.try_lock(|| {
                        if (*cur).removed.load() || (*cur).next.load() != nxt {
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

    /// Remove `key`; returns false if it was not present.
    pub fn remove(&self, key: &K) -> bool {
        epoch::with_epoch(|| {
            epoch::try_loop(|| {
                let (prev, cur, nxt) = self.find_location(key);
                unsafe {
                    if (*nxt).is_end.read() || (*nxt).key != *key {
                        return Some(false);
                    }
                    // serialize with holders whose splices overlap ours
                    if !prev.is_null() {
                        (*prev).lck.wait_lock();
                    }
                    (*nxt).lck.wait_lock();
                    if (*cur).lck.try_lock(|| {
                        if (*cur).removed.load()
                            || (*cur).next.load() != nxt
                            || (*nxt).lck.is_locked()
                        {
                            return false;
                        }
                        (*nxt).removed.store(true);
                        // a writer that acquired nxt before the flag was
                        // visible may still be splicing behind it; wait
                        // it out, then pick up its final successor
                        (*nxt).lck.wait_lock();
                        (*cur).next.store((*nxt).next.load());
                        self.pool.retire(nxt);
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

    /// Emit every `(k, v)` with `lo <= k <= hi`, ascending. The pass is
    /// not atomic with respect to concurrent writers.
    pub fn range<F: FnMut(K, V)>(&self, lo: &K, hi: &K, mut emit: F) {
        epoch::with_epoch(|| unsafe {
            let mut cur = (*self.root).next.load();
            while !(*cur).is_end.load() {
                let k = (*cur).key;
                if k > *hi {
                    break;
                }
                if k >= *lo {
                    emit(k, (*cur).value.load());
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

    /// Validate the structure (keys strictly ascending, guard words
    /// intact) and return the key count. Aborts on a violation.
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

impl<K, V: Word> ListMap<K, V> {
    fn destruct_all(&mut self) {
        unsafe {
            let mut cur = self.root;
            while !cur.is_null() {
                let nxt = (*cur).next.load();
                self.pool.destruct(cur);
                cur = nxt;
            }
        }
        self.root = ptr::null_mut();
    }
}

impl<K: Copy + Ord + Default, V: Word> Default for ListMap<K, V> {
    fn default() -> ListMap<K, V> {
        ListMap::new()
    }
}

impl<K, V: Word> Drop for ListMap<K, V> {
    fn drop(&mut self) {
        self.destruct_all();
        // the pool's own drop sweeps anything still on retire lists
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_insert_find_remove() {
        let m: ListMap<u64, u64> = ListMap::new();
        assert!(m.insert(2, 20));
        assert!(m.insert(1, 10));
        assert!(!m.insert(2, 99));
        assert_eq!(m.find(&1), Some(10));
        assert_eq!(m.find(&2), Some(20));
        assert_eq!(m.find(&3), None);
        assert!(m.remove(&1));
        assert!(!m.remove(&1));
        assert_eq!(m.find(&1), None);
        assert_eq!(m.check(), 1);
    }

    #[test]
    fn test_upsert() {
        let m: ListMap<u64, u64> = ListMap::new();
        assert!(m.upsert(5, |old| {
            assert_eq!(old, None);
            1
        }));
        assert!(!m.upsert(5, |old| old.unwrap() + 1));
        assert_eq!(m.find(&5), Some(2));
    }

    #[test]
    fn test_range_and_size() {
        let m: ListMap<u64, u64> = ListMap::new();
        for k in [9, 3, 7, 1, 5] {
            m.insert(k, k * 10);
        }
        let mut seen = Vec::new();
        m.range(&3, &7, |k, v| seen.push((k, v)));
        assert_eq!(seen, vec![(3, 30), (5, 50), (7, 70)]);
        assert_eq!(m.size(), 5);
    }

    #[test]
    fn test_clear_resets() {
        let mut m: ListMap<u64, u64> = ListMap::new();
        for k in 0..32 {
            m.insert(k, k);
        }
        m.clear();
        assert_eq!(m.size(), 0);
        assert!(m.insert(1, 1));
        assert_eq!(m.find(&1), Some(1));
    }
}
