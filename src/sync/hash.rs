//! A fixed-size bucket-array hash map.
//!
//! Each bucket is a singly-linked chain behind a `MutableVal` head and
//! a version counter. Readers traverse without locking; writers take
//! the *address-hashed* lock for the slot (no lock word in the slot
//! itself) and re-check the version counter inside it, so a reader's
//! optimistic walk and a writer's splice never disagree about the
//! chain. The table never resizes.
//!
//! Keys are hashed with FNV-1a. Since hashed locks are try-only and a
//! writer holds at most one, accidental cell collisions between
//! unrelated slots cost a retry, never a deadlock.

use std::hash::{Hash, Hasher};
use std::ptr;

use crate::mem::epoch::{
    self,
    pool::{Pool, PoolStats},
};
use crate::mem::field::{MutableVal, Word};
use crate::mem::lock;

const FNV_OFFSET: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x100000001b3;

struct Fnv1a(u64);

impl Hasher for Fnv1a {
    fn finish(&self) -> u64 {
        self.0
    }

    fn write(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.0 ^= b as u64;
            self.0 = self.0.wrapping_mul(FNV_PRIME);
        }
    }
}

struct Node<K, V: Word> {
    key: K,
    value: MutableVal<V>,
    next: MutableVal<*mut Node<K, V>>,
}

struct Slot<K, V: Word> {
    head: MutableVal<*mut Node<K, V>>,
    version: MutableVal<u64>,
}

/// An unordered map over a fixed power-of-two bucket array.
pub struct HashMap<K, V: Word> {
    table: Vec<Slot<K, V>>,
    mask: usize,
    pool: Pool<Node<K, V>>,
}

unsafe impl<K: Send, V: Word + Send> Send for HashMap<K, V> {}
unsafe impl<K: Send + Sync, V: Word + Send + Sync> Sync for HashMap<K, V> {}

impl<K: Copy + Eq + Hash, V: Word> HashMap<K, V> {
    /// A map sized for about `n` keys: `2 * n.next_power_of_two()`
    /// buckets, fixed for the map's lifetime.
    pub fn new(n: usize) -> HashMap<K, V> {
        let len = 2 * n.next_power_of_two().max(1);
        let mut table = Vec::with_capacity(len);
        for _ in 0..len {
            table.push(Slot {
                head: MutableVal::new(ptr::null_mut()),
                version: MutableVal::new(0),
            });
        }
        HashMap {
            table,
            mask: len - 1,
            pool: Pool::new(),
        }
    }

    fn slot(&self, key: &K) -> &Slot<K, V> {
        let mut h = Fnv1a(FNV_OFFSET);
        key.hash(&mut h);
        &self.table[(h.finish() as usize) & self.mask]
    }

    /// Walk `s`'s chain to `key`. Returns the link holding the match
    /// (the slot head or a node's `next`) and the matching node, null
    /// if absent — in which case the link is the chain's tail link.
    unsafe fn find_in_slot(
        s: &Slot<K, V>,
        key: &K,
    ) -> (*const MutableVal<*mut Node<K, V>>, *mut Node<K, V>) {
        let mut cur: *const MutableVal<*mut Node<K, V>> = &s.head;
        let mut nxt = (*cur).load();
        while !nxt.is_null() && (*nxt).key != *key {
            cur = &(*nxt).next;
            nxt = (*cur).load();
        }
        (cur, nxt)
    }

    pub fn find(&self, key: &K) -> Option<V> {
        let s = self.slot(key);
        epoch::with_epoch(|| unsafe {
            let (_, nxt) = Self::find_in_slot(s, key);
            if nxt.is_null() {
                None
            } else {
                Some((*nxt).value.load())
            }
        })
    }

    pub fn insert(&self, key: K, value: V) -> bool {
        let s = self.slot(&key);
        epoch::with_epoch(|| {
            epoch::try_loop(|| {
                let vn = s.version.load();
                unsafe {
                    let (cur, nxt) = Self::find_in_slot(s, &key);
                    if !nxt.is_null() {
                        return Some(false);
                    }
                    let outcome = lock::try_lock_hashed(s as *const Slot<K, V> as usize, || {
                        if s.version.load() != vn {
                            return false;
                        }
                        let node = self.pool.new_obj(Node {
                            key,
                            value: MutableVal::new(value),
                            next: MutableVal::new(ptr::null_mut()),
                        });
                        (*cur).store(node);
                        s.version.store(vn + 1);
                        true
                    });
                    if outcome {
                        Some(true)
                    } else {
                        None
                    }
                }
            })
        })
    }

    /// Insert `key` or update its value in place with `f`; returns true
    /// if a new key was inserted.
    pub fn upsert<F: Fn(Option<V>) -> V>(&self, key: K, f: F) -> bool {
        let s = self.slot(&key);
        epoch::with_epoch(|| {
            epoch::try_loop(|| {
                let vn = s.version.load();
                unsafe {
                    let (cur, nxt) = Self::find_in_slot(s, &key);
                    let outcome = lock::try_lock_hashed(s as *const Slot<K, V> as usize, || {
                        if s.version.load() != vn {
                            return false;
                        }
                        if nxt.is_null() {
                            let node = self.pool.new_obj(Node {
                                key,
                                value: MutableVal::new(f(None)),
                                next: MutableVal::new(ptr::null_mut()),
                            });
                            (*cur).store(node);
                            s.version.store(vn + 1);
                        } else {
                            let old = (*nxt).value.load();
                            (*nxt).value.store(f(Some(old)));
                        }
                        true
                    });
                    if outcome {
                        Some(nxt.is_null())
                    } else {
                        None
                    }
                }
            })
        })
    }

    pub fn remove(&self, key: &K) -> bool {
        let s = self.slot(key);
        epoch::with_epoch(|| {
            epoch::try_loop(|| {
                let vn = s.version.load();
                unsafe {
                    let (cur, nxt) = Self::find_in_slot(s, key);
                    if nxt.is_null() {
                        return Some(false);
                    }
                    let outcome = lock::try_lock_hashed(s as *const Slot<K, V> as usize, || {
                        if s.version.load() != vn {
                            return false;
                        }
                        (*cur).store((*nxt).next.load());
                        self.pool.retire(nxt);
                        s.version.store(vn + 1);
                        true
                    });
                    if outcome {
                        Some(true)
                    } else {
                        None
                    }
                }
            })
        })
    }

    pub fn size(&self) -> usize {
        epoch::with_epoch(|| {
            let mut count = 0;
            for s in self.table.iter() {
                let mut cur = s.head.load();
                while !cur.is_null() {
                    count += 1;
                    cur = unsafe { (*cur).next.load() };
                }
            }
            count
        })
    }

    /// Validate every chain (guard words intact, no duplicate keys in a
    /// bucket) and return the key count. Aborts on a violation.
    pub fn check(&self) -> usize {
        epoch::with_epoch(|| {
            let mut count = 0;
            for s in self.table.iter() {
                let mut cur = s.head.load();
                while !cur.is_null() {
                    unsafe {
                        if !self.pool.check_not_corrupted(cur) {
                            std::process::abort();
                        }
                        let mut scan = (*cur).next.load();
                        while !scan.is_null() {
                            if (*scan).key == (*cur).key {
                                eprintln!("keel: duplicate key in hash chain");
                                std::process::abort();
                            }
                            scan = (*scan).next.load();
                        }
                        count += 1;
                        cur = (*cur).next.load();
                    }
                }
            }
            count
        })
    }

    /// Single-threaded teardown and reset to an empty map.
    pub fn clear(&mut self) {
        for i in 0..self.table.len() {
            unsafe {
                let mut cur = self.table[i].head.load();
                while !cur.is_null() {
                    let nxt = (*cur).next.load();
                    self.pool.destruct(cur);
                    cur = nxt;
                }
            }
            self.table[i].head.init(ptr::null_mut());
            self.table[i].version.init(0);
        }
        self.pool.clear();
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

impl<K, V: Word> Drop for HashMap<K, V> {
    fn drop(&mut self) {
        for s in self.table.iter() {
            unsafe {
                let mut cur = s.head.load();
                while !cur.is_null() {
                    let nxt = (*cur).next.load();
                    self.pool.destruct(cur);
                    cur = nxt;
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_insert_find_remove() {
        let m: HashMap<u64, u64> = HashMap::new(16);
        assert!(m.insert(1, 10));
        assert!(m.insert(2, 20));
        assert!(!m.insert(1, 99));
        assert_eq!(m.find(&1), Some(10));
        assert_eq!(m.find(&2), Some(20));
        assert_eq!(m.find(&3), None);
        assert!(m.remove(&1));
        assert!(!m.remove(&1));
        assert_eq!(m.find(&1), None);
        assert_eq!(m.check(), 1);
    }

    #[test]
    fn test_colliding_keys_chain() {
        // a 2-bucket table forces long chains
        let m: HashMap<u64, u64> = HashMap::new(1);
        for k in 0..64 {
            assert!(m.insert(k, k + 100));
        }
        for k in 0..64 {
            assert_eq!(m.find(&k), Some(k + 100));
        }
        assert_eq!(m.check(), 64);
        for k in (0..64).step_by(2) {
            assert!(m.remove(&k));
        }
        assert_eq!(m.size(), 32);
    }

    #[test]
    fn test_upsert_in_place() {
        let m: HashMap<u64, u64> = HashMap::new(8);
        assert!(m.upsert(7, |old| {
            assert_eq!(old, None);
            1
        }));
        assert!(!m.upsert(7, |old| old.unwrap() + 1));
        assert_eq!(m.find(&7), Some(2));
    }

    #[test]
    fn test_clear_resets() {
        let mut m: HashMap<u64, u64> = HashMap::new(8);
        for k in 0..32 {
            m.insert(k, k);
        }
        m.clear();
        assert_eq!(m.size(), 0);
        assert!(m.insert(3, 3));
        assert_eq!(m.find(&3), Some(3));
    }
}
