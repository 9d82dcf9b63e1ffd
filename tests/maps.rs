//! Map scenarios shared by all three structures: the smoke sequence,
//! the insert/find/remove laws, and mixed multi-threaded workloads with
//! post-run count accounting.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering::SeqCst;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use keel::sync::hash::HashMap;
use keel::sync::list::ListMap;
use keel::sync::snaplist::SnapList;

/// The uniform surface the shared scenarios drive.
trait Map: Sync {
    fn find(&self, k: u64) -> Option<u64>;
    fn insert(&self, k: u64, v: u64) -> bool;
    fn upsert(&self, k: u64, f: &dyn Fn(Option<u64>) -> u64) -> bool;
    fn remove(&self, k: u64) -> bool;
    fn check(&self) -> usize;
}

macro_rules! impl_map {
    ($ty:ty) => {
        impl Map for $ty {
            fn find(&self, k: u64) -> Option<u64> {
                <$ty>::find(self, &k)
            }
            fn insert(&self, k: u64, v: u64) -> bool {
                <$ty>::insert(self, k, v)
            }
            fn upsert(&self, k: u64, f: &dyn Fn(Option<u64>) -> u64) -> bool {
                <$ty>::upsert(self, k, f)
            }
            fn remove(&self, k: u64) -> bool {
                <$ty>::remove(self, &k)
            }
            fn check(&self) -> usize {
                <$ty>::check(self)
            }
        }
    };
}

impl_map!(ListMap<u64, u64>);
impl_map!(SnapList<u64, u64>);
impl_map!(HashMap<u64, u64>);

fn smoke<M: Map>(map: &M) {
    for k in [3, 7, 1, 11] {
        assert!(map.insert(k, 123));
    }
    assert!(map.remove(3));
    assert_eq!(map.find(7), Some(123));
    assert_eq!(map.find(1), Some(123));
    assert_eq!(map.find(11), Some(123));
    assert_eq!(map.find(10), None);
    assert_eq!(map.find(3), None);
    assert_eq!(map.check(), 3);
}

fn laws<M: Map>(map: &M) {
    for k in 0..100 {
        assert!(map.insert(k, k + 1000));
        assert_eq!(map.find(k), Some(k + 1000));
        assert!(map.remove(k));
        assert_eq!(map.find(k), None);
        assert!(!map.remove(k));
    }
    assert!(map.upsert(5, &|old| {
        assert_eq!(old, None);
        1
    }));
    assert!(!map.upsert(5, &|old| old.unwrap() + 1));
    assert_eq!(map.find(5), Some(2));
    assert_eq!(map.check(), 1);
}

fn mixed<M: Map>(map: &M) {
    const THREADS: usize = 4;
    const OPS: usize = 30_000;
    const SPACE: u64 = 512;

    let mut initial = 0;
    for k in (0..SPACE).step_by(2) {
        assert!(map.insert(k, k));
        initial += 1;
    }

    let inserts = AtomicU64::new(0);
    let removes = AtomicU64::new(0);

    std::thread::scope(|scope| {
        for tid in 0..THREADS {
            let inserts = &inserts;
            let removes = &removes;
            scope.spawn(move || {
                let mut rng = StdRng::seed_from_u64(42 + tid as u64);
                for _ in 0..OPS {
                    let k = rng.gen_range(0..SPACE);
                    match rng.gen_range(0..4u32) {
                        0 => {
                            if map.insert(k, k) {
                                inserts.fetch_add(1, SeqCst);
                            }
                        }
                        1 => {
                            if map.remove(k) {
                                removes.fetch_add(1, SeqCst);
                            }
                        }
                        _ => {
                            std::hint::black_box(map.find(k));
                        }
                    }
                }
            });
        }
    });

    let expected = initial + inserts.load(SeqCst) - removes.load(SeqCst);
    assert_eq!(map.check() as u64, expected);
}

#[test]
fn test_list_smoke() {
    smoke(&ListMap::<u64, u64>::new());
}

#[test]
fn test_snaplist_smoke() {
    smoke(&SnapList::<u64, u64>::new());
}

#[test]
fn test_hash_smoke() {
    smoke(&HashMap::<u64, u64>::new(16));
}

#[test]
fn test_list_laws() {
    laws(&ListMap::<u64, u64>::new());
}

#[test]
fn test_snaplist_laws() {
    laws(&SnapList::<u64, u64>::new());
}

#[test]
fn test_hash_laws() {
    laws(&HashMap::<u64, u64>::new(64));
}

#[test]
fn test_list_mixed_workload() {
    mixed(&ListMap::<u64, u64>::new());
}

#[test]
fn test_snaplist_mixed_workload() {
    mixed(&SnapList::<u64, u64>::new());
}

#[test]
fn test_hash_mixed_workload() {
    mixed(&HashMap::<u64, u64>::new(SPACE_HINT));
}

const SPACE_HINT: usize = 512;

#[test]
fn test_list_ordered_iteration_after_churn() {
    let map = ListMap::<u64, u64>::new();
    let mut rng = StdRng::seed_from_u64(7);
    for _ in 0..2000 {
        let k = rng.gen_range(0..256u64);
        if rng.gen_bool(0.5) {
            map.insert(k, k);
        } else {
            map.remove(&k);
        }
    }
    // check() verifies strict ordering on top of the count
    let n = map.check();
    let mut collected = Vec::new();
    map.range(&0, &255, |k, _| collected.push(k));
    assert_eq!(collected.len(), n);
    assert!(collected.windows(2).all(|w| w[0] < w[1]));
}
