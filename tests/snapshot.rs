//! Snapshot consistency: a reader inside `with_snapshot` must observe a
//! single instant of the structure even while a writer churns it.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::SeqCst;

use keel::mem::epoch::with_snapshot;
use keel::sync::snaplist::SnapList;

/// Writer inserts `1..=N` ascending then removes them descending, so
/// the live key set is always a prefix `{1..=m}`. Every snapshot must
/// observe exactly such a prefix.
#[test]
fn test_snapshot_reads_are_prefix_consistent() {
    const N: u64 = 1000;

    let map: SnapList<u64, u64> = SnapList::new();
    let done = AtomicBool::new(false);

    std::thread::scope(|scope| {
        scope.spawn(|| {
            // paced so the query thread lands several snapshots per phase
            for k in 1..=N {
                assert!(map.insert(k, k));
                if k % 25 == 0 {
                    std::thread::sleep(std::time::Duration::from_micros(500));
                }
            }
            for k in (1..=N).rev() {
                assert!(map.remove(&k));
                if k % 25 == 0 {
                    std::thread::sleep(std::time::Duration::from_micros(500));
                }
            }
            done.store(true, SeqCst);
        });

        scope.spawn(|| {
            let mut snapshots = 0u64;
            let mut intermediate = 0u64;
            while !done.load(SeqCst) {
                let mut seen = vec![false; (N + 1) as usize];
                let mut max_seen = 0u64;
                with_snapshot(|| {
                    for k in 1..=N {
                        if let Some(v) = map.find(&k) {
                            seen[v as usize] = true;
                            max_seen = max_seen.max(v);
                        }
                    }
                });
                // exactly the prefix {1..=max_seen}
                for k in 1..=N {
                    assert_eq!(
                        seen[k as usize],
                        k <= max_seen,
                        "snapshot saw a non-prefix state (max_seen = {})",
                        max_seen
                    );
                }
                snapshots += 1;
                if max_seen > 2 && max_seen < N - 3 {
                    intermediate += 1;
                }
            }
            assert!(snapshots >= 3, "query thread barely ran");
            assert!(
                intermediate >= 3,
                "expected at least three intermediate states, saw {}",
                intermediate
            );
        });
    });

    assert_eq!(map.check(), 0);
}

/// A snapshot taken between two bursts of writes pins the state in
/// between, regardless of how many writes land afterwards.
#[test]
fn test_snapshot_pins_across_later_writes() {
    let map: SnapList<u64, u64> = SnapList::new();
    for k in 0..50 {
        map.insert(k, k);
    }

    with_snapshot(|| {
        for k in 0..50 {
            assert_eq!(map.find(&k), Some(k));
        }
        // concurrent-looking churn from the same thread: stamped after
        // the snapshot, so invisible inside it
        for k in 0..50 {
            map.remove(&k);
        }
        for k in 100..150 {
            map.insert(k, k);
        }
        for k in 0..50 {
            assert_eq!(map.find(&k), Some(k));
        }
        assert_eq!(map.find(&120), None);
    });

    assert_eq!(map.find(&0), None);
    assert_eq!(map.find(&120), Some(120));
    assert_eq!(map.check(), 50);
}

/// Upsert replaces nodes, so a snapshot keeps reading the value it
/// pinned.
#[test]
fn test_snapshot_value_stability_under_upsert() {
    let map: SnapList<u64, u64> = SnapList::new();
    map.insert(1, 10);

    with_snapshot(|| {
        assert_eq!(map.find(&1), Some(10));
        map.upsert(1, |old| old.unwrap() + 1);
        assert_eq!(map.find(&1), Some(10));
    });

    assert_eq!(map.find(&1), Some(11));
}
