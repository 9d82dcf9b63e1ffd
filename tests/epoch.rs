//! Epoch and pool scenarios: retire round trips, cancelation, hook
//! firing, and the bulk-retire sweep.

use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::Arc;

use keel::mem::epoch::{self, pool::Pool};

struct Counted(Arc<AtomicUsize>);

impl Drop for Counted {
    fn drop(&mut self) {
        self.0.fetch_add(1, SeqCst);
    }
}

/// Drive `update_epoch`/`collect` until the calling worker's retire
/// lists drain. Tolerates transient announcements from sibling tests.
fn drain(pool: &Pool<Counted>) {
    for _ in 0..1000 {
        epoch::update_epoch();
        pool.collect();
        if pool.stats().retired == 0 {
            return;
        }
        std::thread::yield_now();
    }
    panic!("retire lists failed to drain");
}

#[test]
fn test_retire_frees_after_two_epochs() {
    let drops = Arc::new(AtomicUsize::new(0));
    let pool: Pool<Counted> = Pool::new();

    let p = pool.new_obj(Counted(drops.clone()));
    epoch::with_epoch(|| unsafe {
        pool.retire(p);
    });
    assert_eq!(drops.load(SeqCst), 0);

    drain(&pool);
    assert_eq!(drops.load(SeqCst), 1);
    assert_eq!(pool.stats().live, 0);
}

#[test]
fn test_cancel_keeps_object_alive() {
    let drops = Arc::new(AtomicUsize::new(0));
    let pool: Pool<Counted> = Pool::new();

    let p = pool.new_obj(Counted(drops.clone()));
    let h = epoch::with_epoch(|| unsafe { pool.retire(p) });
    unsafe { h.cancel() };

    drain(&pool);
    assert_eq!(drops.load(SeqCst), 0);

    // the object is still ours; a second retire frees it for real
    epoch::with_epoch(|| unsafe {
        pool.retire(p);
    });
    drain(&pool);
    assert_eq!(drops.load(SeqCst), 1);
}

#[test]
fn test_epoch_hooks_fire_around_increment() {
    static BEFORE: AtomicUsize = AtomicUsize::new(0);
    static AFTER: AtomicUsize = AtomicUsize::new(0);
    epoch::register_before_hook(|| {
        BEFORE.fetch_add(1, SeqCst);
    });
    epoch::register_after_hook(|| {
        AFTER.fetch_add(1, SeqCst);
    });

    let start = epoch::current();
    for _ in 0..1000 {
        epoch::update_epoch();
        if epoch::current() >= start + 2 {
            break;
        }
        std::thread::yield_now();
    }
    assert!(epoch::current() >= start + 2);
    assert!(BEFORE.load(SeqCst) >= 2);
    assert!(AFTER.load(SeqCst) >= 2);
}

#[test]
fn test_corruption_detector_sees_clobbered_tail() {
    let pool: Pool<u64> = Pool::new();
    let p = pool.new_obj(7);
    assert!(pool.check_not_corrupted(p));

    #[cfg(feature = "memcheck")]
    {
        pool.clobber_tail(p);
        assert!(!pool.check_not_corrupted(p));
    }
    // not retired, so the sweep never sees (and never aborts on) it
    unsafe { pool.destruct(p) };
}

#[test]
fn test_bulk_retire_sweep() {
    const RETIRES: usize = 100_000;
    let drops = Arc::new(AtomicUsize::new(0));
    let pool: Pool<Counted> = Pool::new();
    let done = AtomicUsize::new(0);

    std::thread::scope(|scope| {
        // retire in a tight loop; pacing keeps the lists bounded
        scope.spawn(|| {
            for _ in 0..RETIRES {
                let p = pool.new_obj(Counted(drops.clone()));
                epoch::with_epoch(|| unsafe {
                    pool.retire(p);
                });
            }
            // everything this worker retired drains from this worker
            drain(&pool);
            done.store(1, SeqCst);
        });

        // a second worker drifting in and out of epochs must not block
        // reclamation
        scope.spawn(|| {
            while done.load(SeqCst) == 0 {
                epoch::with_epoch(|| {});
                std::thread::yield_now();
            }
        });
    });

    assert_eq!(drops.load(SeqCst), RETIRES);
    let stats = pool.stats();
    assert_eq!(stats.retired, 0);
    assert_eq!(stats.live, 0);
    // storage was recycled, not hoarded: far fewer slots than retires
    assert!(stats.free < RETIRES / 2);
}
