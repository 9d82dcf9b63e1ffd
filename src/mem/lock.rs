//! Try-lock primitives for writers.
//!
//! Two flavors share one protocol:
//!
//! - [`Lock`] is an 8-byte cell embedded in the owning object.
//! - The address-hashed table ([`try_lock_hashed`]) maps an arbitrary
//!   address or integer key onto one of a fixed number of process-wide
//!   cells, for objects that cannot afford a lock word. Unrelated
//!   objects can share a cell.
//!
//! Because hashed cells are shared by unrelated objects, the hashed
//! flavor is *try-lock only*: a client that blocks while holding a
//! hashed cell can form an accidental hold-and-wait cycle with an
//! unrelated client. For the same reason, a protocol that ever blocks
//! (for example [`Lock::wait_lock`] chains) must never mix hashed and
//! inline locks in one ordered chain. Nested hashed acquires on a
//! single thread are rejected in debug builds.
//!
//! Locks are not reentrant: `try_lock` on a cell the caller already
//! holds simply fails.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release};

use crate::mem::epoch;

const UNLOCKED: u64 = 0;

/// An 8-byte try-lock. The cell holds 0 when free, or an opaque owner
/// tag while held.
pub struct Lock {
    state: AtomicU64,
}

struct ReleaseOnDrop<'a>(&'a AtomicU64);

impl Drop for ReleaseOnDrop<'_> {
    fn drop(&mut self) {
        self.0.store(UNLOCKED, Release);
    }
}

impl Lock {
    pub const fn new() -> Lock {
        Lock {
            state: AtomicU64::new(UNLOCKED),
        }
    }

    fn tag() -> u64 {
        epoch::my_id() as u64 + 1
    }

    /// Try to acquire the lock; on success run `f` and release (also on
    /// unwind). Returns `f`'s result, or `false` if the lock was held.
    pub fn try_lock<F: FnOnce() -> bool>(&self, f: F) -> bool {
        self.try_lock_result(f).unwrap_or(false)
    }

    /// Like [`Lock::try_lock`] but propagates `f`'s result; `None`
    /// means the lock was held and `f` never ran.
    pub fn try_lock_result<R, F: FnOnce() -> R>(&self, f: F) -> Option<R> {
        if self
            .state
            .compare_exchange(UNLOCKED, Self::tag(), Acquire, Relaxed)
            .is_err()
        {
            return None;
        }
        let _release = ReleaseOnDrop(&self.state);
        Some(f())
    }

    /// Spin until the lock is free, without acquiring it.
    ///
    /// Used to serialize with a concurrent holder: once this returns,
    /// the holder observed at entry has released, so its writes are
    /// visible.
    pub fn wait_lock(&self) {
        let mut spins = 0u32;
        while self.state.load(Acquire) != UNLOCKED {
            spins = spins.saturating_add(1);
            for _ in 0..spins.min(64) {
                std::hint::spin_loop();
            }
        }
    }

    pub fn is_locked(&self) -> bool {
        self.state.load(Relaxed) != UNLOCKED
    }
}

impl Default for Lock {
    fn default() -> Lock {
        Lock::new()
    }
}

/// Number of cells in the process-wide hashed lock table.
pub const LOCK_TABLE_SIZE: usize = 1 << 12;

const LOCK_TABLE_BITS: u32 = LOCK_TABLE_SIZE.trailing_zeros();

const LOCK_INIT: Lock = Lock::new();
static LOCK_TABLE: [Lock; LOCK_TABLE_SIZE] = [LOCK_INIT; LOCK_TABLE_SIZE];

/// The table cell a key maps to. Exposed so tests can construct
/// deliberate collisions.
pub fn lock_index(key: usize) -> usize {
    ((key as u64).wrapping_mul(0x9ddfea08eb382d69) >> (64 - LOCK_TABLE_BITS)) as usize
}

#[cfg(debug_assertions)]
mod nesting {
    use std::cell::Cell;

    thread_local! {
        static HASHED_HELD: Cell<bool> = const { Cell::new(false) };
    }

    pub struct Depth;

    impl Depth {
        pub fn enter() -> Depth {
            HASHED_HELD.with(|h| {
                assert!(!h.get(), "nested hashed-lock acquire");
                h.set(true);
            });
            Depth
        }
    }

    impl Drop for Depth {
        fn drop(&mut self) {
            HASHED_HELD.with(|h| h.set(false));
        }
    }
}

/// Try the hashed cell for `key`; on success run `f` and release.
/// Returns `f`'s result, or `false` if the cell was held (possibly by
/// an unrelated key that happens to collide).
pub fn try_lock_hashed<F: FnOnce() -> bool>(key: usize, f: F) -> bool {
    #[cfg(debug_assertions)]
    let _depth = nesting::Depth::enter();
    LOCK_TABLE[lock_index(key)].try_lock(f)
}

/// Like [`try_lock_hashed`] but propagates `f`'s result.
pub fn try_lock_hashed_result<R, F: FnOnce() -> R>(key: usize, f: F) -> Option<R> {
    #[cfg(debug_assertions)]
    let _depth = nesting::Depth::enter();
    LOCK_TABLE[lock_index(key)].try_lock_result(f)
}

pub fn is_locked_hashed(key: usize) -> bool {
    LOCK_TABLE[lock_index(key)].is_locked()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_lock_is_one_word() {
        assert_eq!(std::mem::size_of::<Lock>(), 8);
    }

    #[test]
    fn test_try_lock_runs_closure() {
        let l = Lock::new();
        assert!(!l.is_locked());
        assert!(l.try_lock(|| {
            assert!(l.is_locked());
            // not reentrant: a second acquire on the held cell fails
            assert!(!l.try_lock(|| true));
            true
        }));
        assert!(!l.is_locked());
        // the closure's verdict passes through
        assert!(!l.try_lock(|| false));
    }

    #[test]
    fn test_try_lock_result() {
        let l = Lock::new();
        assert_eq!(l.try_lock_result(|| 42), Some(42));
        let nested = l.try_lock_result(|| l.try_lock_result(|| 1));
        assert_eq!(nested, Some(None));
    }

    #[test]
    fn test_release_on_unwind() {
        let l = Lock::new();
        let r = std::panic::catch_unwind(|| {
            l.try_lock(|| panic!("boom"));
        });
        assert!(r.is_err());
        assert!(!l.is_locked());
        assert!(l.try_lock(|| true));
    }

    #[test]
    fn test_wait_lock_does_not_acquire() {
        let l = Lock::new();
        l.wait_lock();
        assert!(!l.is_locked());
    }

    #[test]
    fn test_hashed_collisions_share_a_cell() {
        // find a second key mapping to the cell of key 1
        let target = lock_index(1);
        let other = (2usize..).find(|&k| lock_index(k) == target).unwrap();
        assert!(try_lock_hashed(1, || {
            // the colliding key observes the same cell as held
            assert!(is_locked_hashed(other));
            true
        }));
        assert!(!is_locked_hashed(1));
        assert!(!is_locked_hashed(other));
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "nested hashed-lock acquire")]
    fn test_nested_hashed_acquire_rejected() {
        try_lock_hashed(3, || try_lock_hashed(4, || true));
    }
}
