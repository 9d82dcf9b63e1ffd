//! Word-sized fields with optimistic-read support.
//!
//! All three field kinds pack their payload into one atomic word, so a
//! reader never observes a torn value:
//!
//! - [`WriteOnce`] — published exactly once after initialization;
//!   readers observe the initial value or the published value, nothing
//!   else. Used for sticky flags (`removed`, `is_end`) and immutable
//!   keys.
//! - [`MutableVal`] — a plain release/acquire field.
//! - [`OptPtr`] — a pointer with a `read`/`validate` pair for
//!   optimistic traversals: `read` skips the acquire fence, and a later
//!   `validate` confirms no store landed in between.
//!
//! `validate` is an equality re-check. It implies "unchanged the whole
//! time" because these fields only ever hold pool pointers and epoch
//! reclamation forbids a pointer from being freed and recycled while
//! the validating reader is announced.

use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release, SeqCst};
use std::sync::atomic::{AtomicPtr, AtomicU64};

/// Payloads that fit one atomic word.
///
/// Implementations must also accept the all-zero word as a valid value;
/// containers materialize sentinel payloads from it.
pub trait Word: Copy {
    fn into_word(self) -> u64;

    /// # Safety
    ///
    /// `w` must have been produced by `into_word` on the same type, or
    /// be zero.
    unsafe fn from_word(w: u64) -> Self;
}

/// The all-zero value of a word type; used for sentinel slots whose
/// payload is never observed.
pub(crate) fn zeroed<T: Word>() -> T {
    unsafe { T::from_word(0) }
}

macro_rules! int_word {
    ($($t:ty),*) => {
        $(impl Word for $t {
            fn into_word(self) -> u64 {
                self as u64
            }
            unsafe fn from_word(w: u64) -> $t {
                w as $t
            }
        })*
    };
}

int_word!(u8, u16, u32, u64, usize, i8, i16, i32, i64, isize);

impl Word for bool {
    fn into_word(self) -> u64 {
        self as u64
    }
    unsafe fn from_word(w: u64) -> bool {
        w != 0
    }
}

impl<T> Word for *mut T {
    fn into_word(self) -> u64 {
        self as u64
    }
    unsafe fn from_word(w: u64) -> *mut T {
        w as *mut T
    }
}

impl<T> Word for *const T {
    fn into_word(self) -> u64 {
        self as u64
    }
    unsafe fn from_word(w: u64) -> *const T {
        w as *const T
    }
}

/// A field that is published at most once after initialization.
///
/// Readers racing with the publication observe either the initial or
/// the published value; once a reader has seen the published value,
/// every later reader does too.
pub struct WriteOnce<T: Word> {
    v: AtomicU64,
    _marker: PhantomData<T>,
}

impl<T: Word> WriteOnce<T> {
    pub fn new(v: T) -> WriteOnce<T> {
        WriteOnce {
            v: AtomicU64::new(v.into_word()),
            _marker: PhantomData,
        }
    }

    /// Reset the initial value. Only before the field is shared.
    pub fn init(&self, v: T) {
        self.v.store(v.into_word(), Relaxed);
    }

    /// Publish the final value. Must be called at most once after
    /// `init`; the single-writer discipline is the caller's (normally
    /// the holder of the owning object's lock).
    pub fn store(&self, v: T) {
        self.v.store(v.into_word(), Release);
    }

    pub fn load(&self) -> T {
        unsafe { T::from_word(self.v.load(Acquire)) }
    }

    /// Fence-free read for optimistic traversals; pair with
    /// [`WriteOnce::validate`].
    pub fn read(&self) -> T {
        unsafe { T::from_word(self.v.load(Relaxed)) }
    }

    pub fn validate(&self, prev: T) -> bool {
        self.v.load(SeqCst) == prev.into_word()
    }
}

/// An ordinary atomic field: release stores, acquire loads.
pub struct MutableVal<T: Word> {
    v: AtomicU64,
    _marker: PhantomData<T>,
}

impl<T: Word> MutableVal<T> {
    pub fn new(v: T) -> MutableVal<T> {
        MutableVal {
            v: AtomicU64::new(v.into_word()),
            _marker: PhantomData,
        }
    }

    pub fn init(&self, v: T) {
        self.v.store(v.into_word(), Relaxed);
    }

    pub fn load(&self) -> T {
        unsafe { T::from_word(self.v.load(Acquire)) }
    }

    pub fn store(&self, v: T) {
        self.v.store(v.into_word(), Release);
    }

    /// Fence-free read; pair with [`MutableVal::validate`].
    pub fn read(&self) -> T {
        unsafe { T::from_word(self.v.load(Relaxed)) }
    }

    pub fn validate(&self, prev: T) -> bool {
        self.v.load(SeqCst) == prev.into_word()
    }

    pub fn cas(&self, old: T, new: T) -> bool {
        self.v
            .compare_exchange(old.into_word(), new.into_word(), SeqCst, Relaxed)
            .is_ok()
    }
}

/// An optimistically readable pointer.
///
/// `load` is the ordinary acquire read. `read` elides the fence and is
/// only meaningful when followed by `validate` on the same field (or by
/// a lock acquisition that re-checks it), which confirms the pointer
/// held the same value throughout.
pub struct OptPtr<T> {
    p: AtomicPtr<T>,
}

impl<T> OptPtr<T> {
    pub const fn null() -> OptPtr<T> {
        OptPtr {
            p: AtomicPtr::new(ptr::null_mut()),
        }
    }

    pub fn new(p: *mut T) -> OptPtr<T> {
        OptPtr {
            p: AtomicPtr::new(p),
        }
    }

    /// Reset the pointer. Only before the field is shared.
    pub fn init(&self, p: *mut T) {
        self.p.store(p, Relaxed);
    }

    pub fn load(&self) -> *mut T {
        self.p.load(Acquire)
    }

    /// Fence-free read; pair with [`OptPtr::validate`].
    pub fn read(&self) -> *mut T {
        self.p.load(Relaxed)
    }

    pub fn validate(&self, prev: *mut T) -> bool {
        self.p.load(SeqCst) == prev
    }

    pub fn store(&self, p: *mut T) {
        self.p.store(p, Release);
    }

    pub fn cas(&self, old: *mut T, new: *mut T) -> bool {
        self.p.compare_exchange(old, new, SeqCst, Relaxed).is_ok()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_word_round_trips() {
        unsafe {
            assert!(bool::from_word(true.into_word()));
            assert!(!bool::from_word(false.into_word()));
            assert_eq!(i64::from_word((-5i64).into_word()), -5);
            assert_eq!(u32::from_word(7u32.into_word()), 7);
            let p = &mut 3u8 as *mut u8;
            assert_eq!(<*mut u8>::from_word(p.into_word()), p);
        }
    }

    #[test]
    fn test_write_once_observes_two_values() {
        let w = WriteOnce::new(false);
        assert!(!w.load());
        w.store(true);
        assert!(w.load());
        assert!(w.read());
    }

    #[test]
    fn test_mutable_val_validate() {
        let m = MutableVal::new(1u64);
        let seen = m.read();
        assert!(m.validate(seen));
        m.store(2);
        assert!(!m.validate(seen));
        assert!(m.cas(2, 3));
        assert!(!m.cas(2, 4));
        assert_eq!(m.load(), 3);
    }

    #[test]
    fn test_opt_ptr_validate() {
        let mut a = 1u32;
        let mut b = 2u32;
        let p: OptPtr<u32> = OptPtr::null();
        p.init(&mut a);
        let seen = p.read();
        assert!(p.validate(seen));
        p.store(&mut b);
        assert!(!p.validate(seen));
        assert!(p.cas(&mut b, &mut a));
        assert_eq!(p.load(), &mut a as *mut u32);
    }
}
