// Definition of global epoch state. The `get` function is the way to
// access this data externally.

use std::sync::atomic::Ordering::Relaxed;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize};
use std::sync::Mutex;

use crate::mem::CachePadded;

/// Upper bound on concurrently-live registered worker threads.
///
/// Worker slots are recycled when a thread exits, so this bounds live
/// threads, not the total spawned over the process lifetime.
pub const MAX_WORKERS: usize = 256;

/// Announcement value meaning "not in an epoch".
pub const NONE: i64 = -1;

pub type Hook = Box<dyn Fn() + Send + Sync>;

/// Global epoch state
pub struct EpochState {
    /// Current global epoch
    pub epoch: CachePadded<AtomicI64>,

    /// Write-timestamp clock for the snapshot layer
    pub stamp: CachePadded<AtomicU64>,

    /// Per-worker announced epochs; `NONE` when the worker is outside
    /// an epoch. Only worker `w` writes slot `w`.
    pub announcements: Vec<CachePadded<AtomicI64>>,

    /// Thunks run just before / just after an epoch increment
    pub before_hooks: Mutex<Vec<Hook>>,
    pub after_hooks: Mutex<Vec<Hook>>,

    next_worker: AtomicUsize,
    retired_workers: Mutex<Vec<usize>>,
}

impl EpochState {
    fn new() -> EpochState {
        let mut announcements = Vec::with_capacity(MAX_WORKERS);
        for _ in 0..MAX_WORKERS {
            announcements.push(CachePadded::new(AtomicI64::new(NONE)));
        }
        EpochState {
            epoch: CachePadded::new(AtomicI64::new(0)),
            // 0 is reserved as the stamp of initial versions
            stamp: CachePadded::new(AtomicU64::new(1)),
            announcements,
            before_hooks: Mutex::new(Vec::new()),
            after_hooks: Mutex::new(Vec::new()),
            next_worker: AtomicUsize::new(0),
            retired_workers: Mutex::new(Vec::new()),
        }
    }

    /// Hand out a worker slot, reusing one from an exited thread when
    /// possible.
    pub fn acquire_worker(&self) -> usize {
        if let Some(id) = self.retired_workers.lock().unwrap().pop() {
            return id;
        }
        let id = self.next_worker.fetch_add(1, Relaxed);
        if id >= MAX_WORKERS {
            eprintln!("keel: too many live worker threads (max {})", MAX_WORKERS);
            std::process::abort();
        }
        id
    }

    pub fn release_worker(&self, id: usize) {
        self.announcements[id].store(NONE, Relaxed);
        self.retired_workers.lock().unwrap().push(id);
    }

    /// Number of worker slots handed out so far; used to scale the
    /// epoch pacing heuristics.
    pub fn workers(&self) -> usize {
        self.next_worker.load(Relaxed).clamp(1, MAX_WORKERS)
    }
}

static STATE: AtomicUsize = AtomicUsize::new(0);

pub fn get() -> &'static EpochState {
    let mut addr = STATE.load(Relaxed);

    if addr == 0 {
        let raw = Box::into_raw(Box::new(EpochState::new()));

        addr = match STATE.compare_exchange(0, raw as usize, Relaxed, Relaxed) {
            Ok(_) => raw as usize,
            Err(winner) => {
                // lost the install race; free ours
                drop(unsafe { Box::from_raw(raw) });
                winner
            }
        };
    }

    unsafe { &*(addr as *mut EpochState) }
}
