//! Keel is a substrate for writing fine-grained concurrent maps: ordered
//! lists, hash tables, and trees that mix lock-free readers with small
//! locked write sections.
//!
//! The crate provides four cooperating layers:
//!
//! - **Epoch-based reclamation** (`mem::epoch`): readers announce the
//!   current epoch before traversing shared nodes; writers retire
//!   displaced nodes to a typed [`Pool`](mem::epoch::pool::Pool), which
//!   frees them once no announced reader can still observe them.
//!
//! - **Try-locks** (`mem::lock`): an 8-byte inline lock with
//!   `try_lock`/`wait_lock`, and a process-wide address-hashed lock
//!   table for objects that cannot afford a lock word.
//!
//! - **Versioned fields** (`mem::field`, `mem::snapshot`): word-sized
//!   fields readers can load optimistically and re-validate, including
//!   a version-chain pointer that supports consistent multi-point reads
//!   anchored at a timestamp (`with_snapshot`).
//!
//! - **Client glue** (`mem::epoch`): `with_epoch`, `with_snapshot`, and
//!   the `try_loop` retry/backoff primitive that every writer uses to
//!   recover from contention.
//!
//! `sync` contains three maps built on the substrate — an ordered
//! linked-list map, a snapshot-capable variant, and a fixed-size hash
//! map — which double as reference clients for the primitives.

pub mod mem;
pub mod sync;

pub use mem::epoch::{try_loop, try_loop_with, with_epoch, with_snapshot};
