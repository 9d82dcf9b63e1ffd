//! Concurrent maps built on the substrate.
//!
//! Each map doubles as a reference client for one slice of the
//! primitives: [`list::ListMap`] exercises the inline try-lock,
//! `wait_lock`, and optimistic pointer reads; [`snaplist::SnapList`]
//! exercises versioned pointers and snapshots; [`hash::HashMap`]
//! exercises the address-hashed lock table.

pub mod hash;
pub mod list;
pub mod snaplist;
