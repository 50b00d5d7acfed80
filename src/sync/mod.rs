//! Synchronisation primitives

mod locker;

pub use locker::{BuildLockGuard, BuildLocks};
