//! Per-tier access/miss counters (ambient; `stats` feature, §2.1).
//!
//! Grounded on `original_source/include/access_counter.hpp`'s
//! `AccessCounter`: RAII guards count an access and, separately, a miss,
//! each with the cycles spent inside the guard's scope. With the `stats`
//! feature off every method here compiles to nothing, same as the
//! original's `#else` branch.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Cumulative counts for one cache tier (direct, private, or shared).
#[derive(Default)]
pub struct AccessCounter {
    num_access: AtomicU64,
    num_miss: AtomicU64,
    cycles_access: AtomicU64,
    cycles_miss: AtomicU64,
}

impl AccessCounter {
    pub const fn new() -> Self {
        Self {
            num_access: AtomicU64::new(0),
            num_miss: AtomicU64::new(0),
            cycles_access: AtomicU64::new(0),
            cycles_miss: AtomicU64::new(0),
        }
    }

    pub fn num_access(&self) -> u64 {
        self.num_access.load(Ordering::Relaxed)
    }

    pub fn num_miss(&self) -> u64 {
        self.num_miss.load(Ordering::Relaxed)
    }

    pub fn cycles_access(&self) -> u64 {
        self.cycles_access.load(Ordering::Relaxed)
    }

    pub fn cycles_miss(&self) -> u64 {
        self.cycles_miss.load(Ordering::Relaxed)
    }

    /// A plain, serializable copy of the current counts, for handing to the
    /// external instrumentation layer (§1) without exposing the atomics
    /// themselves.
    pub fn snapshot(&self) -> AccessSnapshot {
        AccessSnapshot {
            num_access: self.num_access(),
            num_miss: self.num_miss(),
            cycles_access: self.cycles_access(),
            cycles_miss: self.cycles_miss(),
        }
    }

    /// Merges `self`'s counts into `global` and resets `self`, mirroring
    /// the original's thread-local-to-global `flush`.
    pub fn flush_into(&self, global: &AccessCounter) {
        global.num_access.fetch_add(self.num_access.swap(0, Ordering::Relaxed), Ordering::Relaxed);
        global.num_miss.fetch_add(self.num_miss.swap(0, Ordering::Relaxed), Ordering::Relaxed);
        global
            .cycles_access
            .fetch_add(self.cycles_access.swap(0, Ordering::Relaxed), Ordering::Relaxed);
        global
            .cycles_miss
            .fetch_add(self.cycles_miss.swap(0, Ordering::Relaxed), Ordering::Relaxed);
    }

    /// Adds `other`'s current counts into `self` without resetting `other`,
    /// for read-only snapshots that sum several counters together.
    pub fn add(&self, other: &AccessCounter) {
        self.num_access.fetch_add(other.num_access(), Ordering::Relaxed);
        self.num_miss.fetch_add(other.num_miss(), Ordering::Relaxed);
        self.cycles_access.fetch_add(other.cycles_access(), Ordering::Relaxed);
        self.cycles_miss.fetch_add(other.cycles_miss(), Ordering::Relaxed);
    }

    #[cfg(feature = "stats")]
    pub fn guard_access(&self) -> AccessGuard<'_> {
        AccessGuard {
            counter: self,
            start: std::time::Instant::now(),
        }
    }

    #[cfg(not(feature = "stats"))]
    #[inline(always)]
    pub fn guard_access(&self) -> AccessGuard<'_> {
        AccessGuard
    }

    #[cfg(feature = "stats")]
    pub fn guard_miss(&self) -> MissGuard<'_> {
        MissGuard {
            counter: self,
            start: std::time::Instant::now(),
        }
    }

    #[cfg(not(feature = "stats"))]
    #[inline(always)]
    pub fn guard_miss(&self) -> MissGuard<'_> {
        MissGuard
    }
}

/// Plain-old-data mirror of [`AccessCounter`], grounded on the teacher's
/// `cache_statistics.rs::CacheMetrics`: a `Serialize`/`Deserialize` struct
/// external tooling can log or ship over the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessSnapshot {
    pub num_access: u64,
    pub num_miss: u64,
    pub cycles_access: u64,
    pub cycles_miss: u64,
}

#[cfg(feature = "stats")]
pub struct AccessGuard<'a> {
    counter: &'a AccessCounter,
    start: std::time::Instant,
}

#[cfg(feature = "stats")]
impl Drop for AccessGuard<'_> {
    fn drop(&mut self) {
        self.counter.num_access.fetch_add(1, Ordering::Relaxed);
        self.counter
            .cycles_access
            .fetch_add(self.start.elapsed().as_nanos() as u64, Ordering::Relaxed);
    }
}

#[cfg(not(feature = "stats"))]
pub struct AccessGuard;

#[cfg(feature = "stats")]
pub struct MissGuard<'a> {
    counter: &'a AccessCounter,
    start: std::time::Instant,
}

#[cfg(feature = "stats")]
impl Drop for MissGuard<'_> {
    fn drop(&mut self) {
        self.counter.num_miss.fetch_add(1, Ordering::Relaxed);
        self.counter
            .cycles_miss
            .fetch_add(self.start.elapsed().as_nanos() as u64, Ordering::Relaxed);
    }
}

#[cfg(not(feature = "stats"))]
pub struct MissGuard;
