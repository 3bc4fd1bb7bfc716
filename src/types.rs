//! Core identifier types and page-size constants shared across every tier.
//!
//! Mirrors `type.hpp` in the reference implementation: a handful of type
//! aliases and compile-time constants that the rest of the crate builds on.

/// Index into the global virtual address space, one unit per [`PAGE_SIZE`] bytes.
pub type Vpid = u64;

/// Index into a shard's local frame pool.
pub type Ppid = u64;

/// Index of one page-sized unit on a shard's backing storage.
pub type BlockId = u64;

/// Cache line size assumed by the mailbox and CHPT bucket layouts.
pub const CACHELINE_SIZE: usize = 64;

/// Page size in bytes. Compile-time constant, matching the original's
/// `CACHE_PAGE_BITS` default of 12.
pub const PAGE_SIZE: usize = 4096;

/// `log2(PAGE_SIZE)`.
pub const PAGE_BITS: u32 = PAGE_SIZE.trailing_zeros();

/// Sentinel `Ppid` meaning "no frame" (full_pin / out-of-memory signal).
pub const EMPTY_PPID: Ppid = u64::MAX;

/// Sentinel `Vpid` meaning "slot holds no page".
pub const EMPTY_VPID: Vpid = u64::MAX;

/// Round `n` up to the page size.
#[inline]
pub const fn round_up_to_page(n: usize) -> usize {
    (n + PAGE_SIZE - 1) / PAGE_SIZE * PAGE_SIZE
}

/// Smallest power of two that is `>= n`, capped at `cap`.
#[inline]
pub fn next_power_of_two_capped(n: u64, cap: u64) -> u64 {
    n.max(1).next_power_of_two().min(cap)
}
