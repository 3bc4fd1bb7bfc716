//! Compact Hash Page Table (§3, §4.1).
//!
//! One CHPT lives inside each shard and maps `vpid -> (ppid, ref_count,
//! dirty, busy, exist)`. The table is open-chained: a primary array of
//! `2 * max_ppid` buckets, each packing 8 page-table entries behind a shared
//! 58-bit tag, with overflow buckets borrowed from a fixed-size pool on tag
//! collision.
//!
//! `pin`/`unpin`/`lock`/`unlock` are lock-free: they CAS a single packed
//! 16-bit header per slot and never touch bucket allocation. Everything
//! else (`create_mapping`, `delete_mapping`, `release_mapping_lock`, bucket
//! chaining) is only ever called by the shard's single owning thread while
//! holding that slot's `busy` bit, so those paths use plain atomic stores
//! instead of CAS loops — nothing else can observe or mutate the slot while
//! busy is held.

use crate::types::{Ppid, Vpid};
use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, AtomicU8, Ordering};

pub const NUM_PACK_PAGES: u64 = 8;
const EMPTY_TAG: u64 = (1u64 << 58) - 1;
const EMPTY_PPID: u32 = u32::MAX;
const NO_NEXT: u32 = u32::MAX;
const MAX_RETRY: usize = 1 << 20;

/// Unpacked view of one page-table entry, returned from non-hot-path reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnpackedPte {
    pub exist: bool,
    pub busy: bool,
    pub dirty: bool,
    pub ref_count: u16,
    pub ppid: Ppid,
}

const EXIST_BIT: u16 = 1 << 0;
const BUSY_BIT: u16 = 1 << 1;
const DIRTY_BIT: u16 = 1 << 2;
const REF_SHIFT: u32 = 3;
const REF_MASK: u16 = 0x1FFF; // 13 bits, pre-shift

#[inline]
fn pack(exist: bool, busy: bool, dirty: bool, ref_count: u16) -> u16 {
    debug_assert!(ref_count <= REF_MASK);
    (exist as u16) | ((busy as u16) << 1) | ((dirty as u16) << 2) | (ref_count << REF_SHIFT)
}

#[inline]
fn unpack(packed: u16) -> (bool, bool, bool, u16) {
    (
        packed & EXIST_BIT != 0,
        packed & BUSY_BIT != 0,
        packed & DIRTY_BIT != 0,
        (packed >> REF_SHIFT) & REF_MASK,
    )
}

/// The packed 16-bit header for one slot: `exist | busy | dirty | ref_count(13)`.
///
/// This is the concurrency fulcrum of the whole cache (§9): every
/// cross-thread mutation of a slot's logical state happens through a CAS on
/// this one word.
#[derive(Default)]
pub struct PteHeader(AtomicU16);

impl PteHeader {
    /// Atomically increments the reference count if `exist && !busy`.
    /// Returns `(true, previous_ref_count)` on success, `(false, 0)` if the
    /// slot does not admit a pin right now.
    pub fn inc_ref_count(&self) -> (bool, u16) {
        let mut old = self.0.load(Ordering::Relaxed);
        loop {
            let (exist, busy, dirty, ref_count) = unpack(old);
            if !exist || busy {
                return (false, 0);
            }
            debug_assert!(ref_count < REF_MASK);
            let new = pack(exist, busy, dirty, ref_count + 1);
            match self
                .0
                .compare_exchange_weak(old, new, Ordering::Acquire, Ordering::Relaxed)
            {
                Ok(_) => return (true, ref_count),
                Err(actual) => old = actual,
            }
        }
    }

    /// Atomically decrements the reference count, ORing in `dirty` if
    /// `is_write`. Caller must hold a reference obtained from a prior
    /// successful `inc_ref_count`.
    pub fn dec_ref_count(&self, is_write: bool) -> u16 {
        let mut old = self.0.load(Ordering::Relaxed);
        loop {
            let (exist, busy, dirty, ref_count) = unpack(old);
            debug_assert!(exist && !busy && ref_count > 0);
            let new_dirty = dirty || is_write;
            let new = pack(exist, busy, new_dirty, ref_count.saturating_sub(1));
            match self
                .0
                .compare_exchange_weak(old, new, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return ref_count,
                Err(actual) => old = actual,
            }
        }
    }

    /// CAS-sets `busy` only when `ref_count == 0 && !busy`.
    pub fn try_lock(&self) -> bool {
        let mut old = self.0.load(Ordering::Acquire);
        loop {
            let (exist, busy, dirty, ref_count) = unpack(old);
            if ref_count != 0 || busy {
                return false;
            }
            let new = pack(exist, true, dirty, ref_count);
            match self
                .0
                .compare_exchange_weak(old, new, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return true,
                Err(actual) => old = actual,
            }
        }
    }

    /// Clears `busy`. Returns `false` if it was already clear.
    pub fn unlock(&self) -> bool {
        let mut old = self.0.load(Ordering::Acquire);
        loop {
            let (exist, busy, dirty, ref_count) = unpack(old);
            if !busy {
                return false;
            }
            let new = pack(exist, false, dirty, ref_count);
            match self
                .0
                .compare_exchange_weak(old, new, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return true,
                Err(actual) => old = actual,
            }
        }
    }

    /// Atomically installs a brand-new mapping: succeeds only from
    /// `!exist && !busy`, leaving the slot `busy` so the caller can finish
    /// populating the frame before `unlock`. Guards against a concurrent
    /// fast-path pin racing the owner thread's install (§4.2 Initing).
    pub fn try_create(&self, ref_count: u16) -> bool {
        let mut old = self.0.load(Ordering::Relaxed);
        loop {
            let (exist, busy, _, _) = unpack(old);
            if exist || busy {
                return false;
            }
            let new = pack(true, true, false, ref_count);
            match self
                .0
                .compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return true,
                Err(actual) => old = actual,
            }
        }
    }

    /// Atomically tears down a mapping: succeeds only from `exist &&
    /// !busy && ref_count == 0`, leaving the slot `busy` until `unlock`.
    /// Guards the same race as `try_create`, from the other direction.
    pub fn try_delete(&self) -> bool {
        let mut old = self.0.load(Ordering::Relaxed);
        loop {
            let (exist, busy, _, ref_count) = unpack(old);
            if !exist || busy || ref_count != 0 {
                return false;
            }
            let new = pack(false, true, false, 0);
            match self
                .0
                .compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return true,
                Err(actual) => old = actual,
            }
        }
    }

    fn load(&self, order: Ordering) -> (bool, bool, bool, u16) {
        unpack(self.0.load(order))
    }
}

/// One cacheline-ish bucket: 8 packed page-table entries sharing a tag,
/// plus the overflow-chain pointer and in-use counter.
///
/// Rust has no portable bitfield packing as tight as the original's
/// `pte_header : bits`, so this struct is wider than one cache line; the
/// logical layout and invariants (one CAS per header, plain fields mutated
/// only by the owning shard thread) are preserved exactly.
#[repr(align(64))]
pub struct Bucket {
    tag: AtomicU64,
    num_using: AtomicU8,
    headers: [PteHeader; NUM_PACK_PAGES as usize],
    ppage_ids: [AtomicU32; NUM_PACK_PAGES as usize],
    next: AtomicU32,
}

impl Bucket {
    fn empty() -> Self {
        Self {
            tag: AtomicU64::new(EMPTY_TAG),
            num_using: AtomicU8::new(0),
            headers: Default::default(),
            ppage_ids: std::array::from_fn(|_| AtomicU32::new(EMPTY_PPID)),
            next: AtomicU32::new(NO_NEXT),
        }
    }

    fn to_unpacked(&self, offset: usize) -> UnpackedPte {
        let (exist, busy, dirty, ref_count) = self.headers[offset].load(Ordering::Relaxed);
        UnpackedPte {
            exist,
            busy,
            dirty,
            ref_count,
            ppid: self.ppage_ids[offset].load(Ordering::Relaxed) as Ppid,
        }
    }

    fn is_empty_of_ptes(&self) -> bool {
        (0..NUM_PACK_PAGES as usize).all(|i| {
            let (exist, busy, dirty, ref_count) = self.headers[i].load(Ordering::Relaxed);
            !exist && !busy && !dirty && ref_count == 0 && self.ppage_ids[i].load(Ordering::Relaxed) == EMPTY_PPID
        })
    }
}

/// A stable handle to a located bucket, returned by [`Chpt::find_or_create_hint`]
/// so a caller can skip the chain walk on repeated access to the same tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BucketHint(u32);

pub struct Chpt {
    #[allow(dead_code)]
    max_vpid: Vpid,
    max_ppid: Ppid,
    bucket_size: u64,
    /// Arena: indices `0..bucket_size` are primary buckets (never freed),
    /// `bucket_size..bucket_size+max_ppid` is the overflow pool.
    store: Vec<Bucket>,
    pool_free: crossbeam::queue::SegQueue<u32>,
}

impl Chpt {
    pub fn new(max_vpid: Vpid, max_ppid: Ppid) -> Self {
        let bucket_size = max_ppid * 2;
        let total = bucket_size + max_ppid;
        let mut store = Vec::with_capacity(total as usize);
        store.resize_with(total as usize, Bucket::empty);

        let pool_free = crossbeam::queue::SegQueue::new();
        for i in bucket_size..total {
            pool_free.push(i as u32);
        }

        Self {
            max_vpid,
            max_ppid,
            bucket_size,
            store,
            pool_free,
        }
    }

    #[inline]
    fn tag_offset(vpid: Vpid) -> (u64, usize) {
        (vpid / NUM_PACK_PAGES, (vpid % NUM_PACK_PAGES) as usize)
    }

    #[inline]
    fn primary_index(&self, tag: u64) -> u32 {
        (tag % self.bucket_size) as u32
    }

    /// Lock-free pin: `(success, ppid, prev_ref_count)`. `prev_ref_count ==
    /// 0` signals the caller must remove `ppid` from the replacement
    /// structure (the page was revived from a zero-refcount state).
    pub fn pin(&self, vpid: Vpid, hint: Option<BucketHint>) -> (bool, Ppid, u16) {
        let (tag, offset) = Self::tag_offset(vpid);
        let idx = match hint {
            Some(h) => h.0,
            None => match self.find_bucket(tag, false) {
                Some(i) => i,
                None => return (false, 0, 0),
            },
        };
        let bucket = &self.store[idx as usize];
        let (ok, prev) = bucket.headers[offset].inc_ref_count();
        if !ok {
            return (false, 0, 0);
        }
        if bucket.tag.load(Ordering::Relaxed) != tag {
            // Bucket was recycled under us; undo and report miss.
            bucket.headers[offset].dec_ref_count(false);
            return (false, 0, 0);
        }
        (true, bucket.ppage_ids[offset].load(Ordering::Acquire) as Ppid, prev)
    }

    /// Lock-free unpin: returns the pre-decrement reference count.
    /// `prev_ref_count == 1` signals the caller must reinsert `ppid` into
    /// the replacement structure.
    pub fn unpin(&self, vpid: Vpid, is_write: bool, hint: Option<BucketHint>) -> u16 {
        let (tag, offset) = Self::tag_offset(vpid);
        let idx = hint.map(|h| h.0).unwrap_or_else(|| {
            self.find_bucket(tag, true)
                .expect("unpin of a vpid whose bucket should exist")
        });
        self.store[idx as usize].headers[offset].dec_ref_count(is_write)
    }

    pub fn try_lock(&self, vpid: Vpid, hint: Option<BucketHint>) -> bool {
        let (tag, offset) = Self::tag_offset(vpid);
        let idx = hint
            .map(|h| h.0)
            .or_else(|| self.find_bucket(tag, false))
            .expect("lock of a vpid whose bucket should exist");
        self.store[idx as usize].headers[offset].try_lock()
    }

    pub fn unlock(&self, vpid: Vpid, hint: Option<BucketHint>) {
        let (tag, offset) = Self::tag_offset(vpid);
        let idx = hint
            .map(|h| h.0)
            .or_else(|| self.find_bucket(tag, false))
            .expect("unlock of a vpid whose bucket should exist");
        self.store[idx as usize].headers[offset].unlock();
    }

    /// Owner-thread only: atomically installs `vpid -> ppid` from an empty
    /// slot, leaving it `busy` for the caller to populate and then
    /// `release_mapping_lock`. Returns `false` if the slot was not empty
    /// (a concurrent fast-path pin got there first, or it's already live).
    pub fn create_mapping(&self, vpid: Vpid, ppid: Ppid, ref_count: u16, hint: Option<BucketHint>) -> bool {
        let (tag, offset) = Self::tag_offset(vpid);
        let idx = hint
            .map(|h| h.0)
            .unwrap_or_else(|| self.find_or_create_hint_idx(tag));
        let bucket = &self.store[idx as usize];
        debug_assert_eq!(bucket.tag.load(Ordering::Relaxed), tag);
        if !bucket.headers[offset].try_create(ref_count) {
            return false;
        }
        // Publish ppid before the header CAS would be visible to readers
        // of a *successful* pin, but the header already carries `busy`, so
        // a plain store suffices here: no other thread may act on this
        // slot's ppid until `release_mapping_lock` clears `busy`.
        bucket.ppage_ids[offset].store(ppid as u32, Ordering::Release);
        bucket.num_using.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Owner-thread only: atomically tears down a mapping with
    /// `ref_count == 0`, leaving it `busy` until `release_mapping_lock`.
    /// Returns `false` if the slot no longer qualifies (pinned again, or
    /// already busy).
    pub fn delete_mapping(&self, vpid: Vpid, hint: Option<BucketHint>) -> bool {
        let (tag, offset) = Self::tag_offset(vpid);
        let idx = hint
            .map(|h| h.0)
            .unwrap_or_else(|| self.find_bucket(tag, true).expect("delete_mapping: bucket must exist"));
        let bucket = &self.store[idx as usize];
        if !bucket.headers[offset].try_delete() {
            return false;
        }
        bucket.ppage_ids[offset].store(EMPTY_PPID, Ordering::Relaxed);
        true
    }

    /// Owner-thread only: clears `busy`; if the slot is now empty the
    /// bucket's `num_using` drops, and an emptied overflow bucket returns to
    /// the pool.
    pub fn release_mapping_lock(&self, vpid: Vpid, hint: Option<BucketHint>) {
        let (tag, offset) = Self::tag_offset(vpid);
        let idx = hint
            .map(|h| h.0)
            .unwrap_or_else(|| self.find_bucket(tag, true).expect("release_mapping_lock: bucket must exist"));
        let bucket = &self.store[idx as usize];
        bucket.headers[offset].unlock();
        let (exist, ..) = bucket.headers[offset].load(Ordering::Relaxed);
        if !exist {
            let remaining = bucket.num_using.fetch_sub(1, Ordering::Relaxed) - 1;
            if remaining == 0 && idx as u64 >= self.bucket_size {
                self.return_to_pool(tag, idx);
            }
        }
    }

    pub fn get_pte(&self, vpid: Vpid, hint: Option<BucketHint>) -> UnpackedPte {
        let (tag, offset) = Self::tag_offset(vpid);
        match hint.map(|h| h.0).or_else(|| self.find_bucket(tag, false)) {
            Some(idx) => self.store[idx as usize].to_unpacked(offset),
            None => UnpackedPte {
                exist: false,
                busy: false,
                dirty: false,
                ref_count: 0,
                ppid: EMPTY_PPID as Ppid,
            },
        }
    }

    /// Finds the bucket for `vpid`, creating an overflow bucket and
    /// chaining it in if the tag is not yet present. Owner-thread only.
    pub fn find_or_create_hint(&self, vpid: Vpid) -> BucketHint {
        let (tag, _) = Self::tag_offset(vpid);
        BucketHint(self.find_or_create_hint_idx(tag))
    }

    /// Finds the bucket for `vpid` without creating one. Callable from any
    /// thread (used by the client-side fast path on a hint miss).
    pub fn find_hint(&self, vpid: Vpid) -> Option<BucketHint> {
        let (tag, _) = Self::tag_offset(vpid);
        self.find_bucket(tag, false).map(BucketHint)
    }

    fn find_or_create_hint_idx(&self, tag: u64) -> u32 {
        if let Some(idx) = self.find_bucket(tag, false) {
            return idx;
        }
        self.create_bucket(tag)
    }

    /// Walks the chain starting at the primary bucket for `tag`. Retries a
    /// bounded number of times with an acquire fence between attempts, per
    /// §4.1's "retried chain walk" note, when `should_exist` is set.
    fn find_bucket(&self, tag: u64, should_exist: bool) -> Option<u32> {
        for _ in 0..MAX_RETRY {
            let mut idx = self.primary_index(tag);
            loop {
                let bucket = &self.store[idx as usize];
                if bucket.tag.load(Ordering::Relaxed) == tag {
                    return Some(idx);
                }
                let next = bucket.next.load(Ordering::Acquire);
                if next == NO_NEXT {
                    break;
                }
                idx = next;
            }
            if !should_exist {
                return None;
            }
            std::sync::atomic::fence(Ordering::Acquire);
        }
        None
    }

    fn find_pre_bucket(&self, tag: u64, end: u32) -> Option<u32> {
        let mut idx = self.primary_index(tag);
        loop {
            let bucket = &self.store[idx as usize];
            let next = bucket.next.load(Ordering::Relaxed);
            if next == end {
                return Some(idx);
            }
            if next == NO_NEXT {
                return None;
            }
            idx = next;
        }
    }

    fn create_bucket(&self, tag: u64) -> u32 {
        let primary = self.primary_index(tag);
        if self.store[primary as usize].tag.load(Ordering::Relaxed) == EMPTY_TAG {
            self.store[primary as usize].tag.store(tag, Ordering::Relaxed);
            return primary;
        }
        // Walk to the tail, then borrow a bucket from the overflow pool.
        let mut tail = primary;
        loop {
            let next = self.store[tail as usize].next.load(Ordering::Relaxed);
            if next == NO_NEXT {
                break;
            }
            tail = next;
        }
        let new_idx = self
            .pool_free
            .pop()
            .expect("overflow pool exhausted: more distinct tags live than max_ppid");
        debug_assert!(self.store[new_idx as usize].is_empty_of_ptes());
        self.store[new_idx as usize].tag.store(tag, Ordering::Relaxed);
        // The new bucket must be fully initialized before it becomes
        // reachable from the chain (§3 overflow-chaining invariant).
        self.store[tail as usize].next.store(new_idx, Ordering::Release);
        new_idx
    }

    fn return_to_pool(&self, tag: u64, idx: u32) {
        let bucket = &self.store[idx as usize];
        debug_assert!(bucket.is_empty_of_ptes());
        if let Some(pre) = self.find_pre_bucket(tag, idx) {
            let next = bucket.next.load(Ordering::Relaxed);
            self.store[pre as usize].next.store(next, Ordering::Relaxed);
            bucket.next.store(NO_NEXT, Ordering::Relaxed);
            bucket.tag.store(EMPTY_TAG, Ordering::Release);
            self.pool_free.push(idx);
        }
        // Primary buckets (pre == None, idx == primary_index(tag)) are
        // never returned to the pool (§3).
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_pin_unpin_delete_roundtrip() {
        let chpt = Chpt::new(1024, 16);
        let hint = chpt.find_or_create_hint(3);
        assert!(chpt.create_mapping(3, 7, 1, Some(hint)));
        chpt.release_mapping_lock(3, Some(hint));

        let pte = chpt.get_pte(3, Some(hint));
        assert!(pte.exist);
        assert_eq!(pte.ref_count, 1);
        assert_eq!(pte.ppid, 7);

        let (ok, ppid, prev) = chpt.pin(3, Some(hint));
        assert!(ok);
        assert_eq!(ppid, 7);
        assert_eq!(prev, 1);

        assert_eq!(chpt.unpin(3, true, Some(hint)), 2);
        assert_eq!(chpt.unpin(3, false, Some(hint)), 1);

        let pte = chpt.get_pte(3, Some(hint));
        assert_eq!(pte.ref_count, 0);
        assert!(pte.dirty);

        assert!(chpt.delete_mapping(3, Some(hint)));
        chpt.release_mapping_lock(3, Some(hint));
        let pte = chpt.get_pte(3, Some(hint));
        assert!(!pte.exist);
    }

    #[test]
    fn pin_fails_when_not_exist() {
        let chpt = Chpt::new(1024, 16);
        let (ok, _, _) = chpt.pin(5, None);
        assert!(!ok);
    }

    #[test]
    fn pin_fails_while_busy() {
        let chpt = Chpt::new(1024, 16);
        let hint = chpt.find_or_create_hint(1);
        assert!(chpt.create_mapping(1, 0, 1, Some(hint)));
        // still busy: create_mapping leaves the lock held until release.
        let (ok, _, _) = chpt.pin(1, Some(hint));
        assert!(!ok);
        chpt.release_mapping_lock(1, Some(hint));
        let (ok, ..) = chpt.pin(1, Some(hint));
        assert!(ok);
    }

    #[test]
    fn create_mapping_fails_on_already_live_slot() {
        let chpt = Chpt::new(1024, 16);
        let hint = chpt.find_or_create_hint(1);
        assert!(chpt.create_mapping(1, 0, 1, Some(hint)));
        chpt.release_mapping_lock(1, Some(hint));
        assert!(!chpt.create_mapping(1, 0, 1, Some(hint)));
    }

    #[test]
    fn delete_mapping_fails_while_pinned() {
        let chpt = Chpt::new(1024, 16);
        let hint = chpt.find_or_create_hint(1);
        chpt.create_mapping(1, 0, 1, Some(hint));
        chpt.release_mapping_lock(1, Some(hint));
        assert!(!chpt.delete_mapping(1, Some(hint)));
        chpt.unpin(1, false, Some(hint));
        assert!(chpt.delete_mapping(1, Some(hint)));
    }

    #[test]
    fn overflow_chain_for_colliding_tags() {
        // bucket_size = 2*max_ppid = 8, so tags 0 and 8 collide on the
        // same primary bucket.
        let chpt = Chpt::new(1 << 20, 4);
        let hint_a = chpt.find_or_create_hint(0); // tag 0
        let hint_b = chpt.find_or_create_hint(64); // tag 8 -> same primary index
        assert_ne!(hint_a, hint_b);

        chpt.create_mapping(0, 1, 1, Some(hint_a));
        chpt.create_mapping(64, 2, 1, Some(hint_b));

        assert_eq!(chpt.get_pte(0, Some(hint_a)).ppid, 1);
        assert_eq!(chpt.get_pte(64, Some(hint_b)).ppid, 2);

        // find_hint (no creation) must locate the chained bucket too.
        assert_eq!(chpt.find_hint(64), Some(hint_b));
    }

    #[test]
    fn overflow_bucket_returns_to_pool_when_emptied() {
        let chpt = Chpt::new(1 << 20, 4);
        let hint = chpt.find_or_create_hint(64); // forces an overflow bucket
        chpt.create_mapping(64, 1, 1, Some(hint));
        chpt.release_mapping_lock(64, Some(hint));

        chpt.delete_mapping(64, Some(hint));
        chpt.release_mapping_lock(64, Some(hint));

        // Bucket went back to the pool; a fresh tag can reuse it.
        let hint2 = chpt.find_or_create_hint(72);
        assert_eq!(hint2, hint);
    }
}
