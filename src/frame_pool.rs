//! Frame pool: one shard's physical page backing store (§4.8, §4.10).
//!
//! A single page-aligned allocation of `num_pages * PAGE_SIZE` bytes,
//! indexed by [`Ppid`]. `first_loaded` tracks, per frame, whether the
//! replacement engine has ever issued a load into it — on the very first
//! install of a fresh mapping there is nothing to read back from the
//! backend, so the load step can be skipped (§4.2 Initing phase).

use crate::types::{Ppid, PAGE_SIZE};
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};

/// Owns the raw memory frames a shard's CHPT entries point into.
///
/// Frames are handed out as raw pointers because the I/O backend (§4.7)
/// needs a stable address to DMA into; callers are responsible for the
/// same single-writer-while-busy discipline the CHPT header enforces.
pub struct FramePool {
    base: NonNull<u8>,
    layout: Layout,
    num_pages: u64,
    first_loaded: Vec<AtomicBool>,
}

// SAFETY: `base` is only ever dereferenced through `frame_ptr`, which hands
// out disjoint, caller-synchronized regions; the pool itself holds no
// interior aliasing beyond `first_loaded`, which is properly atomic.
unsafe impl Send for FramePool {}
unsafe impl Sync for FramePool {}

impl FramePool {
    pub fn new(num_pages: u64) -> Self {
        let size = num_pages as usize * PAGE_SIZE;
        let layout = Layout::from_size_align(size.max(1), PAGE_SIZE).expect("frame pool layout");
        let base = unsafe { alloc_zeroed(layout) };
        let base = NonNull::new(base).expect("frame pool allocation failed");
        let first_loaded = (0..num_pages).map(|_| AtomicBool::new(false)).collect();
        Self {
            base,
            layout,
            num_pages,
            first_loaded,
        }
    }

    pub fn num_pages(&self) -> u64 {
        self.num_pages
    }

    /// Raw pointer to the start of frame `ppid`'s page. Valid for
    /// `PAGE_SIZE` bytes for the lifetime of the pool.
    pub fn frame_ptr(&self, ppid: Ppid) -> *mut u8 {
        debug_assert!(ppid < self.num_pages);
        unsafe { self.base.as_ptr().add(ppid as usize * PAGE_SIZE) }
    }

    /// Byte slice view of frame `ppid`. Caller must ensure no concurrent
    /// mutable access (enforced upstream by the CHPT busy bit / ref count).
    ///
    /// # Safety
    /// The caller must hold a pin or the busy bit on `ppid` for the
    /// duration the returned slice is used.
    pub unsafe fn frame_slice(&self, ppid: Ppid) -> &[u8] {
        std::slice::from_raw_parts(self.frame_ptr(ppid), PAGE_SIZE)
    }

    /// # Safety
    /// The caller must hold exclusive access to `ppid` (busy bit, or a
    /// single writer pin) for the duration the returned slice is used.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn frame_slice_mut(&self, ppid: Ppid) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.frame_ptr(ppid), PAGE_SIZE)
    }

    /// Returns whether this frame had already been loaded before this call,
    /// and marks it loaded. First call after construction or after a
    /// mapping is deleted (via [`Self::reset_loaded`]) returns `false`.
    pub fn mark_loaded(&self, ppid: Ppid) -> bool {
        self.first_loaded[ppid as usize].swap(true, Ordering::AcqRel)
    }

    pub fn reset_loaded(&self, ppid: Ppid) {
        self.first_loaded[ppid as usize].store(false, Ordering::Release);
    }
}

impl Drop for FramePool {
    fn drop(&mut self) {
        unsafe { dealloc(self.base.as_ptr(), self.layout) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_are_page_aligned_and_disjoint() {
        let pool = FramePool::new(8);
        for i in 0..8u64 {
            assert_eq!(pool.frame_ptr(i) as usize % PAGE_SIZE, 0);
        }
        let a = pool.frame_ptr(0) as usize;
        let b = pool.frame_ptr(1) as usize;
        assert_eq!(b - a, PAGE_SIZE);
    }

    #[test]
    fn mark_loaded_is_first_write_once() {
        let pool = FramePool::new(2);
        assert!(!pool.mark_loaded(0));
        assert!(pool.mark_loaded(0));
        pool.reset_loaded(0);
        assert!(!pool.mark_loaded(0));
    }

    #[test]
    fn write_then_read_round_trips() {
        let pool = FramePool::new(1);
        unsafe {
            pool.frame_slice_mut(0)[0..4].copy_from_slice(&[1, 2, 3, 4]);
            assert_eq!(&pool.frame_slice(0)[0..4], &[1, 2, 3, 4]);
        }
    }
}
